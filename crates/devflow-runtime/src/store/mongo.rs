//! MongoDB-backed document store.
//!
//! This module is feature-gated behind `mongodb`. Guarded updates map onto a
//! single `updateOne` whose filter carries the guard, which MongoDB applies
//! atomically per document.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{self, doc, Bson, Document as BsonDocument};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use serde_json::Value;
use tokio::sync::OnceCell;

use super::models::{Document, Manifest};
use super::{
    map_driver_err, DocumentStore, FieldUpdate, Guard, GuardedUpdate, RecordSelector, StoreError,
    UpdateOutcome, FIELD_ID, FIELD_PIPELINE_ID, FIELD_STATUS, FIELD_STEPS, FIELD_STEP_NAME,
    FIELD_TASK_RUN, FIELD_UPDATED_AT,
};

const DUPLICATE_KEY_CODE: i32 = 11000;

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY_CODE
    )
}

fn to_bson_document(value: &Value) -> Result<BsonDocument, StoreError> {
    bson::to_document(value).map_err(|e| StoreError::Decode(format!("encode document: {e}")))
}

fn to_json(document: BsonDocument) -> Value {
    Bson::Document(document).into_relaxed_extjson()
}

fn guard_filter(guard: &Guard) -> BsonDocument {
    match guard {
        Guard::StatusNotIn(terminal) => doc! { FIELD_STATUS: { "$nin": terminal.clone() } },
        Guard::UnboundOr(task_run) => doc! {
            "$or": [
                { FIELD_TASK_RUN: Bson::Null },
                { FIELD_TASK_RUN: "" },
                { FIELD_TASK_RUN: task_run.as_str() },
            ]
        },
        // `null` also matches a missing field.
        Guard::Unset(field) => {
            let mut filter = BsonDocument::new();
            filter.insert(*field, Bson::Null);
            filter
        }
    }
}

fn set_document(
    prefix: Option<&str>,
    set: &[FieldUpdate],
    touched_at: DateTime<Utc>,
) -> Result<BsonDocument, StoreError> {
    let mut out = BsonDocument::new();
    for update in set {
        let key = match prefix {
            Some(prefix) => format!("{prefix}.{}", update.path),
            None => update.path.to_string(),
        };
        let value = bson::to_bson(&update.value)
            .map_err(|e| StoreError::Decode(format!("encode field {}: {e}", update.path)))?;
        out.insert(key, value);
    }
    let touched = FieldUpdate::timestamp(FIELD_UPDATED_AT, touched_at);
    out.insert(
        FIELD_UPDATED_AT,
        bson::to_bson(&touched.value).map_err(|e| StoreError::Decode(e.to_string()))?,
    );
    Ok(out)
}

/// Builds the `(filter, $set)` pair for a guarded update.
fn guarded_update_parts(
    update: &GuardedUpdate,
) -> Result<(BsonDocument, BsonDocument), StoreError> {
    match &update.selector {
        RecordSelector::Manifest { pipeline_id } => {
            let mut filter = doc! { FIELD_PIPELINE_ID: pipeline_id.as_str() };
            for (key, value) in guard_filter(&update.guard) {
                filter.insert(key, value);
            }
            Ok((filter, set_document(None, &update.set, update.touched_at)?))
        }
        RecordSelector::ManifestStep {
            pipeline_id,
            task_name,
        } => {
            let mut element = doc! { FIELD_STEP_NAME: task_name.as_str() };
            for (key, value) in guard_filter(&update.guard) {
                element.insert(key, value);
            }
            let filter = doc! {
                FIELD_PIPELINE_ID: pipeline_id.as_str(),
                FIELD_STEPS: { "$elemMatch": element },
            };
            let prefix = format!("{FIELD_STEPS}.$");
            Ok((
                filter,
                set_document(Some(&prefix), &update.set, update.touched_at)?,
            ))
        }
        RecordSelector::Job { job_id } => {
            let mut filter = doc! { FIELD_ID: job_id.as_str() };
            for (key, value) in guard_filter(&update.guard) {
                filter.insert(key, value);
            }
            Ok((filter, set_document(None, &update.set, update.touched_at)?))
        }
    }
}

#[derive(Clone)]
pub struct MongoDocumentStore {
    database: Database,
    indexes_ready: std::sync::Arc<OnceCell<()>>,
}

impl MongoDocumentStore {
    /// Connects and pings the server once.
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| map_driver_err("mongo connect", e))?;
        let database = client.database(db_name);
        database
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| map_driver_err("mongo ping", e))?;
        tracing::info!(db = db_name, "mongo connected");
        Ok(Self::with_database(database))
    }

    pub fn with_database(database: Database) -> Self {
        Self {
            database,
            indexes_ready: std::sync::Arc::new(OnceCell::new()),
        }
    }

    fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.database.collection::<BsonDocument>(name)
    }

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        self.indexes_ready
            .get_or_try_init(|| async {
                let model = IndexModel::builder()
                    .keys(doc! { FIELD_PIPELINE_ID: 1 })
                    .options(
                        IndexOptions::builder()
                            .name(Some("idx_manifests_pipeline_id".to_string()))
                            .build(),
                    )
                    .build();
                self.collection(Manifest::COLLECTION)
                    .create_index(model, None)
                    .await
                    .map_err(|e| map_driver_err("create manifest pipeline index", e))?;
                Ok::<(), StoreError>(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn insert(
        &self,
        collection: &'static str,
        id: &str,
        document: Value,
    ) -> Result<(), StoreError> {
        self.ensure_indexes().await?;
        let mut document = to_bson_document(&document)?;
        document.insert(FIELD_ID, id);
        match self.collection(collection).insert_one(document, None).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(StoreError::Conflict {
                collection,
                id: id.to_string(),
            }),
            Err(e) => Err(map_driver_err("mongo insertOne", e)),
        }
    }

    async fn find_by_id(
        &self,
        collection: &'static str,
        id: &str,
    ) -> Result<Option<Value>, StoreError> {
        let found = self
            .collection(collection)
            .find_one(doc! { FIELD_ID: id }, None)
            .await
            .map_err(|e| map_driver_err("mongo findOne by id", e))?;
        Ok(found.map(to_json))
    }

    async fn find_one_by(
        &self,
        collection: &'static str,
        field: &'static str,
        value: &str,
    ) -> Result<Option<Value>, StoreError> {
        let found = self
            .collection(collection)
            .find_one(doc! { field: value }, None)
            .await
            .map_err(|e| map_driver_err("mongo findOne", e))?;
        Ok(found.map(to_json))
    }

    async fn update_by_id(
        &self,
        collection: &'static str,
        id: &str,
        set: &[FieldUpdate],
        touched_at: DateTime<Utc>,
    ) -> Result<UpdateOutcome, StoreError> {
        let set = set_document(None, set, touched_at)?;
        let result = self
            .collection(collection)
            .update_one(doc! { FIELD_ID: id }, doc! { "$set": set }, None)
            .await
            .map_err(|e| map_driver_err("mongo updateOne by id", e))?;
        Ok(if result.matched_count == 0 {
            UpdateOutcome::Skipped
        } else {
            UpdateOutcome::Applied
        })
    }

    async fn update_one_guarded(&self, update: &GuardedUpdate) -> Result<UpdateOutcome, StoreError> {
        let (filter, set) = guarded_update_parts(update)?;
        let collection = update.selector.collection();
        let result = self
            .collection(collection)
            .update_one(filter.clone(), doc! { "$set": set }, None)
            .await
            .map_err(|e| {
                tracing::error!(collection, filter = %filter, error = %e, "mongo updateOne failed");
                map_driver_err("mongo guarded updateOne", e)
            })?;
        if result.matched_count == 0 {
            tracing::debug!(collection, filter = %filter, "guarded update matched 0 documents");
            return Ok(UpdateOutcome::Skipped);
        }
        Ok(UpdateOutcome::Applied)
    }
}
