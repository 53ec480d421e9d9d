//! Typed record access over a [DocumentStore].

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use super::models::{Application, ApplicationId, Document, Job, JobId, Manifest, ManifestId};
use super::{DocumentStore, FieldUpdate, StoreError, UpdateOutcome, FIELD_PIPELINE_ID};

fn decode<T: Document>(value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value)
        .map_err(|e| StoreError::Decode(format!("{}: {e}", T::COLLECTION)))
}

/// Typed view over the document store. Soft-deleted records read as absent.
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn DocumentStore>,
}

impl Repository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub async fn insert<T: Document>(&self, record: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(record)
            .map_err(|e| StoreError::Decode(format!("{}: {e}", T::COLLECTION)))?;
        self.store.insert(T::COLLECTION, record.key(), value).await
    }

    async fn get<T: Document>(&self, id: &str) -> Result<Option<T>, StoreError> {
        match self.store.find_by_id(T::COLLECTION, id).await? {
            Some(value) => {
                let record = decode::<T>(value)?;
                Ok((!record.is_deleted()).then_some(record))
            }
            None => Ok(None),
        }
    }

    pub async fn application(&self, id: &ApplicationId) -> Result<Option<Application>, StoreError> {
        self.get(id.as_str()).await
    }

    pub async fn manifest(&self, id: &ManifestId) -> Result<Option<Manifest>, StoreError> {
        self.get(id.as_str()).await
    }

    pub async fn job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        self.get(id.as_str()).await
    }

    /// Resolves a manifest by its pipeline-run correlation id.
    pub async fn manifest_by_pipeline(
        &self,
        pipeline_id: &str,
    ) -> Result<Option<Manifest>, StoreError> {
        match self
            .store
            .find_one_by(Manifest::COLLECTION, FIELD_PIPELINE_ID, pipeline_id)
            .await?
        {
            Some(value) => {
                let manifest = decode::<Manifest>(value)?;
                Ok((!manifest.is_deleted()).then_some(manifest))
            }
            None => Ok(None),
        }
    }

    /// Plain `$set` on a record root; never used for status fields.
    pub async fn set_fields<T: Document>(
        &self,
        id: &str,
        set: &[FieldUpdate],
    ) -> Result<UpdateOutcome, StoreError> {
        self.store
            .update_by_id(T::COLLECTION, id, set, Utc::now())
            .await
    }
}
