//! In-process document store used by tests and local runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{
    DocumentStore, FieldUpdate, GuardedUpdate, RecordSelector, StoreError, UpdateOutcome,
    FIELD_ID, FIELD_PIPELINE_ID, FIELD_STEPS, FIELD_STEP_NAME, FIELD_UPDATED_AT,
};

type Collection = BTreeMap<String, Value>;

/// Document store holding JSON documents in memory.
///
/// Every operation runs under one lock, so a guarded update evaluates its
/// filter and writes in a single critical section.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: Mutex<HashMap<&'static str, Collection>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_collections<T>(
        &self,
        f: impl FnOnce(&mut HashMap<&'static str, Collection>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self
            .collections
            .lock()
            .map_err(|_| StoreError::Driver("in-memory store lock poisoned".to_string()))?;
        f(&mut guard)
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &'static str) -> usize {
        self.collections
            .lock()
            .map(|c| c.get(collection).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }
}

fn str_field<'a>(doc: &'a Value, field: &str) -> Option<&'a str> {
    doc.get(field).and_then(Value::as_str)
}

fn apply_set(target: &mut Value, set: &[FieldUpdate]) -> Result<(), StoreError> {
    let object = target
        .as_object_mut()
        .ok_or_else(|| StoreError::InvalidUpdate("update target is not an object".to_string()))?;
    for update in set {
        object.insert(update.path.to_string(), update.value.clone());
    }
    Ok(())
}

fn touch(doc: &mut Value, at: DateTime<Utc>) -> Result<(), StoreError> {
    apply_set(doc, &[FieldUpdate::timestamp(FIELD_UPDATED_AT, at)])
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert(
        &self,
        collection: &'static str,
        id: &str,
        document: Value,
    ) -> Result<(), StoreError> {
        self.with_collections(|collections| {
            let docs = collections.entry(collection).or_default();
            if docs.contains_key(id) {
                return Err(StoreError::Conflict {
                    collection,
                    id: id.to_string(),
                });
            }
            docs.insert(id.to_string(), document);
            Ok(())
        })
    }

    async fn find_by_id(
        &self,
        collection: &'static str,
        id: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.with_collections(|collections| {
            Ok(collections
                .get(collection)
                .and_then(|docs| docs.get(id))
                .cloned())
        })
    }

    async fn find_one_by(
        &self,
        collection: &'static str,
        field: &'static str,
        value: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.with_collections(|collections| {
            Ok(collections.get(collection).and_then(|docs| {
                docs.values()
                    .find(|doc| str_field(doc, field) == Some(value))
                    .cloned()
            }))
        })
    }

    async fn update_by_id(
        &self,
        collection: &'static str,
        id: &str,
        set: &[FieldUpdate],
        touched_at: DateTime<Utc>,
    ) -> Result<UpdateOutcome, StoreError> {
        self.with_collections(|collections| {
            let Some(doc) = collections.get_mut(collection).and_then(|d| d.get_mut(id)) else {
                return Ok(UpdateOutcome::Skipped);
            };
            apply_set(doc, set)?;
            touch(doc, touched_at)?;
            Ok(UpdateOutcome::Applied)
        })
    }

    async fn update_one_guarded(&self, update: &GuardedUpdate) -> Result<UpdateOutcome, StoreError> {
        let collection = update.selector.collection();
        self.with_collections(|collections| {
            let Some(docs) = collections.get_mut(collection) else {
                return Ok(UpdateOutcome::Skipped);
            };
            match &update.selector {
                RecordSelector::Manifest { pipeline_id } => {
                    let target = docs.values_mut().find(|doc| {
                        str_field(doc, FIELD_PIPELINE_ID) == Some(pipeline_id.as_str())
                            && update.guard.admits(doc)
                    });
                    let Some(doc) = target else {
                        return Ok(UpdateOutcome::Skipped);
                    };
                    apply_set(doc, &update.set)?;
                    touch(doc, update.touched_at)?;
                    Ok(UpdateOutcome::Applied)
                }
                RecordSelector::ManifestStep {
                    pipeline_id,
                    task_name,
                } => {
                    // $elemMatch semantics: one step must satisfy name and guard.
                    for doc in docs.values_mut() {
                        if str_field(doc, FIELD_PIPELINE_ID) != Some(pipeline_id.as_str()) {
                            continue;
                        }
                        let step_index = doc
                            .get(FIELD_STEPS)
                            .and_then(Value::as_array)
                            .and_then(|steps| {
                                steps.iter().position(|step| {
                                    str_field(step, FIELD_STEP_NAME) == Some(task_name.as_str())
                                        && update.guard.admits(step)
                                })
                            });
                        let Some(index) = step_index else {
                            return Ok(UpdateOutcome::Skipped);
                        };
                        if let Some(step) = doc
                            .get_mut(FIELD_STEPS)
                            .and_then(Value::as_array_mut)
                            .and_then(|steps| steps.get_mut(index))
                        {
                            apply_set(step, &update.set)?;
                        }
                        touch(doc, update.touched_at)?;
                        return Ok(UpdateOutcome::Applied);
                    }
                    Ok(UpdateOutcome::Skipped)
                }
                RecordSelector::Job { job_id } => {
                    let Some(doc) = docs.get_mut(job_id.as_str()) else {
                        return Ok(UpdateOutcome::Skipped);
                    };
                    if str_field(doc, FIELD_ID) != Some(job_id.as_str()) || !update.guard.admits(doc)
                    {
                        return Ok(UpdateOutcome::Skipped);
                    }
                    apply_set(doc, &update.set)?;
                    touch(doc, update.touched_at)?;
                    Ok(UpdateOutcome::Applied)
                }
            }
        })
    }
}
