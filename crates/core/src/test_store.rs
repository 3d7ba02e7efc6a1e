//! In-memory [`RecordStore`] double for engine tests.
//!
//! Records every call in order so tests can assert on creation sequencing,
//! and lets individual uuids be configured to fail with a server rejection.

use crate::client::RecordStore;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
pub(crate) struct MemoryStore {
    /// Canned fetch responses keyed by exact URL.
    responses: Mutex<BTreeMap<String, Value>>,
    /// Entities created through `create`, keyed by `collection_url/uuid`.
    entities: Mutex<BTreeMap<String, Value>>,
    /// Uuids in the order they were created.
    created: Mutex<Vec<String>>,
    /// Every fetch/create call, in order.
    calls: Mutex<Vec<String>>,
    properties: Mutex<BTreeMap<String, String>>,
    /// Rejections to apply to specific uuids on create.
    rejections: Mutex<BTreeMap<String, (u16, String)>>,
    fail_fetches: Mutex<bool>,
    pinned_property_readback: Mutex<Option<String>>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_response(self, url: &str, value: Value) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), value);
        self
    }

    pub(crate) fn reject_uuid(&self, uuid: &str, status: u16, detail: &str) {
        self.rejections
            .lock()
            .unwrap()
            .insert(uuid.to_string(), (status, detail.to_string()));
    }

    pub(crate) fn fail_fetches_with_authentication(&self) {
        *self.fail_fetches.lock().unwrap() = true;
    }

    /// Force every property read-back to report this value, regardless of
    /// what was set.
    pub(crate) fn pin_property_readback(&self, value: &str) {
        *self.pinned_property_readback.lock().unwrap() = Some(value.to_string());
    }

    pub(crate) fn created_uuids(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn property(&self, url: &str) -> Option<String> {
        self.properties.lock().unwrap().get(url).cloned()
    }

    /// The entity body that was posted for `uuid`, as the server stored it.
    pub(crate) fn posted_entity(&self, collection_url: &str, uuid: &str) -> Option<Value> {
        self.entities
            .lock()
            .unwrap()
            .get(&format!("{collection_url}/{uuid}"))
            .cloned()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn fetch(&self, url: &str) -> SyncResult<Value> {
        self.calls.lock().unwrap().push(format!("GET {url}"));
        if *self.fail_fetches.lock().unwrap() {
            return Err(SyncError::Authentication(url.to_string()));
        }
        if let Some(canned) = self.responses.lock().unwrap().get(url) {
            return Ok(canned.clone());
        }
        if let Some(entity) = self.entities.lock().unwrap().get(url) {
            return Ok(entity.clone());
        }
        Err(SyncError::NotFound(url.to_string()))
    }

    async fn create(&self, collection_url: &str, entity: &Value) -> SyncResult<()> {
        let uuid = entity
            .get("uuid")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        self.calls
            .lock()
            .unwrap()
            .push(format!("POST {collection_url} {uuid}"));
        if let Some((status, detail)) = self.rejections.lock().unwrap().get(&uuid) {
            return Err(SyncError::Rejected {
                status: *status,
                detail: detail.clone(),
            });
        }
        self.entities
            .lock()
            .unwrap()
            .insert(format!("{collection_url}/{uuid}"), entity.clone());
        self.created.lock().unwrap().push(uuid);
        Ok(())
    }

    async fn get_system_property(&self, url: &str) -> SyncResult<Value> {
        if let Some(pinned) = self.pinned_property_readback.lock().unwrap().as_ref() {
            return Ok(json!({ "value": pinned }));
        }
        let value = self
            .properties
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(url.to_string()))?;
        Ok(json!({ "value": value }))
    }

    async fn set_system_property(&self, url: &str, value: &str) -> SyncResult<()> {
        self.properties
            .lock()
            .unwrap()
            .insert(url.to_string(), value.to_string());
        Ok(())
    }
}
