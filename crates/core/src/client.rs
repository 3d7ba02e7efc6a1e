//! Authenticated HTTP client for the EMR REST API.
//!
//! The [`RecordStore`] trait is the seam between the engines and the wire:
//! the engines only ever fetch, conditionally create, and toggle system
//! properties. [`RecordClient`] is the production implementation over
//! `reqwest` with Basic Authentication; tests substitute an in-memory store.
//!
//! Conditional create is the idempotency guarantee of the whole migration:
//! existence is checked by uuid before anything is written, so a re-run
//! never duplicates or overwrites an entity that already made it across.

use crate::catalog::{properties::PropertyToggle, Catalog};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

/// Result of a conditional create.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Read, conditional-create and system-property access against one server.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// GET `url` and parse the body as JSON.
    ///
    /// A 2xx response whose body is not a JSON document (or is a bare JSON
    /// string) fails with [`SyncError::Authentication`]: that is the
    /// signature of a login page served in place of the resource.
    async fn fetch(&self, url: &str) -> SyncResult<Value>;

    /// POST `entity` to a collection endpoint, expecting HTTP 201.
    async fn create(&self, collection_url: &str, entity: &Value) -> SyncResult<()>;

    async fn get_system_property(&self, url: &str) -> SyncResult<Value>;

    async fn set_system_property(&self, url: &str, value: &str) -> SyncResult<()>;

    /// Create `entity` under `collection_url` unless an entity with `uuid`
    /// already exists there.
    ///
    /// `NotFound` on the probing GET is the expected "doesn't exist yet"
    /// signal and selects the create branch; any other fetch error
    /// propagates untouched.
    async fn create_if_absent(
        &self,
        collection_url: &str,
        entity: &Value,
        uuid: &str,
    ) -> SyncResult<CreateOutcome> {
        let probe_url = format!("{collection_url}/{uuid}");
        match self.fetch(&probe_url).await {
            Ok(existing) => {
                if existing.get("uuid").and_then(Value::as_str) == Some(uuid) {
                    tracing::info!("resource already exists: {probe_url}");
                }
                Ok(CreateOutcome::AlreadyExists)
            }
            Err(SyncError::NotFound(_)) => {
                self.create(collection_url, entity).await?;
                tracing::info!("created new resource at {collection_url}: {uuid}");
                Ok(CreateOutcome::Created)
            }
            Err(other) => Err(other),
        }
    }
}

/// Production [`RecordStore`] over HTTP with Basic Authentication.
#[derive(Clone, Debug)]
pub struct RecordClient {
    http: reqwest::Client,
    username: String,
    password: String,
}

impl RecordClient {
    pub fn new(username: &str, password: &str, timeout: Duration) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SyncError::Transport)?;
        Ok(Self {
            http,
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

#[async_trait]
impl RecordStore for RecordClient {
    async fn fetch(&self, url: &str) -> SyncResult<Value> {
        let response = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(SyncError::Transport)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(url.to_string()));
        }
        let body = response.text().await.map_err(SyncError::Transport)?;
        if !status.is_success() {
            return Err(SyncError::Rejected {
                status: status.as_u16(),
                detail: extract_detail(&body),
            });
        }
        match serde_json::from_str::<Value>(&body) {
            // a bare string body with HTTP 200 is a login redirect in disguise
            Ok(Value::String(_)) | Err(_) => Err(SyncError::Authentication(url.to_string())),
            Ok(value) => Ok(value),
        }
    }

    async fn create(&self, collection_url: &str, entity: &Value) -> SyncResult<()> {
        let response = self
            .http
            .post(collection_url)
            .basic_auth(&self.username, Some(&self.password))
            .json(entity)
            .send()
            .await
            .map_err(SyncError::Transport)?;
        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Rejected {
                status: status.as_u16(),
                detail: extract_detail(&body),
            });
        }
        Ok(())
    }

    async fn get_system_property(&self, url: &str) -> SyncResult<Value> {
        self.fetch(url).await
    }

    async fn set_system_property(&self, url: &str, value: &str) -> SyncResult<()> {
        let response = self
            .http
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&json!({ "value": value }))
            .send()
            .await
            .map_err(SyncError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Rejected {
                status: status.as_u16(),
                detail: extract_detail(&body),
            });
        }
        Ok(())
    }
}

/// Pull the server-supplied detail message out of an error body, falling
/// back to a truncated copy of the raw body.
fn extract_detail(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for path in [&["error", "detail"][..], &["error", "message"][..]] {
            let mut cursor = &value;
            let mut found = true;
            for key in path {
                match cursor.get(key) {
                    Some(next) => cursor = next,
                    None => {
                        found = false;
                        break;
                    }
                }
            }
            if found {
                if let Some(detail) = cursor.as_str() {
                    return detail.to_string();
                }
            }
        }
    }
    // truncate on a char boundary: error bodies are arbitrary text
    let mut end = body.len().min(500);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Scoped relaxation of the target server's bulk-import validation.
///
/// Acquiring sets every property in the set to `true` and read-back-verifies
/// each one; releasing restores them to `false` with the same verification.
/// This is server-side global state: two migration runs must not overlap
/// the acquire/release window against the same target.
///
/// Release is an explicit async call, not a `Drop` impl; the orchestration
/// must call it on both the success and the failure path.
#[must_use = "relaxed validation must be released, call release() when the batch completes"]
pub struct RelaxedValidation<'a, S: RecordStore + ?Sized> {
    store: &'a S,
    catalog: Catalog,
    properties: &'static [PropertyToggle],
}

impl<'a, S: RecordStore + ?Sized> RelaxedValidation<'a, S> {
    pub async fn acquire(
        store: &'a S,
        catalog: Catalog,
        properties: &'static [PropertyToggle],
    ) -> SyncResult<RelaxedValidation<'a, S>> {
        let guard = Self {
            store,
            catalog,
            properties,
        };
        guard.apply(|toggle| toggle.during).await?;
        tracing::info!("relaxed target validation for bulk import");
        Ok(guard)
    }

    pub async fn release(self) -> SyncResult<()> {
        self.apply(|toggle| toggle.after).await?;
        tracing::info!("restored target validation after bulk import");
        Ok(())
    }

    async fn apply(&self, select: impl Fn(&PropertyToggle) -> &'static str) -> SyncResult<()> {
        for toggle in self.properties {
            let value = select(toggle);
            let url = self.catalog.system_property(toggle.name);
            self.store.set_system_property(&url, value).await?;
            let current = self.store.get_system_property(&url).await?;
            if !property_value_is(&current, value) {
                return Err(SyncError::PropertyToggle(format!(
                    "{} did not read back as {value}",
                    toggle.name
                )));
            }
        }
        Ok(())
    }
}

fn property_value_is(property: &Value, expected: &str) -> bool {
    match property.get("value") {
        Some(Value::String(s)) => s == expected,
        Some(Value::Bool(b)) => b.to_string() == expected,
        _ => false,
    }
}
