//! Record export: fetch a full nested record and canonicalise it.
//!
//! The exporter is used twice in the record lifecycle with the same code
//! path: once against the source server to produce the persisted export
//! file, and once against the target server during verification. Fetching
//! both sides through the identical pipeline is what makes the verify
//! comparison meaningful.

use crate::catalog::{Catalog, TEST_ORDER_NUMBER_CONCEPT};
use crate::client::RecordStore;
use crate::error::SyncResult;
use crate::normalize::{normalize, sort_by_uuid};
use crate::record::{sequence_by_previous_order, PatientRecord};
use serde_json::Value;

/// Which server a record is being fetched from. Order-number prefixing only
/// applies on the source side; by verification time the prefix is already
/// baked into the persisted file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Side {
    Source,
    Target,
}

pub struct Exporter<'a, S: RecordStore + ?Sized> {
    store: &'a S,
    catalog: Catalog,
    side: Side,
    order_number_prefix: Option<String>,
}

impl<'a, S: RecordStore + ?Sized> Exporter<'a, S> {
    pub fn new(store: &'a S, catalog: Catalog, side: Side) -> Self {
        Self {
            store,
            catalog,
            side,
            order_number_prefix: None,
        }
    }

    pub fn with_order_number_prefix(mut self, prefix: Option<String>) -> Self {
        self.order_number_prefix = prefix;
        self
    }

    /// Fetch one patient's full nested record.
    ///
    /// All eight collections are fetched concurrently, then parsed into the
    /// canonical comparison-stable shape. Drug orders come back sequenced
    /// predecessor-first.
    pub async fn export_patient(&self, uuid: &str) -> SyncResult<PatientRecord> {
        tracing::info!("exporting patient {uuid}");
        let patient_url = self.catalog.patient_export(uuid);
        let visits_url = self.catalog.visits_export(uuid);
        let encounters_url = self.catalog.encounters_export(uuid);
        let obs_url = self.catalog.obs_export(uuid);
        let test_orders_url = self.catalog.test_orders_export(uuid);
        let drug_orders_url = self.catalog.drug_orders_export(uuid);
        let enrollments_url = self.catalog.program_enrollments_export(uuid);
        let allergies_url = self.catalog.allergies_export(uuid);
        let (patient, visits, encounters, obs, test_orders, drug_orders, enrollments, allergies) =
            tokio::try_join!(
                self.store.fetch(&patient_url),
                self.store.fetch(&visits_url),
                self.store.fetch(&encounters_url),
                self.store.fetch(&obs_url),
                self.store.fetch(&test_orders_url),
                self.store.fetch(&drug_orders_url),
                self.store.fetch(&enrollments_url),
                self.store.fetch(&allergies_url),
            )?;

        let drug_orders = sequence_by_previous_order(self.parse_orders(drug_orders))?;

        Ok(PatientRecord {
            patient: normalize(&patient),
            visits: parse_collection(visits),
            encounters: self.parse_encounters(encounters),
            obs: self.parse_encounterless_obs(obs),
            test_orders: self.parse_orders(test_orders),
            drug_orders,
            program_enrollments: parse_collection(enrollments),
            allergies: parse_collection(allergies),
        })
    }

    pub async fn export_user(&self, uuid: &str) -> SyncResult<Value> {
        let user = self.store.fetch(&self.catalog.user_export(uuid)).await?;
        Ok(normalize(&user))
    }

    pub async fn export_provider(&self, uuid: &str) -> SyncResult<Value> {
        let provider = self.store.fetch(&self.catalog.provider_export(uuid)).await?;
        Ok(normalize(&provider))
    }

    pub async fn export_person(&self, uuid: &str) -> SyncResult<Value> {
        let person = self.store.fetch(&self.catalog.person_export(uuid)).await?;
        Ok(normalize(&person))
    }

    pub async fn export_relationship(&self, uuid: &str) -> SyncResult<Value> {
        let relationship = self
            .store
            .fetch(&self.catalog.relationship_export(uuid))
            .await?;
        Ok(normalize(&relationship))
    }

    fn parse_encounters(&self, response: Value) -> Vec<Value> {
        results(response)
            .iter()
            .map(|encounter| normalize(&self.prefix_nested_obs(encounter)))
            .collect()
    }

    /// The patient-level obs query returns every obs; only *encounterless*
    /// obs are collected here — the rest arrive nested in their encounter.
    fn parse_encounterless_obs(&self, response: Value) -> Vec<Value> {
        results(response)
            .iter()
            .filter(|obs| obs.get("encounter").map_or(true, Value::is_null))
            .map(|obs| normalize(&self.prefix_nested_obs(obs)))
            .collect()
    }

    fn parse_orders(&self, response: Value) -> Vec<Value> {
        results(response)
            .iter()
            .map(|order| normalize(&self.prefix_order_number(order)))
            .collect()
    }

    fn prefix(&self) -> Option<&str> {
        if self.side == Side::Source {
            self.order_number_prefix.as_deref()
        } else {
            None
        }
    }

    fn prefix_order_number(&self, order: &Value) -> Value {
        let Some(prefix) = self.prefix() else {
            return order.clone();
        };
        let mut order = order.clone();
        if let Some(number) = order.get("orderNumber").and_then(Value::as_str) {
            let prefixed = format!("{prefix}-{number}");
            order["orderNumber"] = Value::String(prefixed);
        }
        order
    }

    /// Apply the order-number prefix to test-order-number obs, recursively
    /// through group members.
    fn prefix_nested_obs(&self, obs: &Value) -> Value {
        let Some(prefix) = self.prefix() else {
            return obs.clone();
        };
        prefix_obs_values(obs, prefix)
    }
}

fn prefix_obs_values(value: &Value, prefix: &str) -> Value {
    match value {
        Value::Object(map) => {
            let is_order_number_obs = map
                .get("concept")
                .and_then(|c| c.get("uuid"))
                .and_then(Value::as_str)
                == Some(TEST_ORDER_NUMBER_CONCEPT);
            let mut result = serde_json::Map::new();
            for (key, entry) in map {
                if key == "value" && is_order_number_obs {
                    if let Some(number) = entry.as_str() {
                        result.insert(key.clone(), Value::String(format!("{prefix}-{number}")));
                        continue;
                    }
                }
                result.insert(key.clone(), prefix_obs_values(entry, prefix));
            }
            Value::Object(result)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| prefix_obs_values(item, prefix))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Canonicalise a plain child collection: normalize each entity and sort the
/// collection by uuid so comparison is independent of the server's return
/// order.
fn parse_collection(response: Value) -> Vec<Value> {
    let mut items: Vec<Value> = results(response).iter().map(normalize).collect();
    sort_by_uuid(&mut items);
    items
}

/// Unwrap a query response's `results` array; absent or null means empty.
fn results(response: Value) -> Vec<Value> {
    match response.get("results") {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}
