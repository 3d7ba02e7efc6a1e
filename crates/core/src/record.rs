//! The unit of migration: a root entity plus its child collections.
//!
//! Entities are kept as raw [`serde_json::Value`] trees; the wire shape is
//! the data model, and the engines only ever inspect a handful of keys
//! (`uuid`, `previousOrder`, `username`, `identifier`). Typed structs exist
//! only where the structure is ours: the envelope that groups a patient with
//! its child collections in an export file.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Root entity types that migrate as standalone files.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordKind {
    Patient,
    Person,
    User,
    Provider,
    Relationship,
}

impl RecordKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            RecordKind::Patient => "patient",
            RecordKind::Person => "person",
            RecordKind::User => "user",
            RecordKind::Provider => "provider",
            RecordKind::Relationship => "relationship",
        }
    }

    /// Export file name for one record: `{uuid}_{kind}.json`.
    pub fn file_name(&self, uuid: &str) -> String {
        format!("{uuid}_{}.json", self.suffix())
    }

    /// Recover the uuid from an export file name, if the name matches this
    /// kind.
    pub fn uuid_from_file_name<'a>(&self, file_name: &'a str) -> Option<&'a str> {
        let uuid = file_name.strip_suffix(&format!("_{}.json", self.suffix()))?;
        if uuid.is_empty() {
            return None;
        }
        Some(uuid)
    }
}

/// A patient and every child collection that migrates with it.
///
/// `obs` holds only *encounterless* obs; the majority arrive nested inside
/// their encounter. Drug orders are persisted predecessor-first (see
/// [`sequence_by_previous_order`]).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientRecord {
    pub patient: Value,
    #[serde(default)]
    pub visits: Vec<Value>,
    #[serde(default)]
    pub encounters: Vec<Value>,
    #[serde(default)]
    pub obs: Vec<Value>,
    #[serde(default)]
    pub test_orders: Vec<Value>,
    #[serde(default)]
    pub drug_orders: Vec<Value>,
    #[serde(default)]
    pub program_enrollments: Vec<Value>,
    #[serde(default)]
    pub allergies: Vec<Value>,
}

impl PatientRecord {
    pub fn uuid(&self) -> SyncResult<&str> {
        entity_uuid(&self.patient)
    }

    pub fn from_json_str(text: &str) -> SyncResult<Self> {
        serde_json::from_str(text).map_err(SyncError::Parse)
    }

    pub fn to_pretty_json(&self) -> SyncResult<String> {
        serde_json::to_string_pretty(self).map_err(SyncError::Serialization)
    }
}

/// The uuid of an entity, required on every root and child.
pub fn entity_uuid(entity: &Value) -> SyncResult<&str> {
    entity
        .get("uuid")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::InvalidInput("entity has no uuid".into()))
}

fn previous_order_uuid(order: &Value) -> Option<&str> {
    match order.get("previousOrder") {
        Some(Value::Object(previous)) => previous.get("uuid").and_then(Value::as_str),
        Some(Value::String(uuid)) => Some(uuid),
        _ => None,
    }
}

/// Sequence drug orders so that every order appears after the order it
/// supersedes.
///
/// Orders whose predecessor has not been placed yet are deferred to the next
/// pass; when a pass places nothing the remaining set is unresolvable
/// (a cycle, or a predecessor that was never exported — voided orders are
/// excluded from export) and the whole chain is a hard error.
pub fn sequence_by_previous_order(orders: Vec<Value>) -> SyncResult<Vec<Value>> {
    let mut placed: Vec<Value> = Vec::with_capacity(orders.len());
    let mut placed_uuids: BTreeSet<String> = BTreeSet::new();
    let mut remaining = orders;

    while !remaining.is_empty() {
        let before = remaining.len();
        let mut deferred = Vec::new();
        for order in remaining {
            let ready = match previous_order_uuid(&order) {
                Some(previous) => placed_uuids.contains(previous),
                None => true,
            };
            if ready {
                placed_uuids.insert(entity_uuid(&order)?.to_string());
                placed.push(order);
            } else {
                deferred.push(order);
            }
        }
        remaining = deferred;
        if remaining.len() == before {
            let unresolved: Vec<String> = remaining
                .iter()
                .map(|order| {
                    format!(
                        "{} -> {}",
                        entity_uuid(order).unwrap_or("?"),
                        previous_order_uuid(order).unwrap_or("?")
                    )
                })
                .collect();
            return Err(SyncError::OrderChain(unresolved.join(", ")));
        }
    }

    Ok(placed)
}
