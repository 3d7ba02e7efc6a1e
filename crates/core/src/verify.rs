//! Post-migration verification.
//!
//! A migrated record is refetched from the target through the same export
//! pipeline that produced the persisted file, the identifier mappings are
//! applied to the file's raw text (so pre-migration references compare
//! correctly against the target's ids), both sides are canonicalised, and
//! the two trees are deep-compared. Comparison is value-based: two
//! structurally equal canonical trees are equal regardless of origin.
//!
//! On a match the file moves to `verified/`; on a mismatch it moves to
//! `failed_verification/` and a structured path-based diff is logged for
//! the operator.

use crate::catalog::Catalog;
use crate::client::RecordStore;
use crate::error::{SyncError, SyncResult};
use crate::export::{Exporter, Side};
use crate::mapping::MappingTable;
use crate::normalize::{normalize, shift_haiti_2016};
use crate::queue::{Outcome, WorkQueue};
use crate::record::{PatientRecord, RecordKind};
use serde_json::Value;

/// Result of verifying one record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    Matched,
    /// The canonical trees differ; carries the rendered diff.
    Mismatched(String),
    /// The record does not exist on the target at all.
    NotFound,
}

pub struct Verifier<'a, S: RecordStore + ?Sized> {
    exporter: Exporter<'a, S>,
    mappings: MappingTable,
    haiti_2016_dst: bool,
}

impl<'a, S: RecordStore + ?Sized> Verifier<'a, S> {
    pub fn new(store: &'a S, target_catalog: Catalog, mappings: MappingTable) -> Self {
        Self {
            exporter: Exporter::new(store, target_catalog, Side::Target),
            mappings,
            haiti_2016_dst: false,
        }
    }

    pub fn with_haiti_2016_dst_correction(mut self, enabled: bool) -> Self {
        self.haiti_2016_dst = enabled;
        self
    }

    /// Verify one migrated patient from the `successful/` directory.
    ///
    /// `Matched` and `Mismatched` relocate the file; `NotFound` leaves it in
    /// place for the operator to investigate.
    pub async fn verify_patient(&self, queue: &WorkQueue, uuid: &str) -> SyncResult<Verdict> {
        // parse through the envelope so malformed files fail here, not
        // during comparison
        let mapped = self.load_file(queue, RecordKind::Patient, uuid)?;
        let record: PatientRecord = serde_json::from_value(mapped).map_err(SyncError::Parse)?;
        let expected = serde_json::to_value(record).map_err(SyncError::Serialization)?;

        let refetched = match self.exporter.export_patient(uuid).await {
            Ok(record) => serde_json::to_value(record).map_err(SyncError::Serialization)?,
            Err(SyncError::NotFound(_)) => {
                tracing::error!("patient {uuid} not found on target");
                return Ok(Verdict::NotFound);
            }
            Err(other) => return Err(other),
        };

        self.compare_and_file(queue, RecordKind::Patient, uuid, &expected, &refetched)
    }

    /// Verify one migrated relationship.
    pub async fn verify_relationship(&self, queue: &WorkQueue, uuid: &str) -> SyncResult<Verdict> {
        let expected = self.load_file(queue, RecordKind::Relationship, uuid)?;
        let refetched = match self.exporter.export_relationship(uuid).await {
            Ok(value) => value,
            Err(SyncError::NotFound(_)) => {
                tracing::error!("relationship {uuid} not found on target");
                return Ok(Verdict::NotFound);
            }
            Err(other) => return Err(other),
        };
        self.compare_and_file(queue, RecordKind::Relationship, uuid, &expected, &refetched)
    }

    /// Load the persisted pre-migration file with mapping substitutions
    /// applied to its raw text.
    fn load_file(&self, queue: &WorkQueue, kind: RecordKind, uuid: &str) -> SyncResult<Value> {
        let path = queue.file_in(Outcome::Successful, kind, uuid);
        if !path.is_file() {
            return Err(SyncError::MissingFile(path));
        }
        let text = std::fs::read_to_string(&path).map_err(SyncError::Io)?;
        let mapped = self.mappings.apply_str(&text);
        serde_json::from_str(&mapped).map_err(SyncError::Parse)
    }

    fn compare_and_file(
        &self,
        queue: &WorkQueue,
        kind: RecordKind,
        uuid: &str,
        expected: &Value,
        refetched: &Value,
    ) -> SyncResult<Verdict> {
        let mut expected = expected.clone();
        if self.haiti_2016_dst {
            expected = shift_haiti_2016(&expected);
        }
        let expected = normalize(&expected);
        let refetched = normalize(refetched);

        let file = queue.file_in(Outcome::Successful, kind, uuid);
        if expected == refetched {
            queue.complete(&file, Outcome::Verified)?;
            tracing::info!("{} {uuid} verified successfully", kind.suffix());
            return Ok(Verdict::Matched);
        }

        let diff = render_diff(&expected, &refetched);
        queue.complete(&file, Outcome::FailedVerification)?;
        tracing::warn!(
            "verification failed for {} {uuid}:\n{diff}",
            kind.suffix()
        );
        Ok(Verdict::Mismatched(diff))
    }
}

/// Render a path-based diff between two canonical trees.
///
/// One line per differing leaf: the JSON-path, the expected (file) value and
/// the actual (target) value.
pub fn render_diff(expected: &Value, actual: &Value) -> String {
    let mut lines = Vec::new();
    collect_diff("$", expected, actual, &mut lines);
    lines.join("\n")
}

fn collect_diff(path: &str, expected: &Value, actual: &Value, lines: &mut Vec<String>) {
    match (expected, actual) {
        (Value::Object(left), Value::Object(right)) => {
            for (key, left_value) in left {
                let child_path = format!("{path}.{key}");
                match right.get(key) {
                    Some(right_value) => {
                        collect_diff(&child_path, left_value, right_value, lines)
                    }
                    None => lines.push(format!("{child_path}: missing on target (file has {left_value})")),
                }
            }
            for (key, right_value) in right {
                if !left.contains_key(key) {
                    lines.push(format!("{path}.{key}: unexpected on target ({right_value})"));
                }
            }
        }
        (Value::Array(left), Value::Array(right)) => {
            for (index, (left_value, right_value)) in left.iter().zip(right.iter()).enumerate() {
                collect_diff(&format!("{path}[{index}]"), left_value, right_value, lines);
            }
            if left.len() > right.len() {
                for (index, left_value) in left.iter().enumerate().skip(right.len()) {
                    lines.push(format!("{path}[{index}]: missing on target (file has {left_value})"));
                }
            }
            if right.len() > left.len() {
                for (index, right_value) in right.iter().enumerate().skip(left.len()) {
                    lines.push(format!("{path}[{index}]: unexpected on target ({right_value})"));
                }
            }
        }
        (left, right) if left != right => {
            lines.push(format!("{path}: {left} != {right}"));
        }
        _ => {}
    }
}
