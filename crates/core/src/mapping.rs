//! Identifier mapping tables.
//!
//! A mapping file rewrites references to entities that already exist on the
//! target under a different uuid (providers, users, patient identifier
//! types, program workflow states). Substitution happens on the raw file
//! text before parsing, so every nested reference is rewritten in one pass.
//!
//! File format: one `source_uuid,target_uuid` pair per line. Blank lines and
//! lines starting with `#` are ignored. Anything after a space in either
//! column is treated as an annotation and discarded.

use crate::error::{SyncError, SyncResult};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Clone, Debug, Default)]
pub struct MappingTable {
    entries: BTreeMap<String, String>,
}

impl MappingTable {
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut columns = line.splitn(2, ',');
            let key = columns.next().map(first_token).unwrap_or_default();
            let value = columns.next().map(first_token).unwrap_or_default();
            if key.is_empty() || value.is_empty() {
                tracing::warn!("skipping malformed mapping line: {line}");
                continue;
            }
            entries.insert(key.to_string(), value.to_string());
        }
        Self { entries }
    }

    pub fn load(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path).map_err(SyncError::Io)?;
        let table = Self::parse(&text);
        tracing::info!(
            "loaded {} mappings from {}",
            table.entries.len(),
            path.display()
        );
        Ok(table)
    }

    /// Merge another table into this one. Later tables win on key collision.
    pub fn merge(mut self, other: MappingTable) -> Self {
        self.entries.extend(other.entries);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Rewrite every occurrence of every mapped key in `text`.
    pub fn apply_str(&self, text: &str) -> String {
        let mut result = text.to_string();
        for (key, value) in &self.entries {
            result = result.replace(key.as_str(), value.as_str());
        }
        result
    }
}

fn first_token(column: &str) -> &str {
    column.trim().split_whitespace().next().unwrap_or("")
}
