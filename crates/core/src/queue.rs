//! Directory-backed durable work queue.
//!
//! The work directory itself holds pending record files; each terminal
//! outcome is a subdirectory. A file lives in exactly one of these at any
//! time, and the atomic rename that moves it is the commit point for that
//! record's outcome — crash recovery and operator visibility both depend on
//! nothing else. There is no in-memory queue state to lose.

use crate::error::{SyncError, SyncResult};
use crate::record::RecordKind;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Terminal states for a record file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Successful,
    Failed,
    Verified,
    FailedVerification,
    MappedToExisting,
}

impl Outcome {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Outcome::Successful => "successful",
            Outcome::Failed => "failed",
            Outcome::Verified => "verified",
            Outcome::FailedVerification => "failed_verification",
            Outcome::MappedToExisting => "mapped_to_existing",
        }
    }
}

/// One work directory and its outcome subdirectories.
#[derive(Clone, Debug)]
pub struct WorkQueue {
    root: PathBuf,
}

impl WorkQueue {
    pub fn new(root: PathBuf) -> SyncResult<Self> {
        fs::create_dir_all(&root).map_err(SyncError::Io)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn outcome_dir(&self, outcome: Outcome) -> PathBuf {
        self.root.join(outcome.dir_name())
    }

    /// Pending files of one record kind, sorted by name so runs are
    /// deterministic.
    pub fn pending_files(&self, kind: RecordKind) -> SyncResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(SyncError::Io)? {
            let entry = entry.map_err(SyncError::Io)?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if kind.uuid_from_file_name(name).is_some() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Uuids of records already filed under `outcome`.
    pub fn uuids_in(&self, outcome: Outcome, kind: RecordKind) -> SyncResult<Vec<String>> {
        let dir = self.outcome_dir(outcome);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut uuids = Vec::new();
        for entry in fs::read_dir(&dir).map_err(SyncError::Io)? {
            let entry = entry.map_err(SyncError::Io)?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(uuid) = kind.uuid_from_file_name(name) {
                    uuids.push(uuid.to_string());
                }
            }
        }
        uuids.sort();
        Ok(uuids)
    }

    pub fn file_in(&self, outcome: Outcome, kind: RecordKind, uuid: &str) -> PathBuf {
        self.outcome_dir(outcome).join(kind.file_name(uuid))
    }

    /// Write a freshly exported record into the pending area.
    pub fn write_pending(&self, kind: RecordKind, uuid: &str, text: &str) -> SyncResult<PathBuf> {
        let path = self.root.join(kind.file_name(uuid));
        fs::write(&path, text).map_err(SyncError::Io)?;
        Ok(path)
    }

    /// File a record under its terminal outcome.
    ///
    /// This is a single `rename` — atomic with respect to a crash — never a
    /// copy-then-delete.
    pub fn complete(&self, file: &Path, outcome: Outcome) -> SyncResult<PathBuf> {
        let file_name = file
            .file_name()
            .ok_or_else(|| SyncError::InvalidInput(format!("not a file path: {}", file.display())))?;
        let dir = self.outcome_dir(outcome);
        fs::create_dir_all(&dir).map_err(SyncError::Io)?;
        let destination = dir.join(file_name);
        fs::rename(file, &destination).map_err(SyncError::Io)?;
        tracing::info!(
            "moved {} to {}",
            file.display(),
            outcome.dir_name()
        );
        Ok(destination)
    }
}

/// Parse a newline-delimited uuid list.
///
/// Blank lines and lines starting with `#` are ignored; lines that are not
/// valid uuids are skipped with a warning. Input order is preserved.
pub fn read_uuid_list(path: &Path) -> SyncResult<Vec<String>> {
    let text = fs::read_to_string(path).map_err(SyncError::Io)?;
    Ok(parse_uuid_list(&text))
}

fn parse_uuid_list(text: &str) -> Vec<String> {
    let mut uuids = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if Uuid::parse_str(line).is_err() {
            tracing::warn!("skipping line that is not a uuid: {line}");
            continue;
        }
        uuids.push(line.to_string());
    }
    uuids
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_uuid_list_skips_comments_and_blanks() {
        let uuids = parse_uuid_list(
            "11111111-1111-1111-1111-111111111111\n# comment\n\n22222222-2222-2222-2222-222222222222",
        );
        assert_eq!(
            uuids,
            vec![
                "11111111-1111-1111-1111-111111111111",
                "22222222-2222-2222-2222-222222222222"
            ]
        );
    }

    #[test]
    fn test_uuid_list_skips_garbage_lines() {
        let uuids = parse_uuid_list("not-a-uuid\n11111111-1111-1111-1111-111111111111\n");
        assert_eq!(uuids, vec!["11111111-1111-1111-1111-111111111111"]);
    }

    #[test]
    fn test_pending_files_filters_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let queue = WorkQueue::new(dir.path().to_path_buf()).unwrap();
        fs::write(dir.path().join("a_patient.json"), "{}").unwrap();
        fs::write(dir.path().join("b_patient.json"), "{}").unwrap();
        fs::write(dir.path().join("c_user.json"), "{}").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        let pending = queue.pending_files(RecordKind::Patient).unwrap();
        let names: Vec<_> = pending
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a_patient.json", "b_patient.json"]);
    }

    #[test]
    fn test_complete_moves_file_to_exactly_one_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let queue = WorkQueue::new(dir.path().to_path_buf()).unwrap();
        let pending = queue
            .write_pending(RecordKind::Patient, "p1", "{\"patient\":{}}")
            .unwrap();

        let moved = queue.complete(&pending, Outcome::Successful).unwrap();
        assert!(!pending.exists());
        assert!(moved.exists());
        assert_eq!(
            moved,
            dir.path().join("successful").join("p1_patient.json")
        );
        assert_eq!(
            queue.uuids_in(Outcome::Successful, RecordKind::Patient).unwrap(),
            vec!["p1"]
        );
    }

    #[test]
    fn test_uuids_in_missing_outcome_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let queue = WorkQueue::new(dir.path().to_path_buf()).unwrap();
        assert!(queue
            .uuids_in(Outcome::Verified, RecordKind::Patient)
            .unwrap()
            .is_empty());
    }
}
