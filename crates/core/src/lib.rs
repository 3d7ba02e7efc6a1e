//! # EMR Sync Core
//!
//! Core engine for migrating clinical records between two EMR instances.
//!
//! The migration runs in three phases, each a batch operation:
//! - **export**: fetch nested records (patient + visits + encounters + obs +
//!   orders + program enrollments + allergies) from the source server and
//!   persist each as a JSON file
//! - **import**: replay those files against the target server with
//!   create-if-absent semantics, keyed by uuid, so a re-run never duplicates
//!   or overwrites anything
//! - **verify**: refetch each migrated record from the target, canonicalise
//!   both sides and deep-compare them
//!
//! Durable state lives entirely on the filesystem: a work directory holds
//! pending record files, and outcome subdirectories (`successful/`,
//! `failed/`, `verified/`, `failed_verification/`, `mapped_to_existing/`)
//! record each file's terminal state. Moving a file is the commit point.
//!
//! **No CLI concerns**: argument parsing, environment loading and
//! subscriber setup belong in `emrsync-cli`.

pub mod batch;
pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod export;
pub mod mapping;
pub mod migrate;
pub mod normalize;
pub mod queue;
pub mod record;
pub mod verify;

#[cfg(test)]
pub(crate) mod test_store;

pub use catalog::Catalog;
pub use client::{CreateOutcome, RecordClient, RecordStore, RelaxedValidation};
pub use config::{ServerConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use export::{Exporter, Side};
pub use mapping::MappingTable;
pub use migrate::{MigrationEngine, MigrationOutcome};
pub use queue::{Outcome, WorkQueue};
pub use record::{PatientRecord, RecordKind};
pub use verify::{Verdict, Verifier};
