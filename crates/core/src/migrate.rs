//! Idempotent record migration against the target server.
//!
//! One record migrates as a unit: the root entity first, then each child
//! collection in dependency order (patient → visit → encounter → obs →
//! orders → program enrollment), every create conditional on the uuid not
//! already existing on the target. The first unrecoverable child error
//! aborts that record; sibling records in the same batch are unaffected.

use crate::catalog::Catalog;
use crate::client::{CreateOutcome, RecordStore};
use crate::error::{SyncError, SyncResult};
use crate::mapping::MappingTable;
use crate::queue::Outcome;
use crate::record::{entity_uuid, sequence_by_previous_order, PatientRecord};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;

/// Usernames owned by the system itself; these accounts exist on every
/// server and must never be re-created.
const RESERVED_USERNAMES: &[&str] = &["admin", "daemon"];

/// Sentinel identifier for the placeholder provider present on every
/// installation.
const UNKNOWN_PROVIDER_IDENTIFIER: &str = "UNKNOWN";

/// How one record left the migration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MigrationOutcome {
    /// Root and children all exist on the target (created now or earlier).
    Migrated,
    /// Reserved or sentinel entity; deliberately never sent to the target.
    Skipped,
    /// The root uuid is in the mapping table: it resolves to an entity that
    /// already exists on the target under another uuid.
    MappedToExisting,
}

impl MigrationOutcome {
    /// Outcome directory the record's file belongs in after migration.
    /// A skipped record was handled deliberately, so it counts as processed.
    pub fn file_outcome(self) -> Outcome {
        match self {
            MigrationOutcome::Migrated | MigrationOutcome::Skipped => Outcome::Successful,
            MigrationOutcome::MappedToExisting => Outcome::MappedToExisting,
        }
    }
}

pub struct MigrationEngine<'a, S: RecordStore + ?Sized> {
    store: &'a S,
    catalog: Catalog,
    mappings: MappingTable,
}

impl<'a, S: RecordStore + ?Sized> MigrationEngine<'a, S> {
    pub fn new(store: &'a S, catalog: Catalog, mappings: MappingTable) -> Self {
        Self {
            store,
            catalog,
            mappings,
        }
    }

    /// Migrate one patient record, children in dependency order.
    pub async fn migrate_patient(&self, record: &PatientRecord) -> SyncResult<MigrationOutcome> {
        let uuid = record.uuid()?;
        if self.mappings.contains_key(uuid) {
            tracing::info!("patient {uuid} is mapped to an existing target entity");
            return Ok(MigrationOutcome::MappedToExisting);
        }
        tracing::info!("importing patient {uuid}");

        self.store
            .create_if_absent(&self.catalog.patients(), &record.patient, uuid)
            .await?;

        for visit in &record.visits {
            self.create_child("visit", &self.catalog.visits(), visit, uuid)
                .await?;
        }
        for encounter in &record.encounters {
            self.create_child("encounter", &self.catalog.encounters(), encounter, uuid)
                .await?;
        }
        for obs in &record.obs {
            self.create_child("obs", &self.catalog.obs(), obs, uuid).await?;
        }
        for order in &record.test_orders {
            self.create_child("test order", &self.catalog.orders(), order, uuid)
                .await?;
        }
        // a superseding order cannot be created before the order it
        // supersedes exists on the target
        let drug_orders = sequence_by_previous_order(record.drug_orders.clone())?;
        for order in &drug_orders {
            self.create_child("drug order", &self.catalog.orders(), order, uuid)
                .await?;
        }
        for enrollment in &record.program_enrollments {
            self.create_child(
                "program enrollment",
                &self.catalog.program_enrollments(),
                enrollment,
                uuid,
            )
            .await?;
        }

        tracing::info!("finished importing patient {uuid}");
        Ok(MigrationOutcome::Migrated)
    }

    /// Migrate one user.
    ///
    /// Reserved system accounts are skipped outright. Users are created with
    /// a fresh random password (the source hash cannot be carried over); the
    /// administrator resets it after migration. A rejection whose detail
    /// matches the server's username-collision message means the account is
    /// already present under another uuid, which counts as success.
    pub async fn migrate_user(&self, user: &Value) -> SyncResult<MigrationOutcome> {
        let uuid = entity_uuid(user)?;
        if self.mappings.contains_key(uuid) {
            tracing::info!("user {uuid} is mapped to an existing target entity");
            return Ok(MigrationOutcome::MappedToExisting);
        }
        let username = user.get("username").and_then(Value::as_str).unwrap_or("");
        if RESERVED_USERNAMES
            .iter()
            .any(|reserved| username.eq_ignore_ascii_case(reserved))
        {
            tracing::info!("skipping reserved user {username}");
            return Ok(MigrationOutcome::Skipped);
        }

        let mut payload = user.clone();
        if let Value::Object(map) = &mut payload {
            map.insert(
                "password".to_string(),
                Value::String(generate_password(16)),
            );
        }

        match self
            .store
            .create_if_absent(&self.catalog.users(), &payload, uuid)
            .await
        {
            Ok(_) => Ok(MigrationOutcome::Migrated),
            Err(SyncError::Rejected { detail, .. }) if detail.contains("already in use") => {
                tracing::info!("user {username} already present on target: {detail}");
                Ok(MigrationOutcome::Migrated)
            }
            Err(other) => Err(other),
        }
    }

    /// Migrate one provider; the sentinel `UNKNOWN` provider is skipped.
    pub async fn migrate_provider(&self, provider: &Value) -> SyncResult<MigrationOutcome> {
        let uuid = entity_uuid(provider)?;
        if self.mappings.contains_key(uuid) {
            tracing::info!("provider {uuid} is mapped to an existing target entity");
            return Ok(MigrationOutcome::MappedToExisting);
        }
        let identifier = provider
            .get("identifier")
            .and_then(Value::as_str)
            .unwrap_or("");
        if identifier == UNKNOWN_PROVIDER_IDENTIFIER {
            tracing::info!("skipping provider {uuid} with identifier UNKNOWN");
            return Ok(MigrationOutcome::Skipped);
        }
        self.store
            .create_if_absent(&self.catalog.providers(), provider, uuid)
            .await?;
        Ok(MigrationOutcome::Migrated)
    }

    pub async fn migrate_person(&self, person: &Value) -> SyncResult<MigrationOutcome> {
        let uuid = entity_uuid(person)?;
        if self.mappings.contains_key(uuid) {
            return Ok(MigrationOutcome::MappedToExisting);
        }
        self.store
            .create_if_absent(&self.catalog.persons(), person, uuid)
            .await?;
        Ok(MigrationOutcome::Migrated)
    }

    pub async fn migrate_relationship(&self, relationship: &Value) -> SyncResult<MigrationOutcome> {
        let uuid = entity_uuid(relationship)?;
        if self.mappings.contains_key(uuid) {
            return Ok(MigrationOutcome::MappedToExisting);
        }
        self.store
            .create_if_absent(&self.catalog.relationships(), relationship, uuid)
            .await?;
        Ok(MigrationOutcome::Migrated)
    }

    async fn create_child(
        &self,
        label: &str,
        collection_url: &str,
        child: &Value,
        patient_uuid: &str,
    ) -> SyncResult<CreateOutcome> {
        let uuid = entity_uuid(child)?;
        let outcome = self
            .store
            .create_if_absent(collection_url, child, uuid)
            .await?;
        tracing::info!("imported {label} {uuid} for patient {patient_uuid}");
        Ok(outcome)
    }
}

/// Random password satisfying the server's complexity rules: at least one
/// upper, lower, digit and special character.
fn generate_password(length: usize) -> String {
    const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    const DIGITS: &[u8] = b"0123456789";
    const SPECIAL: &[u8] = b"!@#$%^&*()_+[]{}|;:,.<>?";

    let mut rng = rand::thread_rng();
    let pick = |rng: &mut rand::rngs::ThreadRng, pool: &[u8]| pool[rng.gen_range(0..pool.len())];

    let mut password = vec![
        pick(&mut rng, UPPER),
        pick(&mut rng, LOWER),
        pick(&mut rng, DIGITS),
        pick(&mut rng, SPECIAL),
    ];
    let all: Vec<u8> = [UPPER, LOWER, DIGITS, SPECIAL].concat();
    while password.len() < length.max(4) {
        password.push(pick(&mut rng, &all));
    }
    password.shuffle(&mut rng);
    String::from_utf8(password).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_store::MemoryStore;
    use serde_json::json;

    const BASE: &str = "https://target.example.org/openmrs";

    fn engine(store: &MemoryStore) -> MigrationEngine<'_, MemoryStore> {
        MigrationEngine::new(store, Catalog::new(BASE), MappingTable::default())
    }

    fn engine_with_mappings<'a>(
        store: &'a MemoryStore,
        mappings: &str,
    ) -> MigrationEngine<'a, MemoryStore> {
        MigrationEngine::new(store, Catalog::new(BASE), MappingTable::parse(mappings))
    }

    fn record() -> PatientRecord {
        PatientRecord {
            patient: json!({"uuid": "p1"}),
            visits: vec![json!({"uuid": "v1", "patient": {"uuid": "p1"}})],
            encounters: vec![json!({
                "uuid": "e1",
                "visit": {"uuid": "v1"},
                "obs": [{"uuid": "nested-o1", "encounter": {"uuid": "e1"}}]
            })],
            obs: vec![json!({"uuid": "o1"})],
            test_orders: vec![json!({"uuid": "t1", "encounter": {"uuid": "e1"}})],
            drug_orders: vec![
                json!({"uuid": "d2", "previousOrder": {"uuid": "d1"}}),
                json!({"uuid": "d1", "previousOrder": null}),
            ],
            program_enrollments: vec![json!({"uuid": "pe1"})],
            allergies: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_children_created_in_dependency_order() {
        let store = MemoryStore::new();
        let outcome = engine(&store).migrate_patient(&record()).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Migrated);
        assert_eq!(
            store.created_uuids(),
            vec!["p1", "v1", "e1", "o1", "t1", "d1", "d2", "pe1"]
        );
    }

    #[tokio::test]
    async fn test_obs_never_created_before_owning_encounter() {
        let store = MemoryStore::new();
        engine(&store).migrate_patient(&record()).await.unwrap();
        let calls = store.calls();
        let encounter_pos = calls
            .iter()
            .position(|c| c.starts_with("POST") && c.ends_with(" e1"))
            .unwrap();
        let obs_pos = calls
            .iter()
            .position(|c| c.starts_with("POST") && c.ends_with(" o1"))
            .unwrap();
        assert!(encounter_pos < obs_pos);
    }

    #[tokio::test]
    async fn test_rerun_creates_nothing_new() {
        let store = MemoryStore::new();
        let engine = engine(&store);
        engine.migrate_patient(&record()).await.unwrap();
        let after_first = store.created_uuids();
        let second = engine.migrate_patient(&record()).await.unwrap();
        assert_eq!(second, MigrationOutcome::Migrated);
        assert_eq!(store.created_uuids(), after_first);
    }

    #[tokio::test]
    async fn test_child_failure_aborts_record() {
        let store = MemoryStore::new();
        store.reject_uuid("v1", 400, "Invalid visit type");
        let result = engine(&store).migrate_patient(&record()).await;
        assert!(matches!(result, Err(SyncError::Rejected { .. })));
        // nothing after the failed visit was attempted
        assert_eq!(store.created_uuids(), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_mapped_patient_routed_to_existing() {
        let store = MemoryStore::new();
        let engine = engine_with_mappings(&store, "p1,target-p9\n");
        let outcome = engine.migrate_patient(&record()).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::MappedToExisting);
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reserved_user_never_posted() {
        let store = MemoryStore::new();
        let user = json!({"uuid": "u1", "username": "daemon"});
        let outcome = engine(&store).migrate_user(&user).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Skipped);
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_username_collision_counts_as_success() {
        let store = MemoryStore::new();
        store.reject_uuid(
            "u1",
            400,
            "Username ladoc or system id 2-1 is already in use",
        );
        let user = json!({"uuid": "u1", "username": "ladoc"});
        let outcome = engine(&store).migrate_user(&user).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Migrated);
    }

    #[tokio::test]
    async fn test_user_created_with_fresh_password() {
        let store = MemoryStore::new();
        let user = json!({"uuid": "u1", "username": "ladoc"});
        engine(&store).migrate_user(&user).await.unwrap();
        assert_eq!(store.created_uuids(), vec!["u1"]);
        let posted = store
            .posted_entity(&Catalog::new(BASE).users(), "u1")
            .unwrap();
        let password = posted["password"].as_str().unwrap();
        assert!(!password.is_empty());
        // the original payload is untouched
        assert!(user.get("password").is_none());
    }

    #[tokio::test]
    async fn test_person_migrated_idempotently() {
        let store = MemoryStore::new();
        let engine = engine(&store);
        let person = json!({"uuid": "per1", "gender": "F"});
        let first = engine.migrate_person(&person).await.unwrap();
        let second = engine.migrate_person(&person).await.unwrap();
        assert_eq!(first, MigrationOutcome::Migrated);
        assert_eq!(second, MigrationOutcome::Migrated);
        assert_eq!(store.created_uuids(), vec!["per1"]);
    }

    #[tokio::test]
    async fn test_mapped_person_never_posted() {
        let store = MemoryStore::new();
        let engine = engine_with_mappings(&store, "per1,target-per9\n");
        let person = json!({"uuid": "per1"});
        let outcome = engine.migrate_person(&person).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::MappedToExisting);
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_relationship_migrated() {
        let store = MemoryStore::new();
        let relationship = json!({
            "uuid": "r1",
            "personA": {"uuid": "per1"},
            "personB": {"uuid": "per2"}
        });
        let outcome = engine(&store)
            .migrate_relationship(&relationship)
            .await
            .unwrap();
        assert_eq!(outcome, MigrationOutcome::Migrated);
        assert_eq!(store.created_uuids(), vec!["r1"]);
    }

    #[tokio::test]
    async fn test_unknown_provider_skipped() {
        let store = MemoryStore::new();
        let provider = json!({"uuid": "pr1", "identifier": "UNKNOWN"});
        let outcome = engine(&store).migrate_provider(&provider).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Skipped);
        assert!(store.calls().is_empty());
    }

    #[test]
    fn test_skipped_records_file_as_successful() {
        assert_eq!(
            MigrationOutcome::Skipped.file_outcome(),
            Outcome::Successful
        );
        assert_eq!(
            MigrationOutcome::Migrated.file_outcome(),
            Outcome::Successful
        );
        assert_eq!(
            MigrationOutcome::MappedToExisting.file_outcome(),
            Outcome::MappedToExisting
        );
    }

    #[test]
    fn test_generated_password_has_all_classes() {
        let password = generate_password(16);
        assert_eq!(password.len(), 16);
        assert!(password.bytes().any(|b| b.is_ascii_uppercase()));
        assert!(password.bytes().any(|b| b.is_ascii_lowercase()));
        assert!(password.bytes().any(|b| b.is_ascii_digit()));
        assert!(password.bytes().any(|b| !b.is_ascii_alphanumeric()));
    }
}
