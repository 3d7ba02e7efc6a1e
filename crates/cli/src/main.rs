//! Batch driver for the EMR record migration.
//!
//! Each subcommand is one batch phase over one root record type. All
//! connection details, mapping file paths and tuning come from the
//! environment (a `.env` file is honoured); only per-run inputs, like the
//! uuid list to export, are flags.
//!
//! Runs on a current-thread runtime: the workload is network-bound and the
//! concurrency model is cooperative — many requests in flight, one thread.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emrsync_core::catalog::properties;
use emrsync_core::queue::read_uuid_list;
use emrsync_core::{
    batch, Catalog, Exporter, MappingTable, MigrationEngine, MigrationOutcome, Outcome,
    PatientRecord, RecordClient, RecordKind, RelaxedValidation, ServerConfig, Side, SyncConfig,
    Verifier, WorkQueue,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "emrsync")]
#[command(about = "Migrate clinical records between two EMR instances")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export patients named in a uuid list file from the source server
    ExportPatients {
        /// Newline-delimited uuid list (# comments and blank lines ignored)
        list: PathBuf,
    },
    /// Export users named in a uuid list file from the source server
    ExportUsers { list: PathBuf },
    /// Export providers named in a uuid list file from the source server
    ExportProviders { list: PathBuf },
    /// Export persons named in a uuid list file from the source server
    ExportPersons { list: PathBuf },
    /// Export relationships named in a uuid list file from the source server
    ExportRelationships { list: PathBuf },
    /// Import pending patient files into the target server
    ImportPatients,
    /// Import pending user files into the target server
    ImportUsers,
    /// Import pending provider files into the target server
    ImportProviders,
    /// Import pending person files into the target server
    ImportPersons,
    /// Verify migrated patients against the target server
    VerifyPatients,
    /// Verify migrated relationships against the target server
    VerifyRelationships,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config()?;

    match cli.command {
        Commands::ExportPatients { list } => export_patients(&config, &list).await,
        Commands::ExportUsers { list } => {
            export_single_kind(&config, &list, RecordKind::User).await
        }
        Commands::ExportProviders { list } => {
            export_single_kind(&config, &list, RecordKind::Provider).await
        }
        Commands::ExportPersons { list } => {
            export_single_kind(&config, &list, RecordKind::Person).await
        }
        Commands::ExportRelationships { list } => {
            export_single_kind(&config, &list, RecordKind::Relationship).await
        }
        Commands::ImportPatients => import_patients(&config).await,
        Commands::ImportUsers => import_users(&config).await,
        Commands::ImportProviders => import_providers(&config).await,
        Commands::ImportPersons => import_persons(&config).await,
        Commands::VerifyPatients => verify(&config, RecordKind::Patient).await,
        Commands::VerifyRelationships => verify(&config, RecordKind::Relationship).await,
    }
}

fn env_var(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} is not set"))
}

fn load_config() -> Result<SyncConfig> {
    let source = ServerConfig::new(
        env_var("EMRSYNC_SOURCE_URL")?,
        env_var("EMRSYNC_SOURCE_USERNAME")?,
        env_var("EMRSYNC_SOURCE_PASSWORD")?,
    )?;
    let target = ServerConfig::new(
        env_var("EMRSYNC_TARGET_URL")?,
        env_var("EMRSYNC_TARGET_USERNAME")?,
        env_var("EMRSYNC_TARGET_PASSWORD")?,
    )?;
    let work_dir = PathBuf::from(env_var("EMRSYNC_WORK_DIR")?);
    let batch_size = match std::env::var("EMRSYNC_BATCH_SIZE") {
        Ok(value) => value
            .parse::<usize>()
            .with_context(|| format!("EMRSYNC_BATCH_SIZE is not a number: {value}"))?,
        Err(_) => 20,
    };
    let haiti = std::env::var("EMRSYNC_HAITI_2016_DST")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    Ok(SyncConfig::new(source, target, work_dir, batch_size)
        .with_order_number_prefix(std::env::var("EMRSYNC_ORDER_NUMBER_PREFIX").ok())
        .with_haiti_2016_dst_correction(haiti))
}

/// Merge every configured mapping table; missing env vars mean no table.
fn load_mappings() -> Result<MappingTable> {
    let mut merged = MappingTable::default();
    for name in [
        "EMRSYNC_PROVIDER_MAPPINGS_FILE",
        "EMRSYNC_USER_MAPPINGS_FILE",
        "EMRSYNC_PATIENT_IDENTIFIER_MAPPINGS_FILE",
        "EMRSYNC_WORKFLOW_STATE_MAPPINGS_FILE",
    ] {
        if let Ok(path) = std::env::var(name) {
            let table = MappingTable::load(&PathBuf::from(&path))
                .with_context(|| format!("failed to load {name} from {path}"))?;
            merged = merged.merge(table);
        }
    }
    Ok(merged)
}

fn source_client(config: &SyncConfig) -> Result<RecordClient> {
    Ok(RecordClient::new(
        config.source().username(),
        config.source().password(),
        config.request_timeout(),
    )?)
}

fn target_client(config: &SyncConfig) -> Result<RecordClient> {
    Ok(RecordClient::new(
        config.target().username(),
        config.target().password(),
        config.request_timeout(),
    )?)
}

async fn export_patients(config: &SyncConfig, list: &PathBuf) -> Result<()> {
    let client = source_client(config)?;
    let exporter = Exporter::new(&client, Catalog::new(config.source().base_url()), Side::Source)
        .with_order_number_prefix(config.order_number_prefix().map(String::from));
    let queue = WorkQueue::new(config.work_dir().to_path_buf())?;
    let uuids = read_uuid_list(list)?;
    tracing::info!("exporting {} patients", uuids.len());

    batch::run_in_batches(uuids, config.batch_size(), |uuid| {
        let exporter = &exporter;
        let queue = &queue;
        async move {
            let record = exporter.export_patient(&uuid).await?;
            queue.write_pending(RecordKind::Patient, &uuid, &record.to_pretty_json()?)?;
            Ok(())
        }
    })
    .await;
    Ok(())
}

async fn export_single_kind(config: &SyncConfig, list: &PathBuf, kind: RecordKind) -> Result<()> {
    let client = source_client(config)?;
    let exporter = Exporter::new(&client, Catalog::new(config.source().base_url()), Side::Source);
    let queue = WorkQueue::new(config.work_dir().to_path_buf())?;
    let uuids = read_uuid_list(list)?;
    tracing::info!("exporting {} {}s", uuids.len(), kind.suffix());

    batch::run_in_batches(uuids, config.batch_size(), |uuid| {
        let exporter = &exporter;
        let queue = &queue;
        async move {
            let entity = match kind {
                RecordKind::User => exporter.export_user(&uuid).await?,
                RecordKind::Provider => exporter.export_provider(&uuid).await?,
                RecordKind::Relationship => exporter.export_relationship(&uuid).await?,
                RecordKind::Person => exporter.export_person(&uuid).await?,
                RecordKind::Patient => unreachable!("patients use export_patients"),
            };
            let text = serde_json::to_string_pretty(&entity)
                .map_err(emrsync_core::SyncError::Serialization)?;
            queue.write_pending(kind, &uuid, &text)?;
            Ok(())
        }
    })
    .await;
    Ok(())
}

async fn import_patients(config: &SyncConfig) -> Result<()> {
    let client = target_client(config)?;
    let catalog = Catalog::new(config.target().base_url());
    let mappings = load_mappings()?;
    let engine = MigrationEngine::new(&client, catalog.clone(), mappings.clone());
    let queue = WorkQueue::new(config.work_dir().to_path_buf())?;
    let files = queue.pending_files(RecordKind::Patient)?;
    tracing::info!("importing {} patient files", files.len());

    // Server-side global state: must be restored even when the batch fails,
    // and two runs must never overlap this window.
    let guard =
        RelaxedValidation::acquire(&client, catalog.clone(), properties::BULK_IMPORT_SET).await?;

    batch::run_in_batches(files, config.batch_size(), |file| {
        let engine = &engine;
        let queue = &queue;
        let mappings = &mappings;
        async move {
            let result = async {
                let text = std::fs::read_to_string(&file).map_err(emrsync_core::SyncError::Io)?;
                let record = PatientRecord::from_json_str(&mappings.apply_str(&text))?;
                engine.migrate_patient(&record).await
            }
            .await;
            file_outcome(queue, &file, result)
        }
    })
    .await;

    guard.release().await?;
    Ok(())
}

async fn import_users(config: &SyncConfig) -> Result<()> {
    let client = target_client(config)?;
    let mappings = load_mappings()?;
    let engine = MigrationEngine::new(&client, Catalog::new(config.target().base_url()), mappings);
    let queue = WorkQueue::new(config.work_dir().to_path_buf())?;
    let files = queue.pending_files(RecordKind::User)?;
    tracing::info!("importing {} user files", files.len());

    batch::run_in_batches(files, config.batch_size(), |file| {
        let engine = &engine;
        let queue = &queue;
        async move {
            let result = async {
                let text = std::fs::read_to_string(&file).map_err(emrsync_core::SyncError::Io)?;
                let user = serde_json::from_str(&text).map_err(emrsync_core::SyncError::Parse)?;
                engine.migrate_user(&user).await
            }
            .await;
            file_outcome(queue, &file, result)
        }
    })
    .await;
    Ok(())
}

async fn import_providers(config: &SyncConfig) -> Result<()> {
    let client = target_client(config)?;
    let mappings = load_mappings()?;
    let engine = MigrationEngine::new(&client, Catalog::new(config.target().base_url()), mappings);
    let queue = WorkQueue::new(config.work_dir().to_path_buf())?;
    let files = queue.pending_files(RecordKind::Provider)?;
    tracing::info!("importing {} provider files", files.len());

    // providers are imported one at a time: concurrent person saves trip a
    // server-side race in the provider resource
    batch::run_in_batches(files, 1, |file| {
        let engine = &engine;
        let queue = &queue;
        async move {
            let result = async {
                let text = std::fs::read_to_string(&file).map_err(emrsync_core::SyncError::Io)?;
                let provider =
                    serde_json::from_str(&text).map_err(emrsync_core::SyncError::Parse)?;
                engine.migrate_provider(&provider).await
            }
            .await;
            file_outcome(queue, &file, result)
        }
    })
    .await;
    Ok(())
}

async fn import_persons(config: &SyncConfig) -> Result<()> {
    let client = target_client(config)?;
    let mappings = load_mappings()?;
    let engine = MigrationEngine::new(&client, Catalog::new(config.target().base_url()), mappings);
    let queue = WorkQueue::new(config.work_dir().to_path_buf())?;
    let files = queue.pending_files(RecordKind::Person)?;
    tracing::info!("importing {} person files", files.len());

    batch::run_in_batches(files, config.batch_size(), |file| {
        let engine = &engine;
        let queue = &queue;
        async move {
            let result = async {
                let text = std::fs::read_to_string(&file).map_err(emrsync_core::SyncError::Io)?;
                let person = serde_json::from_str(&text).map_err(emrsync_core::SyncError::Parse)?;
                engine.migrate_person(&person).await
            }
            .await;
            file_outcome(queue, &file, result)
        }
    })
    .await;
    Ok(())
}

async fn verify(config: &SyncConfig, kind: RecordKind) -> Result<()> {
    let client = target_client(config)?;
    let verifier = Verifier::new(
        &client,
        Catalog::new(config.target().base_url()),
        load_mappings()?,
    )
    .with_haiti_2016_dst_correction(config.haiti_2016_dst_correction());
    let queue = WorkQueue::new(config.work_dir().to_path_buf())?;
    let uuids = queue.uuids_in(Outcome::Successful, kind)?;
    tracing::info!("verifying {} {}s", uuids.len(), kind.suffix());

    batch::run_in_batches(uuids, config.batch_size(), |uuid| {
        let verifier = &verifier;
        let queue = &queue;
        async move {
            match kind {
                RecordKind::Patient => verifier.verify_patient(queue, &uuid).await?,
                RecordKind::Relationship => verifier.verify_relationship(queue, &uuid).await?,
                _ => bail_unsupported(kind)?,
            };
            Ok(())
        }
    })
    .await;
    Ok(())
}

fn bail_unsupported(kind: RecordKind) -> emrsync_core::SyncResult<emrsync_core::Verdict> {
    Err(emrsync_core::SyncError::InvalidInput(format!(
        "verification is not supported for {}",
        kind.suffix()
    )))
}

fn file_outcome(
    queue: &WorkQueue,
    file: &std::path::Path,
    result: emrsync_core::SyncResult<MigrationOutcome>,
) -> emrsync_core::SyncResult<()> {
    match result {
        Ok(outcome) => {
            queue.complete(file, outcome.file_outcome())?;
            Ok(())
        }
        Err(err) => {
            tracing::error!("error processing {}: {err}", file.display());
            queue.complete(file, Outcome::Failed)?;
            Err(err)
        }
    }
}
