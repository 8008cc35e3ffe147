//! `chr`: command history operations against a local `SQLite` database.
//!
//! Every subcommand prints one JSON document on stdout. Logs go to stderr,
//! filtered by `RUST_LOG` (default `warn`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use command_history_core::{
    parse_rfc3339_utc, AuditDocument, BlobKind, BlobPayload, CommandHistoryConfig,
    CommandHistoryRecord, CommandId, CoreRecord, Etag, ExportDestinationDocument, ExportFilter,
    Fragment, FragmentSet, LeaseReceipt, PrivacyCommandType, PrivacySubject, StatusDocument,
    SubjectType, SubjectTypeFilter, SystemClock,
};
use command_history_repository::CommandHistoryRepository;
use command_history_store_sqlite::{SqliteBlobStore, SqliteCommandHistoryStore, SqliteDocumentStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub type SqliteRepository = CommandHistoryRepository<SqliteDocumentStore, SqliteBlobStore>;

#[derive(Debug, Parser)]
#[command(name = "chr")]
#[command(about = "Command history CLI")]
pub struct Cli {
    #[arg(long, default_value = "./command_history.sqlite3")]
    db: PathBuf,

    /// JSON file holding a command history config.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "local")]
    blob_account: String,

    #[arg(long, default_value = "command-history")]
    blob_container: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Point-read one command's history.
    Show(ShowArgs),
    /// Insert a record from a JSON file; prints whether it was created.
    Insert(InsertArgs),
    /// Subject/requester history query.
    History(HistoryArgs),
    /// One page of commands created in a window, for replay.
    Replay(ReplayArgs),
    IncompleteExports(IncompleteExportsArgs),
    PartiallyIngested(PartiallyIngestedArgs),
    LeaseReceipt {
        #[command(subcommand)]
        command: LeaseReceiptCommand,
    },
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    command_id: String,
    /// `all`, or a comma separated list of core, audit, status, export.
    #[arg(long, default_value = "all")]
    fragments: String,
}

#[derive(Debug, Args)]
pub struct InsertArgs {
    #[arg(long)]
    record: PathBuf,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long, conflicts_with = "object_id")]
    puid: Option<i64>,
    #[arg(long)]
    object_id: Option<String>,
    #[arg(long, requires = "object_id")]
    tenant_id: Option<String>,
    #[arg(long)]
    requester: Option<String>,
    #[arg(long = "command-type")]
    command_types: Vec<CommandTypeArg>,
    #[arg(long)]
    since: String,
    #[arg(long, default_value = "core")]
    fragments: String,
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    #[arg(long)]
    start: String,
    #[arg(long)]
    end: String,
    #[arg(long, conflicts_with = "exclude_subject_type")]
    subject_type: Option<SubjectTypeArg>,
    #[arg(long)]
    exclude_subject_type: Option<SubjectTypeArg>,
    #[arg(long)]
    export_only: bool,
    #[arg(long)]
    continuation: Option<String>,
}

#[derive(Debug, Args)]
pub struct IncompleteExportsArgs {
    #[arg(long)]
    start: String,
    #[arg(long)]
    end: String,
    #[arg(long)]
    aad: bool,
    #[arg(long, default_value = "core")]
    fragments: String,
}

#[derive(Debug, Args)]
pub struct PartiallyIngestedArgs {
    #[arg(long)]
    start: String,
    #[arg(long)]
    end: String,
    #[arg(long, conflicts_with = "non_exports_only")]
    exports_only: bool,
    #[arg(long)]
    non_exports_only: bool,
    #[arg(long)]
    max_items: Option<usize>,
    #[arg(long)]
    continuation: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum LeaseReceiptCommand {
    /// Decode a receipt without touching the database.
    Decode { receipt: String },
    IsComplete { receipt: String },
    /// Rebuild the privacy command the receipt was leased for.
    Command { receipt: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CommandTypeArg {
    Delete,
    Export,
    AccountClose,
    AgeOut,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SubjectTypeArg {
    Msa,
    Aad,
    Device,
    Demographic,
    EdgeBrowser,
}

/// Record file accepted by `chr insert`.
#[derive(Debug, Deserialize)]
struct RecordInput {
    #[serde(default)]
    command_id: Option<CommandId>,
    core: CoreRecord,
    #[serde(default)]
    audit: Vec<AuditDocument>,
    #[serde(default)]
    status: Vec<StatusDocument>,
    #[serde(default)]
    export_destinations: Vec<ExportDestinationDocument>,
}

#[derive(Debug, Serialize)]
struct RecordView {
    command_id: CommandId,
    fragments_read: String,
    core_etag: Option<Etag>,
    core: CoreRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    audit: Option<Vec<AuditDocument>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<Vec<StatusDocument>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    export_destinations: Option<Vec<ExportDestinationDocument>>,
}

/// Installs the stderr log subscriber. Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Executes a parsed CLI invocation and prints its JSON result.
///
/// # Errors
/// Returns an error when the store cannot be opened, the config is invalid,
/// or the requested operation fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    if let Command::LeaseReceipt {
        command: LeaseReceiptCommand::Decode { receipt },
    } = &cli.command
    {
        return print_json(&decode_receipt(receipt)?);
    }

    let repository = open_repository(
        &cli.db,
        cli.config.as_deref(),
        &cli.blob_account,
        &cli.blob_container,
    )?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let output = runtime.block_on(run_command(cli.command, &repository))?;
    print_json(&output)
}

/// Opens (and migrates) the database and wires the repository over it.
///
/// # Errors
/// Returns an error when the database or the config file cannot be loaded.
pub fn open_repository(
    db_path: &Path,
    config_path: Option<&Path>,
    blob_account: &str,
    blob_container: &str,
) -> Result<SqliteRepository> {
    let config = match config_path {
        Some(path) => load_config(path)?,
        None => CommandHistoryConfig::default(),
    };
    let store = SqliteCommandHistoryStore::open_shared(db_path)?;
    let flags = config.feature_flags();
    CommandHistoryRepository::new(
        store.document_store(),
        store.blob_store(blob_account, blob_container),
        flags,
        SystemClock,
        config,
    )
    .context("failed to build command history repository")
}

/// Runs one subcommand against `repository` and returns its JSON output.
///
/// # Errors
/// Returns an error when argument parsing or the repository call fails.
pub async fn run_command(command: Command, repository: &SqliteRepository) -> Result<Value> {
    match command {
        Command::Show(args) => {
            let command_id = parse_command_id(&args.command_id)?;
            let fragments = parse_fragments(&args.fragments)?;
            let record = repository.query(command_id, fragments).await?;
            match record {
                Some(record) => to_json(&record_view(&record)),
                None => Ok(Value::Null),
            }
        }
        Command::Insert(args) => {
            let mut record = read_record(&args.record)?;
            let inserted = repository.try_insert(&mut record).await?;
            Ok(json!({
                "command_id": record.command_id(),
                "inserted": inserted,
            }))
        }
        Command::History(args) => {
            let subject = history_subject(&args)?;
            let command_types = args
                .command_types
                .iter()
                .map(|value| map_command_type(*value))
                .collect::<Vec<_>>();
            let records = repository
                .query_by_subject(
                    subject.as_ref(),
                    args.requester.as_deref(),
                    &command_types,
                    parse_utc(&args.since)?,
                    parse_fragments(&args.fragments)?,
                )
                .await?;
            records_json(&records, None)
        }
        Command::Replay(args) => {
            let subject_filter = match (args.subject_type, args.exclude_subject_type) {
                (Some(value), _) => Some(SubjectTypeFilter::Matching(map_subject_type(value))),
                (None, Some(value)) => Some(SubjectTypeFilter::Excluding(map_subject_type(value))),
                (None, None) => None,
            };
            let (records, continuation) = repository
                .get_commands_for_replay(
                    parse_utc(&args.start)?,
                    parse_utc(&args.end)?,
                    subject_filter,
                    args.export_only,
                    args.continuation.as_deref(),
                )
                .await?;
            records_json(&records, continuation)
        }
        Command::IncompleteExports(args) => {
            let records = repository
                .query_incomplete_exports(
                    parse_utc(&args.start)?,
                    parse_utc(&args.end)?,
                    args.aad,
                    parse_fragments(&args.fragments)?,
                )
                .await?;
            records_json(&records, None)
        }
        Command::PartiallyIngested(args) => {
            let filter = if args.exports_only {
                ExportFilter::ExportsOnly
            } else if args.non_exports_only {
                ExportFilter::NonExportsOnly
            } else {
                ExportFilter::All
            };
            let max_items = args
                .max_items
                .unwrap_or(repository.config().replay_page_size);
            let (records, continuation) = repository
                .query_partially_ingested_commands(
                    parse_utc(&args.start)?,
                    parse_utc(&args.end)?,
                    max_items,
                    filter,
                    args.continuation.as_deref(),
                )
                .await?;
            records_json(&records, continuation)
        }
        Command::LeaseReceipt { command } => match command {
            LeaseReceiptCommand::Decode { receipt } => decode_receipt(&receipt),
            LeaseReceiptCommand::IsComplete { receipt } => {
                let receipt = parse_receipt(&receipt)?;
                let complete = repository.query_is_complete_by_agent(&receipt).await?;
                Ok(json!({
                    "command_id": receipt.command_id,
                    "agent_id": receipt.agent_id,
                    "asset_group_id": receipt.asset_group_id,
                    "complete": complete,
                }))
            }
            LeaseReceiptCommand::Command { receipt } => {
                let receipt = parse_receipt(&receipt)?;
                match repository.query_privacy_command(&receipt).await? {
                    Some(command) => to_json(&command),
                    None => Ok(Value::Null),
                }
            }
        },
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).context("failed to render JSON output")
}

fn load_config(path: &Path) -> Result<CommandHistoryConfig> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let value: Value = serde_json::from_str(&body)
        .with_context(|| format!("config {} must be valid JSON", path.display()))?;
    CommandHistoryConfig::from_json(&value)
        .with_context(|| format!("invalid config {}", path.display()))
}

fn read_record(path: &Path) -> Result<CommandHistoryRecord> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read record {}", path.display()))?;
    let input: RecordInput = serde_json::from_str(&body)
        .with_context(|| format!("record {} is not a valid command history record", path.display()))?;

    let mut record =
        CommandHistoryRecord::new(input.command_id.unwrap_or_else(CommandId::random), input.core);
    *record.audit_map_mut() = BlobPayload::Audit(input.audit).into_audit_map()?;
    *record.status_map_mut() = BlobPayload::Status(input.status).into_status_map()?;
    *record.export_destinations_mut() =
        BlobPayload::Export(input.export_destinations).into_export_destinations()?;
    Ok(record)
}

fn record_view(record: &CommandHistoryRecord) -> RecordView {
    let context = record.operation_context();
    let read = context.map_or(FragmentSet::ALL, |context| context.fragments_read);

    let audit = match BlobPayload::from_record(record, BlobKind::Audit) {
        BlobPayload::Audit(items) if read.has(Fragment::Audit) => Some(items),
        _ => None,
    };
    let status = match BlobPayload::from_record(record, BlobKind::Status) {
        BlobPayload::Status(items) if read.has(Fragment::Status) => Some(items),
        _ => None,
    };
    let export_destinations = match BlobPayload::from_record(record, BlobKind::Export) {
        BlobPayload::Export(items) if read.has(Fragment::Export) => Some(items),
        _ => None,
    };

    RecordView {
        command_id: record.command_id(),
        fragments_read: read.to_string(),
        core_etag: context.and_then(|context| context.core_etag.clone()),
        core: record.core().clone(),
        audit,
        status,
        export_destinations,
    }
}

fn records_json(records: &[CommandHistoryRecord], continuation: Option<String>) -> Result<Value> {
    let views = records.iter().map(record_view).collect::<Vec<_>>();
    Ok(json!({
        "count": views.len(),
        "records": to_json(&views)?,
        "continuation": continuation,
    }))
}

fn history_subject(args: &HistoryArgs) -> Result<Option<PrivacySubject>> {
    if let Some(puid) = args.puid {
        return Ok(Some(PrivacySubject::Msa { puid, anid: None }));
    }
    let Some(object_id) = args.object_id.as_deref() else {
        return Ok(None);
    };
    let tenant_id = match args.tenant_id.as_deref() {
        Some(value) => parse_uuid(value)?,
        None => Uuid::nil(),
    };
    Ok(Some(PrivacySubject::Aad {
        object_id: parse_uuid(object_id)?,
        tenant_id,
    }))
}

fn decode_receipt(raw: &str) -> Result<Value> {
    let receipt = parse_receipt(raw)?;
    Ok(json!({
        "receipt": to_json(&receipt)?,
        "effective_queue_storage_type": receipt.effective_queue_storage_type(),
    }))
}

fn parse_receipt(raw: &str) -> Result<LeaseReceipt> {
    LeaseReceipt::parse(raw.trim()).context("invalid lease receipt")
}

fn parse_utc(raw: &str) -> Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| anyhow!("invalid timestamp: {err}"))
}

fn parse_command_id(raw: &str) -> Result<CommandId> {
    CommandId::parse(raw).with_context(|| format!("invalid command id: {raw}"))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("invalid UUID: {raw}"))
}

fn parse_fragments(raw: &str) -> Result<FragmentSet> {
    match FragmentSet::parse(raw) {
        Some(set) if !set.is_empty() => Ok(set),
        Some(_) => bail!("fragment set must name at least one fragment"),
        None => bail!("invalid fragment set `{raw}`; expected all or core,audit,status,export"),
    }
}

fn map_command_type(value: CommandTypeArg) -> PrivacyCommandType {
    match value {
        CommandTypeArg::Delete => PrivacyCommandType::Delete,
        CommandTypeArg::Export => PrivacyCommandType::Export,
        CommandTypeArg::AccountClose => PrivacyCommandType::AccountClose,
        CommandTypeArg::AgeOut => PrivacyCommandType::AgeOut,
    }
}

fn map_subject_type(value: SubjectTypeArg) -> SubjectType {
    match value {
        SubjectTypeArg::Msa => SubjectType::Msa,
        SubjectTypeArg::Aad => SubjectType::Aad,
        SubjectTypeArg::Device => SubjectType::Device,
        SubjectTypeArg::Demographic => SubjectType::Demographic,
        SubjectTypeArg::EdgeBrowser => SubjectType::EdgeBrowser,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use command_history_core::{AgentId, AssetGroupId};
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_path(label: &str, extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("chr-{label}-{}.{extension}", Ulid::new()))
    }

    fn fixture_repository() -> (SqliteRepository, PathBuf) {
        let db = temp_path("db", "sqlite3");
        let repository = must(open_repository(&db, None, "local", "command-history"));
        (repository, db)
    }

    fn write_record_file(created: &str) -> (PathBuf, CommandId, AgentId, AssetGroupId) {
        let command_id = CommandId::random();
        let agent_id = AgentId::random();
        let asset_group_id = AssetGroupId::random();
        let body = json!({
            "command_id": command_id,
            "core": {
                "command_type": 2,
                "subject": {"type": "msa", "puid": 985_154_365},
                "requester": "portal",
                "created_time": created,
                "total_command_count": 1,
                "ingested_command_count": 0,
                "raw_pxs_command": "{\"verb\":\"export\"}"
            },
            "status": [{
                "agentId": agent_id,
                "assetGroupId": asset_group_id,
                "completedTime": created
            }],
            "export_destinations": [{
                "agentId": agent_id,
                "assetGroupId": asset_group_id,
                "destinationUri": "https://exports.example/c"
            }]
        });
        let path = temp_path("record", "json");
        must(fs::write(&path, body.to_string()).map_err(Into::into));
        (path, command_id, agent_id, asset_group_id)
    }

    fn now_rfc3339() -> String {
        let now = command_history_core::now_utc();
        let whole = match OffsetDateTime::from_unix_timestamp(now.unix_timestamp()) {
            Ok(value) => value,
            Err(err) => panic!("invalid time: {err}"),
        };
        must(command_history_core::format_rfc3339(whole).map_err(Into::into))
    }

    #[test]
    fn fragment_sets_parse_from_cli_syntax() {
        assert_eq!(must(parse_fragments("all")), FragmentSet::ALL);
        assert_eq!(
            must(parse_fragments("core,status")),
            FragmentSet::CORE | FragmentSet::STATUS
        );
        assert!(parse_fragments("none").is_err());
        assert!(parse_fragments("core,bogus").is_err());
    }

    #[test]
    fn parse_utc_rejects_non_utc() {
        assert!(parse_utc("2026-02-07T12:00:00+02:00").is_err());
        assert!(parse_utc("2026-02-07T12:00:00Z").is_ok());
    }

    #[test]
    fn cli_rejects_conflicting_filters() {
        let parsed = Cli::try_parse_from([
            "chr",
            "partially-ingested",
            "--start",
            "2026-02-01T00:00:00Z",
            "--end",
            "2026-02-07T00:00:00Z",
            "--exports-only",
            "--non-exports-only",
        ]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from([
            "chr",
            "history",
            "--puid",
            "1",
            "--object-id",
            "6f9619ff-8b86-d011-b42d-00cf4fc964ff",
            "--since",
            "2026-02-01T00:00:00Z",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn decode_reports_receipt_fields() {
        let receipt = LeaseReceipt::new(
            CommandId::random(),
            AgentId::random(),
            AssetGroupId::random(),
            SubjectType::Aad,
            PrivacyCommandType::Delete,
        );
        let encoded = must(receipt.serialize().map_err(Into::into));
        let value = must(decode_receipt(&encoded));
        assert_eq!(value["receipt"]["v"], json!(3));
        assert_eq!(value["receipt"]["st"], json!("aad"));
        assert!(decode_receipt("not a receipt").is_err());
    }

    #[tokio::test]
    async fn insert_show_and_receipt_commands_share_one_database() {
        let (repository, db) = fixture_repository();
        let created = now_rfc3339();
        let (record_path, command_id, agent_id, asset_group_id) = write_record_file(&created);

        let inserted = must(
            run_command(
                Command::Insert(InsertArgs {
                    record: record_path.clone(),
                }),
                &repository,
            )
            .await,
        );
        assert_eq!(inserted["inserted"], json!(true));
        assert_eq!(inserted["command_id"], json!(command_id));

        let again = must(
            run_command(
                Command::Insert(InsertArgs {
                    record: record_path.clone(),
                }),
                &repository,
            )
            .await,
        );
        assert_eq!(again["inserted"], json!(false));

        let shown = must(
            run_command(
                Command::Show(ShowArgs {
                    command_id: command_id.to_string(),
                    fragments: "core,status".to_string(),
                }),
                &repository,
            )
            .await,
        );
        assert_eq!(shown["core"]["created_time"], json!(created));
        assert_eq!(shown["status"].as_array().map(Vec::len), Some(1));
        assert!(shown.get("audit").is_none());

        let receipt = must(
            LeaseReceipt::new(
                command_id,
                agent_id,
                asset_group_id,
                SubjectType::Msa,
                PrivacyCommandType::Export,
            )
            .serialize()
            .map_err(Into::into),
        );
        let complete = must(
            run_command(
                Command::LeaseReceipt {
                    command: LeaseReceiptCommand::IsComplete {
                        receipt: receipt.clone(),
                    },
                },
                &repository,
            )
            .await,
        );
        assert_eq!(complete["complete"], json!(true));

        let command = must(
            run_command(
                Command::LeaseReceipt {
                    command: LeaseReceiptCommand::Command { receipt },
                },
                &repository,
            )
            .await,
        );
        assert_eq!(command["raw_payload"], json!({"verb": "export"}));
        assert_eq!(
            command["export_destination"]["destination_uri"],
            json!("https://exports.example/c")
        );

        let missing = must(
            run_command(
                Command::Show(ShowArgs {
                    command_id: CommandId::random().to_string(),
                    fragments: "all".to_string(),
                }),
                &repository,
            )
            .await,
        );
        assert_eq!(missing, Value::Null);

        drop(repository);
        let _ = fs::remove_file(&record_path);
        let _ = fs::remove_file(&db);
    }

    #[tokio::test]
    async fn window_scans_report_records_and_continuations() {
        let (repository, db) = fixture_repository();
        let created = now_rfc3339();
        let (record_path, command_id, _, _) = write_record_file(&created);
        must(
            run_command(
                Command::Insert(InsertArgs {
                    record: record_path.clone(),
                }),
                &repository,
            )
            .await,
        );

        let start = "2000-01-01T00:00:00Z".to_string();
        let end = "2999-01-01T00:00:00Z".to_string();
        let incomplete = must(
            run_command(
                Command::IncompleteExports(IncompleteExportsArgs {
                    start: start.clone(),
                    end: end.clone(),
                    aad: false,
                    fragments: "core".to_string(),
                }),
                &repository,
            )
            .await,
        );
        assert_eq!(incomplete["count"], json!(1));
        assert_eq!(incomplete["records"][0]["command_id"], json!(command_id));

        let replay = must(
            run_command(
                Command::Replay(ReplayArgs {
                    start: start.clone(),
                    end: end.clone(),
                    subject_type: None,
                    exclude_subject_type: None,
                    export_only: false,
                    continuation: None,
                }),
                &repository,
            )
            .await,
        );
        assert_eq!(replay["count"], json!(0));
        assert_eq!(replay["continuation"], Value::Null);

        let lagging = must(
            run_command(
                Command::PartiallyIngested(PartiallyIngestedArgs {
                    start,
                    end,
                    exports_only: true,
                    non_exports_only: false,
                    max_items: Some(10),
                    continuation: None,
                }),
                &repository,
            )
            .await,
        );
        assert_eq!(lagging["count"], json!(1));

        let reversed = run_command(
            Command::IncompleteExports(IncompleteExportsArgs {
                start: "2026-02-07T00:00:00Z".to_string(),
                end: "2026-02-01T00:00:00Z".to_string(),
                aad: false,
                fragments: "core".to_string(),
            }),
            &repository,
        )
        .await;
        assert!(reversed.is_err());

        drop(repository);
        let _ = fs::remove_file(&record_path);
        let _ = fs::remove_file(&db);
    }
}
