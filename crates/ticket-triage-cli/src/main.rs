use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use ticket_triage_api::{
    migrate_store, AnnotationRequest, ClassifySelection, IngestRequest, SummaryTarget,
    TicketTextRequest, TriageApi, TriageConfig,
};
use ticket_triage_core::{PageScope, ResetTarget, TicketId, Urgency, ViewQuery};
use ticket_triage_store_sqlite::SqliteStore;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "tt")]
#[command(about = "Ticket triage CLI")]
struct Cli {
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[arg(long, global = true)]
    classifier_url: Option<String>,
    #[arg(long, global = true)]
    feed_url: Option<String>,
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    #[command(flatten)]
    Page(PageCommand),
}

#[derive(Debug, Subcommand)]
enum PageCommand {
    Tickets {
        #[command(subcommand)]
        command: Box<TicketsCommand>,
    },
    Classify(ClassifyArgs),
    Summary(SummaryArgs),
    ResetClassification(ResetClassificationArgs),
    Reset(PageArg),
    State(PageArg),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
    Pages,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct PageArg {
    #[arg(long, value_parser = parse_page)]
    page: PageScope,
}

#[derive(Debug, Subcommand)]
enum TicketsCommand {
    List(ListArgs),
    Add(AddArgs),
    Edit(EditArgs),
    Remove(TicketArgs),
    Flag(FlagArgs),
    Ingest(IngestArgs),
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, value_parser = parse_page)]
    page: PageScope,
    #[arg(long, value_parser = parse_urgency)]
    urgency: Option<Urgency>,
    #[arg(long, default_value_t = 1)]
    page_number: usize,
    #[arg(long, default_value_t = ticket_triage_core::DEFAULT_PAGE_SIZE)]
    page_size: usize,
    /// Every ticket, most severe first, instead of a filtered page.
    #[arg(long, default_value_t = false)]
    by_urgency: bool,
}

#[derive(Debug, Args)]
struct AddArgs {
    #[arg(long, value_parser = parse_page)]
    page: PageScope,
    #[arg(long)]
    customer: String,
    #[arg(long)]
    message: String,
}

#[derive(Debug, Args)]
struct EditArgs {
    #[arg(long, value_parser = parse_page)]
    page: PageScope,
    #[arg(long, value_parser = parse_ticket_id)]
    id: TicketId,
    #[arg(long)]
    customer: String,
    #[arg(long)]
    message: String,
}

#[derive(Debug, Args)]
struct TicketArgs {
    #[arg(long, value_parser = parse_page)]
    page: PageScope,
    #[arg(long, value_parser = parse_ticket_id)]
    id: TicketId,
}

#[derive(Debug, Args)]
struct FlagArgs {
    #[arg(long, value_parser = parse_page)]
    page: PageScope,
    #[arg(long, value_parser = parse_ticket_id)]
    id: TicketId,
    /// Omit to clear the flag.
    #[arg(long)]
    set: Option<bool>,
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long, value_parser = parse_page)]
    page: PageScope,
    /// NDJSON file of objects keyed by column header; `-` reads stdin.
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = false)]
    replace: bool,
}

#[derive(Debug, Args)]
struct ClassifyArgs {
    #[arg(long, value_parser = parse_page)]
    page: PageScope,
    #[arg(
        long = "id",
        value_parser = parse_ticket_id,
        conflicts_with = "all",
        required_unless_present = "all"
    )]
    ids: Vec<TicketId>,
    #[arg(long, default_value_t = false)]
    all: bool,
}

#[derive(Debug, Args)]
struct SummaryArgs {
    #[arg(long, value_parser = parse_page)]
    page: PageScope,
    /// Summarize only these tickets instead of every classified one.
    #[arg(long = "id", value_parser = parse_ticket_id)]
    ids: Vec<TicketId>,
}

#[derive(Debug, Args)]
struct ResetClassificationArgs {
    #[arg(long, value_parser = parse_page)]
    page: PageScope,
    #[arg(
        long = "id",
        value_parser = parse_ticket_id,
        conflicts_with = "all",
        required_unless_present = "all"
    )]
    ids: Vec<TicketId>,
    #[arg(long, default_value_t = false)]
    all: bool,
}

fn parse_page(raw: &str) -> Result<PageScope, String> {
    PageScope::parse(raw).ok_or_else(|| {
        format!("unknown page `{raw}`, expected support_tickets, customers or urgency_levels")
    })
}

fn parse_urgency(raw: &str) -> Result<Urgency, String> {
    Urgency::parse(&raw.trim().to_ascii_lowercase())
        .ok_or_else(|| format!("unknown urgency `{raw}`"))
}

fn parse_ticket_id(raw: &str) -> Result<TicketId, String> {
    TicketId::parse(raw).map_err(|err| err.to_string())
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value)?)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = TriageConfig::from_env()
        .with_db_path(cli.db)
        .with_classifier_url(cli.classifier_url)
        .with_feed_url(cli.feed_url)
        .with_timeout_ms(cli.timeout_ms);
    debug!(db = %config.db_path.display(), "resolved configuration");

    match cli.command {
        Command::Db { command } => run_db(command, &config),
        Command::Page(command) => {
            let api = TriageApi::open(config)?;
            let result = run_page_command(command, &api);
            api.shutdown()?;
            result
        }
    }
}

fn run_db(command: DbCommand, config: &TriageConfig) -> Result<()> {
    let mut store = SqliteStore::open(&config.db_path)?;
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => emit(&migrate_store(&mut store, args.dry_run)?),
        DbCommand::Backup(args) => {
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_written": true,
                "out": args.out.display().to_string()
            }))
        }
        DbCommand::IntegrityCheck => emit(&store.integrity_check()?),
        DbCommand::Pages => emit_json(serde_json::json!({ "pages": store.list_pages()? })),
    }
}

fn run_page_command(command: PageCommand, api: &TriageApi) -> Result<()> {
    match command {
        PageCommand::Tickets { command } => run_tickets(*command, api),
        PageCommand::Classify(args) => {
            let selection = if args.all {
                ClassifySelection::All
            } else {
                ClassifySelection::Ids(args.ids)
            };
            emit(&api.classify(args.page, Some(&selection))?)
        }
        PageCommand::Summary(args) => {
            let summary = if args.ids.is_empty() {
                api.summary(args.page, SummaryTarget::Classified)?
            } else {
                api.set_selection(args.page, &args.ids)?;
                api.summary(args.page, SummaryTarget::Selection)?
            };
            emit(&summary)
        }
        PageCommand::ResetClassification(args) => {
            let target = if args.all { ResetTarget::All } else { ResetTarget::Ids(args.ids) };
            emit(&api.reset_classification(args.page, &target)?)
        }
        PageCommand::Reset(args) => emit(&api.reset_page(args.page)?),
        PageCommand::State(args) => emit(&api.page_state(args.page)?),
    }
}

fn run_tickets(command: TicketsCommand, api: &TriageApi) -> Result<()> {
    match command {
        TicketsCommand::List(args) => {
            if args.by_urgency {
                return emit_json(serde_json::json!({
                    "page": args.page,
                    "items": api.tickets_by_urgency(args.page)?
                }));
            }
            let query = ViewQuery {
                urgency: args.urgency,
                page: args.page_number,
                page_size: args.page_size,
            };
            emit(&api.list_tickets(args.page, &query)?)
        }
        TicketsCommand::Add(args) => {
            let request = TicketTextRequest { customer: args.customer, message: args.message };
            emit(&api.add_ticket(args.page, &request)?)
        }
        TicketsCommand::Edit(args) => {
            let request = TicketTextRequest { customer: args.customer, message: args.message };
            emit(&api.edit_ticket(args.page, &args.id, &request)?)
        }
        TicketsCommand::Remove(args) => emit(&api.remove_ticket(args.page, &args.id)?),
        TicketsCommand::Flag(args) => {
            let request = AnnotationRequest { flag: args.set };
            emit(&api.set_annotation(args.page, &args.id, &request)?)
        }
        TicketsCommand::Ingest(args) => {
            let rows = read_ndjson_rows(&args.input)?;
            emit(&api.ingest(args.page, &IngestRequest { rows, replace: args.replace })?)
        }
    }
}

/// Each non-blank line is one JSON object mapping column header to cell.
/// Non-string cells are kept in their JSON text form.
fn read_ndjson_rows(input: &Path) -> Result<Vec<BTreeMap<String, String>>> {
    let reader: Box<dyn BufRead> = if input.as_os_str() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = fs::File::open(input)
            .with_context(|| format!("failed to open ingest file {}", input.display()))?;
        Box::new(BufReader::new(file))
    };

    let mut rows = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read ingest line {}", index + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)
            .with_context(|| format!("ingest line {} is not valid JSON", index + 1))?;
        let Value::Object(object) = value else {
            return Err(anyhow!("ingest line {} is not a JSON object", index + 1));
        };
        let row = object
            .into_iter()
            .map(|(column, cell)| {
                let cell = match cell {
                    Value::String(text) => text,
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                (column, cell)
            })
            .collect();
        rows.push(row);
    }
    Ok(rows)
}
