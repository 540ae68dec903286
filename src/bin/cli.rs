//! Binary entry point for the sombra-transport cache CLI.
#![forbid(unsafe_code)]

#[path = "cli/ui.rs"]
mod ui;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sombra_transport::{
    admin::{open_cache, stats, verify, AdminOpenOptions, VerifyLevel},
    cache::LocalCache,
    config::TransportConfig,
    logging::init_logging,
    model::TypeRegistry,
    pipeline::{ReceivePipeline, ReceiveReport},
    remote::{CachePeer, RemoteObjectManager},
    ObjectId,
};
use tokio_util::sync::CancellationToken;
use ui::{format_bytes, format_duration, Theme, Ui};

#[derive(Parser, Debug)]
#[command(
    name = "sombra-transport",
    version,
    about = "Inspect and move content-addressed object caches",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = "SOMBRA_TRANSPORT_CACHE",
        help = "Local cache database (defaults to the configured or platform path)"
    )]
    cache: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "FILE",
        help = "Configuration file (defaults to the platform config directory)"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "FILTER",
        help = "Log filter, e.g. info or sombra_transport=debug"
    )]
    log_level: Option<String>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = ThemeArg::Auto,
        help = "Color theme for text output"
    )]
    theme: ThemeArg,

    #[arg(long, short, global = true, help = "Suppress spinners and decorations")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Print record counts and file sizes")]
    Stats,

    #[command(about = "List stored object ids in id order")]
    List {
        #[arg(long, default_value_t = 100, help = "Maximum number of ids to print")]
        limit: usize,
    },

    #[command(about = "Print the stored record for an object id")]
    Get {
        #[arg(value_name = "ID")]
        id: String,
    },

    #[command(about = "Check records against their ids and closures")]
    Verify {
        #[arg(
            long,
            value_enum,
            default_value_t = VerifyLevelArg::Fast,
            help = "Verification level"
        )]
        level: VerifyLevelArg,
    },

    #[command(about = "Receive an object graph from another cache file into the local cache")]
    Pull {
        #[arg(value_name = "SOURCE", help = "Cache database to read from")]
        source: PathBuf,

        #[arg(value_name = "ID")]
        id: String,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ThemeArg {
    Auto,
    Light,
    Dark,
    Plain,
}

impl From<ThemeArg> for Theme {
    fn from(theme: ThemeArg) -> Self {
        match theme {
            ThemeArg::Auto => Theme::Auto,
            ThemeArg::Light => Theme::Light,
            ThemeArg::Dark => Theme::Dark,
            ThemeArg::Plain => Theme::Plain,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum VerifyLevelArg {
    Fast,
    Full,
}

impl From<VerifyLevelArg> for VerifyLevel {
    fn from(level: VerifyLevelArg) -> Self {
        match level {
            VerifyLevelArg::Fast => VerifyLevel::Fast,
            VerifyLevelArg::Full => VerifyLevel::Full,
        }
    }
}

#[derive(Debug, Serialize)]
struct ListEntry {
    id: ObjectId,
    speckle_type: Option<String>,
    bytes: u64,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = TransportConfig::load(cli.config.clone())?;
    init_logging(cli.log_level.as_deref().unwrap_or(config.log_level()))?;

    let ui = Ui::new(cli.theme.into(), cli.quiet || cli.format == OutputFormat::Json);
    let open_opts = AdminOpenOptions {
        cache: config.cache_options(),
        create_if_missing: false,
    };
    let cache_path = cli
        .cache
        .clone()
        .or_else(|| config.cache_path())
        .ok_or("no cache path configured and no platform data directory found")?;

    match cli.command {
        Command::Stats => {
            let report = stats(&cache_path, &open_opts)?;
            emit(&cli.format, &report, |_| print_stats_text(&ui, &report))?;
        }
        Command::List { limit } => {
            let cache = open_cache(&cache_path, &open_opts)?;
            let entries = list_entries(&cache, limit)?;
            emit(&cli.format, &entries, |_| print_list_text(&ui, &entries))?;
        }
        Command::Get { id } => {
            let id = ObjectId::parse(&id)?;
            let cache = open_cache(&cache_path, &open_opts)?;
            let json = cache
                .get(&id)?
                .ok_or_else(|| format!("object {id} is not in the cache"))?;
            match cli.format {
                OutputFormat::Json => {
                    let value: serde_json::Value = serde_json::from_str(&json)?;
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                OutputFormat::Text => println!("{json}"),
            }
        }
        Command::Verify { level } => {
            let report = verify(&cache_path, &open_opts, level.into())?;
            emit(&cli.format, &report, |_| print_verify_text(&ui, &report))?;
            if !report.success {
                std::process::exit(2);
            }
        }
        Command::Pull { source, id } => {
            let id = ObjectId::parse(&id)?;
            let local = open_shared(&cache_path, &open_opts.clone().create_if_missing(true))?;
            let peer: Arc<dyn RemoteObjectManager> =
                Arc::new(CachePeer::new(open_shared(&source, &open_opts)?));
            let registry = Arc::new(TypeRegistry::new().with_dynamic_fallback(true));

            let task = ui.task(format!("pulling {id}"));
            let options = config.pipeline_options().progress(task.reporter());
            let pipeline = ReceivePipeline::new(local, peer, registry, options)?;
            let received = pipeline.receive(&id, cancel_on_ctrl_c()).await?;
            task.finish();

            let report = received.report;
            emit(&cli.format, &report, |_| print_receive_text(&ui, &report))?;
        }
    }

    Ok(())
}

fn open_shared(path: &Path, opts: &AdminOpenOptions) -> Result<Arc<dyn LocalCache>, Box<dyn Error>> {
    Ok(Arc::new(open_cache(path, opts)?))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}

fn list_entries(cache: &dyn LocalCache, limit: usize) -> Result<Vec<ListEntry>, Box<dyn Error>> {
    let mut entries = Vec::new();
    for entry in cache.enumerate().take(limit) {
        let (id, json) = entry?;
        let speckle_type = serde_json::from_str::<serde_json::Value>(&json)
            .ok()
            .and_then(|value| {
                value
                    .get("speckle_type")
                    .and_then(|t| t.as_str())
                    .map(str::to_string)
            });
        entries.push(ListEntry {
            id,
            speckle_type,
            bytes: json.len() as u64,
        });
    }
    Ok(entries)
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

fn print_stats_text(ui: &Ui, report: &sombra_transport::admin::StatsReport) {
    ui.section(
        "Cache",
        [
            ("records", report.cache.records.to_string()),
            ("content", format_bytes(report.cache.content_bytes)),
            ("largest", format_bytes(report.cache.largest_record_bytes)),
            ("unreadable", report.cache.unreadable.to_string()),
        ],
    );
    ui.section(
        "Types",
        report
            .cache
            .types
            .iter()
            .map(|(name, count)| (name.as_str(), count.to_string())),
    );
    ui.section(
        "Filesystem",
        [
            ("db_path", report.filesystem.db_path.clone()),
            ("db_size", format_bytes(report.filesystem.db_size_bytes)),
            ("wal_path", report.filesystem.wal_path.clone()),
            ("wal_size", format_bytes(report.filesystem.wal_size_bytes)),
        ],
    );
}

fn print_list_text(ui: &Ui, entries: &[ListEntry]) {
    if entries.is_empty() {
        ui.warn("cache is empty");
        return;
    }
    ui.list(
        "Objects",
        entries.iter().map(|entry| {
            format!(
                "{} {} ({})",
                entry.id,
                entry.speckle_type.as_deref().unwrap_or("?"),
                format_bytes(entry.bytes)
            )
        }),
    );
}

fn print_verify_text(ui: &Ui, report: &sombra_transport::admin::VerifyReport) {
    ui.section(
        &format!("Verify ({:?})", report.level),
        [
            ("success", report.success.to_string()),
            ("records_scanned", report.counts.records_scanned.to_string()),
            ("hash_mismatches", report.counts.hash_mismatches.to_string()),
            ("malformed", report.counts.malformed.to_string()),
            ("closure_ids", report.counts.closure_ids.to_string()),
            (
                "missing_closure_ids",
                report.counts.missing_closure_ids.to_string(),
            ),
        ],
    );
    ui.list(
        "Findings",
        report
            .findings
            .iter()
            .map(|finding| format!("{:?}: {}", finding.severity, finding.message)),
    );
}

fn print_receive_text(ui: &Ui, report: &ReceiveReport) {
    ui.success(&format!(
        "received {} in {}",
        report.root_id,
        format_duration(std::time::Duration::from_millis(report.elapsed_ms))
    ));
    ui.section(
        "Receive",
        [
            ("closure", report.closure_size.to_string()),
            ("cache_hits", report.cache_hits.to_string()),
            ("downloaded", report.downloaded_objects.to_string()),
            ("download_bytes", format_bytes(report.downloaded_bytes)),
            ("deserialized", report.deserialized.to_string()),
        ],
    );
}
