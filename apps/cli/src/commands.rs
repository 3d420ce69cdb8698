//! CLI command definitions, routing, and tracing setup.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use hackcrawl_core::{CrawlEngine, Phase, ProgressReporter, RecordOutcome, RunSummary};
use hackcrawl_crawler::GraphqlSource;
use hackcrawl_shared::{
    AppConfig, ChildRecord, CrawlConfig, ParentRecord, RecordKind, RecordState, init_config,
    load_config, load_config_from, resolve_db_path, session_cookie,
};
use hackcrawl_storage::{IdentityStore, Storage};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// hackcrawl: resumable hackathon and project crawler.
#[derive(Parser)]
#[command(
    name = "hackcrawl",
    version,
    about = "Crawl hackathons and their projects into a local store, safely resumable after interruption.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.hackcrawl/hackcrawl.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overriding `storage.db_path`.
    #[arg(long, global = true, env = "HACKCRAWL_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Which part of the pipeline `crawl` runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum Mode {
    /// Page the listing and record new hackathons only.
    DiscoverParents,
    /// Fetch details of discovered hackathons.
    DetailParents,
    /// Crawl projects of detailed hackathons.
    DetailChildren,
    /// Everything, hackathon by hackathon.
    Full,
}

impl From<Mode> for Phase {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::DiscoverParents => Phase::DiscoverParents,
            Mode::DetailParents => Phase::DetailParents,
            Mode::DetailChildren => Phase::DetailChildren,
            Mode::Full => Phase::Full,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a crawl.
    Crawl {
        /// Pipeline slice to run.
        #[arg(short, long, value_enum, default_value_t = Mode::Full)]
        mode: Mode,

        /// First listing page to request.
        #[arg(long)]
        start_page: Option<u32>,

        /// Stop after this many listing pages.
        #[arg(long)]
        max_pages: Option<u32>,

        /// Hackathons processed concurrently.
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Projects of one hackathon fetched concurrently.
        #[arg(long)]
        child_concurrency: Option<usize>,
    },

    /// Show record counts per state and failure-ledger size.
    Status,

    /// Write processed hackathons and their processed projects as JSON lines.
    Export {
        /// Output file (defaults to stdout).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "hackcrawl=info",
        1 => "hackcrawl=debug",
        _ => "hackcrawl=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => resolve_db_path(&config)?,
    };

    match cli.command {
        Command::Crawl {
            mode,
            start_page,
            max_pages,
            concurrency,
            child_concurrency,
        } => {
            let mut crawl = CrawlConfig::from(&config);
            if let Some(page) = start_page {
                crawl.start_page = page;
            }
            if max_pages.is_some() {
                crawl.max_pages = max_pages;
            }
            if let Some(n) = concurrency {
                crawl.parent_concurrency = n;
            }
            if let Some(n) = child_concurrency {
                crawl.child_concurrency = n;
            }
            cmd_crawl(&config, crawl, &db_path, mode.into()).await
        }
        Command::Status => cmd_status(&config, &db_path).await.map(|()| ExitCode::SUCCESS),
        Command::Export { out } => cmd_export(&db_path, out.as_deref())
            .await
            .map(|()| ExitCode::SUCCESS),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().map(|()| ExitCode::SUCCESS),
            ConfigAction::Show => cmd_config_show(&config).map(|()| ExitCode::SUCCESS),
        },
    }
}

// ---------------------------------------------------------------------------
// crawl
// ---------------------------------------------------------------------------

async fn cmd_crawl(
    config: &AppConfig,
    crawl: CrawlConfig,
    db_path: &Path,
    phase: Phase,
) -> Result<ExitCode> {
    let cookie = session_cookie(&config.source);
    if cookie.is_none() {
        info!(
            cookie_env = %config.source.cookie_env,
            "no session cookie set, crawling anonymously"
        );
    }
    let source = Arc::new(GraphqlSource::new(&config.source, cookie)?);
    let store = Arc::new(Storage::open(db_path).await?);
    let engine = CrawlEngine::new(source, store, crawl)?;

    info!(db = %db_path.display(), %phase, "starting crawl");

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping at the next record boundary");
            on_interrupt.cancel();
        }
    });

    let reporter = CliProgress::new();
    let summary = engine.run(phase, &reporter, &cancel).await?;
    print_summary(&summary);

    if let Some(reason) = &summary.aborted {
        warn!(%reason, "run aborted");
    }
    Ok(ExitCode::from(exit_status(&summary)))
}

/// Process status for a finished run: 0 only when it ran to completion,
/// 130 when interrupted, 2 when listing failures aborted it.
fn exit_status(summary: &RunSummary) -> u8 {
    if summary.cancelled {
        130
    } else if summary.is_aborted() {
        2
    } else {
        0
    }
}

fn print_summary(summary: &RunSummary) {
    let status = if summary.cancelled {
        "cancelled"
    } else if summary.is_aborted() {
        "aborted"
    } else {
        "complete"
    };

    println!();
    println!("  Crawl {status} ({})", summary.phase);
    println!(
        "  Hackathons: {} created, {} updated, {} skipped, {} failed",
        summary.parents.created,
        summary.parents.updated,
        summary.parents.skipped,
        summary.parents.failed
    );
    println!(
        "  Projects:   {} created, {} updated, {} skipped, {} failed",
        summary.children.created,
        summary.children.updated,
        summary.children.skipped,
        summary.children.failed
    );
    println!(
        "  Pages:      {} listed, {} failed",
        summary.pages_listed, summary.pages_failed
    );
    if let Some(reason) = &summary.aborted {
        println!("  Aborted:    {reason}");
    }
    println!("  Time:       {:.1}s", summary.elapsed.as_secs_f64());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
    parents: AtomicU64,
    children: AtomicU64,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self {
            spinner,
            parents: AtomicU64::new(0),
            children: AtomicU64::new(0),
        }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn page_listed(&self, page: u32, records: usize) {
        self.spinner
            .set_message(format!("Listing page {page} ({records} hackathons)"));
    }

    fn record_done(&self, kind: RecordKind, external_id: &str, outcome: RecordOutcome) {
        let counter = match kind {
            RecordKind::Parent => &self.parents,
            RecordKind::Child => &self.children,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.spinner.set_message(format!(
            "[{} hackathons, {} projects] {kind} {external_id}: {outcome:?}",
            self.parents.load(Ordering::Relaxed),
            self.children.load(Ordering::Relaxed),
        ));
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// status / export
// ---------------------------------------------------------------------------

async fn cmd_status(config: &AppConfig, db_path: &Path) -> Result<()> {
    let store = Storage::open_readonly(db_path).await?;

    println!();
    println!("  Database: {}", db_path.display());
    for (label, kind) in [("Hackathons", RecordKind::Parent), ("Projects", RecordKind::Child)] {
        let counts = store.count_by_state(kind).await?;
        let count_of = |state: RecordState| {
            counts
                .iter()
                .find(|(s, _)| *s == state)
                .map_or(0, |(_, n)| *n)
        };
        println!(
            "  {label:<11} {} discovered, {} detailed, {} processed",
            count_of(RecordState::Discovered),
            count_of(RecordState::Detailed),
            count_of(RecordState::Processed)
        );
    }

    let failures = store.list_failures().await?;
    let permanent = failures
        .iter()
        .filter(|f| {
            f.kind == RecordKind::Child && f.attempts >= config.crawl.child_failure_limit
        })
        .count();
    println!(
        "  Failures:   {} recorded, {permanent} permanent",
        failures.len()
    );
    println!();
    Ok(())
}

/// One exported hackathon with its processed projects.
#[derive(Serialize)]
struct ExportLine<'a> {
    #[serde(flatten)]
    parent: &'a ParentRecord,
    children: Vec<&'a ChildRecord>,
}

async fn cmd_export(db_path: &Path, out: Option<&Path>) -> Result<()> {
    let store = Storage::open_readonly(db_path).await?;

    let written = match out {
        Some(path) => {
            let file = std::fs::File::create(path)
                .map_err(|e| eyre!("cannot create '{}': {e}", path.display()))?;
            let mut writer = std::io::BufWriter::new(file);
            let n = write_export(&store, &mut writer).await?;
            writer.flush()?;
            n
        }
        None => {
            let stdout = std::io::stdout();
            let mut writer = stdout.lock();
            write_export(&store, &mut writer).await?
        }
    };

    info!(hackathons = written, "export finished");
    Ok(())
}

/// Write every PROCESSED parent with its PROCESSED children, one JSON object
/// per line. Returns the number of lines written.
async fn write_export(store: &dyn IdentityStore, out: &mut dyn Write) -> Result<usize> {
    let parents = store.list_parents(RecordState::Processed).await?;

    for parent in &parents {
        let children = store.list_children_of(&parent.id).await?;
        let line = ExportLine {
            parent,
            children: children
                .iter()
                .filter(|c| c.state == RecordState::Processed)
                .collect(),
        };
        serde_json::to_writer(&mut *out, &line)?;
        out.write_all(b"\n")?;
    }
    Ok(parents.len())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}
