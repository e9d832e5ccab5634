//! CLI command definitions, routing, and tracing setup.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use siteport_collaborators::{Collaborators, HtmlAnalyzer, HttpGateway};
use siteport_core::MigrationService;
use siteport_shared::{
    AppConfig, Decision, EventStatus, GapReport, JobSession, PipelineConfig, ProgressEvent,
    SessionId, SessionStatus, expand_home, gateway_token, init_config, load_config,
};
use siteport_storage::KnowledgeStore;
use tokio::sync::broadcast;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// siteport: migrate a website onto a component-based target platform.
#[derive(Parser)]
#[command(
    name = "siteport",
    version,
    about = "Migrate a website onto a component-based platform with measured, reviewable fidelity.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Where source sites are analyzed.
    #[arg(long, value_enum, default_value = "html", global = true)]
    pub analyzer: AnalyzerKind,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum AnalyzerKind {
    /// Built-in static HTML analyzer.
    Html,
    /// The collaborator gateway's `/analyze`.
    Gateway,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Start a migration and follow it until it finishes or pauses for review.
    Run {
        /// Source site: an http(s) URL or a local HTML file.
        source: String,
    },

    /// Show the state of a session.
    Status {
        session: SessionId,

        /// Print the raw session record as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the gap report of a session.
    Gaps {
        session: SessionId,

        #[arg(long)]
        json: bool,
    },

    /// Record a review decision on one gap item.
    Decide {
        session: SessionId,

        /// Source element id of the gap item.
        element: String,

        /// accept, alternative, exclude, or manual.
        decision: Decision,
    },

    /// Continue a paused or interrupted session.
    Resume { session: SessionId },

    /// Cancel a session.
    Cancel { session: SessionId },

    /// Replay the progress events of a session.
    Events {
        session: SessionId,

        /// Only events after this sequence number.
        #[arg(long, default_value_t = 0)]
        since: u64,
    },

    /// List all sessions.
    Jobs,

    /// Probe component capabilities now.
    Probe {
        /// Probe even if the envelopes are still fresh.
        #[arg(long)]
        force: bool,
    },

    /// List recorded migration knowledge.
    Knowledge {
        /// Only entries for this pattern key (e.g. `hero:body+heading`).
        #[arg(long)]
        pattern: Option<String>,
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
        0 => "siteport=warn",
        1 => "siteport=info",
        _ => "siteport=debug",
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
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let analyzer = cli.analyzer;
    match cli.command {
        Command::Run { source } => cmd_run(analyzer, &source).await,
        Command::Status { session, json } => cmd_status(analyzer, session, json).await,
        Command::Gaps { session, json } => cmd_gaps(analyzer, session, json).await,
        Command::Decide {
            session,
            element,
            decision,
        } => cmd_decide(analyzer, session, &element, decision).await,
        Command::Resume { session } => cmd_resume(analyzer, session).await,
        Command::Cancel { session } => cmd_cancel(analyzer, session).await,
        Command::Events { session, since } => cmd_events(analyzer, session, since).await,
        Command::Jobs => cmd_jobs(analyzer).await,
        Command::Probe { force } => cmd_probe(analyzer, force).await,
        Command::Knowledge { pattern } => cmd_knowledge(analyzer, pattern.as_deref()).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Open the store and wire the service from the user's config.
async fn open_service(analyzer: AnalyzerKind) -> Result<MigrationService> {
    let config: AppConfig = load_config()?;
    let timeout = PipelineConfig::from(&config).call_timeout;

    let gateway = Arc::new(HttpGateway::new(
        &config.collaborator.gateway_url,
        gateway_token(&config),
        timeout,
    )?);
    let mut collaborators = Collaborators::gateway(gateway);
    if let AnalyzerKind::Html = analyzer {
        collaborators = collaborators.with_analyzer(Arc::new(HtmlAnalyzer::new(timeout)?));
    }

    let db_path = expand_home(&config.defaults.database_path)?;
    debug!(path = %db_path.display(), "opening knowledge store");
    let store = Arc::new(KnowledgeStore::open(&db_path).await?);
    Ok(MigrationService::from_config(&config, store, collaborators)?)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(analyzer: AnalyzerKind, source: &str) -> Result<()> {
    let service = open_service(analyzer).await?;
    let events = service.subscribe();

    info!(source, "starting migration");
    let id = service.start_job(source).await?;
    println!("Session {id}");

    let session = follow(&service, id, events).await?;
    print_outcome(&service, &session).await
}

async fn cmd_status(analyzer: AnalyzerKind, id: SessionId, json: bool) -> Result<()> {
    let service = open_service(analyzer).await?;
    let session = service.get_job_status(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
        return Ok(());
    }

    println!();
    println!("  Session: {}", session.id);
    println!("  Source:  {}", session.source);
    println!("  Status:  {}", session.summary());
    println!("  Phase:   {}", session.phase);
    println!("  Updated: {}", session.updated_at.format("%Y-%m-%d %H:%M:%S"));
    for warning in &session.warnings {
        println!("  Warning: [{}] {}", warning.phase, warning.message);
    }
    if let Some(failure) = &session.failure {
        println!("  Failure: [{}] {}", failure.phase, failure.message);
    }
    println!();
    Ok(())
}

async fn cmd_gaps(analyzer: AnalyzerKind, id: SessionId, json: bool) -> Result<()> {
    let service = open_service(analyzer).await?;
    let report = service.get_gap_report(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_gap_report(&report);
    }
    Ok(())
}

async fn cmd_decide(
    analyzer: AnalyzerKind,
    id: SessionId,
    element: &str,
    decision: Decision,
) -> Result<()> {
    let service = open_service(analyzer).await?;
    let events = service.subscribe();

    let change = service.submit_review_decision(id, element, decision).await?;
    println!("{element}: {decision} ({change:?})");

    let session = service.get_job_status(id).await?;
    if session.status == SessionStatus::Running {
        println!("All items decided, resuming.");
        let session = follow(&service, id, events).await?;
        return print_outcome(&service, &session).await;
    }

    let report = service.get_gap_report(id).await?;
    println!("{} items still pending.", report.pending_count());
    Ok(())
}

async fn cmd_resume(analyzer: AnalyzerKind, id: SessionId) -> Result<()> {
    let service = open_service(analyzer).await?;
    let events = service.subscribe();

    service.resume_job(id).await?;
    let session = follow(&service, id, events).await?;
    print_outcome(&service, &session).await
}

async fn cmd_cancel(analyzer: AnalyzerKind, id: SessionId) -> Result<()> {
    let service = open_service(analyzer).await?;
    let session = service.cancel_job(id).await?;
    println!("Session {id}: {}", session.summary());
    Ok(())
}

async fn cmd_events(analyzer: AnalyzerKind, id: SessionId, since: u64) -> Result<()> {
    let service = open_service(analyzer).await?;
    for event in service.events_since(id, since).await? {
        println!(
            "{:>4}  {}  {:<13} {:<10} {}",
            event.seq,
            event.at.format("%H:%M:%S"),
            event.phase.as_str(),
            event.status.as_str(),
            event.detail
        );
    }
    Ok(())
}

async fn cmd_jobs(analyzer: AnalyzerKind) -> Result<()> {
    let service = open_service(analyzer).await?;
    let jobs = service.list_jobs().await?;
    if jobs.is_empty() {
        println!("No sessions yet.");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}  {}  {:<28} {}",
            job.id,
            job.created_at.format("%Y-%m-%d %H:%M"),
            job.summary(),
            job.source
        );
    }
    Ok(())
}

async fn cmd_probe(analyzer: AnalyzerKind, force: bool) -> Result<()> {
    let service = open_service(analyzer).await?;
    let spinner = spinner();
    spinner.set_message("Probing component capabilities");

    let summary = service.probe_now(force).await?;
    spinner.finish_and_clear();

    println!("{}", summary.describe());
    for (component, version) in &summary.probed {
        println!("  {component:<24} envelope v{version}");
    }
    for (component, error) in &summary.failures {
        println!("  {component:<24} failed: {error}");
    }
    Ok(())
}

async fn cmd_knowledge(analyzer: AnalyzerKind, pattern: Option<&str>) -> Result<()> {
    let service = open_service(analyzer).await?;
    let entries = match pattern {
        Some(p) => service.pipeline().context().store.knowledge_for_pattern(p).await?,
        None => service.knowledge().await?,
    };
    if entries.is_empty() {
        println!("No knowledge recorded yet.");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{:<32} -> {:<20} {:.2}  {}",
            entry.pattern_key,
            entry.successful_component,
            entry.fidelity_observed,
            entry.recorded_at.format("%Y-%m-%d")
        );
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Progress display
// ---------------------------------------------------------------------------

fn spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        spinner.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

/// Show live progress until the background run stops. Ctrl-C cancels it.
async fn follow(
    service: &MigrationService,
    id: SessionId,
    mut events: broadcast::Receiver<ProgressEvent>,
) -> Result<JobSession> {
    let spinner = spinner();
    let wait = service.wait(id);
    tokio::pin!(wait);

    let session = loop {
        tokio::select! {
            session = &mut wait => break session?,
            event = events.recv() => match event {
                Ok(event) if event.session_id == id => show_event(&spinner, &event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "progress display lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break (&mut wait).await?,
            },
            _ = tokio::signal::ctrl_c() => {
                spinner.set_message("Cancelling…");
                service.cancel_job(id).await?;
            }
        }
    };

    spinner.finish_and_clear();
    Ok(session)
}

fn show_event(spinner: &ProgressBar, event: &ProgressEvent) {
    match event.status {
        EventStatus::Started => spinner.set_message(format!("{}…", event.phase)),
        EventStatus::Completed | EventStatus::Skipped => {
            spinner.println(format!("  ✓ {:<13} {}", event.phase.as_str(), event.detail));
        }
        EventStatus::Warning | EventStatus::Retrying => {
            spinner.println(format!("  ! {:<13} {}", event.phase.as_str(), event.detail));
        }
        EventStatus::Failed => {
            spinner.println(format!("  ✗ {:<13} {}", event.phase.as_str(), event.detail));
        }
        EventStatus::Paused | EventStatus::Resumed | EventStatus::Cancelled | EventStatus::Done => {
            spinner.println(format!("  • {}", event.detail));
        }
    }
}

async fn print_outcome(service: &MigrationService, session: &JobSession) -> Result<()> {
    println!();
    println!("  Session: {}", session.id);
    println!("  Result:  {}", session.summary());

    match session.status {
        SessionStatus::PausedForReview => {
            let report = service.get_gap_report(session.id).await?;
            print_gap_report(&report);
            println!("  Record decisions with: siteport decide {} <element> <decision>", session.id);
            println!();
            Ok(())
        }
        SessionStatus::Failed => {
            let reason = session
                .failure
                .as_ref()
                .map(|f| f.message.clone())
                .unwrap_or_default();
            Err(eyre!("migration failed at phase {}: {reason}", session.phase))
        }
        _ => {
            println!();
            Ok(())
        }
    }
}

fn print_gap_report(report: &GapReport) {
    println!();
    println!(
        "  Gap report: {} items, {} pending (acceptability {:.2})",
        report.items.len(),
        report.pending_count(),
        report.acceptability_threshold
    );
    for item in &report.items {
        println!(
            "  - {:<20} {:<18} {:.2}  [{}]",
            item.source_element_id, item.component_used, item.fidelity_score, item.decision
        );
        for compromise in &item.compromises {
            println!("      {compromise}");
        }
    }
    println!();
}
