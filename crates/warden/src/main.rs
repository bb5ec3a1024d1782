//! Fleet Warden CLI
//!
//! Periodic health supervisor for the bot fleet: scans worker telemetry,
//! maintains the issue registry, applies the alert and remediation
//! policies, and renders scheduled briefings. Designed to be invoked
//! serially by an external scheduler (cron or a systemd timer).

mod alerts;
mod briefing;
mod config;
mod queue;
mod remediation;
mod rules;
mod runtime;
mod scan;
mod store;
mod telemetry;
mod types;

use anyhow::Result;
use chrono::{Timelike, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use crate::briefing::BriefingKind;
use crate::config::{RemediationPolicy, WardenConfig};
use crate::queue::{CommandQueue, FileQueue};
use crate::runtime::DockerRuntime;
use crate::scan::Supervisor;
use crate::store::StateStore;
use crate::telemetry::TelemetryReader;
use crate::types::{FleetState, HealthStatus, IssueRegistry};

/// Fleet health warden - scans bot telemetry, tracks issues and requests remediation
#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Fleet health warden - scans bot telemetry, tracks issues and requests remediation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (json or text)
    #[arg(long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Path to the main config document
    #[arg(long, default_value = "warden-config.json", global = true)]
    config: PathBuf,

    /// Path to the remediation policy document
    #[arg(long, default_value = "remediation-policy.json", global = true)]
    policy: PathBuf,

    /// Override the state directory from config
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Override the telemetry directory from config
    #[arg(long, global = true)]
    telemetry_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    Json,
    #[default]
    Text,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum BriefingArg {
    Morning,
    Evening,
}

impl From<BriefingArg> for BriefingKind {
    fn from(arg: BriefingArg) -> Self {
        match arg {
            BriefingArg::Morning => Self::Morning,
            BriefingArg::Evening => Self::Evening,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one full fleet scan
    Scan {
        /// Suppress alert and briefing delivery to the transport
        #[arg(long)]
        no_send: bool,
    },
    /// Render a briefing now (defaults to the kind matching the clock)
    Briefing {
        #[arg(value_enum)]
        kind: Option<BriefingArg>,

        /// Regenerate even if already generated today
        #[arg(long)]
        force: bool,

        /// Suppress transport delivery
        #[arg(long)]
        no_send: bool,
    },
    /// Show current fleet health and open issues
    Health,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("warden=debug")
            .init();
    }

    let mut config = WardenConfig::load(&cli.config)?;
    if let Some(state_dir) = cli.state_dir {
        config.paths.state_dir = state_dir;
    }
    if let Some(telemetry_dir) = cli.telemetry_dir {
        config.paths.telemetry_dir = telemetry_dir;
    }
    let policy = RemediationPolicy::load(&cli.policy)?;

    let store = StateStore::open(&config.paths.state_dir, &config.paths.telemetry_dir)?;
    let telemetry = TelemetryReader::new(config.paths.telemetry_dir.clone());
    let bridge = FileQueue::open(&config.paths.bridge_outbox)?;
    let commands = CommandQueue::open(&config.paths.command_queue)?;
    let docker = DockerRuntime::new();

    let now = Utc::now();

    match cli.command {
        Commands::Scan { no_send } => {
            let supervisor = Supervisor::new(
                &config, &policy, &store, &telemetry, &docker, &bridge, &commands,
            );
            let report = supervisor.run_scan(!no_send, now)?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text => print!("{}", scan::format_report_text(&report)),
            }
        }
        Commands::Briefing {
            kind,
            force,
            no_send,
        } => {
            let kind = kind.map_or_else(|| kind_for_now(&config), BriefingKind::from);
            let _lock = store.acquire_scan_lock(now)?;
            let mut state = store.read_state()?;
            let registry = store.read_issues()?;

            let tz = rules::resolve_timezone(&config.timezone);
            let today = now.with_timezone(&tz).date_naive();
            if !force && briefing::already_sent_today(kind, &state, today) {
                println!(
                    "{} briefing already generated today (use --force to regenerate)",
                    kind.as_str()
                );
                return Ok(());
            }

            let path = briefing::generate(
                kind, &store, &bridge, &mut state, &registry, &config, !no_send, now,
            )?;
            store.write_state(&state)?;
            println!("{} briefing written to {}", kind.as_str(), path.display());
        }
        Commands::Health => {
            let state = store.read_state()?;
            let registry = store.read_issues()?;
            match cli.format {
                OutputFormat::Json => {
                    let doc = serde_json::json!({
                        "bots": state.bots,
                        "open_issues": registry.open_issues(),
                    });
                    println!("{}", serde_json::to_string_pretty(&doc)?);
                }
                OutputFormat::Text => print_health(&state, &registry),
            }
        }
    }

    Ok(())
}

/// Pick the briefing kind matching the local clock: mornings before noon.
fn kind_for_now(config: &WardenConfig) -> BriefingKind {
    let tz = rules::resolve_timezone(&config.timezone);
    if Utc::now().with_timezone(&tz).hour() < 12 {
        BriefingKind::Morning
    } else {
        BriefingKind::Evening
    }
}

fn print_health(state: &FleetState, registry: &IssueRegistry) {
    if state.bots.is_empty() {
        println!("No bots scanned yet. Run `warden scan` first.");
        return;
    }

    println!(
        "{:<12} {:<8} {:<18} {:<10} {}",
        "BOT", "STATUS", "SIGNAL", "STALENESS", "LAST SUCCESS"
    );
    for (bot_id, health) in &state.bots {
        let status = match health.status {
            HealthStatus::Ok => health.status.as_str().green(),
            HealthStatus::Warn => health.status.as_str().yellow(),
            HealthStatus::Error | HealthStatus::Down => health.status.as_str().red(),
            HealthStatus::Unknown => health.status.as_str().dimmed(),
        };
        println!(
            "{:<12} {:<8} {:<18} {:<10} {}",
            bot_id,
            status,
            health.signal_source.as_str(),
            health
                .staleness_minutes
                .map_or_else(|| "n/a".to_string(), |m| format!("{m}m")),
            health
                .last_success_ts
                .map_or_else(|| "never".to_string(), |t| t
                    .format("%Y-%m-%d %H:%M")
                    .to_string()),
        );
    }

    let open = registry.open_issues();
    println!();
    if open.is_empty() {
        println!("{}", "No open issues".green());
    } else {
        println!("Open issues ({}):", open.len());
        for issue in open {
            let severity = match issue.severity {
                types::Severity::P1 => issue.severity.as_str().red(),
                types::Severity::P2 => issue.severity.as_str().yellow(),
                types::Severity::P3 => issue.severity.as_str().dimmed(),
            };
            println!(
                "  [{}] {} - {} (x{})",
                severity, issue.issue_id, issue.summary, issue.consecutive_failures
            );
        }
    }
}
