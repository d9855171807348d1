use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use daycare_config::{ConfigLoader, DaycareConfig, WarningSeverity};
use daycare_core::{DaycareError, HistoryRecord, Result};
use daycare_history::{HistoryStore, InboxStore, SqliteStore};
use daycare_rlm::ScriptedInterpreter;
use daycare_runtime::resolve_pending_phase;

/// Daycare: durable agents whose scripts survive restarts
#[derive(Parser)]
#[command(name = "daycare", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to daycare.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective configuration (file plus environment overrides)
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration
    Doctor,
    /// Show what an agent would recover on its next start
    Inspect {
        /// Agent to inspect (lists known agents when omitted)
        agent: Option<String>,

        /// Also print the agent's effective history, one JSON record per line
        #[arg(long)]
        records: bool,
    },
    /// Serve the scripted test interpreter over stdin/stdout
    Worker,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(&config.logging.level)
        };

        // Logs go to stderr: stdout carries command output and the worker protocol.
        if config.logging.format == "json" {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
                )
                .with_writer(std::io::stderr)
                .json()
                .with_target(true)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
                )
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        debug!(config = %config_loader.path().display(), "configuration loaded");

        match self.command {
            Commands::Config { json } => Self::cmd_config(&config, json),
            Commands::Doctor => Self::cmd_doctor(&config),
            Commands::Inspect { agent, records } => Self::cmd_inspect(&config, agent, records).await,
            Commands::Worker => Self::cmd_worker().await,
        }
    }

    fn cmd_config(config: &DaycareConfig, json: bool) -> Result<()> {
        let rendered = if json {
            serde_json::to_string_pretty(config)?
        } else {
            toml::to_string_pretty(config).map_err(|e| DaycareError::Config(e.to_string()))?
        };
        println!("{rendered}");
        Ok(())
    }

    fn cmd_doctor(config: &DaycareConfig) -> Result<()> {
        println!("🩺 Daycare Doctor: configuration audit");
        println!();

        let warnings = match config.validate() {
            Ok(w) => w,
            Err(e) => {
                println!("{e}");
                return Err(DaycareError::Config("configuration has errors".into()));
            }
        };
        if warnings.is_empty() {
            println!("  ✅ no issues found");
            return Ok(());
        }

        let mut warn_count = 0;
        for w in &warnings {
            println!("  {w}");
            if w.severity == WarningSeverity::Warning {
                warn_count += 1;
            }
        }
        println!();
        println!("{} issue(s), {warn_count} warning(s)", warnings.len());
        Ok(())
    }

    async fn cmd_inspect(config: &DaycareConfig, agent: Option<String>, records: bool) -> Result<()> {
        let path = config.history.resolved_path();
        if !path.exists() {
            return Err(DaycareError::History(format!(
                "no history database at {}",
                path.display()
            )));
        }
        let store = SqliteStore::open(&path)?;

        let Some(agent) = agent else {
            let agents = store.agent_ids()?;
            if agents.is_empty() {
                println!("No agents recorded in {}", path.display());
            }
            for id in agents {
                println!("{id}");
            }
            return Ok(());
        };

        let history = store.read_all(&agent).await?;
        let queued = store.list(&agent).await?;
        info!(agent_id = %agent, records = history.len(), queued = queued.len(), "history loaded");

        if records {
            for record in &history {
                println!("{}", serde_json::to_string(record)?);
            }
            println!();
        }

        println!("agent:        {agent}");
        println!("records:      {}", history.len());
        println!("open scripts: {}", open_chains(&history));
        println!("queued:       {}", queued.len());
        match resolve_pending_phase(&history) {
            Some(phase) => {
                println!("pending:      {}", phase.kind());
                println!("{}", serde_json::to_string_pretty(&phase)?);
            }
            None => println!("pending:      none"),
        }
        Ok(())
    }

    async fn cmd_worker() -> Result<()> {
        info!("scripted worker serving on stdio");
        daycare_rlm::serve(
            Arc::new(ScriptedInterpreter::new()),
            tokio::io::stdin(),
            tokio::io::stdout(),
        )
        .await?;
        Ok(())
    }
}

/// Script chains that started but never completed.
fn open_chains(history: &[HistoryRecord]) -> usize {
    let mut open = std::collections::HashSet::new();
    for record in history {
        match record {
            HistoryRecord::RlmStart(start) => {
                open.insert(start.tool_call_id.as_str());
            }
            HistoryRecord::RlmComplete(complete) => {
                open.remove(complete.tool_call_id.as_str());
            }
            _ => {}
        }
    }
    open.len()
}
