//! Pipeline healer CLI.
//!
//! Serves the HTTP API, runs a single healing run in the foreground, or
//! classifies captured checker output.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pipeline_healer::server::{run_server, ServerState};
use pipeline_healer::{
    classify, Collaborators, Diagnostic, FinalStatus, HealerConfig, Orchestrator, RunRegistry,
    RunRequest, Toolchain,
};

/// Self-healing CI pipeline engine
#[derive(Parser)]
#[command(name = "pipeline-healer")]
#[command(about = "Self-healing CI pipeline engine")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Configuration file (JSON); environment variables override it
    #[arg(long, global = true, env = "HEALER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve {
        /// Listen address (defaults to the configured one)
        #[arg(long)]
        addr: Option<String>,
    },

    /// Heal one repository in the foreground
    Run {
        /// Repository URL
        repo_url: String,

        /// Team name
        #[arg(long)]
        team: String,

        /// Team leader name
        #[arg(long)]
        leader: String,

        /// Maximum iterations
        #[arg(long)]
        budget: Option<u32>,
    },

    /// Classify captured checker output
    Classify {
        /// Toolchain that produced the output
        #[arg(long, default_value = "generic")]
        toolchain: Toolchain,

        /// File with the output; stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,

        /// Working copy root to strip from absolute paths
        #[arg(long)]
        root: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let config = HealerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve { addr } => {
            print_banner();
            let addr = addr.unwrap_or_else(|| config.listen_addr.clone());
            let orchestrator = build_orchestrator(config)?;
            run_server(Arc::new(ServerState::new(orchestrator)), &addr).await
        }
        Commands::Run {
            repo_url,
            team,
            leader,
            budget,
        } => run_once(config, repo_url, team, leader, budget).await,
        Commands::Classify {
            toolchain,
            input,
            root,
        } => run_classify(toolchain, input, root),
    }
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose {
        "pipeline_healer=debug,info"
    } else {
        "pipeline_healer=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

fn print_banner() {
    println!();
    println!("{}", "  pipeline-healer".cyan().bold());
    println!("  {}", "Self-healing CI pipeline engine".bright_black());
    println!();
}

fn build_orchestrator(config: HealerConfig) -> Result<Arc<Orchestrator>> {
    if config.anthropic_api_key.is_none() {
        tracing::warn!("ANTHROPIC_API_KEY is not set; no fixes will be generated");
    }
    if !config.has_github_token() {
        tracing::warn!("GITHUB_TOKEN is not set; verifying locally and pushing without credentials");
    }
    let collab = Collaborators::from_config(&config).context("Failed to build collaborators")?;
    Ok(Arc::new(Orchestrator::new(config, collab, RunRegistry::new())))
}

async fn run_once(
    config: HealerConfig,
    repo_url: String,
    team: String,
    leader: String,
    budget: Option<u32>,
) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let handle = orchestrator
        .create_run(RunRequest {
            repo_url,
            team_name: team,
            leader_name: leader,
            retry_budget: budget,
        })
        .await
        .context("Invalid run request")?;

    let run = orchestrator
        .spawn(handle)
        .await
        .context("Healing run task failed")?;
    let Some(outcome) = run.outcome() else {
        bail!("Run {} ended without an outcome", run.id());
    };

    println!("{}", serde_json::to_string_pretty(&run)?);
    match outcome.status {
        FinalStatus::Passed => {
            println!("{} {}", "PASSED".green().bold(), run.branch());
            Ok(())
        }
        FinalStatus::Failed => {
            let reason = outcome
                .reason
                .as_ref()
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            bail!("Run failed: {reason}")
        }
    }
}

fn run_classify(toolchain: Toolchain, input: Option<PathBuf>, root: Option<String>) -> Result<()> {
    let text = match input {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };

    let mut diagnostic = Diagnostic::new(toolchain, text, true);
    if let Some(root) = root {
        diagnostic = diagnostic.with_root(root);
    }
    let failures = classify(&diagnostic);
    println!("{}", serde_json::to_string_pretty(&failures)?);
    Ok(())
}
