use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "colloquy")]
#[command(version, about = "Multi-agent research document orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Draft a document on a topic: outline dialogue, charts, assembly, polish
    Run(RunArgs),
    /// List archived runs, most recent first
    Runs {
        /// Number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Research topic or question
    pub topic: String,

    /// Input files or glob patterns (notes, data, *.refs.json)
    #[arg(short, long = "input")]
    pub inputs: Vec<String>,

    /// Chart to produce: "Title: description[ @data-file]" (repeatable)
    #[arg(short, long = "chart")]
    pub charts: Vec<String>,

    /// Number of reviewer agents
    #[arg(long)]
    pub perspectives: Option<usize>,

    /// Reviewer perspective label (repeatable, overrides generated ones)
    #[arg(long)]
    pub perspective: Vec<String>,

    /// Reviewer rounds per dialogue session
    #[arg(long)]
    pub rounds: Option<u32>,

    /// Attempts allowed per chart
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Language model command (prompt on stdin, reply on stdout)
    #[arg(long, env = "COLLOQUY_MODEL_CMD")]
    pub model_cmd: Option<String>,

    /// Skip literature search even if an API key is set
    #[arg(long)]
    pub no_search: bool,

    /// Do not download the full text of cited papers
    #[arg(long)]
    pub no_downloads: bool,

    /// UI output mode: full, minimal, json
    #[arg(long, default_value = "full")]
    pub ui: String,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default colloquy.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let log_dir = match &cli.command {
        Commands::Run(_) => {
            let dir = project_dir.join(colloquy::config::CONFIG_DIR).join("logs");
            std::fs::create_dir_all(&dir).ok().map(|_| dir)
        }
        _ => None,
    };
    let _telemetry = colloquy::telemetry::init(cli.verbose, log_dir.as_deref());

    match cli.command {
        Commands::Run(args) => cmd::cmd_run(&project_dir, cli.verbose, args).await?,
        Commands::Runs { limit } => cmd::cmd_runs(&project_dir, limit)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command)?,
    }

    Ok(())
}
