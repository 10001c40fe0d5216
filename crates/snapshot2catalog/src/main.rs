use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use snapshot2catalog_config::RuntimeConfig;
use snapshot2catalog_core::{Environment, RunStage};
use std::path::PathBuf;

/// Export cross-account database snapshots and register them in a query catalog
#[derive(Parser)]
#[command(name = "snapshot2catalog")]
#[command(version)]
#[command(about = "Export cross-account database snapshots and register them in a query catalog", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// HTTP listen port (overrides config file)
    #[arg(short, long, value_name = "PORT", global = true)]
    port: Option<u16>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP trigger interface and daily cadence (default if no subcommand given)
    Serve,
    /// Run one export-then-catalog pipeline in the foreground
    Run {
        /// Environment to run: dev or prod
        #[arg(short, long, value_name = "ENV")]
        env: Environment,
    },
    /// Print the least-privilege scope of every environment and purpose
    Plan,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Some(Commands::Plan) => run_plan(&config),
        Some(Commands::Run { env }) => runtime()?.block_on(run_once(config, env)),
        Some(Commands::Serve) | None => {
            runtime()?.block_on(snapshot2catalog::run_with_config(config))
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
}

fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    // Step 1: Load base configuration
    let mut config = if let Some(config_path) = &cli.config {
        RuntimeConfig::load_from_path(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        RuntimeConfig::load().context("Failed to load configuration")?
    };

    // Step 2: Apply CLI overrides (highest priority)
    if let Some(port) = cli.port {
        config.server.listen_addr = format!("0.0.0.0:{}", port);
    }
    if let Some(level) = &cli.log_level {
        config.server.log_level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

fn run_plan(config: &RuntimeConfig) -> Result<()> {
    let plan = snapshot2catalog::plan::scope_plan(&config.deployments());
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

async fn run_once(config: RuntimeConfig, env: Environment) -> Result<()> {
    snapshot2catalog::init_tracing(&config);
    let components = snapshot2catalog::init_components(&config)?;

    let run = components
        .scheduler
        .run_now(env)
        .await
        .with_context(|| format!("Failed to run pipeline for {}", env))?;
    println!("{}", serde_json::to_string_pretty(&run)?);

    if run.stage != RunStage::Done {
        anyhow::bail!(
            "run {} finished in stage {}",
            run.id,
            run.stage
        );
    }
    Ok(())
}
