mod config;
mod telemetry;

use clap::{Args, Parser, Subcommand};
use config::{Config, ConfigError};
use rpc_router::config::ValidationError;
use rpc_router::errors::RouterError;
use std::path::PathBuf;
use telemetry::TelemetryError;

#[derive(Parser)]
#[command(name = "gateway", about = "Cost-aware JSON-RPC gateway")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve JSON-RPC traffic
    RpcRouter(ConfigArgs),
    /// Load and validate a config file without starting anything
    ValidateConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// Path to the YAML config file
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("config has no rpc_router section")]
    MissingRpcRouter,
    #[error("invalid rpc_router config: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("could not start runtime: {0}")]
    Runtime(std::io::Error),
    #[error(transparent)]
    RpcRouter(#[from] RouterError),
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli_main(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn cli_main(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        CliCommand::ValidateConfig(args) => {
            let config = Config::from_file(&args.config)?;
            let router_config = config.rpc_router.ok_or(CliError::MissingRpcRouter)?;
            router_config.validate()?;
            println!("config ok: {} projects", router_config.projects.len());
            Ok(())
        }
        CliCommand::RpcRouter(args) => {
            let config = Config::from_file(&args.config)?;
            let router_config = config.rpc_router.ok_or(CliError::MissingRpcRouter)?;
            router_config.validate()?;

            let _sentry = telemetry::init_logging(config.common.logging.as_ref())?;
            telemetry::init_metrics(config.common.metrics.as_ref())?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(CliError::Runtime)?;

            tracing::info!(projects = router_config.projects.len(), "starting rpc-router");
            runtime.block_on(rpc_router::run(router_config))?;
            Ok(())
        }
    }
}
