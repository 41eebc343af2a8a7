// ABOUTME: Main entry point for ptygate
//
// Binary: ptygate
// Usage: ptygate [--config FILE] [--local] [--format text|json] [--verbose] COMMAND
// - run: stream a command for a tenant
// - chat: run one Claude CLI turn for a tenant
// - exec: run a command once and print its output
// - check: verify the remote host is reachable
// - account: exists/create/delete remote accounts
// - stats: pool and admission counters
// - config: print the effective configuration

#![allow(missing_docs)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

mod cli;

use cli::output::{print_value, stats_text};
use cli::{Cli, Commands};
use ptygate::admission::AdmissionController;
use ptygate::config::AppConfig;
use ptygate::executor::RemoteStreamExecutor;
use ptygate::gateway::ExecutionGateway;
use ptygate::pool::ConnectionPool;
use ptygate::provisioning::AccountProvisioner;
use ptygate::remote::{Connector, LocalConnector, SshConnector};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    setup_logging(args.verbose)?;
    setup_panic_handler();

    let config = AppConfig::load(args.config.as_deref())?;

    if let Commands::Config = args.command {
        let mut shown = config.clone();
        if shown.claude.auth_token.is_some() {
            shown.claude.auth_token = Some("<redacted>".to_string());
        }
        print!("{}", shown.to_toml()?);
        return Ok(());
    }

    let gateway = build_gateway(&config, args.local)?;
    info!(
        endpoint = %gateway.pool().endpoint(),
        local = args.local,
        "Gateway ready"
    );

    let result = match args.command {
        Commands::Run(run_args) => cli::stream::run(&gateway, run_args, args.format).await,
        Commands::Chat(chat_args) => cli::stream::chat(&gateway, chat_args, args.format).await,
        Commands::Exec(exec_args) => cli::exec::exec(gateway.pool(), exec_args, args.format).await,
        Commands::Check => cli::exec::check(gateway.pool(), args.format).await,
        Commands::Account(command) => {
            let provisioner =
                AccountProvisioner::new(gateway.pool().clone(), config.provisioning.clone());
            cli::account::execute(&provisioner, command, args.format).await
        }
        Commands::Stats => print_value(&gateway.stats(), args.format, stats_text),
        Commands::Config => Ok(()),
    };

    gateway.shutdown().await;
    result
}

fn build_gateway(config: &AppConfig, local: bool) -> Result<ExecutionGateway> {
    let connector: Arc<dyn Connector> = if local {
        Arc::new(LocalConnector::new())
    } else {
        Arc::new(SshConnector::new(
            config.pool.endpoint.clone(),
            &config.pool.keepalive,
        ))
    };

    let pool = ConnectionPool::new(config.pool.clone(), connector)
        .context("Failed to create connection pool")?;
    let admission = AdmissionController::new(config.admission.clone())
        .context("Failed to create admission controller")?;
    let executor = RemoteStreamExecutor::new(config.executor.clone());

    let mut gateway = ExecutionGateway::new(admission, pool.clone(), executor, config.claude.clone());
    if config.provisioning.auto_create {
        gateway = gateway.with_provisioner(AccountProvisioner::new(pool, config.provisioning.clone()));
    }
    Ok(gateway)
}

fn setup_logging(verbose: bool) -> Result<()> {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use tracing_subscriber::prelude::*;

    // Create log directory if it doesn't exist
    let log_dir = AppConfig::get_user_config_dir()
        .map(|dir| dir.join("logs"))
        .unwrap_or_else(|_| PathBuf::from(".ptygate/logs"));

    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    // Create JSONL log file with timestamp
    let log_file = log_dir.join(format!(
        "ptygate-{}.jsonl",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .with_context(|| format!("Failed to create log file {}", log_file.display()))?;

    let stderr_layer = verbose.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()             // Output in JSON Lines format
                .with_target(true)  // Include target module in JSON
                .with_writer(file)
                .with_ansi(false),
        )
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ptygate=info".into()),
        )
        .init();

    Ok(())
}

fn setup_panic_handler() {
    use tracing::error;

    std::panic::set_hook(Box::new(|panic_info| {
        error!("Application panicked: {}", panic_info);
        eprintln!("Application panicked: {}", panic_info);
        eprintln!("Please check the logs for more details.");
    }));
}
