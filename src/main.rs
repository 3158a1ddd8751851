use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use helpdesk_engine::{Collaborators, Desk, OrderLedger};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "helpdesk", version, about = "Support ticket lifecycle engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the auto-close scheduler until interrupted.
    Serve {
        #[arg(long, default_value = "./config/example-config.yaml")]
        config: PathBuf,
    },
    /// Run a single auto-close sweep and print the report.
    Sweep {
        #[arg(long, default_value = "./config/example-config.yaml")]
        config: PathBuf,
    },
    /// Check the hash chain of an audit log.
    VerifyAudit {
        path: PathBuf,
        #[arg(long)]
        mirror: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => {
            let Some(cfg) = load_config(&config) else {
                return ExitCode::FAILURE;
            };
            let desk = match open_desk(&cfg).await {
                Some(desk) => desk,
                None => return ExitCode::FAILURE,
            };
            if !cfg.scheduler.enabled {
                info!("auto-close scheduler disabled; nothing to run");
                return ExitCode::SUCCESS;
            }
            desk.scheduler(&cfg.scheduler)
                .run_until(async {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        error!(error = %err, "failed to listen for shutdown signal");
                    }
                })
                .await;
            ExitCode::SUCCESS
        }
        Command::Sweep { config } => {
            let Some(cfg) = load_config(&config) else {
                return ExitCode::FAILURE;
            };
            let desk = match open_desk(&cfg).await {
                Some(desk) => desk,
                None => return ExitCode::FAILURE,
            };
            let report = desk.scheduler(&cfg.scheduler).run_once().await;
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(err) => {
                    eprintln!("failed to render report: {err}");
                    return ExitCode::FAILURE;
                }
            }
            if report.failed > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Command::VerifyAudit { path, mirror } => {
            init_tracing("info");
            let path = path.to_string_lossy().to_string();
            let mirror = mirror.map(|m| m.to_string_lossy().to_string());
            match helpdesk_engine::verify_audit_chain_with_mirror(&path, mirror.as_deref()) {
                Ok(summary) => {
                    println!("{summary}");
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    eprintln!("audit verification failed: {err}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn load_config(path: &std::path::Path) -> Option<helpdesk_config::Config> {
    match helpdesk_config::load_and_validate(&path.to_string_lossy()) {
        Ok(cfg) => {
            init_tracing(&cfg.logging.filter);
            Some(cfg)
        }
        Err(e) => {
            eprintln!("failed to load config: {e}");
            None
        }
    }
}

async fn open_desk(cfg: &helpdesk_config::Config) -> Option<Desk> {
    // The sweep never creates tickets, so an empty order ledger is enough here.
    let collaborators = Collaborators::new(Arc::new(OrderLedger::default()));
    match Desk::open(cfg, collaborators).await {
        Ok(desk) => Some(desk),
        Err(err) => {
            error!(error = %err, "failed to open helpdesk");
            None
        }
    }
}

/// RUST_LOG wins over the configured filter.
fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}
