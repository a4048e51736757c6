//! flowsyncd - the FlowSync deployment-mode and data sync daemon.
//!
//! `flowsyncd [run]` starts the core and runs until interrupted.
//! `flowsyncd backup` takes one snapshot and exits.
//! `flowsyncd restore <backup_id>` restores a snapshot and exits with code
//! 42 so the supervisor restarts the process over the restored store.

use flowsync_service::{Config, Service};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit code signalling "restart me" after a restore.
const EXIT_RESTART_REQUESTED: i32 = 42;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowsync_service=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("run");

    let service = Service::start(config).await?;
    let control = service.control();

    match command {
        "run" => {
            tracing::info!(mode = %control.get_mode().current, "flowsyncd started");
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            service.shutdown().await;
        }
        "backup" => {
            let manifest = control.create_backup().await?;
            println!("{}", manifest.prefix);
            service.shutdown().await;
        }
        "restore" => {
            let backup_id = args
                .get(1)
                .ok_or("usage: flowsyncd restore <backup_id>")?;
            let outcome = control.restore(backup_id).await?;
            tracing::info!(prefix = %outcome.manifest.prefix, "restore complete");
            service.shutdown().await;
            if outcome.restart_required {
                std::process::exit(EXIT_RESTART_REQUESTED);
            }
        }
        other => {
            eprintln!("unknown command: {other}");
            eprintln!("usage: flowsyncd [run|backup|restore <backup_id>]");
            std::process::exit(2);
        }
    }

    Ok(())
}
