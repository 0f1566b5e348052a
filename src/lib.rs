pub mod channels;
pub mod command;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod inputs;
pub mod lifecycle;
pub mod modbus;
pub mod mqtt;
pub mod options;
pub mod predictive;
pub mod prelude;
pub mod register;
pub mod register_cache;
pub mod scheduler;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;

use crate::inputs::Inputs;
use crate::lifecycle::Lifecycle;
use std::io::Write;

fn init_logging(level: &str) -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init()?;
    Ok(())
}

/// Bring the engine up and keep it running until `shutdown_rx` fires.
pub async fn app(mut shutdown_rx: broadcast::Receiver<()>, config: ConfigWrapper) -> Result<()> {
    info!("venus-energy-manager {} starting", CARGO_PKG_VERSION);

    let channels = Channels::new();
    let inputs = Inputs::new();

    let mut lifecycle = Lifecycle::new(config, channels, inputs);
    lifecycle.start().await?;

    info!("Waiting for shutdown signal...");
    let _ = shutdown_rx.recv().await;

    info!("Shutdown signal received, stopping...");
    lifecycle.stop().await?;

    info!("Shutdown complete");
    Ok(())
}

pub async fn run(options: Options) -> Result<()> {
    // this first read only picks the log level, nothing is logged yet
    let level = Config::new(options.config_file.clone())
        .map(|c| c.loglevel)
        .unwrap_or_else(|_| "info".to_string());
    init_logging(&level)?;

    let config = ConfigWrapper::new(options.config_file.clone()).map_err(|err| {
        error!("Failed to load config: {:#}", err);
        err
    })?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl+c: {}", e);
        }
        let _ = shutdown_tx_clone.send(());
    });

    if let Some(secs) = options.runtime {
        info!("will stop after {}s", secs);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
            let _ = shutdown_tx.send(());
        });
    }

    app(shutdown_rx, config).await
}
