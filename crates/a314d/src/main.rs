use std::path::Path;
use std::process::ExitCode;

use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::EnvFilter;

use a314_transport::{GpioIrq, SpiBus, irq::DEFAULT_IRQ_GPIO, spi::SPI_DEVICE};
use a314d::{Daemon, DaemonConfig, DEFAULT_CONFIG_PATH, load_config_file};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let on_demand = load_config_file(Path::new(&config_path));
    let cfg = DaemonConfig {
        on_demand,
        ..DaemonConfig::default()
    };

    let bus = match SpiBus::open(SPI_DEVICE) {
        Ok(bus) => bus,
        Err(error) => {
            tracing::error!(%error, device = SPI_DEVICE, "failed to open the spi bus");
            return ExitCode::FAILURE;
        }
    };
    let irq = match GpioIrq::export(DEFAULT_IRQ_GPIO) {
        Ok(irq) => irq,
        Err(error) => {
            tracing::error!(%error, gpio = DEFAULT_IRQ_GPIO, "failed to set up the interrupt line");
            return ExitCode::FAILURE;
        }
    };

    let daemon = match Daemon::bind(bus, irq, cfg).await {
        Ok(daemon) => daemon,
        Err(error) => {
            tracing::error!(%error, "failed to bind the client listener");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = daemon.shutdown_handle();
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            tracing::error!(%error, "failed to install the SIGTERM handler");
            return ExitCode::FAILURE;
        }
    };
    tokio::spawn(async move {
        sigterm.recv().await;
        tracing::info!("received SIGTERM");
        shutdown.notify_one();
    });

    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "daemon failed");
            ExitCode::FAILURE
        }
    }
}
