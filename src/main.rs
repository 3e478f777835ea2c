mod config;
mod simulate;
mod transport;
mod uplink;

use config::NodeConfig;
use simulate::MeasurementSimulator;
use std::time::Duration;
use transport::TcpConnector;
use uplink::{Ack, Backoff, Uplink};

use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = NodeConfig::from_env()?;

    info!("Sensor node starting: {}", config.device_id);
    info!("  Server: {}", config.server);
    info!("  Interval: {:?}", config.interval);

    let connector = TcpConnector::new(config.server.clone(), config.connect_timeout);
    let uplink = Uplink::new(connector, &config);
    let mut simulator = match config.seed {
        Some(seed) => {
            info!("  Seed: {}", seed);
            MeasurementSimulator::with_seed(seed)
        }
        None => MeasurementSimulator::new(),
    };
    let mut backoff = Backoff::new(config.reconnect_delay, config.max_reconnect_delay);

    let mut wait = Duration::ZERO;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping");
                break;
            }
        }

        let measurements = simulator.next_measurements();
        debug!("Reporting {:?}", measurements);

        wait = match uplink.report(&measurements).await {
            Ok(Ack::Rejected) => {
                warn!("Server rejected the report");
                backoff.reset();
                config.interval
            }
            Ok(ack) => {
                info!(
                    "Reported over {}: lux={} nh3={} hs={} h={} t={} ({:?})",
                    uplink.transport_name(),
                    measurements.lux,
                    measurements.nh3,
                    measurements.hs,
                    measurements.h,
                    measurements.t,
                    ack
                );
                backoff.reset();
                config.interval
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!("Report failed: {:#}, retrying in {:?}", e, delay);
                delay
            }
        };
    }

    Ok(())
}
