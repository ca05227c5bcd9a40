use std::sync::Arc;

use log::*;
use ssilink::sim::SimulatedMcu;
use ssilink::{DeviceBuilder, StdDelay};
use tokio_util::sync::CancellationToken;

mod parse_args;
mod server;

use server::BridgeServer;

#[tokio::main]
async fn main() {
    let args = match parse_args::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}.", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(args.verbosity.filter()),
    )
    .init();

    let mcu = SimulatedMcu::new();
    mcu.set_echo(args.echo);

    let recovery = {
        let mcu = mcu.clone();
        move || {
            warn!("Remote MCU not answering, resetting it");
            mcu.set_unresponsive(false);
        }
    };

    let device = match DeviceBuilder::new(args.config)
        .recovery(recovery)
        .build(mcu.clone(), mcu.clone(), StdDelay)
    {
        Ok(device) => Arc::new(device),
        Err(e) => {
            error!("Failed to start link: {}", e);
            std::process::exit(1);
        }
    };
    mcu.attach_irq(device.irq_handle());

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, shutting down");
                token.cancel();
            }
        });
    }

    let server = BridgeServer::new(args.target, device.clone());
    if let Err(e) = server.run(token).await {
        error!("Bridge failed: {}", e);
    }

    let stats = device.stats();
    info!("=== Link Statistics ===");
    info!("Frames sent: {} ({} bytes)", stats.frames_sent, stats.bytes_sent);
    info!(
        "Frames received: {} ({} bytes)",
        stats.frames_received, stats.bytes_received
    );
    info!(
        "Failures: {} tx, {} rx, {} handshake timeouts",
        stats.tx_failures, stats.rx_failures, stats.handshake_timeouts
    );
    info!(
        "Credit: {} retries, {} delays, {} pending errors",
        stats.credit_retries, stats.credit_delays, stats.pending_errors
    );
}
