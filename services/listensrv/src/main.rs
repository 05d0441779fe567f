//! Listener Service (`listensrv`)
//!
//! Binds the listener port, waits for the slave to dial in and polls its
//! holding registers until Ctrl-C.

mod bootstrap;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use voltage_listener::{EventPoll, ListenerError, ModbusRequest, TcpListenerMaster};

use bootstrap::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = bootstrap::init_logging(&args.log_level, args.log_dir.as_ref())?;

    let config = args.listener_config()?;
    info!(
        "Starting listensrv v{} on {}:{} ({} framing)",
        env!("CARGO_PKG_VERSION"),
        config.host,
        config.port,
        config.framing
    );

    let mut builder = TcpListenerMaster::builder(config);
    if args.event_poll {
        builder = builder.event_poll(EventPoll::current()?);
    }
    let master = builder.build();
    master.init().await.context("Failed to start listener")?;

    let request = ModbusRequest::read_holding_registers(args.slave_id, args.start, args.count)
        .context("Invalid poll request")?;

    let mut ticker = interval(Duration::from_millis(args.poll_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                poll_once(&master, &request).await;
            }
        }
    }

    master.destroy().await;
    info!("listensrv stopped");
    Ok(())
}

async fn poll_once(master: &TcpListenerMaster, request: &ModbusRequest) {
    if !master.is_connected() {
        debug!("Waiting for slave to connect");
        return;
    }

    match master.send(request.clone()).await {
        Ok(Some(response)) if response.is_exception() => warn!(
            "Slave {} returned exception 0x{:02X}",
            response.slave_id(),
            response.exception_code().unwrap_or_default()
        ),
        Ok(Some(response)) => info!(
            "Slave {} registers {}..: {:?}",
            response.slave_id(),
            start_address(request),
            response.registers()
        ),
        Ok(None) => debug!("No response (listener not initialized)"),
        Err(ListenerError::NotConnected) => debug!("Slave disconnected"),
        Err(e) => {
            let status = master.status().await;
            error!(
                "Poll failed: {} (retries {}, restarts {})",
                e, status.retries, status.restarts
            );
        },
    }
}

fn start_address(request: &ModbusRequest) -> u16 {
    match request.data() {
        [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
        _ => 0,
    }
}
