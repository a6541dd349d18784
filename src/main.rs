mod command;
mod config;
mod connection;
mod console;
mod transport;

use anyhow::Result;
use command::{DispatchEvent, Dispatcher};
use config::{ControllerConfig, TransportMode};
use connection::{ConnectionEvent, ConnectionManager};
use console::Console;
use rabbit_shared::{Encoder, RunSettings};
use std::sync::Arc;
use tokio::sync::mpsc;
use transport::{BluetoothConnector, LinkConnector, TcpConnector};

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = ControllerConfig::from_env()?;

    info!("Rabbit controller starting");
    info!("  Transport: {}", config.transport);
    info!("  Wire format: {:?}", config.wire_format);

    let connector: Arc<dyn LinkConnector> = match config.transport {
        TransportMode::Ble => {
            match config.ble.address {
                Some(addr) => info!("  Car address: {}", addr),
                None => info!("  Car address: discover by service UUID"),
            }
            Arc::new(BluetoothConnector::new(config.ble.clone()))
        }
        TransportMode::TcpSimulation => {
            info!("  Simulator: {}", config.tcp.address);
            Arc::new(TcpConnector::new(
                config.tcp.address.clone(),
                config.tcp.write_timeout,
            ))
        }
    };

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::spawn(Encoder::new(config.wire_format), event_tx);
    tokio::spawn(log_dispatch_events(event_rx));

    let mut conn = ConnectionManager::new(config.link.clone(), connector, dispatcher.clone());

    let console = Console::new(RunSettings::default());
    let mut console_task = tokio::spawn(console.run(dispatcher.clone()));

    // Main event loop
    loop {
        tokio::select! {
            event = conn.recv() => match event {
                Some(ConnectionEvent::Connected { transport, peer }) => {
                    info!("Connected to car {} via {}", peer, transport);
                }
                Some(ConnectionEvent::Disconnected { reason }) => {
                    warn!("Disconnected: {}", reason);
                }
                Some(ConnectionEvent::ConnectionFailed { reason }) => {
                    error!("Connection failed: {}", reason);
                }
                None => {
                    error!("Connection manager closed");
                    break;
                }
            },
            result = &mut console_task => {
                match result {
                    Ok(Ok(())) => info!("Console closed"),
                    Ok(Err(e)) => error!("Console failed: {}", e),
                    Err(e) => error!("Console task panicked: {}", e),
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    info!("Shutting down, stopping car");
    conn.shutdown().await?;
    Ok(())
}

async fn log_dispatch_events(mut events: mpsc::UnboundedReceiver<DispatchEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DispatchEvent::SessionOpened { transport } => {
                debug!("Dispatcher session opened on {}", transport);
            }
            DispatchEvent::Sent { kind, payload } => {
                info!("Sent {}: {}", kind, payload);
            }
            DispatchEvent::WriteFailed {
                kind,
                payload,
                error,
            } => {
                warn!("Write of {} failed ({}): {}", kind, error, payload);
            }
            DispatchEvent::CriticalDropped { kind } => {
                warn!("Not connected, {} command was not sent", kind);
            }
            DispatchEvent::SessionClosed {
                reason,
                dropped_critical,
                cancelled_write,
            } => {
                if dropped_critical > 0 || cancelled_write.is_some() {
                    warn!(
                        "Session closed ({}), {} queued command(s) discarded",
                        reason,
                        dropped_critical + usize::from(cancelled_write.is_some())
                    );
                } else {
                    debug!("Session closed ({})", reason);
                }
            }
        }
    }
}
