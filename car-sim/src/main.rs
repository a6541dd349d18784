//! Car simulator for developing the controller without hardware.
//!
//! Accepts length-prefixed command frames over TCP, applies them to a
//! simulated car and answers each with a one-byte ack.

use anyhow::{anyhow, Context, Result};
use rabbit_shared::codec::{self, DecodedCommand};
use rabbit_shared::framing::{FrameDecoder, ACK_OK, ACK_REJECTED};
use rabbit_shared::{CommandKind, CriticalKind, Movement};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Simulator configuration
#[derive(Debug, Clone)]
struct SimConfig {
    /// Address to listen on
    listen: String,
    /// Delay before each ack, standing in for BLE write latency
    latency: Duration,
    /// Reject every movement write (exercises the controller's failure path)
    reject_movement: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9000".into(),
            latency: Duration::from_millis(20),
            reject_movement: false,
        }
    }
}

impl SimConfig {
    fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(listen) = std::env::var("RABBIT_SIM_LISTEN") {
            config.listen = listen;
        }
        if let Ok(ms) = std::env::var("RABBIT_SIM_LATENCY_MS") {
            let ms: u64 = ms
                .parse()
                .with_context(|| format!("RABBIT_SIM_LATENCY_MS={}", ms))?;
            config.latency = Duration::from_millis(ms);
        }
        if let Ok(flag) = std::env::var("RABBIT_SIM_REJECT_MOVEMENT") {
            config.reject_movement = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        Ok(config)
    }
}

/// What the simulated car currently does
#[derive(Debug, Default)]
struct CarState {
    manual: bool,
    running: bool,
    white_line: bool,
    movement: Option<Movement>,
    commands: u64,
}

impl CarState {
    /// Apply one command and return the ack byte to send back
    fn apply(&mut self, command: &DecodedCommand, config: &SimConfig) -> u8 {
        self.commands += 1;

        match command.kind() {
            Some(CommandKind::Critical(CriticalKind::ManualControl)) => {
                self.manual = command.get_bool("enabled").unwrap_or(false);
                info!("[SIM] Manual control {}", on_off(self.manual));
            }
            Some(CommandKind::Critical(CriticalKind::Running)) => {
                self.running = command.get_bool("running").unwrap_or(false);
                if self.running {
                    info!(
                        "[SIM] GO distance={:?} time={:?} pace={:?}",
                        command.get_float("distance"),
                        command.get_float("time"),
                        command.get_float("pace")
                    );
                } else {
                    info!("[SIM] STOP");
                }
            }
            Some(CommandKind::Critical(CriticalKind::IsWhiteLine)) => {
                self.white_line = command.get_bool("enabled").unwrap_or(false);
                info!(
                    "[SIM] Following {} line",
                    if self.white_line { "white" } else { "black" }
                );
            }
            Some(CommandKind::Critical(CriticalKind::Settings)) => {
                info!("[SIM] Settings updated: {:?}", command.fields);
            }
            Some(CommandKind::Movement) => {
                if config.reject_movement {
                    warn!("[SIM] Rejecting movement write");
                    return ACK_REJECTED;
                }
                let Some(movement) = command.movement() else {
                    warn!("[SIM] Movement without angle/speed: {:?}", command.fields);
                    return ACK_REJECTED;
                };
                if !self.manual {
                    debug!("[SIM] Movement {} received outside manual mode", movement);
                }
                self.movement = Some(movement);
                info!("[SIM] Steering {}", movement);
            }
            None => {
                warn!("[SIM] Unknown command type: {}", command.type_name);
                return ACK_REJECTED;
            }
        }

        ACK_OK
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = Arc::new(SimConfig::from_env()?);
    let listener = TcpListener::bind(&config.listen).await?;
    info!(
        "[SIM] Car simulator listening on {} (latency {:?})",
        config.listen, config.latency
    );

    loop {
        let (socket, addr) = listener.accept().await?;
        info!("[SIM] Controller connected: {}", addr);

        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(socket, addr, &config).await {
                warn!("[SIM] Session with {} ended: {}", addr, e);
            }
        });
    }
}

/// Serve one controller connection until it closes
async fn handle_client(mut socket: TcpStream, addr: SocketAddr, config: &SimConfig) -> Result<()> {
    let mut decoder = FrameDecoder::new();
    let mut state = CarState::default();
    let mut buf = vec![0u8; 4096];

    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            info!(
                "[SIM] Controller disconnected: {} ({} commands)",
                addr, state.commands
            );
            return Ok(());
        }
        decoder.extend(&buf[..n]);

        // Process all complete frames
        while let Some(frame) = decoder
            .decode_next()
            .map_err(|e| anyhow!("framing error: {}", e))?
        {
            let ack = match codec::decode(&frame) {
                Ok(command) => state.apply(&command, config),
                Err(e) => {
                    warn!("[SIM] Undecodable payload from {}: {}", addr, e);
                    ACK_REJECTED
                }
            };

            if !config.latency.is_zero() {
                tokio::time::sleep(config.latency).await;
            }
            socket.write_all(&[ack]).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rabbit_shared::framing::encode_frame;
    use rabbit_shared::{CriticalIntent, Encoder, Intent, RunSettings, WireFormat};

    fn decoded(intent: Intent) -> DecodedCommand {
        let command = Encoder::default().encode(&intent);
        codec::decode(command.payload()).unwrap()
    }

    #[test]
    fn test_car_state_follows_commands() {
        let config = SimConfig::default();
        let mut car = CarState::default();

        assert_eq!(car.apply(&decoded(CriticalIntent::manual_control(true).into()), &config), ACK_OK);
        assert_eq!(car.apply(&decoded(Movement::new(100, 400).into()), &config), ACK_OK);
        let settings = RunSettings {
            distance_m: 400.0,
            ..Default::default()
        };
        assert_eq!(car.apply(&decoded(CriticalIntent::start(&settings).into()), &config), ACK_OK);
        assert_eq!(car.apply(&decoded(CriticalIntent::is_white_line(true).into()), &config), ACK_OK);

        assert!(car.manual);
        assert!(car.running);
        assert!(car.white_line);
        assert_eq!(car.movement, Some(Movement::new(100, 400)));
        assert_eq!(car.commands, 4);
    }

    #[test]
    fn test_rejects_unknown_and_configured_movement() {
        let mut car = CarState::default();
        let unknown = codec::decode(br#"{"type":"selfDestruct"}"#).unwrap();
        assert_eq!(car.apply(&unknown, &SimConfig::default()), ACK_REJECTED);

        let rejecting = SimConfig {
            reject_movement: true,
            ..Default::default()
        };
        assert_eq!(car.apply(&decoded(Movement::CENTERED.into()), &rejecting), ACK_REJECTED);
        assert_eq!(car.movement, None);
    }

    #[tokio::test]
    async fn test_client_gets_one_ack_per_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, peer) = listener.accept().await.unwrap();
            let config = SimConfig {
                latency: Duration::ZERO,
                ..Default::default()
            };
            handle_client(socket, peer, &config).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let text = Encoder::new(WireFormat::Text).encode(&CriticalIntent::stop().into());
        let mut frames = encode_frame(text.payload()).unwrap().to_vec();
        frames.extend_from_slice(&encode_frame(b"not a command").unwrap());
        client.write_all(&frames).await.unwrap();

        let mut acks = [0u8; 2];
        client.read_exact(&mut acks).await.unwrap();
        assert_eq!(acks, [ACK_OK, ACK_REJECTED]);
    }
}
