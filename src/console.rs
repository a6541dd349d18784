//! Line-oriented operator console
//!
//! Stands in for the web UI: each line maps to one intent on the dispatcher.

use crate::command::{DispatchError, DispatcherHandle};
use anyhow::{anyhow, Result};
use rabbit_shared::{limits, CriticalIntent, Movement, RunSettings};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// A parsed console line
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Manual(bool),
    Go,
    Stop,
    WhiteLine(bool),
    Move(Movement),
    Center,
    Settings {
        distance_m: f64,
        time_s: f64,
        pace_mps: f64,
    },
    Tune {
        key: String,
        value: f64,
    },
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "commands: manual on|off, go, stop, white on|off, move <angle> <speed>, \
center, settings <distance> <time> <pace>, tune <key> <value>, status, quit";

impl std::str::FromStr for ConsoleCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let command = match words.as_slice() {
            ["manual", state] => ConsoleCommand::Manual(parse_switch(state)?),
            ["go"] => ConsoleCommand::Go,
            ["stop"] => ConsoleCommand::Stop,
            ["white", state] => ConsoleCommand::WhiteLine(parse_switch(state)?),
            ["move", angle, speed] => ConsoleCommand::Move(Movement::new(
                parse_number(angle, "angle")?,
                parse_number(speed, "speed")?,
            )),
            ["center"] => ConsoleCommand::Center,
            ["settings", distance, time, pace] => ConsoleCommand::Settings {
                distance_m: parse_finite(distance, "distance")?,
                time_s: parse_finite(time, "time")?,
                pace_mps: parse_finite(pace, "pace")?,
            },
            ["tune", key, value] => ConsoleCommand::Tune {
                key: key.to_string(),
                value: parse_finite(value, "tuning value")?,
            },
            ["status"] => ConsoleCommand::Status,
            ["help"] | ["?"] => ConsoleCommand::Help,
            ["quit"] | ["exit"] => ConsoleCommand::Quit,
            [] => return Err(anyhow!("empty command")),
            _ => return Err(anyhow!("unrecognized command: {}", line.trim())),
        };
        Ok(command)
    }
}

fn parse_switch(word: &str) -> Result<bool> {
    match word {
        "on" | "true" => Ok(true),
        "off" | "false" => Ok(false),
        other => Err(anyhow!("expected on or off, got {}", other)),
    }
}

fn parse_number<T: std::str::FromStr>(word: &str, what: &str) -> Result<T> {
    word.parse()
        .map_err(|_| anyhow!("invalid {}: {}", what, word))
}

/// Like `parse_number`, refusing NaN and infinities
fn parse_finite(word: &str, what: &str) -> Result<f64> {
    let value: f64 = parse_number(word, what)?;
    if !value.is_finite() {
        return Err(anyhow!("{} must be a finite number, got {}", what, word));
    }
    Ok(value)
}

/// Operator-side state the console keeps between lines
#[derive(Debug, Default)]
pub struct Console {
    settings: RunSettings,
}

impl Console {
    pub fn new(settings: RunSettings) -> Self {
        Self { settings }
    }

    /// Apply one command. Returns `false` when the console should exit.
    pub async fn apply(&mut self, command: ConsoleCommand, handle: &DispatcherHandle) -> Result<bool> {
        match command {
            ConsoleCommand::Manual(enabled) => {
                submit(handle, CriticalIntent::manual_control(enabled));
                handle.set_movement_enabled(enabled)?;
            }
            ConsoleCommand::Go => submit(handle, CriticalIntent::start(&self.settings)),
            ConsoleCommand::Stop => submit(handle, CriticalIntent::stop()),
            ConsoleCommand::WhiteLine(enabled) => {
                self.settings.is_white_line = enabled;
                submit(handle, CriticalIntent::is_white_line(enabled));
            }
            ConsoleCommand::Move(movement) => {
                let movement = movement.clamped();
                handle.update_movement(movement.angle, movement.motor_speed)?;
            }
            ConsoleCommand::Center => {
                handle.update_movement(limits::STEERING_CENTER, limits::DRIVE_NEUTRAL)?;
                handle.request_movement()?;
            }
            ConsoleCommand::Settings {
                distance_m,
                time_s,
                pace_mps,
            } => {
                self.settings.distance_m = distance_m;
                self.settings.time_s = time_s;
                self.settings.pace_mps = pace_mps;
                submit(handle, CriticalIntent::settings(&self.settings));
            }
            // Sent with the next `go`
            ConsoleCommand::Tune { key, value } => match self.settings.set_tuning(key, value) {
                Ok(()) => info!("[CONSOLE] Tuning: {:?}", self.settings.tuning),
                Err(e) => warn!("[CONSOLE] {}", e),
            },
            ConsoleCommand::Status => {
                let status = handle.status().await?;
                info!(
                    "[CONSOLE] connected={} in_flight={:?} queued={} pending={} manual={} target={:?} last_sent={:?}",
                    status.connected,
                    status.in_flight,
                    status.queued_critical,
                    status.pending_movement,
                    status.movement_enabled,
                    status.target,
                    status.last_sent
                );
            }
            ConsoleCommand::Help => info!("[CONSOLE] {}", HELP),
            ConsoleCommand::Quit => return Ok(false),
        }
        Ok(true)
    }

    /// Read commands from stdin until `quit` or end of input
    pub async fn run(mut self, handle: DispatcherHandle) -> Result<()> {
        info!("[CONSOLE] {}", HELP);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let command = match line.parse::<ConsoleCommand>() {
                Ok(command) => command,
                Err(e) => {
                    warn!("[CONSOLE] {}", e);
                    continue;
                }
            };
            if !self.apply(command, &handle).await? {
                break;
            }
        }
        Ok(())
    }
}

/// Dropped commands are already reported by the dispatcher
fn submit(handle: &DispatcherHandle, intent: CriticalIntent) {
    match handle.submit_critical(intent) {
        Ok(()) | Err(DispatchError::TransportUnavailable) => {}
        Err(DispatchError::Closed) => warn!("[CONSOLE] Dispatcher is not running"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Dispatcher;
    use rabbit_shared::Encoder;
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_commands() {
        assert_eq!("manual on".parse::<ConsoleCommand>().unwrap(), ConsoleCommand::Manual(true));
        assert_eq!("white off".parse::<ConsoleCommand>().unwrap(), ConsoleCommand::WhiteLine(false));
        assert_eq!(
            "  move 120   -500 ".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Move(Movement::new(120, -500))
        );
        assert_eq!(
            "settings 400 90 4.5".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Settings {
                distance_m: 400.0,
                time_s: 90.0,
                pace_mps: 4.5
            }
        );
        assert_eq!("go".parse::<ConsoleCommand>().unwrap(), ConsoleCommand::Go);
        assert_eq!("exit".parse::<ConsoleCommand>().unwrap(), ConsoleCommand::Quit);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("".parse::<ConsoleCommand>().is_err());
        assert!("manual maybe".parse::<ConsoleCommand>().is_err());
        assert!("move left 10".parse::<ConsoleCommand>().is_err());
        assert!("settings 400 90".parse::<ConsoleCommand>().is_err());
        assert!("launch".parse::<ConsoleCommand>().is_err());
    }

    #[test]
    fn test_parse_rejects_non_finite_numbers() {
        for line in ["settings nan 90 4.5", "settings 400 inf 4.5", "settings 400 90 -inf", "tune kp NaN"] {
            assert!(line.parse::<ConsoleCommand>().is_err(), "accepted {:?}", line);
        }
        assert_eq!(
            "tune kp 0.8".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Tune {
                key: "kp".into(),
                value: 0.8
            }
        );
    }

    #[tokio::test]
    async fn test_apply_updates_dispatcher() {
        let (event_tx, _events) = mpsc::unbounded_channel();
        let handle = Dispatcher::spawn(Encoder::default(), event_tx);
        let mut console = Console::default();

        assert!(console.apply(ConsoleCommand::Manual(true), &handle).await.unwrap());
        assert!(console
            .apply(ConsoleCommand::Move(Movement::new(500, 100)), &handle)
            .await
            .unwrap());

        let status = handle.status().await.unwrap();
        assert!(status.movement_enabled);
        assert_eq!(status.target, Some(Movement::new(limits::STEERING_MAX, 100)));

        assert!(console.apply(ConsoleCommand::WhiteLine(true), &handle).await.unwrap());
        assert!(console.settings.is_white_line);

        let reserved = ConsoleCommand::Tune {
            key: "running".into(),
            value: 1.0,
        };
        assert!(console.apply(reserved, &handle).await.unwrap());
        assert!(console.settings.tuning.is_empty());
        assert!(!console.apply(ConsoleCommand::Quit, &handle).await.unwrap());
    }
}
