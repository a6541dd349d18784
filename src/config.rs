//! Controller configuration with environment overrides

use crate::connection::LinkConfig;
use crate::transport::BleConfig;
use anyhow::{anyhow, Context, Result};
use bluer::Address;
use rabbit_shared::WireFormat;
use std::time::Duration;

/// Which transport carries commands to the car
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Real BLE GATT link (requires BlueZ)
    Ble,
    /// TCP link to `car-sim` (for development)
    #[default]
    TcpSimulation,
}

impl std::str::FromStr for TransportMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ble" | "bluetooth" => Ok(TransportMode::Ble),
            "tcp" | "sim" => Ok(TransportMode::TcpSimulation),
            other => Err(anyhow!("unknown transport: {} (expected ble or tcp)", other)),
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Ble => write!(f, "BLE"),
            TransportMode::TcpSimulation => write!(f, "TCP simulation"),
        }
    }
}

/// TCP simulation settings
#[derive(Debug, Clone)]
pub struct TcpSimConfig {
    /// Address `car-sim` listens on
    pub address: String,
    /// Time allowed for the simulator to ack one command
    pub write_timeout: Duration,
}

impl Default for TcpSimConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9000".into(),
            write_timeout: Duration::from_secs(2),
        }
    }
}

/// Top-level controller configuration
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    pub transport: TransportMode,
    pub wire_format: WireFormat,
    pub link: LinkConfig,
    pub ble: BleConfig,
    pub tcp: TcpSimConfig,
}

impl ControllerConfig {
    /// Defaults overridden by `RABBIT_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = lookup("RABBIT_TRANSPORT") {
            self.transport = value.parse()?;
        }
        if let Some(value) = lookup("RABBIT_WIRE_FORMAT") {
            self.wire_format = value
                .parse()
                .with_context(|| format!("RABBIT_WIRE_FORMAT={}", value))?;
        }
        if let Some(value) = lookup("RABBIT_SIM_ADDR") {
            self.tcp.address = value;
        }
        if let Some(value) = lookup("RABBIT_BLE_ADDRESS") {
            let address: Address = value
                .parse()
                .map_err(|e| anyhow!("RABBIT_BLE_ADDRESS={}: {}", value, e))?;
            self.ble.address = Some(address);
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> Result<ControllerConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ControllerConfig::default().with_overrides(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.transport, TransportMode::TcpSimulation);
        assert_eq!(config.wire_format, WireFormat::Json);
        assert_eq!(config.tcp.address, "127.0.0.1:9000");
        assert!(config.ble.address.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = overrides(&[
            ("RABBIT_TRANSPORT", "BLE"),
            ("RABBIT_WIRE_FORMAT", "text"),
            ("RABBIT_BLE_ADDRESS", "24:6F:28:AA:BB:CC"),
            ("RABBIT_SIM_ADDR", "10.0.0.2:9100"),
        ])
        .unwrap();

        assert_eq!(config.transport, TransportMode::Ble);
        assert_eq!(config.wire_format, WireFormat::Text);
        assert_eq!(
            config.ble.address,
            Some(Address::new([0x24, 0x6f, 0x28, 0xaa, 0xbb, 0xcc]))
        );
        assert_eq!(config.tcp.address, "10.0.0.2:9100");
    }

    #[test]
    fn test_invalid_overrides_rejected() {
        assert!(overrides(&[("RABBIT_TRANSPORT", "serial")]).is_err());
        assert!(overrides(&[("RABBIT_WIRE_FORMAT", "xml")]).is_err());
        assert!(overrides(&[("RABBIT_BLE_ADDRESS", "not-a-mac")]).is_err());
    }
}
