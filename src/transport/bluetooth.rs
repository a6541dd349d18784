//! Bluetooth LE transport writing to the car's GATT control characteristic

use crate::transport::bt_discovery::{BtDiscovery, BtDiscoveryConfig};
use crate::transport::traits::{CommandLink, Connection, LinkConnector, TransportError};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Address, Device, DeviceEvent, DeviceProperty, Uuid};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use rabbit_shared::ble;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default time allowed for one write-with-response
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for the BLE connector
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Known car address (skips discovery)
    pub address: Option<Address>,
    /// Discovery configuration
    pub discovery: BtDiscoveryConfig,
    /// Time allowed for one characteristic write
    pub write_timeout: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            address: None,
            discovery: BtDiscoveryConfig::default(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Control characteristic of a connected car
pub struct GattLink {
    device: Device,
    characteristic: Characteristic,
    write_timeout: Duration,
}

#[async_trait]
impl CommandLink for GattLink {
    async fn write(&self, payload: Bytes) -> Result<(), TransportError> {
        match timeout(self.write_timeout, self.characteristic.write(&payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::WriteFailed(e.to_string())),
            Err(_) => Err(TransportError::Timeout(self.write_timeout)),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.device
            .disconnect()
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "Bluetooth"
    }
}

/// BLE connector for the car
pub struct BluetoothConnector {
    config: BleConfig,
}

impl BluetoothConnector {
    /// Create a new connector
    pub fn new(config: BleConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LinkConnector for BluetoothConnector {
    async fn connect(&self) -> Result<Connection> {
        let adapter = BtDiscovery::get_adapter().await?;

        let target = match self.config.address {
            Some(addr) => addr,
            None => {
                let discovery = BtDiscovery::new(self.config.discovery.clone());
                discovery.find_best_car(&adapter).await?.address
            }
        };

        info!("[BLE] Connecting to {}", target);
        let device = adapter.device(target)?;
        if !device.is_connected().await? {
            device
                .connect()
                .await
                .map_err(|e| anyhow!("GATT connect to {} failed: {}", target, e))?;
        }

        let characteristic = find_control_characteristic(&device).await?;
        let events = device.events().await?;

        let (disconnected_tx, disconnected_rx) = oneshot::channel();
        tokio::spawn(watch_disconnect(events, disconnected_tx));

        info!("[BLE] Connected to {}", target);
        Ok(Connection {
            link: Arc::new(GattLink {
                device,
                characteristic,
                write_timeout: self.config.write_timeout,
            }),
            disconnected: disconnected_rx,
            peer: target.to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "Bluetooth"
    }
}

/// Resolve the control characteristic inside the car's primary service
async fn find_control_characteristic(device: &Device) -> Result<Characteristic> {
    let service_uuid = Uuid::from_u128(ble::SERVICE_UUID);
    let control_uuid = Uuid::from_u128(ble::CONTROL_CHARACTERISTIC_UUID);

    for service in device.services().await? {
        if service.uuid().await? != service_uuid {
            continue;
        }
        debug!("[BLE] Found control service {}", service_uuid);

        for characteristic in service.characteristics().await? {
            if characteristic.uuid().await? == control_uuid {
                return Ok(characteristic);
            }
        }
    }

    Err(anyhow!(
        "Control characteristic {} not found on {}",
        control_uuid,
        device.address()
    ))
}

/// Report the first `Connected(false)` property change
async fn watch_disconnect(
    events: impl Stream<Item = DeviceEvent>,
    disconnected_tx: oneshot::Sender<String>,
) {
    tokio::pin!(events);
    while let Some(event) = events.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            warn!("[BLE] Device disconnected");
            let _ = disconnected_tx.send("device disconnected".into());
            return;
        }
    }
    let _ = disconnected_tx.send("device event stream ended".into());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BleConfig::default();
        assert!(config.address.is_none());
        assert_eq!(config.write_timeout, DEFAULT_WRITE_TIMEOUT);
    }

    #[test]
    fn test_connector_with_address() {
        let addr = Address::new([0x24, 0x6f, 0x28, 0x11, 0x22, 0x33]);
        let connector = BluetoothConnector::new(BleConfig {
            address: Some(addr),
            ..Default::default()
        });
        assert_eq!(connector.config.address, Some(addr));
        assert_eq!(connector.name(), "Bluetooth");
    }
}
