//! Bluetooth LE discovery for finding the car

use anyhow::{anyhow, Result};
use bluer::{Adapter, Address, Device, Uuid};
use rabbit_shared::ble;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Configuration for BLE discovery
#[derive(Debug, Clone)]
pub struct BtDiscoveryConfig {
    /// How long to scan for devices
    pub scan_duration: Duration,
    /// Known car addresses (preferred)
    pub known_cars: Vec<Address>,
    /// Device name prefix to match
    pub name_prefix: Option<String>,
}

impl Default for BtDiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(10),
            known_cars: Vec::new(),
            name_prefix: Some(ble::DEVICE_NAME_PREFIX.into()),
        }
    }
}

/// Information about a discovered car
#[derive(Debug, Clone)]
pub struct CarDevice {
    /// Bluetooth MAC address
    pub address: Address,
    /// Advertised name (if available)
    pub name: Option<String>,
    /// Signal strength (if available)
    pub rssi: Option<i16>,
}

/// BLE device discovery service
pub struct BtDiscovery {
    config: BtDiscoveryConfig,
}

impl BtDiscovery {
    /// Create a new discovery service
    pub fn new(config: BtDiscoveryConfig) -> Self {
        Self { config }
    }

    /// Get the default Bluetooth adapter
    pub async fn get_adapter() -> Result<Adapter> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        Ok(adapter)
    }

    /// Discover cars advertising the control service
    pub async fn discover_cars(&self, adapter: &Adapter) -> Result<Vec<CarDevice>> {
        let mut cars = Vec::new();
        let mut seen: HashSet<Address> = HashSet::new();

        // Known cars that are already connected need no scan
        for &addr in &self.config.known_cars {
            if let Ok(device) = adapter.device(addr) {
                if let Ok(true) = device.is_connected().await {
                    cars.push(describe(&device).await);
                    seen.insert(addr);
                }
            }
        }

        let discover = adapter.discover_devices().await?;
        tokio::pin!(discover);

        let scan_result = timeout(self.config.scan_duration, async {
            use futures::StreamExt;
            while let Some(evt) = discover.next().await {
                if let bluer::AdapterEvent::DeviceAdded(addr) = evt {
                    if seen.contains(&addr) {
                        continue;
                    }

                    if let Ok(device) = adapter.device(addr) {
                        if self.is_car_device(&device).await {
                            let car = describe(&device).await;
                            debug!("[BLE] Found car {} ({:?})", car.address, car.name);
                            cars.push(car);
                            seen.insert(addr);
                        }
                    }
                }
            }
        })
        .await;

        // Timeout is expected, not an error
        if scan_result.is_err() {
            info!("[BLE] Discovery scan completed, {} car(s) found", cars.len());
        }

        sort_by_signal(&mut cars);
        Ok(cars)
    }

    /// Check if a device is a car (known address, service UUID or name prefix)
    async fn is_car_device(&self, device: &Device) -> bool {
        if self.config.known_cars.contains(&device.address()) {
            return true;
        }

        if let Ok(Some(uuids)) = device.uuids().await {
            if uuids.contains(&Uuid::from_u128(ble::SERVICE_UUID)) {
                return true;
            }
        }

        if let Some(ref prefix) = self.config.name_prefix {
            if let Ok(Some(name)) = device.name().await {
                if name.starts_with(prefix) {
                    return true;
                }
            }
        }

        false
    }

    /// Find the best car (strongest signal)
    pub async fn find_best_car(&self, adapter: &Adapter) -> Result<CarDevice> {
        let cars = self.discover_cars(adapter).await?;
        cars.into_iter()
            .next()
            .ok_or_else(|| anyhow!("No car found advertising the control service"))
    }
}

async fn describe(device: &Device) -> CarDevice {
    CarDevice {
        address: device.address(),
        name: device.name().await.ok().flatten(),
        rssi: device.rssi().await.ok().flatten(),
    }
}

/// Strongest signal first; unknown RSSI sorts last
fn sort_by_signal(cars: &mut [CarDevice]) {
    cars.sort_by(|a, b| {
        let rssi_a = a.rssi.unwrap_or(i16::MIN);
        let rssi_b = b.rssi.unwrap_or(i16::MIN);
        rssi_b.cmp(&rssi_a)
    });
}
