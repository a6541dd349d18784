//! Command links to the car
//!
//! The car is reached over BLE GATT in the field, or over TCP to `car-sim`
//! during development. Both implement [`CommandLink`].

mod bluetooth;
mod bt_discovery;
mod tcp;
mod traits;

pub use bluetooth::{BleConfig, BluetoothConnector};
pub use tcp::TcpConnector;
pub use traits::{CommandLink, Connection, LinkConnector, TransportError};
