//! Rabbit Car Shared Protocol Types
//!
//! This crate provides the intent types, command codec and link scheduler
//! shared between the controller, its transports and the car simulator.

pub mod codec;
pub mod framing;
pub mod intent;
pub mod link_state;

pub use codec::{CodecError, CommandKind, DecodedCommand, EncodedCommand, Encoder, WireFormat};
pub use intent::{
    CriticalIntent, CriticalKind, FieldValue, Intent, IntentError, Movement, RunSettings,
};
pub use link_state::{ControlInputs, InFlight, LinkState, Step};

/// BLE identifiers advertised by the car firmware
pub mod ble {
    /// Primary GATT service exposed by the car
    pub const SERVICE_UUID: u128 = 0x4fafc201_1fb5_459e_8fcc_c5c9c331914b;

    /// Writable control characteristic that receives every command
    pub const CONTROL_CHARACTERISTIC_UUID: u128 = 0xbeb5483e_36e1_4688_b7f5_ea07361b26a8;

    /// Advertised device name prefix
    pub const DEVICE_NAME_PREFIX: &str = "ESP32 Rabbit";
}

/// Protocol limits and control ranges
pub mod limits {
    /// Maximum payload accepted in a single characteristic write (ATT attribute limit)
    pub const MAX_PAYLOAD_LEN: usize = 512;

    /// Steering servo angle when the wheels point straight ahead
    pub const STEERING_CENTER: i32 = 90;

    /// Smallest steering angle the servo accepts
    pub const STEERING_MIN: i32 = 45;

    /// Largest steering angle the servo accepts
    pub const STEERING_MAX: i32 = 135;

    /// Drive value that keeps the ESC at neutral
    pub const DRIVE_NEUTRAL: i32 = 0;

    /// Largest drive value observed on any deployment
    pub const DRIVE_MAX: i32 = 3000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ble_uuids_format() {
        assert_eq!(
            format!("{:032x}", ble::SERVICE_UUID),
            "4fafc2011fb5459e8fccc5c9c331914b"
        );
        assert_eq!(
            format!("{:032x}", ble::CONTROL_CHARACTERISTIC_UUID),
            "beb5483e36e14688b7f5ea07361b26a8"
        );
    }

    #[test]
    fn test_steering_range_contains_center() {
        assert!((limits::STEERING_MIN..=limits::STEERING_MAX).contains(&limits::STEERING_CENTER));
    }
}
