//! Intents produced by the control surfaces
//!
//! An intent is either a discrete critical command that must reach the car in
//! order, or a movement sample where only the latest value matters.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::limits;

/// Keys a run command sets itself; tuning parameters may not use them
pub const RESERVED_KEYS: [&str; 7] = [
    "type",
    "running",
    "distance",
    "time",
    "pace",
    "isWhiteLine",
    "mode",
];

/// Errors raised while building intents
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntentError {
    #[error("Tuning key {0:?} is reserved")]
    ReservedKey(String),
}

/// Discriminator of a critical command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CriticalKind {
    /// Switch between manual driving and autonomous pacing
    ManualControl,
    /// Start or stop a run
    Running,
    /// Select a white or black guide line
    IsWhiteLine,
    /// Push run settings without starting
    Settings,
}

impl CriticalKind {
    /// Wire name of this command type
    pub fn as_str(&self) -> &'static str {
        match self {
            CriticalKind::ManualControl => "manualControl",
            CriticalKind::Running => "running",
            CriticalKind::IsWhiteLine => "isWhiteLine",
            CriticalKind::Settings => "settings",
        }
    }

    /// Parse a wire name back into a kind
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "manualControl" => Some(CriticalKind::ManualControl),
            "running" => Some(CriticalKind::Running),
            "isWhiteLine" => Some(CriticalKind::IsWhiteLine),
            "settings" => Some(CriticalKind::Settings),
            _ => None,
        }
    }

    /// Whether the car reinterprets movement after this command.
    ///
    /// Movement history is meaningless across a driving mode switch.
    pub fn is_mode_change(&self) -> bool {
        matches!(self, CriticalKind::ManualControl)
    }
}

impl fmt::Display for CriticalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primitive value carried by a critical command
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v.into())
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Text(v) => f.write_str(v),
        }
    }
}

/// Run parameters entered by the operator
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunSettings {
    /// Target distance in meters
    pub distance_m: f64,
    /// Target run time in seconds
    pub time_s: f64,
    /// Target pace in m/s
    pub pace_mps: f64,
    /// Follow a white line instead of a black one
    pub is_white_line: bool,
    /// Optional pacing mode name understood by the firmware
    pub mode: Option<String>,
    /// Controller tuning parameters (e.g. line follower gains)
    pub tuning: BTreeMap<String, f64>,
}

impl RunSettings {
    /// Set a tuning parameter sent along with the start command
    pub fn set_tuning(&mut self, key: impl Into<String>, value: f64) -> Result<(), IntentError> {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            return Err(IntentError::ReservedKey(key));
        }
        self.tuning.insert(key, value);
        Ok(())
    }

    fn write_fields(&self, fields: &mut BTreeMap<String, FieldValue>) {
        fields.insert("distance".into(), self.distance_m.into());
        fields.insert("time".into(), self.time_s.into());
        fields.insert("pace".into(), self.pace_mps.into());
        fields.insert("isWhiteLine".into(), self.is_white_line.into());
    }
}

/// A discrete command that must not be lost or reordered
#[derive(Debug, Clone, PartialEq)]
pub struct CriticalIntent {
    pub kind: CriticalKind,
    pub fields: BTreeMap<String, FieldValue>,
}

impl CriticalIntent {
    /// Create a critical intent with no fields
    pub fn new(kind: CriticalKind) -> Self {
        Self {
            kind,
            fields: BTreeMap::new(),
        }
    }

    /// Add a field, replacing any previous value under the same key
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Toggle manual driving
    pub fn manual_control(enabled: bool) -> Self {
        Self::new(CriticalKind::ManualControl).with("enabled", enabled)
    }

    /// Start or stop without touching the stored run settings
    pub fn running(running: bool) -> Self {
        Self::new(CriticalKind::Running).with("running", running)
    }

    /// Start a run with the given settings
    pub fn start(settings: &RunSettings) -> Self {
        let mut intent = Self::running(true);
        settings.write_fields(&mut intent.fields);
        if let Some(ref mode) = settings.mode {
            intent.fields.insert("mode".into(), mode.as_str().into());
        }
        // Core fields win over tuning entries added without `set_tuning`
        for (key, value) in &settings.tuning {
            if !RESERVED_KEYS.contains(&key.as_str()) {
                intent.fields.insert(key.clone(), (*value).into());
            }
        }
        intent
    }

    /// Stop the car
    pub fn stop() -> Self {
        Self::running(false)
    }

    /// Select the guide line colour
    pub fn is_white_line(enabled: bool) -> Self {
        Self::new(CriticalKind::IsWhiteLine).with("enabled", enabled)
    }

    /// Push run settings without starting
    pub fn settings(settings: &RunSettings) -> Self {
        let mut intent = Self::new(CriticalKind::Settings);
        settings.write_fields(&mut intent.fields);
        intent
    }
}

/// Steering and drive sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Movement {
    /// Steering servo angle in degrees
    pub angle: i32,
    /// Drive value sent to the ESC
    pub motor_speed: i32,
}

impl Movement {
    /// Wheels straight, motor at neutral
    pub const CENTERED: Movement = Movement {
        angle: limits::STEERING_CENTER,
        motor_speed: limits::DRIVE_NEUTRAL,
    };

    pub fn new(angle: i32, motor_speed: i32) -> Self {
        Self { angle, motor_speed }
    }

    /// Return a copy limited to the servo and ESC ranges
    pub fn clamped(self) -> Self {
        Self {
            angle: self.angle.clamp(limits::STEERING_MIN, limits::STEERING_MAX),
            motor_speed: self.motor_speed.clamp(-limits::DRIVE_MAX, limits::DRIVE_MAX),
        }
    }
}

impl fmt::Display for Movement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X:{}, Y:{}", self.angle, self.motor_speed)
    }
}

/// Anything the control surfaces can ask the car to do
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Critical(CriticalIntent),
    Movement(Movement),
}

impl From<CriticalIntent> for Intent {
    fn from(intent: CriticalIntent) -> Self {
        Intent::Critical(intent)
    }
}

impl From<Movement> for Intent {
    fn from(movement: Movement) -> Self {
        Intent::Movement(movement)
    }
}
