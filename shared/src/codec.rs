//! Command codec for the control characteristic
//!
//! Every intent is written to the car as a single self-describing payload.
//! Two wire formats are supported:
//!
//! ```text
//! Json: {"angle":100,"motorSpeed":400,"type":"movement"}
//! Text: movement$ X:100,Y:400
//! ```
//!
//! Keys are always emitted in sorted order so identical intents produce
//! identical bytes.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::intent::{CriticalKind, FieldValue, Intent, Movement};
use crate::limits::MAX_PAYLOAD_LEN;

/// Wire name of a movement command
pub const MOVEMENT_TYPE: &str = "movement";

/// Toggle field carried by `manualControl` and `isWhiteLine`
const ENABLED_KEY: &str = "enabled";

/// Errors that can occur while decoding a payload
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Payload too large: {0} bytes (max: {MAX_PAYLOAD_LEN})")]
    PayloadTooLarge(usize),

    #[error("Payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Payload layout written to the car
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Flat JSON object with a `type` key
    #[default]
    Json,
    /// Legacy `type$ key:value,key:value` line parsed by older firmware
    Text,
}

impl std::str::FromStr for WireFormat {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(WireFormat::Json),
            "text" => Ok(WireFormat::Text),
            other => Err(CodecError::Malformed(format!("unknown wire format: {}", other))),
        }
    }
}

/// What an encoded payload was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Critical(CriticalKind),
    Movement,
}

impl CommandKind {
    /// Whether completing this command invalidates movement history
    pub fn is_mode_change(&self) -> bool {
        match self {
            CommandKind::Critical(kind) => kind.is_mode_change(),
            CommandKind::Movement => false,
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, CommandKind::Critical(_))
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Critical(kind) => write!(f, "{}", kind),
            CommandKind::Movement => f.write_str(MOVEMENT_TYPE),
        }
    }
}

/// An immutable payload ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCommand {
    kind: CommandKind,
    payload: Bytes,
}

impl EncodedCommand {
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl fmt::Display for EncodedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.payload))
    }
}

/// Turns intents into payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder {
    format: WireFormat,
}

impl Encoder {
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode an intent. Deterministic and infallible.
    pub fn encode(&self, intent: &Intent) -> EncodedCommand {
        match intent {
            Intent::Critical(critical) => {
                let fields = critical
                    .fields
                    .iter()
                    .map(|(k, v)| (self.field_key(critical.kind, k), v.clone()))
                    .collect();
                EncodedCommand {
                    kind: CommandKind::Critical(critical.kind),
                    payload: self.render(critical.kind.as_str(), fields),
                }
            }
            Intent::Movement(movement) => EncodedCommand {
                kind: CommandKind::Movement,
                payload: self.render_movement(movement),
            },
        }
    }

    /// Shorthand for encoding a movement sample
    pub fn encode_movement(&self, movement: Movement) -> EncodedCommand {
        self.encode(&Intent::Movement(movement))
    }

    fn field_key<'a>(&self, kind: CriticalKind, key: &'a str) -> &'a str {
        match (self.format, text_enabled_key(kind)) {
            (WireFormat::Text, Some(alias)) if key == ENABLED_KEY => alias,
            _ => key,
        }
    }

    fn render_movement(&self, movement: &Movement) -> Bytes {
        let mut fields = BTreeMap::new();
        match self.format {
            WireFormat::Json => {
                fields.insert("angle", FieldValue::Int(movement.angle.into()));
                fields.insert("motorSpeed", FieldValue::Int(movement.motor_speed.into()));
            }
            // The firmware locates "X:" and ",Y:" in the raw string
            WireFormat::Text => {
                fields.insert("X", FieldValue::Int(movement.angle.into()));
                fields.insert("Y", FieldValue::Int(movement.motor_speed.into()));
            }
        }
        self.render(MOVEMENT_TYPE, fields)
    }

    fn render(&self, type_name: &str, fields: BTreeMap<&str, FieldValue>) -> Bytes {
        match self.format {
            WireFormat::Json => {
                let mut sorted: BTreeMap<&str, Value> =
                    fields.into_iter().map(|(k, v)| (k, to_json(v))).collect();
                sorted.insert("type", Value::String(type_name.to_string()));

                // Insert in key order so the output is sorted even with `preserve_order`
                let mut map = Map::new();
                for (key, value) in sorted {
                    map.insert(key.to_string(), value);
                }
                Bytes::from(Value::Object(map).to_string())
            }
            WireFormat::Text => {
                let body = fields
                    .iter()
                    .map(|(k, v)| format!("{}:{}", k, v))
                    .collect::<Vec<_>>()
                    .join(",");
                Bytes::from(format!("{}$ {}", type_name, body))
            }
        }
    }
}

/// Key the text firmware parser looks for in place of `enabled`
fn text_enabled_key(kind: CriticalKind) -> Option<&'static str> {
    match kind {
        CriticalKind::ManualControl => Some("manual"),
        CriticalKind::IsWhiteLine => Some("isWhiteLine"),
        CriticalKind::Running | CriticalKind::Settings => None,
    }
}

fn to_json(value: FieldValue) -> Value {
    match value {
        FieldValue::Bool(v) => Value::Bool(v),
        FieldValue::Int(v) => Value::from(v),
        // JSON has no NaN or infinity; spell them as the text format does
        FieldValue::Float(v) if !v.is_finite() => Value::String(v.to_string()),
        FieldValue::Float(v) => Value::from(v),
        FieldValue::Text(v) => Value::String(v),
    }
}

fn from_json(key: &str, value: &Value) -> Result<FieldValue, CodecError> {
    match value {
        Value::Bool(v) => Ok(FieldValue::Bool(*v)),
        Value::Number(n) => match n.as_i64() {
            Some(v) => Ok(FieldValue::Int(v)),
            None => n
                .as_f64()
                .map(FieldValue::Float)
                .ok_or_else(|| CodecError::Malformed(format!("number out of range for {}", key))),
        },
        Value::String(v) => Ok(match non_finite(v) {
            Some(f) => FieldValue::Float(f),
            None => FieldValue::Text(v.clone()),
        }),
        _ => Err(CodecError::Malformed(format!(
            "field {} is not a primitive value",
            key
        ))),
    }
}

fn non_finite(raw: &str) -> Option<f64> {
    match raw {
        "NaN" => Some(f64::NAN),
        "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

fn parse_text_value(raw: &str) -> FieldValue {
    match raw {
        "true" => FieldValue::Bool(true),
        "false" => FieldValue::Bool(false),
        _ => {
            if let Ok(v) = raw.parse::<i64>() {
                FieldValue::Int(v)
            } else if let Ok(v) = raw.parse::<f64>() {
                FieldValue::Float(v)
            } else {
                FieldValue::Text(raw.to_string())
            }
        }
    }
}

/// A payload parsed back into its type and fields
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCommand {
    pub type_name: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl DecodedCommand {
    /// Classify the command, if its type is known
    pub fn kind(&self) -> Option<CommandKind> {
        if self.type_name == MOVEMENT_TYPE {
            return Some(CommandKind::Movement);
        }
        CriticalKind::from_wire(&self.type_name).map(CommandKind::Critical)
    }

    /// Extract the movement sample from either wire format
    pub fn movement(&self) -> Option<Movement> {
        if self.type_name != MOVEMENT_TYPE {
            return None;
        }
        let angle = self.get_int("angle").or_else(|| self.get_int("X"))?;
        let speed = self.get_int("motorSpeed").or_else(|| self.get_int("Y"))?;
        Some(Movement::new(
            i32::try_from(angle).ok()?,
            i32::try_from(speed).ok()?,
        ))
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.fields.get(key) {
            Some(FieldValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.fields.get(key) {
            Some(FieldValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        match self.fields.get(key) {
            Some(FieldValue::Float(v)) => Some(*v),
            Some(FieldValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }
}

/// Decode a payload written in either wire format
pub fn decode(payload: &[u8]) -> Result<DecodedCommand, CodecError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }

    let text = std::str::from_utf8(payload)?.trim();
    if text.starts_with('{') {
        decode_json(text)
    } else {
        decode_text(text)
    }
}

fn decode_json(text: &str) -> Result<DecodedCommand, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    let object = value
        .as_object()
        .ok_or_else(|| CodecError::Malformed("payload is not an object".into()))?;

    let type_name = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::Malformed("missing type".into()))?
        .to_string();

    let mut fields = BTreeMap::new();
    for (key, value) in object {
        if key == "type" {
            continue;
        }
        fields.insert(key.clone(), from_json(key, value)?);
    }

    Ok(DecodedCommand { type_name, fields })
}

fn decode_text(text: &str) -> Result<DecodedCommand, CodecError> {
    let (type_name, body) = text
        .split_once('$')
        .ok_or_else(|| CodecError::Malformed("missing type separator".into()))?;

    let type_name = type_name.trim();
    if type_name.is_empty() {
        return Err(CodecError::Malformed("empty type".into()));
    }

    let alias = CriticalKind::from_wire(type_name).and_then(text_enabled_key);
    let mut fields = BTreeMap::new();
    for pair in body.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once(':')
            .ok_or_else(|| CodecError::Malformed(format!("field without value: {}", pair)))?;
        let key = match key.trim() {
            key if Some(key) == alias => ENABLED_KEY,
            key => key,
        };
        fields.insert(key.to_string(), parse_text_value(value.trim()));
    }

    Ok(DecodedCommand {
        type_name: type_name.to_string(),
        fields,
    })
}
