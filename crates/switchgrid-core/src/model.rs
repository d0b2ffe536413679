//! Controller data model — the core types persisted under `controller/<id>`
//! and exchanged with the gateway.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Divider splitting a global pin id into (client id, local pin id).
pub const PIN_ID_MULTIPLIER: u32 = 100;

/// Binary pin level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PinValue {
    High,
    #[default]
    Low,
}

/// Pin direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinMode {
    Input,
    Output,
}

/// One binary input/output line. The id encodes an optional satellite
/// address: `id / 100` is the client id (0 = local hardware), `id % 100`
/// is the pin number on that client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pin {
    pub id: u32,
    pub mode: PinMode,
    #[serde(default)]
    pub value: PinValue,
}

/// An addressable collection of pins managed as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Controller {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pins: Vec<Pin>,
}

impl Controller {
    /// An empty-pin shell for the given id, used to read back current
    /// hardware state without driving anything.
    pub fn shell(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            description: String::new(),
            pins: Vec::new(),
        }
    }
}

/// Persisted processor configuration, stored as JSON at `controller/<id>`.
///
/// `version == 0` is the "externally modified" sentinel: the registry must
/// rebuild its cached processor and write back a fresh nonzero stamp.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProcessorConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub controller: Option<Controller>,
    #[serde(default)]
    pub version: i64,
}

/// Split a global pin id into (client id, local pin id).
pub fn resolve_pin(id: u32) -> (u32, u32) {
    (id / PIN_ID_MULTIPLIER, id % PIN_ID_MULTIPLIER)
}

/// A fresh nonzero version stamp. Opaque: used purely for change detection,
/// never for time arithmetic.
pub fn version_stamp() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_pin() {
        assert_eq!(resolve_pin(5), (0, 5));
        assert_eq!(resolve_pin(205), (2, 5));
        assert_eq!(resolve_pin(100), (1, 0));
        assert_eq!(resolve_pin(0), (0, 0));
    }

    #[test]
    fn test_version_stamp_nonzero() {
        assert_ne!(version_stamp(), 0);
    }

    #[test]
    fn test_pin_value_wire_spelling() {
        assert_eq!(serde_json::to_string(&PinValue::High).unwrap(), "\"High\"");
        assert_eq!(serde_json::to_string(&PinValue::Low).unwrap(), "\"Low\"");
        assert_eq!(serde_json::to_string(&PinMode::Output).unwrap(), "\"Output\"");
    }

    #[test]
    fn test_processor_config_roundtrip() {
        let config = ProcessorConfig {
            host: "127.0.0.1".into(),
            port: 9000,
            api_key: "k".into(),
            controller: Some(Controller {
                id: "c1".into(),
                name: "porch".into(),
                description: String::new(),
                pins: vec![Pin { id: 5, mode: PinMode::Output, value: PinValue::Low }],
            }),
            version: 42,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ProcessorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.version, 42);
        assert_eq!(back.controller.unwrap().pins[0].id, 5);
    }

    #[test]
    fn test_missing_fields_default() {
        let config: ProcessorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.version, 0);
        assert!(config.controller.is_none());
    }
}
