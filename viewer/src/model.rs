use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sensor snapshot published by the device.
///
/// Every field is optional on the wire. A field the device omits stays `None`
/// and is never filled in from an earlier snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTelemetry {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture: Option<i64>,
    pub water_level: Option<i64>,
    pub uptime_sec: Option<u64>,
    pub ip_address: Option<String>,
}

/// Device configuration as last reported by the device.
///
/// `pump_running` mirrors the pump relay and can only change on the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub auto_mode: Option<bool>,
    pub dry_threshold: Option<i64>,
    pub pump_duration: Option<i64>,
    pub water_min_level: Option<i64>,
    pub pump_running: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub message: String,
    pub level: AlertLevel,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PumpState {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

impl fmt::Display for PumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PumpState::On => f.write_str("ON"),
            PumpState::Off => f.write_str("OFF"),
        }
    }
}

/// Body of a `set pump` call. Without a duration the device runs for its
/// configured `pump_duration`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpCommand {
    pub state: PumpState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

/// Partial configuration change proposed by the operator.
///
/// Thresholds are signed so that malformed input reaches validation instead
/// of failing to parse. There is deliberately no `pump_running` field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_threshold: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pump_duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub water_min_level: Option<i64>,
}

impl ConfigUpdate {
    pub fn mode(auto_on: bool) -> Self {
        Self {
            auto_mode: Some(auto_on),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.auto_mode.is_none()
            && self.dry_threshold.is_none()
            && self.pump_duration.is_none()
            && self.water_min_level.is_none()
    }
}

/// One event received on the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Telemetry(DeviceTelemetry),
    Config(DeviceConfig),
    Alert(Alert),
}

impl PushEvent {
    pub const TELEMETRY: &'static str = "telemetry";
    pub const CONFIG: &'static str = "config";
    pub const ALERT: &'static str = "alert";

    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::Telemetry(_) => Self::TELEMETRY,
            PushEvent::Config(_) => Self::CONFIG,
            PushEvent::Alert(_) => Self::ALERT,
        }
    }

    pub fn payload(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            PushEvent::Telemetry(t) => serde_json::to_vec(t),
            PushEvent::Config(c) => serde_json::to_vec(c),
            PushEvent::Alert(a) => serde_json::to_vec(a),
        }
    }
}

/// Logical command families, each guarded by its own in-flight slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Mode,
    Pump,
    Config,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Mode => f.write_str("mode"),
            CommandKind::Pump => f.write_str("pump"),
            CommandKind::Config => f.write_str("config"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyStat {
    pub hour: DateTime<Utc>,
    pub avg_temperature: f64,
    #[serde(default)]
    pub avg_humidity: Option<f64>,
    #[serde(default)]
    pub avg_soil_moisture: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStat {
    pub day: NaiveDate,
    pub avg_temperature: f64,
    pub avg_humidity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PumpUsage {
    pub day: NaiveDate,
    pub activations: u32,
    pub runtime_seconds: u64,
}
