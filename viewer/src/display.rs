//! Text the presentation layer shows for the current view.

use crate::dispatch::{Controls, Pending};
use crate::model::Alert;
use crate::sync::{DeviceView, Link};
use serde::Serialize;
use std::fmt::Display;
use std::time::Duration;
use tokio::time::Instant;

pub const UNKNOWN: &str = "unknown";

pub fn mode_label(view: &DeviceView, offline: bool) -> &'static str {
    if offline {
        return "OFFLINE";
    }
    match view.auto_mode() {
        Some(true) => "AUTO",
        Some(false) => "MANUAL",
        None => "UNKNOWN",
    }
}

pub fn pump_label(view: &DeviceView, offline: bool) -> &'static str {
    if offline {
        return "—";
    }
    match view.pump_running() {
        Some(true) => "Running",
        Some(false) => "Stopped",
        None => "—",
    }
}

pub fn last_seen_label(ago: Option<Duration>) -> String {
    let Some(ago) = ago else {
        return "never".to_string();
    };
    let secs = ago.as_secs();
    match secs {
        0..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        _ => format!("{}h ago", secs / 3600),
    }
}

/// Pump runtime as `"2m 5s"`, or `"45s"` under a minute.
pub fn format_runtime(secs: u64) -> String {
    let (m, s) = (secs / 60, secs % 60);
    if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

pub fn value_or_unknown<T: Display>(value: Option<T>) -> String {
    value.map_or_else(|| UNKNOWN.to_string(), |v| v.to_string())
}

/// Flattened, display-ready form of the view.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub mode: &'static str,
    pub pump: &'static str,
    pub offline: bool,
    pub link: Link,
    pub last_seen: String,
    pub temperature: String,
    pub humidity: String,
    pub soil_moisture: String,
    pub water_level: String,
    pub uptime: String,
    pub ip_address: String,
    pub alerts: Vec<Alert>,
    pub pending: Pending,
    pub controls: Controls,
}

impl StatusSummary {
    pub fn build(view: &DeviceView, offline: bool, pending: Pending, now: Instant) -> Self {
        let telemetry = view.telemetry.clone().unwrap_or_default();
        Self {
            mode: mode_label(view, offline),
            pump: pump_label(view, offline),
            offline,
            link: view.link,
            last_seen: last_seen_label(view.last_seen_ago(now)),
            temperature: value_or_unknown(telemetry.temperature.map(|t| format!("{:.1} °C", t))),
            humidity: value_or_unknown(telemetry.humidity.map(|h| format!("{:.0} %", h))),
            soil_moisture: value_or_unknown(telemetry.soil_moisture),
            water_level: value_or_unknown(telemetry.water_level),
            uptime: value_or_unknown(telemetry.uptime_sec.map(format_runtime)),
            ip_address: value_or_unknown(telemetry.ip_address),
            alerts: view.alerts.iter().cloned().collect(),
            pending,
            controls: Controls::evaluate(view, offline),
        }
    }
}
