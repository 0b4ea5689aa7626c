//! Simulated plant-watering device.
//!
//! Soil moisture is a raw sensor reading: higher means drier. In auto mode
//! the device waters whenever the soil reaches the dry threshold and the
//! tank holds at least the minimum level.

use chrono::{DateTime, Duration, DurationRound, NaiveDate, Utc};
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use viewer::errors::{Precondition, Result};
use viewer::model::{
    Alert, AlertLevel, ConfigUpdate, DailyStat, DeviceConfig, DeviceTelemetry, HourlyStat,
    PumpCommand, PumpState, PumpUsage,
};
use viewer::validate::{validate_duration, validate_update};

const ALERT_HISTORY: usize = 50;
const HOURLY_HISTORY: usize = 48;
const DAILY_HISTORY: usize = 30;

const SOIL_MAX: i64 = 1023;
const WATER_MAX: i64 = 1000;
/// Per step, while the tank is low.
const REFILL_CHANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub auto_mode: bool,
    pub dry_threshold: i64,
    pub pump_duration: i64,
    pub water_min_level: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_mode: true,
            dry_threshold: 450,
            pump_duration: 10,
            water_min_level: 100,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PumpRun {
    started: DateTime<Utc>,
    until: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Accum {
    count: u32,
    temperature: f64,
    humidity: f64,
    soil_moisture: f64,
}

impl Accum {
    fn add(&mut self, temperature: f64, humidity: f64, soil_moisture: i64) {
        self.count += 1;
        self.temperature += temperature;
        self.humidity += humidity;
        self.soil_moisture += soil_moisture as f64;
    }

    fn mean(&self, sum: f64) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            sum / self.count as f64
        }
    }
}

pub struct Device {
    settings: Settings,
    temperature: f64,
    humidity: f64,
    soil_moisture: i64,
    water_level: i64,
    ip_address: String,
    booted: DateTime<Utc>,
    pump: Option<PumpRun>,
    /// Set while the tank is too low to water, so the alert fires once.
    tank_low: bool,
    /// Set once the dry-soil warning went out in manual mode.
    dry_reported: bool,
    alerts: VecDeque<Alert>,
    hourly: BTreeMap<DateTime<Utc>, Accum>,
    daily: BTreeMap<NaiveDate, Accum>,
    pump_usage: BTreeMap<NaiveDate, PumpUsage>,
}

impl Device {
    pub fn new(ip_address: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            settings: Settings::default(),
            temperature: 22.0,
            humidity: 50.0,
            soil_moisture: 400,
            water_level: 600,
            ip_address: ip_address.into(),
            booted: now,
            pump: None,
            tank_low: false,
            dry_reported: false,
            alerts: VecDeque::new(),
            hourly: BTreeMap::new(),
            daily: BTreeMap::new(),
            pump_usage: BTreeMap::new(),
        }
    }

    pub fn pump_running(&self) -> bool {
        self.pump.is_some()
    }

    /// Advances the simulation by one reporting period.
    ///
    /// Returns the alerts raised during the step, oldest first.
    pub fn step(&mut self, rng: &mut impl Rng, now: DateTime<Utc>) -> Vec<Alert> {
        let mut raised = Vec::new();

        self.temperature = (self.temperature + rng.gen_range(-0.3..0.3)).clamp(10.0, 40.0);
        self.humidity = (self.humidity + rng.gen_range(-1.0..1.0)).clamp(20.0, 90.0);

        if self.tank_low && rng.gen_bool(REFILL_CHANCE) {
            self.refill();
        }

        match self.pump {
            Some(run) if now >= run.until => {
                self.stop_pump(run.until);
            }
            Some(_) => {
                self.soil_moisture = (self.soil_moisture - rng.gen_range(10..20)).max(0);
                self.water_level = (self.water_level - rng.gen_range(2..5)).max(0);
            }
            None => {
                self.soil_moisture = (self.soil_moisture + rng.gen_range(0..6)).min(SOIL_MAX);
            }
        }

        if self.settings.auto_mode && self.pump.is_none() && self.is_dry() {
            if self.water_level >= self.settings.water_min_level {
                self.tank_low = false;
                self.start_pump(self.settings.pump_duration, now);
                raised.push(self.raise(AlertLevel::Info, "Auto watering started", now));
            } else if !self.tank_low {
                self.tank_low = true;
                raised.push(self.raise(
                    AlertLevel::Critical,
                    "Water tank low, watering skipped",
                    now,
                ));
            }
        }

        if !self.is_dry() {
            self.dry_reported = false;
        } else if !self.settings.auto_mode && self.pump.is_none() && !self.dry_reported {
            self.dry_reported = true;
            raised.push(self.raise(AlertLevel::Warning, "Soil is dry", now));
        }

        self.record(now);
        raised
    }

    pub fn telemetry(&self, now: DateTime<Utc>) -> DeviceTelemetry {
        DeviceTelemetry {
            temperature: Some((self.temperature * 10.0).round() / 10.0),
            humidity: Some((self.humidity * 10.0).round() / 10.0),
            soil_moisture: Some(self.soil_moisture),
            water_level: Some(self.water_level),
            uptime_sec: Some((now - self.booted).num_seconds().max(0) as u64),
            ip_address: Some(self.ip_address.clone()),
        }
    }

    pub fn config(&self) -> DeviceConfig {
        DeviceConfig {
            auto_mode: Some(self.settings.auto_mode),
            dry_threshold: Some(self.settings.dry_threshold),
            pump_duration: Some(self.settings.pump_duration),
            water_min_level: Some(self.settings.water_min_level),
            pump_running: Some(self.pump_running()),
        }
    }

    /// Manual pump control. Starting is refused while auto mode owns the
    /// pump; stopping a running pump is always allowed.
    pub fn apply_pump(&mut self, command: &PumpCommand, now: DateTime<Utc>) -> Result<()> {
        validate_duration(command.duration)?;

        match (command.state, self.pump) {
            (PumpState::On, _) if self.settings.auto_mode => {
                Err(Precondition::AutoModeEnabled.into())
            }
            (PumpState::On, Some(_)) => Err(Precondition::PumpAlreadyRunning.into()),
            (PumpState::On, None) => {
                let duration = command
                    .duration
                    .map(i64::from)
                    .unwrap_or(self.settings.pump_duration);
                self.start_pump(duration, now);
                Ok(())
            }
            (PumpState::Off, None) => Err(Precondition::PumpNotRunning.into()),
            (PumpState::Off, Some(_)) => {
                self.stop_pump(now);
                Ok(())
            }
        }
    }

    /// Applies the fields present in `update`. Returns whether anything changed.
    pub fn apply_config(&mut self, update: &ConfigUpdate) -> Result<bool> {
        validate_update(update)?;

        let before = self.settings;
        if let Some(auto_mode) = update.auto_mode {
            self.settings.auto_mode = auto_mode;
        }
        if let Some(threshold) = update.dry_threshold {
            self.settings.dry_threshold = threshold;
        }
        if let Some(duration) = update.pump_duration {
            self.settings.pump_duration = duration;
        }
        if let Some(level) = update.water_min_level {
            self.settings.water_min_level = level;
        }
        Ok(self.settings != before)
    }

    fn refill(&mut self) {
        self.water_level = WATER_MAX;
        self.tank_low = false;
    }

    /// Most recent first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.iter().cloned().collect()
    }

    pub fn hourly_stats(&self) -> Vec<HourlyStat> {
        self.hourly
            .iter()
            .map(|(hour, acc)| HourlyStat {
                hour: *hour,
                avg_temperature: acc.mean(acc.temperature),
                avg_humidity: Some(acc.mean(acc.humidity)),
                avg_soil_moisture: Some(acc.mean(acc.soil_moisture)),
            })
            .collect()
    }

    pub fn daily_stats(&self) -> Vec<DailyStat> {
        self.daily
            .iter()
            .map(|(day, acc)| DailyStat {
                day: *day,
                avg_temperature: acc.mean(acc.temperature),
                avg_humidity: acc.mean(acc.humidity),
            })
            .collect()
    }

    pub fn pump_usage(&self) -> Vec<PumpUsage> {
        self.pump_usage.values().cloned().collect()
    }

    fn is_dry(&self) -> bool {
        self.soil_moisture >= self.settings.dry_threshold
    }

    fn start_pump(&mut self, seconds: i64, now: DateTime<Utc>) {
        self.pump = Some(PumpRun {
            started: now,
            until: now + Duration::seconds(seconds.max(1)),
        });
        self.usage_for(now.date_naive()).activations += 1;
    }

    fn stop_pump(&mut self, at: DateTime<Utc>) {
        if let Some(run) = self.pump.take() {
            let ran = (at - run.started).num_seconds().max(0) as u64;
            self.usage_for(run.started.date_naive()).runtime_seconds += ran;
        }
    }

    fn usage_for(&mut self, day: NaiveDate) -> &mut PumpUsage {
        if !self.pump_usage.contains_key(&day) && self.pump_usage.len() >= DAILY_HISTORY {
            self.pump_usage.pop_first();
        }
        self.pump_usage.entry(day).or_insert(PumpUsage {
            day,
            activations: 0,
            runtime_seconds: 0,
        })
    }

    fn raise(&mut self, level: AlertLevel, message: &str, now: DateTime<Utc>) -> Alert {
        let alert = Alert {
            message: message.to_string(),
            level,
            timestamp: now,
        };
        self.alerts.push_front(alert.clone());
        self.alerts.truncate(ALERT_HISTORY);
        alert
    }

    fn record(&mut self, now: DateTime<Utc>) {
        let hour = now.duration_trunc(Duration::hours(1)).unwrap_or(now);
        self.hourly
            .entry(hour)
            .or_default()
            .add(self.temperature, self.humidity, self.soil_moisture);
        while self.hourly.len() > HOURLY_HISTORY {
            self.hourly.pop_first();
        }

        self.daily
            .entry(now.date_naive())
            .or_default()
            .add(self.temperature, self.humidity, self.soil_moisture);
        while self.daily.len() > DAILY_HISTORY {
            self.daily.pop_first();
        }
    }
}
