use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use viewer::display::{last_seen_label, pump_label, StatusSummary};
use viewer::model::{
    Alert, AlertLevel, ConfigUpdate, DailyStat, DeviceConfig, DeviceTelemetry, HourlyStat,
    PumpCommand, PumpState, PumpUsage, PushEvent,
};
use viewer::stats::load_stats;
use viewer::{
    CommandOutcome, Credential, DeviceApi, Dispatcher, Error, MemoryHub, Precondition, Result,
    SyncConfig, Synchronizer,
};

const TOKEN: &str = "viewer-token";

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Pump(PumpCommand),
    Config(ConfigUpdate),
}

/// Records every command and answers queries from canned data.
#[derive(Default)]
struct RecordingApi {
    calls: Mutex<Vec<Call>>,
    fail_commands: Mutex<bool>,
    /// When set, command calls wait here until notified.
    gate: Option<Arc<Notify>>,
    fail_daily: bool,
}

impl RecordingApi {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn fail_commands(&self, fail: bool) {
        *self.fail_commands.lock().unwrap() = fail;
    }

    async fn record(&self, call: Call) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if *self.fail_commands.lock().unwrap() {
            return Err(Error::CommandFailure("device rejected command".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceApi for RecordingApi {
    async fn set_pump(&self, command: &PumpCommand) -> Result<()> {
        self.record(Call::Pump(command.clone())).await
    }

    async fn update_config(&self, update: &ConfigUpdate) -> Result<()> {
        self.record(Call::Config(update.clone())).await
    }

    async fn latest_telemetry(&self) -> Result<DeviceTelemetry> {
        Ok(DeviceTelemetry::default())
    }

    async fn recent_alerts(&self) -> Result<Vec<Alert>> {
        Ok(Vec::new())
    }

    async fn hourly_stats(&self) -> Result<Vec<HourlyStat>> {
        let base = chrono::DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        Ok((0..10)
            .map(|h| HourlyStat {
                hour: base + chrono::Duration::hours(h),
                avg_temperature: 20.0 + h as f64,
                avg_humidity: None,
                avg_soil_moisture: None,
            })
            .collect())
    }

    async fn daily_stats(&self) -> Result<Vec<DailyStat>> {
        if self.fail_daily {
            return Err(Error::Query("daily stats unavailable".to_string()));
        }
        Ok(Vec::new())
    }

    async fn daily_pump_usage(&self) -> Result<Vec<PumpUsage>> {
        Ok(vec![PumpUsage {
            day: chrono::NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            activations: 2,
            runtime_seconds: 20,
        }])
    }
}

struct Harness {
    hub: MemoryHub,
    sync: Arc<Synchronizer>,
    api: Arc<RecordingApi>,
    dispatcher: Dispatcher,
}

impl Harness {
    fn new(api: RecordingApi) -> Self {
        let config = SyncConfig::default();
        let sync = Arc::new(Synchronizer::new(&config).unwrap());
        let api = Arc::new(api);
        let dispatcher = Dispatcher::new(api.clone(), sync.reader(), config.command_timeout);
        Self {
            hub: MemoryHub::new(TOKEN),
            sync,
            api,
            dispatcher,
        }
    }

    async fn connect(&self) -> viewer::Session {
        self.sync
            .connect(&self.hub, &Credential::new(TOKEN).unwrap())
            .await
            .unwrap()
    }

    /// Publish and wait until the session has applied the event.
    async fn push(&self, event: PushEvent) {
        let mut reader = self.sync.reader();
        let applied = reader.snapshot().events_applied;
        self.hub.publish(event);
        reader
            .wait_for(|view| view.events_applied > applied)
            .await
            .unwrap();
    }
}

fn config(auto_mode: bool, pump_running: bool) -> PushEvent {
    PushEvent::Config(DeviceConfig {
        auto_mode: Some(auto_mode),
        dry_threshold: Some(450),
        pump_duration: Some(10),
        water_min_level: Some(100),
        pump_running: Some(pump_running),
    })
}

fn telemetry(temperature: f64, soil: i64) -> PushEvent {
    PushEvent::Telemetry(DeviceTelemetry {
        temperature: Some(temperature),
        soil_moisture: Some(soil),
        ..DeviceTelemetry::default()
    })
}

#[tokio::test(start_paused = true)]
async fn silence_turns_offline_within_one_tick() {
    let harness = Harness::new(RecordingApi::default());
    let _session = harness.connect().await;

    harness.push(telemetry(22.5, 400)).await;
    let mut reader = harness.sync.reader();
    assert!(!reader.snapshot().offline);

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(!reader.is_offline());

    // No further events: only the tick can notice.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let view = reader.wait_for(|view| view.offline).await.unwrap();
    assert!(harness.sync.is_offline());
    assert_eq!(last_seen_label(view.last_seen_ago(Instant::now())), "16s ago");

    let telemetry = view.telemetry.unwrap();
    assert_eq!(telemetry.temperature, Some(22.5));
    assert_eq!(telemetry.soil_moisture, Some(400));
}

#[tokio::test]
async fn telemetry_view_equals_last_message() {
    let harness = Harness::new(RecordingApi::default());
    let _session = harness.connect().await;

    let messages = [
        DeviceTelemetry {
            temperature: Some(21.0),
            humidity: Some(40.0),
            ip_address: Some("10.0.0.7".to_string()),
            ..DeviceTelemetry::default()
        },
        DeviceTelemetry {
            soil_moisture: Some(380),
            ..DeviceTelemetry::default()
        },
        DeviceTelemetry {
            temperature: Some(23.0),
            uptime_sec: Some(12),
            ..DeviceTelemetry::default()
        },
    ];

    for message in messages {
        harness.push(PushEvent::Telemetry(message.clone())).await;
        assert_eq!(harness.sync.snapshot().telemetry, Some(message));
    }
}

#[tokio::test]
async fn set_mode_is_idempotent() {
    let harness = Harness::new(RecordingApi::default());
    let _session = harness.connect().await;
    harness.push(config(true, false)).await;

    let outcome = harness.dispatcher.set_mode(true).await.unwrap();
    assert_eq!(outcome, CommandOutcome::Unchanged);
    assert!(harness.api.calls().is_empty());

    let outcome = harness.dispatcher.set_mode(false).await.unwrap();
    assert_eq!(outcome, CommandOutcome::Sent);
    assert_eq!(
        harness.api.calls(),
        vec![Call::Config(ConfigUpdate::mode(false))]
    );
}

#[tokio::test]
async fn set_mode_stays_pending_until_config_push() {
    let harness = Harness::new(RecordingApi::default());
    let _session = harness.connect().await;
    harness.push(config(true, false)).await;

    harness.dispatcher.set_mode(false).await.unwrap();
    assert_eq!(harness.dispatcher.pending().mode, Some(false));
    // Accepted is not confirmed.
    assert_eq!(harness.sync.snapshot().auto_mode(), Some(true));

    harness.push(config(false, false)).await;
    assert_eq!(harness.dispatcher.pending().mode, None);
    assert_eq!(harness.sync.snapshot().auto_mode(), Some(false));
}

#[tokio::test]
async fn pending_mode_is_discarded_by_contradicting_push() {
    let harness = Harness::new(RecordingApi::default());
    let _session = harness.connect().await;
    harness.push(config(true, false)).await;

    harness.dispatcher.set_mode(false).await.unwrap();
    // The device's own loop wins; the push is authoritative.
    harness.push(config(true, true)).await;

    assert_eq!(harness.dispatcher.pending().mode, None);
    assert_eq!(harness.sync.snapshot().auto_mode(), Some(true));
}

#[tokio::test]
async fn failed_set_mode_leaves_no_optimistic_state() {
    let harness = Harness::new(RecordingApi::default());
    let _session = harness.connect().await;
    harness.push(config(true, false)).await;
    harness.api.fail_commands(true);

    let err = harness.dispatcher.set_mode(false).await.unwrap_err();
    assert!(matches!(err, Error::CommandFailure(_)));
    assert_eq!(harness.dispatcher.pending().mode, None);
    assert_eq!(harness.sync.snapshot().auto_mode(), Some(true));
}

#[tokio::test(start_paused = true)]
async fn timed_out_command_fails_and_is_not_retried() {
    // The backend never answers.
    let harness = Harness::new(RecordingApi {
        gate: Some(Arc::new(Notify::new())),
        ..RecordingApi::default()
    });
    let _session = harness.connect().await;
    harness.push(config(true, false)).await;

    let started = Instant::now();
    let err = harness.dispatcher.set_mode(false).await.unwrap_err();
    assert!(matches!(err, Error::CommandFailure(_)));
    let timeout = SyncConfig::default().command_timeout;
    assert!(started.elapsed() >= timeout);
    assert!(started.elapsed() < timeout + Duration::from_secs(1));

    assert_eq!(harness.dispatcher.pending(), viewer::Pending::default());
    assert_eq!(harness.sync.snapshot().auto_mode(), Some(true));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(
        harness.api.calls(),
        vec![Call::Config(ConfigUpdate::mode(false))]
    );
}

#[tokio::test]
async fn rapid_identical_set_mode_fires_once() {
    let gate = Arc::new(Notify::new());
    let harness = Arc::new(Harness::new(RecordingApi {
        gate: Some(gate.clone()),
        ..RecordingApi::default()
    }));
    let _session = harness.connect().await;
    harness.push(config(true, false)).await;

    let first = {
        let harness = harness.clone();
        tokio::spawn(async move { harness.dispatcher.set_mode(false).await })
    };
    while harness.api.calls().is_empty() {
        tokio::task::yield_now().await;
    }

    let second = harness.dispatcher.set_mode(false).await.unwrap();
    assert_eq!(second, CommandOutcome::AlreadyPending);

    // The device still reports auto mode, so asking for it is a no-op.
    let current = harness.dispatcher.set_mode(true).await.unwrap();
    assert_eq!(current, CommandOutcome::Unchanged);

    gate.notify_one();
    assert_eq!(first.await.unwrap().unwrap(), CommandOutcome::Sent);
    assert_eq!(harness.api.calls().len(), 1);
}

#[tokio::test]
async fn failed_config_update_keeps_later_mode_request() {
    let gate = Arc::new(Notify::new());
    let harness = Arc::new(Harness::new(RecordingApi {
        gate: Some(gate.clone()),
        ..RecordingApi::default()
    }));
    let _session = harness.connect().await;
    harness.push(config(true, false)).await;

    let update = ConfigUpdate {
        auto_mode: Some(false),
        dry_threshold: Some(500),
        ..ConfigUpdate::default()
    };
    let config_call = {
        let harness = harness.clone();
        tokio::spawn(async move { harness.dispatcher.update_config(update).await })
    };
    while harness.api.calls().is_empty() {
        tokio::task::yield_now().await;
    }
    let mode_call = {
        let harness = harness.clone();
        tokio::spawn(async move { harness.dispatcher.set_mode(false).await })
    };
    while harness.api.calls().len() < 2 {
        tokio::task::yield_now().await;
    }

    // Waiters are released in arrival order: the config update first.
    harness.api.fail_commands(true);
    gate.notify_one();
    let err = config_call.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::CommandFailure(_)));
    assert_eq!(harness.dispatcher.pending().mode, Some(false));

    harness.api.fail_commands(false);
    gate.notify_one();
    assert_eq!(mode_call.await.unwrap().unwrap(), CommandOutcome::Sent);
    assert_eq!(harness.dispatcher.pending().mode, Some(false));
}

#[tokio::test]
async fn pump_on_refused_without_network_call() {
    let harness = Harness::new(RecordingApi::default());

    // Offline: nothing received yet.
    let err = harness
        .dispatcher
        .set_pump(PumpState::On, Some(10))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Precondition(Precondition::Offline)));

    let _session = harness.connect().await;

    harness.push(config(true, false)).await;
    let err = harness
        .dispatcher
        .set_pump(PumpState::On, Some(10))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Precondition(Precondition::AutoModeEnabled)
    ));

    harness.push(config(false, true)).await;
    let err = harness
        .dispatcher
        .set_pump(PumpState::On, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Precondition(Precondition::PumpAlreadyRunning)
    ));

    assert!(harness.api.calls().is_empty());
}

#[tokio::test]
async fn pump_off_requires_running_pump() {
    let harness = Harness::new(RecordingApi::default());
    let _session = harness.connect().await;
    harness.push(config(false, false)).await;

    let err = harness
        .dispatcher
        .set_pump(PumpState::Off, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Precondition(Precondition::PumpNotRunning)
    ));
    assert!(harness.api.calls().is_empty());
}

#[tokio::test]
async fn manual_pump_run_is_confirmed_by_push() {
    let harness = Harness::new(RecordingApi::default());
    let _session = harness.connect().await;
    harness.push(config(false, false)).await;

    let outcome = harness
        .dispatcher
        .set_pump(PumpState::On, Some(10))
        .await
        .unwrap();
    assert_eq!(outcome, CommandOutcome::Sent);
    assert_eq!(
        harness.api.calls(),
        vec![Call::Pump(PumpCommand {
            state: PumpState::On,
            duration: Some(10),
        })]
    );
    assert_eq!(harness.dispatcher.pending().pump, Some(PumpState::On));
    assert_eq!(pump_label(&harness.sync.snapshot(), false), "Stopped");

    harness
        .push(PushEvent::Config(DeviceConfig {
            pump_running: Some(true),
            ..DeviceConfig::default()
        }))
        .await;

    assert_eq!(harness.dispatcher.pending().pump, None);
    let view = harness.sync.snapshot();
    assert_eq!(pump_label(&view, harness.sync.is_offline()), "Running");
}

#[tokio::test]
async fn zero_duration_is_invalid() {
    let harness = Harness::new(RecordingApi::default());
    let _session = harness.connect().await;
    harness.push(config(false, false)).await;

    let err = harness
        .dispatcher
        .set_pump(PumpState::On, Some(0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(harness.api.calls().is_empty());
}

#[tokio::test]
async fn negative_threshold_is_rejected_locally() {
    let harness = Harness::new(RecordingApi::default());

    let err = harness
        .dispatcher
        .update_config(ConfigUpdate {
            dry_threshold: Some(-5),
            ..ConfigUpdate::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert!(harness.api.calls().is_empty());
}

#[tokio::test]
async fn valid_config_update_is_sent_once() {
    let harness = Harness::new(RecordingApi::default());
    let update = ConfigUpdate {
        dry_threshold: Some(500),
        water_min_level: Some(120),
        ..ConfigUpdate::default()
    };

    let outcome = harness
        .dispatcher
        .update_config(update.clone())
        .await
        .unwrap();

    assert_eq!(outcome, CommandOutcome::Sent);
    assert_eq!(harness.api.calls(), vec![Call::Config(update)]);
}

#[tokio::test]
async fn disconnect_keeps_last_known_state() {
    let harness = Harness::new(RecordingApi::default());
    let session = harness.connect().await;
    harness.push(telemetry(22.5, 400)).await;
    harness.push(config(false, false)).await;

    let mut reader = harness.sync.reader();
    harness.hub.disconnect_all("network lost");
    let view = reader.wait_for(|view| view.offline).await.unwrap();
    assert!(harness.sync.is_offline());
    assert_eq!(view.telemetry, harness.sync.snapshot().telemetry);
    assert!(view.config.is_some());

    let mut session = session;
    assert_eq!(session.wait().await, viewer::SessionEnd::ChannelClosed);
    drop(session);

    // The device's last report before it went quiet is retained by the hub.
    assert_eq!(harness.hub.publish(telemetry(22.8, 405)), 0);

    // Reconnect: the replay is shown but stays marked stale.
    let _session = harness.connect().await;
    let view = harness
        .sync
        .reader()
        .wait_for(|view| view.telemetry.as_ref().and_then(|t| t.temperature) == Some(22.8))
        .await
        .unwrap();
    assert!(view.offline);
    assert!(harness.sync.is_offline());
    assert_eq!(view.auto_mode(), Some(false));

    harness.push(telemetry(23.0, 390)).await;
    assert!(!harness.sync.is_offline());
}

#[tokio::test]
async fn retained_state_of_a_silent_device_is_stale() {
    let harness = Harness::new(RecordingApi::default());
    harness.hub.publish(config(false, false));
    harness.hub.publish(telemetry(22.5, 400));

    let _session = harness.connect().await;
    let view = harness
        .sync
        .reader()
        .wait_for(|view| view.telemetry.is_some() && view.config.is_some())
        .await
        .unwrap();

    assert!(view.offline);
    assert_eq!(last_seen_label(view.last_seen_ago(Instant::now())), "never");
    let summary = StatusSummary::build(&view, true, harness.dispatcher.pending(), Instant::now());
    assert_eq!(summary.mode, "OFFLINE");
    assert_eq!(summary.temperature, "22.5 °C");

    let refused = harness.dispatcher.set_pump(PumpState::On, None).await;
    assert!(matches!(
        refused,
        Err(Error::Precondition(Precondition::Offline))
    ));
    assert!(harness.api.calls().is_empty());
}

#[tokio::test]
async fn revoked_credential_ends_session() {
    let harness = Harness::new(RecordingApi::default());
    let mut session = harness.connect().await;
    harness.push(telemetry(22.5, 400)).await;

    harness.hub.rotate_token("new-token");

    assert_eq!(
        session.wait().await,
        viewer::SessionEnd::Rejected("credential revoked".to_string())
    );
    assert!(harness.sync.is_offline());
}

#[tokio::test]
async fn viewers_share_the_push_channel() {
    let hub = MemoryHub::new(TOKEN);
    let credential = Credential::new(TOKEN).unwrap();
    let first = Arc::new(Synchronizer::new(&SyncConfig::default()).unwrap());
    let second = Arc::new(Synchronizer::new(&SyncConfig::default()).unwrap());
    let _a = first.connect(&hub, &credential).await.unwrap();
    let _b = second.connect(&hub, &credential).await.unwrap();

    hub.publish(PushEvent::Alert(Alert {
        message: "Water tank low".to_string(),
        level: AlertLevel::Critical,
        timestamp: chrono::Utc::now(),
    }));

    for sync in [&first, &second] {
        let view = sync
            .reader()
            .wait_for(|view| !view.alerts.is_empty())
            .await
            .unwrap();
        assert_eq!(view.alerts[0].message, "Water tank low");
    }
}

#[tokio::test]
async fn summary_reflects_controls() {
    let harness = Harness::new(RecordingApi::default());
    let _session = harness.connect().await;
    harness.push(config(true, false)).await;

    let summary = StatusSummary::build(
        &harness.sync.snapshot(),
        harness.sync.is_offline(),
        harness.dispatcher.pending(),
        Instant::now(),
    );
    assert_eq!(summary.mode, "AUTO");
    assert_eq!(summary.pump, "Stopped");
    assert!(!summary.controls.can_start_pump);
    assert_eq!(summary.temperature, "unknown");
}

#[tokio::test]
async fn stats_sections_fail_independently() {
    let api = RecordingApi {
        fail_daily: true,
        ..RecordingApi::default()
    };

    let stats = load_stats(&api).await;

    assert_eq!(stats.hourly.len(), 6);
    assert_eq!(stats.hourly[0].avg_temperature, 24.0);
    assert!(stats.daily.is_empty());
    assert_eq!(stats.pump.len(), 1);
}
