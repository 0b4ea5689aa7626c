//! State Synchronizer.
//!
//! Holds the materialized view of one device for one viewer session and
//! keeps it current from the push channel. The view lives in a
//! `tokio::sync::watch` channel: the session task is the only writer and
//! every reader sees whole snapshots.
//!
//! The view outlives sessions. A dropped channel marks the device offline
//! immediately but keeps the last known telemetry and config, and a new
//! session started with [`Synchronizer::connect`] resumes from them.

use crate::auth::Credential;
use crate::channel::{ChannelEvent, ChannelHandle, PushConnector};
use crate::config::SyncConfig;
use crate::errors::{Error, Result};
use crate::metrics::{DEVICE_ONLINE, OFFLINE_TRANSITIONS_TOTAL, PUSH_MESSAGES_TOTAL};
use crate::model::{Alert, DeviceConfig, DeviceTelemetry, PushEvent};
use crate::staleness::StalenessDetector;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// State of the underlying push channel link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Link {
    /// No channel has been opened yet.
    Idle,
    Up,
    Down,
}

/// Client-held copy of the device state.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub telemetry: Option<DeviceTelemetry>,
    pub config: Option<DeviceConfig>,
    /// Most recent first, never longer than the configured capacity.
    pub alerts: VecDeque<Alert>,
    pub link: Link,
    /// Offline status as of the last evaluation (message, link change or tick).
    pub offline: bool,
    /// Incremented on every config push.
    pub config_revision: u64,
    /// Live push events applied since the view was created. Retained
    /// replays are not counted.
    pub events_applied: u64,
    #[serde(skip)]
    pub last_seen: Option<Instant>,
    /// Set when the link drops, cleared by the next message.
    #[serde(skip)]
    pub interrupted: bool,
}

impl Default for DeviceView {
    fn default() -> Self {
        Self {
            telemetry: None,
            config: None,
            alerts: VecDeque::new(),
            link: Link::Idle,
            offline: true,
            config_revision: 0,
            events_applied: 0,
            last_seen: None,
            interrupted: false,
        }
    }
}

impl DeviceView {
    pub fn last_seen_ago(&self, now: Instant) -> Option<Duration> {
        self.last_seen.map(|seen| now.saturating_duration_since(seen))
    }

    pub fn auto_mode(&self) -> Option<bool> {
        self.config.as_ref().and_then(|c| c.auto_mode)
    }

    pub fn pump_running(&self) -> Option<bool> {
        self.config.as_ref().and_then(|c| c.pump_running)
    }
}

/// Read side of the view, handed to the dispatcher and the presentation layer.
#[derive(Clone)]
pub struct ViewReader {
    rx: watch::Receiver<DeviceView>,
    detector: StalenessDetector,
}

impl ViewReader {
    pub fn snapshot(&self) -> DeviceView {
        self.rx.borrow().clone()
    }

    /// Evaluated against the current time, not the last tick.
    pub fn is_offline(&self) -> bool {
        let view = self.rx.borrow();
        self.detector
            .is_offline(view.last_seen, view.interrupted, Instant::now())
    }

    pub fn offline_timeout(&self) -> Duration {
        self.detector.timeout()
    }

    /// Waits for the next change and returns the new snapshot.
    pub async fn changed(&mut self) -> Result<DeviceView> {
        self.rx
            .changed()
            .await
            .map_err(|_| Error::Connectivity("synchronizer dropped".to_string()))?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// Waits until `predicate` holds for the current snapshot.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&DeviceView) -> bool,
    ) -> Result<DeviceView> {
        let view = self
            .rx
            .wait_for(|view| predicate(view))
            .await
            .map_err(|_| Error::Connectivity("synchronizer dropped".to_string()))?;
        Ok((*view).clone())
    }
}

pub struct Synchronizer {
    detector: StalenessDetector,
    tick_interval: Duration,
    alert_capacity: usize,
    view: watch::Sender<DeviceView>,
    attached: AtomicBool,
}

impl Synchronizer {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        config.validate()?;
        let (view, _) = watch::channel(DeviceView::default());
        Ok(Self {
            detector: StalenessDetector::new(config.offline_timeout),
            tick_interval: config.tick_interval,
            alert_capacity: config.alert_capacity,
            view,
            attached: AtomicBool::new(false),
        })
    }

    pub fn reader(&self) -> ViewReader {
        ViewReader {
            rx: self.view.subscribe(),
            detector: self.detector,
        }
    }

    pub fn snapshot(&self) -> DeviceView {
        self.view.borrow().clone()
    }

    pub fn is_offline(&self) -> bool {
        let view = self.view.borrow();
        self.detector
            .is_offline(view.last_seen, view.interrupted, Instant::now())
    }

    /// Opens a push channel and starts a session feeding this view.
    ///
    /// An [`Error::Auth`] from the connector is returned as is; the caller
    /// has to obtain a new credential. Only one session may feed the view at
    /// a time.
    pub async fn connect(
        self: &Arc<Self>,
        connector: &dyn PushConnector,
        credential: &Credential,
    ) -> Result<Session> {
        if self.attached.swap(true, Ordering::AcqRel) {
            return Err(Error::Connectivity(
                "a session is already attached to this view".to_string(),
            ));
        }

        let channel = match connector.open(credential).await {
            Ok(channel) => channel,
            Err(e) => {
                self.attached.store(false, Ordering::Release);
                return Err(e);
            }
        };

        info!("Viewer session opened");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_session(
            Attachment(Arc::clone(self)),
            channel,
            shutdown_rx,
        ));

        Ok(Session {
            task: Some(task),
            shutdown: Some(shutdown_tx),
        })
    }

    /// Applies one live push event. Snapshots are replaced wholesale.
    pub fn apply(&self, event: PushEvent) {
        PUSH_MESSAGES_TOTAL.inc();
        debug!("Applying {} event", event.name());

        let capacity = self.alert_capacity;
        let now = Instant::now();
        self.update(|view| {
            match event {
                PushEvent::Telemetry(telemetry) => view.telemetry = Some(telemetry),
                PushEvent::Config(config) => {
                    view.config = Some(config);
                    view.config_revision += 1;
                }
                PushEvent::Alert(alert) => {
                    view.alerts.push_front(alert);
                    view.alerts.truncate(capacity);
                }
            }
            view.events_applied += 1;
            view.last_seen = Some(now);
            view.interrupted = false;
            true
        });
    }

    /// Applies a retained copy of an earlier event, replayed by the transport
    /// on (re)subscribe. The values become visible but say nothing about the
    /// device being alive: `last_seen` and the offline status are untouched.
    pub fn restore(&self, event: PushEvent) {
        debug!("Restoring retained {} event", event.name());

        let capacity = self.alert_capacity;
        self.update(|view| match event {
            PushEvent::Telemetry(telemetry) => {
                let changed = view.telemetry.as_ref() != Some(&telemetry);
                view.telemetry = Some(telemetry);
                changed
            }
            PushEvent::Config(config) => {
                // An identical replay must not settle pending commands.
                if view.config.as_ref() == Some(&config) {
                    return false;
                }
                view.config = Some(config);
                view.config_revision += 1;
                true
            }
            PushEvent::Alert(alert) => {
                if view.alerts.contains(&alert) {
                    return false;
                }
                view.alerts.push_front(alert);
                view.alerts.truncate(capacity);
                true
            }
        });
    }

    /// Re-runs the staleness predicate. Observers are only notified when the
    /// offline status flips.
    pub fn tick(&self) {
        self.update(|_| false);
    }

    pub fn link_up(&self) {
        self.update(|view| {
            let changed = view.link != Link::Up;
            view.link = Link::Up;
            changed
        });
    }

    /// The link dropped: offline right away, last known state kept.
    pub fn link_down(&self, reason: &str) {
        warn!("Push channel down: {}", reason);
        self.update(|view| {
            let changed = view.link != Link::Down || !view.interrupted;
            view.link = Link::Down;
            view.interrupted = true;
            changed
        });
    }

    fn update(&self, mutate: impl FnOnce(&mut DeviceView) -> bool) {
        let detector = self.detector;
        self.view.send_if_modified(|view| {
            let was_offline = view.offline;
            let changed = mutate(view);
            view.offline = detector.is_offline(view.last_seen, view.interrupted, Instant::now());
            if view.offline != was_offline {
                record_transition(view.offline);
                return true;
            }
            changed
        });
    }
}

fn record_transition(offline: bool) {
    if offline {
        OFFLINE_TRANSITIONS_TOTAL.inc();
        DEVICE_ONLINE.set(0.0);
        warn!("Device is offline");
    } else {
        DEVICE_ONLINE.set(1.0);
        info!("Device is online");
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Closed by the owner.
    Closed,
    /// The transport gave up on the channel.
    ChannelClosed,
    /// The credential stopped being accepted; log in again.
    Rejected(String),
    /// The session task panicked.
    Failed(String),
}

impl SessionEnd {
    /// The session cannot be resumed without a new credential.
    pub fn requires_login(&self) -> bool {
        matches!(self, SessionEnd::Rejected(_))
    }
}

/// A live session: one channel handle plus the staleness tick, both owned by
/// a single task. Dropping the session stops the task.
pub struct Session {
    task: Option<JoinHandle<SessionEnd>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Session {
    /// Stops the session and waits for the task to finish.
    pub async fn close(mut self) -> SessionEnd {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match self.task.take() {
            Some(task) => join(task).await,
            None => SessionEnd::Closed,
        }
    }

    /// Waits for the session to end on its own. Cancel safe.
    pub async fn wait(&mut self) -> SessionEnd {
        let end = match self.task.as_mut() {
            Some(task) => join(task).await,
            None => return SessionEnd::Closed,
        };
        self.task = None;
        end
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn join<F>(task: F) -> SessionEnd
where
    F: std::future::Future<Output = std::result::Result<SessionEnd, tokio::task::JoinError>>,
{
    match task.await {
        Ok(end) => end,
        Err(e) if e.is_cancelled() => SessionEnd::Closed,
        Err(e) => {
            error!("Session task failed: {}", e);
            SessionEnd::Failed(e.to_string())
        }
    }
}

/// Marks the view detached when the session task ends, aborted or not.
struct Attachment(Arc<Synchronizer>);

impl Drop for Attachment {
    fn drop(&mut self) {
        self.0.link_down("session ended");
        self.0.attached.store(false, Ordering::Release);
    }
}

async fn run_session(
    attachment: Attachment,
    mut channel: ChannelHandle,
    mut shutdown: oneshot::Receiver<()>,
) -> SessionEnd {
    let sync = &attachment.0;
    let mut ticker = interval(sync.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let end = loop {
        tokio::select! {
            event = channel.recv() => match event {
                Some(ChannelEvent::Message(event)) => sync.apply(event),
                Some(ChannelEvent::Replay(event)) => sync.restore(event),
                Some(ChannelEvent::Up) => sync.link_up(),
                Some(ChannelEvent::Down(reason)) => sync.link_down(&reason),
                Some(ChannelEvent::Rejected(reason)) => {
                    error!("Push channel refused the credential: {}", reason);
                    break SessionEnd::Rejected(reason);
                }
                None => {
                    warn!("Push channel closed");
                    break SessionEnd::ChannelClosed;
                }
            },

            // Staleness re-check, independent of message arrival
            _ = ticker.tick() => sync.tick(),

            _ = &mut shutdown => break SessionEnd::Closed,
        }
    };

    info!("Viewer session ended: {:?}", end);
    end
}
