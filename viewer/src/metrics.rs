use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref PUSH_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "viewer_push_messages_total",
        "Total push channel events applied to the view"
    ))
    .unwrap();
    pub static ref INVALID_PUSH_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "viewer_invalid_push_messages_total",
        "Total push channel messages dropped as undecodable"
    ))
    .unwrap();
    pub static ref PUSH_EVENTS_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "viewer_push_events_dropped_total",
        "Total push events not delivered because a channel buffer was full"
    ))
    .unwrap();
    pub static ref COMMANDS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "viewer_commands_total",
        "Total commands sent to the backend"
    ))
    .unwrap();
    pub static ref COMMANDS_REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "viewer_commands_rejected_total",
        "Total commands refused client-side by validation or preconditions"
    ))
    .unwrap();
    pub static ref COMMAND_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "viewer_command_failures_total",
        "Total commands the backend rejected or that timed out"
    ))
    .unwrap();
    pub static ref OFFLINE_TRANSITIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "viewer_offline_transitions_total",
        "Total transitions of the device from online to offline"
    ))
    .unwrap();
    pub static ref DEVICE_ONLINE: Gauge = Gauge::with_opts(Opts::new(
        "viewer_device_online",
        "1 while the device is considered online, 0 otherwise"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(PUSH_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVALID_PUSH_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PUSH_EVENTS_DROPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMANDS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMANDS_REJECTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMAND_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(OFFLINE_TRANSITIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEVICE_ONLINE.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
