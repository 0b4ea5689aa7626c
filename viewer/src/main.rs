use anyhow::Context;
use axum::{routing::get, Router};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use viewer::config::{
    DEFAULT_ALERT_CAPACITY, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_OFFLINE_TIMEOUT_MS, DEFAULT_TICK_MS,
};
use viewer::display::{last_seen_label, mode_label, pump_label};
use viewer::rest::{self, AppState};
use viewer::{
    metrics, Credential, Dispatcher, HttpApi, MqttConnector, MqttSettings, SessionEnd, SyncConfig,
    Synchronizer, ViewReader,
};

/// Exit status when the credential was refused, at startup or mid-session.
const EXIT_RELOGIN: i32 = 2;

/// Headless viewer session for a plant-watering device.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    mqtt_port: u16,

    #[arg(long, env = "TOPIC_PREFIX", default_value = "plants/strelitzia")]
    topic_prefix: String,

    /// Base URL of the backend command/query API
    #[arg(long, env = "API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Bearer credential obtained at login
    #[arg(long, env = "API_TOKEN", hide_env_values = true)]
    api_token: String,

    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: String,

    #[arg(long, env = "OFFLINE_TIMEOUT_MS", default_value_t = DEFAULT_OFFLINE_TIMEOUT_MS)]
    offline_timeout_ms: u64,

    #[arg(long, env = "TICK_MS", default_value_t = DEFAULT_TICK_MS)]
    tick_ms: u64,

    #[arg(long, env = "ALERT_CAPACITY", default_value_t = DEFAULT_ALERT_CAPACITY)]
    alert_capacity: usize,

    #[arg(long, env = "COMMAND_TIMEOUT_MS", default_value_t = DEFAULT_COMMAND_TIMEOUT_MS)]
    command_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting plant viewer");
    info!("MQTT broker: {}:{} ({})", args.mqtt_broker, args.mqtt_port, args.topic_prefix);
    info!("Backend API: {}", args.api_url);
    info!("HTTP server: {}", args.http_addr);

    metrics::init_metrics().context("failed to register metrics")?;

    let config = SyncConfig {
        offline_timeout: Duration::from_millis(args.offline_timeout_ms),
        tick_interval: Duration::from_millis(args.tick_ms),
        alert_capacity: args.alert_capacity,
        command_timeout: Duration::from_millis(args.command_timeout_ms),
    };
    let sync = Arc::new(Synchronizer::new(&config)?);
    let credential = Credential::new(args.api_token)?;

    let connector = MqttConnector::new(MqttSettings {
        broker: args.mqtt_broker,
        port: args.mqtt_port,
        topic_prefix: args.topic_prefix,
        keep_alive: Duration::from_secs(30),
    });

    let mut session = match sync.connect(&connector, &credential).await {
        Ok(session) => session,
        Err(e) if e.requires_login() => {
            error!("Credential rejected, log in again to obtain a new token: {}", e);
            std::process::exit(EXIT_RELOGIN);
        }
        Err(e) => return Err(e).context("failed to open push channel"),
    };

    let api = Arc::new(HttpApi::new(&args.api_url, credential, config.command_timeout)?);
    let dispatcher = Arc::new(Dispatcher::new(
        api.clone(),
        sync.reader(),
        config.command_timeout,
    ));

    let transitions_handle = tokio::spawn(log_transitions(sync.reader()));

    // Build HTTP app with the view/command API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(AppState {
            view: sync.reader(),
            dispatcher,
            api,
        }));

    let listener = tokio::net::TcpListener::bind(&args.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", args.http_addr))?;

    info!("HTTP server listening on {}", args.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    let mut relogin = false;
    tokio::select! {
        end = session.wait() => {
            match end {
                SessionEnd::Rejected(ref reason) => {
                    error!("Credential no longer accepted ({}), log in again", reason);
                }
                ref other => error!("Viewer session terminated: {:?}", other),
            }
            relogin = end.requires_login();
        }
        _ = transitions_handle => {
            error!("Transition logger terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    session.close().await;
    if relogin {
        std::process::exit(EXIT_RELOGIN);
    }
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

/// Logs offline and pump transitions as they are observed.
async fn log_transitions(mut reader: ViewReader) {
    let mut last = reader.snapshot();
    while let Ok(view) = reader.changed().await {
        let now = Instant::now();
        if view.offline != last.offline && view.offline {
            warn!(
                "Showing last known values, marked stale (last seen {})",
                last_seen_label(view.last_seen_ago(now))
            );
        }
        if mode_label(&view, view.offline) != mode_label(&last, last.offline) {
            info!("Device mode: {}", mode_label(&view, view.offline));
        }
        if pump_label(&view, view.offline) != pump_label(&last, last.offline) {
            info!("Pump: {}", pump_label(&view, view.offline));
        }
        for alert in view.alerts.iter().take_while(|a| !last.alerts.contains(a)) {
            warn!("Device alert [{:?}]: {}", alert.level, alert.message);
        }
        last = view;
    }
}
