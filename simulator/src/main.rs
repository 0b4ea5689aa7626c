mod device;
mod rest;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use device::Device;
use rest::BackendState;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use viewer::model::PushEvent;

/// Simulated plant-watering device and its backend.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    mqtt_port: u16,

    #[arg(long, env = "TOPIC_PREFIX", default_value = "plants/strelitzia")]
    topic_prefix: String,

    /// Bearer token accepted by the command and query routes
    #[arg(long, env = "API_TOKEN", hide_env_values = true)]
    api_token: String,

    /// Token presented to the broker, if it requires one
    #[arg(long, env = "MQTT_TOKEN", hide_env_values = true)]
    mqtt_token: Option<String>,

    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:3000")]
    http_addr: String,

    /// Telemetry reporting period in milliseconds
    #[arg(long, env = "PUBLISH_INTERVAL_MS", default_value_t = 2000)]
    publish_interval_ms: u64,

    #[arg(long, env = "DEVICE_IP", default_value = "192.168.1.42")]
    device_ip: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting device simulator");
    info!(
        "Broker: {}:{}, prefix: {}, period: {} ms",
        args.mqtt_broker, args.mqtt_port, args.topic_prefix, args.publish_interval_ms
    );

    let client_id = format!("plant-sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.mqtt_broker, args.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);
    if let Some(token) = &args.mqtt_token {
        mqtt_options.set_credentials("bearer", token);
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    // Spawn eventloop handler
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    let device = Arc::new(Mutex::new(Device::new(args.device_ip, Utc::now())));
    let config_changed = Arc::new(Notify::new());

    let app = rest::create_router(BackendState {
        device: device.clone(),
        token: Arc::from(args.api_token),
        config_changed: config_changed.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&args.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", args.http_addr))?;
    info!("Backend listening on {}", args.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    let publisher = Publisher {
        client,
        prefix: args.topic_prefix,
    };
    let period = Duration::from_millis(args.publish_interval_ms.max(1));
    let device_handle = tokio::spawn(run_device(device, publisher, config_changed, period));

    tokio::select! {
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = device_handle => {
            error!("Device loop terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    Ok(())
}

struct Publisher {
    client: AsyncClient,
    prefix: String,
}

impl Publisher {
    /// Telemetry and config are retained so a new subscriber sees them at once.
    async fn publish(&self, event: &PushEvent) {
        let retain = !matches!(event, PushEvent::Alert(_));
        let topic = format!("{}/{}", self.prefix, event.name());
        let payload = match event.payload() {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize {} event: {}", event.name(), e);
                return;
            }
        };

        if let Err(e) = self
            .client
            .publish(&topic, QoS::AtLeastOnce, retain, payload)
            .await
        {
            warn!("Failed to publish to {}: {}", topic, e);
        }
    }
}

async fn run_device(
    device: Arc<Mutex<Device>>,
    publisher: Publisher,
    config_changed: Arc<Notify>,
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_config = None;
    let mut published = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (telemetry, config, alerts) = {
                    let mut device = device.lock().unwrap_or_else(|p| p.into_inner());
                    let now = Utc::now();
                    let alerts = device.step(&mut rand::thread_rng(), now);
                    (device.telemetry(now), device.config(), alerts)
                };

                publisher.publish(&PushEvent::Telemetry(telemetry)).await;
                for alert in alerts {
                    warn!("Alert: {}", alert.message);
                    publisher.publish(&PushEvent::Alert(alert)).await;
                }
                if last_config.as_ref() != Some(&config) {
                    publisher.publish(&PushEvent::Config(config.clone())).await;
                    last_config = Some(config);
                }

                published += 1;
                if published % 100 == 0 {
                    info!("Published {} telemetry reports", published);
                }
            }
            _ = config_changed.notified() => {
                let config = device.lock().unwrap_or_else(|p| p.into_inner()).config();
                publisher.publish(&PushEvent::Config(config.clone())).await;
                last_config = Some(config);
            }
        }
    }
}
