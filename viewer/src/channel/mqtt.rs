use super::{decode_event, ChannelEvent, ChannelHandle, PushConnector};
use crate::auth::Credential;
use crate::errors::{Error, Result};
use crate::metrics::INVALID_PUSH_MESSAGES_TOTAL;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF_MS: u64 = 250;
const MAX_BACKOFF_MS: u64 = 30_000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_CAPACITY: usize = 1024;
const CREDENTIAL_USERNAME: &str = "bearer";

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    /// Events arrive on `<topic_prefix>/<event>`.
    pub topic_prefix: String,
    pub keep_alive: Duration,
}

impl MqttSettings {
    fn filter(&self) -> String {
        format!("{}/+", self.topic_prefix.trim_end_matches('/'))
    }
}

/// Push channel over an MQTT broker. The bearer credential is presented as
/// the MQTT password.
pub struct MqttConnector {
    settings: MqttSettings,
}

impl MqttConnector {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl PushConnector for MqttConnector {
    async fn open(&self, credential: &Credential) -> Result<ChannelHandle> {
        let settings = &self.settings;
        info!("Connecting to MQTT broker at {}:{}", settings.broker, settings.port);

        let client_id = format!("viewer-{}", uuid::Uuid::new_v4());
        let mut mqtt_options = MqttOptions::new(client_id, &settings.broker, settings.port);
        mqtt_options.set_keep_alive(settings.keep_alive);
        mqtt_options.set_clean_session(true);
        mqtt_options.set_credentials(CREDENTIAL_USERNAME, credential.token());

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 64);

        // The handshake decides whether the credential is accepted.
        tokio::time::timeout(CONNECT_TIMEOUT, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| {
                Error::Connectivity(format!(
                    "no answer from {}:{} within {:?}",
                    settings.broker, settings.port, CONNECT_TIMEOUT
                ))
            })??;

        let filter = settings.filter();
        client.subscribe(&filter, QoS::AtLeastOnce).await?;
        info!("Subscribed to {} with QoS 1", filter);

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tx.try_send(ChannelEvent::Up)
            .map_err(|_| Error::Connectivity("channel closed before use".to_string()))?;

        let prefix = settings.topic_prefix.trim_end_matches('/').to_string();
        let driver = tokio::spawn(run_event_loop(client, eventloop, prefix, filter, tx));

        Ok(ChannelHandle::new(rx, Some(driver)))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(classify_connection_error(e)),
        }
    }
}

/// Drives the MQTT event loop until the handle is dropped or the credential
/// is refused. Link drops are retried with exponential backoff.
async fn run_event_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    prefix: String,
    filter: String,
    tx: mpsc::Sender<ChannelEvent>,
) {
    let mut backoff_ms = INITIAL_BACKOFF_MS;
    let mut link_up = true;

    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff_ms = INITIAL_BACKOFF_MS;
                // Clean sessions lose their subscriptions on reconnect.
                if let Err(e) = client.try_subscribe(&filter, QoS::AtLeastOnce) {
                    warn!("Failed to resubscribe to {}: {}", filter, e);
                }
                if link_up {
                    continue;
                }
                link_up = true;
                info!("MQTT link re-established");
                ChannelEvent::Up
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );
                match decode_publish(&prefix, &publish.topic, &publish.payload) {
                    // Brokers set the retain flag only on stored copies sent at subscribe time.
                    Ok(event) if publish.retain => ChannelEvent::Replay(event),
                    Ok(event) => ChannelEvent::Message(event),
                    Err(e) => {
                        INVALID_PUSH_MESSAGES_TOTAL.inc();
                        warn!("Dropping message on {}: {}", publish.topic, e);
                        continue;
                    }
                }
            }
            Ok(_) => continue,
            Err(ConnectionError::ConnectionRefused(code)) if is_auth_refusal(&code) => {
                error!("MQTT broker refused the credential: {:?}", code);
                let _ = tx.send(ChannelEvent::Rejected(format!("{:?}", code))).await;
                return;
            }
            Err(e) => {
                warn!("MQTT error: {}. Reconnecting in {}ms", e, backoff_ms);
                let was_up = std::mem::replace(&mut link_up, false);
                if was_up && tx.send(ChannelEvent::Down(e.to_string())).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                continue;
            }
        };

        if tx.send(event).await.is_err() {
            debug!("Channel handle dropped, stopping MQTT event loop");
            return;
        }
    }
}

fn decode_publish(prefix: &str, topic: &str, payload: &[u8]) -> Result<crate::model::PushEvent> {
    let name = topic
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(|| Error::Validation(format!("Topic {} is outside {}", topic, prefix)))?;
    decode_event(name, payload)
}

fn is_auth_refusal(code: &ConnectReturnCode) -> bool {
    matches!(
        code,
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
    )
}

fn classify_connection_error(err: ConnectionError) -> Error {
    match err {
        ConnectionError::ConnectionRefused(code) if is_auth_refusal(&code) => {
            Error::Auth(format!("MQTT broker refused the credential: {:?}", code))
        }
        other => Error::Connectivity(other.to_string()),
    }
}
