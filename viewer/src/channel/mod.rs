//! Push channel plumbing.
//!
//! A [`PushConnector`] opens an authenticated channel and returns an owned
//! [`ChannelHandle`]. The handle is the only way to read from the channel;
//! dropping it tears down whatever background work the transport started.
//! Reconnecting means opening a new handle.
//!
//! Retrying a dropped link is the transport's job. It reports link changes
//! as [`ChannelEvent::Down`] / [`ChannelEvent::Up`] and keeps trying; the
//! session on the other end only reacts.

pub mod memory;
pub mod mqtt;

use crate::auth::Credential;
use crate::errors::{Error, Result};
use crate::model::PushEvent;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use memory::MemoryHub;
pub use mqtt::{MqttConnector, MqttSettings};

/// What a channel handle yields.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A live event from the device.
    Message(PushEvent),
    /// A retained copy of the last event of its kind, delivered on
    /// (re)subscribe. It may be arbitrarily old.
    Replay(PushEvent),
    /// The link is (re)established.
    Up,
    /// The link dropped; the transport is retrying.
    Down(String),
    /// The credential was refused after the channel was opened. Terminal.
    Rejected(String),
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    /// Open a channel authenticated by `credential`.
    ///
    /// Fails with [`Error::Auth`] when the credential is refused. That error
    /// is never retried here.
    async fn open(&self, credential: &Credential) -> Result<ChannelHandle>;
}

/// Owned receiving end of one push channel.
pub struct ChannelHandle {
    events: mpsc::Receiver<ChannelEvent>,
    driver: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    pub fn new(events: mpsc::Receiver<ChannelEvent>, driver: Option<JoinHandle<()>>) -> Self {
        Self { events, driver }
    }

    /// Next event, or `None` once the channel is closed for good.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Decodes a named push event payload
pub fn decode_event(name: &str, payload: &[u8]) -> Result<PushEvent> {
    let parse_error = |e: serde_json::Error| Error::Validation(format!("JSON parse error in {} event: {}", name, e));

    match name {
        PushEvent::TELEMETRY => Ok(PushEvent::Telemetry(
            serde_json::from_slice(payload).map_err(parse_error)?,
        )),
        PushEvent::CONFIG => Ok(PushEvent::Config(
            serde_json::from_slice(payload).map_err(parse_error)?,
        )),
        PushEvent::ALERT => Ok(PushEvent::Alert(
            serde_json::from_slice(payload).map_err(parse_error)?,
        )),
        other => Err(Error::Validation(format!("Unknown push event '{}'", other))),
    }
}
