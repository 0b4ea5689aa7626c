//! In-process push hub.
//!
//! Stands in for the backend relay in tests and local runs. Every published
//! event is fanned out to every open channel, the way the relay fans out to
//! all viewer sessions of a device. The last telemetry and config are
//! retained and replayed to every newly opened channel, like retained
//! messages on a broker.

use super::{ChannelEvent, ChannelHandle, PushConnector};
use crate::auth::Credential;
use crate::errors::{Error, Result};
use crate::metrics::PUSH_EVENTS_DROPPED_TOTAL;
use crate::model::PushEvent;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubState>>,
}

struct HubState {
    accepted_token: String,
    subscribers: Vec<mpsc::Sender<ChannelEvent>>,
    retained_telemetry: Option<PushEvent>,
    retained_config: Option<PushEvent>,
}

impl MemoryHub {
    /// A hub that only admits `accepted_token`.
    pub fn new(accepted_token: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubState {
                accepted_token: accepted_token.into(),
                subscribers: Vec::new(),
                retained_telemetry: None,
                retained_config: None,
            })),
        }
    }

    /// Deliver `event` to every open channel. Returns how many received it.
    ///
    /// A channel whose buffer is full misses this event but stays subscribed.
    pub fn publish(&self, event: PushEvent) -> usize {
        let mut state = self.lock();
        match &event {
            PushEvent::Telemetry(_) => state.retained_telemetry = Some(event.clone()),
            PushEvent::Config(_) => state.retained_config = Some(event.clone()),
            PushEvent::Alert(_) => {}
        }

        let mut delivered = 0;
        state.subscribers.retain(|tx| {
            match tx.try_send(ChannelEvent::Message(event.clone())) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    PUSH_EVENTS_DROPPED_TOTAL.inc();
                    warn!("Channel buffer full, dropping {} event", event.name());
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        debug!(
            "Published {} event to {} of {} channel(s)",
            event.name(),
            delivered,
            state.subscribers.len()
        );
        delivered
    }

    /// Report a link drop to every channel and close them all.
    pub fn disconnect_all(&self, reason: &str) {
        let mut state = self.lock();
        for tx in state.subscribers.drain(..) {
            let _ = tx.try_send(ChannelEvent::Down(reason.to_string()));
        }
    }

    /// Change the admitted token. Open channels are told their credential
    /// is no longer valid and are closed.
    pub fn rotate_token(&self, accepted_token: impl Into<String>) {
        let mut state = self.lock();
        state.accepted_token = accepted_token.into();
        for tx in state.subscribers.drain(..) {
            let _ = tx.try_send(ChannelEvent::Rejected("credential revoked".to_string()));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PushConnector for MemoryHub {
    async fn open(&self, credential: &Credential) -> Result<ChannelHandle> {
        let mut state = self.lock();
        if credential.token() != state.accepted_token {
            return Err(Error::Auth("credential rejected by push hub".to_string()));
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tx.try_send(ChannelEvent::Up)
            .map_err(|_| Error::Connectivity("push hub channel closed".to_string()))?;
        for retained in [&state.retained_config, &state.retained_telemetry].into_iter().flatten() {
            tx.try_send(ChannelEvent::Replay(retained.clone()))
                .map_err(|_| Error::Connectivity("push hub channel closed".to_string()))?;
        }
        state.subscribers.push(tx);

        Ok(ChannelHandle::new(rx, None))
    }
}
