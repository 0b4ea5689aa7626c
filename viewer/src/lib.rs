//! Viewer session core for a plant-watering device.
//!
//! A [`Synchronizer`] keeps a materialized view of the device fed by a push
//! channel and decides when the device has gone silent. A [`Dispatcher`]
//! checks operator commands against that view before sending them to the
//! backend, and tracks what is still waiting for confirmation.

pub mod api;
pub mod auth;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod display;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod rest;
pub mod staleness;
pub mod stats;
pub mod sync;
pub mod validate;

pub use api::{DeviceApi, HttpApi};
pub use auth::Credential;
pub use channel::{ChannelEvent, ChannelHandle, MemoryHub, MqttConnector, MqttSettings, PushConnector};
pub use config::SyncConfig;
pub use dispatch::{CommandOutcome, Controls, Dispatcher, Pending};
pub use errors::{Error, Precondition, Result};
pub use sync::{DeviceView, Link, Session, SessionEnd, Synchronizer, ViewReader};
