//! Command Dispatcher.
//!
//! Turns operator intent into backend calls. Everything that can be decided
//! from the current view (validation, preconditions, idempotence) is decided
//! here before a request is made.
//!
//! The device runs its own control loop, so a successful call is not a state
//! change. The requested value is recorded as *pending* together with the
//! config revision it was issued against; the next config push settles it,
//! whether or not it matches. A failed call drops the pending value at once.

use crate::api::DeviceApi;
use crate::errors::{Error, Precondition, Result};
use crate::metrics::{COMMANDS_REJECTED_TOTAL, COMMANDS_TOTAL, COMMAND_FAILURES_TOTAL};
use crate::model::{CommandKind, ConfigUpdate, PumpCommand, PumpState};
use crate::sync::{DeviceView, ViewReader};
use crate::validate::{validate_duration, validate_update};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of a command that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    /// The backend accepted the call; confirmation arrives as a config push.
    Sent,
    /// The device already reports the requested state. Nothing was sent.
    Unchanged,
    /// An identical command is still in flight. Nothing was sent.
    AlreadyPending,
}

/// Requested values not yet settled by a config push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Pending {
    pub mode: Option<bool>,
    pub pump: Option<PumpState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingEntry<T> {
    desired: T,
    revision: u64,
    /// Distinguishes the command that recorded the entry.
    id: u64,
}

#[derive(Default)]
struct State {
    next_id: u64,
    mode_in_flight: Option<bool>,
    pump_in_flight: bool,
    config_in_flight: bool,
    pending_mode: Option<PendingEntry<bool>>,
    pending_pump: Option<PendingEntry<PumpState>>,
}

impl State {
    fn entry<T>(&mut self, desired: T, revision: u64) -> PendingEntry<T> {
        self.next_id += 1;
        PendingEntry {
            desired,
            revision,
            id: self.next_id,
        }
    }

    /// Drops the pending mode only if it is still the one `entry` recorded.
    fn withdraw_mode(&mut self, entry: PendingEntry<bool>) {
        if self.pending_mode == Some(entry) {
            self.pending_mode = None;
        }
    }
}

pub struct Dispatcher {
    api: Arc<dyn DeviceApi>,
    view: ViewReader,
    command_timeout: Duration,
    state: Mutex<State>,
}

impl Dispatcher {
    pub fn new(api: Arc<dyn DeviceApi>, view: ViewReader, command_timeout: Duration) -> Self {
        Self {
            api,
            view,
            command_timeout,
            state: Mutex::new(State::default()),
        }
    }

    /// Switches between automatic and manual watering.
    pub async fn set_mode(&self, auto_on: bool) -> Result<CommandOutcome> {
        let view = self.view.snapshot();
        let config = view
            .config
            .as_ref()
            .ok_or(Precondition::ConfigUnknown)
            .map_err(|p| self.reject(CommandKind::Mode, p))?;

        if config.auto_mode == Some(auto_on) {
            debug!("Auto mode already {}, nothing to send", auto_on);
            return Ok(CommandOutcome::Unchanged);
        }

        let (_slot, entry) = {
            let mut state = self.lock();
            match state.mode_in_flight {
                Some(in_flight) if in_flight == auto_on => {
                    debug!("Mode change to {} already in flight", auto_on);
                    return Ok(CommandOutcome::AlreadyPending);
                }
                Some(_) => return Err(self.reject(CommandKind::Mode, Precondition::InFlight(CommandKind::Mode))),
                None => {}
            }
            state.mode_in_flight = Some(auto_on);
            let entry = state.entry(auto_on, view.config_revision);
            state.pending_mode = Some(entry);
            (Slot::new(self, CommandKind::Mode), entry)
        };

        info!("Setting auto mode to {}", auto_on);
        let update = ConfigUpdate::mode(auto_on);
        match self.send(CommandKind::Mode, self.api.update_config(&update)).await {
            Ok(()) => Ok(CommandOutcome::Sent),
            Err(e) => {
                self.lock().withdraw_mode(entry);
                Err(e)
            }
        }
    }

    /// Starts or stops the pump. `duration` only applies to `On`; without it
    /// the device uses its configured pump duration.
    pub async fn set_pump(&self, state: PumpState, duration: Option<u32>) -> Result<CommandOutcome> {
        validate_duration(duration).map_err(|e| self.reject_invalid(CommandKind::Pump, e))?;

        let view = self.view.snapshot();
        check_pump(&view, self.view.is_offline(), state)
            .map_err(|p| self.reject(CommandKind::Pump, p))?;

        let (_slot, entry) = {
            let mut guard = self.lock();
            if guard.pump_in_flight {
                return Err(self.reject(CommandKind::Pump, Precondition::InFlight(CommandKind::Pump)));
            }
            guard.pump_in_flight = true;
            let entry = guard.entry(state, view.config_revision);
            guard.pending_pump = Some(entry);
            (Slot::new(self, CommandKind::Pump), entry)
        };

        let command = PumpCommand {
            state,
            duration: match state {
                PumpState::On => duration,
                PumpState::Off => None,
            },
        };
        info!("Sending pump {} (duration: {:?})", state, command.duration);
        match self.send(CommandKind::Pump, self.api.set_pump(&command)).await {
            Ok(()) => Ok(CommandOutcome::Sent),
            Err(e) => {
                let mut guard = self.lock();
                if guard.pending_pump == Some(entry) {
                    guard.pending_pump = None;
                }
                Err(e)
            }
        }
    }

    /// Sends a partial configuration change after validating it.
    pub async fn update_config(&self, update: ConfigUpdate) -> Result<CommandOutcome> {
        validate_update(&update).map_err(|e| self.reject_invalid(CommandKind::Config, e))?;

        let view = self.view.snapshot();
        let (_slot, entry) = {
            let mut state = self.lock();
            if state.config_in_flight {
                return Err(self.reject(CommandKind::Config, Precondition::InFlight(CommandKind::Config)));
            }
            state.config_in_flight = true;
            let entry = update
                .auto_mode
                .filter(|v| view.auto_mode() != Some(*v))
                .map(|auto_on| state.entry(auto_on, view.config_revision));
            if entry.is_some() {
                state.pending_mode = entry;
            }
            (Slot::new(self, CommandKind::Config), entry)
        };

        info!("Updating device configuration: {:?}", update);
        match self.send(CommandKind::Config, self.api.update_config(&update)).await {
            Ok(()) => Ok(CommandOutcome::Sent),
            Err(e) => {
                if let Some(entry) = entry {
                    self.lock().withdraw_mode(entry);
                }
                Err(e)
            }
        }
    }

    /// Pending values still waiting for an authoritative config push.
    pub fn pending(&self) -> Pending {
        let revision = self.view.snapshot().config_revision;
        let state = self.lock();
        Pending {
            mode: state
                .pending_mode
                .filter(|p| p.revision >= revision)
                .map(|p| p.desired),
            pump: state
                .pending_pump
                .filter(|p| p.revision >= revision)
                .map(|p| p.desired),
        }
    }

    async fn send<F>(&self, kind: CommandKind, call: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        COMMANDS_TOTAL.inc();
        match tokio::time::timeout(self.command_timeout, call).await {
            Ok(Ok(())) => {
                info!("{} command accepted", kind);
                Ok(())
            }
            Ok(Err(e)) => {
                COMMAND_FAILURES_TOTAL.inc();
                warn!("{} command failed: {}", kind, e);
                Err(e)
            }
            Err(_) => {
                COMMAND_FAILURES_TOTAL.inc();
                warn!("{} command timed out after {:?}", kind, self.command_timeout);
                Err(Error::CommandFailure(format!(
                    "{} command timed out after {:?}",
                    kind, self.command_timeout
                )))
            }
        }
    }

    fn reject(&self, kind: CommandKind, precondition: Precondition) -> Error {
        COMMANDS_REJECTED_TOTAL.inc();
        info!("{} command refused: {}", kind, precondition);
        Error::Precondition(precondition)
    }

    fn reject_invalid(&self, kind: CommandKind, error: Error) -> Error {
        COMMANDS_REJECTED_TOTAL.inc();
        info!("{} command refused: {}", kind, error);
        error
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Frees an in-flight slot when the call finishes, however it finishes.
struct Slot<'a> {
    dispatcher: &'a Dispatcher,
    kind: CommandKind,
}

impl<'a> Slot<'a> {
    fn new(dispatcher: &'a Dispatcher, kind: CommandKind) -> Self {
        Self { dispatcher, kind }
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        let mut state = self.dispatcher.lock();
        match self.kind {
            CommandKind::Mode => state.mode_in_flight = None,
            CommandKind::Pump => state.pump_in_flight = false,
            CommandKind::Config => state.config_in_flight = false,
        }
    }
}

/// Preconditions of a pump command against the known device state.
pub fn check_pump(view: &DeviceView, offline: bool, state: PumpState) -> std::result::Result<(), Precondition> {
    if offline {
        return Err(Precondition::Offline);
    }
    let config = view.config.as_ref().ok_or(Precondition::ConfigUnknown)?;
    let running = config.pump_running.ok_or(Precondition::ConfigUnknown)?;

    match state {
        PumpState::On => {
            match config.auto_mode {
                Some(true) => return Err(Precondition::AutoModeEnabled),
                Some(false) => {}
                None => return Err(Precondition::ConfigUnknown),
            }
            if running {
                return Err(Precondition::PumpAlreadyRunning);
            }
        }
        PumpState::Off => {
            if !running {
                return Err(Precondition::PumpNotRunning);
            }
        }
    }
    Ok(())
}

/// Which controls a presentation layer should enable right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Controls {
    pub can_start_pump: bool,
    pub can_stop_pump: bool,
    pub can_toggle_mode: bool,
    pub notice: Option<&'static str>,
}

impl Controls {
    pub fn evaluate(view: &DeviceView, offline: bool) -> Self {
        let notice = if offline {
            Some("Device is offline. Controls are disabled.")
        } else if view.auto_mode() == Some(true) {
            Some("Manual control is disabled while Auto mode is enabled.")
        } else {
            None
        };

        Self {
            can_start_pump: check_pump(view, offline, PumpState::On).is_ok(),
            can_stop_pump: check_pump(view, offline, PumpState::Off).is_ok(),
            can_toggle_mode: !offline && view.auto_mode().is_some(),
            notice,
        }
    }
}
