//! Operator intent → outbound relay commands.
//!
//! Manual control is re-transmitted at a fixed period while held, decoupled
//! from how often the operator moves the control. Goals are fire-and-forget.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::protocol::{
    CalibrationRequest, Command, CommandMode, CommandSchema, Envelope, Fields, GoalCommand,
    ManualCommand,
};
use crate::relay::{ConnectionManager, ConnectionState, ConnectionStatus, RelayListener};

pub const DEFAULT_PERIOD: Duration = Duration::from_millis(500);

/// Latest deflection for one vehicle. `None` once released; the ticker
/// sends under this lock so nothing follows the zeroed command.
type LatestCommand = Arc<Mutex<Option<ManualCommand>>>;

struct HeldControl {
    latest: LatestCommand,
    ticker: Option<JoinHandle<()>>,
}

impl HeldControl {
    fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }

    fn release(&mut self) -> LatestCommand {
        self.stop();
        self.latest.clone()
    }
}

/// One ticker beat. False when the control was released or the send failed.
fn send_latest(
    latest: &Mutex<Option<ManualCommand>>,
    connection: &ConnectionManager,
    schema: CommandSchema,
) -> bool {
    let latest = latest.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(command) = latest.as_ref() else {
        return false;
    };
    let vehicle_id = command.vehicle_id.clone();
    match connection.send(Command::Manual(command.clone()).to_envelope(schema)) {
        Ok(()) => true,
        Err(e) => {
            debug!("Manual ticker for {} stopping: {}", vehicle_id, e);
            false
        }
    }
}

pub struct CommandDispatcher {
    connection: Arc<ConnectionManager>,
    schema: CommandSchema,
    period: Duration,
    controls: Mutex<HashMap<String, HeldControl>>,
    mode: Mutex<CommandMode>,
}

impl CommandDispatcher {
    pub fn new(connection: Arc<ConnectionManager>, schema: CommandSchema, period: Duration) -> Self {
        Self {
            connection,
            schema,
            period,
            controls: Mutex::new(HashMap::new()),
            mode: Mutex::new(CommandMode::Manual),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn command_mode(&self) -> CommandMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_holding(&self, vehicle_id: &str) -> bool {
        self.controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(vehicle_id)
    }

    pub fn is_transmitting(&self, vehicle_id: &str) -> bool {
        self.controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(vehicle_id)
            .is_some_and(|control| control.ticker.is_some())
    }

    /// Takes hold of `vehicle_id`. Dropped silently while disconnected.
    /// Holding twice is a no-op; the ticker starts on the first update.
    pub fn begin_manual_control(&self, vehicle_id: &str) -> bool {
        if !self.connection.is_connected() {
            debug!("Not connected; ignoring manual control of {}", vehicle_id);
            return false;
        }
        self.set_mode(CommandMode::Manual);
        let mut controls = self.controls.lock().unwrap_or_else(PoisonError::into_inner);
        controls
            .entry(vehicle_id.to_string())
            .or_insert_with(|| HeldControl {
                latest: Arc::new(Mutex::new(Some(ManualCommand::zeroed(vehicle_id)))),
                ticker: None,
            });
        true
    }

    /// Records the latest deflection. Never transmits by itself.
    pub fn update_manual_control(&self, vehicle_id: &str, rudder: f64, throttle: f64, sail: f64) -> bool {
        if !self.begin_manual_control(vehicle_id) {
            return false;
        }
        let mut controls = self.controls.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(control) = controls.get_mut(vehicle_id) else {
            return false;
        };
        *control.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(ManualCommand {
            vehicle_id: vehicle_id.to_string(),
            rudder,
            throttle,
            sail,
        });
        if control.ticker.is_none() {
            debug!("Starting manual ticker for {} every {:?}", vehicle_id, self.period);
            control.ticker = Some(self.spawn_ticker(control.latest.clone()));
        }
        true
    }

    /// Stops re-transmission and sends one zeroed command so the actuators
    /// settle, whether or not a ticker ever ran.
    pub fn end_manual_control(&self, vehicle_id: &str) -> bool {
        let zeroed = Command::Manual(ManualCommand::zeroed(vehicle_id));
        let control = self
            .controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(vehicle_id);
        let Some(mut control) = control else {
            return self.transmit(zeroed);
        };
        let latest = control.release();
        let mut latest = latest.lock().unwrap_or_else(PoisonError::into_inner);
        *latest = None;
        self.transmit(zeroed)
    }

    pub fn send_goal(&self, vehicle_id: &str, latitude: f64, longitude: f64) -> bool {
        if !latitude.is_finite() || !longitude.is_finite() {
            warn!("Refusing goal for {} with non-finite target", vehicle_id);
            return false;
        }
        let sent = self.transmit(Command::Goal(GoalCommand {
            vehicle_id: vehicle_id.to_string(),
            target_latitude: latitude,
            target_longitude: longitude,
        }));
        if sent {
            self.set_mode(CommandMode::Autonomous);
            info!("Goal ({}, {}) sent to {}", latitude, longitude, vehicle_id);
        }
        sent
    }

    pub fn request_calibration(&self, vehicle_id: &str) -> bool {
        self.send_envelope(
            CalibrationRequest::Request {
                vehicle_id: vehicle_id.to_string(),
            }
            .to_envelope(),
        )
    }

    pub fn send_calibration(&self, vehicle_id: &str, values: Fields) -> bool {
        self.send_envelope(
            CalibrationRequest::Send {
                vehicle_id: vehicle_id.to_string(),
                values,
            }
            .to_envelope(),
        )
    }

    pub fn test_calibration(&self, vehicle_id: &str, values: Fields) -> bool {
        self.send_envelope(
            CalibrationRequest::Test {
                vehicle_id: vehicle_id.to_string(),
                values,
            }
            .to_envelope(),
        )
    }

    /// Ends every held control, zeroing each vehicle. Returns how many.
    pub fn release_all(&self) -> usize {
        let held: Vec<String> = self
            .controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for vehicle_id in &held {
            self.end_manual_control(vehicle_id);
        }
        held.len()
    }

    /// Cancels every ticker without sending anything.
    pub fn cancel_all(&self) {
        let mut controls = self.controls.lock().unwrap_or_else(PoisonError::into_inner);
        if controls.is_empty() {
            return;
        }
        for control in controls.values_mut() {
            *control.release().lock().unwrap_or_else(PoisonError::into_inner) = None;
        }
        info!("Cancelled {} held control(s)", controls.len());
        controls.clear();
    }

    fn set_mode(&self, mode: CommandMode) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    fn transmit(&self, command: Command) -> bool {
        self.send_envelope(command.to_envelope(self.schema))
    }

    fn send_envelope(&self, envelope: Envelope) -> bool {
        let event = envelope.event.clone();
        match self.connection.send(envelope) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping {}: {}", event, e);
                false
            }
        }
    }

    fn spawn_ticker(&self, latest: LatestCommand) -> JoinHandle<()> {
        let connection = self.connection.clone();
        let schema = self.schema;
        let period = self.period;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !send_latest(&latest, &connection, schema) {
                    break;
                }
            }
        })
    }
}

impl RelayListener for CommandDispatcher {
    fn on_status(&self, status: &ConnectionStatus) {
        if status.state == ConnectionState::Disconnected {
            self.cancel_all();
        }
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
