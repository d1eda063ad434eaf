//! Canonical per-vehicle telemetry, merged from relay deltas.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{PoisonError, RwLock};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::protocol::{Fields, InboundEvent, TelemetryDelta, BROADCAST_ID};
use crate::relay::{ConnectionState, ConnectionStatus, RelayListener};

pub const TRAIL_LENGTH: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Vehicle {
    pub id: String,
    pub data: Fields,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VehicleStatus {
    Reached,
    InProgress,
    StationKeeping,
}

impl Vehicle {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    fn number(&self, names: &[&str]) -> Option<f64> {
        names
            .iter()
            .find_map(|name| self.data.get(*name).and_then(Value::as_f64))
            .filter(|v| v.is_finite())
    }

    pub fn latitude(&self) -> Option<f64> {
        self.number(&["latitude", "lat"])
    }

    pub fn longitude(&self) -> Option<f64> {
        self.number(&["longitude", "lng"])
    }

    pub fn position(&self) -> Option<(f64, f64)> {
        Some((self.latitude()?, self.longitude()?))
    }

    pub fn status(&self) -> VehicleStatus {
        match self.data.get("status").and_then(Value::as_str) {
            Some("Reached Destination") => VehicleStatus::Reached,
            Some(s) if s.starts_with("In Progress") => VehicleStatus::InProgress,
            _ => VehicleStatus::StationKeeping,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FleetChange {
    Updated(String),
    Replaced,
    Cleared,
    /// A vehicle reported a `reached` notification not seen before.
    Arrived {
        vehicle_id: String,
        notification_id: String,
    },
}

#[derive(Default)]
struct FleetInner {
    vehicles: Vec<Vehicle>,
    index: HashMap<String, usize>,
    trails: HashMap<String, VecDeque<(f64, f64)>>,
    arrivals: HashSet<(String, String)>,
}

impl FleetInner {
    fn merge(&mut self, vehicle_id: &str, fields: &Fields, now: DateTime<Utc>) {
        let slot = match self.index.get(vehicle_id) {
            Some(&slot) => slot,
            None => {
                self.vehicles.push(Vehicle {
                    id: vehicle_id.to_string(),
                    data: Fields::new(),
                    last_seen: now,
                });
                let slot = self.vehicles.len() - 1;
                self.index.insert(vehicle_id.to_string(), slot);
                slot
            }
        };
        let vehicle = &mut self.vehicles[slot];
        // Shallow: nested objects are replaced whole.
        for (key, value) in fields {
            vehicle.data.insert(key.clone(), value.clone());
        }
        vehicle.last_seen = now;
    }

    fn track(&mut self, vehicle_id: &str, fields: &Fields) {
        let moved = ["latitude", "longitude", "lat", "lng"]
            .iter()
            .any(|key| fields.contains_key(*key));
        if !moved {
            return;
        }
        let Some(position) = self
            .index
            .get(vehicle_id)
            .and_then(|&slot| self.vehicles[slot].position())
        else {
            return;
        };
        let trail = self.trails.entry(vehicle_id.to_string()).or_default();
        trail.push_back(position);
        while trail.len() > TRAIL_LENGTH {
            trail.pop_front();
        }
    }

    fn arrival(&mut self, vehicle_id: &str, fields: &Fields) -> Option<FleetChange> {
        let notification = fields.get("notification")?.as_object()?;
        if notification.get("type").and_then(Value::as_str) != Some("reached") {
            return None;
        }
        let notification_id = match notification.get("id")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        self.arrivals
            .insert((vehicle_id.to_string(), notification_id.clone()))
            .then(|| FleetChange::Arrived {
                vehicle_id: vehicle_id.to_string(),
                notification_id,
            })
    }
}

pub struct FleetStore {
    inner: RwLock<FleetInner>,
    changes: broadcast::Sender<FleetChange>,
}

impl Default for FleetStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FleetStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(FleetInner::default()),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetChange> {
        self.changes.subscribe()
    }

    /// Merges `fields` into the vehicle's data, creating it if needed.
    pub fn apply_delta(&self, vehicle_id: &str, fields: &Fields) -> Result<()> {
        let now = Utc::now();
        let arrival = {
            let mut inner = self
                .inner
                .write()
                .map_err(|e| anyhow!("Lock error: {}", e))?;
            inner.merge(vehicle_id, fields, now);
            inner.track(vehicle_id, fields);
            inner.arrival(vehicle_id, fields)
        };
        debug!("Merged {} field(s) for {}", fields.len(), vehicle_id);

        let _ = self.changes.send(FleetChange::Updated(vehicle_id.to_string()));
        if let Some(arrival) = arrival {
            info!("Vehicle {} has reached its destination", vehicle_id);
            let _ = self.changes.send(arrival);
        }
        Ok(())
    }

    /// Replaces the whole fleet. The only path that removes vehicles.
    pub fn apply_bulk(&self, fleet: &[TelemetryDelta]) -> Result<()> {
        let now = Utc::now();
        let fleet: Vec<&TelemetryDelta> = fleet
            .iter()
            .filter(|delta| {
                let broadcast = delta.vehicle_id == BROADCAST_ID;
                if broadcast {
                    warn!("Ignoring fleet entry addressed to the broadcast id");
                }
                !broadcast
            })
            .collect();
        {
            let mut guard = self
                .inner
                .write()
                .map_err(|e| anyhow!("Lock error: {}", e))?;
            let inner = &mut *guard;
            let trails = std::mem::take(&mut inner.trails);
            let arrivals = std::mem::take(&mut inner.arrivals);
            *inner = FleetInner::default();
            for delta in &fleet {
                inner.merge(&delta.vehicle_id, &delta.fields, now);
            }
            inner.trails = trails
                .into_iter()
                .filter(|(id, _)| inner.index.contains_key(id))
                .collect();
            inner.arrivals = arrivals
                .into_iter()
                .filter(|(id, _)| inner.index.contains_key(id))
                .collect();
            for delta in &fleet {
                inner.track(&delta.vehicle_id, &delta.fields);
            }
        }
        debug!("Fleet replaced with {} vehicle(s)", fleet.len());
        let _ = self.changes.send(FleetChange::Replaced);
        Ok(())
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.vehicles.is_empty() {
            return;
        }
        *inner = FleetInner::default();
        drop(inner);
        info!("Fleet cleared");
        let _ = self.changes.send(FleetChange::Cleared);
    }

    /// Current fleet in first-seen order. Order carries no meaning.
    pub fn snapshot(&self) -> Result<Vec<Vehicle>> {
        let inner = self
            .inner
            .read()
            .map_err(|e| anyhow!("Lock error: {}", e))?;
        Ok(inner.vehicles.clone())
    }

    pub fn get(&self, vehicle_id: &str) -> Option<Vehicle> {
        let inner = self.inner.read().ok()?;
        inner
            .index
            .get(vehicle_id)
            .map(|&slot| inner.vehicles[slot].clone())
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.vehicles.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last [`TRAIL_LENGTH`] reported positions, oldest first.
    pub fn trail(&self, vehicle_id: &str) -> Vec<(f64, f64)> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.trails.get(vehicle_id).cloned())
            .map(Vec::from)
            .unwrap_or_default()
    }
}

impl RelayListener for FleetStore {
    fn on_status(&self, status: &ConnectionStatus) {
        if status.state == ConnectionState::Disconnected {
            self.clear();
        }
    }

    fn on_event(&self, event: &InboundEvent) {
        let result = match event {
            InboundEvent::BoatData(delta) if delta.vehicle_id == BROADCAST_ID => {
                warn!("Ignoring telemetry addressed to the broadcast id");
                return;
            }
            InboundEvent::BoatData(delta) => self.apply_delta(&delta.vehicle_id, &delta.fields),
            InboundEvent::BoatLocations(fleet) => self.apply_bulk(fleet),
            _ => return,
        };
        if let Err(e) = result {
            error!("Failed to apply telemetry: {}", e);
        }
    }
}
