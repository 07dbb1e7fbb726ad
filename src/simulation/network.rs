//! Air channel.
//!
//! The air channel is the only entity that sees every device. When a device
//! transmits, it computes the received power at every other device with the
//! log-distance path-loss model and posts a matched arrival/departure pair to
//! each receiver at `now + distance / c`. Receivers below the reception floor
//! never hear the signal, and a transmitter never hears itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::burst::{Propagation, TransmittedSignal};
use super::error::SimError;
use super::scheduler::{Entity, EntityId, Event, EventPayload, SimContext};
use super::signal_calculations::{PathLossParameters, calculate_path_loss, dbm_to_mw, propagation_delay};
use super::types::DeviceId;

/// Position of a device in meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn distance_to(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

pub struct AirChannel {
    positions: BTreeMap<DeviceId, Position>,
    path_loss: PathLossParameters,
    reception_floor_dbm: f64,
    signals_distributed: u64,
}

impl AirChannel {
    pub fn new(path_loss: PathLossParameters, reception_floor_dbm: f64) -> Self {
        AirChannel {
            positions: BTreeMap::new(),
            path_loss,
            reception_floor_dbm,
            signals_distributed: 0,
        }
    }

    pub fn place(&mut self, device: DeviceId, position: Position) {
        self.positions.insert(device, position);
    }

    pub fn position(&self, device: DeviceId) -> Option<Position> {
        self.positions.get(&device).copied()
    }

    pub fn signals_distributed(&self) -> u64 {
        self.signals_distributed
    }

    /// Post arrival/departure pairs of `signal` to every device that can hear it.
    fn distribute(&mut self, signal: &Arc<TransmittedSignal>, ctx: &mut SimContext) -> Result<(), SimError> {
        let sender = signal.id.source;
        let origin = self.positions.get(&sender).copied().ok_or(SimError::UnknownDevice(sender))?;
        self.signals_distributed += 1;

        for (&receiver, position) in &self.positions {
            if receiver == sender {
                continue;
            }
            let distance = origin.distance_to(position);
            let path_loss_db = calculate_path_loss(distance, &self.path_loss, ctx.rng());
            let rx_power_dbm = signal.tx_power_dbm - path_loss_db;
            if rx_power_dbm < self.reception_floor_dbm {
                log::trace!(
                    "[{}] signal {:?} below reception floor at {} ({:.1} dBm)",
                    sender,
                    signal.id.sequence,
                    receiver,
                    rx_power_dbm
                );
                continue;
            }

            let delay = propagation_delay(distance);
            let propagation = Propagation {
                tx_power_dbm: signal.tx_power_dbm,
                path_loss_db,
                delay,
            };
            ctx.post_event(delay, EntityId::Device(receiver), EventPayload::SignalArrival {
                signal: Arc::clone(signal),
                rx_power_mw: dbm_to_mw(rx_power_dbm),
                propagation,
            })?;
            ctx.post_event(delay + signal.duration(), EntityId::Device(receiver), EventPayload::SignalDeparture {
                id: signal.id,
            })?;
        }
        Ok(())
    }
}

impl Entity for AirChannel {
    fn entity_id(&self) -> EntityId {
        EntityId::Air
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Transmit { signal } => self.distribute(signal, ctx),
            other => {
                log::warn!("air channel ignores {:?}", std::mem::discriminant(other));
                Ok(())
            }
        }
    }
}
