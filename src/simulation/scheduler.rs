//! Discrete-event scheduler.
//!
//! Events are kept in a min-heap ordered by `(time, id)`; ids grow with
//! insertion, so events posted for the same instant run in the order they
//! were posted. Handlers never run concurrently: each one runs to completion
//! and may post new events through the [`SimContext`], which the loop moves
//! into the heap before the next dispatch.
//!
//! All randomness of a run comes from the context's seeded `ChaCha8Rng`, so a
//! run is fully determined by its seed, its scene and its configuration.

use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::burst::{Propagation, SignalId, TransmittedSignal};
use super::command::InterlayerCommand;
use super::device::Device;
use super::error::SimError;
use super::network::AirChannel;
use super::stats::{DeviceReport, ReleasedResources};
use super::time::SimTime;
use super::types::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityId {
    Air,
    Device(DeviceId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub u64);

#[derive(Debug, Clone)]
pub enum EventPayload {
    /// Slot boundary of a device.
    SlotTick,
    /// A device put a signal on air.
    Transmit { signal: Arc<TransmittedSignal> },
    /// A signal reaches a receiver's antenna.
    SignalArrival {
        signal: Arc<TransmittedSignal>,
        rx_power_mw: f64,
        propagation: Propagation,
    },
    /// The matching end of a `SignalArrival`.
    SignalDeparture { id: SignalId },
    /// Command from the device's upper layers.
    Command(InterlayerCommand),
}

#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    pub time: SimTime,
    pub source: EntityId,
    pub target: EntityId,
    pub payload: EventPayload,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap and the earliest event must come out first
        other.time.cmp(&self.time).then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// Handed to entities while they handle an event.
pub struct SimContext {
    time: SimTime,
    rng: ChaCha8Rng,
    pending_events: Vec<Event>,
    next_event_id: u64,
    source: EntityId,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        SimContext {
            time: SimTime::ZERO,
            rng: ChaCha8Rng::seed_from_u64(seed),
            pending_events: Vec::new(),
            next_event_id: 0,
            source: EntityId::Air,
        }
    }

    pub fn time(&self) -> SimTime {
        self.time
    }

    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    pub fn set_time(&mut self, time: SimTime) {
        self.time = time;
    }

    pub fn set_source(&mut self, entity: EntityId) {
        self.source = entity;
    }

    /// Post an event for `target` after `delay`.
    pub fn post_event(&mut self, delay: SimTime, target: EntityId, payload: EventPayload) -> Result<(), SimError> {
        let time = self.time.checked_add(delay).ok_or(SimError::TimeOverflow)?;
        let event = Event {
            id: EventId(self.next_event_id()),
            time,
            source: self.source,
            target,
            payload,
        };
        self.pending_events.push(event);
        Ok(())
    }

    pub fn post_immediate(&mut self, target: EntityId, payload: EventPayload) -> Result<(), SimError> {
        self.post_event(SimTime::ZERO, target, payload)
    }

    pub fn take_pending_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }

    pub fn next_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }
}

/// Anything that reacts to events.
pub trait Entity {
    fn entity_id(&self) -> EntityId;

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError>;
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub seed: u64,
    pub simulated_until: SimTime,
    pub events_processed: u64,
    pub devices: Vec<DeviceReport>,
}

/// Devices, the air channel and the event queue of one run.
pub struct Simulation {
    seed: u64,
    queue: BinaryHeap<Event>,
    context: SimContext,
    devices: BTreeMap<DeviceId, Device>,
    air: AirChannel,
    events_processed: u64,
    started: bool,
}

impl Simulation {
    pub fn new(seed: u64, devices: Vec<Device>, air: AirChannel) -> Self {
        Simulation {
            seed,
            queue: BinaryHeap::new(),
            context: SimContext::new(seed),
            devices: devices.into_iter().map(|d| (d.id(), d)).collect(),
            air,
            events_processed: 0,
            started: false,
        }
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn now(&self) -> SimTime {
        self.context.time()
    }

    /// Queue an upper-layer command for `device` at absolute time `at`.
    pub fn schedule_command(&mut self, at: SimTime, device: DeviceId, command: InterlayerCommand) -> Result<(), SimError> {
        if !self.devices.contains_key(&device) {
            return Err(SimError::UnknownDevice(device));
        }
        self.push_external(at, EntityId::Device(device), EventPayload::Command(command));
        Ok(())
    }

    fn push_external(&mut self, time: SimTime, target: EntityId, payload: EventPayload) {
        let id = EventId(self.context.next_event_id());
        self.queue.push(Event {
            id,
            time,
            source: target,
            target,
            payload,
        });
    }

    /// Process events up to and including `until`.
    ///
    /// The first call starts every device's slot clock at time zero. Any
    /// handler error aborts the run and is returned.
    pub fn run_until(&mut self, until: SimTime) -> Result<(), SimError> {
        if !self.started {
            self.started = true;
            let ids: Vec<DeviceId> = self.devices.keys().copied().collect();
            for id in ids {
                self.push_external(SimTime::ZERO, EntityId::Device(id), EventPayload::SlotTick);
            }
            log::info!("simulation started: {} devices, seed {}", self.devices.len(), self.seed);
        }

        while let Some(event) = self.queue.peek() {
            if event.time > until {
                break;
            }
            let Some(event) = self.queue.pop() else { break };
            self.context.set_time(event.time);
            self.context.set_source(event.target);
            if let Err(e) = self.dispatch(&event) {
                log::error!("run aborted at {}: {}", event.time, e);
                return Err(e);
            }
            self.events_processed += 1;
            for pending in self.context.take_pending_events() {
                self.queue.push(pending);
            }
        }
        self.context.set_time(self.context.time().max(until));
        Ok(())
    }

    fn dispatch(&mut self, event: &Event) -> Result<(), SimError> {
        match event.target {
            EntityId::Air => self.air.handle_event(event, &mut self.context),
            EntityId::Device(id) => {
                let device = self.devices.get_mut(&id).ok_or(SimError::UnknownDevice(id))?;
                device.handle_event(event, &mut self.context)
            }
        }
    }

    /// Release every in-flight resource and build the per-device reports.
    pub fn finalize(mut self) -> RunSummary {
        let now = self.context.time();
        let dropped_events = self.queue.len();
        self.queue.clear();
        let mut released_total = ReleasedResources::default();
        let devices = self
            .devices
            .into_values()
            .map(|mut device| {
                let released = device.finalize(now);
                released_total.signals += released.signals;
                released_total.random_access_states += released.random_access_states;
                released_total.queued_pdus += released.queued_pdus;
                device.into_report(released)
            })
            .collect();
        log::info!(
            "simulation finalized at {}: {} events processed, {} signals on air, {} pending dropped, {} resources released",
            now,
            self.events_processed,
            self.air.signals_distributed(),
            dropped_events,
            released_total.total()
        );
        RunSummary {
            seed: self.seed,
            simulated_until: now,
            events_processed: self.events_processed,
            devices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: u64, time_us: u64) -> Event {
        Event {
            id: EventId(id),
            time: SimTime::from_micros(time_us),
            source: EntityId::Air,
            target: EntityId::Air,
            payload: EventPayload::SlotTick,
        }
    }

    #[test]
    fn heap_pops_earliest_then_first_posted() {
        let mut heap = BinaryHeap::new();
        heap.push(event(3, 10));
        heap.push(event(1, 20));
        heap.push(event(0, 10));
        heap.push(event(2, 5));
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop()).map(|e| e.id.0).collect();
        assert_eq!(order, vec![2, 0, 3, 1]);
    }

    #[test]
    fn context_assigns_increasing_ids_and_times() {
        let mut ctx = SimContext::new(1);
        ctx.set_time(SimTime::from_micros(100));
        ctx.post_event(SimTime::from_micros(5), EntityId::Air, EventPayload::SlotTick).unwrap();
        ctx.post_immediate(EntityId::Device(DeviceId(3)), EventPayload::SlotTick).unwrap();
        let events = ctx.take_pending_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].time, SimTime::from_micros(105));
        assert_eq!(events[1].time, SimTime::from_micros(100));
        assert!(events[0].id.0 < events[1].id.0);
        assert!(ctx.take_pending_events().is_empty());
    }

    #[test]
    fn overflowing_delay_is_an_error() {
        let mut ctx = SimContext::new(1);
        ctx.set_time(SimTime::from_nanos(u64::MAX - 1));
        assert!(matches!(
            ctx.post_event(SimTime::from_nanos(10), EntityId::Air, EventPayload::SlotTick),
            Err(SimError::TimeOverflow)
        ));
    }
}
