//! Interference ledger.
//!
//! Each receiver tracks every signal currently on air at its antenna, split
//! into signals it is *receiving* (locked on) and signals that only add
//! interference. Whenever that set changes, the interference power of every
//! burst is recomputed from scratch against all other overlapping bursts.
//!
//! ## Contribution of one interferer X to a burst B
//!
//! ```text
//! G   = 1                 if X shares B's scrambling + channelization code
//!       sf(B)             otherwise
//! k   = 2                 if {phase(B), phase(X)} = {I, Q}
//!       1                 otherwise
//! I_X = P(X's signal) × gain(X) / G / k
//! ```

use super::burst::{Burst, Signal, SignalId};
use super::error::SimError;
use super::time::SimTime;
use super::types::{DeviceId, PhaseBranch};

/// Division applied when two bursts sit on disjoint single phase branches.
pub const BRANCH_FACTOR: f64 = 2.0;

/// Spreading gain when two bursts share the exact same codes.
pub const COLLIDED_SPREADING_GAIN: f64 = 1.0;

pub fn branch_factor(a: PhaseBranch, b: PhaseBranch) -> f64 {
    match (a, b) {
        (PhaseBranch::InPhase, PhaseBranch::Quadrature) | (PhaseBranch::Quadrature, PhaseBranch::InPhase) => BRANCH_FACTOR,
        _ => 1.0,
    }
}

/// The fields of a burst the interference sum reads.
#[derive(Debug, Clone, Copy)]
struct Interferer {
    rx_start: SimTime,
    rx_end: SimTime,
    power_mw: f64,
    scrambling_code: u32,
    channelization_code: u32,
    phase: PhaseBranch,
}

impl From<&Burst> for Interferer {
    fn from(b: &Burst) -> Self {
        Interferer {
            rx_start: b.rx_start,
            rx_end: b.rx_evaluated_end,
            power_mw: b.power_mw,
            scrambling_code: b.scrambling_code,
            channelization_code: b.channelization_code,
            phase: b.phase,
        }
    }
}

impl Interferer {
    fn overlaps(&self, victim: &Burst) -> bool {
        !(self.rx_start >= victim.rx_evaluated_end || self.rx_end <= victim.rx_start)
    }

    fn contribution_to(&self, victim: &Burst) -> f64 {
        let shares_code = victim.scrambling_code == self.scrambling_code && victim.channelization_code == self.channelization_code;
        let spreading_gain = if shares_code {
            COLLIDED_SPREADING_GAIN
        } else {
            victim.spread_factor.as_f64()
        };
        self.power_mw / spreading_gain / branch_factor(victim.phase, self.phase)
    }
}

/// Power (mW) that `interferer` adds to `victim`, ignoring timing.
pub fn interference_contribution(victim: &Burst, interferer: &Burst) -> f64 {
    Interferer::from(interferer).contribution_to(victim)
}

/// All signals currently on air at one receiver.
#[derive(Debug, Default)]
pub struct InterferenceLedger {
    received: Vec<Signal>,
    interference_only: Vec<Signal>,
}

impl InterferenceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a signal to the received or interference-only set.
    ///
    /// A signal id already tracked would make a burst interfere with itself,
    /// which is reported as a fatal error.
    pub fn insert(&mut self, owner: DeviceId, signal: Signal, received: bool) -> Result<(), SimError> {
        if self.contains(signal.id) {
            return Err(SimError::SelfInterference {
                device: owner,
                signal: signal.id,
            });
        }
        if received {
            self.received.push(signal);
        } else {
            self.interference_only.push(signal);
        }
        Ok(())
    }

    pub fn contains(&self, id: SignalId) -> bool {
        self.received.iter().chain(self.interference_only.iter()).any(|s| s.id == id)
    }

    /// Remove a signal. The flag tells whether it was in the received set.
    pub fn remove(&mut self, id: SignalId) -> Option<(Signal, bool)> {
        if let Some(pos) = self.received.iter().position(|s| s.id == id) {
            return Some((self.received.remove(pos), true));
        }
        if let Some(pos) = self.interference_only.iter().position(|s| s.id == id) {
            return Some((self.interference_only.remove(pos), false));
        }
        None
    }

    pub fn received(&self) -> &[Signal] {
        &self.received
    }

    pub fn received_mut(&mut self) -> &mut [Signal] {
        &mut self.received
    }

    pub fn interference_only(&self) -> &[Signal] {
        &self.interference_only
    }

    pub fn len(&self) -> usize {
        self.received.len() + self.interference_only.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total received power of everything on air (mW).
    pub fn total_power_mw(&self) -> f64 {
        self.received.iter().chain(self.interference_only.iter()).map(|s| s.rx_power_mw).sum()
    }

    /// Recompute `interference_mw` of every burst in both sets.
    pub fn recompute(&mut self) {
        let snapshot: Vec<(SignalId, usize, Interferer)> = self
            .received
            .iter()
            .chain(self.interference_only.iter())
            .flat_map(|s| s.bursts.iter().enumerate().map(move |(i, b)| (s.id, i, Interferer::from(b))))
            .collect();

        for signal in self.received.iter_mut().chain(self.interference_only.iter_mut()) {
            let id = signal.id;
            for (index, burst) in signal.bursts.iter_mut().enumerate() {
                let victim: &Burst = burst;
                let total: f64 = snapshot
                    .iter()
                    .filter(|(other_id, other_index, _)| !(*other_id == id && *other_index == index))
                    .filter(|(_, _, x)| x.overlaps(victim))
                    .map(|(_, _, x)| x.contribution_to(victim))
                    .sum();
                burst.interference_mw = total;
            }
        }
        log::trace!("interference recomputed over {} bursts", snapshot.len());
    }

    /// Drop every tracked signal, returning how many were released.
    pub fn clear(&mut self) -> usize {
        let count = self.len();
        self.received.clear();
        self.interference_only.clear();
        count
    }
}
