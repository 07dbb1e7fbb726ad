//! Random access (RACH preamble / AICH handshake).
//!
//! ## UE side
//!
//! ```text
//! Idle -> PreambleScheduled -> WaitingForIndicator -> MessageScheduled -> Idle
//!                ^                    |
//!                +---- NACK/timeout --+  (retry with ramped power)
//! ```
//!
//! [`RandomAccess`] is driven by slot ticks and by received acquisition
//! indicators. It never owns timers: each tick decrements the wait of the
//! current phase, so a retired attempt simply has nothing left to tick.
//!
//! ## Base-station side
//!
//! [`AichCollector`] records every preamble decoded since the last
//! acquisition-indicator transmission. A second preamble with the same
//! signature in the same access slot turns the outcome into a collision,
//! which is answered with indicator 0 so that no contender gets an ACK.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::burst::PREAMBLE_SIGNATURES;
use super::time::SLOTS_PER_FRAME;

/// Number of access slots (each two regular slots long, spanning two frames).
pub const ACCESS_SLOTS: u8 = 15;

/// Ramped preamble power may exceed the maximum transmit power by this much.
pub const PREAMBLE_POWER_HEADROOM_DB: f64 = 6.0;

/// Access slots the sub-channel mask repeats over.
const SUB_CHANNELS: u8 = 12;

/// Parameters of one access request, taken from the access service class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRequest {
    #[serde(default)]
    pub asc_index: u8,
    /// Bit `n` enables sub-channel `n`; 0 enables all.
    #[serde(default)]
    pub sub_channels: u16,
    pub max_retry: u32,
    #[serde(default)]
    pub signature_start: u8,
    #[serde(default = "default_signature_end")]
    pub signature_end: u8,
}

fn default_signature_end() -> u8 {
    (PREAMBLE_SIGNATURES - 1) as u8
}

/// Outcome reported to the requester of an access attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessConfirm {
    Ack,
    Nack,
    NoIndicatorResponse,
}

/// Timing and power constants of the procedure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RachTiming {
    pub initial_power_dbm: f64,
    pub ramp_step_db: f64,
    pub max_power_dbm: f64,
    pub aich_timeout_slots: u32,
    pub message_delay_slots: u32,
    /// An explicit NACK ends the attempt instead of consuming one retry.
    pub nack_ends_attempt: bool,
}

impl Default for RachTiming {
    fn default() -> Self {
        RachTiming {
            initial_power_dbm: 10.0,
            ramp_step_db: 3.0,
            max_power_dbm: 30.0,
            aich_timeout_slots: 2 * SLOTS_PER_FRAME as u32,
            message_delay_slots: 3,
            nack_ends_attempt: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPhase {
    PreambleScheduled { wait_slots: u32 },
    WaitingForIndicator { remaining_slots: u32 },
    MessageScheduled { wait_slots: u32 },
}

/// State of the one access attempt a UE may have in progress.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomAccessState {
    pub request: AccessRequest,
    pub signature: u8,
    pub access_slot: u8,
    pub retries_left: u32,
    pub preamble_power_dbm: f64,
    /// Power of the acknowledged preamble, used for the message part.
    pub acknowledged_power_dbm: Option<f64>,
    pub preambles_sent: u32,
    pub phase: AccessPhase,
}

/// What the device has to do as a result of a procedure step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RachAction {
    SendPreamble { signature: u8, access_slot: u8, power_dbm: f64 },
    SendMessage { power_dbm: f64 },
    Confirm(AccessConfirm),
}

/// UE-side random access procedure.
#[derive(Debug, Clone)]
pub struct RandomAccess {
    timing: RachTiming,
    state: Option<RandomAccessState>,
}

impl RandomAccess {
    pub fn new(timing: RachTiming) -> Self {
        RandomAccess { timing, state: None }
    }

    pub fn state(&self) -> Option<&RandomAccessState> {
        self.state.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }

    /// Start an attempt at regular slot `slot_index`.
    ///
    /// Returns `Confirm(NoIndicatorResponse)` right away when the request
    /// allows no preamble at all. A request while an attempt is already in
    /// progress is ignored and returns `None`.
    pub fn start<R: Rng + ?Sized>(&mut self, request: AccessRequest, slot_index: u64, rng: &mut R) -> Option<RachAction> {
        if self.state.is_some() {
            log::warn!("random access already in progress, request ignored");
            return None;
        }
        if request.max_retry == 0 {
            return Some(RachAction::Confirm(AccessConfirm::NoIndicatorResponse));
        }

        let signature = pick_signature(&request, rng);
        let access_slot = pick_access_slot(request.sub_channels, rng);
        let wait_slots = initial_wait(access_slot, slot_index);
        log::debug!(
            "access start: signature {} access slot {} wait {} slots, {} retries",
            signature,
            access_slot,
            wait_slots,
            request.max_retry
        );

        self.state = Some(RandomAccessState {
            retries_left: request.max_retry,
            request,
            signature,
            access_slot,
            preamble_power_dbm: self.timing.initial_power_dbm,
            acknowledged_power_dbm: None,
            preambles_sent: 0,
            phase: AccessPhase::PreambleScheduled { wait_slots },
        });
        None
    }

    /// Advance the procedure by one slot.
    pub fn on_slot<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<RachAction> {
        let state = self.state.as_mut()?;
        match state.phase {
            AccessPhase::PreambleScheduled { wait_slots: 0 } => {
                state.preambles_sent += 1;
                state.phase = AccessPhase::WaitingForIndicator {
                    remaining_slots: self.timing.aich_timeout_slots,
                };
                Some(RachAction::SendPreamble {
                    signature: state.signature,
                    access_slot: state.access_slot,
                    power_dbm: state.preamble_power_dbm,
                })
            }
            AccessPhase::PreambleScheduled { wait_slots } => {
                state.phase = AccessPhase::PreambleScheduled { wait_slots: wait_slots - 1 };
                None
            }
            AccessPhase::WaitingForIndicator { remaining_slots: 0 } => {
                log::debug!("no acquisition indicator for signature {}", state.signature);
                self.retry(rng)
            }
            AccessPhase::WaitingForIndicator { remaining_slots } => {
                state.phase = AccessPhase::WaitingForIndicator {
                    remaining_slots: remaining_slots - 1,
                };
                None
            }
            AccessPhase::MessageScheduled { wait_slots: 0 } => {
                let power_dbm = state.acknowledged_power_dbm.unwrap_or(state.preamble_power_dbm);
                self.state = None;
                Some(RachAction::SendMessage { power_dbm })
            }
            AccessPhase::MessageScheduled { wait_slots } => {
                state.phase = AccessPhase::MessageScheduled { wait_slots: wait_slots - 1 };
                None
            }
        }
    }

    /// Handle acquisition indicators received for `access_slot`.
    ///
    /// Indicators for another slot, or arriving while no indicator is
    /// expected, are ignored. Indicator 0 is ignored as well and the UE keeps
    /// waiting for the timeout.
    pub fn on_indicator<R: Rng + ?Sized>(
        &mut self,
        access_slot: u8,
        indicators: &[i8; PREAMBLE_SIGNATURES],
        rng: &mut R,
    ) -> Option<RachAction> {
        let state = self.state.as_mut()?;
        if !matches!(state.phase, AccessPhase::WaitingForIndicator { .. }) || state.access_slot != access_slot {
            return None;
        }
        match indicators[state.signature as usize] {
            1 => {
                log::debug!("ACK for signature {} at {:.1} dBm", state.signature, state.preamble_power_dbm);
                state.acknowledged_power_dbm = Some(state.preamble_power_dbm);
                state.phase = AccessPhase::MessageScheduled {
                    wait_slots: self.timing.message_delay_slots,
                };
                Some(RachAction::Confirm(AccessConfirm::Ack))
            }
            -1 if self.timing.nack_ends_attempt => {
                log::debug!("NACK for signature {}, attempt ended", state.signature);
                self.state = None;
                Some(RachAction::Confirm(AccessConfirm::Nack))
            }
            -1 => {
                log::debug!("NACK for signature {}", state.signature);
                self.retry(rng)
            }
            _ => None,
        }
    }

    /// Consume one retry after a NACK or a timeout.
    fn retry<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<RachAction> {
        let state = self.state.as_mut()?;
        state.retries_left = state.retries_left.saturating_sub(1);
        if state.retries_left == 0 {
            log::debug!("access failed after {} preambles", state.preambles_sent);
            self.state = None;
            return Some(RachAction::Confirm(AccessConfirm::NoIndicatorResponse));
        }

        let ramped = state.preamble_power_dbm + self.timing.ramp_step_db;
        if ramped > self.timing.max_power_dbm + PREAMBLE_POWER_HEADROOM_DB {
            log::debug!("preamble power {:.1} dBm over limit, access failed", ramped);
            self.state = None;
            return Some(RachAction::Confirm(AccessConfirm::NoIndicatorResponse));
        }

        state.preamble_power_dbm = ramped;
        state.signature = pick_signature(&state.request, rng);
        state.access_slot = pick_access_slot(state.request.sub_channels, rng);
        state.phase = AccessPhase::PreambleScheduled {
            wait_slots: 2 * state.access_slot as u32,
        };
        None
    }

    /// Drop any attempt in progress. Returns whether there was one.
    pub fn release(&mut self) -> bool {
        self.state.take().is_some()
    }
}

fn pick_signature<R: Rng + ?Sized>(request: &AccessRequest, rng: &mut R) -> u8 {
    let last = (PREAMBLE_SIGNATURES - 1) as u8;
    let lo = request.signature_start.min(last);
    let hi = request.signature_end.min(last);
    let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
    rng.gen_range(lo..=hi)
}

fn pick_access_slot<R: Rng + ?Sized>(sub_channels: u16, rng: &mut R) -> u8 {
    let eligible: Vec<u8> = (0..ACCESS_SLOTS)
        .filter(|s| sub_channels == 0 || sub_channels & (1 << (s % SUB_CHANNELS)) != 0)
        .collect();
    if eligible.is_empty() {
        return rng.gen_range(0..ACCESS_SLOTS);
    }
    eligible[rng.gen_range(0..eligible.len())]
}

/// Slots to wait from `slot_index` until access slot `access_slot` starts.
pub fn initial_wait(access_slot: u8, slot_index: u64) -> u32 {
    let current = (slot_index % SLOTS_PER_FRAME) as u32;
    let target = 2 * access_slot as u32;
    if target >= current {
        target - current
    } else {
        target + (SLOTS_PER_FRAME as u32 - current)
    }
}

/// What the base station decoded for one signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureOutcome {
    Success,
    Error,
    Collision,
}

impl SignatureOutcome {
    pub fn indicator(&self) -> i8 {
        match self {
            SignatureOutcome::Success => 1,
            SignatureOutcome::Error => -1,
            SignatureOutcome::Collision => 0,
        }
    }
}

/// Base-station bookkeeping of preambles awaiting an acquisition indicator.
#[derive(Debug, Default)]
pub struct AichCollector {
    pending: BTreeMap<u8, [Option<SignatureOutcome>; PREAMBLE_SIGNATURES]>,
}

impl AichCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one decoded preamble. Returns true if it collided with another.
    pub fn record(&mut self, access_slot: u8, signature: u8, in_error: bool) -> bool {
        let Some(slot) = self.pending.entry(access_slot).or_default().get_mut(signature as usize) else {
            return false;
        };
        if slot.is_some() {
            *slot = Some(SignatureOutcome::Collision);
            return true;
        }
        *slot = Some(if in_error {
            SignatureOutcome::Error
        } else {
            SignatureOutcome::Success
        });
        false
    }

    pub fn outcome(&self, access_slot: u8, signature: u8) -> Option<SignatureOutcome> {
        self.pending.get(&access_slot)?.get(signature as usize).copied().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Indicators of the earliest access slot with recorded preambles.
    ///
    /// One AICH burst carries one access slot, so slots are handed out one
    /// per call and removed from the collector.
    pub fn next_indicators(&mut self) -> Option<(u8, [i8; PREAMBLE_SIGNATURES])> {
        let (slot, outcomes) = self.pending.pop_first()?;
        let mut indicators = [0i8; PREAMBLE_SIGNATURES];
        for (indicator, outcome) in indicators.iter_mut().zip(outcomes.iter()) {
            *indicator = outcome.map(|o| o.indicator()).unwrap_or(0);
        }
        Some((slot, indicators))
    }
}
