//! Bursts and signals.
//!
//! A `Signal` is everything one transmitter emits at one instant; it owns
//! one `Burst` per physical channel role carried. Dropping a `Signal` drops
//! its bursts, so there is no separate release step for them.
//!
//! ## Receive-side annotation
//!
//! On arrival each burst is stamped with `rx_start = now` and
//! `rx_evaluated_end = now + (tx_end - tx_start)`, its interference and error
//! fields are cleared, and its power is recovered from the total received
//! power by inverse-weighting with the summed gain factors:
//!
//! ```text
//! P_unit  = P_rx / Σ gain(b)
//! P_burst = P_unit × gain(burst)
//! ```

use serde::{Deserialize, Serialize};

use super::power_control::TpcCommand;
use super::time::SimTime;
use super::types::{ChannelRole, Coding, DeviceId, LinkDirection, Modulation, PhaseBranch, SpreadFactor};

/// Number of random-access preamble signatures.
pub const PREAMBLE_SIGNATURES: usize = 16;

/// Identifies one transmission: the transmitter plus its own sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignalId {
    pub source: DeviceId,
    pub sequence: u64,
}

/// Per-role content carried by a burst.
#[derive(Debug, Clone, PartialEq)]
pub enum BurstBody {
    /// Packed upper-layer PDUs (see `payload::pack`).
    Data(Vec<u8>),
    /// Synchronisation code. `cell_tag` identifies the emitting cell's timing.
    Sync { code: u16, cell_tag: u32 },
    /// Pilot with no content.
    Pilot,
    /// Random-access preamble.
    Preamble { signature: u8, access_slot: u8 },
    /// Acquisition indicators for one access slot: +1 ACK, -1 NACK, 0 no response.
    AcquisitionIndicators { access_slot: u8, indicators: [i8; PREAMBLE_SIGNATURES] },
    /// Dedicated control carrying an optional power-control command.
    Control { tpc: Option<TpcCommand> },
    /// Channel quality report.
    Cqi(u8),
    Empty,
}

#[derive(Debug, Clone)]
pub struct Burst {
    pub role: ChannelRole,
    pub direction: LinkDirection,
    pub spread_factor: SpreadFactor,
    pub channelization_code: u32,
    pub scrambling_code: u32,
    pub phase: PhaseBranch,
    pub gain_factor: f64,
    pub modulation: Modulation,
    pub coding: Coding,
    /// Transmit window on the sender's clock.
    pub tx_start: SimTime,
    pub tx_end: SimTime,
    pub rx_start: SimTime,
    pub rx_evaluated_end: SimTime,
    /// Instant up to which bits have already been error-evaluated.
    pub rx_time_evaluated: SimTime,
    /// Received power of this burst (mW), set on arrival.
    pub power_mw: f64,
    pub interference_mw: f64,
    /// Last measured SINR (linear).
    pub sinr: f64,
    pub in_error: bool,
    pub body: BurstBody,
}

impl Burst {
    /// Create a burst with zero codes, combined phase, the nominal gain of
    /// `spread_factor` and QPSK with rate 1/2 convolutional coding.
    pub fn new(role: ChannelRole, direction: LinkDirection, spread_factor: SpreadFactor, body: BurstBody) -> Self {
        Burst {
            role,
            direction,
            spread_factor,
            channelization_code: 0,
            scrambling_code: 0,
            phase: PhaseBranch::Combined,
            gain_factor: spread_factor.gain_factor(),
            modulation: Modulation::Qpsk,
            coding: Coding::Conv2,
            tx_start: SimTime::ZERO,
            tx_end: SimTime::ZERO,
            rx_start: SimTime::ZERO,
            rx_evaluated_end: SimTime::ZERO,
            rx_time_evaluated: SimTime::ZERO,
            power_mw: 0.0,
            interference_mw: 0.0,
            sinr: 0.0,
            in_error: false,
            body,
        }
    }

    pub fn with_codes(mut self, scrambling_code: u32, channelization_code: u32) -> Self {
        self.scrambling_code = scrambling_code;
        self.channelization_code = channelization_code;
        self
    }

    pub fn with_phase(mut self, phase: PhaseBranch) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_gain(mut self, gain_factor: f64) -> Self {
        self.gain_factor = gain_factor;
        self
    }

    pub fn with_mod_code(mut self, modulation: Modulation, coding: Coding) -> Self {
        self.modulation = modulation;
        self.coding = coding;
        self
    }

    pub fn with_window(mut self, tx_start: SimTime, tx_end: SimTime) -> Self {
        self.tx_start = tx_start;
        self.tx_end = tx_end;
        self
    }

    /// Whether the receive windows of two bursts intersect.
    pub fn overlaps(&self, other: &Burst) -> bool {
        !(other.rx_start >= self.rx_evaluated_end || other.rx_evaluated_end <= self.rx_start)
    }

    /// Power control command carried on a dedicated control burst, if any.
    pub fn tpc(&self) -> Option<TpcCommand> {
        match self.body {
            BurstBody::Control { tpc } => tpc,
            _ => None,
        }
    }
}

/// Propagation details of one received signal.
#[derive(Debug, Clone, Copy)]
pub struct Propagation {
    pub tx_power_dbm: f64,
    pub path_loss_db: f64,
    pub delay: SimTime,
}

/// A signal as it leaves the transmitter.
#[derive(Debug, Clone)]
pub struct TransmittedSignal {
    pub id: SignalId,
    pub tx_power_dbm: f64,
    pub start: SimTime,
    pub end: SimTime,
    pub bursts: Vec<Burst>,
}

impl TransmittedSignal {
    pub fn duration(&self) -> SimTime {
        self.end - self.start
    }
}

/// A signal being received by one device.
#[derive(Debug, Clone)]
pub struct Signal {
    pub id: SignalId,
    pub bursts: Vec<Burst>,
    pub arrival: SimTime,
    pub departure: SimTime,
    /// Total received power (mW).
    pub rx_power_mw: f64,
    /// Received power per unit gain factor (mW).
    pub unit_power_mw: f64,
    pub propagation: Propagation,
}

impl Signal {
    /// Build the receive-side view of `tx` arriving at `now` with total power `rx_power_mw`.
    pub fn on_arrival(tx: &TransmittedSignal, rx_power_mw: f64, now: SimTime, propagation: Propagation) -> Signal {
        let gain_sum: f64 = tx.bursts.iter().map(|b| b.gain_factor).sum();
        let unit_power_mw = if gain_sum > 0.0 { rx_power_mw / gain_sum } else { 0.0 };

        let bursts = tx
            .bursts
            .iter()
            .cloned()
            .map(|mut b| {
                b.rx_start = now;
                b.rx_evaluated_end = now + (b.tx_end - b.tx_start);
                b.rx_time_evaluated = now;
                b.power_mw = unit_power_mw * b.gain_factor;
                b.interference_mw = 0.0;
                b.sinr = 0.0;
                b.in_error = false;
                b
            })
            .collect();

        Signal {
            id: tx.id,
            bursts,
            arrival: now,
            departure: now + tx.duration(),
            rx_power_mw,
            unit_power_mw,
            propagation,
        }
    }
}
