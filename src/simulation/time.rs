//! Simulated time.
//!
//! All simulated instants and durations are integer nanoseconds. The chip
//! duration is truncated to a whole nanosecond (260 ns at 3.84 Mcps), and
//! every slot/frame constant is derived from it so that slot boundaries are
//! exact integers and never drift.

use serde::{Deserialize, Serialize};

/// Simulation time in nanoseconds since simulation start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);

    pub const fn from_nanos(ns: u64) -> Self {
        SimTime(ns)
    }

    pub const fn from_micros(us: u64) -> Self {
        SimTime(us * 1_000)
    }

    pub const fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1_000_000)
    }

    pub fn from_secs_f64(s: f64) -> Self {
        SimTime((s * 1_000_000_000.0) as u64)
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    pub const fn as_micros(&self) -> u64 {
        self.0 / 1_000
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Multiply a duration by an integer count (e.g. `SLOT_DURATION.times(3)`).
    pub const fn times(&self, n: u64) -> SimTime {
        SimTime(self.0 * n)
    }

    pub fn checked_add(&self, other: SimTime) -> Option<SimTime> {
        self.0.checked_add(other.0).map(SimTime)
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for SimTime {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

/// Chip rate in chips per second.
pub const CHIP_RATE: u64 = 3_840_000;

/// Duration of one chip, truncated to whole nanoseconds.
pub const CHIP_DURATION: SimTime = SimTime::from_nanos(1_000_000_000 / CHIP_RATE);

/// Chips per slot.
pub const CHIPS_PER_SLOT: u64 = 2560;

/// Slots per radio frame.
pub const SLOTS_PER_FRAME: u64 = 15;

pub const SLOT_DURATION: SimTime = CHIP_DURATION.times(CHIPS_PER_SLOT);

pub const FRAME_DURATION: SimTime = SLOT_DURATION.times(SLOTS_PER_FRAME);

/// Length of the synchronisation channel bursts (256 chips).
pub const SYNC_BURST_DURATION: SimTime = CHIP_DURATION.times(256);

/// Length of a random-access preamble (4096 chips).
pub const PREAMBLE_DURATION: SimTime = CHIP_DURATION.times(4096);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_and_frame_are_integer_multiples_of_chip() {
        assert_eq!(CHIP_DURATION.as_nanos(), 260);
        assert_eq!(SLOT_DURATION.as_nanos(), 665_600);
        assert_eq!(FRAME_DURATION.as_nanos(), 665_600 * 15);
    }

    #[test]
    fn arithmetic_saturates_on_subtraction() {
        let a = SimTime::from_micros(10);
        let b = SimTime::from_micros(25);
        assert_eq!((a - b), SimTime::ZERO);
        assert_eq!((a + b).as_micros(), 35);
        assert!((SimTime::from_secs_f64(1.5).as_secs_f64() - 1.5).abs() < 1e-9);
    }
}
