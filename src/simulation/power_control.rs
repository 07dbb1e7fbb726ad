//! Closed-loop power control.
//!
//! Three pieces cooperate each slot:
//! - **Inner loop** (receiver side): compares a burst's measured SIR with the
//!   link's target and queues an INCREASE/DECREASE command for the peer.
//! - **Uplink aggregation** (UE side): a UE holds one state per active-set
//!   cell and combines their pending commands into one power delta.
//! - **Downlink**: the base station applies a UE's command to that UE's
//!   downlink power as soon as the control burst carrying it arrives.
//!
//! Every applied change goes through `TransmitPower`, which clamps to the
//! configured `[min, max]` range. Changes land between transmissions; a burst
//! already on air keeps the power it was sent with.

use serde::{Deserialize, Serialize};

use super::types::SpreadFactor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerDirection {
    Increase,
    Decrease,
}

/// Transmit power control command sent to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpcCommand {
    pub direction: PowerDirection,
    /// Number of step-size units to move.
    pub steps: u8,
}

impl TpcCommand {
    pub fn increase(steps: u8) -> Self {
        TpcCommand {
            direction: PowerDirection::Increase,
            steps,
        }
    }

    pub fn decrease(steps: u8) -> Self {
        TpcCommand {
            direction: PowerDirection::Decrease,
            steps,
        }
    }

    pub fn signed_steps(&self) -> i32 {
        match self.direction {
            PowerDirection::Increase => self.steps as i32,
            PowerDirection::Decrease => -(self.steps as i32),
        }
    }
}

/// Current transmit power, saturated to `[min_dbm, max_dbm]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransmitPower {
    current_dbm: f64,
    min_dbm: f64,
    max_dbm: f64,
}

impl TransmitPower {
    pub fn new(initial_dbm: f64, min_dbm: f64, max_dbm: f64) -> Self {
        TransmitPower {
            current_dbm: initial_dbm.clamp(min_dbm, max_dbm),
            min_dbm,
            max_dbm,
        }
    }

    pub fn current_dbm(&self) -> f64 {
        self.current_dbm
    }

    /// Add `delta_db` and clamp. Returns the new power.
    pub fn apply_delta(&mut self, delta_db: f64) -> f64 {
        self.current_dbm = (self.current_dbm + delta_db).clamp(self.min_dbm, self.max_dbm);
        self.current_dbm
    }
}

/// Power-control bookkeeping for one link.
///
/// Step size and power limits live with the transmitter ([`TransmitPower`]
/// and the link defaults); this record only tracks the command exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerControlState {
    pub target_sir_db: f64,
    /// Command waiting to be sent (receiver side) or applied (transmitter side).
    pub pending: Option<TpcCommand>,
    /// Step count chosen by the last inner-loop evaluation.
    pub steps: u8,
    /// Set when this link just became the primary serving cell.
    pub after_cell_switch: bool,
}

impl PowerControlState {
    pub fn new(target_sir_db: f64) -> Self {
        PowerControlState {
            target_sir_db,
            pending: None,
            steps: 1,
            after_cell_switch: false,
        }
    }

    /// Inner-loop evaluation of one received burst.
    ///
    /// # Formula
    ///
    /// ```text
    /// INCREASE if target > SIR  and  P_rx <  threshold - 10·log10(sf)
    /// DECREASE if target < SIR  and  P_rx >= threshold - 10·log10(sf)
    /// ```
    ///
    /// Does nothing while a previous command is still pending. The step count
    /// is 1, except right after a primary-cell switch where it is
    /// `|SIR - target|` truncated to whole dB, which may be 0.
    ///
    /// # Returns
    ///
    /// The newly queued command, if any.
    pub fn inner_loop(
        &mut self,
        measured_sir_db: f64,
        rx_power_dbm: f64,
        spread_factor: SpreadFactor,
        reference_threshold_db: f64,
    ) -> Option<TpcCommand> {
        if self.pending.is_some() {
            return None;
        }

        self.steps = if self.after_cell_switch {
            self.after_cell_switch = false;
            (measured_sir_db - self.target_sir_db).abs() as u8
        } else {
            1
        };

        let threshold = reference_threshold_db - spread_factor.db();
        let command = if self.target_sir_db > measured_sir_db && rx_power_dbm < threshold {
            Some(TpcCommand::increase(self.steps))
        } else if self.target_sir_db < measured_sir_db && rx_power_dbm >= threshold {
            Some(TpcCommand::decrease(self.steps))
        } else {
            None
        };

        self.pending = command;
        command
    }

    /// Record a command received from the peer. Ignored while another one is still unapplied.
    pub fn receive_command(&mut self, command: TpcCommand) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(command);
        true
    }

    pub fn take_pending(&mut self) -> Option<TpcCommand> {
        self.pending.take()
    }
}

/// Combine the pending commands of every active-set link into one delta (dB).
///
/// If every pending command is an INCREASE the result is `+step × maxSteps`,
/// otherwise `-step × maxSteps`. Pending commands are consumed. Returns
/// `None` when no link had a command.
pub fn aggregate_active_set<'a, I>(links: I, step_size_db: f64) -> Option<f64>
where
    I: IntoIterator<Item = &'a mut PowerControlState>,
{
    let mut commands = 0u32;
    let mut increases = 0u32;
    let mut max_steps = 0u8;

    for link in links {
        if let Some(command) = link.take_pending() {
            commands += 1;
            if command.direction == PowerDirection::Increase {
                increases += 1;
            }
            max_steps = max_steps.max(command.steps);
        }
    }

    if commands == 0 {
        return None;
    }
    let sign = if increases == commands { 1.0 } else { -1.0 };
    Some(sign * step_size_db * max_steps as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> PowerControlState {
        PowerControlState::new(7.0)
    }

    #[test]
    fn repeated_increase_saturates_at_max() {
        let mut power = TransmitPower::new(0.0, -30.0, 30.0);
        let step = 1.0;
        // 40 steps of 1 dB from 0 dBm overshoot 30 dBm
        for _ in 0..40 {
            power.apply_delta(TpcCommand::increase(1).signed_steps() as f64 * step);
        }
        assert_eq!(power.current_dbm(), 30.0);

        for _ in 0..100 {
            power.apply_delta(-3.0);
        }
        assert_eq!(power.current_dbm(), -30.0);
    }

    #[test]
    fn inner_loop_requests_increase_when_weak() {
        let mut pc = state();
        let cmd = pc.inner_loop(3.0, -120.0, SpreadFactor::SF256, -90.0);
        assert_eq!(cmd, Some(TpcCommand::increase(1)));
        // pending blocks a new evaluation
        assert_eq!(pc.inner_loop(20.0, -10.0, SpreadFactor::SF256, -90.0), None);
        assert_eq!(pc.take_pending(), Some(TpcCommand::increase(1)));
    }

    #[test]
    fn inner_loop_requests_decrease_when_strong() {
        let mut pc = state();
        // threshold - sf_db = -90 - 24.08 = -114.08
        let cmd = pc.inner_loop(12.0, -100.0, SpreadFactor::SF256, -90.0);
        assert_eq!(cmd, Some(TpcCommand::decrease(1)));
    }

    #[test]
    fn inner_loop_no_command_when_conditions_disagree() {
        let mut pc = state();
        // weak SIR but already strong received power
        assert_eq!(pc.inner_loop(3.0, -100.0, SpreadFactor::SF256, -90.0), None);
        // strong SIR but weak received power
        assert_eq!(pc.inner_loop(12.0, -120.0, SpreadFactor::SF256, -90.0), None);
        assert!(pc.pending.is_none());
    }

    #[test]
    fn cell_switch_uses_sir_distance_once() {
        let mut pc = state();
        pc.after_cell_switch = true;
        let cmd = pc.inner_loop(2.5, -120.0, SpreadFactor::SF256, -90.0);
        assert_eq!(cmd, Some(TpcCommand::increase(4)));
        assert!(!pc.after_cell_switch);
        pc.take_pending();
        assert_eq!(pc.inner_loop(2.5, -120.0, SpreadFactor::SF256, -90.0), Some(TpcCommand::increase(1)));
    }

    #[test]
    fn cell_switch_near_target_gives_zero_steps() {
        let mut pc = state();
        pc.after_cell_switch = true;
        // 0.6 dB below target truncates to a zero-step increase
        assert_eq!(pc.inner_loop(6.4, -120.0, SpreadFactor::SF256, -90.0), Some(TpcCommand::increase(0)));
        assert_eq!(aggregate_active_set([&mut pc], 1.0), Some(0.0));
    }

    #[test]
    fn aggregation_needs_unanimous_increase() {
        let mut a = state();
        let mut b = state();
        a.receive_command(TpcCommand::increase(1));
        b.receive_command(TpcCommand::increase(2));
        assert_eq!(aggregate_active_set([&mut a, &mut b], 1.0), Some(2.0));

        a.receive_command(TpcCommand::increase(1));
        b.receive_command(TpcCommand::decrease(1));
        assert_eq!(aggregate_active_set([&mut a, &mut b], 1.0), Some(-1.0));

        assert_eq!(aggregate_active_set([&mut a, &mut b], 1.0), None);
    }

    #[test]
    fn second_command_ignored_until_applied() {
        let mut pc = state();
        assert!(pc.receive_command(TpcCommand::decrease(1)));
        assert!(!pc.receive_command(TpcCommand::increase(1)));
        assert_eq!(pc.take_pending(), Some(TpcCommand::decrease(1)));
    }
}
