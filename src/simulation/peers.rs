//! Per-link records kept by each side of a radio link.
//!
//! A UE keeps one [`PeerCellInfo`] per base-station cell it has detected or
//! been given a radio link to; a base station keeps one [`AssociatedUe`] per
//! UE with a dedicated uplink towards it.

use serde::Serialize;

use super::power_control::{PowerControlState, TransmitPower};
use super::time::SimTime;

/// Slots of consecutive P-SCH reception needed for slot synchronisation.
pub const SLOT_SYNC_SLOTS: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    /// Heard on the synchronisation channel only.
    Detected,
    /// Registered through its pilot and measured.
    Monitored,
    /// Part of the active set.
    Active,
}

/// Power-control settings copied into every new link record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkDefaults {
    pub target_sir_db: f64,
    pub step_size_db: f64,
    pub min_power_dbm: f64,
    pub max_power_dbm: f64,
}

impl LinkDefaults {
    pub fn power_control(&self) -> PowerControlState {
        PowerControlState::new(self.target_sir_db)
    }
}

/// A base-station cell as seen by a UE.
#[derive(Debug, Clone)]
pub struct PeerCellInfo {
    pub primary_scrambling_code: u32,
    pub status: CellStatus,
    /// Consecutive slots with a decoded P-SCH.
    pub psch_slots: u32,
    pub last_psch: Option<SimTime>,
    pub slot_synchronised: bool,
    /// Code group announced on the S-SCH.
    pub code_group: Option<u16>,
    /// Registered after the first error-free pilot.
    pub registered: bool,
    pub rscp_dbm: f64,
    pub ec_no_db: f64,
    /// Primary serving cell of the UE.
    pub primary: bool,
    /// Commands this cell sent for the UE's uplink.
    pub uplink_pc: PowerControlState,
    /// Inner loop run by the UE on this cell's downlink.
    pub downlink_pc: PowerControlState,
    pub last_report: Option<SimTime>,
}

impl PeerCellInfo {
    pub fn new(primary_scrambling_code: u32, uplink: &LinkDefaults, downlink: &LinkDefaults) -> Self {
        PeerCellInfo {
            primary_scrambling_code,
            status: CellStatus::Detected,
            psch_slots: 0,
            last_psch: None,
            slot_synchronised: false,
            code_group: None,
            registered: false,
            rscp_dbm: f64::NEG_INFINITY,
            ec_no_db: f64::NEG_INFINITY,
            primary: false,
            uplink_pc: uplink.power_control(),
            downlink_pc: downlink.power_control(),
            last_report: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == CellStatus::Active
    }

    /// Count one decoded P-SCH slot.
    ///
    /// A gap of more than one slot since the previous P-SCH restarts the
    /// count. Returns true when this slot made the cell synchronised.
    pub fn on_psch(&mut self, now: SimTime, slot: SimTime) -> bool {
        let consecutive = match self.last_psch {
            Some(last) => now - last <= slot + slot,
            None => false,
        };
        self.psch_slots = if consecutive { self.psch_slots + 1 } else { 1 };
        self.last_psch = Some(now);
        if !self.slot_synchronised && self.psch_slots >= SLOT_SYNC_SLOTS {
            self.slot_synchronised = true;
            return true;
        }
        false
    }

    /// Whether a measurement report is due at `now`.
    pub fn report_due(&self, now: SimTime, period: SimTime) -> bool {
        match self.last_report {
            None => true,
            Some(last) => now - last >= period,
        }
    }
}

/// A UE as seen by the base station it has a dedicated link with.
#[derive(Debug, Clone)]
pub struct AssociatedUe {
    /// Uplink scrambling code identifying the UE.
    pub scrambling_code: u32,
    /// This base station is the UE's primary serving cell.
    pub self_primary: bool,
    /// Inner loop on the UE's uplink.
    pub uplink_pc: PowerControlState,
    /// Power of the dedicated downlink towards the UE.
    pub downlink_power: TransmitPower,
    pub cqi: Option<u8>,
}

impl AssociatedUe {
    pub fn new(scrambling_code: u32, self_primary: bool, uplink: &LinkDefaults, downlink: &LinkDefaults, initial_downlink_dbm: f64) -> Self {
        AssociatedUe {
            scrambling_code,
            self_primary,
            uplink_pc: uplink.power_control(),
            downlink_power: TransmitPower::new(initial_downlink_dbm, downlink.min_power_dbm, downlink.max_power_dbm),
            cqi: None,
        }
    }
}
