//! PHY statistics and the run report.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::command::UpperLayerLog;
use super::time::SimTime;
use super::types::{DeviceId, DeviceKind};

/// Counters kept by every device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhyStats {
    pub signals_transmitted: u64,
    /// Signals that arrived while locked to their transmitter.
    pub signals_locked: u64,
    pub signals_interference_only: u64,
    /// Received signals with at least one burst delivered.
    pub signals_delivered: u64,
    /// Received signals with at least one errored burst addressed to us.
    pub signals_with_errors: u64,
    pub bursts_delivered: u64,
    pub bursts_in_error: u64,
    pub bursts_not_for_me: u64,
    pub pdus_delivered: u64,
    pub preambles_sent: u64,
    pub aich_ack: u64,
    pub aich_nack: u64,
    pub preamble_collisions: u64,
    pub access_failures: u64,
    pub power_up_commands_issued: u64,
    pub power_down_commands_issued: u64,
    pub power_commands_applied: u64,
    pub measurement_reports: u64,
}

/// Resources dropped by the finalize pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReleasedResources {
    pub signals: usize,
    pub random_access_states: usize,
    pub queued_pdus: usize,
}

impl ReleasedResources {
    pub fn total(&self) -> usize {
        self.signals + self.random_access_states + self.queued_pdus
    }
}

/// Warning and error log lines attributed to one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogTally {
    pub warnings: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub id: DeviceId,
    pub kind: DeviceKind,
    pub final_tx_power_dbm: f64,
    pub stats: PhyStats,
    pub released: ReleasedResources,
    pub upper_layer: UpperLayerLog,
    pub log: LogTally,
}

/// Serialisable summary of one simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub seed: u64,
    pub simulated_until: SimTime,
    pub events_processed: u64,
    pub devices: Vec<DeviceReport>,
}

impl RunReport {
    pub fn new(started_at: DateTime<Utc>, seed: u64, simulated_until: SimTime, events_processed: u64) -> Self {
        RunReport {
            started_at,
            seed,
            simulated_until,
            events_processed,
            devices: Vec::new(),
        }
    }

    pub fn device(&self, id: DeviceId) -> Option<&DeviceReport> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Attach per-device log tallies gathered by the tee logger.
    pub fn apply_log_tallies(&mut self, tallies: &BTreeMap<u32, LogTally>) {
        for device in &mut self.devices {
            if let Some(tally) = tallies.get(&device.id.0) {
                device.log = *tally;
            }
        }
    }

    /// Sum of a counter over all devices.
    pub fn total<F: Fn(&PhyStats) -> u64>(&self, counter: F) -> u64 {
        self.devices.iter().map(|d| counter(&d.stats)).sum()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> RunReport {
        let mut r = RunReport::new(Utc::now(), 7, SimTime::from_millis(100), 42);
        for id in [1, 2] {
            r.devices.push(DeviceReport {
                id: DeviceId(id),
                kind: DeviceKind::UserEquipment,
                final_tx_power_dbm: 0.0,
                stats: PhyStats {
                    preambles_sent: id as u64,
                    ..PhyStats::default()
                },
                released: ReleasedResources::default(),
                upper_layer: UpperLayerLog::default(),
                log: LogTally::default(),
            });
        }
        r
    }

    #[test]
    fn totals_and_tallies() {
        let mut r = report();
        assert_eq!(r.total(|s| s.preambles_sent), 3);
        let tallies = BTreeMap::from([(2, LogTally { warnings: 3, errors: 1 })]);
        r.apply_log_tallies(&tallies);
        assert_eq!(r.device(DeviceId(2)).map(|d| d.log.warnings), Some(3));
        assert_eq!(r.device(DeviceId(1)).map(|d| d.log.warnings), Some(0));
    }

    #[test]
    fn report_serialises_to_json() {
        let json = report().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["seed"], 7);
        assert_eq!(value["devices"][1]["stats"]["preambles_sent"], 2);
        assert_eq!(value["devices"][0]["kind"], "user_equipment");
    }
}
