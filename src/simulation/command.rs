//! Interlayer commands and the upper-layer side of a device.
//!
//! Commands travel down from the upper layers (channel setup, data, access
//! requests) and up from the PHY (access confirms, measurements). Data
//! received error-free is delivered up as an ordered list of PDUs.

use serde::{Deserialize, Serialize};

use super::inventory::ChannelConfig;
use super::random_access::{AccessConfirm, AccessRequest};
use super::time::SimTime;
use super::types::ChannelRole;

/// One measured quantity of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "quantity", content = "value", rename_all = "snake_case")]
pub enum Measurement {
    /// Received signal code power of the pilot (dBm).
    Rscp(f64),
    /// Pilot energy per chip over total received power (dB).
    EcNo(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterlayerCommand {
    ConfigureTransportChannel {
        transport_id: u32,
        role: ChannelRole,
        channel_id: u32,
    },
    ReleaseTransportChannel {
        transport_id: u32,
    },
    RadioLinkSetup {
        channel_id: u32,
        config: ChannelConfig,
    },
    RadioLinkModify {
        channel_id: u32,
        config: ChannelConfig,
    },
    RadioLinkRelease {
        channel_id: u32,
        role: ChannelRole,
    },
    PhysicalAccessRequest {
        request: AccessRequest,
    },
    PhysicalAccessConfirm {
        confirm: AccessConfirm,
    },
    MeasurementRequest,
    MeasurementIndication {
        primary_scrambling_code: u32,
        measurement: Measurement,
    },
    SendData {
        transport_id: u32,
        pdus: Vec<Vec<u8>>,
    },
}

impl InterlayerCommand {
    /// Commands the PHY sends upwards; the rest flow down.
    pub fn is_indication(&self) -> bool {
        matches!(
            self,
            InterlayerCommand::PhysicalAccessConfirm { .. } | InterlayerCommand::MeasurementIndication { .. }
        )
    }
}

/// PDUs delivered from one error-free burst.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivery {
    pub at: SimTime,
    pub role: ChannelRole,
    pub pdus: Vec<Vec<u8>>,
}

/// An upward command with its time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Indication {
    pub at: SimTime,
    pub command: InterlayerCommand,
}

/// Everything the PHY handed to a device's upper layers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpperLayerLog {
    pub deliveries: Vec<Delivery>,
    pub indications: Vec<Indication>,
}

impl UpperLayerLog {
    pub fn deliver(&mut self, at: SimTime, role: ChannelRole, pdus: Vec<Vec<u8>>) {
        self.deliveries.push(Delivery { at, role, pdus });
    }

    pub fn indicate(&mut self, at: SimTime, command: InterlayerCommand) {
        self.indications.push(Indication { at, command });
    }

    pub fn delivered_pdus(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.deliveries.iter().flat_map(|d| d.pdus.iter())
    }

    pub fn access_confirms(&self) -> impl Iterator<Item = AccessConfirm> + '_ {
        self.indications.iter().filter_map(|i| match i.command {
            InterlayerCommand::PhysicalAccessConfirm { confirm } => Some(confirm),
            _ => None,
        })
    }

    pub fn measurements(&self) -> impl Iterator<Item = (u32, Measurement)> + '_ {
        self.indications.iter().filter_map(|i| match i.command {
            InterlayerCommand::MeasurementIndication {
                primary_scrambling_code,
                measurement,
            } => Some((primary_scrambling_code, measurement)),
            _ => None,
        })
    }
}
