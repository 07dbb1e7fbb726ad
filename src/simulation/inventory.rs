//! Channel inventory.
//!
//! Every device keeps a catalogue of the physical channels it has been
//! configured with. The inventory is used in both directions:
//! - **Transmit**: burst construction stamps each outgoing burst with the
//!   current code, phase, gain and modulation of its entry.
//! - **Receive**: [`ChannelInventory::is_burst_for_me`] decides whether an
//!   incoming burst is addressed to this device.
//!
//! Upper layers reach physical channels through transport channel ids; the
//! mapping is kept here as well, and a mapping that points at a missing entry
//! is a fatal configuration error.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::burst::{Burst, BurstBody};
use super::error::SimError;
use super::peers::{AssociatedUe, PeerCellInfo};
use super::signal_calculations::slot_format;
use super::time::SimTime;
use super::types::{ChannelRole, Coding, DeviceId, LinkDirection, Modulation, PhaseBranch, SpreadFactor};

/// Scrambling codes per primary code group; a cell's secondary codes follow its primary code.
pub const SCRAMBLING_CODES_PER_CELL: u32 = 16;

/// Synchronisation channels are not scrambled.
pub const SYNC_SCRAMBLING_CODE: u32 = u32::MAX;

pub const PSCH_CHANNEL_CODE: u32 = 0;
pub const SSCH_CHANNEL_CODE: u32 = 1;
pub const CPICH_CHANNEL_CODE: u32 = 0;
pub const PCCPCH_CHANNEL_CODE: u32 = 1;
pub const AICH_CHANNEL_CODE: u32 = 2;

/// Inventory ids used for the cell channels a base station creates on its own.
pub const CELL_CHANNEL_ID_BASE: u32 = 0xF000;

/// Uplink control channel code and spreading factor.
pub const UPLINK_CONTROL_CHANNEL_CODE: u32 = 0;
pub const CONTROL_SPREAD_FACTOR: SpreadFactor = SpreadFactor::SF256;

/// Primary scrambling code of the cell a scrambling code belongs to.
pub fn primary_code_of(scrambling_code: u32) -> u32 {
    (scrambling_code / SCRAMBLING_CODES_PER_CELL) * SCRAMBLING_CODES_PER_CELL
}

/// Role-specific parameters of a channel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelDescriptor {
    /// No extra parameters.
    #[default]
    Common,
    /// Random-access channel limits of the cell.
    Prach {
        #[serde(default)]
        sub_channels: u16,
        #[serde(default)]
        signature_start: u8,
        #[serde(default = "last_signature")]
        signature_end: u8,
    },
    /// Dedicated link with a peer identified by its scrambling code.
    Dedicated {
        peer_scrambling_code: u32,
        #[serde(default)]
        primary: bool,
    },
}

fn last_signature() -> u8 {
    15
}

/// Requested configuration of one physical channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub role: ChannelRole,
    pub direction: LinkDirection,
    pub spread_factor: SpreadFactor,
    pub scrambling_code: u32,
    /// Derived from the role when absent (uplink DPDCH uses `sf/4`).
    #[serde(default)]
    pub channelization_code: Option<u32>,
    /// Code of the companion DPCCH of a dedicated data channel.
    #[serde(default)]
    pub control_code: Option<u32>,
    #[serde(default)]
    pub phase: Option<PhaseBranch>,
    /// Defaults to `1/sf`.
    #[serde(default)]
    pub gain_factor: Option<f64>,
    #[serde(default)]
    pub modulation: Modulation,
    #[serde(default)]
    pub coding: Coding,
    #[serde(default)]
    pub descriptor: ChannelDescriptor,
}

impl ChannelConfig {
    pub fn new(role: ChannelRole, direction: LinkDirection, spread_factor: SpreadFactor, scrambling_code: u32) -> Self {
        ChannelConfig {
            role,
            direction,
            spread_factor,
            scrambling_code,
            channelization_code: None,
            control_code: None,
            phase: None,
            gain_factor: None,
            modulation: Modulation::default(),
            coding: Coding::default(),
            descriptor: ChannelDescriptor::Common,
        }
    }

    pub fn with_channelization_code(mut self, code: u32) -> Self {
        self.channelization_code = Some(code);
        self
    }

    pub fn with_descriptor(mut self, descriptor: ChannelDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn with_mod_code(mut self, modulation: Modulation, coding: Coding) -> Self {
        self.modulation = modulation;
        self.coding = coding;
        self
    }
}

/// A configured physical channel.
#[derive(Debug, Clone)]
pub struct ChannelEntry {
    pub id: u32,
    pub role: ChannelRole,
    pub direction: LinkDirection,
    pub spread_factor: SpreadFactor,
    pub channelization_code: u32,
    pub scrambling_code: u32,
    pub control_code: u32,
    pub phase: PhaseBranch,
    pub gain_factor: f64,
    pub modulation: Modulation,
    pub coding: Coding,
    pub slot_format: u8,
    pub descriptor: ChannelDescriptor,
    /// PDUs waiting for the next burst on this channel.
    pub tx_queue: Vec<Vec<u8>>,
}

impl ChannelEntry {
    fn from_config(id: u32, config: ChannelConfig) -> Result<Self, SimError> {
        let slot_format = slot_format(config.role, config.direction, config.spread_factor)?;
        let uplink_data = config.role == ChannelRole::Dpdch && config.direction == LinkDirection::Uplink;

        let channelization_code = match config.channelization_code {
            Some(code) => code,
            None if uplink_data => config.spread_factor.value() / 4,
            None => 0,
        };
        let control_code = config.control_code.unwrap_or(match config.direction {
            LinkDirection::Uplink => UPLINK_CONTROL_CHANNEL_CODE,
            LinkDirection::Downlink => channelization_code + 1,
        });
        let phase = config
            .phase
            .unwrap_or(if uplink_data { PhaseBranch::InPhase } else { PhaseBranch::Combined });

        Ok(ChannelEntry {
            id,
            role: config.role,
            direction: config.direction,
            spread_factor: config.spread_factor,
            channelization_code,
            scrambling_code: config.scrambling_code,
            control_code,
            phase,
            gain_factor: config.gain_factor.unwrap_or_else(|| config.spread_factor.gain_factor()),
            modulation: config.modulation,
            coding: config.coding,
            slot_format,
            descriptor: config.descriptor,
            tx_queue: Vec::new(),
        })
    }

    /// Build a burst on this channel for the transmit window `[start, end)`.
    pub fn burst(&self, body: BurstBody, start: SimTime, end: SimTime) -> Burst {
        Burst::new(self.role, self.direction, self.spread_factor, body)
            .with_codes(self.scrambling_code, self.channelization_code)
            .with_phase(self.phase)
            .with_gain(self.gain_factor)
            .with_mod_code(self.modulation, self.coding)
            .with_window(start, end)
    }

    /// Companion DPCCH burst of a dedicated data channel.
    pub fn control_burst(&self, body: BurstBody, start: SimTime, end: SimTime) -> Burst {
        let phase = match self.direction {
            LinkDirection::Uplink => PhaseBranch::Quadrature,
            LinkDirection::Downlink => PhaseBranch::Combined,
        };
        Burst::new(ChannelRole::Dpcch, self.direction, CONTROL_SPREAD_FACTOR, body)
            .with_codes(self.scrambling_code, self.control_code)
            .with_phase(phase)
            .with_window(start, end)
    }

    pub fn peer_scrambling_code(&self) -> Option<u32> {
        match self.descriptor {
            ChannelDescriptor::Dedicated { peer_scrambling_code, .. } => Some(peer_scrambling_code),
            _ => None,
        }
    }
}

/// Who is asking whether a burst is addressed to it.
pub enum ReceiverIdentity<'a> {
    Ue {
        cells: &'a BTreeMap<u32, PeerCellInfo>,
    },
    NodeB {
        primary_scrambling_code: u32,
        ues: &'a BTreeMap<u32, AssociatedUe>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TransportMapping {
    role: ChannelRole,
    channel_id: u32,
}

/// Physical channels configured on one device.
#[derive(Debug)]
pub struct ChannelInventory {
    owner: DeviceId,
    entries: BTreeMap<u32, ChannelEntry>,
    transport: BTreeMap<u32, TransportMapping>,
}

impl ChannelInventory {
    pub fn new(owner: DeviceId) -> Self {
        ChannelInventory {
            owner,
            entries: BTreeMap::new(),
            transport: BTreeMap::new(),
        }
    }

    /// Add or replace channel `id`.
    ///
    /// Replacing keeps the queued payload; bursts already on air keep the
    /// parameters they were stamped with. Returns true if an entry was replaced.
    pub fn configure(&mut self, id: u32, config: ChannelConfig) -> Result<bool, SimError> {
        let mut entry = ChannelEntry::from_config(id, config)?;
        match self.entries.get_mut(&id) {
            Some(existing) => {
                entry.tx_queue = std::mem::take(&mut existing.tx_queue);
                *existing = entry;
                Ok(true)
            }
            None => {
                self.entries.insert(id, entry);
                Ok(false)
            }
        }
    }

    /// Remove channel `id` of `role`, dropping its queued payload.
    ///
    /// Returns the number of PDUs freed, or `None` if no such entry exists.
    pub fn release(&mut self, role: ChannelRole, id: u32) -> Option<usize> {
        if self.entries.get(&id)?.role != role {
            return None;
        }
        self.entries.remove(&id).map(|e| e.tx_queue.len())
    }

    /// Configure the common channels a cell with primary code `primary_code` transmits.
    pub fn configure_cell_channels(&mut self, primary_code: u32) -> Result<(), SimError> {
        let sync = |role, code| {
            ChannelConfig::new(role, LinkDirection::Downlink, SpreadFactor::SF256, SYNC_SCRAMBLING_CODE).with_channelization_code(code)
        };
        let cell = |role, code| {
            ChannelConfig::new(role, LinkDirection::Downlink, SpreadFactor::SF256, primary_code).with_channelization_code(code)
        };
        self.configure(CELL_CHANNEL_ID_BASE, sync(ChannelRole::Psch, PSCH_CHANNEL_CODE))?;
        self.configure(CELL_CHANNEL_ID_BASE + 1, sync(ChannelRole::Ssch, SSCH_CHANNEL_CODE))?;
        self.configure(CELL_CHANNEL_ID_BASE + 2, cell(ChannelRole::Cpich, CPICH_CHANNEL_CODE))?;
        self.configure(CELL_CHANNEL_ID_BASE + 3, cell(ChannelRole::Pccpch, PCCPCH_CHANNEL_CODE))?;
        self.configure(CELL_CHANNEL_ID_BASE + 4, cell(ChannelRole::Aich, AICH_CHANNEL_CODE))?;
        Ok(())
    }

    pub fn entry(&self, id: u32) -> Option<&ChannelEntry> {
        self.entries.get(&id)
    }

    /// First entry with the given role and direction.
    pub fn find(&self, role: ChannelRole, direction: LinkDirection) -> Option<&ChannelEntry> {
        self.entries.values().find(|e| e.role == role && e.direction == direction)
    }

    pub fn find_mut(&mut self, role: ChannelRole, direction: LinkDirection) -> Option<&mut ChannelEntry> {
        self.entries.values_mut().find(|e| e.role == role && e.direction == direction)
    }

    /// Like [`find`](Self::find), but a missing entry is an error.
    pub fn require(&self, role: ChannelRole, direction: LinkDirection) -> Result<&ChannelEntry, SimError> {
        self.find(role, direction).ok_or(SimError::ChannelNotConfigured {
            device: self.owner,
            role,
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = &ChannelEntry> {
        self.entries.values()
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut ChannelEntry> {
        self.entries.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the gain factors of the entries transmitted in `direction` with one of `roles`.
    pub fn gain_sum(&self, direction: LinkDirection, roles: &[ChannelRole]) -> f64 {
        self.entries
            .values()
            .filter(|e| e.direction == direction && roles.contains(&e.role))
            .map(|e| e.gain_factor)
            .sum()
    }

    pub fn map_transport(&mut self, transport_id: u32, role: ChannelRole, channel_id: u32) {
        self.transport.insert(transport_id, TransportMapping { role, channel_id });
    }

    pub fn unmap_transport(&mut self, transport_id: u32) -> bool {
        self.transport.remove(&transport_id).is_some()
    }

    /// Physical channel a transport channel is carried on.
    pub fn resolve_transport(&self, transport_id: u32) -> Result<&ChannelEntry, SimError> {
        let mapping = self.transport.get(&transport_id).ok_or(SimError::UnknownTransportChannel {
            device: self.owner,
            transport_id,
        })?;
        self.entries
            .get(&mapping.channel_id)
            .filter(|e| e.role == mapping.role)
            .ok_or(SimError::MissingChannel {
                device: self.owner,
                transport_id,
                role: mapping.role,
                channel_id: mapping.channel_id,
            })
    }

    /// Queue PDUs for transmission on the channel behind `transport_id`.
    pub fn enqueue(&mut self, transport_id: u32, pdus: Vec<Vec<u8>>) -> Result<u32, SimError> {
        let id = self.resolve_transport(transport_id)?.id;
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.tx_queue.extend(pdus);
        }
        Ok(id)
    }

    pub fn queued_pdus(&self) -> usize {
        self.entries.values().map(|e| e.tx_queue.len()).sum()
    }

    /// Drop every queued PDU. Returns how many were dropped.
    pub fn clear_queues(&mut self) -> usize {
        self.entries
            .values_mut()
            .map(|e| {
                let n = e.tx_queue.len();
                e.tx_queue.clear();
                n
            })
            .sum()
    }

    /// Whether an incoming burst is addressed to this device.
    ///
    /// - UE: downlink only. Common roles always; dedicated roles need a
    ///   known cell for the burst's scrambling code and a matching downlink
    ///   entry (the DPCCH matches its data channel's control code).
    /// - Base station: uplink only. PRACH when the code belongs to the cell;
    ///   dedicated roles when the code belongs to an associated UE.
    pub fn is_burst_for_me(&self, receiver: &ReceiverIdentity<'_>, burst: &Burst) -> bool {
        match receiver {
            ReceiverIdentity::Ue { cells } => {
                if burst.direction != LinkDirection::Downlink {
                    return false;
                }
                if burst.role.is_common_downlink() {
                    return true;
                }
                if !cells.contains_key(&primary_code_of(burst.scrambling_code)) {
                    return false;
                }
                self.entries.values().any(|e| {
                    e.direction == LinkDirection::Downlink
                        && e.scrambling_code == burst.scrambling_code
                        && ((e.role == burst.role
                            && e.channelization_code == burst.channelization_code
                            && e.spread_factor == burst.spread_factor)
                            || (burst.role == ChannelRole::Dpcch
                                && e.role == ChannelRole::Dpdch
                                && e.control_code == burst.channelization_code))
                })
            }
            ReceiverIdentity::NodeB {
                primary_scrambling_code,
                ues,
            } => {
                if burst.direction != LinkDirection::Uplink {
                    return false;
                }
                match burst.role {
                    ChannelRole::Prach => {
                        (*primary_scrambling_code..primary_scrambling_code + SCRAMBLING_CODES_PER_CELL).contains(&burst.scrambling_code)
                    }
                    ChannelRole::Dpdch | ChannelRole::Dpcch | ChannelRole::Hsdpcch => ues.contains_key(&burst.scrambling_code),
                    _ => false,
                }
            }
        }
    }
}
