//! Fatal simulation errors.
//!
//! Anything returned as `Err(SimError)` aborts the run. Recoverable
//! conditions (errored bursts, exhausted random access) are reported through
//! statistics and confirms instead.

use thiserror::Error;

use super::burst::SignalId;
use super::types::{ChannelRole, DeviceId};

#[derive(Debug, Error)]
pub enum SimError {
    /// A transport channel is mapped to a physical channel that is not in the inventory.
    #[error("device {device}: no {role:?} channel {channel_id} for transport channel {transport_id}")]
    MissingChannel {
        device: DeviceId,
        transport_id: u32,
        role: ChannelRole,
        channel_id: u32,
    },

    /// A transport channel id that was never configured.
    #[error("device {device}: transport channel {transport_id} is not configured")]
    UnknownTransportChannel { device: DeviceId, transport_id: u32 },

    /// An operation needs a physical channel the device never configured.
    #[error("device {device}: no {role:?} channel configured")]
    ChannelNotConfigured { device: DeviceId, role: ChannelRole },

    #[error("spreading factor {0} is not a power of two in 1..=512")]
    InvalidSpreadFactor(u32),

    #[error("{role:?} does not support spreading factor {spread_factor}")]
    UnsupportedSpreadFactor { role: ChannelRole, spread_factor: u32 },

    /// The same signal was inserted twice into one receiver's ledger.
    #[error("device {device}: signal {signal:?} would interfere with itself")]
    SelfInterference { device: DeviceId, signal: SignalId },

    #[error("device {0} does not exist")]
    UnknownDevice(DeviceId),

    #[error("malformed burst payload: {0}")]
    MalformedPayload(String),

    #[error("simulation time overflow")]
    TimeOverflow,
}
