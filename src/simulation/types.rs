//! Type definitions shared across the PHY core.
//!
//! Contains the small value types every other module speaks in:
//! - Device identity and kind
//! - Physical channel roles and link direction
//! - Phase branch, modulation and coding
//! - Validated spreading factor

use serde::{Deserialize, Serialize};

use super::error::SimError;

/// Identifier of a simulated device (UE or base station).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    UserEquipment,
    NodeB,
}

/// Physical channel role of a burst or inventory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    /// Primary synchronisation channel.
    Psch,
    /// Secondary synchronisation channel.
    Ssch,
    /// Common pilot channel.
    Cpich,
    /// Primary common control (broadcast) channel.
    Pccpch,
    /// Secondary common control channel.
    Sccpch,
    /// Paging indicator channel.
    Pich,
    /// Acquisition indicator channel.
    Aich,
    /// Physical random access channel.
    Prach,
    /// Dedicated physical data channel.
    Dpdch,
    /// Dedicated physical control channel.
    Dpcch,
    /// High-speed downlink shared channel.
    Hspdsch,
    /// High-speed shared control channel.
    Hsscch,
    /// High-speed dedicated physical control channel (uplink CQI).
    Hsdpcch,
}

impl ChannelRole {
    /// Synchronisation bursts are never error-evaluated.
    pub fn is_synchronisation(&self) -> bool {
        matches!(self, ChannelRole::Psch | ChannelRole::Ssch)
    }

    /// Downlink roles every UE listens to regardless of code assignment.
    pub fn is_common_downlink(&self) -> bool {
        matches!(
            self,
            ChannelRole::Psch
                | ChannelRole::Ssch
                | ChannelRole::Cpich
                | ChannelRole::Pccpch
                | ChannelRole::Aich
                | ChannelRole::Pich
                | ChannelRole::Sccpch
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkDirection {
    Uplink,
    Downlink,
}

/// Relative phase branch a burst is modulated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PhaseBranch {
    #[serde(rename = "i")]
    InPhase,
    #[serde(rename = "q")]
    Quadrature,
    /// Both branches (complex-valued spreading).
    #[default]
    #[serde(rename = "iq")]
    Combined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modulation {
    #[default]
    Qpsk,
    Qam16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coding {
    /// Convolutional, rate 1/2.
    #[default]
    Conv2,
    /// Convolutional, rate 1/3.
    Conv3,
    /// Turbo, rate 1/3.
    Turbo3,
    Uncoded,
}

/// Modulation and coding combination used to select a BER curve and a sensitivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModCode {
    QpskR13,
    QpskR12,
    QpskTurboR13,
    Qam16R13,
    Qam16R12,
    Qam16TurboR13,
}

impl ModCode {
    /// Map a (modulation, coding) pair to its BER curve and the coding rate
    /// denominator used when counting information bits.
    ///
    /// Unknown combinations fall back to QPSK 1/3 with rate 3.
    pub fn from_pair(modulation: Modulation, coding: Coding) -> (ModCode, f64) {
        match (modulation, coding) {
            (Modulation::Qpsk, Coding::Conv3) => (ModCode::QpskR13, 3.0),
            (Modulation::Qpsk, Coding::Turbo3) => (ModCode::QpskTurboR13, 3.0),
            (Modulation::Qpsk, Coding::Conv2) => (ModCode::QpskR12, 2.0),
            (Modulation::Qam16, Coding::Turbo3) => (ModCode::Qam16TurboR13, 3.0),
            (Modulation::Qam16, Coding::Conv3) => (ModCode::Qam16R13, 3.0),
            (Modulation::Qam16, Coding::Conv2) => (ModCode::Qam16R12, 2.0),
            _ => (ModCode::QpskR13, 3.0),
        }
    }
}

/// A spreading factor, guaranteed to be a power of two in `1..=512`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct SpreadFactor(u32);

impl SpreadFactor {
    pub const SF4: SpreadFactor = SpreadFactor(4);
    pub const SF16: SpreadFactor = SpreadFactor(16);
    pub const SF64: SpreadFactor = SpreadFactor(64);
    pub const SF128: SpreadFactor = SpreadFactor(128);
    pub const SF256: SpreadFactor = SpreadFactor(256);

    pub fn new(sf: u32) -> Result<Self, SimError> {
        if sf == 0 || sf > 512 || !sf.is_power_of_two() {
            return Err(SimError::InvalidSpreadFactor(sf));
        }
        Ok(SpreadFactor(sf))
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn as_f64(&self) -> f64 {
        self.0 as f64
    }

    /// Spreading factor expressed in dB (`10·log10(sf)`).
    pub fn db(&self) -> f64 {
        10.0 * (self.0 as f64).log10()
    }

    /// Relative amplitude weighting of a channel with this factor (`1/sf`).
    pub fn gain_factor(&self) -> f64 {
        1.0 / self.0 as f64
    }
}

impl TryFrom<u32> for SpreadFactor {
    type Error = SimError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        SpreadFactor::new(value)
    }
}

impl From<SpreadFactor> for u32 {
    fn from(sf: SpreadFactor) -> u32 {
        sf.0
    }
}

impl std::fmt::Display for SpreadFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SF{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_factor_rejects_non_powers_of_two() {
        assert!(SpreadFactor::new(0).is_err());
        assert!(SpreadFactor::new(3).is_err());
        assert!(SpreadFactor::new(1024).is_err());
        for sf in [1, 2, 4, 8, 16, 32, 64, 128, 256, 512] {
            assert_eq!(SpreadFactor::new(sf).map(|s| s.value()).ok(), Some(sf));
        }
    }

    #[test]
    fn gain_factor_is_inverse_of_spread_factor() {
        assert!((SpreadFactor::SF256.gain_factor() - 0.00390625).abs() < 1e-12);
        assert!((SpreadFactor::SF4.gain_factor() - 0.25).abs() < 1e-12);
        assert!((SpreadFactor::SF256.db() - 24.082).abs() < 1e-3);
    }

    #[test]
    fn mod_code_mapping_keeps_turbo_apart() {
        assert_eq!(ModCode::from_pair(Modulation::Qpsk, Coding::Conv2), (ModCode::QpskR12, 2.0));
        assert_eq!(ModCode::from_pair(Modulation::Qpsk, Coding::Turbo3), (ModCode::QpskTurboR13, 3.0));
        assert_eq!(ModCode::from_pair(Modulation::Qam16, Coding::Turbo3), (ModCode::Qam16TurboR13, 3.0));
        assert_eq!(ModCode::from_pair(Modulation::Qpsk, Coding::Uncoded), (ModCode::QpskR13, 3.0));
    }

    #[test]
    fn common_downlink_roles() {
        assert!(ChannelRole::Aich.is_common_downlink());
        assert!(!ChannelRole::Dpdch.is_common_downlink());
        assert!(ChannelRole::Psch.is_synchronisation());
        assert!(!ChannelRole::Cpich.is_synchronisation());
    }
}
