//! Radio signal calculations for the CDMA PHY.
//!
//! Contains helpers for:
//! - Log-distance path loss with optional log-normal shadowing
//! - Power unit conversion (dBm, mW)
//! - Thermal noise and receiver sensitivity per modulation/coding
//! - Slot format selection per channel role and spreading factor
//! - CQI derivation from the pilot Ec/No
//!
//! Units:
//! - Power: dBm, mW (conversion provided)
//! - Time: `SimTime` (nanoseconds)
//! - Distance: meters

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;

use super::error::SimError;
use super::time::SimTime;
use super::types::{ChannelRole, LinkDirection, ModCode, SpreadFactor};

/// Reference sensitivities (dBm) before bandwidth and noise-figure adjustment.
pub const SENSITIVITY_QPSK_R13_DBM: f64 = -99.0;
pub const SENSITIVITY_QPSK_R12_DBM: f64 = -97.0;
pub const SENSITIVITY_QAM16_R13_DBM: f64 = -93.0;
pub const SENSITIVITY_QAM16_R12_DBM: f64 = -91.0;

/// Offset removed from `10·log10(bandwidth)` when adjusting the reference sensitivities.
pub const SENSITIVITY_ADJUSTMENT_DB: f64 = 60.0;

/// Noise figure the reference sensitivities were specified at.
pub const NOISE_FIGURE_REFERENCE_DB: f64 = 11.0;

pub const IMPLEMENTATION_LOSS_DB: f64 = 0.0;

/// Offset added to the pilot Ec/No to obtain a CQI value.
pub const CQI_EC_NO_OFFSET_DB: f64 = 10.0;

/// Highest CQI value a UE reports.
pub const CQI_MAX: u8 = 30;

const SPEED_OF_LIGHT_M_PER_S: f64 = 299_792_458.0;

/// Parameters defining the radio channel propagation model.
///
/// This struct encapsulates the constants used in the log-distance path loss model
/// with log-normal shadowing. These parameters determine how signal strength
/// decays over distance and how much random variation (shadowing) is applied.
#[derive(Debug, Deserialize, Clone)]
pub struct PathLossParameters {
    /// Path loss exponent (n).
    ///
    /// - n = 2.0: Free space
    /// - n = 2.7 to 3.5: Urban macro cells
    /// - n = 3.0 to 5.0: Indoor obstructed environments
    pub path_loss_exponent: f64,

    /// Standard deviation for log-normal shadowing (σ) in dB. A value of 0.0 disables shadowing.
    #[serde(default)]
    pub shadowing_sigma: f64,

    /// Path loss at the reference distance d₀ (1 meter) in dB.
    pub path_loss_at_reference_distance: f64,
}

impl Default for PathLossParameters {
    fn default() -> Self {
        Self {
            path_loss_exponent: 3.5,
            shadowing_sigma: 0.0,
            path_loss_at_reference_distance: 38.0,
        }
    }
}

/// Calculate the path loss (in dB) at a given distance using a log-distance
/// path loss model with log-normal shadowing.
///
/// # Formula
///
/// ```text
/// PL(d) = PL(d₀) + 10 × n × log₁₀(d/d₀) + X_σ
/// where d₀ = 1 meter (reference distance)
/// ```
///
/// # Parameters
///
/// - `distance`: The distance between transmitter and receiver in meters
/// - `params`: Path loss model parameters
/// - `rng`: Random source for the shadowing term; pass the simulation's seeded
///   generator so runs are reproducible
///
/// # Returns
///
/// Path loss in decibels (dB). Stochastic when `shadowing_sigma > 0`.
///
/// # Notes
///
/// - For distances < 1.0 meter, returns the reference path loss without further attenuation
pub fn calculate_path_loss<R: Rng + ?Sized>(distance: f64, params: &PathLossParameters, rng: &mut R) -> f64 {
    if distance < 1.0 {
        return params.path_loss_at_reference_distance;
    }
    let path_loss = params.path_loss_at_reference_distance + 10.0 * params.path_loss_exponent * distance.log10();
    let shadowing = if params.shadowing_sigma > 0.0 {
        match Normal::new(0.0_f64, params.shadowing_sigma) {
            Ok(normal) => normal.sample(rng),
            Err(_) => 0.0,
        }
    } else {
        0.0
    };
    path_loss + shadowing
}

/// One-way propagation delay over `distance` meters.
pub fn propagation_delay(distance: f64) -> SimTime {
    SimTime::from_secs_f64(distance.max(0.0) / SPEED_OF_LIGHT_M_PER_S)
}

/// Convert power from dBm (decibels relative to 1 milliwatt) to milliwatts.
///
/// # Formula
///
/// ```text
/// P(mW) = 10^(P(dBm) / 10)
/// ```
///
/// # Examples
///
/// ```text
/// 0 dBm   → 1 mW
/// 10 dBm  → 10 mW
/// -10 dBm → 0.1 mW
/// ```
pub fn dbm_to_mw(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

/// Convert power from milliwatts to dBm.
///
/// # Formula
///
/// ```text
/// P(dBm) = 10 × log₁₀(P(mW))
/// ```
///
/// # Notes
///
/// - This is the inverse operation of `dbm_to_mw()`
/// - For `mw <= 0` the result is -∞ or NaN; callers pass strictly positive powers
pub fn mw_to_dbm(mw: f64) -> f64 {
    10.0 * mw.log10()
}

/// Thermal noise power in mW over the channel bandwidth.
///
/// `noise_density_dbm_hz` is the thermal floor (typically -174 dBm/Hz) and
/// `noise_figure_db` the receiver noise figure.
pub fn noise_power_mw(noise_density_dbm_hz: f64, noise_figure_db: f64, bandwidth_hz: f64) -> f64 {
    dbm_to_mw(noise_density_dbm_hz + noise_figure_db) * bandwidth_hz
}

/// Receiver sensitivity (mW) for a modulation/coding combination.
///
/// # Formula
///
/// ```text
/// S(dBm) = S_ref + 10·log10(BW) - 60 + (NF - 11 + L_impl)
/// ```
pub fn receiver_sensitivity_mw(mod_code: ModCode, bandwidth_hz: f64, noise_figure_db: f64) -> f64 {
    let reference = match mod_code {
        ModCode::QpskR13 | ModCode::QpskTurboR13 => SENSITIVITY_QPSK_R13_DBM,
        ModCode::QpskR12 => SENSITIVITY_QPSK_R12_DBM,
        ModCode::Qam16R13 | ModCode::Qam16TurboR13 => SENSITIVITY_QAM16_R13_DBM,
        ModCode::Qam16R12 => SENSITIVITY_QAM16_R12_DBM,
    };
    let bw_db = 10.0 * bandwidth_hz.log10();
    let noise_adjustment = noise_figure_db - NOISE_FIGURE_REFERENCE_DB + IMPLEMENTATION_LOSS_DB;
    dbm_to_mw(reference + bw_db - SENSITIVITY_ADJUSTMENT_DB + noise_adjustment)
}

/// Slot format number for a channel role, direction and spreading factor.
///
/// Roles without a spreading-factor dependent format use format 0. Returns
/// `UnsupportedSpreadFactor` for combinations a transmitter cannot build.
pub fn slot_format(role: ChannelRole, direction: LinkDirection, sf: SpreadFactor) -> Result<u8, SimError> {
    let unsupported = || SimError::UnsupportedSpreadFactor {
        role,
        spread_factor: sf.value(),
    };
    match (role, direction) {
        (ChannelRole::Prach, _) => match sf.value() {
            256 => Ok(0),
            128 => Ok(1),
            64 => Ok(2),
            32 => Ok(3),
            _ => Err(unsupported()),
        },
        (ChannelRole::Dpdch, LinkDirection::Uplink) => match sf.value() {
            256 => Ok(0),
            128 => Ok(1),
            64 => Ok(2),
            32 => Ok(3),
            16 => Ok(4),
            8 => Ok(5),
            4 => Ok(6),
            _ => Err(unsupported()),
        },
        (ChannelRole::Dpdch, LinkDirection::Downlink) => match sf.value() {
            512 => Ok(0),
            256 => Ok(1),
            128 => Ok(2),
            64 => Ok(3),
            32 => Ok(4),
            16 => Ok(5),
            8 => Ok(6),
            4 => Ok(7),
            _ => Err(unsupported()),
        },
        (ChannelRole::Dpcch, LinkDirection::Uplink) | (ChannelRole::Hsdpcch, _) | (ChannelRole::Cpich, _) => {
            if sf.value() == 256 { Ok(0) } else { Err(unsupported()) }
        }
        (ChannelRole::Hspdsch, _) => {
            if sf.value() == 16 { Ok(0) } else { Err(unsupported()) }
        }
        (ChannelRole::Hsscch, _) => {
            if sf.value() == 128 { Ok(0) } else { Err(unsupported()) }
        }
        _ => Ok(0),
    }
}

/// Channel quality indicator derived from the serving cell's pilot Ec/No.
///
/// `CQI = clamp(EcNo_dB + 10, 0, 30)`, truncated toward zero.
pub fn cqi_from_ec_no(ec_no_db: f64) -> u8 {
    let cqi = (ec_no_db + CQI_EC_NO_OFFSET_DB).clamp(0.0, CQI_MAX as f64);
    cqi as u8
}
