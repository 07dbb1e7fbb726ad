//! PHY configuration loading.
//!
//! Values come from a `config.toml` next to the scene file. Every key is
//! optional; missing keys take the defaults below, and out-of-range values
//! are replaced by their default with a warning (see [`PhyConfig::sanitize`]).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::simulation::device::{DeviceParams, PowerLimits};
use crate::simulation::error_model::{AnalyticBerCurve, BerCurve, TableBerCurve};
use crate::simulation::peers::LinkDefaults;
use crate::simulation::random_access::RachTiming;
use crate::simulation::signal_calculations::{mw_to_dbm, noise_power_mw, receiver_sensitivity_mw};
use crate::simulation::time::{SLOTS_PER_FRAME, SimTime};
use crate::simulation::types::{ModCode, SpreadFactor};

/// Receiver front end and channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RadioConfig {
    pub chip_rate: f64,
    pub bandwidth_hz: f64,
    pub noise_figure_db: f64,
    /// Thermal noise density (dBm/Hz).
    pub noise_density_dbm_hz: f64,
    /// Signals received below this power are not delivered at all (dBm).
    pub reception_floor_dbm: f64,
}

impl Default for RadioConfig {
    fn default() -> Self {
        RadioConfig {
            chip_rate: 3_840_000.0,
            bandwidth_hz: 5_000_000.0,
            noise_figure_db: 10.0,
            noise_density_dbm_hz: -174.0,
            reception_floor_dbm: -140.0,
        }
    }
}

/// Transmit power limits and the power-control loop.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PowerConfig {
    pub ue_max_dbm: f64,
    pub ue_min_dbm: f64,
    pub node_b_max_dbm: f64,
    pub node_b_min_dbm: f64,
    pub uplink_target_sir_db: f64,
    pub downlink_target_sir_db: f64,
    pub step_size_db: f64,
    /// Margin of the inner-loop reference threshold over the noise floor.
    pub reference_threshold_shift_db: f64,
    /// Fixed inner-loop reference threshold (dBm), overriding the shift.
    pub reference_threshold_dbm: Option<f64>,
}

impl Default for PowerConfig {
    fn default() -> Self {
        PowerConfig {
            ue_max_dbm: 30.0,
            ue_min_dbm: -30.0,
            node_b_max_dbm: 30.0,
            node_b_min_dbm: -30.0,
            uplink_target_sir_db: 7.0,
            downlink_target_sir_db: 7.0,
            step_size_db: 1.0,
            reference_threshold_shift_db: 15.0,
            reference_threshold_dbm: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RachConfig {
    pub initial_power_dbm: f64,
    pub ramp_step_db: f64,
    pub aich_timeout_frames: u32,
    pub message_delay_slots: u32,
    pub nack_ends_attempt: bool,
}

impl Default for RachConfig {
    fn default() -> Self {
        RachConfig {
            initial_power_dbm: 10.0,
            ramp_step_db: 3.0,
            aich_timeout_frames: 2,
            message_delay_slots: 3,
            nack_ends_attempt: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ReportingConfig {
    pub cqi_period_ms: u64,
    pub measurement_period_ms: u64,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        ReportingConfig {
            cqi_period_ms: 10,
            measurement_period_ms: 1000,
        }
    }
}

/// Complete PHY configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PhyConfig {
    pub radio: RadioConfig,
    pub power: PowerConfig,
    pub rach: RachConfig,
    pub reporting: ReportingConfig,
    /// TOML file of `[[curve]]` BER tables. Relative paths are resolved
    /// against the directory of the config file.
    pub ber_table: Option<PathBuf>,
}

impl PhyConfig {
    /// Load configuration from a TOML file and sanitize it.
    ///
    /// # Returns
    /// * `Ok(PhyConfig)` if the file was successfully loaded and parsed
    /// * `Err(String)` with a descriptive error message otherwise
    pub fn load(config_path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(config_path).map_err(|e| format!("Failed to read config file: {}", e))?;
        let mut config: PhyConfig = toml::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))?;

        if let Some(table) = config.ber_table.take() {
            let resolved = if table.is_relative() {
                config_path.parent().unwrap_or(Path::new(".")).join(table)
            } else {
                table
            };
            config.ber_table = Some(resolved);
        }
        config.sanitize();
        Ok(config)
    }

    /// Derive the config path from a scene file path.
    ///
    /// Replaces the scene filename with "config.toml" in the same directory.
    pub fn config_path_from_scene(scene_path: &str) -> PathBuf {
        let scene = Path::new(scene_path);
        scene.parent().unwrap_or(Path::new(".")).join("config.toml")
    }

    /// Replace out-of-range values by their defaults, warning for each.
    ///
    /// Returns the number of values replaced.
    pub fn sanitize(&mut self) -> usize {
        let defaults = PhyConfig::default();
        let mut replaced = 0;
        let mut fallback = |name: &str, value: &mut f64, default: f64| {
            log::warn!("config: invalid {} = {}, using default {}", name, value, default);
            *value = default;
            replaced += 1;
        };

        if !(self.radio.chip_rate > 0.0) {
            fallback("radio.chip-rate", &mut self.radio.chip_rate, defaults.radio.chip_rate);
        }
        if !(self.radio.bandwidth_hz > 0.0) {
            fallback("radio.bandwidth-hz", &mut self.radio.bandwidth_hz, defaults.radio.bandwidth_hz);
        }
        if !self.radio.noise_figure_db.is_finite() || self.radio.noise_figure_db < 0.0 {
            fallback("radio.noise-figure-db", &mut self.radio.noise_figure_db, defaults.radio.noise_figure_db);
        }
        if self.power.ue_min_dbm >= self.power.ue_max_dbm {
            fallback("power.ue-min-dbm", &mut self.power.ue_min_dbm, defaults.power.ue_min_dbm);
            fallback("power.ue-max-dbm", &mut self.power.ue_max_dbm, defaults.power.ue_max_dbm);
        }
        if self.power.node_b_min_dbm >= self.power.node_b_max_dbm {
            fallback("power.node-b-min-dbm", &mut self.power.node_b_min_dbm, defaults.power.node_b_min_dbm);
            fallback("power.node-b-max-dbm", &mut self.power.node_b_max_dbm, defaults.power.node_b_max_dbm);
        }
        if !(self.power.step_size_db > 0.0) {
            fallback("power.step-size-db", &mut self.power.step_size_db, defaults.power.step_size_db);
        }
        if !(self.rach.ramp_step_db > 0.0) {
            fallback("rach.ramp-step-db", &mut self.rach.ramp_step_db, defaults.rach.ramp_step_db);
        }

        if self.rach.aich_timeout_frames == 0 {
            log::warn!("config: invalid rach.aich-timeout-frames = 0, using default {}", defaults.rach.aich_timeout_frames);
            self.rach.aich_timeout_frames = defaults.rach.aich_timeout_frames;
            replaced += 1;
        }
        if self.reporting.cqi_period_ms == 0 {
            log::warn!("config: invalid reporting.cqi-period-ms = 0, using default {}", defaults.reporting.cqi_period_ms);
            self.reporting.cqi_period_ms = defaults.reporting.cqi_period_ms;
            replaced += 1;
        }
        if self.reporting.measurement_period_ms == 0 {
            log::warn!(
                "config: invalid reporting.measurement-period-ms = 0, using default {}",
                defaults.reporting.measurement_period_ms
            );
            self.reporting.measurement_period_ms = defaults.reporting.measurement_period_ms;
            replaced += 1;
        }
        replaced
    }

    /// Thermal noise over the channel bandwidth (mW).
    pub fn noise_power_mw(&self) -> f64 {
        noise_power_mw(self.radio.noise_density_dbm_hz, self.radio.noise_figure_db, self.radio.bandwidth_hz)
    }

    /// Inner-loop reference threshold (dBm).
    pub fn reference_threshold_dbm(&self) -> f64 {
        self.power
            .reference_threshold_dbm
            .unwrap_or_else(|| mw_to_dbm(self.noise_power_mw()) + self.power.reference_threshold_shift_db)
    }

    /// BER curve to evaluate bursts with. A table that fails to load falls
    /// back to the analytic curves.
    pub fn ber_curve(&self) -> Arc<dyn BerCurve> {
        let Some(path) = &self.ber_table else {
            return Arc::new(AnalyticBerCurve::default());
        };
        match TableBerCurve::load(path) {
            Ok(table) => {
                log::info!("BER table loaded from {}", path.display());
                Arc::new(table)
            }
            Err(e) => {
                log::warn!("{}; using analytic BER curves", e);
                Arc::new(AnalyticBerCurve::default())
            }
        }
    }

    /// Resolve the per-device constants.
    pub fn device_params(&self) -> DeviceParams {
        let sensitivity = receiver_sensitivity_mw(ModCode::QpskR13, self.radio.bandwidth_hz, self.radio.noise_figure_db);
        let uplink = LinkDefaults {
            target_sir_db: self.power.uplink_target_sir_db,
            step_size_db: self.power.step_size_db,
            min_power_dbm: self.power.ue_min_dbm,
            max_power_dbm: self.power.ue_max_dbm,
        };
        let downlink = LinkDefaults {
            target_sir_db: self.power.downlink_target_sir_db,
            step_size_db: self.power.step_size_db,
            min_power_dbm: self.power.node_b_min_dbm,
            max_power_dbm: self.power.node_b_max_dbm,
        };
        DeviceParams {
            chip_rate: self.radio.chip_rate,
            noise_power_mw: self.noise_power_mw(),
            lock_threshold_mw: sensitivity / SpreadFactor::SF256.as_f64(),
            reference_threshold_db: self.reference_threshold_dbm(),
            ue_power: PowerLimits {
                min_dbm: self.power.ue_min_dbm,
                max_dbm: self.power.ue_max_dbm,
            },
            node_b_power: PowerLimits {
                min_dbm: self.power.node_b_min_dbm,
                max_dbm: self.power.node_b_max_dbm,
            },
            uplink,
            downlink,
            rach: RachTiming {
                initial_power_dbm: self.rach.initial_power_dbm,
                ramp_step_db: self.rach.ramp_step_db,
                max_power_dbm: self.power.ue_max_dbm,
                aich_timeout_slots: self.rach.aich_timeout_frames * SLOTS_PER_FRAME as u32,
                message_delay_slots: self.rach.message_delay_slots,
                nack_ends_attempt: self.rach.nack_ends_attempt,
            },
            cqi_period: SimTime::from_millis(self.reporting.cqi_period_ms),
            measurement_period: SimTime::from_millis(self.reporting.measurement_period_ms),
            ber_curve: self.ber_curve(),
        }
    }
}
