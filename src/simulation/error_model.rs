//! Error evaluator and bit-error-rate curves.
//!
//! A burst is judged piecewise: every time the interference picture is about
//! to change (and once more when the burst ends) the evaluator looks at the
//! stretch of the burst received since the previous evaluation, counts the
//! information bits in it and draws whether any of them was corrupted.
//!
//! # Formula
//!
//! ```text
//! SINR  = P_burst / (I_burst + N / sf)
//! bits  = floor((t_end - t_start) × chipRate / sf / codingRate)
//! P_err = 1 - (1 - BER(SINR))^bits
//! ```
//!
//! The BER lookup is pluggable through [`BerCurve`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use serde::Deserialize;

use super::burst::Burst;
use super::interference::InterferenceLedger;
use super::signal_calculations::mw_to_dbm;
use super::time::SimTime;
use super::types::ModCode;

/// SINR (linear) in, bit error rate out.
pub trait BerCurve: Send + Sync {
    fn bit_error_rate(&self, mod_code: ModCode, sinr: f64) -> f64;
}

/// Closed-form BER with a fixed coding gain per modulation/coding.
///
/// - QPSK: `0.5 × erfc(√γ)`
/// - 16QAM: `0.375 × erfc(√(γ / 5))`
///
/// where `γ = SINR × 10^(G_c / 10)`. The coding gain depends on the code
/// only: convolutional 1/2 gets 5 dB, convolutional 1/3 6 dB, turbo 1/3 8 dB.
#[derive(Debug, Clone)]
pub struct AnalyticBerCurve {
    coding_gain_db: BTreeMap<ModCode, f64>,
}

impl Default for AnalyticBerCurve {
    fn default() -> Self {
        let coding_gain_db = BTreeMap::from([
            (ModCode::QpskR13, 6.0),
            (ModCode::QpskR12, 5.0),
            (ModCode::QpskTurboR13, 8.0),
            (ModCode::Qam16R13, 6.0),
            (ModCode::Qam16R12, 5.0),
            (ModCode::Qam16TurboR13, 8.0),
        ]);
        AnalyticBerCurve { coding_gain_db }
    }
}

impl BerCurve for AnalyticBerCurve {
    fn bit_error_rate(&self, mod_code: ModCode, sinr: f64) -> f64 {
        if sinr <= 0.0 {
            return 0.5;
        }
        let gain = self.coding_gain_db.get(&mod_code).copied().unwrap_or(0.0);
        let gamma = sinr * 10f64.powf(gain / 10.0);
        let ber = match mod_code {
            ModCode::QpskR13 | ModCode::QpskR12 | ModCode::QpskTurboR13 => 0.5 * erfc(gamma.sqrt()),
            ModCode::Qam16R13 | ModCode::Qam16R12 | ModCode::Qam16TurboR13 => 0.375 * erfc((gamma / 5.0).sqrt()),
        };
        ber.clamp(0.0, 0.5)
    }
}

/// Complementary error function for `x >= 0` (Abramowitz & Stegun 7.1.26).
///
/// Computed directly as `poly(t)·e^(-x²)` so that small tail values keep
/// their relative precision.
fn erfc(x: f64) -> f64 {
    if x < 0.0 {
        return 2.0 - erfc(-x);
    }
    const P: f64 = 0.327_591_1;
    const A: [f64; 5] = [0.254_829_592, -0.284_496_736, 1.421_413_741, -1.453_152_027, 1.061_405_429];
    let t = 1.0 / (1.0 + P * x);
    let poly = t * (A[0] + t * (A[1] + t * (A[2] + t * (A[3] + t * A[4]))));
    poly * (-x * x).exp()
}

/// One curve of a BER table: points of (SINR in dB, BER).
#[derive(Debug, Clone, Deserialize)]
pub struct BerTableCurve {
    pub mod_code: ModCode,
    pub points: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, Deserialize)]
struct BerTableFile {
    curve: Vec<BerTableCurve>,
}

/// Tabulated BER curves with log-linear interpolation between points.
///
/// Below the first point the first BER is used, above the last point the
/// last BER. Modulations without a table fall back to `fallback`.
pub struct TableBerCurve {
    tables: BTreeMap<ModCode, Vec<(f64, f64)>>,
    fallback: AnalyticBerCurve,
}

impl TableBerCurve {
    pub fn new(curves: Vec<BerTableCurve>) -> Result<Self, String> {
        let mut tables = BTreeMap::new();
        for curve in curves {
            let mut points = curve.points;
            if points.is_empty() {
                return Err(format!("BER curve for {:?} has no points", curve.mod_code));
            }
            if points.iter().any(|(_, ber)| !(0.0..=1.0).contains(ber)) {
                return Err(format!("BER curve for {:?} has a BER outside [0, 1]", curve.mod_code));
            }
            points.sort_by(|a, b| a.0.total_cmp(&b.0));
            tables.insert(curve.mod_code, points);
        }
        Ok(TableBerCurve {
            tables,
            fallback: AnalyticBerCurve::default(),
        })
    }

    /// Load curves from a TOML file made of `[[curve]]` tables.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path).map_err(|e| format!("Failed to read BER table: {}", e))?;
        let file: BerTableFile = toml::from_str(&content).map_err(|e| format!("Failed to parse BER table: {}", e))?;
        Self::new(file.curve)
    }
}

impl BerCurve for TableBerCurve {
    fn bit_error_rate(&self, mod_code: ModCode, sinr: f64) -> f64 {
        let Some(points) = self.tables.get(&mod_code) else {
            return self.fallback.bit_error_rate(mod_code, sinr);
        };
        let sinr_db = if sinr > 0.0 { mw_to_dbm(sinr) } else { f64::NEG_INFINITY };

        let first = points[0];
        let last = points[points.len() - 1];
        if sinr_db <= first.0 {
            return first.1;
        }
        if sinr_db >= last.0 {
            return last.1;
        }
        for pair in points.windows(2) {
            let (x0, y0) = pair[0];
            let (x1, y1) = pair[1];
            if sinr_db >= x0 && sinr_db <= x1 {
                let f = if x1 > x0 { (sinr_db - x0) / (x1 - x0) } else { 0.0 };
                if y0 > 0.0 && y1 > 0.0 {
                    return 10f64.powf(y0.log10() + f * (y1.log10() - y0.log10()));
                }
                return y0 + f * (y1 - y0);
            }
        }
        last.1
    }
}

/// Result of evaluating one stretch of a burst.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub sinr: f64,
    pub bits: u64,
    pub error_probability: f64,
    /// The burst went from clean to errored in this evaluation.
    pub newly_in_error: bool,
}

/// Converts a burst's SINR into a stochastic error decision.
#[derive(Clone)]
pub struct ErrorEvaluator {
    chip_rate: f64,
    noise_power_mw: f64,
    curve: Arc<dyn BerCurve>,
}

impl ErrorEvaluator {
    pub fn new(chip_rate: f64, noise_power_mw: f64, curve: Arc<dyn BerCurve>) -> Self {
        ErrorEvaluator {
            chip_rate,
            noise_power_mw,
            curve,
        }
    }

    pub fn noise_power_mw(&self) -> f64 {
        self.noise_power_mw
    }

    /// SINR of a burst against its current interference.
    pub fn sinr(&self, burst: &Burst) -> f64 {
        burst.power_mw / (burst.interference_mw + self.noise_power_mw / burst.spread_factor.as_f64())
    }

    /// Evaluate the part of `burst` received between its last evaluation and `now`.
    ///
    /// Synchronisation bursts and empty stretches are skipped (`None`). A
    /// burst already in error stays in error.
    pub fn evaluate<R: Rng + ?Sized>(&self, burst: &mut Burst, now: SimTime, rng: &mut R) -> Option<Evaluation> {
        if burst.role.is_synchronisation() {
            return None;
        }
        let start = burst.rx_time_evaluated.max(burst.rx_start);
        let end = now.min(burst.rx_evaluated_end);
        if start > end {
            return None;
        }

        let sinr = self.sinr(burst);
        burst.sinr = sinr;

        let (mod_code, coding_rate) = ModCode::from_pair(burst.modulation, burst.coding);
        let ber = self.curve.bit_error_rate(mod_code, sinr);

        let mut bits = 0;
        let mut error_probability = 0.0;
        let mut newly_in_error = false;
        if ber != 0.0 {
            let duration = (end - start).as_secs_f64();
            bits = (duration * self.chip_rate / burst.spread_factor.as_f64() / coding_rate).floor() as u64;
            error_probability = 1.0 - (1.0 - ber).powf(bits as f64);
            let draw: f64 = rng.r#gen();
            if draw < error_probability && !burst.in_error {
                burst.in_error = true;
                newly_in_error = true;
            }
        }

        burst.rx_time_evaluated = end;
        Some(Evaluation {
            sinr,
            bits,
            error_probability,
            newly_in_error,
        })
    }

    /// Evaluate every burst of every received signal in the ledger.
    ///
    /// Returns how many bursts became errored.
    pub fn evaluate_received<R: Rng + ?Sized>(&self, ledger: &mut InterferenceLedger, now: SimTime, rng: &mut R) -> usize {
        let mut newly_errored = 0;
        for signal in ledger.received_mut() {
            for burst in signal.bursts.iter_mut() {
                if let Some(eval) = self.evaluate(burst, now, rng) {
                    if eval.newly_in_error {
                        newly_errored += 1;
                        log::trace!(
                            "burst {:?} from {:?} in error: sinr {:.2} dB, {} bits, p {:.3e}",
                            burst.role,
                            signal.id,
                            mw_to_dbm(eval.sinr),
                            eval.bits,
                            eval.error_probability
                        );
                    }
                }
            }
        }
        newly_errored
    }
}
