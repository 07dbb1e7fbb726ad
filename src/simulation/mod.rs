//! CDMA physical-layer simulation core.
//!
//! Devices (UEs and NodeBs) exchange signals made of bursts through a shared
//! air channel. Every receiver keeps an interference ledger of the signals
//! it hears, judges received bursts against the interference they saw, and
//! hands error-free payloads to its upper layers. On top of that run the
//! power-control loops, random access over PRACH/AICH and cell search.
//!
//! ## Module Organization
//!
//! - `time`, `types`, `error`: simulated time, identifiers and fatal errors
//! - `signal_calculations`: dB/mW math, noise, sensitivity, path loss
//! - `burst`: bursts, signals and their lifecycle
//! - `interference`: the per-receiver interference ledger
//! - `error_model`: SINR evaluation and BER curves
//! - `power_control`: inner loop and transmit power clamping
//! - `random_access`: RACH state machine and AICH collection
//! - `inventory`: channel inventory, transport mapping and burst construction
//! - `peers`: per-link records on both sides of a radio link
//! - `payload`, `command`: PDU packing and interlayer commands
//! - `device`: the UE / NodeB entity
//! - `network`: the air channel entity
//! - `scheduler`: the discrete-event loop
//! - `stats`: counters and the run report
//! - `log_capture`: per-device log tallies

pub mod burst;
pub mod command;
pub mod device;
pub mod error;
pub mod error_model;
pub mod interference;
pub mod inventory;
pub mod log_capture;
pub mod network;
pub mod payload;
pub mod peers;
pub mod power_control;
pub mod random_access;
pub mod scheduler;
pub mod signal_calculations;
pub mod stats;
pub mod time;
pub mod types;

pub use error::SimError;
pub use scheduler::Simulation;
