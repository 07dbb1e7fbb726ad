//! Discrete-event simulator of a CDMA (WCDMA-style) physical layer.
//!
//! - [`common`]: scene files and the PHY configuration.
//! - [`simulation`]: the event loop, the air channel and the per-device PHY.

pub mod common;
pub mod simulation;
