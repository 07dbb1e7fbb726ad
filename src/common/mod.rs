//! Inputs of a run: the scene and the PHY configuration.

pub mod config;
pub mod scene;
