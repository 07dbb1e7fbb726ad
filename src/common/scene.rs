//! Scene loading, parsing, and validation logic.
//!
//! A scene is a JSON file naming the devices of a run, where they stand,
//! the propagation model and the upper-layer commands to replay.

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;

use super::config::PhyConfig;
use crate::simulation::command::InterlayerCommand;
use crate::simulation::device::Device;
use crate::simulation::error::SimError;
use crate::simulation::inventory::SCRAMBLING_CODES_PER_CELL;
use crate::simulation::network::{AirChannel, Position};
use crate::simulation::scheduler::Simulation;
use crate::simulation::signal_calculations::PathLossParameters;
use crate::simulation::time::SimTime;
use crate::simulation::types::{DeviceId, DeviceKind};

/// Error type for scene loading failures.
#[derive(Debug)]
pub enum SceneLoadError {
    FileReadError(String),
    ParseError(String),
    ValidationError(String),
}

impl std::fmt::Display for SceneLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SceneLoadError::FileReadError(msg) => write!(f, "Failed to read file: {}", msg),
            SceneLoadError::ParseError(msg) => write!(f, "Failed to parse JSON: {}", msg),
            SceneLoadError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for SceneLoadError {}

/// Simple 2D point in meters.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl From<Point> for Position {
    fn from(p: Point) -> Self {
        Position { x: p.x, y: p.y }
    }
}

/// One device of the scene.
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceSpec {
    pub device_id: u32,
    pub kind: DeviceKind,
    pub position: Point,
    /// Uplink scrambling code of a UE, primary scrambling code of a NodeB.
    pub scrambling_code: u32,
}

/// An upper-layer command replayed at a fixed time.
#[derive(Debug, Deserialize, Clone)]
pub struct ScheduledCommand {
    pub at_ms: f64,
    pub device: u32,
    pub command: InterlayerCommand,
}

/// Root structure representing the entire scene.
#[derive(Debug, Deserialize)]
pub struct Scene {
    /// Seed of the run's random generator.
    #[serde(default)]
    pub seed: u64,
    /// Simulated time in milliseconds.
    pub duration_ms: u64,
    #[serde(default)]
    pub path_loss_parameters: PathLossParameters,
    pub devices: Vec<DeviceSpec>,
    #[serde(default)]
    pub commands: Vec<ScheduledCommand>,
}

impl Scene {
    pub fn duration(&self) -> SimTime {
        SimTime::from_millis(self.duration_ms)
    }
}

/// Load and parse a scene from a file.
///
/// # Parameters
///
/// * `path` - Path to the scene JSON file
///
/// # Returns
///
/// Parsed and validated Scene or an error.
pub fn load_scene(path: &str) -> Result<Scene, SceneLoadError> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path))
        .map_err(|e| SceneLoadError::FileReadError(e.to_string()))?;

    let scene: Scene = serde_json::from_str(&data)
        .context("Invalid JSON format")
        .map_err(|e| SceneLoadError::ParseError(format!("{:#}", e)))?;

    validate_scene(&scene).map_err(SceneLoadError::ValidationError)?;

    Ok(scene)
}

/// Validate scene configuration.
///
/// # Returns
///
/// `Ok(())` if validation passes, `Err(String)` with error description otherwise.
pub fn validate_scene(scene: &Scene) -> Result<(), String> {
    const MAX_WORLD_COORD: f64 = 100_000.0;
    const MAX_DEVICES: usize = 10000;

    if scene.devices.is_empty() {
        return Err("Scene must contain at least one device".to_string());
    }
    if scene.devices.len() > MAX_DEVICES {
        return Err(format!("Device count {} exceeds maximum of {}", scene.devices.len(), MAX_DEVICES));
    }
    if scene.duration_ms == 0 {
        return Err("Invalid duration_ms, must be positive".to_string());
    }

    let mut device_ids = HashSet::new();
    let mut scrambling_codes = HashSet::new();
    for device in &scene.devices {
        if !device_ids.insert(device.device_id) {
            return Err(format!("Duplicate device_id found: {}", device.device_id));
        }
        if !scrambling_codes.insert(device.scrambling_code) {
            return Err(format!(
                "Device {} reuses scrambling code {}",
                device.device_id, device.scrambling_code
            ));
        }
        if !device.position.x.is_finite()
            || !device.position.y.is_finite()
            || device.position.x.abs() > MAX_WORLD_COORD
            || device.position.y.abs() > MAX_WORLD_COORD
        {
            return Err(format!(
                "Device {} position ({}, {}) exceeds world bounds (±{})",
                device.device_id, device.position.x, device.position.y, MAX_WORLD_COORD
            ));
        }
        if device.kind == DeviceKind::NodeB && device.scrambling_code % SCRAMBLING_CODES_PER_CELL != 0 {
            return Err(format!(
                "NodeB {} primary scrambling code {} is not a multiple of {}",
                device.device_id, device.scrambling_code, SCRAMBLING_CODES_PER_CELL
            ));
        }
    }

    let path_loss = &scene.path_loss_parameters;
    if !(path_loss.path_loss_exponent > 0.0) {
        return Err("Invalid path_loss_exponent, must be positive".to_string());
    }
    if !(path_loss.shadowing_sigma >= 0.0) {
        return Err("Invalid shadowing_sigma, must be non-negative".to_string());
    }

    for (idx, scheduled) in scene.commands.iter().enumerate() {
        if !device_ids.contains(&scheduled.device) {
            return Err(format!("Command {} targets unknown device {}", idx, scheduled.device));
        }
        if !(scheduled.at_ms >= 0.0) || scheduled.at_ms > scene.duration_ms as f64 {
            return Err(format!(
                "Command {} at {} ms lies outside the run (0-{} ms)",
                idx, scheduled.at_ms, scene.duration_ms
            ));
        }
        if scheduled.command.is_indication() {
            return Err(format!("Command {} is an upward indication and cannot be scheduled", idx));
        }
    }

    Ok(())
}

/// Build the devices, the air channel and the scheduled commands of a run.
pub fn build_simulation(scene: &Scene, config: &PhyConfig) -> Result<Simulation, SimError> {
    let params = config.device_params();
    let mut air = AirChannel::new(scene.path_loss_parameters.clone(), config.radio.reception_floor_dbm);
    let mut devices = Vec::with_capacity(scene.devices.len());

    for spec in &scene.devices {
        let id = DeviceId(spec.device_id);
        air.place(id, spec.position.into());
        let device = match spec.kind {
            DeviceKind::UserEquipment => Device::user_equipment(id, spec.scrambling_code, params.clone()),
            DeviceKind::NodeB => Device::node_b(id, spec.scrambling_code, params.clone())?,
        };
        devices.push(device);
    }

    let mut simulation = Simulation::new(scene.seed, devices, air);
    for scheduled in &scene.commands {
        let at = SimTime::from_secs_f64(scheduled.at_ms / 1000.0);
        simulation.schedule_command(at, DeviceId(scheduled.device), scheduled.command.clone())?;
    }
    log::info!(
        "scene built: {} devices, {} scheduled commands",
        scene.devices.len(),
        scene.commands.len()
    );
    Ok(simulation)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENE: &str = r#"{
        "seed": 11,
        "duration_ms": 50,
        "path_loss_parameters": {
            "path_loss_exponent": 3.0,
            "shadowing_sigma": 0.0,
            "path_loss_at_reference_distance": 38.0
        },
        "devices": [
            {"device_id": 1, "kind": "node_b", "position": {"x": 0.0, "y": 0.0}, "scrambling_code": 16},
            {"device_id": 2, "kind": "user_equipment", "position": {"x": 30.0, "y": 40.0}, "scrambling_code": 5000}
        ],
        "commands": [
            {"at_ms": 1.5, "device": 2, "command": {"type": "measurement_request"}}
        ]
    }"#;

    fn scene() -> Scene {
        serde_json::from_str(SCENE).unwrap()
    }

    #[test]
    fn valid_scene_passes() {
        let scene = scene();
        assert!(validate_scene(&scene).is_ok());
        assert_eq!(scene.duration(), SimTime::from_millis(50));
        assert_eq!(scene.devices[0].kind, DeviceKind::NodeB);
    }

    #[test]
    fn duplicate_ids_rejected() {
        let mut scene = scene();
        scene.devices[1].device_id = 1;
        let err = validate_scene(&scene).unwrap_err();
        assert!(err.contains("Duplicate device_id"));
    }

    #[test]
    fn misaligned_primary_code_rejected() {
        let mut scene = scene();
        scene.devices[0].scrambling_code = 17;
        assert!(validate_scene(&scene).unwrap_err().contains("multiple of 16"));
    }

    #[test]
    fn command_outside_run_rejected() {
        let mut scene = scene();
        scene.commands[0].at_ms = 80.0;
        assert!(validate_scene(&scene).unwrap_err().contains("outside the run"));
        scene.commands[0].at_ms = 1.0;
        scene.commands[0].device = 9;
        assert!(validate_scene(&scene).unwrap_err().contains("unknown device"));
    }

    #[test]
    fn bad_path_loss_rejected() {
        let mut scene = scene();
        scene.path_loss_parameters.shadowing_sigma = -1.0;
        assert!(validate_scene(&scene).is_err());
    }

    #[test]
    fn missing_file_is_read_error() {
        assert!(matches!(
            load_scene("/nonexistent/scene.json"),
            Err(SceneLoadError::FileReadError(_))
        ));
    }

    #[test]
    fn builds_devices_and_commands() {
        let simulation = build_simulation(&scene(), &PhyConfig::default()).unwrap();
        assert_eq!(simulation.devices().count(), 2);
        assert_eq!(
            simulation.device(DeviceId(1)).map(|d| d.kind()),
            Some(DeviceKind::NodeB)
        );
    }
}
