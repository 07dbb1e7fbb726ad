use cdma_phy_simulator::common::config::PhyConfig;
use cdma_phy_simulator::common::scene::{DeviceSpec, Point, Scene, ScheduledCommand, build_simulation};
use cdma_phy_simulator::simulation::command::InterlayerCommand;
use cdma_phy_simulator::simulation::inventory::{ChannelConfig, ChannelDescriptor};
use cdma_phy_simulator::simulation::random_access::{AccessConfirm, AccessRequest};
use cdma_phy_simulator::simulation::scheduler::RunSummary;
use cdma_phy_simulator::simulation::signal_calculations::PathLossParameters;
use cdma_phy_simulator::simulation::stats::DeviceReport;
use cdma_phy_simulator::simulation::time::SimTime;
use cdma_phy_simulator::simulation::types::{ChannelRole, Coding, DeviceId, DeviceKind, LinkDirection, Modulation, SpreadFactor};

const CELL: u32 = 16;
const NODE_B: u32 = 1;

fn node_b() -> DeviceSpec {
    DeviceSpec {
        device_id: NODE_B,
        kind: DeviceKind::NodeB,
        position: Point { x: 0.0, y: 0.0 },
        scrambling_code: CELL,
    }
}

fn ue(device_id: u32, scrambling_code: u32, x: f64, y: f64) -> DeviceSpec {
    DeviceSpec {
        device_id,
        kind: DeviceKind::UserEquipment,
        position: Point { x, y },
        scrambling_code,
    }
}

fn at(at_ms: f64, device: u32, command: InterlayerCommand) -> ScheduledCommand {
    ScheduledCommand { at_ms, device, command }
}

fn scene(seed: u64, duration_ms: u64, devices: Vec<DeviceSpec>, commands: Vec<ScheduledCommand>) -> Scene {
    Scene {
        seed,
        duration_ms,
        path_loss_parameters: PathLossParameters {
            path_loss_exponent: 3.5,
            shadowing_sigma: 0.0,
            path_loss_at_reference_distance: 38.0,
        },
        devices,
        commands,
    }
}

fn run(scene: &Scene) -> RunSummary {
    let mut simulation = build_simulation(scene, &PhyConfig::default()).unwrap();
    simulation.run_until(scene.duration()).unwrap();
    simulation.finalize()
}

fn report(summary: &RunSummary, id: u32) -> &DeviceReport {
    summary.devices.iter().find(|d| d.id == DeviceId(id)).unwrap()
}

fn dedicated(role: ChannelRole, direction: LinkDirection, sf: SpreadFactor, sc: u32, peer: u32) -> ChannelConfig {
    ChannelConfig::new(role, direction, sf, sc)
        .with_mod_code(Modulation::Qpsk, Coding::Conv2)
        .with_descriptor(ChannelDescriptor::Dedicated {
            peer_scrambling_code: peer,
            primary: true,
        })
}

/// PRACH setup, transport mapping and queued payload on a UE.
fn access_commands(device: u32, at_ms: f64, prach_code: u32, request: AccessRequest, payload: &[u8]) -> Vec<ScheduledCommand> {
    let prach = ChannelConfig::new(ChannelRole::Prach, LinkDirection::Uplink, SpreadFactor::SF64, prach_code).with_descriptor(
        ChannelDescriptor::Prach {
            sub_channels: 0,
            signature_start: 0,
            signature_end: 15,
        },
    );
    vec![
        at(at_ms, device, InterlayerCommand::RadioLinkSetup { channel_id: 1, config: prach }),
        at(
            at_ms,
            device,
            InterlayerCommand::ConfigureTransportChannel {
                transport_id: 1,
                role: ChannelRole::Prach,
                channel_id: 1,
            },
        ),
        at(
            at_ms,
            device,
            InterlayerCommand::SendData {
                transport_id: 1,
                pdus: vec![payload.to_vec()],
            },
        ),
        at(at_ms, device, InterlayerCommand::PhysicalAccessRequest { request }),
    ]
}

#[test]
fn uplink_data_reaches_the_base_station() {
    let ue_code = 5000;
    let commands = vec![
        at(
            0.1,
            NODE_B,
            InterlayerCommand::RadioLinkSetup {
                channel_id: 1,
                config: dedicated(ChannelRole::Dpdch, LinkDirection::Downlink, SpreadFactor::SF128, CELL, ue_code)
                    .with_channelization_code(10),
            },
        ),
        at(
            0.1,
            2,
            InterlayerCommand::RadioLinkSetup {
                channel_id: 1,
                config: dedicated(ChannelRole::Dpdch, LinkDirection::Uplink, SpreadFactor::SF256, ue_code, CELL),
            },
        ),
        at(
            0.1,
            2,
            InterlayerCommand::RadioLinkSetup {
                channel_id: 2,
                config: dedicated(ChannelRole::Dpdch, LinkDirection::Downlink, SpreadFactor::SF128, CELL, CELL)
                    .with_channelization_code(10),
            },
        ),
        at(
            0.1,
            2,
            InterlayerCommand::ConfigureTransportChannel {
                transport_id: 7,
                role: ChannelRole::Dpdch,
                channel_id: 1,
            },
        ),
        at(
            2.0,
            2,
            InterlayerCommand::SendData {
                transport_id: 7,
                pdus: vec![b"first".to_vec(), b"second".to_vec()],
            },
        ),
    ];
    let summary = run(&scene(3, 10, vec![node_b(), ue(2, ue_code, 20.0, 0.0)], commands));

    let station = report(&summary, NODE_B);
    let pdus: Vec<&Vec<u8>> = station.upper_layer.delivered_pdus().collect();
    assert_eq!(pdus, vec![&b"first".to_vec(), &b"second".to_vec()]);
    assert_eq!(station.stats.bursts_in_error, 0);
    // Within one 10 ms transmission time interval of the request
    assert!(station.upper_layer.deliveries[0].at <= SimTime::from_millis(12));
    assert!(station.stats.signals_locked > 0);
    // The inner loop ran on the dedicated uplink
    assert!(station.stats.power_up_commands_issued + station.stats.power_down_commands_issued > 0);

    let handset = report(&summary, 2);
    assert!(handset.stats.signals_transmitted > 0);
    assert_eq!(handset.released.queued_pdus, 0);
}

#[test]
fn single_access_is_acknowledged_and_message_delivered() {
    let request = AccessRequest {
        asc_index: 0,
        sub_channels: 0,
        max_retry: 3,
        signature_start: 0,
        signature_end: 15,
    };
    let commands = access_commands(2, 1.0, CELL + 1, request, b"attach");
    let summary = run(&scene(7, 100, vec![node_b(), ue(2, 6000, 30.0, 0.0)], commands));

    let handset = report(&summary, 2);
    let confirms: Vec<AccessConfirm> = handset.upper_layer.access_confirms().collect();
    assert_eq!(confirms, vec![AccessConfirm::Ack]);
    assert_eq!(handset.stats.aich_ack, 1);
    assert!(handset.stats.preambles_sent >= 1);
    assert_eq!(handset.stats.access_failures, 0);

    let station = report(&summary, NODE_B);
    let delivered: Vec<&Vec<u8>> = station.upper_layer.delivered_pdus().collect();
    assert_eq!(delivered, vec![&b"attach".to_vec()]);
    assert!(station.upper_layer.deliveries.iter().all(|d| d.role == ChannelRole::Prach));
    assert_eq!(station.stats.preamble_collisions, 0);
}

#[test]
fn colliding_preambles_are_not_acknowledged() {
    // Same signature, same access slot, same distance
    let request = AccessRequest {
        asc_index: 0,
        sub_channels: 1 << 5,
        max_retry: 1,
        signature_start: 3,
        signature_end: 3,
    };
    let mut commands = access_commands(2, 0.0, CELL + 1, request.clone(), b"a");
    commands.extend(access_commands(3, 0.0, CELL + 1, request, b"b"));
    let devices = vec![node_b(), ue(2, 6000, 40.0, 0.0), ue(3, 6001, 0.0, 40.0)];
    let summary = run(&scene(11, 100, devices, commands));

    let station = report(&summary, NODE_B);
    assert!(station.stats.preamble_collisions >= 1);
    assert_eq!(station.upper_layer.delivered_pdus().count(), 0);

    for id in [2, 3] {
        let handset = report(&summary, id);
        assert_eq!(handset.stats.aich_ack, 0);
        assert_eq!(handset.stats.preambles_sent, 1);
        let confirms: Vec<AccessConfirm> = handset.upper_layer.access_confirms().collect();
        assert_eq!(confirms, vec![AccessConfirm::NoIndicatorResponse]);
        assert_eq!(handset.stats.access_failures, 1);
        // The payload never left the queue
        assert_eq!(handset.released.queued_pdus, 1);
    }
}

#[test]
fn cell_search_reports_measurements() {
    let commands = vec![at(50.0, 2, InterlayerCommand::MeasurementRequest)];
    let summary = run(&scene(5, 60, vec![node_b(), ue(2, 6000, 100.0, 0.0)], commands));

    let handset = report(&summary, 2);
    // Registration report, then the requested one
    assert_eq!(handset.upper_layer.measurements().count(), 4);
    assert!(handset.upper_layer.measurements().all(|(cell, _)| cell == CELL));
    assert_eq!(handset.stats.measurement_reports, 2);
}

#[test]
fn same_seed_gives_the_same_run() {
    let request = AccessRequest {
        asc_index: 0,
        sub_channels: 0,
        max_retry: 2,
        signature_start: 0,
        signature_end: 15,
    };
    let build = || {
        let mut commands = access_commands(2, 0.5, CELL + 1, request.clone(), b"x");
        commands.extend(access_commands(3, 0.5, CELL + 2, request.clone(), b"y"));
        let mut s = scene(42, 60, vec![node_b(), ue(2, 6000, 80.0, 10.0), ue(3, 6001, -50.0, 30.0)], commands);
        s.path_loss_parameters.shadowing_sigma = 4.0;
        s
    };
    let first = run(&build());
    let second = run(&build());
    assert_eq!(first.events_processed, second.events_processed);
    assert_eq!(
        serde_json::to_string(&first.devices).unwrap(),
        serde_json::to_string(&second.devices).unwrap()
    );
}
