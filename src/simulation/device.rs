//! Simulated devices.
//!
//! A [`Device`] is either a UE or a base station (NodeB). Both share the
//! receive path:
//!
//! 1. **Arrival**: the signal is locked (received) or kept as interference
//!    only. Bursts already on air are error-evaluated up to now, then the new
//!    signal joins the ledger and interference is recomputed.
//! 2. **Departure**: every received burst is evaluated one last time, the
//!    signal leaves the ledger and interference is recomputed again. Bursts
//!    addressed to this device are then measured, and delivered when they
//!    are not in error.
//!
//! The slot tick drives the transmit side: power-control aggregation, the
//! random-access procedure and burst construction from the channel inventory.
//! All logging is prefixed with `[device_id]`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::burst::{Burst, BurstBody, Propagation, Signal, SignalId, TransmittedSignal};
use super::command::{InterlayerCommand, Measurement, UpperLayerLog};
use super::error::SimError;
use super::error_model::{BerCurve, ErrorEvaluator};
use super::interference::InterferenceLedger;
use super::inventory::{
    CONTROL_SPREAD_FACTOR, ChannelConfig, ChannelDescriptor, ChannelInventory, ReceiverIdentity, SCRAMBLING_CODES_PER_CELL,
    primary_code_of,
};
use super::payload;
use super::peers::{AssociatedUe, CellStatus, LinkDefaults, PeerCellInfo};
use super::power_control::{PowerControlState, PowerDirection, TransmitPower, aggregate_active_set};
use super::random_access::{AccessConfirm, AccessPhase, AccessRequest, AichCollector, RachAction, RachTiming, RandomAccess};
use super::scheduler::{Entity, EntityId, Event, EventPayload, SimContext};
use super::signal_calculations::{cqi_from_ec_no, dbm_to_mw, mw_to_dbm};
use super::stats::{DeviceReport, LogTally, PhyStats, ReleasedResources};
use super::time::{PREAMBLE_DURATION, SLOT_DURATION, SYNC_BURST_DURATION, SimTime};
use super::types::{ChannelRole, DeviceId, DeviceKind, LinkDirection, SpreadFactor};

/// Primary scrambling codes per code group announced on the S-SCH.
const CODES_PER_GROUP: u32 = 8;

/// Transmit power range of one device class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerLimits {
    pub min_dbm: f64,
    pub max_dbm: f64,
}

impl PowerLimits {
    pub fn midpoint(&self) -> f64 {
        (self.min_dbm + self.max_dbm) / 2.0
    }
}

/// Resolved per-device constants. They never change after construction.
#[derive(Clone)]
pub struct DeviceParams {
    pub chip_rate: f64,
    pub noise_power_mw: f64,
    /// Received power a signal needs for the receiver to lock on it.
    pub lock_threshold_mw: f64,
    /// Reference threshold of the inner power-control loop (dBm).
    pub reference_threshold_db: f64,
    pub ue_power: PowerLimits,
    pub node_b_power: PowerLimits,
    pub uplink: LinkDefaults,
    pub downlink: LinkDefaults,
    pub rach: RachTiming,
    pub cqi_period: SimTime,
    pub measurement_period: SimTime,
    pub ber_curve: Arc<dyn BerCurve>,
}

struct UeState {
    scrambling_code: u32,
    cells: BTreeMap<u32, PeerCellInfo>,
    rach: RandomAccess,
    last_cqi: Option<SimTime>,
}

struct NodeBState {
    primary_scrambling_code: u32,
    code_group: u16,
    ues: BTreeMap<u32, AssociatedUe>,
    aich: AichCollector,
}

enum RoleState {
    Ue(UeState),
    NodeB(NodeBState),
}

/// One simulated UE or base station.
pub struct Device {
    id: DeviceId,
    role: RoleState,
    params: DeviceParams,
    inventory: ChannelInventory,
    ledger: InterferenceLedger,
    evaluator: ErrorEvaluator,
    /// Transmitters this receiver locked on. Locking latches.
    locked_sources: BTreeSet<DeviceId>,
    tx_power: TransmitPower,
    slot_index: u64,
    next_sequence: u64,
    stats: PhyStats,
    upper: UpperLayerLog,
}

impl Device {
    /// A UE transmitting its uplink with `scrambling_code`. It starts at the
    /// middle of its power range.
    pub fn user_equipment(id: DeviceId, scrambling_code: u32, params: DeviceParams) -> Self {
        let limits = params.ue_power;
        let role = RoleState::Ue(UeState {
            scrambling_code,
            cells: BTreeMap::new(),
            rach: RandomAccess::new(params.rach),
            last_cqi: None,
        });
        Self::new(id, role, TransmitPower::new(limits.midpoint(), limits.min_dbm, limits.max_dbm), ChannelInventory::new(id), params)
    }

    /// A base station serving the cell with `primary_scrambling_code`.
    ///
    /// The cell's common channels are configured right away and the station
    /// transmits at its maximum power.
    pub fn node_b(id: DeviceId, primary_scrambling_code: u32, params: DeviceParams) -> Result<Self, SimError> {
        let mut inventory = ChannelInventory::new(id);
        inventory.configure_cell_channels(primary_scrambling_code)?;
        let limits = params.node_b_power;
        let role = RoleState::NodeB(NodeBState {
            primary_scrambling_code,
            code_group: (primary_scrambling_code / SCRAMBLING_CODES_PER_CELL / CODES_PER_GROUP) as u16,
            ues: BTreeMap::new(),
            aich: AichCollector::new(),
        });
        Ok(Self::new(id, role, TransmitPower::new(limits.max_dbm, limits.min_dbm, limits.max_dbm), inventory, params))
    }

    fn new(id: DeviceId, role: RoleState, tx_power: TransmitPower, inventory: ChannelInventory, params: DeviceParams) -> Self {
        let evaluator = ErrorEvaluator::new(params.chip_rate, params.noise_power_mw, Arc::clone(&params.ber_curve));
        Device {
            id,
            role,
            params,
            inventory,
            ledger: InterferenceLedger::new(),
            evaluator,
            locked_sources: BTreeSet::new(),
            tx_power,
            slot_index: 0,
            next_sequence: 0,
            stats: PhyStats::default(),
            upper: UpperLayerLog::default(),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn kind(&self) -> DeviceKind {
        match self.role {
            RoleState::Ue(_) => DeviceKind::UserEquipment,
            RoleState::NodeB(_) => DeviceKind::NodeB,
        }
    }

    /// Uplink scrambling code of a UE, primary scrambling code of a base station.
    pub fn scrambling_code(&self) -> u32 {
        match &self.role {
            RoleState::Ue(ue) => ue.scrambling_code,
            RoleState::NodeB(cell) => cell.primary_scrambling_code,
        }
    }

    pub fn stats(&self) -> &PhyStats {
        &self.stats
    }

    pub fn upper_layer(&self) -> &UpperLayerLog {
        &self.upper
    }

    pub fn inventory(&self) -> &ChannelInventory {
        &self.inventory
    }

    pub fn ledger(&self) -> &InterferenceLedger {
        &self.ledger
    }

    pub fn tx_power_dbm(&self) -> f64 {
        self.tx_power.current_dbm()
    }

    pub fn slot_index(&self) -> u64 {
        self.slot_index
    }

    /// Cells known to a UE.
    pub fn cells(&self) -> Option<&BTreeMap<u32, PeerCellInfo>> {
        match &self.role {
            RoleState::Ue(ue) => Some(&ue.cells),
            RoleState::NodeB(_) => None,
        }
    }

    /// UEs with a dedicated link to a base station.
    pub fn associated_ues(&self) -> Option<&BTreeMap<u32, AssociatedUe>> {
        match &self.role {
            RoleState::Ue(_) => None,
            RoleState::NodeB(cell) => Some(&cell.ues),
        }
    }

    pub fn random_access(&self) -> Option<&RandomAccess> {
        match &self.role {
            RoleState::Ue(ue) => Some(&ue.rach),
            RoleState::NodeB(_) => None,
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// A signal reaches the antenna with total power `rx_power_mw`.
    pub fn on_signal_arrival(
        &mut self,
        tx: &TransmittedSignal,
        rx_power_mw: f64,
        propagation: Propagation,
        ctx: &mut SimContext,
    ) -> Result<SignalId, SimError> {
        let now = ctx.time();
        let received = self.lock(tx, rx_power_mw);

        // Bits received so far were received under the old interference level
        if !self.ledger.is_empty() {
            self.evaluator.evaluate_received(&mut self.ledger, now, ctx.rng());
        }

        let signal = Signal::on_arrival(tx, rx_power_mw, now, propagation);
        let id = signal.id;
        self.ledger.insert(self.id, signal, received)?;
        self.ledger.recompute();

        if received {
            self.stats.signals_locked += 1;
        } else {
            self.stats.signals_interference_only += 1;
        }
        log::trace!(
            "[{}] signal {}:{} arrived at {:.1} dBm ({})",
            self.id,
            id.source,
            id.sequence,
            mw_to_dbm(rx_power_mw),
            if received { "received" } else { "interference" }
        );
        Ok(id)
    }

    /// Decide whether to receive a signal from `tx.id.source`.
    ///
    /// A base station locks on any transmitter above the lock threshold; a
    /// UE additionally needs the signal to carry a synchronisation burst.
    fn lock(&mut self, tx: &TransmittedSignal, rx_power_mw: f64) -> bool {
        let source = tx.id.source;
        if self.locked_sources.contains(&source) {
            return true;
        }
        if rx_power_mw < self.params.lock_threshold_mw {
            return false;
        }
        let locks = match self.role {
            RoleState::Ue(_) => tx.bursts.iter().any(|b| b.role.is_synchronisation()),
            RoleState::NodeB(_) => true,
        };
        if locks {
            self.locked_sources.insert(source);
            log::debug!("[{}] locked on {} at {:.1} dBm", self.id, source, mw_to_dbm(rx_power_mw));
        }
        locks
    }

    /// The matching end of [`on_signal_arrival`](Self::on_signal_arrival).
    pub fn on_signal_departure(&mut self, id: SignalId, ctx: &mut SimContext) -> Result<(), SimError> {
        let now = ctx.time();
        self.evaluator.evaluate_received(&mut self.ledger, now, ctx.rng());

        let Some((signal, received)) = self.ledger.remove(id) else {
            log::warn!("[{}] departure of unknown signal {}:{}", self.id, id.source, id.sequence);
            return Ok(());
        };
        self.ledger.recompute();
        if !received {
            return Ok(());
        }

        // Total power on air while the signal was still there
        let io_mw = self.ledger.total_power_mw() + signal.rx_power_mw + self.evaluator.noise_power_mw();

        let mut delivered = false;
        let mut errored = false;
        for burst in &signal.bursts {
            if !self.is_burst_for_me(burst) {
                self.stats.bursts_not_for_me += 1;
                continue;
            }
            self.measure_burst(burst);
            if burst.in_error {
                self.stats.bursts_in_error += 1;
                errored = true;
                continue;
            }
            self.accept_burst(burst, io_mw, ctx)?;
            self.stats.bursts_delivered += 1;
            delivered = true;
        }

        if delivered {
            self.stats.signals_delivered += 1;
        }
        if errored {
            self.stats.signals_with_errors += 1;
            log::debug!("[{}] signal {}:{} received with errors", self.id, id.source, id.sequence);
        }
        Ok(())
    }

    fn is_burst_for_me(&self, burst: &Burst) -> bool {
        let identity = match &self.role {
            RoleState::Ue(ue) => ReceiverIdentity::Ue { cells: &ue.cells },
            RoleState::NodeB(cell) => ReceiverIdentity::NodeB {
                primary_scrambling_code: cell.primary_scrambling_code,
                ues: &cell.ues,
            },
        };
        self.inventory.is_burst_for_me(&identity, burst)
    }

    /// Measurements that hold whether or not the burst was decoded.
    fn measure_burst(&mut self, burst: &Burst) {
        let reference = self.params.reference_threshold_db;
        match (&mut self.role, &burst.body) {
            (RoleState::NodeB(cell), BurstBody::Preamble { signature, access_slot }) => {
                if cell.aich.record(*access_slot, *signature, burst.in_error) {
                    self.stats.preamble_collisions += 1;
                    log::debug!("[{}] preamble collision: signature {} access slot {}", self.id, signature, access_slot);
                }
            }
            (RoleState::NodeB(cell), BurstBody::Control { .. }) => {
                if let Some(ue) = cell.ues.get_mut(&burst.scrambling_code) {
                    run_inner_loop(&mut self.stats, &mut ue.uplink_pc, burst, reference);
                }
            }
            (RoleState::Ue(ue), BurstBody::Control { .. }) => {
                let primary = ue.cells.get_mut(&primary_code_of(burst.scrambling_code)).filter(|c| c.primary);
                if let Some(cell) = primary {
                    run_inner_loop(&mut self.stats, &mut cell.downlink_pc, burst, reference);
                }
            }
            _ => {}
        }
    }

    /// Act on a burst decoded without error.
    fn accept_burst(&mut self, burst: &Burst, io_mw: f64, ctx: &mut SimContext) -> Result<(), SimError> {
        let now = ctx.time();
        match &burst.body {
            BurstBody::Data(bytes) => {
                let pdus = payload::unpack(bytes)?;
                if !pdus.is_empty() {
                    self.stats.pdus_delivered += pdus.len() as u64;
                    log::debug!("[{}] {} PDUs delivered on {:?}", self.id, pdus.len(), burst.role);
                    self.upper.deliver(now, burst.role, pdus);
                }
            }
            BurstBody::Sync { code, cell_tag } => self.on_sync(burst.role, *code, *cell_tag, now),
            BurstBody::Pilot => self.on_pilot(burst, io_mw, now),
            BurstBody::AcquisitionIndicators { access_slot, indicators } => {
                let RoleState::Ue(ue) = &mut self.role else {
                    return Ok(());
                };
                let from_access_cell = self
                    .inventory
                    .find(ChannelRole::Prach, LinkDirection::Uplink)
                    .is_some_and(|e| primary_code_of(e.scrambling_code) == burst.scrambling_code);
                if !from_access_cell {
                    return Ok(());
                }
                let expected = ue
                    .rach
                    .state()
                    .filter(|s| s.access_slot == *access_slot && matches!(s.phase, AccessPhase::WaitingForIndicator { .. }))
                    .map(|s| indicators[s.signature as usize]);
                match expected {
                    Some(1) => self.stats.aich_ack += 1,
                    Some(-1) => self.stats.aich_nack += 1,
                    _ => {}
                }
                if let Some(action) = ue.rach.on_indicator(*access_slot, indicators, ctx.rng()) {
                    self.handle_rach_action(action, ctx)?;
                }
            }
            BurstBody::Control { tpc: Some(tpc) } => match &mut self.role {
                RoleState::Ue(ue) => match ue.cells.get_mut(&primary_code_of(burst.scrambling_code)) {
                    Some(cell) => {
                        cell.uplink_pc.receive_command(*tpc);
                    }
                    None => log::warn!("[{}] power command from unknown cell {}", self.id, burst.scrambling_code),
                },
                RoleState::NodeB(cell) => {
                    if let Some(ue) = cell.ues.get_mut(&burst.scrambling_code) {
                        let delta = tpc.signed_steps() as f64 * self.params.downlink.step_size_db;
                        let power = ue.downlink_power.apply_delta(delta);
                        self.stats.power_commands_applied += 1;
                        log::trace!("[{}] downlink to {} now {:.1} dBm", self.id, burst.scrambling_code, power);
                    }
                }
            },
            BurstBody::Cqi(cqi) => {
                if let RoleState::NodeB(cell) = &mut self.role {
                    if let Some(ue) = cell.ues.get_mut(&burst.scrambling_code) {
                        ue.cqi = Some(*cqi);
                    }
                }
            }
            BurstBody::Control { tpc: None } | BurstBody::Preamble { .. } | BurstBody::Empty => {}
        }
        Ok(())
    }

    /// Cell search on the synchronisation channels.
    fn on_sync(&mut self, role: ChannelRole, code: u16, cell_tag: u32, now: SimTime) {
        let RoleState::Ue(ue) = &mut self.role else {
            return;
        };
        let (uplink, downlink) = (self.params.uplink, self.params.downlink);
        match role {
            ChannelRole::Psch => {
                let cell = ue
                    .cells
                    .entry(cell_tag)
                    .or_insert_with(|| PeerCellInfo::new(cell_tag, &uplink, &downlink));
                if cell.on_psch(now, SLOT_DURATION) {
                    log::debug!("[{}] slot synchronised to cell {}", self.id, cell_tag);
                }
            }
            ChannelRole::Ssch => {
                if let Some(cell) = ue.cells.get_mut(&cell_tag) {
                    cell.code_group = Some(code);
                }
            }
            _ => {}
        }
    }

    /// Pilot measurement, registration and periodic measurement reports.
    fn on_pilot(&mut self, burst: &Burst, io_mw: f64, now: SimTime) {
        let RoleState::Ue(ue) = &mut self.role else {
            return;
        };
        let Some(cell) = ue.cells.get_mut(&burst.scrambling_code) else {
            return;
        };
        cell.rscp_dbm = mw_to_dbm(burst.power_mw);
        cell.ec_no_db = 10.0 * (burst.power_mw / io_mw).log10();

        let newly_registered = !cell.registered && cell.slot_synchronised && cell.code_group.is_some();
        if newly_registered {
            cell.registered = true;
            if cell.status == CellStatus::Detected {
                cell.status = CellStatus::Monitored;
            }
            log::info!(
                "[{}] registered cell {}: RSCP {:.1} dBm, Ec/No {:.1} dB",
                self.id,
                cell.primary_scrambling_code,
                cell.rscp_dbm,
                cell.ec_no_db
            );
        }
        if cell.registered && (newly_registered || cell.report_due(now, self.params.measurement_period)) {
            report_cell(&mut self.upper, &mut self.stats, cell, now);
        }
    }

    // ------------------------------------------------------------------
    // Transmit path
    // ------------------------------------------------------------------

    fn on_slot(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        if matches!(self.role, RoleState::Ue(_)) {
            self.ue_slot(ctx)?;
        } else {
            self.node_b_slot(ctx)?;
        }
        self.slot_index += 1;
        ctx.post_event(SLOT_DURATION, EntityId::Device(self.id), EventPayload::SlotTick)
    }

    fn ue_slot(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let RoleState::Ue(ue) = &mut self.role else {
            return Ok(());
        };
        let rach_action = ue.rach.on_slot(ctx.rng());
        let delta = aggregate_active_set(
            ue.cells.values_mut().filter(|c| c.is_active()).map(|c| &mut c.uplink_pc),
            self.params.uplink.step_size_db,
        );

        if let Some(delta) = delta {
            let power = self.tx_power.apply_delta(delta);
            self.stats.power_commands_applied += 1;
            log::trace!("[{}] uplink power {:+.1} dB, now {:.1} dBm", self.id, delta, power);
        }
        if let Some(action) = rach_action {
            self.handle_rach_action(action, ctx)?;
        }

        let bursts = self.ue_dedicated_bursts(ctx.time())?;
        if !bursts.is_empty() {
            let power = self.tx_power.current_dbm();
            self.transmit(bursts, SLOT_DURATION, power, ctx)?;
        }
        Ok(())
    }

    /// Uplink DPDCH/DPCCH and the periodic CQI report.
    ///
    /// The DPCCH goes out every slot while an uplink DPDCH is configured and
    /// carries the downlink command of the primary cell. The DPDCH only goes
    /// out with queued payload.
    fn ue_dedicated_bursts(&mut self, now: SimTime) -> Result<Vec<Burst>, SimError> {
        let end = now + SLOT_DURATION;
        let RoleState::Ue(ue) = &mut self.role else {
            return Ok(Vec::new());
        };
        let mut bursts = Vec::new();

        if let Some(entry) = self.inventory.find_mut(ChannelRole::Dpdch, LinkDirection::Uplink) {
            if !entry.tx_queue.is_empty() {
                let pdus = std::mem::take(&mut entry.tx_queue);
                bursts.push(entry.burst(BurstBody::Data(payload::pack(&pdus)?), now, end));
            }
            let tpc = ue.cells.values_mut().find(|c| c.primary).and_then(|c| c.downlink_pc.take_pending());
            bursts.push(entry.control_burst(BurstBody::Control { tpc }, now, end));
        }

        let cqi_due = ue.last_cqi.is_none_or(|last| now - last >= self.params.cqi_period);
        if let Some(entry) = self.inventory.find(ChannelRole::Hsdpcch, LinkDirection::Uplink) {
            if let Some(cell) = ue.cells.values().find(|c| c.primary).filter(|_| cqi_due) {
                let cqi = cqi_from_ec_no(cell.ec_no_db);
                bursts.push(entry.burst(BurstBody::Cqi(cqi), now, end));
                ue.last_cqi = Some(now);
            }
        }
        Ok(bursts)
    }

    /// Common channels, acquisition indicators and the dedicated downlinks.
    ///
    /// Each dedicated downlink is weighted by the power the station keeps for
    /// that UE relative to its own transmit power.
    fn node_b_slot(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let now = ctx.time();
        let end = now + SLOT_DURATION;
        let sync_end = now + SYNC_BURST_DURATION;
        let tx_dbm = self.tx_power.current_dbm();
        let RoleState::NodeB(cell) = &mut self.role else {
            return Ok(());
        };

        let mut bursts = Vec::new();
        for entry in self.inventory.entries_mut() {
            if entry.direction != LinkDirection::Downlink {
                continue;
            }
            match entry.role {
                ChannelRole::Psch => bursts.push(entry.burst(
                    BurstBody::Sync {
                        code: 0,
                        cell_tag: cell.primary_scrambling_code,
                    },
                    now,
                    sync_end,
                )),
                ChannelRole::Ssch => bursts.push(entry.burst(
                    BurstBody::Sync {
                        code: cell.code_group,
                        cell_tag: cell.primary_scrambling_code,
                    },
                    now,
                    sync_end,
                )),
                ChannelRole::Cpich => bursts.push(entry.burst(BurstBody::Pilot, now, end)),
                ChannelRole::Aich => {
                    if let Some((access_slot, indicators)) = cell.aich.next_indicators() {
                        bursts.push(entry.burst(BurstBody::AcquisitionIndicators { access_slot, indicators }, now, end));
                    }
                }
                ChannelRole::Dpdch => {
                    let Some(ue) = entry.peer_scrambling_code().and_then(|sc| cell.ues.get_mut(&sc)) else {
                        continue;
                    };
                    let weight = dbm_to_mw(ue.downlink_power.current_dbm() - tx_dbm);
                    if !entry.tx_queue.is_empty() {
                        let pdus = std::mem::take(&mut entry.tx_queue);
                        let data = entry.burst(BurstBody::Data(payload::pack(&pdus)?), now, end);
                        let gain = data.gain_factor * weight;
                        bursts.push(data.with_gain(gain));
                    }
                    let control = entry.control_burst(
                        BurstBody::Control {
                            tpc: ue.uplink_pc.take_pending(),
                        },
                        now,
                        end,
                    );
                    let gain = control.gain_factor * weight;
                    bursts.push(control.with_gain(gain));
                }
                _ if !entry.tx_queue.is_empty() => {
                    let pdus = std::mem::take(&mut entry.tx_queue);
                    bursts.push(entry.burst(BurstBody::Data(payload::pack(&pdus)?), now, end));
                }
                _ => {}
            }
        }

        if bursts.is_empty() {
            return Ok(());
        }
        self.transmit(bursts, SLOT_DURATION, tx_dbm, ctx)
    }

    fn handle_rach_action(&mut self, action: RachAction, ctx: &mut SimContext) -> Result<(), SimError> {
        let now = ctx.time();
        match action {
            RachAction::SendPreamble {
                signature,
                access_slot,
                power_dbm,
            } => {
                let entry = self.inventory.require(ChannelRole::Prach, LinkDirection::Uplink)?;
                let burst = Burst::new(
                    ChannelRole::Prach,
                    LinkDirection::Uplink,
                    SpreadFactor::SF256,
                    BurstBody::Preamble { signature, access_slot },
                )
                .with_codes(entry.scrambling_code, signature as u32)
                .with_window(now, now + PREAMBLE_DURATION);
                self.stats.preambles_sent += 1;
                log::debug!(
                    "[{}] preamble signature {} access slot {} at {:.1} dBm",
                    self.id,
                    signature,
                    access_slot,
                    power_dbm
                );
                self.transmit(vec![burst], PREAMBLE_DURATION, power_dbm, ctx)
            }
            RachAction::SendMessage { power_dbm } => {
                let device = self.id;
                let entry = self
                    .inventory
                    .find_mut(ChannelRole::Prach, LinkDirection::Uplink)
                    .ok_or(SimError::ChannelNotConfigured {
                        device,
                        role: ChannelRole::Prach,
                    })?;
                let pdus = std::mem::take(&mut entry.tx_queue);
                let burst = entry.burst(BurstBody::Data(payload::pack(&pdus)?), now, now + SLOT_DURATION);
                log::debug!("[{}] access message with {} PDUs at {:.1} dBm", self.id, pdus.len(), power_dbm);
                self.transmit(vec![burst], SLOT_DURATION, power_dbm, ctx)
            }
            RachAction::Confirm(confirm) => {
                if confirm == AccessConfirm::NoIndicatorResponse {
                    self.stats.access_failures += 1;
                }
                log::debug!("[{}] access confirm {:?}", self.id, confirm);
                self.upper.indicate(now, InterlayerCommand::PhysicalAccessConfirm { confirm });
                Ok(())
            }
        }
    }

    fn transmit(&mut self, bursts: Vec<Burst>, duration: SimTime, power_dbm: f64, ctx: &mut SimContext) -> Result<(), SimError> {
        let now = ctx.time();
        let id = SignalId {
            source: self.id,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        log::trace!("[{}] transmit {} bursts at {:.1} dBm", self.id, bursts.len(), power_dbm);
        let signal = TransmittedSignal {
            id,
            tx_power_dbm: power_dbm,
            start: now,
            end: now + duration,
            bursts,
        };
        self.stats.signals_transmitted += 1;
        ctx.post_immediate(EntityId::Air, EventPayload::Transmit { signal: Arc::new(signal) })
    }

    // ------------------------------------------------------------------
    // Upper-layer commands
    // ------------------------------------------------------------------

    pub fn on_command(&mut self, command: InterlayerCommand, ctx: &mut SimContext) -> Result<(), SimError> {
        let now = ctx.time();
        match command {
            InterlayerCommand::ConfigureTransportChannel {
                transport_id,
                role,
                channel_id,
            } => {
                self.inventory.map_transport(transport_id, role, channel_id);
                log::debug!("[{}] transport channel {} -> {:?} {}", self.id, transport_id, role, channel_id);
            }
            InterlayerCommand::ReleaseTransportChannel { transport_id } => {
                if !self.inventory.unmap_transport(transport_id) {
                    log::warn!("[{}] release of unknown transport channel {}", self.id, transport_id);
                }
            }
            InterlayerCommand::RadioLinkSetup { channel_id, config } => self.configure_link(channel_id, config, false)?,
            InterlayerCommand::RadioLinkModify { channel_id, config } => self.configure_link(channel_id, config, true)?,
            InterlayerCommand::RadioLinkRelease { channel_id, role } => self.release_link(channel_id, role),
            InterlayerCommand::PhysicalAccessRequest { request } => self.request_access(request, ctx)?,
            InterlayerCommand::MeasurementRequest => self.report_all(now),
            InterlayerCommand::SendData { transport_id, pdus } => {
                let count = pdus.len();
                let channel = self.inventory.enqueue(transport_id, pdus)?;
                log::trace!("[{}] {} PDUs queued on channel {}", self.id, count, channel);
            }
            other @ (InterlayerCommand::PhysicalAccessConfirm { .. } | InterlayerCommand::MeasurementIndication { .. }) => {
                log::warn!("[{}] ignoring upward command {:?}", self.id, other);
            }
        }
        Ok(())
    }

    /// Uplink gain of the dedicated channels, control channel included.
    fn uplink_dedicated_gain(&self) -> f64 {
        let data = self
            .inventory
            .gain_sum(LinkDirection::Uplink, &[ChannelRole::Dpdch, ChannelRole::Hsdpcch]);
        if data > 0.0 {
            data + CONTROL_SPREAD_FACTOR.gain_factor()
        } else {
            0.0
        }
    }

    fn configure_link(&mut self, channel_id: u32, config: ChannelConfig, modify: bool) -> Result<(), SimError> {
        let role = config.role;
        let direction = config.direction;
        let dedicated = match config.descriptor {
            ChannelDescriptor::Dedicated {
                peer_scrambling_code,
                primary,
            } => Some((peer_scrambling_code, primary)),
            _ => None,
        };

        let gain_before = self.uplink_dedicated_gain();
        let replaced = self.inventory.configure(channel_id, config)?;
        log::info!(
            "[{}] {} {:?} {:?} channel {}",
            self.id,
            if replaced { "reconfigured" } else { "configured" },
            direction,
            role,
            channel_id
        );

        let ue_uplink_data = matches!(self.role, RoleState::Ue(_)) && role == ChannelRole::Dpdch && direction == LinkDirection::Uplink;
        if replaced && ue_uplink_data {
            let gain_after = self.uplink_dedicated_gain();
            if gain_before > 0.0 && gain_after > 0.0 && gain_after != gain_before {
                let delta = 10.0 * (gain_after / gain_before).log10();
                let power = self.tx_power.apply_delta(delta);
                log::debug!("[{}] spreading factor change: power {:+.2} dB, now {:.1} dBm", self.id, delta, power);
            }
        }

        if let Some((peer, primary)) = dedicated {
            self.attach_peer(peer, primary, modify);
        }
        Ok(())
    }

    /// Bookkeeping for a dedicated link towards `peer`.
    fn attach_peer(&mut self, peer: u32, primary: bool, modify: bool) {
        let (uplink, downlink) = (self.params.uplink, self.params.downlink);
        match &mut self.role {
            RoleState::Ue(ue) => {
                let code = primary_code_of(peer);
                if primary {
                    for other in ue.cells.values_mut().filter(|c| c.primary_scrambling_code != code) {
                        other.primary = false;
                    }
                }
                let cell = ue.cells.entry(code).or_insert_with(|| PeerCellInfo::new(code, &uplink, &downlink));
                cell.status = CellStatus::Active;
                if primary && !cell.primary {
                    cell.primary = true;
                    cell.downlink_pc.after_cell_switch = modify;
                    log::info!("[{}] primary cell is now {}", self.id, code);
                }
            }
            RoleState::NodeB(cell) => {
                let initial_downlink = self.params.node_b_power.max_dbm;
                let ue = cell
                    .ues
                    .entry(peer)
                    .or_insert_with(|| AssociatedUe::new(peer, primary, &uplink, &downlink, initial_downlink));
                if primary && !ue.self_primary {
                    ue.self_primary = true;
                    ue.uplink_pc.after_cell_switch = modify;
                    log::info!("[{}] became primary cell of UE {}", self.id, peer);
                } else if !primary {
                    ue.self_primary = false;
                }
            }
        }
    }

    fn release_link(&mut self, channel_id: u32, role: ChannelRole) {
        let peer = self.inventory.entry(channel_id).and_then(|e| e.peer_scrambling_code());
        let Some(dropped) = self.inventory.release(role, channel_id) else {
            log::warn!("[{}] release of unknown {:?} channel {}", self.id, role, channel_id);
            return;
        };
        log::info!("[{}] released {:?} channel {} ({} queued PDUs dropped)", self.id, role, channel_id, dropped);

        let Some(peer) = peer else {
            return;
        };
        match &mut self.role {
            RoleState::Ue(ue) => {
                let code = primary_code_of(peer);
                let still_linked = self
                    .inventory
                    .entries()
                    .any(|e| e.peer_scrambling_code().map(primary_code_of) == Some(code));
                if let Some(cell) = ue.cells.get_mut(&code).filter(|_| !still_linked) {
                    cell.status = if cell.registered {
                        CellStatus::Monitored
                    } else {
                        CellStatus::Detected
                    };
                    cell.primary = false;
                    cell.uplink_pc.pending = None;
                    cell.downlink_pc.pending = None;
                }
            }
            RoleState::NodeB(cell) => {
                let still_linked = self.inventory.entries().any(|e| e.peer_scrambling_code() == Some(peer));
                if !still_linked && cell.ues.remove(&peer).is_some() {
                    log::debug!("[{}] UE {} no longer associated", self.id, peer);
                }
            }
        }
    }

    fn request_access(&mut self, mut request: AccessRequest, ctx: &mut SimContext) -> Result<(), SimError> {
        let RoleState::Ue(ue) = &mut self.role else {
            log::warn!("[{}] access request on a base station ignored", self.id);
            return Ok(());
        };
        let entry = self.inventory.require(ChannelRole::Prach, LinkDirection::Uplink)?;
        if let ChannelDescriptor::Prach { sub_channels, .. } = entry.descriptor {
            if request.sub_channels == 0 {
                request.sub_channels = sub_channels;
            }
        }
        if let Some(action) = ue.rach.start(request, self.slot_index, ctx.rng()) {
            self.handle_rach_action(action, ctx)?;
        }
        Ok(())
    }

    fn report_all(&mut self, now: SimTime) {
        let RoleState::Ue(ue) = &mut self.role else {
            log::warn!("[{}] measurement request on a base station ignored", self.id);
            return;
        };
        for cell in ue.cells.values_mut().filter(|c| c.registered) {
            report_cell(&mut self.upper, &mut self.stats, cell, now);
        }
    }

    // ------------------------------------------------------------------
    // End of run
    // ------------------------------------------------------------------

    /// Release every signal on air, the access attempt and queued payload.
    pub fn finalize(&mut self, now: SimTime) -> ReleasedResources {
        let random_access_states = match &mut self.role {
            RoleState::Ue(ue) => usize::from(ue.rach.release()),
            RoleState::NodeB(_) => 0,
        };
        let released = ReleasedResources {
            signals: self.ledger.clear(),
            random_access_states,
            queued_pdus: self.inventory.clear_queues(),
        };
        log::info!(
            "[{}] finalized at {}: {} signals, {} access attempts, {} queued PDUs released",
            self.id,
            now,
            released.signals,
            released.random_access_states,
            released.queued_pdus
        );
        released
    }

    pub fn into_report(self, released: ReleasedResources) -> DeviceReport {
        DeviceReport {
            id: self.id,
            kind: self.kind(),
            final_tx_power_dbm: self.tx_power.current_dbm(),
            stats: self.stats,
            released,
            upper_layer: self.upper,
            log: LogTally::default(),
        }
    }
}

impl Entity for Device {
    fn entity_id(&self) -> EntityId {
        EntityId::Device(self.id)
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::SlotTick => self.on_slot(ctx),
            EventPayload::SignalArrival {
                signal,
                rx_power_mw,
                propagation,
            } => self.on_signal_arrival(signal, *rx_power_mw, *propagation, ctx).map(|_| ()),
            EventPayload::SignalDeparture { id } => self.on_signal_departure(*id, ctx),
            EventPayload::Command(command) => self.on_command(command.clone(), ctx),
            EventPayload::Transmit { .. } => {
                log::warn!("[{}] transmit event delivered to a device", self.id);
                Ok(())
            }
        }
    }
}

fn run_inner_loop(stats: &mut PhyStats, pc: &mut PowerControlState, burst: &Burst, reference_threshold_db: f64) {
    let sir_db = mw_to_dbm(burst.sinr);
    let rx_dbm = mw_to_dbm(burst.power_mw);
    if let Some(command) = pc.inner_loop(sir_db, rx_dbm, burst.spread_factor, reference_threshold_db) {
        match command.direction {
            PowerDirection::Increase => stats.power_up_commands_issued += 1,
            PowerDirection::Decrease => stats.power_down_commands_issued += 1,
        }
    }
}

/// Send RSCP then Ec/No of `cell` upwards.
fn report_cell(upper: &mut UpperLayerLog, stats: &mut PhyStats, cell: &mut PeerCellInfo, now: SimTime) {
    for measurement in [Measurement::Rscp(cell.rscp_dbm), Measurement::EcNo(cell.ec_no_db)] {
        upper.indicate(now, InterlayerCommand::MeasurementIndication {
            primary_scrambling_code: cell.primary_scrambling_code,
            measurement,
        });
    }
    cell.last_report = Some(now);
    stats.measurement_reports += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::PhyConfig;
    use crate::simulation::inventory::CELL_CHANNEL_ID_BASE;
    use crate::simulation::peers::SLOT_SYNC_SLOTS;
    use crate::simulation::power_control::TpcCommand;
    use crate::simulation::types::{Coding, Modulation};

    const CELL: u32 = 16;
    const UE_CODE: u32 = 5000;

    fn params() -> DeviceParams {
        PhyConfig::default().device_params()
    }

    fn propagation(path_loss_db: f64) -> Propagation {
        Propagation {
            tx_power_dbm: 0.0,
            path_loss_db,
            delay: SimTime::ZERO,
        }
    }

    /// Run one slot tick and return the signal it put on air, if any.
    fn tick(device: &mut Device, ctx: &mut SimContext) -> Option<Arc<TransmittedSignal>> {
        let event = Event {
            id: crate::simulation::scheduler::EventId(0),
            time: ctx.time(),
            source: device.entity_id(),
            target: device.entity_id(),
            payload: EventPayload::SlotTick,
        };
        device.handle_event(&event, ctx).unwrap();
        ctx.take_pending_events().into_iter().find_map(|e| match e.payload {
            EventPayload::Transmit { signal } => Some(signal),
            _ => None,
        })
    }

    /// Deliver `signal` to `receiver` now and let it depart at its end.
    fn deliver(receiver: &mut Device, signal: &TransmittedSignal, rx_dbm: f64, ctx: &mut SimContext) {
        let start = ctx.time();
        let id = receiver.on_signal_arrival(signal, dbm_to_mw(rx_dbm), propagation(90.0), ctx).unwrap();
        ctx.set_time(start + signal.duration());
        receiver.on_signal_departure(id, ctx).unwrap();
    }

    fn ue_uplink() -> ChannelConfig {
        ChannelConfig::new(ChannelRole::Dpdch, LinkDirection::Uplink, SpreadFactor::SF64, UE_CODE)
            .with_mod_code(Modulation::Qpsk, Coding::Conv2)
            .with_descriptor(ChannelDescriptor::Dedicated {
                peer_scrambling_code: CELL,
                primary: true,
            })
    }

    fn ue_downlink() -> ChannelConfig {
        ChannelConfig::new(ChannelRole::Dpdch, LinkDirection::Downlink, SpreadFactor::SF128, CELL)
            .with_channelization_code(10)
            .with_descriptor(ChannelDescriptor::Dedicated {
                peer_scrambling_code: CELL,
                primary: true,
            })
    }

    fn node_b_downlink() -> ChannelConfig {
        node_b_link(CELL, true)
    }

    /// Dedicated downlink of the base station serving `cell` towards the UE.
    fn node_b_link(cell: u32, primary: bool) -> ChannelConfig {
        ChannelConfig::new(ChannelRole::Dpdch, LinkDirection::Downlink, SpreadFactor::SF128, cell)
            .with_channelization_code(10)
            .with_descriptor(ChannelDescriptor::Dedicated {
                peer_scrambling_code: UE_CODE,
                primary,
            })
    }

    /// UE side of the dedicated downlink from `cell`.
    fn ue_link(cell: u32, primary: bool) -> ChannelConfig {
        ChannelConfig::new(ChannelRole::Dpdch, LinkDirection::Downlink, SpreadFactor::SF128, cell)
            .with_channelization_code(10)
            .with_descriptor(ChannelDescriptor::Dedicated {
                peer_scrambling_code: cell,
                primary,
            })
    }

    fn setup(device: &mut Device, channel_id: u32, config: ChannelConfig, ctx: &mut SimContext) {
        device.on_command(InterlayerCommand::RadioLinkSetup { channel_id, config }, ctx).unwrap();
    }

    fn dedicated_to_pilot(signal: &TransmittedSignal) -> f64 {
        let gain = |role| signal.bursts.iter().find(|b| b.role == role).map(|b| b.gain_factor).unwrap();
        gain(ChannelRole::Dpcch) / gain(ChannelRole::Cpich)
    }

    fn downlink_power_towards_ue(node_b: &Device) -> f64 {
        node_b.associated_ues().unwrap()[&UE_CODE].downlink_power.current_dbm()
    }

    #[test]
    fn node_b_transmits_common_channels_every_slot() {
        let mut node_b = Device::node_b(DeviceId(1), CELL, params()).unwrap();
        let mut ctx = SimContext::new(1);
        let signal = tick(&mut node_b, &mut ctx).unwrap();
        let roles: Vec<ChannelRole> = signal.bursts.iter().map(|b| b.role).collect();
        assert_eq!(roles, vec![ChannelRole::Psch, ChannelRole::Ssch, ChannelRole::Cpich]);
        assert_eq!(signal.duration(), SLOT_DURATION);
        assert_eq!(signal.bursts[0].tx_end, SYNC_BURST_DURATION);
        assert_eq!(node_b.slot_index(), 1);
        assert_eq!(signal.tx_power_dbm, 30.0);
    }

    #[test]
    fn weak_or_unsynchronised_signals_are_interference_only() {
        let mut node_b = Device::node_b(DeviceId(1), CELL, params()).unwrap();
        let mut other_ue = Device::user_equipment(DeviceId(3), 7000, params());
        let mut ue = Device::user_equipment(DeviceId(2), UE_CODE, params());
        let mut ctx = SimContext::new(1);

        other_ue.on_command(InterlayerCommand::RadioLinkSetup { channel_id: 1, config: ue_uplink() }, &mut ctx).unwrap();
        let uplink = tick(&mut other_ue, &mut ctx).unwrap();
        // A UE never locks on another UE
        ue.on_signal_arrival(&uplink, dbm_to_mw(-60.0), propagation(60.0), &mut ctx).unwrap();
        assert_eq!(ue.stats().signals_interference_only, 1);

        // Far below the lock threshold
        let downlink = tick(&mut node_b, &mut ctx).unwrap();
        ue.on_signal_arrival(&downlink, dbm_to_mw(-150.0), propagation(180.0), &mut ctx).unwrap();
        assert_eq!(ue.stats().signals_interference_only, 2);
        assert_eq!(ue.stats().signals_locked, 0);
        assert_eq!(ue.ledger().interference_only().len(), 2);
    }

    #[test]
    fn cell_search_registers_and_reports_measurements() {
        let mut node_b = Device::node_b(DeviceId(1), CELL, params()).unwrap();
        let mut ue = Device::user_equipment(DeviceId(2), UE_CODE, params());
        let mut ctx = SimContext::new(3);

        for _ in 0..SLOT_SYNC_SLOTS {
            let slot_start = ctx.time();
            let signal = tick(&mut node_b, &mut ctx).unwrap();
            deliver(&mut ue, &signal, -70.0, &mut ctx);
            ctx.set_time(slot_start + SLOT_DURATION);
        }

        let cell = &ue.cells().unwrap()[&CELL];
        assert!(cell.slot_synchronised);
        assert_eq!(cell.code_group, Some(0));
        assert!(cell.registered);
        assert_eq!(cell.status, CellStatus::Monitored);
        // Pilot carries one third of the three-burst signal
        assert!((cell.rscp_dbm - (-70.0 - 10.0 * 3f64.log10())).abs() < 1e-6);
        assert!(cell.ec_no_db < 0.0);

        let measurements: Vec<Measurement> = ue.upper_layer().measurements().map(|(_, m)| m).collect();
        assert_eq!(measurements.len(), 2);
        assert!(matches!(measurements[0], Measurement::Rscp(_)));
        assert!(matches!(measurements[1], Measurement::EcNo(_)));
        assert_eq!(ue.stats().measurement_reports, 1);

        ue.on_command(InterlayerCommand::MeasurementRequest, &mut ctx).unwrap();
        assert_eq!(ue.upper_layer().measurements().count(), 4);
    }

    #[test]
    fn uplink_data_is_delivered_and_power_controlled() {
        let mut node_b = Device::node_b(DeviceId(1), CELL, params()).unwrap();
        let mut ue = Device::user_equipment(DeviceId(2), UE_CODE, params());
        let mut ctx = SimContext::new(5);

        ue.on_command(InterlayerCommand::RadioLinkSetup { channel_id: 1, config: ue_uplink() }, &mut ctx).unwrap();
        ue.on_command(
            InterlayerCommand::ConfigureTransportChannel {
                transport_id: 9,
                role: ChannelRole::Dpdch,
                channel_id: 1,
            },
            &mut ctx,
        )
        .unwrap();
        node_b.on_command(InterlayerCommand::RadioLinkSetup { channel_id: 1, config: node_b_downlink() }, &mut ctx).unwrap();
        ue.on_command(InterlayerCommand::RadioLinkSetup { channel_id: 2, config: ue_downlink() }, &mut ctx).unwrap();
        ue.on_command(
            InterlayerCommand::SendData {
                transport_id: 9,
                pdus: vec![b"hello".to_vec(), b"world".to_vec()],
            },
            &mut ctx,
        )
        .unwrap();

        let signal = tick(&mut ue, &mut ctx).unwrap();
        assert_eq!(signal.bursts.len(), 2);
        assert_eq!(signal.bursts[0].role, ChannelRole::Dpdch);
        assert_eq!(signal.bursts[1].role, ChannelRole::Dpcch);
        assert_eq!(ue.inventory().queued_pdus(), 0);

        deliver(&mut node_b, &signal, -80.0, &mut ctx);
        let pdus: Vec<&Vec<u8>> = node_b.upper_layer().delivered_pdus().collect();
        assert_eq!(pdus, vec![&b"hello".to_vec(), &b"world".to_vec()]);
        assert_eq!(node_b.stats().bursts_in_error, 0);
        // Strong and well above target: the station asks the UE to power down
        assert_eq!(node_b.stats().power_down_commands_issued, 1);

        let downlink = tick(&mut node_b, &mut ctx).unwrap();
        let control = downlink.bursts.iter().find(|b| b.role == ChannelRole::Dpcch).unwrap();
        assert_eq!(control.tpc().map(|c| c.direction), Some(PowerDirection::Decrease));

        let before = ue.tx_power_dbm();
        deliver(&mut ue, &downlink, -70.0, &mut ctx);
        tick(&mut ue, &mut ctx);
        assert!((ue.tx_power_dbm() - (before - 1.0)).abs() < 1e-9);
        assert_eq!(ue.stats().power_commands_applied, 1);
    }

    #[test]
    fn uplink_command_steers_downlink_power() {
        let mut node_b = Device::node_b(DeviceId(1), CELL, params()).unwrap();
        let mut ue = Device::user_equipment(DeviceId(2), UE_CODE, params());
        let mut ctx = SimContext::new(5);
        setup(&mut ue, 1, ue_uplink(), &mut ctx);
        setup(&mut ue, 2, ue_downlink(), &mut ctx);
        setup(&mut node_b, 1, node_b_downlink(), &mut ctx);
        assert_eq!(downlink_power_towards_ue(&node_b), 30.0);

        // Strong downlink: the UE's inner loop asks for less power
        let downlink = tick(&mut node_b, &mut ctx).unwrap();
        let weight_before = dedicated_to_pilot(&downlink);
        deliver(&mut ue, &downlink, -70.0, &mut ctx);
        assert_eq!(ue.stats().power_down_commands_issued, 1);

        let uplink = tick(&mut ue, &mut ctx).unwrap();
        let control = uplink.bursts.iter().find(|b| b.role == ChannelRole::Dpcch).unwrap();
        assert_eq!(control.tpc(), Some(TpcCommand::decrease(1)));

        deliver(&mut node_b, &uplink, -80.0, &mut ctx);
        assert_eq!(downlink_power_towards_ue(&node_b), 29.0);
        assert_eq!(node_b.stats().power_commands_applied, 1);

        // The next dedicated downlink is weighted down by 1 dB
        let next = tick(&mut node_b, &mut ctx).unwrap();
        assert!((dedicated_to_pilot(&next) / weight_before - dbm_to_mw(-1.0)).abs() < 1e-12);
    }

    #[test]
    fn primary_switch_steps_by_sir_distance() {
        let mut node_b = Device::node_b(DeviceId(1), CELL, params()).unwrap();
        let mut ue = Device::user_equipment(DeviceId(2), UE_CODE, params());
        let mut ctx = SimContext::new(5);
        setup(&mut ue, 1, ue_uplink(), &mut ctx);
        setup(&mut node_b, 1, node_b_link(CELL, false), &mut ctx);
        node_b
            .on_command(InterlayerCommand::RadioLinkModify { channel_id: 1, config: node_b_link(CELL, true) }, &mut ctx)
            .unwrap();
        let link = &node_b.associated_ues().unwrap()[&UE_CODE];
        assert!(link.self_primary);
        assert!(link.uplink_pc.after_cell_switch);

        // DPCCH alone at -80 dBm over a -121.09 dBm despread floor: SIR 41.09 dB, 34 dB over target
        let uplink = tick(&mut ue, &mut ctx).unwrap();
        assert_eq!(uplink.bursts.len(), 1);
        deliver(&mut node_b, &uplink, -80.0, &mut ctx);
        let link = &node_b.associated_ues().unwrap()[&UE_CODE];
        assert!(!link.uplink_pc.after_cell_switch);
        assert_eq!(link.uplink_pc.pending, Some(TpcCommand::decrease(34)));

        let downlink = tick(&mut node_b, &mut ctx).unwrap();
        let control = downlink.bursts.iter().find(|b| b.role == ChannelRole::Dpcch).unwrap();
        assert_eq!(control.tpc(), Some(TpcCommand::decrease(34)));

        // Back to single steps once the switch has been handled
        let uplink = tick(&mut ue, &mut ctx).unwrap();
        deliver(&mut node_b, &uplink, -80.0, &mut ctx);
        assert_eq!(node_b.associated_ues().unwrap()[&UE_CODE].uplink_pc.pending, Some(TpcCommand::decrease(1)));
    }

    #[test]
    fn cqi_reaches_the_serving_base_station() {
        let mut node_b = Device::node_b(DeviceId(1), CELL, params()).unwrap();
        let mut ue = Device::user_equipment(DeviceId(2), UE_CODE, params());
        let mut ctx = SimContext::new(5);
        setup(&mut ue, 1, ue_uplink(), &mut ctx);
        let hs_dpcch = ChannelConfig::new(ChannelRole::Hsdpcch, LinkDirection::Uplink, SpreadFactor::SF256, UE_CODE)
            .with_channelization_code(33);
        setup(&mut ue, 3, hs_dpcch, &mut ctx);

        // Pilot is one of three common bursts: Ec/No about -4.8 dB, CQI 5
        let common = tick(&mut node_b, &mut ctx).unwrap();
        assert_eq!(common.bursts.len(), 3);
        deliver(&mut ue, &common, -70.0, &mut ctx);
        setup(&mut node_b, 1, node_b_downlink(), &mut ctx);
        let ec_no = ue.cells().unwrap()[&CELL].ec_no_db;
        assert!((ec_no + 4.78).abs() < 0.01);

        let uplink = tick(&mut ue, &mut ctx).unwrap();
        let report = uplink.bursts.iter().find(|b| b.role == ChannelRole::Hsdpcch).unwrap();
        assert!(matches!(report.body, BurstBody::Cqi(5)));

        deliver(&mut node_b, &uplink, -80.0, &mut ctx);
        assert_eq!(node_b.associated_ues().unwrap()[&UE_CODE].cqi, Some(5));

        // Not due again within the report period
        let next = tick(&mut ue, &mut ctx).unwrap();
        assert!(next.bursts.iter().all(|b| b.role != ChannelRole::Hsdpcch));
    }

    #[test]
    fn active_set_commands_combine_into_one_step() {
        const OTHER_CELL: u32 = 32;
        let mut serving = Device::node_b(DeviceId(1), CELL, params()).unwrap();
        let mut other = Device::node_b(DeviceId(3), OTHER_CELL, params()).unwrap();
        let mut ue = Device::user_equipment(DeviceId(2), UE_CODE, params());
        let mut ctx = SimContext::new(9);
        setup(&mut ue, 1, ue_uplink(), &mut ctx);
        setup(&mut ue, 2, ue_link(CELL, true), &mut ctx);
        setup(&mut ue, 3, ue_link(OTHER_CELL, false), &mut ctx);
        setup(&mut serving, 1, node_b_link(CELL, true), &mut ctx);
        setup(&mut other, 1, node_b_link(OTHER_CELL, false), &mut ctx);
        assert!(ue.cells().unwrap().values().all(|c| c.is_active()));

        // One round: the UE transmits, both cells run their inner loop at the
        // given received powers, and their commands come back on the downlink.
        let mut round = |ue: &mut Device, serving_dbm: f64, other_dbm: f64, ctx: &mut SimContext| {
            let uplink = tick(ue, ctx).unwrap();
            deliver(&mut serving, &uplink, serving_dbm, ctx);
            deliver(&mut other, &uplink, other_dbm, ctx);
            let from_serving = tick(&mut serving, ctx).unwrap();
            let from_other = tick(&mut other, ctx).unwrap();
            deliver(ue, &from_serving, -70.0, ctx);
            deliver(ue, &from_other, -75.0, ctx);
        };

        // -80 dBm is well above target, -116 dBm (SIR about 5 dB) below it
        round(&mut ue, -80.0, -116.0, &mut ctx);
        let cells = ue.cells().unwrap();
        assert_eq!(cells[&CELL].uplink_pc.pending, Some(TpcCommand::decrease(1)));
        assert_eq!(cells[&OTHER_CELL].uplink_pc.pending, Some(TpcCommand::increase(1)));

        let start = ue.tx_power_dbm();
        // Mixed commands: the UE steps down
        round(&mut ue, -116.0, -116.0, &mut ctx);
        assert!((ue.tx_power_dbm() - (start - 1.0)).abs() < 1e-9);
        assert!(ue.cells().unwrap().values().all(|c| c.uplink_pc.pending == Some(TpcCommand::increase(1))));

        // Every cell asks for more: the UE steps up
        tick(&mut ue, &mut ctx);
        assert!((ue.tx_power_dbm() - start).abs() < 1e-9);
        assert!(ue.cells().unwrap().values().all(|c| c.uplink_pc.pending.is_none()));
        assert_eq!(ue.stats().power_commands_applied, 2);
    }

    #[test]
    fn spreading_factor_change_scales_uplink_power() {
        let mut ue = Device::user_equipment(DeviceId(2), UE_CODE, params());
        let mut ctx = SimContext::new(1);
        ue.on_command(InterlayerCommand::RadioLinkSetup { channel_id: 1, config: ue_uplink() }, &mut ctx).unwrap();
        let before = ue.tx_power_dbm();

        let mut config = ue_uplink();
        config.spread_factor = SpreadFactor::SF16;
        ue.on_command(InterlayerCommand::RadioLinkModify { channel_id: 1, config }, &mut ctx).unwrap();

        let control: f64 = 1.0 / 256.0;
        let expected = 10.0 * ((1.0 / 16.0 + control) / (1.0 / 64.0 + control)).log10();
        assert!((ue.tx_power_dbm() - before - expected).abs() < 1e-9);
        assert_eq!(ue.inventory().entry(1).map(|e| e.channelization_code), Some(4));
    }

    #[test]
    fn send_data_without_mapping_is_fatal() {
        let mut ue = Device::user_equipment(DeviceId(2), UE_CODE, params());
        let mut ctx = SimContext::new(1);
        let result = ue.on_command(
            InterlayerCommand::SendData {
                transport_id: 4,
                pdus: vec![vec![1]],
            },
            &mut ctx,
        );
        assert!(matches!(result, Err(SimError::UnknownTransportChannel { transport_id: 4, .. })));
    }

    #[test]
    fn access_request_without_prach_is_fatal() {
        let mut ue = Device::user_equipment(DeviceId(2), UE_CODE, params());
        let mut ctx = SimContext::new(1);
        let request = AccessRequest {
            asc_index: 0,
            sub_channels: 0,
            max_retry: 2,
            signature_start: 0,
            signature_end: 15,
        };
        let result = ue.on_command(InterlayerCommand::PhysicalAccessRequest { request }, &mut ctx);
        assert!(matches!(result, Err(SimError::ChannelNotConfigured { role: ChannelRole::Prach, .. })));
    }

    #[test]
    fn release_drops_association_and_queued_payload() {
        let mut node_b = Device::node_b(DeviceId(1), CELL, params()).unwrap();
        let mut ctx = SimContext::new(1);
        node_b.on_command(InterlayerCommand::RadioLinkSetup { channel_id: 1, config: node_b_downlink() }, &mut ctx).unwrap();
        assert!(node_b.associated_ues().unwrap().contains_key(&UE_CODE));

        node_b.on_command(
            InterlayerCommand::RadioLinkRelease {
                channel_id: 1,
                role: ChannelRole::Dpdch,
            },
            &mut ctx,
        )
        .unwrap();
        assert!(node_b.associated_ues().unwrap().is_empty());
        assert!(node_b.inventory().entry(1).is_none());
        // Cell channels stay
        assert!(node_b.inventory().entry(CELL_CHANNEL_ID_BASE).is_some());
    }

    #[test]
    fn finalize_releases_everything_in_flight() {
        let mut node_b = Device::node_b(DeviceId(1), CELL, params()).unwrap();
        let mut ue = Device::user_equipment(DeviceId(2), UE_CODE, params());
        let mut ctx = SimContext::new(1);

        let prach = ChannelConfig::new(ChannelRole::Prach, LinkDirection::Uplink, SpreadFactor::SF64, CELL);
        ue.on_command(InterlayerCommand::RadioLinkSetup { channel_id: 2, config: prach }, &mut ctx).unwrap();
        ue.on_command(
            InterlayerCommand::ConfigureTransportChannel {
                transport_id: 1,
                role: ChannelRole::Prach,
                channel_id: 2,
            },
            &mut ctx,
        )
        .unwrap();
        ue.on_command(
            InterlayerCommand::SendData {
                transport_id: 1,
                pdus: vec![vec![1, 2, 3]],
            },
            &mut ctx,
        )
        .unwrap();
        let request = AccessRequest {
            asc_index: 0,
            sub_channels: 0,
            max_retry: 3,
            signature_start: 0,
            signature_end: 15,
        };
        ue.on_command(InterlayerCommand::PhysicalAccessRequest { request }, &mut ctx).unwrap();
        assert!(ue.random_access().is_some_and(|ra| ra.is_active()));

        let signal = tick(&mut node_b, &mut ctx).unwrap();
        ue.on_signal_arrival(&signal, dbm_to_mw(-70.0), propagation(100.0), &mut ctx).unwrap();

        let released = ue.finalize(SimTime::from_millis(1));
        assert_eq!(released, ReleasedResources {
            signals: 1,
            random_access_states: 1,
            queued_pdus: 1,
        });
        assert!(ue.ledger().is_empty());
        assert!(!ue.random_access().is_some_and(|ra| ra.is_active()));

        let report = ue.into_report(released);
        assert_eq!(report.kind, DeviceKind::UserEquipment);
        assert_eq!(report.released.total(), 3);
    }
}
