//! # Cellular Data Handler
//!
//! Per-slot arbiter. Every external input (net requests, switches, SIM and
//! radio state, call state, modem responses, timers) lands here and is
//! mapped onto the holders, the connection machines and the in-call
//! machine.
//!
//! ```text
//!   request_net ──▶ ApnHolder ──▶ attempt_establish ──▶ ConnectionManager
//!                      ▲                                     │ effects
//!                      │        on_establish_complete ◀──────┤
//!                      └─ retry ◀ on_disconnect_complete ◀───┘
//! ```
//!
//! The handler never blocks and never sleeps. Delayed work is queued as
//! [`Scheduled`] timers that the owner drains with
//! [`CellularDataHandler::take_scheduled`] and feeds back through
//! [`CellularDataHandler::on_timer`]. Retry timers carry the holder's
//! generation; a newer request for the holder bumps it and the old timer
//! is dropped on arrival.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::apn::catalog::ApnCatalog;
use crate::apn::holder::NetRequest;
use crate::apn::manager::ApnManager;
use crate::apn::types::{ApnProfileState, ApnType, DisconnectReason, RadioTech};
use crate::config::DataConfig;
use crate::error::Result;
use crate::extension::Extension;
use crate::machine::{ConnectRequest, MachineEffect, MachineEvent, MachineId};
use crate::manager::{ConnectionManager, Output};
use crate::monitor::{DataFlowType, MonitorEvent, RecoveryAction, StallMonitor, TrafficSource};
use crate::net::{NetAgent, SupplierId};
use crate::props::PropertyStore;
use crate::radio::{
    NotificationKind, NullListener, RadioNotification, RadioResponse, RadioTransport, ReplyTo,
};
use crate::retry::{RetryScene, RetryTunables};
use crate::secondary::{
    CallState, IncallContext, SecondaryDataStateMachine, SecondaryEffect, SecondaryEvent,
    SecondaryState,
};

/// Delayed work requested by the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timer {
    /// (Re)try bringing up a role. Stale if the generation moved on.
    Establish { apn_type: ApnType, generation: u64 },
    EstablishAll,
    ConnectTimeout { machine: MachineId, flag: i32 },
    DisconnectTimeout { machine: MachineId, flag: i32 },
    /// Periodic monitor ticks. Stale once the monitor was restarted.
    StallCheck { generation: u64 },
    Statistics { generation: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scheduled {
    pub delay: Duration,
    pub timer: Timer,
}

/// External collaborators of one slot.
#[derive(Clone)]
pub struct Collaborators {
    pub radio: Arc<dyn RadioTransport>,
    pub net: Arc<dyn NetAgent>,
    pub extension: Extension,
    pub props: PropertyStore,
}

/// Switches and platform state the handler gates activation on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataSwitches {
    pub user_data_on: bool,
    pub user_roaming_on: bool,
    /// Network reports we are roaming.
    pub roaming_on: bool,
    pub radio_on: bool,
    pub sim_ready: bool,
    pub attached: bool,
    pub default_data_slot: i32,
}

impl Default for DataSwitches {
    fn default() -> Self {
        DataSwitches {
            user_data_on: true,
            user_roaming_on: false,
            roaming_on: false,
            radio_on: true,
            sim_ready: true,
            attached: true,
            default_data_slot: 0,
        }
    }
}

/// Dual-SIM facts feeding the in-call guard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotTopology {
    pub primary_slot: Option<i32>,
    pub primary_has_sim: bool,
    pub dsds_mode: u8,
    pub ims_registered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HolderSnapshot {
    pub apn_type: ApnType,
    pub state: ApnProfileState,
    pub enabled: bool,
    pub cid: Option<i32>,
}

/// Point-in-time view of a slot for other threads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotSnapshot {
    pub slot: i32,
    pub overall: ApnProfileState,
    pub holders: Vec<HolderSnapshot>,
    pub active_cids: Vec<i32>,
    pub flow: DataFlowType,
    pub physical_link_active: bool,
    pub secondary: SecondaryState,
    pub switches: DataSwitches,
}

pub struct CellularDataHandler {
    slot: i32,
    config: DataConfig,
    apns: ApnManager,
    connections: ConnectionManager,
    incall: SecondaryDataStateMachine,
    radio: Arc<dyn RadioTransport>,
    net: Arc<dyn NetAgent>,
    extension: Extension,
    props: PropertyStore,
    prop_subscriptions: Vec<u64>,
    reply: ReplyTo,
    suppliers: HashMap<ApnType, SupplierId>,
    switches: DataSwitches,
    topology: SlotTopology,
    radio_tech: RadioTech,
    call_state: CallState,
    physical_link_active: bool,
    scheduled: Vec<Scheduled>,
}

impl CellularDataHandler {
    pub fn new(slot: i32, config: DataConfig, catalog: ApnCatalog, collab: Collaborators) -> Self {
        let tunables = RetryTunables::new(&config.retry);
        let prop_subscriptions = tunables.watch(&collab.props);
        let apns = ApnManager::new(catalog, &config.retry, &tunables);
        let connections = ConnectionManager::new(slot, StallMonitor::new(config.monitor.clone()))
            .with_connect_timeout(config.timing.connect_timeout)
            .with_disconnect_timeout(config.timing.disconnect_timeout)
            .with_extension(collab.extension.clone());
        CellularDataHandler {
            slot,
            apns,
            connections,
            incall: SecondaryDataStateMachine::new(slot),
            radio: collab.radio,
            net: collab.net,
            extension: collab.extension,
            props: collab.props,
            prop_subscriptions,
            reply: Arc::new(NullListener),
            suppliers: HashMap::new(),
            switches: DataSwitches {
                default_data_slot: slot,
                ..DataSwitches::default()
            },
            topology: SlotTopology::default(),
            radio_tech: RadioTech::Unknown,
            call_state: CallState::Idle,
            physical_link_active: false,
            scheduled: Vec::new(),
            config,
        }
    }

    /// Routes modem replies and notifications to `reply` from now on.
    pub fn attach(&mut self, reply: ReplyTo) {
        self.radio
            .subscribe(NotificationKind::DataCallListChanged, reply.clone());
        self.radio
            .subscribe(NotificationKind::RadioConnected, reply.clone());
        self.reply = reply;
    }

    pub fn set_traffic_source(&mut self, source: Box<dyn TrafficSource>) {
        self.connections.set_traffic_source(source);
    }

    pub fn slot(&self) -> i32 {
        self.slot
    }

    pub fn apns(&self) -> &ApnManager {
        &self.apns
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn switches(&self) -> &DataSwitches {
        &self.switches
    }

    pub fn secondary_state(&self) -> SecondaryState {
        self.incall.state()
    }

    pub fn cellular_data_state(&self) -> ApnProfileState {
        self.apns.overall_default_state()
    }

    pub fn data_flow_type(&self) -> DataFlowType {
        self.connections.monitor().flow()
    }

    pub fn has_internet_capability(&self, cid: i32) -> bool {
        self.connections.has_internet_capability(cid)
    }

    /// Drains the timers requested since the last call.
    pub fn take_scheduled(&mut self) -> Vec<Scheduled> {
        std::mem::take(&mut self.scheduled)
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            slot: self.slot,
            overall: self.apns.overall_state(),
            holders: self
                .apns
                .holders()
                .iter()
                .map(|h| HolderSnapshot {
                    apn_type: h.apn_type(),
                    state: h.state(),
                    enabled: h.is_data_call_enabled(),
                    cid: h
                        .machine()
                        .and_then(|id| self.connections.machine(id))
                        .map(|m| m.cid())
                        .filter(|cid| *cid >= 0),
                })
                .collect(),
            active_cids: self.connections.active_cids(),
            flow: self.data_flow_type(),
            physical_link_active: self.physical_link_active,
            secondary: self.incall.state(),
            switches: self.switches.clone(),
        }
    }

    fn schedule(&mut self, delay: Duration, timer: Timer) {
        tracing::debug!(slot = self.slot, ?timer, delay_ms = delay.as_millis() as u64, "timer scheduled");
        self.scheduled.push(Scheduled { delay, timer });
    }

    // ─── Net Requests ───────────────────────────────────────────────────

    pub fn request_net(&mut self, request: NetRequest) -> Result<()> {
        let apn_type = self.apns.find_type_by_capability(request.capability)?;
        let Some(holder) = self.apns.find_holder_mut(apn_type) else {
            return Ok(());
        };
        if !holder.request_cellular_data(request) {
            return Ok(());
        }
        if holder.is_connectable() {
            self.attempt_establish(apn_type);
        }
        Ok(())
    }

    pub fn release_net(&mut self, request: &NetRequest) -> Result<()> {
        let apn_type = self.apns.find_type_by_capability(request.capability)?;
        let Some(holder) = self.apns.find_holder_mut(apn_type) else {
            return Ok(());
        };
        holder.release_cellular_data(request);
        if !holder.is_data_call_enabled() {
            let reason = if self.config.features.is_single_connection(self.radio_tech) {
                DisconnectReason::ChangeConnection
            } else {
                DisconnectReason::ClearConnection
            };
            self.clear_connection(apn_type, reason);
        }
        Ok(())
    }

    pub fn release_all_net_requests(&mut self) {
        for holder in self.apns.holders_mut() {
            holder.release_all_cellular_data();
        }
    }

    // ─── Establishment ──────────────────────────────────────────────────

    pub fn establish_all_if_connectable(&mut self) {
        let types: Vec<ApnType> = self.apns.holders().iter().map(|h| h.apn_type()).collect();
        for apn_type in types {
            let Some(holder) = self.apns.find_holder_mut(apn_type) else {
                continue;
            };
            if !holder.is_data_call_enabled() {
                continue;
            }
            if matches!(
                holder.state(),
                ApnProfileState::Failed | ApnProfileState::Retrying
            ) {
                // Restart the campaign rather than wait out a retry.
                holder.bump_generation();
                holder.set_state(ApnProfileState::Idle);
            }
            if holder.is_connectable() {
                self.attempt_establish(apn_type);
            }
        }
    }

    /// Runs the activation gates for `apn_type` and, if they pass, starts a
    /// connection. Returns whether an activation was issued.
    pub fn attempt_establish(&mut self, apn_type: ApnType) -> bool {
        if !self.check_data_slot(apn_type)
            || !self.check_attach_and_sim(apn_type)
            || !self.check_allowed(apn_type)
        {
            return false;
        }
        if !self.check_apn_state(apn_type) {
            return false;
        }
        self.establish_data_connection(apn_type)
    }

    fn check_data_slot(&self, apn_type: ApnType) -> bool {
        if apn_type.is_internet() && self.switches.default_data_slot != self.slot {
            tracing::debug!(
                slot = self.slot,
                default_data_slot = self.switches.default_data_slot,
                "not the default data slot"
            );
            return false;
        }
        true
    }

    fn check_attach_and_sim(&self, apn_type: ApnType) -> bool {
        if apn_type == ApnType::Emergency {
            return true;
        }
        let ok = self.switches.radio_on && self.switches.attached && self.switches.sim_ready;
        if !ok {
            tracing::debug!(slot = self.slot, %apn_type, switches = ?self.switches, "not attached or sim not ready");
        }
        ok
    }

    fn check_allowed(&self, apn_type: ApnType) -> bool {
        let roaming_blocked = self.switches.roaming_on && !self.switches.user_roaming_on;
        let mut allowed = if roaming_blocked {
            false
        } else {
            self.switches.user_data_on || apn_type == ApnType::Mms
        };
        if apn_type == ApnType::Emergency {
            allowed = true;
        }
        allowed = allowed
            && self
                .extension
                .is_apn_allowed_active(self.slot, apn_type, self.switches.roaming_on);
        if !allowed {
            tracing::debug!(slot = self.slot, %apn_type, roaming = self.switches.roaming_on, "activation not allowed");
            return false;
        }
        if self.is_restricted_mode() {
            tracing::debug!(slot = self.slot, %apn_type, "voice call blocks data on this rat");
            return false;
        }
        true
    }

    /// Circuit-switched call on a RAT that cannot carry data alongside it.
    fn is_restricted_mode(&self) -> bool {
        self.call_state.is_in_call() && self.radio_tech == RadioTech::Gsm
    }

    fn check_apn_state(&mut self, apn_type: ApnType) -> bool {
        let roaming = self.switches.roaming_on;
        let establish_delay = self.config.timing.establish_delay;
        let matched = self.apns.filter_matched(apn_type, roaming);
        let Some(holder) = self.apns.find_holder_mut(apn_type) else {
            return false;
        };
        match holder.state() {
            ApnProfileState::Disconnecting => {
                tracing::info!(slot = self.slot, %apn_type, "holder still disconnecting, retry later");
                let generation = holder.generation();
                self.schedule(
                    establish_delay,
                    Timer::Establish {
                        apn_type,
                        generation,
                    },
                );
                return false;
            }
            // Mid-campaign: keep the cursor where the last attempt left it.
            ApnProfileState::Retrying if !holder.retry().matched_apns().is_empty() => {
                return true;
            }
            ApnProfileState::Idle | ApnProfileState::Retrying | ApnProfileState::Failed => {}
            state => {
                tracing::debug!(slot = self.slot, %apn_type, ?state, "holder busy");
                return false;
            }
        }
        if matched.is_empty() {
            tracing::warn!(slot = self.slot, %apn_type, "no matching apn");
            return false;
        }
        let was_failed = holder.state() == ApnProfileState::Failed;
        holder.set_state(ApnProfileState::Idle);
        holder.retry_mut().set_matched_apns(matched);
        if was_failed && holder.retry().is_all_bad_apn() {
            tracing::info!(slot = self.slot, %apn_type, "every candidate is still bad");
            holder.set_state(ApnProfileState::Failed);
            return false;
        }
        true
    }

    fn establish_data_connection(&mut self, apn_type: ApnType) -> bool {
        let Some(holder) = self.apns.find_holder_mut(apn_type) else {
            return false;
        };
        let Some(apn) = holder.retry_mut().next_retry_apn_item() else {
            tracing::warn!(slot = self.slot, %apn_type, "no usable apn left");
            holder.set_state(ApnProfileState::Failed);
            return false;
        };

        if self.config.features.is_single_connection(self.radio_tech) {
            if self.apns.has_any_higher_priority_connection(apn_type) {
                tracing::info!(slot = self.slot, %apn_type, "higher priority connection holds the modem");
                self.set_holder_state(apn_type, ApnProfileState::Idle);
                return false;
            }
            let others = |states: &[ApnProfileState]| {
                self.apns
                    .holders()
                    .iter()
                    .any(|h| h.apn_type() != apn_type && states.contains(&h.state()))
            };
            if others(&[ApnProfileState::Connecting, ApnProfileState::Connected]) {
                tracing::info!(slot = self.slot, %apn_type, "single context rat, preempting");
                self.clear_all_connections(DisconnectReason::ChangeConnection);
                self.set_holder_state(apn_type, ApnProfileState::Idle);
                return false;
            }
            if others(&[ApnProfileState::Disconnecting]) {
                // The preempted context has not released the modem yet.
                let Some(holder) = self.apns.find_holder_mut(apn_type) else {
                    return false;
                };
                holder.set_state(ApnProfileState::Retrying);
                let generation = holder.bump_generation();
                self.schedule(
                    self.config.timing.establish_delay,
                    Timer::Establish {
                        apn_type,
                        generation,
                    },
                );
                return false;
            }
        }

        let bound: Vec<MachineId> = self
            .apns
            .holders()
            .iter()
            .filter_map(|h| h.machine())
            .collect();
        let machine = match self.connections.find_idle_machine(&bound) {
            Some(id) => id,
            None => self.connections.create_machine(),
        };
        let supplier = self.supplier_for(apn_type);
        let Some(holder) = self.apns.find_holder_mut(apn_type) else {
            return false;
        };
        holder.bind(machine, apn.clone());
        holder.set_state(ApnProfileState::Connecting);
        holder.bump_generation();

        tracing::info!(
            slot = self.slot,
            %apn_type,
            machine = %machine,
            profile = apn.attr.profile_id,
            radio_tech = ?self.radio_tech,
            "establishing data connection"
        );
        let request = ConnectRequest {
            apn,
            apn_type,
            capability: apn_type.capability(),
            supplier,
            radio_tech: self.radio_tech,
            roaming: self.switches.roaming_on,
            allow_roaming: self.switches.user_roaming_on,
        };
        let out = self.connections.dispatch(machine, MachineEvent::Connect(request));
        self.process(out);
        true
    }

    fn supplier_for(&mut self, apn_type: ApnType) -> SupplierId {
        let net = &self.net;
        let slot = self.slot;
        *self
            .suppliers
            .entry(apn_type)
            .or_insert_with(|| net.register_supplier(slot, apn_type.capability()))
    }

    fn set_holder_state(&mut self, apn_type: ApnType, state: ApnProfileState) {
        if let Some(holder) = self.apns.find_holder_mut(apn_type) {
            holder.set_state(state);
        }
    }

    // ─── Teardown ───────────────────────────────────────────────────────

    pub fn clear_connection(&mut self, apn_type: ApnType, reason: DisconnectReason) {
        let Some(holder) = self.apns.find_holder_mut(apn_type) else {
            return;
        };
        holder.bump_generation();
        let Some(machine) = holder.unbind() else {
            if matches!(
                holder.state(),
                ApnProfileState::Retrying | ApnProfileState::Failed
            ) {
                holder.set_state(ApnProfileState::Idle);
            }
            return;
        };
        let idle = self.connections.machine(machine).is_none_or(|m| m.is_idle());
        let Some(holder) = self.apns.find_holder_mut(apn_type) else {
            return;
        };
        if idle {
            holder.set_state(ApnProfileState::Idle);
            return;
        }
        tracing::info!(slot = self.slot, %apn_type, machine = %machine, ?reason, "clearing connection");
        holder.set_state(ApnProfileState::Disconnecting);
        let out = self
            .connections
            .dispatch(machine, MachineEvent::Disconnect { reason });
        self.process(out);
    }

    pub fn clear_all_connections(&mut self, reason: DisconnectReason) {
        let types: Vec<ApnType> = self.apns.holders().iter().map(|h| h.apn_type()).collect();
        for apn_type in types {
            self.clear_connection(apn_type, reason);
        }
        self.connections.stop_stall_detection();
        self.end_statistics();
    }

    // ─── Machine Effects ────────────────────────────────────────────────

    fn process(&mut self, outputs: Vec<Output>) {
        for (machine, effect) in outputs {
            match effect {
                MachineEffect::Activate(request) => {
                    self.radio.activate(request, self.reply.clone());
                }
                MachineEffect::Deactivate(request) => {
                    self.radio.deactivate(request, self.reply.clone());
                }
                MachineEffect::ScheduleTimeout { flag, delay } => {
                    self.schedule(delay, Timer::ConnectTimeout { machine, flag });
                }
                MachineEffect::ScheduleDisconnectTimeout { flag, delay } => {
                    self.schedule(delay, Timer::DisconnectTimeout { machine, flag });
                }
                MachineEffect::ConnectComplete { apn_type, cid } => {
                    self.on_establish_complete(machine, apn_type, cid);
                }
                MachineEffect::DisconnectComplete {
                    apn_type,
                    reason,
                    scene,
                    suggested,
                } => self.on_disconnect_complete(machine, apn_type, reason, scene, suggested),
                MachineEffect::PublishSupplier { supplier, info } => {
                    self.net.publish_supplier_info(supplier, &info);
                }
                MachineEffect::PublishLink { supplier, info } => {
                    self.net.publish_link_info(supplier, &info);
                }
                // Consumed by the connection manager.
                MachineEffect::RegisterCid(_) | MachineEffect::UnregisterCid(_) => {}
            }
        }
    }

    pub fn on_establish_complete(&mut self, machine: MachineId, apn_type: ApnType, cid: i32) {
        let Some(holder) = self.apns.find_holder_mut(apn_type) else {
            tracing::warn!(slot = self.slot, %apn_type, "completion for unknown role");
            return;
        };
        if holder.machine() != Some(machine) {
            tracing::debug!(slot = self.slot, %apn_type, machine = %machine, "completion for released binding");
            return;
        }
        holder.set_state(ApnProfileState::Connected);
        holder.retry_mut().restart_retry_count();
        tracing::info!(slot = self.slot, %apn_type, cid, "data connection established");

        self.start_monitoring();
        self.update_physical_link();
        self.drive_incall(SecondaryEvent::DataConnected);
    }

    pub fn on_disconnect_complete(
        &mut self,
        machine: MachineId,
        apn_type: ApnType,
        reason: DisconnectReason,
        scene: RetryScene,
        suggested: Option<Duration>,
    ) {
        tracing::info!(slot = self.slot, %apn_type, machine = %machine, ?reason, "disconnect complete");
        let still_busy = self
            .connections
            .machine(machine)
            .is_some_and(|m| !m.is_idle());
        let Some(holder) = self.apns.find_holder_mut(apn_type) else {
            return;
        };
        match holder.machine() {
            Some(bound) if bound != machine => {
                tracing::debug!(slot = self.slot, %apn_type, "holder already moved to another machine");
            }
            Some(_) if still_busy => {
                // A queued connect brought the machine straight back up.
                holder.set_state(ApnProfileState::Connecting);
            }
            Some(_) => {
                holder.unbind();
                let failed_apn = holder.apn_item().cloned();
                if reason.marks_bad() {
                    if let Some(apn) = &failed_apn {
                        holder.retry().mark_bad_apn(apn);
                    }
                }
                self.after_modem_teardown(apn_type, reason, scene, suggested);
            }
            None => {
                // Teardown we asked for.
                holder.set_state(ApnProfileState::Idle);
                if holder.is_data_call_enabled() && reason == DisconnectReason::RetryConnection {
                    self.schedule_retry(apn_type, reason, RetryScene::SetupFail, None);
                }
            }
        }

        self.update_physical_link();
        if !self.apns.has_any_connected_state() {
            self.connections.stop_stall_detection();
            self.end_statistics();
            self.drive_incall(SecondaryEvent::DataDisconnected);
        }
        if reason == DisconnectReason::ChangeConnection {
            self.handle_sort_connection();
        }
    }

    /// Decides what a role does after the modem ended (or refused) its
    /// context.
    fn after_modem_teardown(
        &mut self,
        apn_type: ApnType,
        reason: DisconnectReason,
        scene: RetryScene,
        suggested: Option<Duration>,
    ) {
        let Some(holder) = self.apns.find_holder_mut(apn_type) else {
            return;
        };
        if !holder.is_data_call_enabled() {
            holder.set_state(ApnProfileState::Idle);
            return;
        }
        match reason {
            DisconnectReason::RetryConnection
            | DisconnectReason::ClearConnection
            | DisconnectReason::PermanentReject => {
                if holder.retry().is_all_bad_apn() {
                    tracing::warn!(slot = self.slot, %apn_type, ?reason, "all candidates bad, giving up");
                    holder.set_state(ApnProfileState::Failed);
                    return;
                }
                self.schedule_retry(apn_type, reason, scene, suggested);
            }
            _ => holder.set_state(ApnProfileState::Idle),
        }
    }

    fn schedule_retry(
        &mut self,
        apn_type: ApnType,
        reason: DisconnectReason,
        scene: RetryScene,
        suggested: Option<Duration>,
    ) {
        let extension = self.extension.clone();
        let Some(holder) = self.apns.find_holder_mut(apn_type) else {
            return;
        };
        let delay = holder
            .retry_mut()
            .next_retry_delay(apn_type, reason, suggested, scene, &extension);
        holder.set_state(ApnProfileState::Retrying);
        let generation = holder.bump_generation();
        tracing::info!(
            slot = self.slot,
            %apn_type,
            ?reason,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        self.schedule(
            delay,
            Timer::Establish {
                apn_type,
                generation,
            },
        );
    }

    /// After a preemption completes, hand the modem to the highest
    /// priority role still wanting it.
    fn handle_sort_connection(&mut self) {
        if !matches!(
            self.apns.overall_state(),
            ApnProfileState::Idle | ApnProfileState::Failed
        ) {
            return;
        }
        let next = self
            .apns
            .holders()
            .iter()
            .find(|h| h.is_data_call_enabled())
            .map(|h| h.apn_type());
        if let Some(apn_type) = next {
            self.schedule_retry(
                apn_type,
                DisconnectReason::ChangeConnection,
                RetryScene::SetupFail,
                None,
            );
        }
    }

    fn update_physical_link(&mut self) {
        let active = !self.connections.is_active_connections_empty();
        if active != self.physical_link_active {
            self.physical_link_active = active;
            tracing::info!(slot = self.slot, active, "physical link state");
        }
    }

    fn end_statistics(&mut self) {
        if let Some(event) = self.connections.end_net_statistics() {
            self.on_monitor_event(event);
        }
    }

    // ─── Timers ─────────────────────────────────────────────────────────

    pub fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Establish {
                apn_type,
                generation,
            } => {
                let Some(holder) = self.apns.find_holder_mut(apn_type) else {
                    return;
                };
                if holder.generation() != generation {
                    tracing::debug!(slot = self.slot, %apn_type, "stale establish timer ignored");
                    return;
                }
                if holder.is_data_call_enabled() {
                    self.attempt_establish(apn_type);
                } else {
                    self.clear_connection(apn_type, DisconnectReason::ClearConnection);
                }
            }
            Timer::EstablishAll => self.establish_all_if_connectable(),
            Timer::ConnectTimeout { machine, flag } => {
                let out = self
                    .connections
                    .dispatch(machine, MachineEvent::ConnectTimeout { flag });
                self.process(out);
            }
            Timer::DisconnectTimeout { machine, flag } => {
                let out = self
                    .connections
                    .dispatch(machine, MachineEvent::DisconnectTimeout { flag });
                self.process(out);
            }
            Timer::StallCheck { generation } => {
                let monitor = self.connections.monitor();
                if !monitor.is_stall_detection_active() || monitor.stall_generation() != generation {
                    return;
                }
                if let Some(event) = self.connections.stall_tick() {
                    self.on_monitor_event(event);
                }
                // Recovery may have restarted detection under a new generation.
                let monitor = self.connections.monitor();
                if monitor.is_stall_detection_active() && monitor.stall_generation() == generation {
                    self.schedule(self.config.monitor.stall_period, Timer::StallCheck { generation });
                }
            }
            Timer::Statistics { generation } => {
                let monitor = self.connections.monitor();
                if !monitor.is_statistics_active() || monitor.statistics_generation() != generation {
                    return;
                }
                if let Some(event) = self.connections.statistics_tick() {
                    self.on_monitor_event(event);
                }
                self.schedule(
                    self.config.monitor.statistics_period,
                    Timer::Statistics { generation },
                );
            }
        }
    }

    /// Starts whichever monitor is idle and schedules its first tick.
    fn start_monitoring(&mut self) {
        if self.connections.start_stall_detection() {
            let generation = self.connections.monitor().stall_generation();
            self.schedule(self.config.monitor.stall_period, Timer::StallCheck { generation });
        }
        if self.connections.begin_net_statistics() {
            let generation = self.connections.monitor().statistics_generation();
            self.schedule(
                self.config.monitor.statistics_period,
                Timer::Statistics { generation },
            );
        }
    }

    fn on_monitor_event(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::DataFlowChanged(flow) => {
                tracing::debug!(slot = self.slot, ?flow, "data flow changed");
            }
            MonitorEvent::Recovery(action) => {
                tracing::warn!(slot = self.slot, ?action, "running stall recovery");
                match action {
                    RecoveryAction::RequestContextList => {
                        self.radio.request_data_call_list(self.slot, self.reply.clone());
                    }
                    RecoveryAction::CleanupConnections => {
                        self.clear_all_connections(DisconnectReason::RetryConnection);
                    }
                    RecoveryAction::ReregisterNetwork => self.radio.reregister_network(self.slot),
                    RecoveryAction::RadioRestart => self.radio.restart_radio(self.slot),
                }
            }
        }
    }

    // ─── Radio ──────────────────────────────────────────────────────────

    pub fn on_radio_response(&mut self, response: RadioResponse) {
        let out = match response {
            RadioResponse::SetupDataCall { machine, result } => self
                .connections
                .dispatch(machine, MachineEvent::SetupDataCall(result)),
            RadioResponse::DeactivateDataCall { machine, info } => self
                .connections
                .dispatch(machine, MachineEvent::DeactivateDataCall(info)),
        };
        self.process(out);
    }

    pub fn on_radio_notification(&mut self, notification: RadioNotification) {
        match notification {
            RadioNotification::DataCallListChanged(list) => {
                let out = self.connections.on_data_call_list_changed(&list);
                self.process(out);
            }
            RadioNotification::RadioConnected => self.connections.on_radio_connected(),
        }
    }

    // ─── Switches And Platform State ────────────────────────────────────

    pub fn set_user_data_enabled(&mut self, enabled: bool) {
        if self.switches.user_data_on == enabled {
            return;
        }
        self.switches.user_data_on = enabled;
        tracing::info!(slot = self.slot, enabled, "user data switch");
        if enabled {
            self.establish_all_if_connectable();
        } else {
            self.clear_all_connections(DisconnectReason::ClearConnection);
        }
    }

    pub fn set_user_roaming_enabled(&mut self, enabled: bool) {
        if self.switches.user_roaming_on == enabled {
            return;
        }
        self.switches.user_roaming_on = enabled;
        tracing::info!(slot = self.slot, enabled, "user roaming switch");
        if !self.switches.roaming_on {
            return;
        }
        if enabled {
            self.establish_all_if_connectable();
        } else {
            self.clear_all_connections(DisconnectReason::ClearConnection);
        }
    }

    pub fn on_roaming_changed(&mut self, roaming: bool) {
        if self.switches.roaming_on == roaming {
            return;
        }
        self.switches.roaming_on = roaming;
        tracing::info!(slot = self.slot, roaming, "network roaming changed");
        self.apns.clear_all_bad();
        let event = if roaming {
            MachineEvent::RoamOn
        } else {
            MachineEvent::RoamOff
        };
        let out = self.connections.broadcast(event);
        self.process(out);
        if roaming && !self.switches.user_roaming_on {
            self.clear_all_connections(DisconnectReason::ClearConnection);
        } else {
            self.establish_all_if_connectable();
        }
    }

    pub fn on_sim_state_changed(&mut self, ready: bool) {
        self.switches.sim_ready = ready;
        self.apns.clear_all_bad();
        tracing::info!(slot = self.slot, ready, "sim state changed");
        if ready {
            self.establish_all_if_connectable();
        } else {
            self.clear_all_connections(DisconnectReason::ClearConnection);
        }
    }

    /// New carrier profiles: every campaign restarts against the reloaded
    /// catalog once current contexts are down.
    pub fn on_apn_changed(&mut self, catalog: ApnCatalog) {
        tracing::info!(slot = self.slot, profiles = catalog.len(), "apn catalog changed");
        self.apns.set_catalog(catalog);
        if matches!(
            self.apns.overall_state(),
            ApnProfileState::Connecting | ApnProfileState::Connected
        ) {
            self.clear_all_connections(DisconnectReason::RetryConnection);
        }
        self.schedule(self.config.timing.establish_delay, Timer::EstablishAll);
    }

    pub fn on_radio_state_changed(&mut self, on: bool) {
        self.switches.radio_on = on;
        tracing::info!(slot = self.slot, on, "radio power changed");
        if on {
            self.establish_all_if_connectable();
        } else if self.apns.overall_state() != ApnProfileState::Idle {
            self.clear_all_connections(DisconnectReason::ClearConnection);
        }
    }

    pub fn on_ps_attach_changed(&mut self, attached: bool) {
        self.switches.attached = attached;
        tracing::info!(slot = self.slot, attached, "packet service attach changed");
        if attached {
            self.establish_all_if_connectable();
        } else {
            self.clear_all_connections(DisconnectReason::ClearConnection);
        }
    }

    pub fn on_ps_rat_changed(&mut self, radio_tech: RadioTech) {
        if self.radio_tech == radio_tech {
            return;
        }
        tracing::info!(slot = self.slot, from = ?self.radio_tech, to = ?radio_tech, "packet rat changed");
        self.radio_tech = radio_tech;
        let out = self.connections.update_radio_tech(radio_tech);
        self.process(out);
        self.drive_incall(SecondaryEvent::RatChanged);
        if self.switches.user_data_on && self.switches.attached {
            self.establish_all_if_connectable();
        }
    }

    pub fn set_default_data_slot(&mut self, default_data_slot: i32) {
        if self.switches.default_data_slot == default_data_slot {
            return;
        }
        self.switches.default_data_slot = default_data_slot;
        tracing::info!(slot = self.slot, default_data_slot, "default data slot changed");
        if default_data_slot == self.slot {
            self.establish_all_if_connectable();
        } else {
            self.clear_all_connections(DisconnectReason::ClearConnection);
        }
    }

    pub fn set_topology(&mut self, topology: SlotTopology) {
        let dsds_changed = topology.dsds_mode != self.topology.dsds_mode;
        self.topology = topology;
        if dsds_changed {
            self.drive_incall(SecondaryEvent::DsdsChanged);
        }
    }

    pub fn set_incall_switch(&mut self, on: bool) {
        if self.config.features.in_call_switch == on {
            return;
        }
        self.config.features.in_call_switch = on;
        let event = if on {
            SecondaryEvent::SettingsOn
        } else {
            SecondaryEvent::SettingsOff
        };
        self.drive_incall(event);
    }

    pub fn on_call_state_changed(&mut self, state: CallState) {
        if self.call_state == state {
            return;
        }
        let prev = self.call_state;
        self.call_state = state;
        tracing::info!(slot = self.slot, from = ?prev, to = ?state, "call state changed");

        if state.is_in_call() != prev.is_in_call() {
            let event = if state.is_in_call() {
                MachineEvent::VoiceCallStarted
            } else {
                MachineEvent::VoiceCallEnded
            };
            let out = self.connections.broadcast(event);
            self.process(out);
        }

        if self.topology.ims_registered {
            match state {
                CallState::Dialing | CallState::Incoming => {
                    self.drive_incall(SecondaryEvent::CallStarted)
                }
                CallState::Idle | CallState::Disconnected => {
                    self.drive_incall(SecondaryEvent::CallEnded)
                }
                _ => {}
            }
            return;
        }

        let gsm = self.radio_tech == RadioTech::Gsm;
        let connected = self.apns.has_any_connected_state();
        if state.is_in_call() {
            if connected && gsm {
                self.end_statistics();
                if let Some(event) = self.connections.set_dormant(true) {
                    self.on_monitor_event(event);
                }
                self.connections.stop_stall_detection();
            }
        } else {
            if connected && gsm {
                if let Some(event) = self.connections.set_dormant(false) {
                    self.on_monitor_event(event);
                }
                self.start_monitoring();
            }
            self.establish_all_if_connectable();
        }
    }

    // ─── In-call Data ───────────────────────────────────────────────────

    fn incall_context(&self) -> IncallContext {
        IncallContext {
            in_call_switch: self.config.features.in_call_switch,
            slot: self.slot,
            primary_slot: self.topology.primary_slot,
            default_data_slot: self.switches.default_data_slot,
            primary_has_sim: self.topology.primary_has_sim,
            dsds_mode: self.topology.dsds_mode,
            ims_registered: self.topology.ims_registered,
            call_state: self.call_state,
            radio_tech: self.radio_tech,
            has_connected: self.apns.has_any_connected_state(),
        }
    }

    fn drive_incall(&mut self, event: SecondaryEvent) {
        let ctx = self.incall_context();
        for effect in self.incall.handle(event, &ctx) {
            match effect {
                SecondaryEffect::SetDefaultDataSlot(slot) => self.set_default_data_slot(slot),
                SecondaryEffect::IncallDataComplete => {
                    tracing::info!(slot = self.slot, "in-call data complete");
                }
            }
        }
    }
}

impl Drop for CellularDataHandler {
    fn drop(&mut self) {
        for id in self.prop_subscriptions.drain(..) {
            self.props.unsubscribe(id);
        }
    }
}

impl std::fmt::Debug for CellularDataHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellularDataHandler")
            .field("slot", &self.slot)
            .field("switches", &self.switches)
            .field("active_cids", &self.connections.active_cids())
            .field("secondary", &self.incall.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::apn::types::NetCapability;
    use crate::monitor::TrafficCounters;
    use crate::net::{LinkInfo, SupplierInfo};
    use crate::radio::{
        ActivateRequest, DeactivateRequest, RadioError, RadioResponseInfo, SetupDataCallResult,
    };
    use crate::secondary::DSDS_MODE_V3;

    #[derive(Default)]
    struct RecordingRadio {
        activates: Mutex<Vec<ActivateRequest>>,
        deactivates: Mutex<Vec<DeactivateRequest>>,
        subscriptions: Mutex<Vec<NotificationKind>>,
        polls: Mutex<u32>,
    }

    impl RecordingRadio {
        fn activates(&self) -> Vec<ActivateRequest> {
            self.activates.lock().unwrap().clone()
        }

        fn deactivates(&self) -> Vec<DeactivateRequest> {
            self.deactivates.lock().unwrap().clone()
        }
    }

    impl RadioTransport for RecordingRadio {
        fn activate(&self, request: ActivateRequest, _reply: ReplyTo) {
            self.activates.lock().unwrap().push(request);
        }

        fn deactivate(&self, request: DeactivateRequest, _reply: ReplyTo) {
            self.deactivates.lock().unwrap().push(request);
        }

        fn subscribe(&self, kind: NotificationKind, _listener: ReplyTo) {
            self.subscriptions.lock().unwrap().push(kind);
        }

        fn request_data_call_list(&self, _slot: i32, _reply: ReplyTo) {
            *self.polls.lock().unwrap() += 1;
        }
    }

    #[derive(Default)]
    struct RecordingNet {
        suppliers: Mutex<Vec<NetCapability>>,
        infos: Mutex<Vec<(SupplierId, SupplierInfo)>>,
        links: Mutex<Vec<(SupplierId, LinkInfo)>>,
    }

    impl NetAgent for RecordingNet {
        fn register_supplier(&self, _slot: i32, capability: NetCapability) -> SupplierId {
            let mut suppliers = self.suppliers.lock().unwrap();
            suppliers.push(capability);
            suppliers.len() as SupplierId
        }

        fn publish_supplier_info(&self, supplier: SupplierId, info: &SupplierInfo) {
            self.infos.lock().unwrap().push((supplier, info.clone()));
        }

        fn publish_link_info(&self, supplier: SupplierId, info: &LinkInfo) {
            self.links.lock().unwrap().push((supplier, info.clone()));
        }
    }

    struct Harness {
        handler: CellularDataHandler,
        radio: Arc<RecordingRadio>,
        net: Arc<RecordingNet>,
    }

    fn harness_with(slot: i32, config: DataConfig, catalog: ApnCatalog) -> Harness {
        let radio = Arc::new(RecordingRadio::default());
        let net = Arc::new(RecordingNet::default());
        let handler = CellularDataHandler::new(
            slot,
            config,
            catalog,
            Collaborators {
                radio: radio.clone(),
                net: net.clone(),
                extension: Extension::none(),
                props: PropertyStore::new(),
            },
        );
        Harness {
            handler,
            radio,
            net,
        }
    }

    fn harness() -> Harness {
        harness_with(0, DataConfig::default(), ApnCatalog::fallback())
    }

    fn internet() -> NetRequest {
        NetRequest {
            capability: NetCapability::Internet,
            ident: "simId1".into(),
        }
    }

    fn mms() -> NetRequest {
        NetRequest {
            capability: NetCapability::Mms,
            ident: "simId1".into(),
        }
    }

    impl Harness {
        fn state(&self, apn_type: ApnType) -> ApnProfileState {
            self.handler.apns().find_holder(apn_type).unwrap().state()
        }

        fn succeed(&mut self, cid: i32) {
            let req = self.radio.activates().pop().unwrap();
            self.handler.on_radio_response(RadioResponse::SetupDataCall {
                machine: req.machine,
                result: Ok(SetupDataCallResult {
                    flag: req.flag,
                    active: 2,
                    cid,
                    iface_name: "rmnet0".into(),
                    addresses: "10.0.0.2/24".into(),
                    ..Default::default()
                }),
            });
        }

        fn fail(&mut self, error: RadioError) {
            let req = self.radio.activates().pop().unwrap();
            self.handler.on_radio_response(RadioResponse::SetupDataCall {
                machine: req.machine,
                result: Err(RadioResponseInfo {
                    flag: req.flag,
                    error: Some(error),
                }),
            });
        }

        fn deactivated(&mut self) {
            let req = self.radio.deactivates().pop().unwrap();
            self.handler.on_radio_response(RadioResponse::DeactivateDataCall {
                machine: req.machine,
                info: RadioResponseInfo {
                    flag: req.flag,
                    error: None,
                },
            });
        }

        /// Stall tick of the current monitor run.
        fn stall_tick(&self) -> Timer {
            Timer::StallCheck {
                generation: self.handler.connections().monitor().stall_generation(),
            }
        }

        fn establish_timers(&mut self) -> Vec<Scheduled> {
            self.handler
                .take_scheduled()
                .into_iter()
                .filter(|s| matches!(s.timer, Timer::Establish { .. }))
                .collect()
        }
    }

    // ─── Bring-up ───────────────────────────────────────────────────────

    #[test]
    fn attach_subscribes_to_notifications() {
        let mut h = harness();
        h.handler.attach(Arc::new(NullListener));
        let subs = h.radio.subscriptions.lock().unwrap().clone();
        assert_eq!(
            subs,
            vec![
                NotificationKind::DataCallListChanged,
                NotificationKind::RadioConnected
            ]
        );
    }

    #[test]
    fn request_brings_up_default() {
        let mut h = harness();
        h.handler.request_net(internet()).unwrap();

        let activates = h.radio.activates();
        assert_eq!(activates.len(), 1);
        assert_eq!(activates[0].apn_id, ApnType::Default.id());
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Connecting);

        h.succeed(5);
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Connected);
        assert_eq!(h.handler.cellular_data_state(), ApnProfileState::Connected);
        assert!(h.handler.has_internet_capability(5));

        let snap = h.handler.snapshot();
        assert_eq!(snap.active_cids, vec![5]);
        assert!(snap.physical_link_active);

        let timers: Vec<Timer> = h.handler.take_scheduled().into_iter().map(|s| s.timer).collect();
        assert!(timers.iter().any(|t| matches!(t, Timer::StallCheck { .. })));
        assert!(timers.iter().any(|t| matches!(t, Timer::Statistics { .. })));

        assert_eq!(*h.net.suppliers.lock().unwrap(), vec![NetCapability::Internet]);
        assert!(h.net.infos.lock().unwrap().iter().any(|(_, i)| i.is_available));
        assert!(!h.net.links.lock().unwrap().is_empty());
    }

    #[test]
    fn duplicate_request_is_ignored() {
        let mut h = harness();
        h.handler.request_net(internet()).unwrap();
        h.handler.request_net(internet()).unwrap();
        assert_eq!(h.radio.activates().len(), 1);
    }

    #[test]
    fn unheld_capability_is_rejected() {
        let mut h = harness();
        let err = h
            .handler
            .request_net(NetRequest {
                capability: NetCapability::Ims,
                ident: "simId1".into(),
            })
            .unwrap_err();
        assert!(matches!(err, crate::error::DataError::UnknownCapability(_)));
    }

    // ─── Gates ──────────────────────────────────────────────────────────

    #[test]
    fn non_default_slot_only_serves_non_internet_roles() {
        let mut h = harness();
        h.handler.set_default_data_slot(1);
        h.handler.request_net(internet()).unwrap();
        assert!(h.radio.activates().is_empty());

        h.handler.request_net(mms()).unwrap();
        assert_eq!(h.radio.activates().len(), 1);
        assert_eq!(h.radio.activates()[0].apn_id, ApnType::Mms.id());

        h.handler.set_default_data_slot(0);
        assert_eq!(h.radio.activates().len(), 2);
        assert_eq!(h.radio.activates()[1].apn_id, ApnType::Default.id());
    }

    #[test]
    fn user_data_off_still_allows_mms() {
        let mut h = harness();
        h.handler.set_user_data_enabled(false);
        h.handler.request_net(internet()).unwrap();
        assert!(h.radio.activates().is_empty());
        h.handler.request_net(mms()).unwrap();
        assert_eq!(h.radio.activates().len(), 1);
    }

    #[test]
    fn roaming_needs_user_consent() {
        let mut h = harness();
        h.handler.on_roaming_changed(true);
        h.handler.request_net(internet()).unwrap();
        h.handler.request_net(mms()).unwrap();
        assert!(h.radio.activates().is_empty());

        h.handler.set_user_roaming_enabled(true);
        let activates = h.radio.activates();
        assert_eq!(activates.len(), 2);
        assert!(activates.iter().all(|a| a.roaming && a.allow_roaming));
    }

    #[test]
    fn detached_or_no_sim_blocks_activation() {
        let mut h = harness();
        h.handler.on_ps_attach_changed(false);
        h.handler.request_net(internet()).unwrap();
        assert!(h.radio.activates().is_empty());
        h.handler.on_sim_state_changed(false);
        h.handler.on_ps_attach_changed(true);
        assert!(h.radio.activates().is_empty());
        h.handler.on_sim_state_changed(true);
        assert_eq!(h.radio.activates().len(), 1);
    }

    #[test]
    fn gsm_voice_call_restricts_data() {
        let mut h = harness();
        h.handler.on_ps_rat_changed(RadioTech::Gsm);
        h.handler.on_call_state_changed(CallState::Active);
        h.handler.request_net(internet()).unwrap();
        assert!(h.radio.activates().is_empty());
        h.handler.on_call_state_changed(CallState::Idle);
        assert_eq!(h.radio.activates().len(), 1);
    }

    // ─── Retry ──────────────────────────────────────────────────────────

    #[test]
    fn transient_failure_schedules_retry() {
        let mut h = harness();
        h.handler.request_net(internet()).unwrap();
        h.fail(RadioError::GenericFailure);
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Retrying);

        let timers = h.establish_timers();
        assert_eq!(timers.len(), 1);
        let max = DataConfig::default().retry.default_setup_fail_delay
            + DataConfig::default().retry.max_jitter;
        assert!(timers[0].delay <= max, "{:?}", timers[0].delay);

        h.handler.on_timer(timers[0].timer.clone());
        assert_eq!(h.radio.activates().len(), 2);
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Connecting);
    }

    #[test]
    fn superseded_retry_timer_is_dropped() {
        let mut h = harness();
        h.handler.request_net(internet()).unwrap();
        h.fail(RadioError::GenericFailure);
        let stale = h.establish_timers().remove(0);

        h.handler.establish_all_if_connectable();
        assert_eq!(h.radio.activates().len(), 2);
        h.handler.on_timer(stale.timer);
        assert_eq!(h.radio.activates().len(), 2);
    }

    #[test]
    fn rejected_candidate_moves_to_next() {
        let catalog = ApnCatalog::from_toml_str(
            r#"
            [[apn]]
            profile_id = 1
            types = "default"
            apn = "first"

            [[apn]]
            profile_id = 2
            types = "default"
            apn = "second"
            "#,
        )
        .unwrap();
        let mut h = harness_with(0, DataConfig::default(), catalog);
        h.handler.request_net(internet()).unwrap();
        assert_eq!(h.radio.activates()[0].attr.apn, "first");

        h.fail(RadioError::InvalidParameter);
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Retrying);
        let timer = h.establish_timers().remove(0);
        h.handler.on_timer(timer.timer);
        assert_eq!(h.radio.activates()[1].attr.apn, "second");

        h.fail(RadioError::InvalidParameter);
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Failed);
        assert!(h.establish_timers().is_empty());
    }

    #[test]
    fn memory_full_marks_candidate_bad() {
        let catalog = ApnCatalog::from_toml_str(
            r#"
            [[apn]]
            profile_id = 1
            types = "default"
            apn = "first"

            [[apn]]
            profile_id = 2
            types = "default"
            apn = "second"
            "#,
        )
        .unwrap();
        let mut h = harness_with(0, DataConfig::default(), catalog);
        h.handler.request_net(internet()).unwrap();
        h.fail(RadioError::MemoryFull);
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Retrying);

        let holder = h.handler.apns().find_holder(ApnType::Default).unwrap();
        let bad: Vec<&str> = holder
            .retry()
            .matched_apns()
            .iter()
            .filter(|apn| apn.is_bad())
            .map(|apn| apn.attr.apn.as_str())
            .collect();
        assert_eq!(bad, vec!["first"]);

        let timer = h.establish_timers().remove(0);
        h.handler.on_timer(timer.timer);
        assert_eq!(h.radio.activates()[1].attr.apn, "second");
    }

    #[test]
    fn bad_flags_survive_until_sim_reload() {
        let mut h = harness();
        h.handler.request_net(internet()).unwrap();
        h.fail(RadioError::InvalidParameter);
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Failed);

        h.handler.establish_all_if_connectable();
        assert_eq!(h.radio.activates().len(), 1);
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Failed);

        h.handler.on_sim_state_changed(true);
        assert_eq!(h.radio.activates().len(), 2);
    }

    #[test]
    fn context_gone_during_teardown_settles_idle() {
        let mut h = harness();
        h.handler.request_net(internet()).unwrap();
        h.succeed(9);
        h.handler.set_user_data_enabled(false);
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Disconnecting);
        h.handler.take_scheduled();

        // Deactivate reply never arrives; the modem's call list says it is gone.
        h.handler
            .on_radio_notification(RadioNotification::DataCallListChanged(Vec::new()));
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Idle);
        assert!(h.handler.connections().is_active_connections_empty());
        assert!(h.establish_timers().is_empty());

        h.handler.set_user_data_enabled(true);
        assert_eq!(h.radio.activates().len(), 2);
    }

    #[test]
    fn unanswered_deactivate_times_out() {
        let mut h = harness();
        h.handler.request_net(internet()).unwrap();
        h.succeed(9);
        h.handler.take_scheduled();
        h.handler.set_user_data_enabled(false);

        let watchdog = h
            .handler
            .take_scheduled()
            .into_iter()
            .find(|s| matches!(s.timer, Timer::DisconnectTimeout { .. }))
            .unwrap();
        assert_eq!(
            Some(watchdog.delay),
            DataConfig::default().timing.disconnect_timeout
        );
        h.handler.on_timer(watchdog.timer.clone());
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Idle);
        assert!(h.handler.connections().is_active_connections_empty());
        assert!(!h.handler.snapshot().physical_link_active);

        // Late reply and a repeated watchdog are both harmless.
        h.deactivated();
        h.handler.on_timer(watchdog.timer);
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Idle);
    }

    #[test]
    fn lost_context_retries_with_modem_scene() {
        let mut h = harness();
        h.handler.request_net(internet()).unwrap();
        h.succeed(4);
        h.handler.take_scheduled();

        h.handler
            .on_radio_notification(RadioNotification::DataCallListChanged(Vec::new()));
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Retrying);
        assert!(h.handler.connections().is_active_connections_empty());
        assert!(!h.handler.snapshot().physical_link_active);

        let timers = h.establish_timers();
        assert_eq!(timers.len(), 1);
        let max = DataConfig::default().retry.default_modem_dend_delay
            + DataConfig::default().retry.max_jitter;
        assert!(timers[0].delay <= max);
    }

    // ─── Teardown ───────────────────────────────────────────────────────

    #[test]
    fn user_data_off_tears_down_without_retry() {
        let mut h = harness();
        h.handler.request_net(internet()).unwrap();
        h.succeed(3);
        h.handler.take_scheduled();

        h.handler.set_user_data_enabled(false);
        assert_eq!(h.radio.deactivates().len(), 1);
        assert_eq!(h.radio.deactivates()[0].cid, 3);
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Disconnecting);

        h.deactivated();
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Idle);
        assert!(h.handler.connections().is_active_connections_empty());
        assert!(h.establish_timers().is_empty());
        assert_eq!(h.handler.data_flow_type(), DataFlowType::None);
        assert!(!h.handler.connections().monitor().is_stall_detection_active());
    }

    #[test]
    fn release_clears_connection() {
        let mut h = harness();
        h.handler.request_net(internet()).unwrap();
        h.succeed(3);
        h.handler.release_net(&internet()).unwrap();
        assert_eq!(
            h.radio.deactivates()[0].reason,
            DisconnectReason::ClearConnection
        );
        h.deactivated();
        let holder = h.handler.apns().find_holder(ApnType::Default).unwrap();
        assert_eq!(holder.state(), ApnProfileState::Idle);
        assert!(!holder.is_data_call_enabled());
    }

    #[test]
    fn release_while_retrying_goes_idle() {
        let mut h = harness();
        h.handler.request_net(internet()).unwrap();
        h.fail(RadioError::GenericFailure);
        let timer = h.establish_timers().remove(0);
        h.handler.release_net(&internet()).unwrap();
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Idle);
        h.handler.on_timer(timer.timer);
        assert_eq!(h.radio.activates().len(), 1);
    }

    #[test]
    fn completion_after_release_is_ignored() {
        let mut h = harness();
        h.handler.request_net(internet()).unwrap();
        h.handler.release_net(&internet()).unwrap();
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Disconnecting);

        // Activation answer arrives after the release was queued.
        h.succeed(6);
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Disconnecting);
        assert_eq!(h.radio.deactivates().len(), 1);
        h.deactivated();
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Idle);
        assert!(h.handler.connections().is_active_connections_empty());
    }

    #[test]
    fn apn_change_restarts_everything() {
        let mut h = harness();
        h.handler.request_net(internet()).unwrap();
        h.succeed(2);
        h.handler.take_scheduled();

        h.handler.on_apn_changed(ApnCatalog::fallback());
        assert_eq!(h.radio.deactivates().len(), 1);
        let timers: Vec<Timer> = h.handler.take_scheduled().into_iter().map(|s| s.timer).collect();
        assert!(timers.contains(&Timer::EstablishAll));
    }

    // ─── Single Context ─────────────────────────────────────────────────

    #[test]
    fn single_context_rat_preempts_lower_priority() {
        let mut config = DataConfig::default();
        config.features.multiple_connections_enabled = false;
        let mut h = harness_with(0, config, ApnCatalog::fallback());
        h.handler.request_net(internet()).unwrap();
        h.succeed(1);
        h.handler.take_scheduled();

        h.handler.request_net(mms()).unwrap();
        assert_eq!(h.radio.activates().len(), 1);
        assert_eq!(
            h.radio.deactivates()[0].reason,
            DisconnectReason::ChangeConnection
        );

        h.deactivated();
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Idle);
        let timers = h.establish_timers();
        assert_eq!(timers.len(), 1);
        assert!(matches!(
            timers[0].timer,
            Timer::Establish {
                apn_type: ApnType::Mms,
                ..
            }
        ));

        h.handler.on_timer(timers[0].timer.clone());
        assert_eq!(h.radio.activates().len(), 2);
        assert_eq!(h.radio.activates()[1].apn_id, ApnType::Mms.id());
    }

    #[test]
    fn single_context_rat_defers_to_higher_priority() {
        let mut config = DataConfig::default();
        config.features.multiple_connections_enabled = false;
        let mut h = harness_with(0, config, ApnCatalog::fallback());
        h.handler.request_net(mms()).unwrap();
        h.succeed(1);
        h.handler.request_net(internet()).unwrap();
        assert_eq!(h.radio.activates().len(), 1);
        assert!(h.radio.deactivates().is_empty());
        assert_eq!(h.state(ApnType::Default), ApnProfileState::Idle);
    }

    // ─── Monitoring ─────────────────────────────────────────────────────

    struct SharedCounters(Arc<Mutex<TrafficCounters>>);

    impl TrafficSource for SharedCounters {
        fn counters(&self) -> TrafficCounters {
            *self.0.lock().unwrap()
        }
    }

    #[test]
    fn stall_polls_call_list_first() {
        let mut h = harness();
        let counters = Arc::new(Mutex::new(TrafficCounters::default()));
        h.handler
            .set_traffic_source(Box::new(SharedCounters(counters.clone())));
        h.handler.request_net(internet()).unwrap();
        h.succeed(1);
        h.handler.take_scheduled();

        let tick = h.stall_tick();
        h.handler.on_timer(tick.clone());
        counters.lock().unwrap().tx_packets = 50;
        h.handler.on_timer(tick.clone());
        assert_eq!(*h.radio.polls.lock().unwrap(), 1);

        let timers: Vec<Timer> = h.handler.take_scheduled().into_iter().map(|s| s.timer).collect();
        assert_eq!(timers, vec![tick.clone(), tick]);
    }

    #[test]
    fn stall_timer_stops_with_last_connection() {
        let mut h = harness();
        h.handler.request_net(internet()).unwrap();
        h.succeed(1);
        h.handler.set_user_data_enabled(false);
        h.deactivated();
        h.handler.take_scheduled();
        let stall = h.stall_tick();
        let stats = Timer::Statistics {
            generation: h.handler.connections().monitor().statistics_generation(),
        };
        h.handler.on_timer(stall);
        h.handler.on_timer(stats);
        assert!(h.handler.take_scheduled().is_empty());
    }

    #[test]
    fn reconnect_keeps_single_monitor_chain() {
        let mut h = harness();
        h.handler.request_net(internet()).unwrap();
        h.succeed(1);
        let mut queued: Vec<Timer> = h.handler.take_scheduled().into_iter().map(|s| s.timer).collect();

        h.handler.set_user_data_enabled(false);
        h.deactivated();
        h.handler.set_user_data_enabled(true);
        h.succeed(2);
        queued.extend(h.handler.take_scheduled().into_iter().map(|s| s.timer));

        // Ticks from the first run are still queued alongside the new ones.
        for timer in queued {
            if matches!(timer, Timer::StallCheck { .. } | Timer::Statistics { .. }) {
                h.handler.on_timer(timer);
            }
        }
        let next: Vec<Timer> = h.handler.take_scheduled().into_iter().map(|s| s.timer).collect();
        assert_eq!(next.iter().filter(|t| matches!(t, Timer::StallCheck { .. })).count(), 1);
        assert_eq!(next.iter().filter(|t| matches!(t, Timer::Statistics { .. })).count(), 1);
        assert!(next.contains(&h.stall_tick()));
    }

    // ─── In-call Data ───────────────────────────────────────────────────

    #[test]
    fn ims_call_moves_data_to_secondary_and_back() {
        let mut config = DataConfig::default();
        config.features.in_call_switch = true;
        let mut h = harness_with(1, config, ApnCatalog::fallback());
        h.handler.set_topology(SlotTopology {
            primary_slot: Some(0),
            primary_has_sim: true,
            dsds_mode: DSDS_MODE_V3 - 1,
            ims_registered: true,
        });
        h.handler.on_ps_rat_changed(RadioTech::Lte);
        h.handler.set_default_data_slot(0);
        h.handler.request_net(internet()).unwrap();
        assert!(h.radio.activates().is_empty());

        h.handler.on_call_state_changed(CallState::Dialing);
        assert_eq!(h.handler.secondary_state(), SecondaryState::ActivatingSecondary);
        assert_eq!(h.handler.switches().default_data_slot, 1);
        assert_eq!(h.radio.activates().len(), 1);

        h.succeed(9);
        assert_eq!(h.handler.secondary_state(), SecondaryState::ActivatedSecondary);

        h.handler.on_call_state_changed(CallState::Idle);
        assert_eq!(h.handler.switches().default_data_slot, 0);
        assert_eq!(h.handler.secondary_state(), SecondaryState::DeactivatingSecondary);
        assert_eq!(h.radio.deactivates().len(), 1);

        h.deactivated();
        assert_eq!(h.handler.secondary_state(), SecondaryState::Idle);
    }

    #[test]
    fn call_without_ims_goes_dormant_on_gsm() {
        let mut h = harness();
        h.handler.on_ps_rat_changed(RadioTech::Gsm);
        h.handler.request_net(internet()).unwrap();
        h.succeed(1);
        h.handler.on_call_state_changed(CallState::Active);
        assert_eq!(h.handler.data_flow_type(), DataFlowType::Dormant);
        assert!(!h.handler.connections().monitor().is_stall_detection_active());

        h.handler.on_call_state_changed(CallState::Idle);
        assert_eq!(h.handler.data_flow_type(), DataFlowType::None);
        assert!(h.handler.connections().monitor().is_stall_detection_active());
    }

    #[test]
    fn snapshot_serializes() {
        let mut h = harness();
        h.handler.request_net(internet()).unwrap();
        h.succeed(8);
        let json = serde_json::to_value(h.handler.snapshot()).unwrap();
        assert_eq!(json["slot"], 0);
        assert_eq!(json["active_cids"][0], 8);
        assert_eq!(json["overall"], "Connected");
    }
}
