//! # Connection State Machine
//!
//! One physical data-call attempt against the modem. The machine never
//! talks to collaborators directly: [`ConnectionStateMachine::handle`] takes
//! an event and returns the effects the owner must carry out.
//!
//! ```text
//!            Connect                    setup ok (active != 0)
//!   Idle ──────────────▶ Activating ──────────────────────────▶ Active
//!    ▲                      │                                     │
//!    │   reject / error /   │                          Disconnect │
//!    ├──── timeout ─────────┘                                     ▼
//!    │                                                      Disconnecting
//!    ├──── LostConnection (from Active) ─────────────────────────┤
//!    └──────────────────── deactivate response ──────────────────┘
//! ```
//!
//! Events a state is not ready for are deferred and redelivered in arrival
//! order as soon as the machine changes state. Anything a state does not
//! handle falls through to a shared default handler (RAT changes, stale
//! responses, disconnect deferral).

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::apn::item::ApnItem;
use crate::apn::types::{ApnType, DisconnectReason, NetCapability, RadioTech};
use crate::extension::Extension;
use crate::net::{LinkInfo, SupplierId, SupplierInfo};
use crate::radio::{
    ActivateRequest, DeactivateRequest, RadioError, RadioResponseInfo, SetupDataCallResult,
};
use crate::retry::{RetryScene, pdp_cause_to_reason};

/// Modem context id before the modem has assigned one.
pub const CID_UNASSIGNED: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachineId(pub u32);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dc{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Activating,
    Active,
    Disconnecting,
}

/// Everything needed to bring a context up for one role.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub apn: Arc<ApnItem>,
    pub apn_type: ApnType,
    pub capability: NetCapability,
    pub supplier: SupplierId,
    pub radio_tech: RadioTech,
    pub roaming: bool,
    pub allow_roaming: bool,
}

#[derive(Debug, Clone)]
pub enum MachineEvent {
    Connect(ConnectRequest),
    Disconnect { reason: DisconnectReason },
    DisconnectAll { reason: DisconnectReason },
    SetupDataCall(Result<SetupDataCallResult, RadioResponseInfo>),
    DeactivateDataCall(RadioResponseInfo),
    ConnectTimeout { flag: i32 },
    DisconnectTimeout { flag: i32 },
    GetLastFailDone,
    LostConnection,
    DrsOrRatChanged { radio_tech: RadioTech },
    RoamOn,
    RoamOff,
    VoiceCallStarted,
    VoiceCallEnded,
    /// Fresh context report from a call-list snapshot.
    RefreshLink(SetupDataCallResult),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MachineEffect {
    Activate(ActivateRequest),
    Deactivate(DeactivateRequest),
    ScheduleTimeout {
        flag: i32,
        delay: Duration,
    },
    ScheduleDisconnectTimeout {
        flag: i32,
        delay: Duration,
    },
    RegisterCid(i32),
    UnregisterCid(i32),
    ConnectComplete {
        apn_type: ApnType,
        cid: i32,
    },
    DisconnectComplete {
        apn_type: ApnType,
        reason: DisconnectReason,
        scene: RetryScene,
        suggested: Option<Duration>,
    },
    PublishSupplier {
        supplier: SupplierId,
        info: SupplierInfo,
    },
    PublishLink {
        supplier: SupplierId,
        info: LinkInfo,
    },
}

/// Outcome of a state-specific handler.
enum Handled {
    Yes,
    No(MachineEvent),
}

pub struct ConnectionStateMachine {
    id: MachineId,
    slot: i32,
    state: ConnectionState,
    cid: i32,
    connect_id: i32,
    /// Incremented on every deactivate request.
    disconnect_id: i32,
    apn_type: Option<ApnType>,
    apn: Option<Arc<ApnItem>>,
    capability: Option<NetCapability>,
    supplier: Option<SupplierId>,
    radio_tech: RadioTech,
    roaming: bool,
    /// Reason attached to the next Idle entry.
    reason: DisconnectReason,
    scene: RetryScene,
    suggested: Option<Duration>,
    /// Role whose teardown completes on the next Idle entry.
    released: Option<ApnType>,
    deferred: VecDeque<MachineEvent>,
    supplier_info: SupplierInfo,
    link_info: Option<LinkInfo>,
    connect_timeout: Option<Duration>,
    disconnect_timeout: Option<Duration>,
    extension: Extension,
}

impl ConnectionStateMachine {
    pub fn new(id: MachineId, slot: i32) -> Self {
        Self {
            id,
            slot,
            state: ConnectionState::Idle,
            cid: CID_UNASSIGNED,
            connect_id: 0,
            disconnect_id: 0,
            apn_type: None,
            apn: None,
            capability: None,
            supplier: None,
            radio_tech: RadioTech::Unknown,
            roaming: false,
            reason: DisconnectReason::RetryConnection,
            scene: RetryScene::SetupFail,
            suggested: None,
            released: None,
            deferred: VecDeque::new(),
            supplier_info: SupplierInfo::default(),
            link_info: None,
            connect_timeout: None,
            disconnect_timeout: None,
            extension: Extension::none(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_disconnect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    pub fn with_extension(mut self, extension: Extension) -> Self {
        self.extension = extension;
        self
    }

    pub fn id(&self) -> MachineId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == ConnectionState::Idle
    }

    pub fn cid(&self) -> i32 {
        self.cid
    }

    pub fn connect_id(&self) -> i32 {
        self.connect_id
    }

    pub fn disconnect_id(&self) -> i32 {
        self.disconnect_id
    }

    pub fn apn_type(&self) -> Option<ApnType> {
        self.apn_type
    }

    pub fn apn(&self) -> Option<&Arc<ApnItem>> {
        self.apn.as_ref()
    }

    pub fn capability(&self) -> Option<NetCapability> {
        self.capability
    }

    pub fn radio_tech(&self) -> RadioTech {
        self.radio_tech
    }

    pub fn supplier_info(&self) -> &SupplierInfo {
        &self.supplier_info
    }

    pub fn link_info(&self) -> Option<&LinkInfo> {
        self.link_info.as_ref()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Feeds one event through the machine, including any deferred events
    /// that become deliverable because of a state change along the way.
    pub fn handle(&mut self, event: MachineEvent) -> Vec<MachineEffect> {
        let mut effects = Vec::new();
        let mut pending = VecDeque::from([event]);
        while let Some(ev) = pending.pop_front() {
            let before = self.state;
            self.dispatch(ev, &mut effects);
            if self.state != before && !self.deferred.is_empty() {
                // Older deferred events go ahead of anything still pending.
                let mut replay = std::mem::take(&mut self.deferred);
                replay.append(&mut pending);
                pending = replay;
            }
        }
        effects
    }

    fn dispatch(&mut self, event: MachineEvent, effects: &mut Vec<MachineEffect>) {
        let handled = match self.state {
            ConnectionState::Idle => self.on_idle(event, effects),
            ConnectionState::Activating => self.on_activating(event, effects),
            ConnectionState::Active => self.on_active(event, effects),
            ConnectionState::Disconnecting => self.on_disconnecting(event, effects),
        };
        if let Handled::No(event) = handled {
            self.on_default(event, effects);
        }
    }

    // ─── Idle ───────────────────────────────────────────────────────────

    fn on_idle(&mut self, event: MachineEvent, effects: &mut Vec<MachineEffect>) -> Handled {
        match event {
            MachineEvent::Connect(request) => {
                self.do_connect(request, effects);
                self.transition_to(ConnectionState::Activating, effects);
                Handled::Yes
            }
            MachineEvent::Disconnect { .. } | MachineEvent::DisconnectAll { .. } => {
                tracing::debug!(machine = %self.id, "disconnect while idle, nothing to do");
                Handled::Yes
            }
            other => Handled::No(other),
        }
    }

    fn do_connect(&mut self, request: ConnectRequest, effects: &mut Vec<MachineEffect>) {
        self.connect_id = self.connect_id.wrapping_add(1);
        self.apn_type = Some(request.apn_type);
        self.capability = Some(request.capability);
        self.supplier = Some(request.supplier);
        self.radio_tech = request.radio_tech;
        self.roaming = request.roaming;
        self.supplier_info = SupplierInfo {
            is_available: false,
            is_roaming: request.roaming,
            radio_tech: request.radio_tech,
            is_calling: false,
        };
        tracing::info!(
            slot = self.slot,
            machine = %self.id,
            apn_type = %request.apn_type,
            apn = %request.apn.attr.apn,
            flag = self.connect_id,
            "activating data context"
        );
        effects.push(MachineEffect::Activate(ActivateRequest {
            slot: self.slot,
            machine: self.id,
            flag: self.connect_id,
            apn_id: request.apn_type.id(),
            radio_tech: request.radio_tech,
            attr: request.apn.attr.clone(),
            roaming: request.roaming,
            allow_roaming: request.allow_roaming,
        }));
        if let Some(delay) = self.connect_timeout {
            effects.push(MachineEffect::ScheduleTimeout {
                flag: self.connect_id,
                delay,
            });
        }
        self.apn = Some(request.apn);
    }

    // ─── Activating ─────────────────────────────────────────────────────

    fn on_activating(&mut self, event: MachineEvent, effects: &mut Vec<MachineEffect>) -> Handled {
        match event {
            ev @ (MachineEvent::Connect(_) | MachineEvent::DrsOrRatChanged { .. }) => {
                tracing::debug!(machine = %self.id, "deferring event until activation settles");
                self.deferred.push_back(ev);
            }
            MachineEvent::SetupDataCall(Ok(result)) => self.on_setup_result(result, effects),
            MachineEvent::SetupDataCall(Err(info)) => self.on_setup_error(info, effects),
            MachineEvent::ConnectTimeout { flag } if flag == self.connect_id => {
                tracing::warn!(machine = %self.id, flag, "activation timed out");
                self.fail(DisconnectReason::RetryConnection, None, effects);
            }
            MachineEvent::GetLastFailDone => {
                self.released = self.apn_type;
                self.transition_to(ConnectionState::Idle, effects);
            }
            other => return Handled::No(other),
        }
        Handled::Yes
    }

    fn on_setup_result(&mut self, result: SetupDataCallResult, effects: &mut Vec<MachineEffect>) {
        if result.flag != self.connect_id {
            tracing::warn!(
                machine = %self.id,
                expected = self.connect_id,
                flag = result.flag,
                "stale setup result ignored"
            );
            return;
        }
        let suggested = (result.retry_time_ms > 0)
            .then(|| Duration::from_millis(result.retry_time_ms as u64));
        if result.reason != 0 {
            let reason = self
                .extension
                .map_cause(result.reason, pdp_cause_to_reason(result.reason));
            tracing::warn!(machine = %self.id, cause = result.reason, ?reason, "activation rejected");
            self.fail(reason, suggested, effects);
            return;
        }
        if result.active == 0 {
            tracing::warn!(machine = %self.id, "modem reported inactive context");
            self.fail(DisconnectReason::RetryConnection, suggested, effects);
            return;
        }
        self.cid = result.cid;
        effects.push(MachineEffect::RegisterCid(result.cid));
        // Active finishes the job with the same result.
        self.deferred
            .push_back(MachineEvent::SetupDataCall(Ok(result)));
        self.transition_to(ConnectionState::Active, effects);
    }

    fn on_setup_error(&mut self, info: RadioResponseInfo, effects: &mut Vec<MachineEffect>) {
        if info.flag != self.connect_id {
            tracing::warn!(
                machine = %self.id,
                expected = self.connect_id,
                flag = info.flag,
                "stale setup error ignored"
            );
            return;
        }
        let error = info.error.unwrap_or(RadioError::Other(0));
        let reason = error.disconnect_reason();
        tracing::warn!(machine = %self.id, ?error, ?reason, "activation failed");
        self.fail(reason, None, effects);
    }

    fn fail(
        &mut self,
        reason: DisconnectReason,
        suggested: Option<Duration>,
        effects: &mut Vec<MachineEffect>,
    ) {
        self.reason = reason;
        self.scene = RetryScene::SetupFail;
        self.suggested = suggested;
        self.released = self.apn_type;
        self.transition_to(ConnectionState::Idle, effects);
    }

    // ─── Active ─────────────────────────────────────────────────────────

    fn on_active(&mut self, event: MachineEvent, effects: &mut Vec<MachineEffect>) -> Handled {
        match event {
            MachineEvent::Connect(_) => {
                tracing::debug!(machine = %self.id, "already active");
            }
            MachineEvent::SetupDataCall(Ok(result)) => {
                self.supplier_info.is_available = true;
                self.publish_supplier(effects);
                self.update_network_info(&result, effects);
                if let Some(apn_type) = self.apn_type {
                    tracing::info!(
                        slot = self.slot,
                        machine = %self.id,
                        cid = self.cid,
                        %apn_type,
                        "data context active"
                    );
                    effects.push(MachineEffect::ConnectComplete {
                        apn_type,
                        cid: self.cid,
                    });
                }
            }
            MachineEvent::Disconnect { reason } | MachineEvent::DisconnectAll { reason } => {
                self.reason = reason;
                self.scene = RetryScene::SetupFail;
                self.suggested = None;
                self.free_connection(reason, effects);
                self.transition_to(ConnectionState::Disconnecting, effects);
            }
            MachineEvent::LostConnection => {
                tracing::warn!(machine = %self.id, cid = self.cid, "context lost");
                self.reason = DisconnectReason::RetryConnection;
                self.scene = RetryScene::ModemDeactivate;
                self.suggested = None;
                self.released = self.apn_type;
                self.transition_to(ConnectionState::Idle, effects);
            }
            MachineEvent::RoamOn | MachineEvent::RoamOff => {
                self.supplier_info.is_roaming = matches!(event, MachineEvent::RoamOn);
                self.publish_supplier(effects);
            }
            MachineEvent::VoiceCallStarted | MachineEvent::VoiceCallEnded => {
                self.supplier_info.is_calling = matches!(event, MachineEvent::VoiceCallStarted)
                    && !self.radio_tech.supports_incall_data();
                self.publish_supplier(effects);
            }
            MachineEvent::RefreshLink(result) => self.update_network_info(&result, effects),
            other => return Handled::No(other),
        }
        Handled::Yes
    }

    fn free_connection(&mut self, reason: DisconnectReason, effects: &mut Vec<MachineEffect>) {
        let flag = self.apn_type.map_or(crate::apn::types::ERROR_APN_ID, ApnType::id);
        self.disconnect_id = self.disconnect_id.wrapping_add(1);
        tracing::info!(machine = %self.id, cid = self.cid, ?reason, "deactivating data context");
        effects.push(MachineEffect::Deactivate(DeactivateRequest {
            slot: self.slot,
            machine: self.id,
            cid: self.cid,
            reason,
            flag,
        }));
        if let Some(delay) = self.disconnect_timeout {
            effects.push(MachineEffect::ScheduleDisconnectTimeout {
                flag: self.disconnect_id,
                delay,
            });
        }
    }

    fn update_network_info(&mut self, result: &SetupDataCallResult, effects: &mut Vec<MachineEffect>) {
        let ident = format!("simId{}", self.slot);
        let Some(info) = LinkInfo::from_setup_result(result, &ident) else {
            tracing::warn!(machine = %self.id, cid = result.cid, "incomplete link properties, not published");
            return;
        };
        self.link_info = Some(info.clone());
        if let Some(supplier) = self.supplier {
            effects.push(MachineEffect::PublishLink { supplier, info });
        }
    }

    fn publish_supplier(&self, effects: &mut Vec<MachineEffect>) {
        if let Some(supplier) = self.supplier {
            effects.push(MachineEffect::PublishSupplier {
                supplier,
                info: self.supplier_info.clone(),
            });
        }
    }

    // ─── Disconnecting ──────────────────────────────────────────────────

    fn on_disconnecting(&mut self, event: MachineEvent, effects: &mut Vec<MachineEffect>) -> Handled {
        match event {
            ev @ MachineEvent::Connect(_) => {
                tracing::debug!(machine = %self.id, "deferring connect until teardown completes");
                self.deferred.push_back(ev);
            }
            MachineEvent::DeactivateDataCall(info) => {
                if let Some(error) = info.error {
                    tracing::warn!(machine = %self.id, ?error, "deactivate reported an error");
                }
                self.released = ApnType::from_id(info.flag).or(self.apn_type);
                self.transition_to(ConnectionState::Idle, effects);
            }
            // The context is gone either way; finish with the requested reason.
            MachineEvent::LostConnection => {
                tracing::warn!(machine = %self.id, cid = self.cid, "context vanished during teardown");
                self.released = self.apn_type;
                self.transition_to(ConnectionState::Idle, effects);
            }
            MachineEvent::DisconnectTimeout { flag } if flag == self.disconnect_id => {
                tracing::warn!(machine = %self.id, cid = self.cid, flag, "deactivation timed out");
                self.released = self.apn_type;
                self.transition_to(ConnectionState::Idle, effects);
            }
            other => return Handled::No(other),
        }
        Handled::Yes
    }

    // ─── Default ────────────────────────────────────────────────────────

    fn on_default(&mut self, event: MachineEvent, effects: &mut Vec<MachineEffect>) {
        match event {
            ev @ (MachineEvent::Disconnect { .. } | MachineEvent::DisconnectAll { .. }) => {
                self.deferred.push_back(ev);
            }
            MachineEvent::DrsOrRatChanged { radio_tech } => {
                self.radio_tech = radio_tech;
                self.supplier_info.radio_tech = radio_tech;
                if let Some(supplier) = self.supplier {
                    self.publish_supplier(effects);
                    if let Some(info) = &self.link_info {
                        effects.push(MachineEffect::PublishLink {
                            supplier,
                            info: info.clone(),
                        });
                    }
                }
            }
            MachineEvent::RoamOn | MachineEvent::RoamOff => {
                self.roaming = matches!(event, MachineEvent::RoamOn);
            }
            other => {
                tracing::debug!(machine = %self.id, state = ?self.state, event = ?other, "event not handled");
            }
        }
    }

    // ─── Transitions ────────────────────────────────────────────────────

    fn transition_to(&mut self, next: ConnectionState, effects: &mut Vec<MachineEffect>) {
        let prev = self.state;
        if prev == ConnectionState::Active && self.supplier_info.is_available {
            self.supplier_info.is_available = false;
            self.publish_supplier(effects);
        }
        self.state = next;
        tracing::debug!(machine = %self.id, from = ?prev, to = ?next, "transition");
        if next == ConnectionState::Idle {
            self.enter_idle(effects);
        }
    }

    fn enter_idle(&mut self, effects: &mut Vec<MachineEffect>) {
        if self.cid != CID_UNASSIGNED {
            effects.push(MachineEffect::UnregisterCid(self.cid));
            self.cid = CID_UNASSIGNED;
        }
        self.link_info = None;
        if let Some(apn_type) = self.released.take() {
            effects.push(MachineEffect::DisconnectComplete {
                apn_type,
                reason: self.reason,
                scene: self.scene,
                suggested: self.suggested.take(),
            });
        }
        self.reason = DisconnectReason::RetryConnection;
        self.scene = RetryScene::SetupFail;
    }
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("cid", &self.cid)
            .field("apn_type", &self.apn_type)
            .field("deferred", &self.deferred.len())
            .finish()
    }
}
