//! Per-role connection bookkeeping.
//!
//! An [`ApnHolder`] tracks who asked for a role, which machine (if any)
//! currently serves it, and the retry campaign for its candidates.

use std::sync::Arc;

use super::item::ApnItem;
use super::types::{ApnProfileState, ApnType, NetCapability, Priority};
use crate::machine::MachineId;
use crate::retry::RetryPolicy;

/// One consumer's request for a capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetRequest {
    pub capability: NetCapability,
    pub ident: String,
}

#[derive(Debug)]
pub struct ApnHolder {
    apn_type: ApnType,
    priority: Priority,
    state: ApnProfileState,
    data_call_enabled: bool,
    requests: Vec<NetRequest>,
    machine: Option<MachineId>,
    apn_item: Option<Arc<ApnItem>>,
    retry: RetryPolicy,
    /// Bumped whenever a pending retry timer must be superseded.
    generation: u64,
}

impl ApnHolder {
    pub fn new(apn_type: ApnType, retry: RetryPolicy) -> Self {
        ApnHolder {
            apn_type,
            priority: apn_type.priority(),
            state: ApnProfileState::Idle,
            data_call_enabled: false,
            requests: Vec::new(),
            machine: None,
            apn_item: None,
            retry,
            generation: 0,
        }
    }

    pub fn apn_type(&self) -> ApnType {
        self.apn_type
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> ApnProfileState {
        self.state
    }

    /// Entering `Failed` ends the campaign: the candidate list is dropped
    /// so the next request starts from a fresh catalog match.
    pub fn set_state(&mut self, state: ApnProfileState) {
        if self.state != state {
            tracing::debug!(apn_type = %self.apn_type, from = ?self.state, to = ?state, "holder state");
        }
        self.state = state;
        if state == ApnProfileState::Failed {
            self.retry.clear_retry_apns();
        }
    }

    pub fn is_data_call_enabled(&self) -> bool {
        self.data_call_enabled
    }

    /// Enablement follows the request list; this only forces it for roles
    /// brought up without a consumer (e.g. the in-call default).
    pub fn set_data_call_enabled(&mut self, enabled: bool) {
        self.data_call_enabled = enabled;
    }

    pub fn is_connectable(&self) -> bool {
        self.data_call_enabled
            && matches!(
                self.state,
                ApnProfileState::Idle | ApnProfileState::Retrying | ApnProfileState::Failed
            )
    }

    // ─── Requests ───────────────────────────────────────────────────────

    /// Returns `false` if the same request was already registered.
    pub fn request_cellular_data(&mut self, request: NetRequest) -> bool {
        if self.requests.contains(&request) {
            return false;
        }
        tracing::info!(apn_type = %self.apn_type, ident = %request.ident, "net request added");
        self.requests.push(request);
        self.data_call_enabled = true;
        true
    }

    pub fn release_cellular_data(&mut self, request: &NetRequest) -> bool {
        let before = self.requests.len();
        self.requests.retain(|r| r != request);
        let removed = self.requests.len() != before;
        if removed {
            tracing::info!(apn_type = %self.apn_type, ident = %request.ident, "net request released");
        }
        self.data_call_enabled = !self.requests.is_empty();
        removed
    }

    pub fn release_all_cellular_data(&mut self) {
        self.requests.clear();
        self.data_call_enabled = false;
    }

    pub fn requests(&self) -> &[NetRequest] {
        &self.requests
    }

    pub fn has_request(&self, capability: NetCapability) -> bool {
        self.requests.iter().any(|r| r.capability == capability)
    }

    // ─── Binding ────────────────────────────────────────────────────────

    pub fn machine(&self) -> Option<MachineId> {
        self.machine
    }

    pub fn bind(&mut self, machine: MachineId, apn: Arc<ApnItem>) {
        self.machine = Some(machine);
        self.apn_item = Some(apn);
    }

    /// Drops the machine binding and returns what was bound.
    pub fn unbind(&mut self) -> Option<MachineId> {
        self.machine.take()
    }

    pub fn apn_item(&self) -> Option<&Arc<ApnItem>> {
        self.apn_item.as_ref()
    }

    /// Whether an already-active context on `item` can also serve this role.
    pub fn is_compatible_apn_item(&self, item: &ApnItem, roaming: bool) -> bool {
        let Some(current) = &self.apn_item else {
            return false;
        };
        current.attr.apn.eq_ignore_ascii_case(&item.attr.apn)
            && current.protocol_for(roaming) == item.protocol_for(roaming)
    }

    // ─── Retry ──────────────────────────────────────────────────────────

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn retry_mut(&mut self) -> &mut RetryPolicy {
        &mut self.retry
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Supersedes any timer stamped with an older generation.
    pub fn bump_generation(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }
}
