//! # Connection Manager
//!
//! Owns every live [`ConnectionStateMachine`] on a slot and the index from
//! modem context id to machine.
//!
//! ```text
//!   machines: MachineId ─▶ ConnectionStateMachine     (all live machines)
//!   cid_map:  cid       ─▶ MachineId                  (active subset)
//! ```
//!
//! Machines report cid changes as effects; the manager applies those to the
//! index itself and passes every other effect up to the caller. The index
//! never holds two entries for one machine or one cid for two machines.
//!
//! Call-list snapshots from the modem are the resync point: a tracked cid
//! missing from the snapshot means the context is gone, a present one gets
//! its link properties refreshed.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use crate::apn::types::{ApnType, DisconnectReason, RadioTech};
use crate::extension::Extension;
use crate::machine::{ConnectionStateMachine, MachineEffect, MachineEvent, MachineId};
use crate::monitor::{MonitorEvent, StallMonitor, TrafficCounters, TrafficSource};
use crate::radio::SetupDataCallResult;

/// Effect tagged with the machine that produced it.
pub type Output = (MachineId, MachineEffect);

pub struct ConnectionManager {
    slot: i32,
    machines: BTreeMap<MachineId, ConnectionStateMachine>,
    cid_map: HashMap<i32, MachineId>,
    next_id: u32,
    connect_timeout: Option<Duration>,
    disconnect_timeout: Option<Duration>,
    extension: Extension,
    monitor: StallMonitor,
    traffic: Option<Box<dyn TrafficSource>>,
}

impl ConnectionManager {
    pub fn new(slot: i32, monitor: StallMonitor) -> Self {
        ConnectionManager {
            slot,
            machines: BTreeMap::new(),
            cid_map: HashMap::new(),
            next_id: 0,
            connect_timeout: None,
            disconnect_timeout: None,
            extension: Extension::none(),
            monitor,
            traffic: None,
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

    pub fn set_traffic_source(&mut self, source: Box<dyn TrafficSource>) {
        self.traffic = Some(source);
    }

    // ─── Machines ───────────────────────────────────────────────────────

    pub fn create_machine(&mut self) -> MachineId {
        self.next_id += 1;
        let id = MachineId(self.next_id);
        let machine = ConnectionStateMachine::new(id, self.slot)
            .with_connect_timeout(self.connect_timeout)
            .with_disconnect_timeout(self.disconnect_timeout)
            .with_extension(self.extension.clone());
        self.machines.insert(id, machine);
        tracing::debug!(slot = self.slot, machine = %id, "machine created");
        id
    }

    /// An idle machine not listed in `bound`, for reuse.
    pub fn find_idle_machine(&self, bound: &[MachineId]) -> Option<MachineId> {
        self.machines
            .values()
            .find(|m| m.is_idle() && m.deferred_len() == 0 && !bound.contains(&m.id()))
            .map(|m| m.id())
    }

    pub fn machine(&self, id: MachineId) -> Option<&ConnectionStateMachine> {
        self.machines.get(&id)
    }

    pub fn machines(&self) -> impl Iterator<Item = &ConnectionStateMachine> {
        self.machines.values()
    }

    pub fn machine_count(&self) -> usize {
        self.machines.len()
    }

    /// Drops an idle machine. Busy machines are kept.
    pub fn remove_machine(&mut self, id: MachineId) -> bool {
        match self.machines.get(&id) {
            Some(m) if m.is_idle() => {
                self.machines.remove(&id);
                self.cid_map.retain(|_, owner| *owner != id);
                tracing::debug!(slot = self.slot, machine = %id, "machine removed");
                true
            }
            _ => false,
        }
    }

    // ─── Cid Index ──────────────────────────────────────────────────────

    /// Indexes `id` under `cid`. A previous owner of the cid is evicted and
    /// returned; it no longer holds the context.
    pub fn add_active_connection_by_cid(&mut self, cid: i32, id: MachineId) -> Option<MachineId> {
        self.cid_map.retain(|c, owner| *owner != id || *c == cid);
        match self.cid_map.insert(cid, id) {
            Some(prev) if prev != id => {
                tracing::warn!(slot = self.slot, cid, evicted = %prev, owner = %id, "cid reassigned");
                Some(prev)
            }
            _ => None,
        }
    }

    pub fn get_active_connection_by_cid(&self, cid: i32) -> Option<&ConnectionStateMachine> {
        self.cid_map.get(&cid).and_then(|id| self.machines.get(id))
    }

    pub fn remove_active_connection_by_cid(&mut self, cid: i32) -> Option<MachineId> {
        self.cid_map.remove(&cid)
    }

    pub fn active_cids(&self) -> Vec<i32> {
        let mut cids: Vec<i32> = self.cid_map.keys().copied().collect();
        cids.sort_unstable();
        cids
    }

    pub fn is_active_connections_empty(&self) -> bool {
        self.cid_map.is_empty()
    }

    pub fn has_internet_capability(&self, cid: i32) -> bool {
        self.get_active_connection_by_cid(cid)
            .and_then(|m| m.apn_type())
            .is_some_and(ApnType::is_internet)
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Runs `event` through machine `id`, plus any follow-up events that
    /// index maintenance generates, and returns the remaining effects.
    pub fn dispatch(&mut self, id: MachineId, event: MachineEvent) -> Vec<Output> {
        let mut work = VecDeque::from([(id, event)]);
        let mut out = Vec::new();
        while let Some((id, event)) = work.pop_front() {
            let Some(machine) = self.machines.get_mut(&id) else {
                tracing::warn!(slot = self.slot, machine = %id, "event for unknown machine dropped");
                continue;
            };
            for effect in machine.handle(event) {
                match effect {
                    MachineEffect::RegisterCid(cid) => {
                        if let Some(evicted) = self.add_active_connection_by_cid(cid, id) {
                            work.push_back((evicted, MachineEvent::LostConnection));
                        }
                    }
                    MachineEffect::UnregisterCid(cid) => {
                        if self.cid_map.get(&cid) == Some(&id) {
                            self.cid_map.remove(&cid);
                        }
                    }
                    other => out.push((id, other)),
                }
            }
        }
        out
    }

    /// Sends `event` to every machine, in id order.
    pub fn broadcast(&mut self, event: MachineEvent) -> Vec<Output> {
        let ids: Vec<MachineId> = self.machines.keys().copied().collect();
        ids.into_iter()
            .flat_map(|id| self.dispatch(id, event.clone()))
            .collect()
    }

    pub fn disconnect_all(&mut self, reason: DisconnectReason) -> Vec<Output> {
        self.broadcast(MachineEvent::DisconnectAll { reason })
    }

    pub fn update_radio_tech(&mut self, radio_tech: RadioTech) -> Vec<Output> {
        self.broadcast(MachineEvent::DrsOrRatChanged { radio_tech })
    }

    // ─── Radio Notifications ────────────────────────────────────────────

    /// Reconciles tracked contexts against the modem's authoritative list.
    pub fn on_data_call_list_changed(&mut self, list: &[SetupDataCallResult]) -> Vec<Output> {
        let mut out = Vec::new();
        for cid in self.active_cids() {
            let Some(&id) = self.cid_map.get(&cid) else {
                continue;
            };
            match list.iter().find(|r| r.cid == cid && r.active != 0) {
                Some(result) => {
                    out.extend(self.dispatch(id, MachineEvent::RefreshLink(result.clone())));
                }
                None => {
                    tracing::warn!(slot = self.slot, cid, machine = %id, "context missing from call list");
                    out.extend(self.dispatch(id, MachineEvent::LostConnection));
                }
            }
        }
        for result in list {
            if !self.cid_map.contains_key(&result.cid) {
                tracing::debug!(slot = self.slot, cid = result.cid, "untracked context in call list");
            }
        }
        out
    }

    pub fn on_radio_connected(&self) {
        tracing::info!(slot = self.slot, tracked = self.cid_map.len(), "radio connected");
    }

    // ─── Monitoring ─────────────────────────────────────────────────────

    pub fn monitor(&self) -> &StallMonitor {
        &self.monitor
    }

    pub fn start_stall_detection(&mut self) -> bool {
        self.monitor.start_stall_detection()
    }

    pub fn stop_stall_detection(&mut self) {
        self.monitor.stop_stall_detection();
    }

    pub fn begin_net_statistics(&mut self) -> bool {
        self.monitor.begin_net_statistics()
    }

    pub fn end_net_statistics(&mut self) -> Option<MonitorEvent> {
        self.monitor.end_net_statistics()
    }

    pub fn set_dormant(&mut self, dormant: bool) -> Option<MonitorEvent> {
        self.monitor.set_dormant(dormant)
    }

    pub fn stall_tick(&mut self) -> Option<MonitorEvent> {
        let counters = self.counters()?;
        self.monitor.stall_tick(counters)
    }

    pub fn statistics_tick(&mut self) -> Option<MonitorEvent> {
        let counters = self.counters()?;
        self.monitor.statistics_tick(counters)
    }

    fn counters(&self) -> Option<TrafficCounters> {
        match &self.traffic {
            Some(source) => Some(source.counters()),
            None => {
                tracing::debug!(slot = self.slot, "no traffic source attached");
                None
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("slot", &self.slot)
            .field("machines", &self.machines.len())
            .field("cids", &self.active_cids())
            .finish()
    }
}
