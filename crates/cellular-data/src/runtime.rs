//! # Slot runtime
//!
//! Runs one [`CellularDataHandler`] on a dedicated worker thread. Every
//! input, including modem replies arriving from transport threads, is
//! funnelled through one bounded channel, so the handler and its machines
//! are only ever touched by the worker.
//!
//! ```text
//!   callers ──┐
//!   radio   ──┼──▶ [SlotCommand channel] ──▶ worker ──▶ handler
//!   timers  ──┘          (bounded)              │
//!                                               └──▶ Arc<Mutex<SlotSnapshot>>
//! ```
//!
//! Timers requested by the handler live in a deadline heap owned by the
//! worker; the worker blocks on the channel until the earliest deadline.
//! Dropping the runtime shuts the worker down.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use quanta::Instant;

use crate::apn::catalog::ApnCatalog;
use crate::apn::holder::NetRequest;
use crate::apn::types::{DisconnectReason, RadioTech};
use crate::error::{DataError, Result};
use crate::handler::{CellularDataHandler, SlotSnapshot, SlotTopology, Timer};
use crate::radio::{RadioListener, RadioNotification, RadioResponse};
use crate::secondary::CallState;

const COMMAND_CAPACITY: usize = 256;

/// Upper bound on a single blocking wait, so a quiet worker still
/// republishes its snapshot now and then.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Everything the worker can be asked to do.
#[derive(Debug)]
pub enum SlotCommand {
    RequestNet(NetRequest),
    ReleaseNet(NetRequest),
    UserDataEnabled(bool),
    UserRoamingEnabled(bool),
    RoamingChanged(bool),
    SimStateChanged(bool),
    ApnChanged(ApnCatalog),
    RadioStateChanged(bool),
    PsAttachChanged(bool),
    PsRatChanged(RadioTech),
    CallStateChanged(CallState),
    DefaultDataSlot(i32),
    Topology(SlotTopology),
    IncallSwitch(bool),
    Radio(RadioResponse),
    Notification(RadioNotification),
    Shutdown,
}

/// Forwards modem traffic into the worker's channel.
struct ChannelListener {
    slot: i32,
    tx: Sender<SlotCommand>,
}

impl RadioListener for ChannelListener {
    fn on_response(&self, response: RadioResponse) {
        if self.tx.send(SlotCommand::Radio(response)).is_err() {
            tracing::debug!(slot = self.slot, "radio response after shutdown dropped");
        }
    }

    fn on_notification(&self, notification: RadioNotification) {
        if self.tx.send(SlotCommand::Notification(notification)).is_err() {
            tracing::debug!(slot = self.slot, "radio notification after shutdown dropped");
        }
    }
}

/// Handle to a slot worker.
///
/// Transports must answer from their own threads: a reply sent from inside
/// `activate`/`deactivate` runs on the worker and could block on a full
/// channel.
pub struct SlotRuntime {
    slot: i32,
    tx: Sender<SlotCommand>,
    snapshot: Arc<Mutex<SlotSnapshot>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SlotRuntime {
    pub fn spawn(mut handler: CellularDataHandler) -> Result<Self> {
        let slot = handler.slot();
        let (tx, rx) = bounded(COMMAND_CAPACITY);
        handler.attach(Arc::new(ChannelListener {
            slot,
            tx: tx.clone(),
        }));
        let snapshot = Arc::new(Mutex::new(handler.snapshot()));
        let snapshot_clone = snapshot.clone();

        let handle = thread::Builder::new()
            .name(format!("cellular-slot{slot}"))
            .spawn(move || slot_worker(handler, rx, snapshot_clone))?;

        tracing::info!(slot, "slot worker started");
        Ok(Self {
            slot,
            tx,
            snapshot,
            handle: Some(handle),
        })
    }

    pub fn slot(&self) -> i32 {
        self.slot
    }

    pub fn send(&self, command: SlotCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| DataError::Disconnected)
    }

    pub fn request_net(&self, request: NetRequest) -> Result<()> {
        self.send(SlotCommand::RequestNet(request))
    }

    pub fn release_net(&self, request: NetRequest) -> Result<()> {
        self.send(SlotCommand::ReleaseNet(request))
    }

    /// Listener a transport can be handed to reach this slot directly.
    pub fn listener(&self) -> Arc<dyn RadioListener> {
        Arc::new(ChannelListener {
            slot: self.slot,
            tx: self.tx.clone(),
        })
    }

    /// Latest published state (thread-safe clone).
    pub fn snapshot(&self) -> SlotSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn snapshot_handle(&self) -> Arc<Mutex<SlotSnapshot>> {
        self.snapshot.clone()
    }

    /// Stops the worker and waits for it. Idempotent.
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(SlotCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(slot = self.slot, "slot worker panicked");
            }
        }
    }
}

impl Drop for SlotRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────

struct Pending {
    deadline: Instant,
    seq: u64,
    timer: Timer,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline must pop
    // first. Equal deadlines fire in scheduling order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<Pending>,
    seq: u64,
}

impl TimerQueue {
    fn push(&mut self, now: Instant, delay: Duration, timer: Timer) {
        self.seq += 1;
        self.heap.push(Pending {
            deadline: now + delay,
            seq: self.seq,
            timer,
        });
    }

    fn pop_due(&mut self, now: Instant) -> Option<Timer> {
        if self.heap.peek()?.deadline > now {
            return None;
        }
        self.heap.pop().map(|p| p.timer)
    }

    fn wait(&self, now: Instant) -> Duration {
        self.heap
            .peek()
            .map(|p| p.deadline.saturating_duration_since(now).min(IDLE_WAIT))
            .unwrap_or(IDLE_WAIT)
    }
}

fn slot_worker(
    mut handler: CellularDataHandler,
    rx: Receiver<SlotCommand>,
    snapshot: Arc<Mutex<SlotSnapshot>>,
) {
    let slot = handler.slot();
    let mut timers = TimerQueue::default();

    loop {
        let now = Instant::now();
        while let Some(timer) = timers.pop_due(now) {
            handler.on_timer(timer);
        }
        for s in handler.take_scheduled() {
            timers.push(Instant::now(), s.delay, s.timer);
        }
        publish(&handler, &snapshot);

        match rx.recv_timeout(timers.wait(Instant::now())) {
            Ok(SlotCommand::Shutdown) => break,
            Ok(command) => apply(&mut handler, command),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        for s in handler.take_scheduled() {
            timers.push(Instant::now(), s.delay, s.timer);
        }
    }

    handler.clear_all_connections(DisconnectReason::ClearConnection);
    publish(&handler, &snapshot);
    tracing::info!(slot, pending_timers = timers.heap.len(), "slot worker stopped");
}

fn publish(handler: &CellularDataHandler, snapshot: &Mutex<SlotSnapshot>) {
    let next = handler.snapshot();
    *snapshot.lock().unwrap_or_else(|e| e.into_inner()) = next;
}

fn apply(handler: &mut CellularDataHandler, command: SlotCommand) {
    match command {
        SlotCommand::RequestNet(request) => {
            if let Err(e) = handler.request_net(request) {
                tracing::warn!(slot = handler.slot(), error = %e, "net request rejected");
            }
        }
        SlotCommand::ReleaseNet(request) => {
            if let Err(e) = handler.release_net(&request) {
                tracing::warn!(slot = handler.slot(), error = %e, "net release rejected");
            }
        }
        SlotCommand::UserDataEnabled(on) => handler.set_user_data_enabled(on),
        SlotCommand::UserRoamingEnabled(on) => handler.set_user_roaming_enabled(on),
        SlotCommand::RoamingChanged(on) => handler.on_roaming_changed(on),
        SlotCommand::SimStateChanged(ready) => handler.on_sim_state_changed(ready),
        SlotCommand::ApnChanged(catalog) => handler.on_apn_changed(catalog),
        SlotCommand::RadioStateChanged(on) => handler.on_radio_state_changed(on),
        SlotCommand::PsAttachChanged(attached) => handler.on_ps_attach_changed(attached),
        SlotCommand::PsRatChanged(rat) => handler.on_ps_rat_changed(rat),
        SlotCommand::CallStateChanged(state) => handler.on_call_state_changed(state),
        SlotCommand::DefaultDataSlot(slot) => handler.set_default_data_slot(slot),
        SlotCommand::Topology(topology) => handler.set_topology(topology),
        SlotCommand::IncallSwitch(on) => handler.set_incall_switch(on),
        SlotCommand::Radio(response) => handler.on_radio_response(response),
        SlotCommand::Notification(notification) => handler.on_radio_notification(notification),
        SlotCommand::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_pop_in_deadline_order() {
        let mut q = TimerQueue::default();
        let now = Instant::now();
        q.push(now, Duration::from_millis(30), Timer::Statistics { generation: 1 });
        q.push(now, Duration::from_millis(10), Timer::StallCheck { generation: 1 });
        q.push(now, Duration::from_millis(10), Timer::EstablishAll);

        assert_eq!(q.pop_due(now), None);
        let later = now + Duration::from_millis(20);
        assert_eq!(q.pop_due(later), Some(Timer::StallCheck { generation: 1 }));
        assert_eq!(q.pop_due(later), Some(Timer::EstablishAll));
        assert_eq!(q.pop_due(later), None);
        assert_eq!(q.pop_due(now + Duration::from_millis(30)), Some(Timer::Statistics { generation: 1 }));
    }

    #[test]
    fn wait_is_capped() {
        let mut q = TimerQueue::default();
        let now = Instant::now();
        assert_eq!(q.wait(now), IDLE_WAIT);
        q.push(now, Duration::from_secs(60), Timer::StallCheck { generation: 1 });
        assert_eq!(q.wait(now), IDLE_WAIT);
        q.push(now, Duration::from_millis(5), Timer::Statistics { generation: 1 });
        assert!(q.wait(now) <= Duration::from_millis(5));
    }
}
