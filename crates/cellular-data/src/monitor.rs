//! # Traffic Monitoring
//!
//! Two periodic checks driven by the slot's timer queue:
//!
//! - **Stall detection**: packets leaving with nothing coming back means
//!   the data path is wedged. Once enough go unanswered the monitor asks
//!   for the next, progressively heavier, recovery step.
//! - **Flow statistics**: classifies recent traffic as up, down, both or
//!   none so the UI can show activity arrows.
//!
//! ```text
//!   RequestContextList ─▶ CleanupConnections ─▶ ReregisterNetwork ─▶ RadioRestart
//!          ▲                                                              │
//!          └──────────────────────────── wraps ───────────────────────────┘
//! ```

use serde::Serialize;

use crate::config::MonitorConfig;

/// Cumulative packet counters of the cellular interfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    pub tx_packets: u64,
    pub rx_packets: u64,
}

impl TrafficCounters {
    /// Per-direction growth since `prev`. Counter resets read as zero.
    fn delta(self, prev: TrafficCounters) -> (u64, u64) {
        (
            self.tx_packets.saturating_sub(prev.tx_packets),
            self.rx_packets.saturating_sub(prev.rx_packets),
        )
    }
}

pub trait TrafficSource: Send {
    fn counters(&self) -> TrafficCounters;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    RequestContextList,
    CleanupConnections,
    ReregisterNetwork,
    RadioRestart,
}

impl RecoveryAction {
    const LADDER: [RecoveryAction; 4] = [
        RecoveryAction::RequestContextList,
        RecoveryAction::CleanupConnections,
        RecoveryAction::ReregisterNetwork,
        RecoveryAction::RadioRestart,
    ];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum DataFlowType {
    #[default]
    None,
    Up,
    Down,
    UpDown,
    Dormant,
}

impl DataFlowType {
    fn from_delta(tx: u64, rx: u64) -> Self {
        match (tx > 0, rx > 0) {
            (true, true) => DataFlowType::UpDown,
            (true, false) => DataFlowType::Up,
            (false, true) => DataFlowType::Down,
            (false, false) => DataFlowType::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    Recovery(RecoveryAction),
    DataFlowChanged(DataFlowType),
}

#[derive(Debug)]
pub struct StallMonitor {
    config: MonitorConfig,
    stall_active: bool,
    statistics_active: bool,
    stall_last: Option<TrafficCounters>,
    stats_last: Option<TrafficCounters>,
    unanswered: u64,
    ladder: usize,
    flow: DataFlowType,
    dormant: bool,
    /// Bumped on every start, so ticks queued by an earlier run can be told
    /// apart from the current one.
    stall_generation: u64,
    statistics_generation: u64,
}

impl StallMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        StallMonitor {
            config,
            stall_active: false,
            statistics_active: false,
            stall_last: None,
            stats_last: None,
            unanswered: 0,
            ladder: 0,
            flow: DataFlowType::None,
            dormant: false,
            stall_generation: 0,
            statistics_generation: 0,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    // ─── Stall Detection ────────────────────────────────────────────────

    /// Returns `false` if detection was already running.
    pub fn start_stall_detection(&mut self) -> bool {
        if self.stall_active {
            return false;
        }
        self.stall_active = true;
        self.stall_generation += 1;
        self.stall_last = None;
        self.unanswered = 0;
        self.ladder = 0;
        tracing::debug!("stall detection started");
        true
    }

    pub fn stop_stall_detection(&mut self) {
        if self.stall_active {
            tracing::debug!("stall detection stopped");
        }
        self.stall_active = false;
        self.stall_last = None;
    }

    pub fn is_stall_detection_active(&self) -> bool {
        self.stall_active
    }

    pub fn stall_generation(&self) -> u64 {
        self.stall_generation
    }

    pub fn stall_tick(&mut self, now: TrafficCounters) -> Option<MonitorEvent> {
        if !self.stall_active {
            return None;
        }
        let prev = self.stall_last.replace(now)?;
        let (tx, rx) = now.delta(prev);
        if rx > 0 {
            if self.ladder != 0 || self.unanswered != 0 {
                tracing::info!(unanswered = self.unanswered, "data path recovered");
            }
            self.unanswered = 0;
            self.ladder = 0;
            return None;
        }
        self.unanswered += tx;
        if self.unanswered < self.config.recovery_trigger_packets {
            return None;
        }
        let action = RecoveryAction::LADDER[self.ladder];
        tracing::warn!(unanswered = self.unanswered, ?action, "data stall detected");
        self.ladder = (self.ladder + 1) % RecoveryAction::LADDER.len();
        self.unanswered = 0;
        Some(MonitorEvent::Recovery(action))
    }

    // ─── Flow Statistics ────────────────────────────────────────────────

    pub fn begin_net_statistics(&mut self) -> bool {
        if self.statistics_active {
            return false;
        }
        self.statistics_active = true;
        self.statistics_generation += 1;
        self.stats_last = None;
        true
    }

    /// Stops sampling and reports `None` flow if anything else was shown.
    pub fn end_net_statistics(&mut self) -> Option<MonitorEvent> {
        self.statistics_active = false;
        self.stats_last = None;
        self.set_flow(DataFlowType::None)
    }

    pub fn is_statistics_active(&self) -> bool {
        self.statistics_active
    }

    pub fn statistics_generation(&self) -> u64 {
        self.statistics_generation
    }

    /// Modem reported the link dormant (or active again).
    pub fn set_dormant(&mut self, dormant: bool) -> Option<MonitorEvent> {
        self.dormant = dormant;
        if dormant {
            self.set_flow(DataFlowType::Dormant)
        } else {
            self.set_flow(DataFlowType::None)
        }
    }

    pub fn statistics_tick(&mut self, now: TrafficCounters) -> Option<MonitorEvent> {
        if !self.statistics_active {
            return None;
        }
        let prev = self.stats_last.replace(now)?;
        let (tx, rx) = now.delta(prev);
        let flow = match DataFlowType::from_delta(tx, rx) {
            DataFlowType::None if self.dormant => DataFlowType::Dormant,
            other => other,
        };
        self.set_flow(flow)
    }

    pub fn flow(&self) -> DataFlowType {
        self.flow
    }

    fn set_flow(&mut self, flow: DataFlowType) -> Option<MonitorEvent> {
        if flow == self.flow {
            return None;
        }
        self.flow = flow;
        Some(MonitorEvent::DataFlowChanged(flow))
    }
}
