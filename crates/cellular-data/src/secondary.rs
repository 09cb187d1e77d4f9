//! # In-call Secondary Data
//!
//! On a dual-SIM device the secondary slot may carry data while it holds an
//! IMS call, because the primary slot's radio is busy. This machine moves
//! the default-data slot over for the duration of the call and hands it
//! back afterwards.
//!
//! ```text
//!          guard ok                 DataConnected
//!   Idle ───────────▶ Activating ─────────────────▶ Activated
//!    ▲                     │                            │
//!    │                     └──── guard fails ───────────┤
//!    │                                                  ▼
//!    └──────────── DataDisconnected ────────── Deactivating
//! ```
//!
//! The guard is evaluated against a fresh [`IncallContext`] on every signal,
//! so a call ending, the switch flipping or the RAT dropping to 2G all pull
//! the machine back.

use serde::Serialize;

use crate::apn::types::RadioTech;

/// Dual-SIM modes from this value up run both radios concurrently and need
/// no slot switching.
pub const DSDS_MODE_V3: u8 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallState {
    #[default]
    Idle,
    Active,
    Holding,
    Dialing,
    Alerting,
    Incoming,
    Waiting,
    Disconnecting,
    Disconnected,
}

impl CallState {
    pub fn is_in_call(self) -> bool {
        !matches!(self, CallState::Idle | CallState::Disconnected)
    }
}

/// Everything the guard looks at, sampled by the handler per signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncallContext {
    pub in_call_switch: bool,
    pub slot: i32,
    pub primary_slot: Option<i32>,
    pub default_data_slot: i32,
    pub primary_has_sim: bool,
    pub dsds_mode: u8,
    pub ims_registered: bool,
    pub call_state: CallState,
    pub radio_tech: RadioTech,
    /// Any role on this slot holds or is releasing a context.
    pub has_connected: bool,
}

impl IncallContext {
    /// Whether this slot may carry data during the current call.
    pub fn secondary_can_activate(&self) -> bool {
        if !self.in_call_switch || self.dsds_mode >= DSDS_MODE_V3 {
            return false;
        }
        match self.primary_slot {
            Some(primary) if primary != self.slot => {}
            _ => return false,
        }
        self.primary_has_sim
            && self.ims_registered
            && self.call_state.is_in_call()
            && self.radio_tech.supports_incall_data()
    }

    fn default_is_primary(&self) -> bool {
        Some(self.default_data_slot) == self.primary_slot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SecondaryState {
    Idle,
    ActivatingSecondary,
    ActivatedSecondary,
    DeactivatingSecondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryEvent {
    CallStarted,
    CallEnded,
    SettingsOn,
    SettingsOff,
    DsdsChanged,
    RatChanged,
    DataConnected,
    DataDisconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryEffect {
    SetDefaultDataSlot(i32),
    /// The call is over and the machine is back at rest.
    IncallDataComplete,
}

#[derive(Debug)]
pub struct SecondaryDataStateMachine {
    slot: i32,
    state: SecondaryState,
}

impl SecondaryDataStateMachine {
    pub fn new(slot: i32) -> Self {
        SecondaryDataStateMachine {
            slot,
            state: SecondaryState::Idle,
        }
    }

    pub fn state(&self) -> SecondaryState {
        self.state
    }

    pub fn handle(&mut self, event: SecondaryEvent, ctx: &IncallContext) -> Vec<SecondaryEffect> {
        let mut effects = Vec::new();
        // Local copy so slot switches issued here are seen by later checks.
        let mut ctx = ctx.clone();
        match self.state {
            SecondaryState::Idle => self.on_idle(event, &mut ctx, &mut effects),
            SecondaryState::ActivatingSecondary | SecondaryState::ActivatedSecondary => {
                self.on_active(event, &mut ctx, &mut effects)
            }
            SecondaryState::DeactivatingSecondary => {
                self.on_deactivating(event, &mut ctx, &mut effects)
            }
        }
        effects
    }

    fn on_idle(
        &mut self,
        event: SecondaryEvent,
        ctx: &mut IncallContext,
        effects: &mut Vec<SecondaryEffect>,
    ) {
        match event {
            SecondaryEvent::CallStarted
            | SecondaryEvent::SettingsOn
            | SecondaryEvent::DsdsChanged
            | SecondaryEvent::RatChanged => {
                if ctx.secondary_can_activate() && ctx.default_data_slot != self.slot {
                    self.transition_to(SecondaryState::ActivatingSecondary, ctx, effects);
                    ctx.default_data_slot = self.slot;
                    effects.push(SecondaryEffect::SetDefaultDataSlot(self.slot));
                }
            }
            SecondaryEvent::CallEnded => effects.push(SecondaryEffect::IncallDataComplete),
            _ => {}
        }
    }

    fn on_active(
        &mut self,
        event: SecondaryEvent,
        ctx: &mut IncallContext,
        effects: &mut Vec<SecondaryEffect>,
    ) {
        match event {
            SecondaryEvent::DataConnected if self.state == SecondaryState::ActivatingSecondary => {
                self.transition_to(SecondaryState::ActivatedSecondary, ctx, effects);
            }
            SecondaryEvent::CallEnded if !ctx.call_state.is_in_call() => {
                self.leave(ctx, effects);
            }
            SecondaryEvent::SettingsOff if !ctx.in_call_switch => self.leave(ctx, effects),
            SecondaryEvent::CallStarted
            | SecondaryEvent::SettingsOn
            | SecondaryEvent::DsdsChanged
            | SecondaryEvent::RatChanged
                if !ctx.secondary_can_activate() =>
            {
                tracing::info!(slot = self.slot, ?event, "in-call data no longer allowed");
                self.leave(ctx, effects);
            }
            _ => {}
        }
    }

    fn on_deactivating(
        &mut self,
        event: SecondaryEvent,
        ctx: &mut IncallContext,
        effects: &mut Vec<SecondaryEffect>,
    ) {
        if event == SecondaryEvent::DataDisconnected && ctx.primary_slot != Some(self.slot) {
            self.transition_to(SecondaryState::Idle, ctx, effects);
        }
    }

    fn leave(&mut self, ctx: &mut IncallContext, effects: &mut Vec<SecondaryEffect>) {
        let next = if ctx.default_is_primary() {
            SecondaryState::Idle
        } else {
            SecondaryState::DeactivatingSecondary
        };
        self.transition_to(next, ctx, effects);
    }

    fn transition_to(
        &mut self,
        next: SecondaryState,
        ctx: &mut IncallContext,
        effects: &mut Vec<SecondaryEffect>,
    ) {
        tracing::info!(slot = self.slot, from = ?self.state, to = ?next, "in-call data transition");
        self.state = next;
        match next {
            SecondaryState::Idle => {
                if !ctx.call_state.is_in_call() {
                    effects.push(SecondaryEffect::IncallDataComplete);
                }
            }
            SecondaryState::DeactivatingSecondary => {
                let mut done = true;
                if let Some(primary) = ctx.primary_slot.filter(|_| !ctx.default_is_primary()) {
                    ctx.default_data_slot = primary;
                    effects.push(SecondaryEffect::SetDefaultDataSlot(primary));
                    done = !ctx.has_connected;
                }
                if done {
                    self.transition_to(SecondaryState::Idle, ctx, effects);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> IncallContext {
        IncallContext {
            in_call_switch: true,
            slot: 1,
            primary_slot: Some(0),
            default_data_slot: 0,
            primary_has_sim: true,
            dsds_mode: 2,
            ims_registered: true,
            call_state: CallState::Active,
            radio_tech: RadioTech::Lte,
            has_connected: true,
        }
    }

    fn activated() -> SecondaryDataStateMachine {
        let mut m = SecondaryDataStateMachine::new(1);
        m.handle(SecondaryEvent::CallStarted, &ctx());
        let mut c = ctx();
        c.default_data_slot = 1;
        m.handle(SecondaryEvent::DataConnected, &c);
        assert_eq!(m.state(), SecondaryState::ActivatedSecondary);
        m
    }

    // ─── Guard ──────────────────────────────────────────────────────────

    #[test]
    fn guard_requires_every_condition() {
        assert!(ctx().secondary_can_activate());
        let breakers: [fn(&mut IncallContext); 8] = [
            |c| c.in_call_switch = false,
            |c| c.primary_slot = Some(1),
            |c| c.primary_slot = None,
            |c| c.primary_has_sim = false,
            |c| c.dsds_mode = DSDS_MODE_V3,
            |c| c.ims_registered = false,
            |c| c.call_state = CallState::Disconnected,
            |c| c.radio_tech = RadioTech::Gsm,
        ];
        for (i, brk) in breakers.iter().enumerate() {
            let mut c = ctx();
            brk(&mut c);
            assert!(!c.secondary_can_activate(), "breaker {i}");
        }
    }

    // ─── Transitions ────────────────────────────────────────────────────

    #[test]
    fn call_start_switches_default_slot() {
        let mut m = SecondaryDataStateMachine::new(1);
        let effects = m.handle(SecondaryEvent::CallStarted, &ctx());
        assert_eq!(m.state(), SecondaryState::ActivatingSecondary);
        assert_eq!(effects, vec![SecondaryEffect::SetDefaultDataSlot(1)]);
    }

    #[test]
    fn already_default_stays_idle() {
        let mut m = SecondaryDataStateMachine::new(1);
        let mut c = ctx();
        c.default_data_slot = 1;
        assert!(m.handle(SecondaryEvent::SettingsOn, &c).is_empty());
        assert_eq!(m.state(), SecondaryState::Idle);
    }

    #[test]
    fn call_end_restores_primary_then_waits_for_teardown() {
        let mut m = activated();
        let mut c = ctx();
        c.default_data_slot = 1;
        c.call_state = CallState::Idle;
        let effects = m.handle(SecondaryEvent::CallEnded, &c);
        assert_eq!(m.state(), SecondaryState::DeactivatingSecondary);
        assert_eq!(effects, vec![SecondaryEffect::SetDefaultDataSlot(0)]);

        c.default_data_slot = 0;
        let effects = m.handle(SecondaryEvent::DataDisconnected, &c);
        assert_eq!(m.state(), SecondaryState::Idle);
        assert_eq!(effects, vec![SecondaryEffect::IncallDataComplete]);
    }

    #[test]
    fn nothing_connected_goes_straight_to_idle() {
        let mut m = activated();
        let mut c = ctx();
        c.default_data_slot = 1;
        c.call_state = CallState::Idle;
        c.has_connected = false;
        let effects = m.handle(SecondaryEvent::CallEnded, &c);
        assert_eq!(m.state(), SecondaryState::Idle);
        assert_eq!(
            effects,
            vec![
                SecondaryEffect::SetDefaultDataSlot(0),
                SecondaryEffect::IncallDataComplete
            ]
        );
    }

    #[test]
    fn rat_drop_mid_flight_pulls_back() {
        let mut m = SecondaryDataStateMachine::new(1);
        m.handle(SecondaryEvent::CallStarted, &ctx());
        let mut c = ctx();
        c.default_data_slot = 1;
        c.radio_tech = RadioTech::Gsm;
        let effects = m.handle(SecondaryEvent::RatChanged, &c);
        assert_eq!(m.state(), SecondaryState::DeactivatingSecondary);
        assert_eq!(effects, vec![SecondaryEffect::SetDefaultDataSlot(0)]);
    }

    #[test]
    fn settings_off_pulls_back() {
        let mut m = activated();
        let mut c = ctx();
        c.default_data_slot = 1;
        c.in_call_switch = false;
        m.handle(SecondaryEvent::SettingsOff, &c);
        assert_eq!(m.state(), SecondaryState::DeactivatingSecondary);
    }

    #[test]
    fn call_end_with_primary_default_goes_idle() {
        let mut m = activated();
        let mut c = ctx();
        c.call_state = CallState::Disconnected;
        let effects = m.handle(SecondaryEvent::CallEnded, &c);
        assert_eq!(m.state(), SecondaryState::Idle);
        assert_eq!(effects, vec![SecondaryEffect::IncallDataComplete]);
    }

    #[test]
    fn call_end_while_idle_completes() {
        let mut m = SecondaryDataStateMachine::new(1);
        let mut c = ctx();
        c.call_state = CallState::Idle;
        assert_eq!(
            m.handle(SecondaryEvent::CallEnded, &c),
            vec![SecondaryEffect::IncallDataComplete]
        );
    }

    #[test]
    fn guard_still_holding_keeps_state() {
        let mut m = activated();
        let mut c = ctx();
        c.default_data_slot = 1;
        assert!(m.handle(SecondaryEvent::DsdsChanged, &c).is_empty());
        assert_eq!(m.state(), SecondaryState::ActivatedSecondary);
    }
}
