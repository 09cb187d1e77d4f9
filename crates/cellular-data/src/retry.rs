//! # Retry policy
//!
//! One [`RetryPolicy`] per role. It walks the role's candidate APNs,
//! skipping candidates that are bad or have used up their attempts, and
//! computes how long to wait before the next attempt.
//!
//! Delays are tiered by role rather than exponential:
//!
//! ```text
//!   delay = jitter[0, max_jitter]
//!         + internal_default_delay            role = internal-default
//!         + setup_fail | modem_dend delay     role = default, by scene
//!         + other_delay                       any other role
//! ```
//!
//! The two default-role delays are live tunables backed by the
//! [`PropertyStore`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngExt as _, SeedableRng};

use crate::apn::item::ApnItem;
use crate::apn::types::{ApnType, DisconnectReason};
use crate::config::RetryConfig;
use crate::extension::Extension;
use crate::props::PropertyStore;
use crate::radio::pdp_cause;

pub const PROP_SETUP_FAIL_DELAY: &str = "persist.telephony.setupfail.delay";
pub const PROP_MODEM_DEND_DELAY: &str = "persist.telephony.modemdend.delay";

/// What ended the previous attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryScene {
    /// Activation failed or was rejected.
    SetupFail,
    /// The modem tore down a context that had been up.
    ModemDeactivate,
}

/// Live-tunable default-role delays, shared by every policy on a slot.
#[derive(Debug, Clone)]
pub struct RetryTunables {
    setup_fail_ms: Arc<AtomicU64>,
    modem_dend_ms: Arc<AtomicU64>,
}

impl RetryTunables {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            setup_fail_ms: Arc::new(AtomicU64::new(config.default_setup_fail_delay.as_millis() as u64)),
            modem_dend_ms: Arc::new(AtomicU64::new(config.default_modem_dend_delay.as_millis() as u64)),
        }
    }

    /// Seeds from the current property values and follows later changes.
    /// Returns the subscription ids.
    pub fn watch(&self, props: &PropertyStore) -> Vec<u64> {
        [PROP_SETUP_FAIL_DELAY, PROP_MODEM_DEND_DELAY]
            .into_iter()
            .map(|key| {
                if let Some(value) = props.get(key) {
                    self.on_prop_changed(key, &value);
                }
                let this = self.clone();
                props.subscribe(key, move |k, v| this.on_prop_changed(k, v))
            })
            .collect()
    }

    /// Unparseable values are ignored and the previous delay stays.
    pub fn on_prop_changed(&self, key: &str, value: &str) {
        let Ok(ms) = value.trim().parse::<u64>() else {
            tracing::warn!(key, value, "ignoring unparseable retry delay");
            return;
        };
        match key {
            PROP_SETUP_FAIL_DELAY => self.setup_fail_ms.store(ms, Ordering::Relaxed),
            PROP_MODEM_DEND_DELAY => self.modem_dend_ms.store(ms, Ordering::Relaxed),
            _ => return,
        }
        tracing::info!(key, ms, "retry delay updated");
    }

    pub fn setup_fail_delay(&self) -> Duration {
        Duration::from_millis(self.setup_fail_ms.load(Ordering::Relaxed))
    }

    pub fn modem_dend_delay(&self) -> Duration {
        Duration::from_millis(self.modem_dend_ms.load(Ordering::Relaxed))
    }
}

/// Maps a PDP cause from a setup result onto the retry taxonomy.
pub fn pdp_cause_to_reason(cause: i32) -> DisconnectReason {
    use pdp_cause::*;
    match cause {
        RETRY
        | UNKNOWN
        | SHORTAGE_RESOURCES
        | ACTIVATION_REJECTED_UNSPECIFIED
        | SERVICE_OPTION_TEMPORARILY_OUT_OF_ORDER
        | APN_NOT_SUPPORTED_IN_CURRENT_RAT_PLMN
        | APN_RESTRICTION_VALUE_INCOMPATIBLE => DisconnectReason::RetryConnection,
        OPERATOR_DETERMINED_BARRING | MISSING_OR_UNKNOWN_APN => DisconnectReason::PermanentReject,
        MULT_ACCESSES_PDN_NOT_ALLOWED
        | UNKNOWN_PDP_ADDR_OR_TYPE
        | USER_VERIFICATION
        | ACTIVATION_REJECTED_GGSN
        | SERVICE_OPTION_NOT_SUPPORTED
        | REQUESTED_SERVICE_OPTION_NOT_SUBSCRIBED
        | NSAPI_ALREADY_USED
        | IPV4_ONLY_ALLOWED
        | IPV6_ONLY_ALLOWED
        | IPV4V6_ONLY_ALLOWED
        | NON_IP_ONLY_ALLOWED
        | MAX_NUM_OF_PDP_CONTEXTS
        | PROTOCOL_ERRORS => DisconnectReason::ClearConnection,
        c if c > PROTOCOL_ERRORS && c < APN_RESTRICTION_VALUE_INCOMPATIBLE => {
            DisconnectReason::ClearConnection
        }
        _ => DisconnectReason::RetryConnection,
    }
}

pub struct RetryPolicy {
    matched_apns: Vec<Arc<ApnItem>>,
    current_index: usize,
    try_count: u32,
    max_try_count: u32,
    config: RetryConfig,
    tunables: RetryTunables,
    rng: StdRng,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig, tunables: RetryTunables) -> Self {
        Self::with_seed(config, tunables, rand::rng().random())
    }

    pub fn with_seed(config: RetryConfig, tunables: RetryTunables, seed: u64) -> Self {
        Self {
            matched_apns: Vec::new(),
            current_index: 0,
            try_count: 0,
            max_try_count: config.max_try_count.max(1),
            config,
            tunables,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Installs a fresh candidate list and rewinds the cursor.
    pub fn set_matched_apns(&mut self, apns: Vec<Arc<ApnItem>>) {
        self.matched_apns = apns;
        self.current_index = 0;
        self.try_count = 0;
    }

    pub fn matched_apns(&self) -> &[Arc<ApnItem>] {
        &self.matched_apns
    }

    pub fn clear_retry_apns(&mut self) {
        self.matched_apns.clear();
        self.current_index = 0;
        self.try_count = 0;
    }

    pub fn mark_bad_apn(&self, apn: &ApnItem) {
        tracing::info!(apn = %apn.attr.apn, profile = apn.attr.profile_id, "marking apn bad");
        apn.mark_bad(true);
    }

    /// Resets the attempt budget of the current candidate after a success.
    pub fn restart_retry_count(&mut self) {
        self.try_count = 0;
    }

    pub fn try_count(&self) -> u32 {
        self.try_count
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn is_all_bad_apn(&self) -> bool {
        !self.matched_apns.is_empty() && self.matched_apns.iter().all(|a| a.is_bad())
    }

    /// Next candidate to try, or `None` when the list is empty or every
    /// candidate is bad.
    ///
    /// Walks at most one full lap plus the starting candidate, so it
    /// terminates even if bad flags change underneath it.
    pub fn next_retry_apn_item(&mut self) -> Option<Arc<ApnItem>> {
        if self.matched_apns.is_empty() || self.is_all_bad_apn() {
            return None;
        }
        for _ in 0..=self.matched_apns.len() {
            if self.current_index >= self.matched_apns.len() {
                self.current_index = 0;
                self.try_count = 0;
            }
            let item = &self.matched_apns[self.current_index];
            self.try_count += 1;
            if item.is_bad() || self.try_count > self.max_try_count {
                self.try_count = 0;
                self.current_index += 1;
                continue;
            }
            return Some(item.clone());
        }
        None
    }

    /// Delay before the next attempt for `apn_type`.
    ///
    /// A positive modem-suggested time replaces the role term; the jitter
    /// always applies. The extension, when loaded, gets the final word.
    pub fn next_retry_delay(
        &mut self,
        apn_type: ApnType,
        reason: DisconnectReason,
        suggested: Option<Duration>,
        scene: RetryScene,
        extension: &Extension,
    ) -> Duration {
        let max_jitter = self.config.max_jitter.as_millis() as u64;
        let jitter = Duration::from_millis(self.rng.random_range(0..=max_jitter));
        let base = match suggested.filter(|d| !d.is_zero()) {
            Some(d) => d,
            None => match apn_type {
                ApnType::InternalDefault => self.config.internal_default_delay,
                ApnType::Default => match scene {
                    RetryScene::SetupFail => self.tunables.setup_fail_delay(),
                    RetryScene::ModemDeactivate => self.tunables.modem_dend_delay(),
                },
                _ => self.config.other_delay,
            },
        };
        let delay = extension.retry_delay(apn_type, reason, base + jitter);
        tracing::debug!(
            %apn_type,
            ?reason,
            ?scene,
            delay_ms = delay.as_millis() as u64,
            "next retry delay"
        );
        delay
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("matched", &self.matched_apns.len())
            .field("current_index", &self.current_index)
            .field("try_count", &self.try_count)
            .field("max_try_count", &self.max_try_count)
            .finish()
    }
}
