//! Optional vendor policy hook.
//!
//! A platform may plug in a [`PolicyExtension`] to tweak retry timing,
//! remap modem causes or veto activations. [`Extension`] wraps the optional
//! object so every call site gets the stock behaviour when none is loaded.

use std::sync::Arc;
use std::time::Duration;

use crate::apn::types::{ApnType, DisconnectReason};

pub trait PolicyExtension: Send + Sync {
    fn retry_delay_override(
        &self,
        _apn_type: ApnType,
        _reason: DisconnectReason,
        _computed: Duration,
    ) -> Option<Duration> {
        None
    }

    fn map_cause(&self, _pdp_cause: i32, _default: DisconnectReason) -> Option<DisconnectReason> {
        None
    }

    fn is_apn_allowed_active(&self, _slot: i32, _apn_type: ApnType, _roaming: bool) -> bool {
        true
    }
}

#[derive(Clone, Default)]
pub struct Extension(Option<Arc<dyn PolicyExtension>>);

impl Extension {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new(ext: Arc<dyn PolicyExtension>) -> Self {
        Self(Some(ext))
    }

    pub fn is_loaded(&self) -> bool {
        self.0.is_some()
    }

    pub fn retry_delay(
        &self,
        apn_type: ApnType,
        reason: DisconnectReason,
        computed: Duration,
    ) -> Duration {
        self.0
            .as_ref()
            .and_then(|e| e.retry_delay_override(apn_type, reason, computed))
            .unwrap_or(computed)
    }

    pub fn map_cause(&self, pdp_cause: i32, default: DisconnectReason) -> DisconnectReason {
        self.0
            .as_ref()
            .and_then(|e| e.map_cause(pdp_cause, default))
            .unwrap_or(default)
    }

    pub fn is_apn_allowed_active(&self, slot: i32, apn_type: ApnType, roaming: bool) -> bool {
        self.0
            .as_ref()
            .is_none_or(|e| e.is_apn_allowed_active(slot, apn_type, roaming))
    }
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Extension").field(&self.is_loaded()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Strict;

    impl PolicyExtension for Strict {
        fn retry_delay_override(
            &self,
            apn_type: ApnType,
            _reason: DisconnectReason,
            _computed: Duration,
        ) -> Option<Duration> {
            (apn_type == ApnType::Mms).then(|| Duration::from_secs(60))
        }

        fn map_cause(&self, pdp_cause: i32, _default: DisconnectReason) -> Option<DisconnectReason> {
            (pdp_cause == 999).then_some(DisconnectReason::PermanentReject)
        }

        fn is_apn_allowed_active(&self, _slot: i32, apn_type: ApnType, roaming: bool) -> bool {
            !(roaming && apn_type == ApnType::Mms)
        }
    }

    #[test]
    fn absent_extension_is_identity() {
        let ext = Extension::none();
        let d = Duration::from_millis(1234);
        assert_eq!(ext.retry_delay(ApnType::Default, DisconnectReason::RetryConnection, d), d);
        assert_eq!(
            ext.map_cause(8, DisconnectReason::ClearConnection),
            DisconnectReason::ClearConnection
        );
        assert!(ext.is_apn_allowed_active(0, ApnType::Mms, true));
    }

    #[test]
    fn loaded_extension_overrides_selectively() {
        let ext = Extension::new(Arc::new(Strict));
        let d = Duration::from_millis(1234);
        assert_eq!(
            ext.retry_delay(ApnType::Mms, DisconnectReason::RetryConnection, d),
            Duration::from_secs(60)
        );
        assert_eq!(ext.retry_delay(ApnType::Default, DisconnectReason::RetryConnection, d), d);
        assert_eq!(
            ext.map_cause(999, DisconnectReason::RetryConnection),
            DisconnectReason::PermanentReject
        );
        assert!(!ext.is_apn_allowed_active(0, ApnType::Mms, true));
        assert!(ext.is_apn_allowed_active(0, ApnType::Mms, false));
    }
}
