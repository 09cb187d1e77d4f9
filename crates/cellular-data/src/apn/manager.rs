//! Holder registry for one slot.
//!
//! Keeps one [`ApnHolder`] per held role, sorted by descending priority, and
//! the catalog the holders draw candidates from.

use std::sync::Arc;

use super::catalog::ApnCatalog;
use super::holder::ApnHolder;
use super::item::ApnItem;
use super::types::{ApnProfileState, ApnType, NetCapability};
use crate::config::RetryConfig;
use crate::error::{DataError, Result};
use crate::retry::{RetryPolicy, RetryTunables};

#[derive(Debug)]
pub struct ApnManager {
    holders: Vec<ApnHolder>,
    catalog: ApnCatalog,
}

impl ApnManager {
    pub fn new(catalog: ApnCatalog, retry: &RetryConfig, tunables: &RetryTunables) -> Self {
        let mut holders: Vec<ApnHolder> = ApnType::HELD
            .into_iter()
            .map(|t| ApnHolder::new(t, RetryPolicy::new(retry.clone(), tunables.clone())))
            .collect();
        // Stable: equal priorities keep declaration order.
        holders.sort_by(|a, b| b.priority().cmp(&a.priority()));
        ApnManager { holders, catalog }
    }

    pub fn holders(&self) -> &[ApnHolder] {
        &self.holders
    }

    pub fn holders_mut(&mut self) -> &mut [ApnHolder] {
        &mut self.holders
    }

    pub fn find_holder(&self, apn_type: ApnType) -> Option<&ApnHolder> {
        self.holders.iter().find(|h| h.apn_type() == apn_type)
    }

    pub fn find_holder_mut(&mut self, apn_type: ApnType) -> Option<&mut ApnHolder> {
        self.holders.iter_mut().find(|h| h.apn_type() == apn_type)
    }

    /// Role serving `capability`, if one is held on this slot.
    pub fn find_type_by_capability(&self, capability: NetCapability) -> Result<ApnType> {
        let apn_type = ApnType::from_capability(capability);
        if self.find_holder(apn_type).is_some() {
            Ok(apn_type)
        } else {
            Err(DataError::UnknownCapability(capability))
        }
    }

    /// Capability of the highest-priority role among `mask`.
    pub fn find_best_capability(&self, mask: u64) -> Option<NetCapability> {
        self.holders
            .iter()
            .map(|h| h.apn_type().capability())
            .find(|c| mask & c.bit() != 0)
            .or_else(|| NetCapability::best_of(mask))
    }

    /// True if a strictly higher priority role is enabled and holding (or
    /// about to hold) a context.
    pub fn has_any_higher_priority_connection(&self, apn_type: ApnType) -> bool {
        let priority = apn_type.priority();
        self.holders.iter().any(|h| {
            h.priority() > priority
                && h.is_data_call_enabled()
                && matches!(
                    h.state(),
                    ApnProfileState::Connected
                        | ApnProfileState::Connecting
                        | ApnProfileState::Disconnecting
                )
        })
    }

    pub fn has_any_connected_state(&self) -> bool {
        self.holders.iter().any(|h| {
            matches!(
                h.state(),
                ApnProfileState::Connected | ApnProfileState::Disconnecting
            )
        })
    }

    pub fn overall_state(&self) -> ApnProfileState {
        fold_state(self.holders.iter())
    }

    pub fn overall_default_state(&self) -> ApnProfileState {
        fold_state(self.holders.iter().filter(|h| h.apn_type().is_internet()))
    }

    pub fn catalog(&self) -> &ApnCatalog {
        &self.catalog
    }

    /// Swaps in a reloaded catalog. Every holder's campaign is restarted
    /// since its candidates may no longer exist.
    pub fn set_catalog(&mut self, catalog: ApnCatalog) {
        self.catalog = catalog;
        for holder in &mut self.holders {
            holder.retry_mut().clear_retry_apns();
        }
    }

    pub fn filter_matched(&self, apn_type: ApnType, roaming: bool) -> Vec<Arc<ApnItem>> {
        self.catalog.filter_matched(apn_type, roaming)
    }

    pub fn ril_attach_apn(&self) -> Option<Arc<ApnItem>> {
        self.catalog.ril_attach_apn()
    }

    pub fn clear_all_bad(&self) {
        self.catalog.clear_all_bad();
    }
}

/// Connected beats Connecting/Retrying beats Idle beats Failed.
fn fold_state<'a>(holders: impl Iterator<Item = &'a ApnHolder>) -> ApnProfileState {
    let mut any_connecting = false;
    let mut any_idle = false;
    let mut any_failed = false;
    for h in holders {
        match h.state() {
            ApnProfileState::Connected => return ApnProfileState::Connected,
            ApnProfileState::Connecting | ApnProfileState::Retrying => any_connecting = true,
            ApnProfileState::Idle | ApnProfileState::Disconnecting => any_idle = true,
            ApnProfileState::Failed => any_failed = true,
        }
    }
    if any_connecting {
        ApnProfileState::Connecting
    } else if any_idle || !any_failed {
        ApnProfileState::Idle
    } else {
        ApnProfileState::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apn::types::Priority;

    fn manager() -> ApnManager {
        let config = RetryConfig::default();
        let tunables = RetryTunables::new(&config);
        ApnManager::new(ApnCatalog::fallback(), &config, &tunables)
    }

    #[test]
    fn holders_sorted_by_priority() {
        let m = manager();
        let priorities: Vec<Priority> = m.holders().iter().map(|h| h.priority()).collect();
        let mut sorted = priorities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(priorities, sorted);
        assert_eq!(m.holders()[0].apn_type(), ApnType::Ia);
        assert_eq!(m.holders().last().map(|h| h.apn_type()), Some(ApnType::InternalDefault));
    }

    #[test]
    fn capability_lookup() {
        let m = manager();
        assert_eq!(
            m.find_type_by_capability(NetCapability::Mms).unwrap(),
            ApnType::Mms
        );
        assert!(matches!(
            m.find_type_by_capability(NetCapability::Ims),
            Err(DataError::UnknownCapability(NetCapability::Ims))
        ));
        let mask = NetCapability::Internet.bit() | NetCapability::Mms.bit();
        assert_eq!(m.find_best_capability(mask), Some(NetCapability::Mms));
        assert_eq!(m.find_best_capability(0), None);
    }

    #[test]
    fn higher_priority_requires_enabled_and_busy() {
        let mut m = manager();
        assert!(!m.has_any_higher_priority_connection(ApnType::Default));

        let mms = m.find_holder_mut(ApnType::Mms).unwrap();
        mms.set_state(ApnProfileState::Connected);
        assert!(!m.has_any_higher_priority_connection(ApnType::Default));

        let mms = m.find_holder_mut(ApnType::Mms).unwrap();
        mms.set_data_call_enabled(true);
        assert!(m.has_any_higher_priority_connection(ApnType::Default));
        // Equal priority does not count.
        assert!(!m.has_any_higher_priority_connection(ApnType::Supl));

        let mms = m.find_holder_mut(ApnType::Mms).unwrap();
        mms.set_state(ApnProfileState::Retrying);
        assert!(!m.has_any_higher_priority_connection(ApnType::Default));
    }

    #[test]
    fn overall_state_ordering() {
        let mut m = manager();
        assert_eq!(m.overall_state(), ApnProfileState::Idle);
        for h in m.holders_mut() {
            h.set_state(ApnProfileState::Failed);
        }
        assert_eq!(m.overall_state(), ApnProfileState::Failed);
        m.find_holder_mut(ApnType::Mms).unwrap().set_state(ApnProfileState::Retrying);
        assert_eq!(m.overall_state(), ApnProfileState::Connecting);
        assert_eq!(m.overall_default_state(), ApnProfileState::Failed);
        m.find_holder_mut(ApnType::Default).unwrap().set_state(ApnProfileState::Connected);
        assert_eq!(m.overall_state(), ApnProfileState::Connected);
        assert_eq!(m.overall_default_state(), ApnProfileState::Connected);
        assert!(m.has_any_connected_state());
    }

    #[test]
    fn catalog_swap_restarts_campaigns() {
        let mut m = manager();
        let candidates = m.filter_matched(ApnType::Default, false);
        assert_eq!(candidates.len(), 1);
        m.find_holder_mut(ApnType::Default)
            .unwrap()
            .retry_mut()
            .set_matched_apns(candidates);
        m.set_catalog(ApnCatalog::fallback());
        assert!(m.find_holder(ApnType::Default).unwrap().retry().matched_apns().is_empty());
        assert_eq!(m.ril_attach_apn().unwrap().attr.apn, "cmnet");
    }
}
