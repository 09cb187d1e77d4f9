//! APN catalog: the carrier's profile list for one SIM.
//!
//! Loaded from TOML, coalesced so two profiles that would bring up the same
//! modem context become one, and queried per role by the holders.
//!
//! ```toml
//! preferred_id = 2
//!
//! [[apn]]
//! profile_id = 1
//! types = "default,supl"
//! numeric = "46001"
//! apn = "internet"
//! protocol = "IPV4V6"
//! roaming_protocol = "IP"
//! ```

use std::sync::Arc;

use serde::Deserialize;

use super::item::{ApnAttribute, ApnItem, PROTOCOL_IPV4V6};
use super::types::ApnType;
use crate::error::{DataError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApnCatalogInput {
    pub preferred_id: Option<i32>,
    pub apn: Vec<ApnAttribute>,
}

#[derive(Debug, Clone, Default)]
pub struct ApnCatalog {
    items: Vec<Arc<ApnItem>>,
    preferred_id: Option<i32>,
}

impl ApnCatalog {
    /// Catalog used when the carrier database yields nothing.
    pub fn fallback() -> Self {
        Self {
            items: vec![
                ApnItem::make_default(ApnType::Default),
                ApnItem::make_default(ApnType::Mms),
            ],
            preferred_id: None,
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(Self::fallback());
        }
        let parsed: ApnCatalogInput = toml::from_str(input)
            .map_err(|e| DataError::InvalidConfig(format!("invalid apn catalog: {e}")))?;
        parsed.resolve()
    }

    pub fn items(&self) -> &[Arc<ApnItem>] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn preferred_id(&self) -> Option<i32> {
        self.preferred_id
    }

    pub fn find_by_profile_id(&self, profile_id: i32) -> Option<Arc<ApnItem>> {
        self.items
            .iter()
            .find(|i| i.attr.profile_id == profile_id)
            .cloned()
    }

    fn preferred(&self) -> Option<&Arc<ApnItem>> {
        let id = self.preferred_id?;
        self.items.iter().find(|i| i.attr.profile_id == id)
    }

    pub fn is_preferred_user_edited(&self) -> bool {
        self.preferred().is_some_and(|i| i.attr.is_edited)
    }

    /// Candidates for a role, in the order they should be tried.
    pub fn filter_matched(&self, apn_type: ApnType, roaming: bool) -> Vec<Arc<ApnItem>> {
        match apn_type {
            ApnType::Dun => self.fetch_dun(roaming),
            ApnType::Bip => self.fetch_bip(),
            _ => self
                .items
                .iter()
                .filter(|i| i.can_deal_with_type(apn_type))
                .cloned()
                .collect(),
        }
    }

    fn fetch_dun(&self, roaming: bool) -> Vec<Arc<ApnItem>> {
        if roaming && !self.is_preferred_user_edited() {
            tracing::info!("dun apn is not used on a roaming network");
            return Vec::new();
        }
        if let Some(preferred) = self.preferred() {
            if preferred.can_deal_with_type(ApnType::Dun) {
                return vec![preferred.clone()];
            }
        }
        self.items
            .iter()
            .filter(|i| i.can_deal_with_type(ApnType::Dun))
            .cloned()
            .collect()
    }

    fn fetch_bip(&self) -> Vec<Arc<ApnItem>> {
        let mut default = None;
        for item in &self.items {
            if item.can_deal_with_type(ApnType::Bip) {
                return vec![item.clone()];
            }
            if item.can_deal_with_type(ApnType::Default) {
                default = Some(item.clone());
            }
        }
        default.into_iter().collect()
    }

    /// Profile the modem should attach with: ia, then default, then anything.
    pub fn ril_attach_apn(&self) -> Option<Arc<ApnItem>> {
        self.items
            .iter()
            .find(|i| i.can_deal_with_type(ApnType::Ia))
            .or_else(|| {
                self.items
                    .iter()
                    .find(|i| i.can_deal_with_type(ApnType::Default))
            })
            .or_else(|| self.items.first())
            .cloned()
    }

    pub fn clear_all_bad(&self) {
        for item in &self.items {
            item.mark_bad(false);
        }
    }
}

impl ApnCatalogInput {
    pub fn resolve(self) -> Result<ApnCatalog> {
        let mut preferred_id = self.preferred_id;
        let mut profiles = Vec::with_capacity(self.apn.len());
        for (index, mut attr) in self.apn.into_iter().enumerate() {
            if Some(attr.profile_id) == preferred_id && attr.types.trim().is_empty() {
                attr.types = ApnType::Default.name().to_string();
            }
            if attr.types.trim().is_empty() {
                return Err(DataError::InvalidApn {
                    index,
                    reason: "empty types".to_string(),
                });
            }
            if attr.apn.trim().is_empty() {
                return Err(DataError::InvalidApn {
                    index,
                    reason: "empty apn".to_string(),
                });
            }
            if attr.protocol.is_empty() {
                attr.protocol = PROTOCOL_IPV4V6.to_string();
            }
            if attr.roaming_protocol.is_empty() {
                attr.roaming_protocol = attr.protocol.clone();
            }
            profiles.push(attr);
        }

        let merged = merge_similar(profiles, &mut preferred_id);
        let mut items: Vec<Arc<ApnItem>> = merged
            .into_iter()
            .map(|attr| Arc::new(ApnItem::new(attr)))
            .collect();

        if let Some(id) = preferred_id {
            if let Some(pos) = items.iter().position(|i| i.attr.profile_id == id) {
                let preferred = items.remove(pos);
                items.insert(0, preferred);
            }
        }

        Ok(ApnCatalog {
            items,
            preferred_id,
        })
    }
}

/// Coalesces profiles that would produce the same context. The surviving
/// profile takes the union of types and the dual-stack protocol if either
/// side had it.
fn merge_similar(profiles: Vec<ApnAttribute>, preferred_id: &mut Option<i32>) -> Vec<ApnAttribute> {
    let mut out: Vec<ApnAttribute> = Vec::with_capacity(profiles.len());
    for attr in profiles {
        match out.iter_mut().find(|kept| kept.is_similar(&attr)) {
            Some(kept) => {
                tracing::info!(
                    kept = kept.profile_id,
                    merged = attr.profile_id,
                    apn = %kept.apn,
                    "merging similar apn profiles"
                );
                kept.types = format!("{},{}", kept.types, attr.types);
                if !kept.protocol.eq_ignore_ascii_case(PROTOCOL_IPV4V6) {
                    kept.protocol = attr.protocol;
                }
                if !kept.roaming_protocol.eq_ignore_ascii_case(PROTOCOL_IPV4V6) {
                    kept.roaming_protocol = attr.roaming_protocol;
                }
                if *preferred_id == Some(attr.profile_id) {
                    *preferred_id = Some(kept.profile_id);
                }
            }
            None => out.push(attr),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
        preferred_id = 3

        [[apn]]
        profile_id = 1
        types = "default,supl"
        numeric = "46001"
        apn = "internet"

        [[apn]]
        profile_id = 2
        types = "mms"
        numeric = "46001"
        apn = "mms.carrier"
        mms_ip_address = "10.0.0.172"

        [[apn]]
        profile_id = 3
        types = "dun,default"
        numeric = "46001"
        apn = "tether"

        [[apn]]
        profile_id = 4
        types = "ia"
        numeric = "46001"
        apn = "ims.attach"
    "#;

    #[test]
    fn loads_and_puts_preferred_first() {
        let catalog = ApnCatalog::from_toml_str(CATALOG).unwrap();
        assert_eq!(catalog.len(), 4);
        assert_eq!(catalog.items()[0].attr.profile_id, 3);
        assert_eq!(catalog.preferred_id(), Some(3));
    }

    #[test]
    fn empty_input_yields_fallback() {
        let catalog = ApnCatalog::from_toml_str("  ").unwrap();
        assert_eq!(catalog.filter_matched(ApnType::Default, false).len(), 1);
        assert_eq!(catalog.filter_matched(ApnType::Mms, false)[0].attr.apn, "cmwap");
    }

    #[test]
    fn rejects_entry_without_apn() {
        let err = ApnCatalog::from_toml_str(
            r#"
            [[apn]]
            types = "default"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, DataError::InvalidApn { index: 0, .. }));
    }

    #[test]
    fn preferred_without_types_becomes_default() {
        let catalog = ApnCatalog::from_toml_str(
            r#"
            preferred_id = 7
            [[apn]]
            profile_id = 7
            apn = "internet"
            "#,
        )
        .unwrap();
        assert!(catalog.items()[0].can_deal_with_type(ApnType::Default));
    }

    #[test]
    fn filter_default_keeps_catalog_order() {
        let catalog = ApnCatalog::from_toml_str(CATALOG).unwrap();
        let ids: Vec<i32> = catalog
            .filter_matched(ApnType::Default, false)
            .iter()
            .map(|i| i.attr.profile_id)
            .collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[test]
    fn dun_prefers_preferred_and_skips_roaming() {
        let catalog = ApnCatalog::from_toml_str(CATALOG).unwrap();
        let dun = catalog.filter_matched(ApnType::Dun, false);
        assert_eq!(dun.len(), 1);
        assert_eq!(dun[0].attr.profile_id, 3);
        assert!(catalog.filter_matched(ApnType::Dun, true).is_empty());
    }

    #[test]
    fn bip_falls_back_to_default() {
        let catalog = ApnCatalog::from_toml_str(CATALOG).unwrap();
        let bip = catalog.filter_matched(ApnType::Bip, false);
        assert_eq!(bip.len(), 1);
        assert!(bip[0].can_deal_with_type(ApnType::Default));
    }

    #[test]
    fn attach_apn_prefers_ia() {
        let catalog = ApnCatalog::from_toml_str(CATALOG).unwrap();
        assert_eq!(catalog.ril_attach_apn().unwrap().attr.profile_id, 4);
        assert_eq!(
            ApnCatalog::fallback().ril_attach_apn().unwrap().attr.apn,
            "cmnet"
        );
    }

    #[test]
    fn similar_profiles_merge() {
        let catalog = ApnCatalog::from_toml_str(
            r#"
            preferred_id = 2
            [[apn]]
            profile_id = 1
            types = "default"
            apn = "internet"
            protocol = "IP"
            [[apn]]
            profile_id = 2
            types = "supl"
            apn = "INTERNET"
            protocol = "IPV4V6"
            "#,
        )
        .unwrap();
        assert_eq!(catalog.len(), 1);
        let item = &catalog.items()[0];
        assert!(item.can_deal_with_type(ApnType::Default));
        assert!(item.can_deal_with_type(ApnType::Supl));
        assert_eq!(item.attr.protocol, PROTOCOL_IPV4V6);
        assert_eq!(catalog.preferred_id(), Some(1));
    }

    #[test]
    fn clear_all_bad_resets_flags() {
        let catalog = ApnCatalog::from_toml_str(CATALOG).unwrap();
        for item in catalog.items() {
            item.mark_bad(true);
        }
        catalog.clear_all_bad();
        assert!(catalog.items().iter().all(|i| !i.is_bad()));
    }
}
