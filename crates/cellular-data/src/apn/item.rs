//! APN descriptors.
//!
//! An [`ApnItem`] is immutable after catalog load except for its bad flag,
//! which the retry layer flips when a candidate is exhausted or rejected.
//! Items are shared as `Arc<ApnItem>` between the catalog and every retry
//! policy that lists them, so a mark is visible everywhere at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::types::{APN_TYPE_ALL, ApnType};
use crate::error::Result;

pub const PROTOCOL_IPV4: &str = "IP";
pub const PROTOCOL_IPV6: &str = "IPV6";
pub const PROTOCOL_IPV4V6: &str = "IPV4V6";

/// Flat attribute record. This is also the cross-process form of an APN.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApnAttribute {
    pub types: String,
    pub numeric: String,
    pub profile_id: i32,
    pub protocol: String,
    pub roaming_protocol: String,
    pub auth_type: i32,
    pub apn: String,
    pub apn_name: String,
    pub user: String,
    pub password: String,
    pub is_roaming_apn: bool,
    pub home_url: String,
    pub proxy_ip_address: String,
    pub mms_ip_address: String,
    pub is_edited: bool,
}

impl ApnAttribute {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn is_similar(&self, other: &ApnAttribute) -> bool {
        self.apn.eq_ignore_ascii_case(&other.apn)
            && self.numeric == other.numeric
            && self.user == other.user
            && self.password == other.password
            && self.auth_type == other.auth_type
            && self.proxy_ip_address == other.proxy_ip_address
            && self.mms_ip_address == other.mms_ip_address
            && protocols_compatible(&self.protocol, &other.protocol)
            && protocols_compatible(&self.roaming_protocol, &other.roaming_protocol)
    }
}

#[derive(Debug)]
pub struct ApnItem {
    apn_types: Vec<String>,
    pub attr: ApnAttribute,
    bad_apn: AtomicBool,
}

impl ApnItem {
    pub fn new(attr: ApnAttribute) -> Self {
        let apn_types = split_types(&attr.types);
        Self {
            apn_types,
            attr,
            bad_apn: AtomicBool::new(false),
        }
    }

    /// Fallback record used when the catalog has nothing for a role.
    pub fn make_default(apn_type: ApnType) -> Arc<Self> {
        let apn = if apn_type == ApnType::Mms { "cmwap" } else { "cmnet" };
        Arc::new(Self::new(ApnAttribute {
            types: apn_type.name().to_string(),
            numeric: "46002".to_string(),
            protocol: PROTOCOL_IPV4V6.to_string(),
            roaming_protocol: PROTOCOL_IPV4V6.to_string(),
            apn: apn.to_string(),
            apn_name: "CMNET".to_string(),
            ..ApnAttribute::default()
        }))
    }

    pub fn apn_types(&self) -> &[String] {
        &self.apn_types
    }

    pub fn can_deal_with_type(&self, apn_type: ApnType) -> bool {
        self.can_deal_with(apn_type.name())
    }

    /// Case-insensitive match; `*` covers every role except `ia`.
    pub fn can_deal_with(&self, type_name: &str) -> bool {
        let wanted = type_name.to_ascii_lowercase();
        self.apn_types.iter().any(|t| {
            t.eq_ignore_ascii_case(&wanted)
                || (wanted != ApnType::Ia.name() && t == APN_TYPE_ALL)
        })
    }

    pub fn is_bad(&self) -> bool {
        self.bad_apn.load(Ordering::Relaxed)
    }

    pub fn mark_bad(&self, bad: bool) {
        self.bad_apn.store(bad, Ordering::Relaxed);
    }

    /// Protocol in effect for the current network.
    pub fn protocol_for(&self, roaming: bool) -> &str {
        if roaming {
            &self.attr.roaming_protocol
        } else {
            &self.attr.protocol
        }
    }

    /// Whether two records would produce the same modem context.
    pub fn is_similar(&self, other: &ApnItem) -> bool {
        self.attr.is_similar(&other.attr)
    }
}

fn split_types(types: &str) -> Vec<String> {
    types
        .split(',')
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn protocols_compatible(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
        || a.eq_ignore_ascii_case(PROTOCOL_IPV4V6)
        || b.eq_ignore_ascii_case(PROTOCOL_IPV4V6)
}
