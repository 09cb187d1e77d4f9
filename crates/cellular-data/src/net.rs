//! Net-agent boundary: supplier registration and link publication.

use crate::apn::types::{DEFAULT_MTU, NetCapability, RadioTech};
use crate::radio::SetupDataCallResult;

pub type SupplierId = u32;

/// Capability-level view of a context as the connectivity layer sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupplierInfo {
    pub is_available: bool,
    pub is_roaming: bool,
    pub radio_tech: RadioTech,
    /// Voice call in progress on a technology without simultaneous data.
    pub is_calling: bool,
}

/// IP-level properties of an active context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub iface_name: String,
    pub addresses: Vec<String>,
    pub dns: Vec<String>,
    pub gateways: Vec<String>,
    pub mtu: u32,
    pub ident: String,
}

impl LinkInfo {
    /// Builds link properties from a modem context report.
    ///
    /// Returns `None` when addresses, DNS or gateway are missing: the
    /// context is not usable yet and nothing should be published.
    pub fn from_setup_result(result: &SetupDataCallResult, ident: &str) -> Option<Self> {
        let split = |s: &str| -> Vec<String> {
            s.split_whitespace().map(str::to_string).collect()
        };
        let addresses = split(&result.addresses);
        let dns = split(&result.dns);
        let gateways = split(&result.gateway);
        if addresses.is_empty() || dns.is_empty() || gateways.is_empty() {
            return None;
        }
        Some(Self {
            iface_name: result.iface_name.clone(),
            addresses,
            dns,
            gateways,
            mtu: if result.mtu == 0 { DEFAULT_MTU } else { result.mtu },
            ident: ident.to_string(),
        })
    }
}

pub trait NetAgent: Send + Sync {
    fn register_supplier(&self, slot: i32, capability: NetCapability) -> SupplierId;
    fn publish_supplier_info(&self, supplier: SupplierId, info: &SupplierInfo);
    fn publish_link_info(&self, supplier: SupplierId, info: &LinkInfo);
}
