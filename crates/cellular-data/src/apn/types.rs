//! Roles, capabilities, priorities and the shared enums every layer speaks.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fallback MTU when the modem reports none.
pub const DEFAULT_MTU: u32 = 1500;

/// Delay before re-running establishment after a catalog change or while a
/// previous context is still tearing down.
pub const ESTABLISH_DATA_CONNECTION_DELAY_MS: u64 = 1000;

/// Apn id meaning "no role".
pub const ERROR_APN_ID: i32 = -1;

/// Wildcard apn type that matches every role except `ia`.
pub const APN_TYPE_ALL: &str = "*";

/// Logical purpose of a data connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApnType {
    Default,
    Mms,
    Supl,
    Dun,
    Ims,
    Ia,
    Emergency,
    InternalDefault,
    Xcap,
    Bip,
}

impl ApnType {
    pub const ALL: [ApnType; 10] = [
        ApnType::Default,
        ApnType::Mms,
        ApnType::Supl,
        ApnType::Dun,
        ApnType::Ims,
        ApnType::Ia,
        ApnType::Emergency,
        ApnType::InternalDefault,
        ApnType::Xcap,
        ApnType::Bip,
    ];

    /// Roles that get an [`ApnHolder`](crate::apn::holder::ApnHolder).
    /// IMS and emergency are owned by other subsystems.
    pub const HELD: [ApnType; 8] = [
        ApnType::Default,
        ApnType::Mms,
        ApnType::InternalDefault,
        ApnType::Xcap,
        ApnType::Dun,
        ApnType::Ia,
        ApnType::Supl,
        ApnType::Bip,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ApnType::Default => "default",
            ApnType::Mms => "mms",
            ApnType::Supl => "supl",
            ApnType::Dun => "dun",
            ApnType::Ims => "ims",
            ApnType::Ia => "ia",
            ApnType::Emergency => "emergency",
            ApnType::InternalDefault => "internal_default",
            ApnType::Xcap => "xcap",
            ApnType::Bip => "bip",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let lowered = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|t| t.name() == lowered)
    }

    pub fn id(self) -> i32 {
        match self {
            ApnType::Default => 1,
            ApnType::Mms => 2,
            ApnType::Supl => 3,
            ApnType::Dun => 4,
            ApnType::Ims => 5,
            ApnType::Ia => 6,
            ApnType::Emergency => 7,
            ApnType::InternalDefault => 8,
            ApnType::Xcap => 9,
            ApnType::Bip => 10,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.id() == id)
    }

    pub fn capability(self) -> NetCapability {
        match self {
            ApnType::Default => NetCapability::Internet,
            ApnType::Mms => NetCapability::Mms,
            ApnType::Supl => NetCapability::Supl,
            ApnType::Dun => NetCapability::Dun,
            ApnType::Ims => NetCapability::Ims,
            ApnType::Ia => NetCapability::Ia,
            ApnType::Emergency => NetCapability::Emergency,
            ApnType::InternalDefault => NetCapability::InternalDefault,
            ApnType::Xcap => NetCapability::Xcap,
            ApnType::Bip => NetCapability::Bip,
        }
    }

    pub fn from_capability(cap: NetCapability) -> Self {
        match cap {
            NetCapability::Internet => ApnType::Default,
            NetCapability::Mms => ApnType::Mms,
            NetCapability::Supl => ApnType::Supl,
            NetCapability::Dun => ApnType::Dun,
            NetCapability::Ims => ApnType::Ims,
            NetCapability::Ia => ApnType::Ia,
            NetCapability::Emergency => ApnType::Emergency,
            NetCapability::InternalDefault => ApnType::InternalDefault,
            NetCapability::Xcap => ApnType::Xcap,
            NetCapability::Bip => ApnType::Bip,
        }
    }

    pub fn priority(self) -> Priority {
        match self {
            ApnType::Ia | ApnType::Emergency => Priority::High,
            ApnType::Mms
            | ApnType::Supl
            | ApnType::Dun
            | ApnType::Ims
            | ApnType::Xcap
            | ApnType::Bip => Priority::Normal,
            ApnType::Default => Priority::Low,
            ApnType::InternalDefault => Priority::None,
        }
    }

    /// Roles that carry the device's internet traffic.
    pub fn is_internet(self) -> bool {
        matches!(self, ApnType::Default | ApnType::InternalDefault)
    }
}

impl fmt::Display for ApnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Network capability advertised to the connectivity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetCapability {
    Internet,
    Mms,
    Supl,
    Dun,
    Ims,
    Ia,
    Emergency,
    InternalDefault,
    Xcap,
    Bip,
}

impl NetCapability {
    pub fn bit(self) -> u64 {
        1 << (self as u8)
    }

    /// Picks the capability a multi-capability request should be served by.
    /// Later entries in the ladder win.
    pub fn best_of(mask: u64) -> Option<NetCapability> {
        const LADDER: [NetCapability; 8] = [
            NetCapability::Internet,
            NetCapability::InternalDefault,
            NetCapability::Mms,
            NetCapability::Supl,
            NetCapability::Dun,
            NetCapability::Xcap,
            NetCapability::Ia,
            NetCapability::Bip,
        ];
        LADDER.into_iter().filter(|c| mask & c.bit() != 0).last()
    }
}

/// Preemption priority of a role. Higher wins the modem's contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    None = 0,
    Low = 1,
    Normal = 2,
    High = 3,
}

/// Per-holder connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ApnProfileState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
    Retrying,
}

/// Why a context went (or must go) down. Drives the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DisconnectReason {
    Normal,
    GsmAndCallingOnly,
    RetryConnection,
    ClearConnection,
    ChangeConnection,
    PermanentReject,
}

impl DisconnectReason {
    /// Whether the candidate that produced this reason should be excluded
    /// for the rest of the campaign.
    pub fn marks_bad(self) -> bool {
        matches!(
            self,
            DisconnectReason::ClearConnection | DisconnectReason::PermanentReject
        )
    }
}

/// Radio access technology as reported by the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioTech {
    #[default]
    Unknown,
    Gsm,
    OneXrtt,
    Wcdma,
    Hspa,
    Hspap,
    TdScdma,
    EvDo,
    Ehrpd,
    Lte,
    LteCa,
    Iwlan,
    Nr,
}

impl RadioTech {
    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Self {
        match id {
            1 => RadioTech::Gsm,
            2 => RadioTech::OneXrtt,
            3 => RadioTech::Wcdma,
            4 => RadioTech::Hspa,
            5 => RadioTech::Hspap,
            6 => RadioTech::TdScdma,
            7 => RadioTech::EvDo,
            8 => RadioTech::Ehrpd,
            9 => RadioTech::Lte,
            10 => RadioTech::LteCa,
            11 => RadioTech::Iwlan,
            12 => RadioTech::Nr,
            _ => RadioTech::Unknown,
        }
    }

    /// Technologies that carry packet data alongside an IMS voice call.
    pub fn supports_incall_data(self) -> bool {
        matches!(
            self,
            RadioTech::Wcdma
                | RadioTech::Hspa
                | RadioTech::Hspap
                | RadioTech::Lte
                | RadioTech::LteCa
                | RadioTech::Nr
        )
    }
}
