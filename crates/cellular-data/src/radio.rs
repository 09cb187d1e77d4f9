//! # Radio transport boundary
//!
//! The modem is an asynchronous request/response channel. Requests are
//! fire-and-forget; the transport answers later through the [`ReplyTo`]
//! handed in with each request, and pushes unsolicited notifications to
//! listeners registered with [`RadioTransport::subscribe`].
//!
//! ```text
//!   machine ──ActivateRequest──▶ transport ··· modem
//!      ▲                              │
//!      └──── RadioResponse ◀──────────┘   (any thread, any time later)
//! ```

use std::sync::Arc;

use crate::apn::item::ApnAttribute;
use crate::apn::types::{DisconnectReason, RadioTech};
use crate::machine::MachineId;

/// Setup/teardown failure codes reported by the radio interface layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    GenericFailure,
    InvalidParameter,
    MemoryFull,
    CmdSendFailure,
    CmdNoCarrier,
    InvalidResponse,
    NullPoint,
    HdfIpcFailure,
    RadioUnavailable,
    Other(i32),
}

impl RadioError {
    /// Transport-level trouble is worth a retry; protocol-level rejects
    /// clear the candidate. Anything unrecognised is retried.
    pub fn disconnect_reason(self) -> DisconnectReason {
        match self {
            RadioError::GenericFailure
            | RadioError::CmdSendFailure
            | RadioError::NullPoint
            | RadioError::RadioUnavailable => DisconnectReason::RetryConnection,
            RadioError::InvalidResponse
            | RadioError::InvalidParameter
            | RadioError::MemoryFull
            | RadioError::CmdNoCarrier
            | RadioError::HdfIpcFailure => DisconnectReason::ClearConnection,
            RadioError::Other(_) => DisconnectReason::RetryConnection,
        }
    }
}

/// 3GPP TS 24.008 session-management causes seen in setup results.
pub mod pdp_cause {
    pub const NONE: i32 = 0;
    pub const OPERATOR_DETERMINED_BARRING: i32 = 8;
    pub const SHORTAGE_RESOURCES: i32 = 26;
    pub const MISSING_OR_UNKNOWN_APN: i32 = 27;
    pub const UNKNOWN_PDP_ADDR_OR_TYPE: i32 = 28;
    pub const USER_VERIFICATION: i32 = 29;
    pub const ACTIVATION_REJECTED_GGSN: i32 = 30;
    pub const ACTIVATION_REJECTED_UNSPECIFIED: i32 = 31;
    pub const SERVICE_OPTION_NOT_SUPPORTED: i32 = 32;
    pub const REQUESTED_SERVICE_OPTION_NOT_SUBSCRIBED: i32 = 33;
    pub const SERVICE_OPTION_TEMPORARILY_OUT_OF_ORDER: i32 = 34;
    pub const NSAPI_ALREADY_USED: i32 = 35;
    pub const IPV4_ONLY_ALLOWED: i32 = 50;
    pub const IPV6_ONLY_ALLOWED: i32 = 51;
    pub const MULT_ACCESSES_PDN_NOT_ALLOWED: i32 = 55;
    pub const IPV4V6_ONLY_ALLOWED: i32 = 57;
    pub const NON_IP_ONLY_ALLOWED: i32 = 58;
    pub const MAX_NUM_OF_PDP_CONTEXTS: i32 = 65;
    pub const APN_NOT_SUPPORTED_IN_CURRENT_RAT_PLMN: i32 = 66;
    pub const PROTOCOL_ERRORS: i32 = 111;
    pub const APN_RESTRICTION_VALUE_INCOMPATIBLE: i32 = 112;
    pub const RETRY: i32 = 0x10000;
    pub const UNKNOWN: i32 = 0x10001;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivateRequest {
    pub slot: i32,
    pub machine: MachineId,
    /// Echoed back in the response; stale answers are discarded on mismatch.
    pub flag: i32,
    pub apn_id: i32,
    pub radio_tech: RadioTech,
    pub attr: ApnAttribute,
    pub roaming: bool,
    pub allow_roaming: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeactivateRequest {
    pub slot: i32,
    pub machine: MachineId,
    pub cid: i32,
    pub reason: DisconnectReason,
    /// Apn id of the role being released; echoed in the response.
    pub flag: i32,
}

/// One context as reported by setup responses and call-list snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetupDataCallResult {
    pub flag: i32,
    pub active: i32,
    pub cid: i32,
    /// PDP cause; zero on success.
    pub reason: i32,
    /// Modem-suggested retry time, negative when absent.
    pub retry_time_ms: i64,
    pub iface_name: String,
    /// Space separated `addr/prefix` entries.
    pub addresses: String,
    pub dns: String,
    pub gateway: String,
    pub mtu: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioResponseInfo {
    pub flag: i32,
    pub error: Option<RadioError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RadioResponse {
    SetupDataCall {
        machine: MachineId,
        result: Result<SetupDataCallResult, RadioResponseInfo>,
    },
    DeactivateDataCall {
        machine: MachineId,
        info: RadioResponseInfo,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    DataCallListChanged,
    RadioConnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RadioNotification {
    /// Authoritative list of contexts the modem currently holds.
    DataCallListChanged(Vec<SetupDataCallResult>),
    RadioConnected,
}

/// Receives everything the modem sends back.
pub trait RadioListener: Send + Sync {
    fn on_response(&self, response: RadioResponse);
    fn on_notification(&self, notification: RadioNotification);
}

pub type ReplyTo = Arc<dyn RadioListener>;

pub trait RadioTransport: Send + Sync {
    fn activate(&self, request: ActivateRequest, reply: ReplyTo);
    fn deactivate(&self, request: DeactivateRequest, reply: ReplyTo);
    fn subscribe(&self, kind: NotificationKind, listener: ReplyTo);

    // Stall recovery hooks. Transports without them only log.

    /// Ask the modem to resend its call list as a notification.
    fn request_data_call_list(&self, slot: i32, _reply: ReplyTo) {
        tracing::warn!(slot, "transport cannot poll the call list");
    }

    fn reregister_network(&self, slot: i32) {
        tracing::warn!(slot, "transport cannot force network re-registration");
    }

    fn restart_radio(&self, slot: i32) {
        tracing::warn!(slot, "transport cannot restart the radio");
    }
}

/// Listener that drops everything; used before a runtime is attached.
pub struct NullListener;

impl RadioListener for NullListener {
    fn on_response(&self, response: RadioResponse) {
        tracing::debug!(?response, "radio response dropped, no listener attached");
    }

    fn on_notification(&self, notification: RadioNotification) {
        tracing::debug!(?notification, "radio notification dropped, no listener attached");
    }
}
