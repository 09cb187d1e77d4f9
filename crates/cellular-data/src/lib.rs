//! Cellular packet-data connection management for one or more SIM slots.
//!
//! This crate contains:
//! - **APN model**: roles, profiles, the carrier catalog and per-role holders
//! - **Connection machines**: one state machine per modem context, with
//!   deferred-event replay
//! - **Retry policy**: candidate cursor, bad-profile tracking, tiered delays
//! - **Arbitration**: [`handler::CellularDataHandler`] decides which roles get
//!   a context, preempts on single-context RATs and drives in-call data
//! - **Runtime**: [`runtime::SlotRuntime`] runs a handler on its own thread
//!
//! The radio and the connectivity layer are abstract ([`radio::RadioTransport`],
//! [`net::NetAgent`]); the `cellular-data-sim` binary wires both to a
//! loopback modem.

pub mod apn;
pub mod config;
pub mod error;
pub mod extension;
pub mod handler;
pub mod machine;
pub mod manager;
pub mod monitor;
pub mod net;
pub mod props;
pub mod radio;
pub mod retry;
pub mod runtime;
pub mod secondary;

pub use error::{DataError, Result};
