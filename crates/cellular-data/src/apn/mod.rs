//! APN data model: roles, descriptors, the carrier catalog and per-role
//! holders.

pub mod catalog;
pub mod holder;
pub mod item;
pub mod manager;
pub mod types;

pub use catalog::ApnCatalog;
pub use holder::{ApnHolder, NetRequest};
pub use item::{ApnAttribute, ApnItem};
pub use manager::ApnManager;
pub use types::{ApnProfileState, ApnType, DisconnectReason, NetCapability, Priority, RadioTech};
