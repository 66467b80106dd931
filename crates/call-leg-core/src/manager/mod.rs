//! Dialog Manager Module
//!
//! The [`DialogManager`] owns every call-leg. Its operations are split by
//! concern over the files of this module; they all run through the locked
//! operation context of [`context`].

// Core dialog manager implementation
pub mod core;
pub(crate) mod context;

// Application operations
mod auth_operations;
mod dialog_operations;
mod dns_operations;
mod ha_operations;
mod prack_operations;
mod refer_operations;
mod reinvite_operations;
mod session_operations;
mod session_timer_operations;

// Network-facing entry points
mod message_routing;

pub use self::core::DialogManager;
pub use session_timer_operations::SessionRefresh;
