//! SIP Call-Leg engine for the rvoip stack
//!
//! A call-leg is one SIP dialog (RFC 3261) together with the state machines
//! that hang off it: the INVITE/re-INVITE records, reliable provisionals
//! (RFC 3262), session timers (RFC 4028), forking, authentication, DNS
//! fail-over and Replaces (RFC 3891).
//!
//! The engine does not parse or send SIP messages. The transaction layer
//! hands it summaries of what arrived ([`RequestInfo`], [`ResponseInfo`]) and
//! receives back what to send through the [`TransactionLayer`] trait. Every
//! change the application may care about is reported as a [`CallLegEvent`].
//!
//! ```text
//!   application ──ops──▶ DialogManager ──TransactionLayer──▶ transaction layer
//!        ▲                    │   ▲                                │
//!        └──CallLegEvent──────┘   └──on_request/on_response────────┘
//! ```

pub mod arena;
pub mod auth;
pub mod callleg;
pub mod config;
pub mod dns;
pub mod errors;
pub mod events;
pub mod forking;
pub mod guard;
pub mod ha;
pub mod invite;
pub mod manager;
pub mod message;
pub mod prack;
pub mod replaces;
pub mod session_timer;
pub mod transaction;

pub use arena::{CallLegHandle, InviteHandle};
pub use callleg::{CallLegInfo, CallLegState, Direction, StateChangeReason};
pub use config::{CallLegMgrConfig, RefreshMethod, SessionTimerDefaults};
pub use errors::{CallLegError, CallLegResult, ErrorKind};
pub use events::{CallLegEvent, CallLegEventHandler, ChannelEventHandler};
pub use invite::{InviteHandlingMode, ModifyState};
pub use manager::{DialogManager, SessionRefresh};
pub use message::{Method, NameAddr, RequestInfo, ResponseInfo};
pub use transaction::{Collaborators, TransactionHandle, TransactionLayer};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        CallLegError, CallLegEvent, CallLegEventHandler, CallLegHandle, CallLegMgrConfig, CallLegResult,
        CallLegState, Collaborators, DialogManager, Direction, ErrorKind, InviteHandle, InviteHandlingMode,
        Method, ModifyState, NameAddr, RequestInfo, ResponseInfo, StateChangeReason, TransactionHandle,
        TransactionLayer,
    };
}
