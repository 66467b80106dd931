//! Collaborator interfaces consumed by the call-leg engine
//!
//! The engine never touches the network. Requests, responses, timers,
//! credentials and REFER subscriptions are handed to collaborators behind
//! these traits, and the collaborators report back through the network-facing
//! methods of [`DialogManager`](crate::manager::DialogManager)
//! (`on_request_received`, `on_response_received`, `on_timer_expired`, ...).
//!
//! ```text
//! ┌──────────────┐  send_request / respond   ┌──────────────────┐
//! │ DialogManager│──────────────────────────▶│ TransactionLayer │
//! │  (call-legs) │◀──────────────────────────│  (tx + transport)│
//! └──────┬───────┘  on_response_received ... └──────────────────┘
//!        │ start / cancel
//!        ▼
//! ┌──────────────┐  TimerExpiry (mpsc)
//! │ TimerService │──────────────────────▶ DialogManager::run_timer_events
//! └──────────────┘
//! ```
//!
//! Collaborators are called while the call-leg lock is held. They must hand
//! work off rather than call back into the same call-leg synchronously; a
//! synchronous re-entry is answered with `TryAgain`.

pub mod timer;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::arena::CallLegHandle;
use crate::auth::{Challenge, Credentials};
use crate::message::{Method, OutgoingRequest, OutgoingResponse};

pub use timer::{TimerExpiry, TokioTimerService};

/// Opaque handle of a transaction owned by the transaction layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionHandle(u64);

impl TransactionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Opaque handle of a REFER subscription owned by the subscription layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle(pub u64);

/// Opaque handle of an IMS security association / security object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityAssociation(pub u64);

/// Failure reported by a collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("out of resources: {0}")]
    OutOfResources(String),
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
    #[error("{0}")]
    Failed(String),
}

/// Transaction and transport services used by call-legs
pub trait TransactionLayer: Send + Sync {
    /// Create a client transaction owned by `owner` and send `request` on it
    ///
    /// # Returns
    /// Handle of the new client transaction
    fn send_request(
        &self,
        owner: CallLegHandle,
        request: OutgoingRequest,
    ) -> Result<TransactionHandle, CollaboratorError>;

    /// Send a response on a server transaction
    fn respond(
        &self,
        tx: TransactionHandle,
        response: OutgoingResponse,
    ) -> Result<(), CollaboratorError>;

    /// Send CANCEL for a pending INVITE client transaction
    ///
    /// # Returns
    /// Handle of the CANCEL transaction
    fn cancel(&self, tx: TransactionHandle) -> Result<TransactionHandle, CollaboratorError>;

    /// Send the dialog-level ACK for a 2xx
    fn send_ack(
        &self,
        owner: CallLegHandle,
        request: OutgoingRequest,
    ) -> Result<(), CollaboratorError>;

    /// Terminate a transaction without sending anything
    fn terminate(&self, tx: TransactionHandle);

    /// Stop reporting events of a transaction to its owner; it completes on its own
    fn detach(&self, tx: TransactionHandle);

    /// Clone a transaction whose send failed, aimed at the next resolved address
    fn clone_for_next_address(
        &self,
        tx: TransactionHandle,
    ) -> Result<TransactionHandle, CollaboratorError>;

    /// Transmit a transaction produced by [`clone_for_next_address`](Self::clone_for_next_address)
    fn resend(&self, tx: TransactionHandle) -> Result<(), CollaboratorError>;

    /// Remaining resolved destinations of a transaction
    fn dns_list(&self, tx: TransactionHandle) -> Result<Vec<String>, CollaboratorError>;
}

/// Engine timers, keyed by owner and kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerKind {
    /// A fork created by a 1xx that has not seen a 2xx
    Forked1xx,
    /// Local refresher: time to refresh the session
    SessionRefresh,
    /// Remote refresher: session expires unless refreshed
    SessionExpiry,
}

/// Timer scheduling service
pub trait TimerService: Send + Sync {
    /// Arm (or re-arm) the `kind` timer of `owner`
    fn start(&self, owner: CallLegHandle, kind: TimerKind, after: Duration);

    /// Disarm the `kind` timer of `owner`; unknown timers are ignored
    fn cancel(&self, owner: CallLegHandle, kind: TimerKind);
}

/// Credential computation and verification
pub trait Authenticator: Send + Sync {
    /// Answer a challenge for an outgoing request
    fn build_credentials(
        &self,
        challenge: &Challenge,
        request: &OutgoingRequest,
    ) -> Result<Credentials, CollaboratorError>;

    /// Verify received credentials with the password supplied by the application
    fn verify(&self, credentials: &Credentials, password: &str, method: &Method) -> bool;

    /// Build a fresh challenge for a 401/407 response
    fn build_challenge(&self, realm: &str, proxy: bool) -> Challenge;
}

/// REFER subscription services
pub trait SubscriptionLayer: Send + Sync {
    /// Terminate a subscription because its call-leg is going away
    fn terminate(&self, subscription: SubscriptionHandle);
}

/// Collaborators bundled for [`DialogManager::new`](crate::manager::DialogManager::new)
#[derive(Clone)]
pub struct Collaborators {
    pub transactions: Arc<dyn TransactionLayer>,
    pub timers: Arc<dyn TimerService>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub subscriptions: Option<Arc<dyn SubscriptionLayer>>,
}

impl Collaborators {
    pub fn new(transactions: Arc<dyn TransactionLayer>, timers: Arc<dyn TimerService>) -> Self {
        Self {
            transactions,
            timers,
            authenticator: None,
            subscriptions: None,
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_subscriptions(mut self, subscriptions: Arc<dyn SubscriptionLayer>) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("authenticator", &self.authenticator.is_some())
            .field("subscriptions", &self.subscriptions.is_some())
            .finish_non_exhaustive()
    }
}
