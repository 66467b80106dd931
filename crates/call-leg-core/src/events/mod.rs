//! Events delivered to the application
//!
//! Every call-leg change the application may care about is reported as a
//! [`CallLegEvent`]. Events are produced while an operation runs and
//! delivered after the operation has finished mutating the call-leg, still
//! under the call-leg lock. The handler receives the manager so it can call
//! back into the same call-leg (the lock is reentrant); destructive calls are
//! filtered by the reentrancy table of [`guard`](crate::guard).
//!
//! Two handlers are provided:
//!
//! - any `Fn(&DialogManager, &CallLegEvent)` closure wrapped in an `Arc`
//! - [`ChannelEventHandler`], which forwards events to a tokio channel for
//!   consumers that would rather process them on their own task

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::arena::{CallLegHandle, InviteHandle};
use crate::auth::Credentials;
use crate::callleg::{CallLegState, Direction, StateChangeReason};
use crate::guard::CallbackContext;
use crate::invite::ModifyState;
use crate::manager::DialogManager;
use crate::message::Method;
use crate::prack::PrackState;
use crate::session_timer::NegotiationFault;
use crate::transaction::TransactionHandle;

/// Event raised by a call-leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallLegEvent {
    /// An incoming INVITE created a new call-leg
    Created {
        handle: CallLegHandle,
        direction: Direction,
    },

    /// The call-leg changed state
    StateChanged {
        handle: CallLegHandle,
        old: CallLegState,
        new: CallLegState,
        reason: StateChangeReason,
    },

    /// A re-INVITE record changed state
    ModifyStateChanged {
        handle: CallLegHandle,
        invite: InviteHandle,
        old: ModifyState,
        new: ModifyState,
        reason: StateChangeReason,
    },

    /// A re-INVITE arrived and got its own record
    ReInviteCreated {
        handle: CallLegHandle,
        invite: InviteHandle,
    },

    /// A general request arrived on the call-leg
    TransactionCreated {
        handle: CallLegHandle,
        transaction: TransactionHandle,
        method: Method,
    },

    /// Final response to a general request sent with `request_general`
    GeneralResponseReceived {
        handle: CallLegHandle,
        transaction: TransactionHandle,
        status: u16,
    },

    /// A BYE arrived; with manual BYE handling the application must answer it
    ByeCreated {
        handle: CallLegHandle,
        transaction: TransactionHandle,
    },

    /// A response with a new to-tag created a fork of `original`
    ForkedCallLegCreated {
        handle: CallLegHandle,
        original: CallLegHandle,
    },

    /// A 1xx arrived for the initial INVITE or a re-INVITE
    ProvisionalResponseReceived {
        handle: CallLegHandle,
        transaction: Option<TransactionHandle>,
        status: u16,
        reliable: bool,
    },

    PrackStateChanged {
        handle: CallLegHandle,
        old: PrackState,
        new: PrackState,
    },

    SessionTimerNegotiationFault {
        handle: CallLegHandle,
        fault: NegotiationFault,
    },

    /// The local side should refresh the session now
    SessionTimerRefreshAlert { handle: CallLegHandle },

    /// A new initial INVITE matched an existing call-leg
    NestedInitialRequest {
        handle: CallLegHandle,
        transaction: TransactionHandle,
    },

    NewConnectionInUse {
        handle: CallLegHandle,
        transaction: TransactionHandle,
    },

    FinalDestinationResolved {
        handle: CallLegHandle,
        transaction: TransactionHandle,
    },

    /// A request could not be delivered; waiting for a DNS fail-over decision
    MessageSendFailure {
        handle: CallLegHandle,
        transaction: TransactionHandle,
        method: Method,
    },

    /// The transaction layer needs credentials for a challenged request
    AuthCredentialsRequired {
        handle: CallLegHandle,
        transaction: TransactionHandle,
    },

    /// Server-side walk presents the next credentials
    AuthCredentialsFound {
        handle: CallLegHandle,
        transaction: TransactionHandle,
        credentials: Credentials,
    },

    /// Server-side walk finished
    AuthCompleted {
        handle: CallLegHandle,
        transaction: TransactionHandle,
        success: bool,
    },
}

impl CallLegEvent {
    /// Call-leg the event belongs to
    pub fn handle(&self) -> CallLegHandle {
        match self {
            CallLegEvent::Created { handle, .. }
            | CallLegEvent::StateChanged { handle, .. }
            | CallLegEvent::ModifyStateChanged { handle, .. }
            | CallLegEvent::ReInviteCreated { handle, .. }
            | CallLegEvent::TransactionCreated { handle, .. }
            | CallLegEvent::GeneralResponseReceived { handle, .. }
            | CallLegEvent::ByeCreated { handle, .. }
            | CallLegEvent::ForkedCallLegCreated { handle, .. }
            | CallLegEvent::ProvisionalResponseReceived { handle, .. }
            | CallLegEvent::PrackStateChanged { handle, .. }
            | CallLegEvent::SessionTimerNegotiationFault { handle, .. }
            | CallLegEvent::SessionTimerRefreshAlert { handle }
            | CallLegEvent::NestedInitialRequest { handle, .. }
            | CallLegEvent::NewConnectionInUse { handle, .. }
            | CallLegEvent::FinalDestinationResolved { handle, .. }
            | CallLegEvent::MessageSendFailure { handle, .. }
            | CallLegEvent::AuthCredentialsRequired { handle, .. }
            | CallLegEvent::AuthCredentialsFound { handle, .. }
            | CallLegEvent::AuthCompleted { handle, .. } => *handle,
        }
    }

    /// Callback context entered while this event is being delivered
    pub fn context(&self) -> CallbackContext {
        match self {
            CallLegEvent::Created { .. } => CallbackContext::Created,
            CallLegEvent::StateChanged { .. } => CallbackContext::StateChanged,
            CallLegEvent::ModifyStateChanged { .. } => CallbackContext::ModifyStateChanged,
            CallLegEvent::ReInviteCreated { .. } => CallbackContext::ReInviteCreated,
            CallLegEvent::TransactionCreated { .. } => CallbackContext::TransactionCreated,
            CallLegEvent::GeneralResponseReceived { .. } => CallbackContext::GeneralResponse,
            CallLegEvent::ByeCreated { .. } => CallbackContext::ByeCreated,
            CallLegEvent::ForkedCallLegCreated { .. } => CallbackContext::ForkingCreated,
            CallLegEvent::ProvisionalResponseReceived { .. } => {
                CallbackContext::ProvisionalResponseReceived
            }
            CallLegEvent::PrackStateChanged { .. } => CallbackContext::PrackStateChanged,
            CallLegEvent::SessionTimerNegotiationFault { .. } => CallbackContext::SessionTimerFault,
            CallLegEvent::SessionTimerRefreshAlert { .. } => {
                CallbackContext::SessionTimerRefreshAlert
            }
            CallLegEvent::NestedInitialRequest { .. } => CallbackContext::NestedInitialRequest,
            CallLegEvent::NewConnectionInUse { .. } => CallbackContext::NewConnectionInUse,
            CallLegEvent::FinalDestinationResolved { .. } => {
                CallbackContext::FinalDestinationResolved
            }
            CallLegEvent::MessageSendFailure { .. } => CallbackContext::MessageSendFailure,
            CallLegEvent::AuthCredentialsRequired { .. }
            | CallLegEvent::AuthCredentialsFound { .. }
            | CallLegEvent::AuthCompleted { .. } => CallbackContext::Authentication,
        }
    }
}

/// Receiver of call-leg events
pub trait CallLegEventHandler: Send + Sync {
    fn on_event(&self, manager: &DialogManager, event: &CallLegEvent);
}

impl<F> CallLegEventHandler for F
where
    F: Fn(&DialogManager, &CallLegEvent) + Send + Sync,
{
    fn on_event(&self, manager: &DialogManager, event: &CallLegEvent) {
        self(manager, event)
    }
}

/// Forwards events into an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelEventHandler {
    sender: mpsc::UnboundedSender<CallLegEvent>,
}

impl ChannelEventHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CallLegEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl CallLegEventHandler for ChannelEventHandler {
    fn on_event(&self, _manager: &DialogManager, event: &CallLegEvent) {
        if self.sender.send(event.clone()).is_err() {
            warn!("Event receiver dropped, discarding {:?}", event.context());
        }
    }
}
