//! Reentrancy guard
//!
//! While an event is being delivered to the application, the call-leg
//! records which callback is running in a [`CallbackSet`]. Destructive
//! operations (`terminate`, `disconnect`, `cancel`) check that set against
//! the [`ReentrancyPolicy`] table and return `TryAgain` instead of mutating
//! the call-leg when they are called from a forbidden callback.
//!
//! Nested deliveries stack: the previous set is restored when the inner
//! callback returns, so leaving an inner callback never clears the bit of an
//! outer one.

use serde::{Deserialize, Serialize};

use crate::errors::{CallLegError, CallLegResult};

/// Kind of callback currently running on a call-leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallbackContext {
    Created,
    StateChanged,
    ModifyStateChanged,
    ReInviteCreated,
    TransactionCreated,
    ByeCreated,
    SessionTimerFault,
    SessionTimerRefreshAlert,
    NestedInitialRequest,
    NewConnectionInUse,
    ForkingCreated,
    ProvisionalResponseReceived,
    PrackStateChanged,
    FinalDestinationResolved,
    Authentication,
    MessageSendFailure,
    GeneralResponse,
}

impl CallbackContext {
    pub const ALL: [CallbackContext; 17] = [
        CallbackContext::Created,
        CallbackContext::StateChanged,
        CallbackContext::ModifyStateChanged,
        CallbackContext::ReInviteCreated,
        CallbackContext::TransactionCreated,
        CallbackContext::ByeCreated,
        CallbackContext::SessionTimerFault,
        CallbackContext::SessionTimerRefreshAlert,
        CallbackContext::NestedInitialRequest,
        CallbackContext::NewConnectionInUse,
        CallbackContext::ForkingCreated,
        CallbackContext::ProvisionalResponseReceived,
        CallbackContext::PrackStateChanged,
        CallbackContext::FinalDestinationResolved,
        CallbackContext::Authentication,
        CallbackContext::MessageSendFailure,
        CallbackContext::GeneralResponse,
    ];

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Set of callback contexts stored as a bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackSet(u32);

impl CallbackSet {
    pub const EMPTY: CallbackSet = CallbackSet(0);

    pub fn of(contexts: &[CallbackContext]) -> Self {
        contexts
            .iter()
            .fold(Self::EMPTY, |set, ctx| set.with(*ctx))
    }

    pub fn with(self, ctx: CallbackContext) -> Self {
        CallbackSet(self.0 | ctx.bit())
    }

    pub fn contains(self, ctx: CallbackContext) -> bool {
        self.0 & ctx.bit() != 0
    }

    pub fn intersection(self, other: CallbackSet) -> CallbackSet {
        CallbackSet(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// First member in declaration order
    pub fn first(self) -> Option<CallbackContext> {
        CallbackContext::ALL.into_iter().find(|ctx| self.contains(*ctx))
    }
}

/// Operations subject to the reentrancy table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuardedOperation {
    Terminate,
    Disconnect,
    Cancel,
}

impl GuardedOperation {
    pub fn name(self) -> &'static str {
        match self {
            GuardedOperation::Terminate => "terminate",
            GuardedOperation::Disconnect => "disconnect",
            GuardedOperation::Cancel => "cancel",
        }
    }
}

/// Table of callbacks during which each guarded operation is refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReentrancyPolicy {
    pub terminate: CallbackSet,
    pub disconnect: CallbackSet,
    pub cancel: CallbackSet,
}

impl Default for ReentrancyPolicy {
    fn default() -> Self {
        use CallbackContext::*;
        Self {
            terminate: CallbackSet::of(&[
                Created,
                ReInviteCreated,
                TransactionCreated,
                ByeCreated,
                SessionTimerFault,
                SessionTimerRefreshAlert,
                NestedInitialRequest,
                NewConnectionInUse,
                ForkingCreated,
            ]),
            disconnect: CallbackSet::of(&[Created, ByeCreated, ForkingCreated, NestedInitialRequest]),
            cancel: CallbackSet::of(&[Created, ByeCreated, ForkingCreated]),
        }
    }
}

impl ReentrancyPolicy {
    /// Policy that never blocks anything
    pub fn permissive() -> Self {
        Self {
            terminate: CallbackSet::EMPTY,
            disconnect: CallbackSet::EMPTY,
            cancel: CallbackSet::EMPTY,
        }
    }

    pub fn forbidden(&self, op: GuardedOperation) -> CallbackSet {
        match op {
            GuardedOperation::Terminate => self.terminate,
            GuardedOperation::Disconnect => self.disconnect,
            GuardedOperation::Cancel => self.cancel,
        }
    }

    /// `TryAgain` when `op` is forbidden inside any of the `active` callbacks
    pub fn check(&self, op: GuardedOperation, active: CallbackSet) -> CallLegResult<()> {
        match self.forbidden(op).intersection(active).first() {
            Some(ctx) => Err(CallLegError::try_again(op.name(), ctx)),
            None => Ok(()),
        }
    }
}
