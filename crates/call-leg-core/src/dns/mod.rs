//! DNS fail-over bookkeeping
//!
//! When the transaction layer cannot deliver a request (timeout, network
//! error, 503) it reports a send failure. The call-leg then waits for the
//! application to pick one of:
//!
//! - **give up**: drop the request and go back to the state it had before
//!   the send (terminating the call-leg when this was its first request)
//! - **continue**: clone the failed transaction towards the next resolved
//!   address; dialog requests swap the clone in place, general requests get
//!   a brand new transaction handle
//! - **re-send**: transmit the clone
//!
//! This module only records which request failed and what it is waiting for.

use serde::{Deserialize, Serialize};

use crate::arena::InviteHandle;
use crate::callleg::CallLegState;
use crate::errors::{CallLegError, CallLegResult};
use crate::invite::ModifyState;
use crate::message::Method;
use crate::transaction::TransactionHandle;

/// Fail-over state of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnsState {
    Normal,
    MsgSendFailure,
}

/// Which request of the call-leg a DNS operation is aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnsTarget {
    /// The call-leg's own INVITE or BYE
    CallLeg,
    /// A re-INVITE
    ReInvite(InviteHandle),
    /// A general request sent with `request_general`
    General(TransactionHandle),
}

/// What the failed request was
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailedRequest {
    CallLeg {
        method: Method,
        state_before_send: CallLegState,
        state_at_failure: CallLegState,
    },
    ReInvite {
        invite: InviteHandle,
        state_before_send: ModifyState,
        state_at_failure: ModifyState,
    },
    General {
        method: Method,
    },
}

/// A request waiting for a fail-over decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    pub failed: TransactionHandle,
    pub request: FailedRequest,
    /// Clone produced by `continue`, not yet re-sent
    pub continued: Option<TransactionHandle>,
}

impl SendFailure {
    fn matches(&self, target: DnsTarget) -> bool {
        match (target, &self.request) {
            (DnsTarget::CallLeg, FailedRequest::CallLeg { .. }) => true,
            (DnsTarget::ReInvite(handle), FailedRequest::ReInvite { invite, .. }) => handle == *invite,
            (DnsTarget::General(tx), FailedRequest::General { .. }) => {
                self.failed == tx || self.continued == Some(tx)
            }
            _ => false,
        }
    }

    /// Transaction to work with: the clone when one exists
    pub fn current_transaction(&self) -> TransactionHandle {
        self.continued.unwrap_or(self.failed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DnsFailoverController {
    dialog: Option<SendFailure>,
    general: Vec<SendFailure>,
}

impl DnsFailoverController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse fail-over on a call-leg bound to a security association
    pub fn check_allowed(operation: &'static str, secured: bool) -> CallLegResult<()> {
        if secured {
            return Err(CallLegError::illegal_action(
                operation,
                "call-leg bound to a security association",
            ));
        }
        Ok(())
    }

    pub fn record(&mut self, failure: SendFailure) {
        match failure.request {
            FailedRequest::General { .. } => {
                self.general.retain(|f| f.failed != failure.failed);
                self.general.push(failure);
            }
            _ => self.dialog = Some(failure),
        }
    }

    pub fn state(&self, target: DnsTarget) -> DnsState {
        if self.get(target).is_some() {
            DnsState::MsgSendFailure
        } else {
            DnsState::Normal
        }
    }

    pub fn get(&self, target: DnsTarget) -> Option<&SendFailure> {
        match target {
            DnsTarget::General(_) => self.general.iter().find(|f| f.matches(target)),
            _ => self.dialog.as_ref().filter(|f| f.matches(target)),
        }
    }

    pub fn get_mut(&mut self, target: DnsTarget) -> Option<&mut SendFailure> {
        match target {
            DnsTarget::General(_) => self.general.iter_mut().find(|f| f.matches(target)),
            _ => self.dialog.as_mut().filter(|f| f.matches(target)),
        }
    }

    pub fn take(&mut self, target: DnsTarget) -> Option<SendFailure> {
        match target {
            DnsTarget::General(_) => {
                let index = self.general.iter().position(|f| f.matches(target))?;
                Some(self.general.remove(index))
            }
            _ => {
                if self.dialog.as_ref().is_some_and(|f| f.matches(target)) {
                    self.dialog.take()
                } else {
                    None
                }
            }
        }
    }

    /// Every transaction held by pending failures
    pub fn transactions(&self) -> Vec<TransactionHandle> {
        self.dialog
            .iter()
            .chain(self.general.iter())
            .flat_map(|f| std::iter::once(f.failed).chain(f.continued))
            .collect()
    }

    pub fn clear(&mut self) {
        self.dialog = None;
        self.general.clear();
    }
}
