//! DNS fail-over operations
//!
//! When the transaction layer cannot deliver a request it reports a send
//! failure; the call-leg (or the re-INVITE record) moves to MsgSendFailure
//! and the application picks one of:
//!
//! ```text
//!  MsgSendFailure ──dns_give_up──▶ terminated / state before the send
//!        │
//!        └──dns_continue──▶ clone for next address ──dns_resend──▶ state at the failure
//! ```
//!
//! None of this is allowed on a call-leg bound to a security association,
//! since the association is tied to the address that failed.

use tracing::{debug, info, warn};

use super::context::OpCtx;
use super::core::DialogManager;
use crate::arena::CallLegHandle;
use crate::callleg::{CallLegState, StateChangeReason};
use crate::dns::{DnsFailoverController, DnsState, DnsTarget, FailedRequest, SendFailure};
use crate::errors::{CallLegError, CallLegResult};
use crate::events::CallLegEvent;
use crate::invite::ModifyState;
use crate::message::Method;
use crate::transaction::TransactionHandle;

fn check_allowed(ctx: &OpCtx<'_>, operation: &'static str) -> CallLegResult<()> {
    ctx.checked(DnsFailoverController::check_allowed(
        operation,
        ctx.leg.security_association.is_some(),
    ))
}

fn pending_failure(ctx: &OpCtx<'_>, target: DnsTarget, operation: &'static str) -> CallLegResult<SendFailure> {
    ctx.leg
        .dns
        .get(target)
        .cloned()
        .ok_or_else(|| CallLegError::illegal_action(operation, DnsState::Normal))
}

/// Work out which request `tx` carried
fn identify(ctx: &OpCtx<'_>, tx: TransactionHandle) -> Option<FailedRequest> {
    let leg = &*ctx.leg;
    if leg.active_transaction == Some(tx) {
        if let Some(invite) = leg.invite_by_transaction(tx) {
            if let Some(record) = leg.invite(invite).filter(|r| !r.is_initial()) {
                return Some(FailedRequest::ReInvite {
                    invite,
                    state_before_send: ModifyState::Idle,
                    state_at_failure: record.state(),
                });
            }
        }
        return Some(FailedRequest::CallLeg {
            method: Method::Invite,
            state_before_send: leg.state_before_send,
            state_at_failure: leg.state,
        });
    }
    if leg.bye_transaction == Some(tx) {
        return Some(FailedRequest::CallLeg {
            method: Method::Bye,
            state_before_send: leg.state_before_send,
            state_at_failure: leg.state,
        });
    }
    leg.general
        .get(&tx)
        .filter(|g| !g.incoming)
        .map(|g| FailedRequest::General { method: g.method.clone() })
}

/// Point every reference to `old` at `new`
fn swap_transaction(ctx: &mut OpCtx<'_>, old: TransactionHandle, new: TransactionHandle) {
    let leg = &mut *ctx.leg;
    for slot in [&mut leg.active_transaction, &mut leg.bye_transaction] {
        if *slot == Some(old) {
            *slot = Some(new);
        }
    }
    if let Some(invite) = leg.invite_by_transaction(old) {
        if let Some(record) = leg.invite_mut(invite) {
            record.transaction = Some(new);
        }
    }
    if let Some(general) = leg.general.remove(&old) {
        leg.general.insert(new, general);
    }
}

impl DialogManager {
    /// The transaction layer could not deliver the request of `transaction`
    pub fn on_message_send_failure(&self, handle: CallLegHandle, transaction: TransactionHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "on_message_send_failure", |ctx| {
            let request = identify(ctx, transaction).ok_or_else(|| {
                debug!("{}: send failure on unknown {}", ctx.handle(), transaction);
                CallLegError::invalid_handle(transaction)
            })?;
            warn!("{}: could not deliver {:?} on {}", ctx.handle(), request, transaction);

            let method = match &request {
                FailedRequest::CallLeg { method, .. } => method.clone(),
                FailedRequest::ReInvite { .. } => Method::Invite,
                FailedRequest::General { method } => method.clone(),
            };
            ctx.leg.dns.record(SendFailure {
                failed: transaction,
                request: request.clone(),
                continued: None,
            });
            match request {
                FailedRequest::CallLeg { .. } => {
                    ctx.set_state(CallLegState::MsgSendFailure, StateChangeReason::NetworkError);
                }
                FailedRequest::ReInvite { invite, .. } => {
                    ctx.set_modify_state(invite, ModifyState::MsgSendFailure, StateChangeReason::NetworkError);
                }
                FailedRequest::General { .. } => {}
            }

            let handle = ctx.handle();
            ctx.emit(CallLegEvent::MessageSendFailure {
                handle,
                transaction,
                method,
            });
            Ok(())
        })
    }

    /// Stop trying; the request is abandoned
    pub fn dns_give_up(&self, handle: CallLegHandle, target: DnsTarget) -> CallLegResult<()> {
        self.with_call_leg(handle, "dns_give_up", |ctx| {
            check_allowed(ctx, "dns_give_up")?;
            let failure = ctx.checked(pending_failure(ctx, target, "dns_give_up"))?;
            ctx.leg.dns.take(target);

            let layer = ctx.transactions();
            layer.terminate(failure.failed);
            if let Some(continued) = failure.continued {
                layer.terminate(continued);
            }
            let current = failure.current_transaction();
            info!("{}: giving up on {}", ctx.handle(), current);

            match failure.request {
                FailedRequest::CallLeg {
                    method,
                    state_before_send,
                    ..
                } => {
                    ctx.leg.active_transaction = None;
                    ctx.leg.bye_transaction = None;
                    let first_request = state_before_send == CallLegState::Idle;
                    if method == Method::Bye || first_request {
                        ctx.terminate(StateChangeReason::DnsGiveUp);
                    } else {
                        ctx.set_state(state_before_send, StateChangeReason::DnsGiveUp);
                    }
                }
                FailedRequest::ReInvite {
                    invite,
                    state_before_send,
                    ..
                } => {
                    ctx.leg.active_transaction = None;
                    ctx.set_modify_state(invite, state_before_send, StateChangeReason::DnsGiveUp);
                }
                FailedRequest::General { .. } => {
                    ctx.leg.general.remove(&failure.failed);
                    ctx.leg.general.remove(&current);
                }
            }
            Ok(())
        })
    }

    /// Clone the failed request for the next resolved address
    pub fn dns_continue(&self, handle: CallLegHandle, target: DnsTarget) -> CallLegResult<TransactionHandle> {
        self.with_call_leg(handle, "dns_continue", |ctx| {
            check_allowed(ctx, "dns_continue")?;
            let failure = ctx.checked(pending_failure(ctx, target, "dns_continue"))?;
            let current = failure.current_transaction();

            let clone = ctx.transactions().clone_for_next_address(current)?;
            if failure.continued.is_some() {
                ctx.transactions().terminate(current);
            }
            swap_transaction(ctx, current, clone);
            if let Some(entry) = ctx.leg.dns.get_mut(target) {
                entry.continued = Some(clone);
            }
            debug!("{}: {} cloned into {}", ctx.handle(), current, clone);
            Ok(clone)
        })
    }

    /// Send the clone made by `dns_continue`
    pub fn dns_resend(&self, handle: CallLegHandle, target: DnsTarget) -> CallLegResult<()> {
        self.with_call_leg(handle, "dns_resend", |ctx| {
            check_allowed(ctx, "dns_resend")?;
            let failure = ctx.checked(pending_failure(ctx, target, "dns_resend"))?;
            let clone = failure
                .continued
                .ok_or_else(|| CallLegError::illegal_action("dns_resend", "request was not cloned"))?;

            ctx.transactions().resend(clone)?;
            ctx.leg.dns.take(target);
            ctx.transactions().terminate(failure.failed);
            info!("{}: resent on {}", ctx.handle(), clone);

            match failure.request {
                FailedRequest::CallLeg { state_at_failure, .. } => {
                    ctx.set_state(state_at_failure, StateChangeReason::DnsResent);
                }
                FailedRequest::ReInvite {
                    invite,
                    state_at_failure,
                    ..
                } => {
                    ctx.set_modify_state(invite, state_at_failure, StateChangeReason::DnsResent);
                }
                FailedRequest::General { .. } => {}
            }
            Ok(())
        })
    }

    /// Destinations left for the failed request
    pub fn dns_list(&self, handle: CallLegHandle, target: DnsTarget) -> CallLegResult<Vec<String>> {
        self.with_call_leg(handle, "dns_list", |ctx| {
            check_allowed(ctx, "dns_list")?;
            let failure = ctx.checked(pending_failure(ctx, target, "dns_list"))?;
            Ok(ctx.transactions().dns_list(failure.current_transaction())?)
        })
    }

    pub fn dns_state(&self, handle: CallLegHandle, target: DnsTarget) -> CallLegResult<DnsState> {
        self.read_call_leg(handle, |leg| leg.dns.state(target))
    }
}
