//! Call-leg lifecycle operations
//!
//! Application-initiated operations on the call-leg itself: connect, answer
//! (accept, reject, provisional responses), acknowledge, and the three ways
//! out (disconnect, cancel, terminate), plus BYE answering and general
//! in-dialog requests.

use tracing::{debug, info, warn};

use super::context::OpCtx;
use super::core::DialogManager;
use crate::arena::{CallLegHandle, InviteHandle};
use crate::callleg::legality::{self, InviteTarget};
use crate::callleg::{CallLegState, GeneralTransaction, StateChangeReason};
use crate::errors::{check_provisional_status, check_reject_status, CallLegError, CallLegResult, ErrorKind};
use crate::guard::GuardedOperation;
use crate::invite::ModifyState;
use crate::message::{Method, Rel100Status, SessionTimerHeaders};
use crate::prack::PrackStateMachine;
use crate::transaction::TransactionHandle;

/// Send the initial INVITE (connect, authenticate, redirect, 422 retry)
pub(super) fn send_initial_invite(ctx: &mut OpCtx<'_>, authenticate: bool) -> CallLegResult<TransactionHandle> {
    let config = ctx.config();
    ctx.leg.ensure_identity()?;
    if let Some(to) = ctx.leg.to.as_mut() {
        to.tag = None;
    }
    ctx.leg.route_set.clear();

    let mut request = ctx.leg.build_request(Method::Invite, None)?;
    request.supported_100rel = config.supported_100rel;
    request.replaces = ctx.leg.replaces.value().cloned();
    if let Some(st) = ctx.leg.session_timer.as_ref() {
        request.session_timer = st.request_headers(None);
    }
    if authenticate {
        request.authorization = super::auth_operations::answer_challenges(ctx, &request)?;
    }
    let cseq = request.cseq;

    let tx = ctx.send_request(request)?;
    ctx.leg.active_transaction = Some(tx);
    ctx.leg.prack = PrackStateMachine::new();
    if let Some(record) = ctx.leg.initial_record_mut() {
        record.transaction = Some(tx);
        record.cseq = Some(cseq);
        record.state = ModifyState::Idle;
        record.ack_sent = false;
    }
    Ok(tx)
}

/// Send the INVITE that starts a call and move to Inviting; a failed send terminates
pub(super) fn start_inviting(ctx: &mut OpCtx<'_>, authenticate: bool) -> CallLegResult<()> {
    let before = ctx.leg.state;
    match send_initial_invite(ctx, authenticate) {
        Ok(_) => {
            ctx.leg.state_before_send = before;
            ctx.set_state(CallLegState::Inviting, StateChangeReason::LocalInviting);
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::BadParam => Err(e),
        Err(e) => {
            ctx.terminate(StateChangeReason::LocalFailure);
            Err(e)
        }
    }
}

/// ACK the 2xx of the initial INVITE
pub(super) fn ack_initial(ctx: &mut OpCtx<'_>) -> CallLegResult<()> {
    let cseq = ctx
        .leg
        .initial_record()
        .and_then(|r| r.cseq)
        .ok_or_else(|| CallLegError::illegal_action("ack", ctx.leg.state))?;
    ctx.send_ack(cseq)?;
    if let Some(record) = ctx.leg.initial_record_mut() {
        record.ack_sent = true;
        record.state = ModifyState::AckSent;
    }
    Ok(())
}

/// ACK the 2xx of a re-INVITE
pub(super) fn ack_reinvite(ctx: &mut OpCtx<'_>, invite: InviteHandle) -> CallLegResult<()> {
    let cseq = ctx
        .leg
        .invite(invite)
        .and_then(|r| r.cseq)
        .ok_or_else(|| CallLegError::invalid_handle(invite))?;
    ctx.send_ack(cseq)?;
    if let Some(record) = ctx.leg.invite_mut(invite) {
        record.ack_sent = true;
    }
    ctx.set_modify_state(invite, ModifyState::AckSent, StateChangeReason::LocalAckSent);
    if ctx.policy().ack_covers_reinvite() && ctx.leg.state == CallLegState::RemoteAccepted {
        ctx.set_state(CallLegState::Connected, StateChangeReason::LocalAckSent);
    }
    Ok(())
}

/// Send BYE and move to Disconnecting; a BYE that cannot be sent forces Terminate
pub(super) fn send_bye(ctx: &mut OpCtx<'_>, reason: StateChangeReason) -> CallLegResult<()> {
    if ctx.leg.state == CallLegState::RemoteAccepted
        && ctx.leg.initial_record().is_some_and(|r| !r.ack_sent)
    {
        if let Err(e) = ack_initial(ctx) {
            debug!("{}: ACK before BYE failed: {}", ctx.handle(), e);
        }
    }

    ctx.leg.pending_state = Some(CallLegState::Disconnecting);
    let sent = send_authorized(ctx, Method::Bye);
    match sent {
        Ok(tx) => {
            ctx.leg.bye_transaction = Some(tx);
            ctx.leg.state_before_send = ctx.leg.state;
            ctx.set_state(CallLegState::Disconnecting, reason);
            Ok(())
        }
        Err(e) => {
            warn!("{}: BYE could not be sent, terminating: {}", ctx.handle(), e);
            ctx.terminate(StateChangeReason::LocalFailure);
            Err(e)
        }
    }
}

/// Build an in-dialog request carrying answers to the stored challenges and send it
fn send_authorized(ctx: &mut OpCtx<'_>, method: Method) -> CallLegResult<TransactionHandle> {
    let mut request = ctx.leg.build_request(method, None)?;
    request.authorization = super::auth_operations::answer_challenges(ctx, &request)?;
    ctx.send_request(request)
}

/// CANCEL the pending initial INVITE
pub(super) fn cancel_initial(ctx: &mut OpCtx<'_>) -> CallLegResult<()> {
    let tx = ctx
        .leg
        .active_transaction
        .ok_or_else(|| CallLegError::illegal_action("cancel", ctx.leg.state))?;
    let cancel = ctx.transactions().cancel(tx)?;
    ctx.leg.cancel_transaction = Some(cancel);
    ctx.set_state(CallLegState::Cancelling, StateChangeReason::LocalCancelling);
    Ok(())
}

fn invite_transaction(ctx: &OpCtx<'_>, target: InviteTarget, operation: &'static str) -> CallLegResult<TransactionHandle> {
    let tx = match target {
        InviteTarget::Initial => ctx.leg.active_transaction,
        InviteTarget::ReInvite(invite) => ctx.leg.invite(invite).and_then(|r| r.transaction),
    };
    tx.ok_or_else(|| CallLegError::illegal_action(operation, ctx.leg.state))
}

impl DialogManager {
    /// Send the initial INVITE of an outgoing call-leg
    pub fn connect(&self, handle: CallLegHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "connect", |ctx| {
            ctx.checked(legality::connect(&ctx.view()))?;
            start_inviting(ctx, false)
        })
    }

    /// Accept the initial INVITE or the pending re-INVITE with a 200
    pub fn accept(&self, handle: CallLegHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "accept", |ctx| {
            let target = ctx.checked(legality::accept(&ctx.view(), ctx.policy()))?;
            let tx = invite_transaction(ctx, target, "accept")?;

            let mut response = ctx.response(200);
            response.session_timer = ctx
                .leg
                .session_timer
                .as_ref()
                .map(|st| st.response_headers())
                .unwrap_or_default();
            ctx.respond(tx, response)?;

            if ctx.leg.session_timer.as_mut().and_then(|st| st.commit_pending()).is_some() {
                ctx.schedule_session_timer();
            }
            match target {
                InviteTarget::Initial => {
                    ctx.set_state(CallLegState::Accepted, StateChangeReason::LocalAccepted);
                }
                InviteTarget::ReInvite(invite) => {
                    ctx.set_modify_state(invite, ModifyState::ReinviteAccepted, StateChangeReason::LocalAccepted);
                    if ctx.policy().ack_covers_reinvite() {
                        ctx.set_state(CallLegState::Accepted, StateChangeReason::LocalAccepted);
                    }
                }
            }
            Ok(())
        })
    }

    /// Reject the initial INVITE or the pending re-INVITE
    pub fn reject(&self, handle: CallLegHandle, status: u16) -> CallLegResult<()> {
        check_reject_status(status)?;
        self.with_call_leg(handle, "reject", |ctx| {
            let target = ctx.checked(legality::reject(&ctx.view()))?;
            let tx = invite_transaction(ctx, target, "reject")?;
            ctx.respond(tx, ctx.response(status))?;
            ctx.leg.active_transaction = None;
            if let Some(st) = ctx.leg.session_timer.as_mut() {
                st.discard_pending();
            }

            match target {
                InviteTarget::Initial => {
                    ctx.transactions().detach(tx);
                    let reason = if ctx.leg.state == CallLegState::Cancelled {
                        StateChangeReason::RemoteCancelled
                    } else {
                        StateChangeReason::LocalRejected
                    };
                    ctx.terminate(reason);
                }
                InviteTarget::ReInvite(invite) => {
                    ctx.set_modify_state(invite, ModifyState::Terminated, StateChangeReason::LocalRejected);
                }
            }
            Ok(())
        })
    }

    /// Send an unreliable provisional (100..=199)
    pub fn provisional_response(&self, handle: CallLegHandle, status: u16) -> CallLegResult<()> {
        check_provisional_status(status, false)?;
        self.with_call_leg(handle, "provisional_response", |ctx| {
            let target = ctx.checked(legality::provisional(&ctx.view()))?;
            let tx = invite_transaction(ctx, target, "provisional_response")?;
            ctx.respond(tx, ctx.response(status))
        })
    }

    /// Send a reliable provisional (101..=199); the peer must support 100rel
    pub fn provisional_response_reliable(&self, handle: CallLegHandle, status: u16) -> CallLegResult<()> {
        check_provisional_status(status, true)?;
        self.with_call_leg(handle, "provisional_response_reliable", |ctx| {
            let target = ctx.checked(legality::provisional(&ctx.view()))?;
            let tx = invite_transaction(ctx, target, "provisional_response_reliable")?;
            let rel100 = match target {
                InviteTarget::Initial => ctx.leg.initial_record().map(|r| r.remote_100rel),
                InviteTarget::ReInvite(invite) => ctx.leg.invite(invite).map(|r| r.remote_100rel),
            };
            if rel100.unwrap_or_default() == Rel100Status::Undefined {
                return ctx.checked(Err(CallLegError::illegal_action(
                    "provisional_response_reliable",
                    "peer does not support 100rel",
                )));
            }

            let rseq = ctx.with_prack(|prack| prack.reserve_rseq())?;
            let mut response = ctx.response(status);
            response.rseq = Some(rseq);
            if let Err(e) = ctx.respond(tx, response) {
                ctx.leg.prack.release_rseq(rseq);
                return Err(e);
            }
            Ok(())
        })
    }

    /// ACK a 2xx when manual ACK handling is configured
    pub fn ack(&self, handle: CallLegHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "ack", |ctx| {
            let config = ctx.config();
            let target = ctx.checked(legality::ack(&ctx.view(), ctx.policy(), config.manual_ack))?;
            match target {
                InviteTarget::Initial => {
                    ack_initial(ctx)?;
                    ctx.set_state(CallLegState::Connected, StateChangeReason::LocalAckSent);
                }
                InviteTarget::ReInvite(invite) => ack_reinvite(ctx, invite)?,
            }
            Ok(())
        })
    }

    /// Leave the call in whatever way the current state calls for
    ///
    /// Calling it again while the first BYE or CANCEL is in flight succeeds
    /// without sending anything.
    pub fn disconnect(&self, handle: CallLegHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "disconnect", |ctx| {
            ctx.check_guard(GuardedOperation::Disconnect)?;
            let state = ctx.leg.state;
            if matches!(state, CallLegState::Disconnecting | CallLegState::Cancelling)
                || ctx.leg.pending_state.is_some()
            {
                debug!("{} already disconnecting", ctx.handle());
                return Ok(());
            }

            match state {
                CallLegState::Terminated => Ok(()),
                CallLegState::Idle
                | CallLegState::Redirected
                | CallLegState::Unauthenticated
                | CallLegState::Disconnected
                | CallLegState::MsgSendFailure => {
                    ctx.terminate(StateChangeReason::LocalDisconnected);
                    Ok(())
                }
                CallLegState::Offering | CallLegState::Cancelled => {
                    let (status, reason) = if state == CallLegState::Offering {
                        (603, StateChangeReason::LocalRejected)
                    } else {
                        (487, StateChangeReason::RemoteCancelled)
                    };
                    if let Some(tx) = ctx.leg.active_transaction.take() {
                        let result = ctx.respond(tx, ctx.response(status));
                        ctx.transactions().detach(tx);
                        ctx.terminate(reason);
                        return result;
                    }
                    ctx.terminate(reason);
                    Ok(())
                }
                CallLegState::Inviting => {
                    if ctx.leg.is_fork() || ctx.leg.active_transaction.is_none() {
                        ctx.terminate(StateChangeReason::LocalDisconnected);
                    } else {
                        // CANCEL has to wait for the first provisional
                        info!("{} will cancel after the first provisional", ctx.handle());
                        ctx.leg.pending_state = Some(CallLegState::Cancelling);
                    }
                    Ok(())
                }
                CallLegState::Proceeding | CallLegState::ProceedingTimeout => {
                    if ctx.leg.is_fork() || ctx.leg.active_transaction.is_none() {
                        ctx.terminate(StateChangeReason::LocalDisconnected);
                        return Ok(());
                    }
                    cancel_initial(ctx)
                }
                CallLegState::Accepted | CallLegState::RemoteAccepted | CallLegState::Connected => {
                    send_bye(ctx, StateChangeReason::LocalDisconnecting)
                }
                CallLegState::Disconnecting | CallLegState::Cancelling => Ok(()),
            }
        })
    }

    /// CANCEL the pending initial INVITE (original call-leg only) or re-INVITE
    pub fn cancel(&self, handle: CallLegHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "cancel", |ctx| {
            ctx.check_guard(GuardedOperation::Cancel)?;
            if ctx.leg.state == CallLegState::Cancelling {
                return Ok(());
            }
            match ctx.checked(legality::cancel(&ctx.view()))? {
                InviteTarget::Initial => cancel_initial(ctx),
                InviteTarget::ReInvite(invite) => {
                    let tx = invite_transaction(ctx, InviteTarget::ReInvite(invite), "cancel")?;
                    ctx.transactions().cancel(tx)?;
                    ctx.set_modify_state(invite, ModifyState::ReinviteCancelling, StateChangeReason::LocalCancelling);
                    Ok(())
                }
            }
        })
    }

    /// Terminate without sending anything
    pub fn terminate(&self, handle: CallLegHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "terminate", |ctx| {
            ctx.check_guard(GuardedOperation::Terminate)?;
            ctx.terminate(StateChangeReason::CallTerminated);
            Ok(())
        })
    }

    /// The owner is done with the call-leg; it is released once terminated
    pub fn detach_owner(&self, handle: CallLegHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "detach_owner", |ctx| {
            ctx.leg.owner = None;
            ctx.leg.detached = true;
            Ok(())
        })?;
        self.release_if_done(handle);
        Ok(())
    }

    /// Answer a received BYE with 200 (manual BYE handling)
    pub fn bye_accept(&self, handle: CallLegHandle, transaction: TransactionHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "bye_accept", |ctx| {
            if !ctx.config().manual_bye || ctx.leg.incoming_bye != Some(transaction) {
                return ctx.checked(Err(CallLegError::illegal_action("bye_accept", ctx.leg.state)));
            }
            ctx.respond(transaction, ctx.response(200))?;
            ctx.leg.incoming_bye = None;
            ctx.set_state(CallLegState::Disconnected, StateChangeReason::RemoteDisconnected);
            ctx.terminate(StateChangeReason::RemoteDisconnected);
            Ok(())
        })
    }

    /// Refuse a received BYE (manual BYE handling)
    pub fn bye_reject(&self, handle: CallLegHandle, transaction: TransactionHandle, status: u16) -> CallLegResult<()> {
        check_reject_status(status)?;
        self.with_call_leg(handle, "bye_reject", |ctx| {
            if !ctx.config().manual_bye || ctx.leg.incoming_bye != Some(transaction) {
                return ctx.checked(Err(CallLegError::illegal_action("bye_reject", ctx.leg.state)));
            }
            ctx.respond(transaction, ctx.response(status))?;
            ctx.leg.incoming_bye = None;
            Ok(())
        })
    }

    /// Send a general in-dialog request (INFO, UPDATE, OPTIONS, MESSAGE, ...)
    pub fn request_general(&self, handle: CallLegHandle, method: Method) -> CallLegResult<TransactionHandle> {
        if matches!(
            method,
            Method::Invite | Method::Ack | Method::Cancel | Method::Bye | Method::Prack
        ) {
            return Err(CallLegError::bad_param(format!("{} is not a general request", method)));
        }
        self.with_call_leg(handle, "request_general", |ctx| {
            send_general(ctx, method, None, SessionTimerHeaders::default())
        })
    }

    /// Answer a general request received on the call-leg
    pub fn respond_general(&self, handle: CallLegHandle, transaction: TransactionHandle, status: u16) -> CallLegResult<()> {
        if !(100..700).contains(&status) {
            return Err(CallLegError::bad_param(format!("status {} out of range", status)));
        }
        self.with_call_leg(handle, "respond_general", |ctx| {
            let general = ctx
                .leg
                .general
                .get(&transaction)
                .filter(|g| g.incoming)
                .cloned()
                .ok_or_else(|| CallLegError::invalid_handle(transaction))?;

            let mut response = ctx.response(status);
            let refresh = general.method == Method::Update && (200..300).contains(&status);
            if refresh {
                response.session_timer = ctx
                    .leg
                    .session_timer
                    .as_ref()
                    .map(|st| st.response_headers())
                    .unwrap_or_default();
            }
            ctx.respond(transaction, response)?;

            if status >= 200 {
                ctx.leg.general.remove(&transaction);
                if refresh {
                    if ctx.leg.session_timer.as_mut().and_then(|st| st.commit_pending()).is_some() {
                        ctx.schedule_session_timer();
                    }
                } else if general.method == Method::Update {
                    if let Some(st) = ctx.leg.session_timer.as_mut() {
                        st.discard_pending();
                    }
                }
            }
            Ok(())
        })
    }
}

/// Send a general request; an UPDATE carries the session timer headers
pub(super) fn send_general(
    ctx: &mut OpCtx<'_>,
    method: Method,
    session_override: Option<crate::session_timer::SessionTimerParams>,
    session_timer: SessionTimerHeaders,
) -> CallLegResult<TransactionHandle> {
    let in_dialog = ctx.leg.remote_tag().is_some()
        && !matches!(
            ctx.leg.state,
            CallLegState::Idle | CallLegState::Disconnected | CallLegState::Terminated
        );
    if !in_dialog {
        return ctx.checked(Err(CallLegError::illegal_action("request_general", ctx.leg.state)));
    }

    let mut request = ctx.leg.build_request(method.clone(), None)?;
    request.session_timer = session_timer;
    if method == Method::Update && request.session_timer.is_empty() {
        if let Some(st) = ctx.leg.session_timer.as_ref() {
            request.session_timer = st.request_headers(session_override.as_ref());
        }
    }
    request.authorization = super::auth_operations::answer_challenges(ctx, &request)?;
    let tx = ctx.send_request(request)?;
    ctx.leg.general.insert(
        tx,
        GeneralTransaction {
            method,
            incoming: false,
            session_override,
            credentials: Vec::new(),
            session_timer: SessionTimerHeaders::default(),
        },
    );
    Ok(tx)
}
