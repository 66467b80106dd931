//! Re-INVITE operations
//!
//! A re-INVITE is created as an Idle record, optionally given its own
//! session timer values, and then sent. Received re-INVITEs are created by
//! message routing and answered with `accept`/`reject`.

use tracing::debug;

use super::context::OpCtx;
use super::core::DialogManager;
use super::session_operations::ack_reinvite;
use crate::arena::{CallLegHandle, InviteHandle};
use crate::callleg::legality;
use crate::callleg::{CallLeg, StateChangeReason};
use crate::errors::{CallLegError, CallLegResult};
use crate::invite::ModifyState;
use crate::message::Method;
use crate::prack::PrackStateMachine;
use crate::session_timer::SessionTimerParams;
use crate::transaction::TransactionHandle;

/// Drop finished re-INVITE records (legacy handling keeps only the live one)
pub(super) fn discard_completed_reinvites(leg: &mut CallLeg) {
    let finished: Vec<InviteHandle> = leg
        .invite_handles()
        .into_iter()
        .filter(|h| {
            leg.invite(*h).is_some_and(|r| {
                !r.is_initial()
                    && match r.state() {
                        ModifyState::AckSent | ModifyState::AckRcvd | ModifyState::Terminated => true,
                        ModifyState::Idle => r.cseq.is_some(),
                        _ => false,
                    }
            })
        })
        .collect();
    for invite in finished {
        leg.remove_invite(invite);
        debug!("{}: discarded {}", leg.handle(), invite);
    }
}

fn record_state(ctx: &OpCtx<'_>, invite: InviteHandle) -> CallLegResult<ModifyState> {
    ctx.leg
        .invite(invite)
        .map(|r| r.state())
        .ok_or_else(|| CallLegError::invalid_handle(invite))
}

/// Send the re-INVITE of an Idle record
pub(super) fn send_reinvite(ctx: &mut OpCtx<'_>, invite: InviteHandle) -> CallLegResult<TransactionHandle> {
    let session_override = ctx.leg.invite(invite).and_then(|r| r.session_override);
    let mut request = ctx.leg.build_request(Method::Invite, None)?;
    request.supported_100rel = ctx.config().supported_100rel;
    if let Some(st) = ctx.leg.session_timer.as_ref() {
        request.session_timer = st.request_headers(session_override.as_ref());
    }
    if !ctx.leg.auth.is_empty() {
        request.authorization = super::auth_operations::answer_challenges(ctx, &request)?;
    }
    let cseq = request.cseq;

    let tx = ctx.send_request(request)?;
    if let Some(record) = ctx.leg.invite_mut(invite) {
        record.transaction = Some(tx);
        record.cseq = Some(cseq);
        record.ack_sent = false;
    }
    ctx.leg.active_transaction = Some(tx);
    ctx.leg.prack = PrackStateMachine::new();
    ctx.set_modify_state(invite, ModifyState::ReinviteSent, StateChangeReason::LocalInviting);
    Ok(tx)
}

impl DialogManager {
    /// Create an Idle re-INVITE record; `app_handle` is returned with its events
    pub fn reinvite_create(&self, handle: CallLegHandle, app_handle: Option<u64>) -> CallLegResult<InviteHandle> {
        self.with_call_leg(handle, "reinvite_create", |ctx| {
            ctx.checked(legality::reinvite_create(&ctx.view(), ctx.policy()))?;
            if !ctx.policy().keeps_completed_records() {
                discard_completed_reinvites(ctx.leg);
            }
            let invite = ctx.leg.add_reinvite()?;
            if let Some(record) = ctx.leg.invite_mut(invite) {
                record.app_handle = app_handle;
            }
            debug!("{}: created {}", ctx.handle(), invite);
            Ok(invite)
        })
    }

    /// Send the re-INVITE of an Idle record
    pub fn reinvite_request(&self, handle: CallLegHandle, invite: InviteHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "reinvite_request", |ctx| {
            let record = record_state(ctx, invite)?;
            ctx.checked(legality::reinvite_request(&ctx.view(), ctx.policy(), record))?;
            send_reinvite(ctx, invite).map(|_| ())
        })
    }

    /// ACK the 2xx of a re-INVITE (manual ACK handling)
    pub fn reinvite_ack(&self, handle: CallLegHandle, invite: InviteHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "reinvite_ack", |ctx| {
            let record = record_state(ctx, invite)?;
            ctx.checked(legality::reinvite_ack(&ctx.view(), record))?;
            ack_reinvite(ctx, invite)
        })
    }

    /// Drop a re-INVITE record; a pending exchange on it is terminated
    pub fn reinvite_terminate(&self, handle: CallLegHandle, invite: InviteHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "reinvite_terminate", |ctx| {
            let (is_initial, tx) = ctx
                .leg
                .invite(invite)
                .map(|r| (r.is_initial(), r.transaction()))
                .ok_or_else(|| CallLegError::invalid_handle(invite))?;
            if is_initial {
                return ctx.checked(Err(CallLegError::illegal_action(
                    "reinvite_terminate",
                    "initial INVITE record",
                )));
            }

            if tx.is_some() && ctx.leg.active_transaction == tx {
                ctx.leg.active_transaction = None;
                if let Some(tx) = tx {
                    ctx.transactions().terminate(tx);
                }
            }
            ctx.set_modify_state(invite, ModifyState::Terminated, StateChangeReason::CallTerminated);
            ctx.leg.remove_invite(invite);
            Ok(())
        })
    }

    /// Session timer values for one re-INVITE instead of the call-leg's preference
    pub fn set_reinvite_session_timer(
        &self,
        handle: CallLegHandle,
        invite: InviteHandle,
        params: SessionTimerParams,
    ) -> CallLegResult<()> {
        params.validate()?;
        self.with_call_leg(handle, "set_reinvite_session_timer", |ctx| {
            let record = record_state(ctx, invite)?;
            if record != ModifyState::Idle {
                return ctx.checked(Err(CallLegError::illegal_action("set_reinvite_session_timer", record)));
            }
            if let Some(record) = ctx.leg.invite_mut(invite) {
                record.session_override = Some(params);
            }
            Ok(())
        })
    }

    pub fn modify_state(&self, handle: CallLegHandle, invite: InviteHandle) -> CallLegResult<ModifyState> {
        self.read_call_leg(handle, |leg| leg.invite(invite).map(|r| r.state()))?
            .ok_or_else(|| CallLegError::invalid_handle(invite))
    }

    /// Every INVITE record of the call-leg, initial first
    pub fn invite_records(&self, handle: CallLegHandle) -> CallLegResult<Vec<InviteHandle>> {
        self.read_call_leg(handle, |leg| leg.invite_handles())
    }
}
