//! PRACK operations (RFC 3262)

use super::context::OpCtx;
use super::core::DialogManager;
use crate::arena::CallLegHandle;
use crate::callleg::legality::{self, InviteTarget, LegalityView};
use crate::errors::{CallLegError, CallLegResult};
use crate::message::{Method, Rel100Status};
use crate::prack::PrackState;
use crate::transaction::TransactionHandle;

/// PRACK the last reliable provisional
pub(super) fn send_prack_on(ctx: &mut OpCtx<'_>) -> CallLegResult<TransactionHandle> {
    let rack = ctx.leg.prack.rack_for_prack()?;
    let mut request = ctx.leg.build_request(Method::Prack, None)?;
    request.rack = Some(rack);
    if !ctx.leg.auth.is_empty() {
        request.authorization = super::auth_operations::answer_challenges(ctx, &request)?;
    }
    let tx = ctx.send_request(request)?;
    ctx.with_prack(|prack| prack.on_prack_sent(tx));
    Ok(tx)
}

impl DialogManager {
    /// Send a PRACK (manual PRACK handling, or a retry after a challenge)
    pub fn send_prack(&self, handle: CallLegHandle) -> CallLegResult<TransactionHandle> {
        self.with_call_leg(handle, "send_prack", |ctx| {
            ctx.checked(legality::send_prack(&ctx.view()))?;
            send_prack_on(ctx)
        })
    }

    /// Answer a received PRACK (manual PRACK handling)
    pub fn send_prack_response(&self, handle: CallLegHandle, status: u16) -> CallLegResult<()> {
        if !(200..700).contains(&status) {
            return Err(CallLegError::bad_param(format!("PRACK response status {} out of range", status)));
        }
        self.with_call_leg(handle, "send_prack_response", |ctx| {
            ctx.checked(legality::send_prack_response(&ctx.view()))?;
            let tx = ctx
                .leg
                .prack
                .incoming_prack()
                .ok_or_else(|| CallLegError::illegal_action("send_prack_response", ctx.leg.prack.state()))?;
            ctx.respond(tx, ctx.response(status))?;
            ctx.with_prack(|prack| prack.on_prack_response_sent(status));
            Ok(())
        })
    }

    /// What the pending INVITE or re-INVITE said about 100rel
    pub fn get_100rel_status(&self, handle: CallLegHandle) -> CallLegResult<Rel100Status> {
        self.read_call_leg(handle, |leg| {
            let record = match legality::offer_pending(&LegalityView::of(leg)) {
                Some(InviteTarget::Initial) => leg.initial_record(),
                Some(InviteTarget::ReInvite(invite)) => leg.invite(invite),
                None => None,
            };
            record.map(|r| r.remote_100rel).unwrap_or_default()
        })
    }

    pub fn prack_state(&self, handle: CallLegHandle) -> CallLegResult<PrackState> {
        self.read_call_leg(handle, |leg| leg.prack.state())
    }
}
