//! Session timer operations (RFC 4028)

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::context::OpCtx;
use super::core::DialogManager;
use super::reinvite_operations::{discard_completed_reinvites, send_reinvite};
use super::session_operations::send_general;
use crate::arena::{CallLegHandle, InviteHandle};
use crate::callleg::legality;
use crate::config::RefreshMethod;
use crate::errors::{CallLegError, CallLegResult};
use crate::invite::ModifyState;
use crate::message::{Method, SessionTimerHeaders};
use crate::session_timer::{NegotiatedTimer, SessionTimerNegotiator, SessionTimerParams};
use crate::transaction::{TimerKind, TransactionHandle};

/// Request that carries a session refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRefresh {
    ReInvite(InviteHandle),
    Update(TransactionHandle),
}

/// Refresh the session with the configured method
pub(super) fn refresh(ctx: &mut OpCtx<'_>, params: Option<SessionTimerParams>) -> CallLegResult<SessionRefresh> {
    let method = ctx
        .leg
        .session_timer
        .as_ref()
        .filter(|st| st.is_enabled())
        .map(|st| st.refresh_method())
        .ok_or_else(|| CallLegError::illegal_action("refresh_session", "session timer disabled"))?;
    if !ctx.leg.state.is_established() {
        return ctx.checked(Err(CallLegError::illegal_action("refresh_session", ctx.leg.state)));
    }

    match method {
        RefreshMethod::Invite => {
            ctx.checked(legality::reinvite_request(&ctx.view(), ctx.policy(), ModifyState::Idle))?;
            if !ctx.policy().keeps_completed_records() {
                discard_completed_reinvites(ctx.leg);
            }
            let invite = ctx.leg.add_reinvite()?;
            if let Some(record) = ctx.leg.invite_mut(invite) {
                record.session_override = params;
            }
            match send_reinvite(ctx, invite) {
                Ok(_) => {
                    info!("{}: session refresh with re-INVITE {}", ctx.handle(), invite);
                    Ok(SessionRefresh::ReInvite(invite))
                }
                Err(e) => {
                    ctx.leg.remove_invite(invite);
                    Err(e)
                }
            }
        }
        RefreshMethod::Update => {
            let tx = send_general(ctx, Method::Update, params, SessionTimerHeaders::default())?;
            info!("{}: session refresh with UPDATE {}", ctx.handle(), tx);
            Ok(SessionRefresh::Update(tx))
        }
    }
}

impl DialogManager {
    /// Replace the session timer preference of a call-leg
    ///
    /// A call-leg created without session timers gets a negotiator built
    /// from the configured defaults. Disabling stops the running timer.
    pub fn set_session_timer_preference(&self, handle: CallLegHandle, params: SessionTimerParams) -> CallLegResult<()> {
        params.validate()?;
        let defaults = self.config().session_timer.clone().unwrap_or_default();
        self.with_call_leg(handle, "set_session_timer_preference", |ctx| {
            ctx.checked(legality::not_terminated(&ctx.view(), "set_session_timer_preference"))?;
            ctx.leg
                .session_timer
                .get_or_insert_with(|| SessionTimerNegotiator::new(&defaults))
                .set_preference(params)?;
            if !params.is_enabled() {
                debug!("{}: session timer disabled", ctx.handle());
                ctx.cancel_timer(TimerKind::SessionRefresh);
                ctx.cancel_timer(TimerKind::SessionExpiry);
            }
            Ok(())
        })
    }

    pub fn session_timer_preference(&self, handle: CallLegHandle) -> CallLegResult<Option<SessionTimerParams>> {
        self.read_call_leg(handle, |leg| leg.session_timer.as_ref().map(|st| *st.preference()))
    }

    /// Values agreed in the last successful negotiation
    pub fn negotiated_session_timer(&self, handle: CallLegHandle) -> CallLegResult<Option<NegotiatedTimer>> {
        self.read_call_leg(handle, |leg| leg.session_timer.as_ref().and_then(|st| st.negotiated()))
    }

    /// Stop the running session timer; the next refresh negotiates again
    pub fn stop_session_timer(&self, handle: CallLegHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "stop_session_timer", |ctx| {
            if let Some(st) = ctx.leg.session_timer.as_mut() {
                st.stop();
            }
            ctx.cancel_timer(TimerKind::SessionRefresh);
            ctx.cancel_timer(TimerKind::SessionExpiry);
            Ok(())
        })
    }

    /// Seconds before expiry at which the refresh alert fires
    pub fn set_session_timer_alert_time(&self, handle: CallLegHandle, alert_time: u32) -> CallLegResult<()> {
        self.with_call_leg(handle, "set_session_timer_alert_time", |ctx| {
            let st = ctx
                .leg
                .session_timer
                .as_mut()
                .ok_or_else(|| CallLegError::illegal_action("set_session_timer_alert_time", "session timer disabled"))?;
            st.set_alert_time(alert_time);
            if ctx.leg.armed_timers.contains(&TimerKind::SessionRefresh) {
                ctx.schedule_session_timer();
            }
            Ok(())
        })
    }

    /// Refresh the session now, with the configured re-INVITE or UPDATE
    pub fn refresh_session(
        &self,
        handle: CallLegHandle,
        params: Option<SessionTimerParams>,
    ) -> CallLegResult<SessionRefresh> {
        if let Some(params) = params.as_ref() {
            params.validate()?;
        }
        self.with_call_leg(handle, "refresh_session", |ctx| refresh(ctx, params))
    }
}
