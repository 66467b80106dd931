//! Authentication operations
//!
//! Client side: a 401/407 to the initial INVITE moves the call-leg to
//! Unauthenticated and `authenticate` resends the INVITE with credentials
//! built by the [`Authenticator`](crate::transaction::Authenticator).
//!
//! Server side: the application walks the credentials of a received request
//! with `auth_begin`/`auth_proceed`, and answers an unauthenticated request
//! with `respond_unauthenticated`.

use std::sync::Arc;

use tracing::{debug, info};

use super::context::OpCtx;
use super::core::DialogManager;
use super::session_operations::start_inviting;
use crate::arena::CallLegHandle;
use crate::auth::{AuthAction, AuthStep, Credentials, ServerAuthSession};
use crate::callleg::{legality, CallLegState, StateChangeReason};
use crate::errors::{CallLegError, CallLegResult};
use crate::events::CallLegEvent;
use crate::message::{Method, OutgoingRequest};
use crate::transaction::{Authenticator, TransactionHandle};

fn authenticator(ctx: &OpCtx<'_>, operation: &'static str) -> CallLegResult<Arc<dyn Authenticator>> {
    ctx.manager
        .collaborators()
        .authenticator
        .clone()
        .ok_or_else(|| CallLegError::illegal_action(operation, "no authenticator configured"))
}

/// Credentials answering every stored challenge
pub(super) fn answer_challenges(ctx: &mut OpCtx<'_>, request: &OutgoingRequest) -> CallLegResult<Vec<Credentials>> {
    if ctx.leg.auth.is_empty() {
        return Ok(Vec::new());
    }
    let authenticator = authenticator(ctx, "authenticate")?;
    let credentials = ctx
        .leg
        .auth
        .challenges()
        .map(|challenge| authenticator.build_credentials(challenge, request))
        .collect::<Result<Vec<_>, _>>()?;
    ctx.leg.auth.mark_used();
    debug!("{}: answering {} challenges", ctx.handle(), credentials.len());
    Ok(credentials)
}

/// Method of the received request `tx` and the credentials it carried
fn received_request(ctx: &OpCtx<'_>, tx: TransactionHandle) -> Option<(Method, Vec<Credentials>)> {
    let initial = ctx.leg.initial_record().and_then(|r| r.transaction());
    if initial == Some(tx) && ctx.leg.active_transaction == Some(tx) {
        return Some((Method::Invite, ctx.leg.invite_credentials.clone()));
    }
    ctx.leg
        .general
        .get(&tx)
        .filter(|g| g.incoming)
        .map(|g| (g.method.clone(), g.credentials.clone()))
}

fn report_step(ctx: &mut OpCtx<'_>, transaction: TransactionHandle, step: AuthStep) {
    let handle = ctx.handle();
    match step {
        AuthStep::Found(credentials) => ctx.emit(CallLegEvent::AuthCredentialsFound {
            handle,
            transaction,
            credentials,
        }),
        AuthStep::Completed(success) => {
            ctx.leg.server_auth = None;
            info!("{}: authentication of {} completed ({})", handle, transaction, success);
            ctx.emit(CallLegEvent::AuthCompleted {
                handle,
                transaction,
                success,
            });
        }
    }
}

impl DialogManager {
    /// Resend the challenged initial INVITE with credentials
    pub fn authenticate(&self, handle: CallLegHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "authenticate", |ctx| {
            ctx.checked(legality::authenticate(&ctx.view()))?;
            ctx.checked(authenticator(ctx, "authenticate"))?;
            start_inviting(ctx, true)
        })
    }

    /// Start walking the credentials of the received request `transaction`
    pub fn auth_begin(&self, handle: CallLegHandle, transaction: TransactionHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "auth_begin", |ctx| {
            let (_, credentials) =
                received_request(ctx, transaction).ok_or_else(|| CallLegError::invalid_handle(transaction))?;
            let session = ServerAuthSession::new(transaction, credentials);
            let step = session.start();
            ctx.leg.server_auth = Some(session);
            report_step(ctx, transaction, step);
            Ok(())
        })
    }

    /// Tell the walk what to do with the credentials last presented
    pub fn auth_proceed(
        &self,
        handle: CallLegHandle,
        transaction: TransactionHandle,
        action: AuthAction,
    ) -> CallLegResult<()> {
        self.with_call_leg(handle, "auth_proceed", |ctx| {
            let in_progress = ctx
                .leg
                .server_auth
                .as_ref()
                .is_some_and(|s| s.transaction == transaction);
            if !in_progress {
                return ctx.checked(Err(CallLegError::illegal_action(
                    "auth_proceed",
                    "no authentication in progress",
                )));
            }

            let step = match action {
                AuthAction::UsePassword(password) => {
                    let authenticator = authenticator(ctx, "auth_proceed")?;
                    let method = received_request(ctx, transaction)
                        .map(|(method, _)| method)
                        .unwrap_or(Method::Invite);
                    let Some(session) = ctx.leg.server_auth.as_mut() else {
                        return Ok(());
                    };
                    let verified = session
                        .current()
                        .is_some_and(|c| authenticator.verify(c, &password, &method));
                    if verified {
                        AuthStep::Completed(true)
                    } else {
                        session.advance()
                    }
                }
                AuthAction::Skip => match ctx.leg.server_auth.as_mut() {
                    Some(session) => session.advance(),
                    None => AuthStep::Completed(false),
                },
                AuthAction::Success => AuthStep::Completed(true),
                AuthAction::Failure => AuthStep::Completed(false),
            };
            report_step(ctx, transaction, step);
            Ok(())
        })
    }

    /// Challenge a received request with 401 or 407
    ///
    /// Challenging the initial INVITE ends the call-leg; the client retries
    /// with a new INVITE, which creates a new call-leg.
    pub fn respond_unauthenticated(
        &self,
        handle: CallLegHandle,
        transaction: TransactionHandle,
        status: u16,
        realm: &str,
    ) -> CallLegResult<()> {
        if !matches!(status, 401 | 407) {
            return Err(CallLegError::bad_param(format!(
                "status {} is not an authentication challenge",
                status
            )));
        }
        self.with_call_leg(handle, "respond_unauthenticated", |ctx| {
            let (method, _) =
                received_request(ctx, transaction).ok_or_else(|| CallLegError::invalid_handle(transaction))?;
            let authenticator = ctx.checked(authenticator(ctx, "respond_unauthenticated"))?;

            let mut response = ctx.response(status);
            response.challenges = vec![authenticator.build_challenge(realm, status == 407)];
            ctx.respond(transaction, response)?;
            if ctx.leg.server_auth.as_ref().is_some_and(|s| s.transaction == transaction) {
                ctx.leg.server_auth = None;
            }

            if method == Method::Invite && ctx.leg.state == CallLegState::Offering {
                ctx.leg.active_transaction = None;
                ctx.transactions().detach(transaction);
                ctx.terminate(StateChangeReason::LocalRejected);
            } else {
                ctx.leg.general.remove(&transaction);
            }
            Ok(())
        })
    }
}
