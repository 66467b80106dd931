//! Network-facing entry points
//!
//! The transaction layer reports everything that happens on the wire
//! through the methods in this module. Requests are matched to call-legs by
//! dialog identity, responses arrive on the call-leg that owns the client
//! transaction, and responses to a forked INVITE are handed over to the fork
//! they belong to once the original's lock has been released.

use tracing::{debug, info, warn};

use super::context::{FollowUp, OpCtx};
use super::core::DialogManager;
use super::session_operations::{ack_initial, ack_reinvite, cancel_initial, send_bye, send_initial_invite};
use crate::arena::{CallLegHandle, InviteHandle};
use crate::callleg::{CallLeg, CallLegState, Direction, GeneralTransaction, StateChangeReason};
use crate::errors::{CallLegError, CallLegResult};
use crate::events::CallLegEvent;
use crate::forking::{self, ForkRoute};
use crate::invite::ModifyState;
use crate::message::{Method, OutgoingResponse, RequestInfo, ResponseInfo};
use crate::prack::{PrackStateMachine, ProvisionalOrder};
use crate::session_timer::{RequestVerdict, SessionTimerNegotiator};
use crate::transaction::{TimerKind, TransactionHandle};

impl DialogManager {
    /// A request arrived on a server transaction
    ///
    /// Initial INVITEs create a call-leg, everything else is matched to an
    /// existing one. Requests that match nothing are answered here (481,
    /// 503 when no call-leg can be allocated) and reported as errors.
    pub fn on_request_received(
        &self,
        transaction: TransactionHandle,
        request: RequestInfo,
    ) -> CallLegResult<CallLegHandle> {
        debug!(
            "{} {} received on {} (Call-ID {})",
            request.method, request.cseq, transaction, request.call_id
        );

        let Some(to_tag) = request.to.tag.clone() else {
            return match request.method.clone() {
                Method::Invite => self.on_initial_invite(transaction, request),
                Method::Cancel => {
                    let handle = request
                        .from
                        .tag
                        .as_deref()
                        .and_then(|from_tag| self.find_incoming(&request.call_id, from_tag));
                    match handle {
                        Some(handle) => {
                            self.with_call_leg(handle, "on_cancel", |ctx| on_cancel(ctx, transaction))?;
                            Ok(handle)
                        }
                        None => Err(self.no_call_leg(transaction, &request)),
                    }
                }
                _ => Err(self.no_call_leg(transaction, &request)),
            };
        };

        let handle = self
            .find_call_leg(&request.call_id, &to_tag, request.from.tag.as_deref())
            .ok_or_else(|| self.no_call_leg(transaction, &request))?;
        self.with_call_leg(handle, "on_request_received", |ctx| {
            in_dialog_request(ctx, transaction, request)
        })?;
        Ok(handle)
    }

    fn on_initial_invite(&self, transaction: TransactionHandle, request: RequestInfo) -> CallLegResult<CallLegHandle> {
        if let Some(from_tag) = request.from.tag.as_deref() {
            if let Some(existing) = self.find_incoming(&request.call_id, from_tag) {
                // merged request, RFC 3261 8.2.2.2
                warn!("INVITE on {} matches {}, answering 482", transaction, existing);
                self.with_call_leg(existing, "nested_initial_request", |ctx| {
                    let handle = ctx.handle();
                    ctx.emit(CallLegEvent::NestedInitialRequest { handle, transaction });
                    ctx.respond_status(transaction, 482);
                    Ok(())
                })?;
                return Ok(existing);
            }
        }

        let session_timer = self.config().session_timer.as_ref();
        let handle = match self.insert_call_leg(|h| CallLeg::new_incoming(h, &request, session_timer)) {
            Ok(handle) => handle,
            Err(e) => {
                self.answer_without_call_leg(transaction, 503);
                return Err(e);
            }
        };
        info!("Incoming INVITE {} created {}", transaction, handle);

        self.with_call_leg(handle, "on_initial_invite", |ctx| {
            ctx.leg.active_transaction = Some(transaction);
            if let Some(record) = ctx.leg.initial_record_mut() {
                record.transaction = Some(transaction);
                record.cseq = Some(request.cseq);
                record.remote_100rel = request.rel100;
            }

            let verdict = ctx
                .leg
                .session_timer
                .as_mut()
                .map(|st| st.on_request(&request.session_timer, None));
            if let Some(RequestVerdict::TooSmall { min_se }) = verdict {
                let mut response = ctx.response(422);
                response.session_timer = SessionTimerNegotiator::too_small_headers(min_se);
                if let Err(e) = ctx.respond(transaction, response) {
                    debug!("422 for {} not sent: {}", transaction, e);
                }
                // nobody has seen this call-leg, release it right away
                ctx.leg.active_transaction = None;
                ctx.leg.detached = true;
                ctx.terminate(StateChangeReason::LocalRejected);
                return Ok(());
            }

            ctx.emit(CallLegEvent::Created {
                handle,
                direction: Direction::Incoming,
            });
            ctx.set_state(CallLegState::Offering, StateChangeReason::RemoteInviting);
            Ok(())
        })?;
        Ok(handle)
    }

    fn no_call_leg(&self, transaction: TransactionHandle, request: &RequestInfo) -> CallLegError {
        debug!("No call-leg for {} {} on {}", request.method, request.call_id, transaction);
        if request.method != Method::Ack {
            self.answer_without_call_leg(transaction, 481);
        }
        CallLegError::invalid_handle(format!("dialog {}", request.call_id))
    }

    fn answer_without_call_leg(&self, transaction: TransactionHandle, status: u16) {
        if let Err(e) = self
            .collaborators()
            .transactions
            .respond(transaction, OutgoingResponse::new(status))
        {
            debug!("{} on {} not sent: {}", status, transaction, e);
        }
    }

    /// A response arrived on a client transaction owned by `handle`
    pub fn on_response_received(
        &self,
        handle: CallLegHandle,
        transaction: TransactionHandle,
        response: ResponseInfo,
    ) -> CallLegResult<()> {
        self.with_call_leg(handle, "on_response_received", |ctx| {
            if ctx.leg.state.is_terminated() {
                debug!("{} terminated, dropping {} on {}", ctx.handle(), response.status, transaction);
                return Ok(());
            }
            match response.method.clone() {
                Method::Invite => on_invite_response(ctx, transaction, response),
                Method::Bye => on_bye_response(ctx, transaction, &response),
                Method::Cancel => {
                    if response.status >= 200 && ctx.leg.cancel_transaction == Some(transaction) {
                        ctx.leg.cancel_transaction = None;
                    }
                    Ok(())
                }
                Method::Prack => {
                    let ours = ctx.with_prack(|prack| prack.on_prack_final_response(transaction));
                    if ours && matches!(response.status, 401 | 407) {
                        ctx.leg.auth.update(&response.challenges);
                    }
                    Ok(())
                }
                _ => on_general_response(ctx, transaction, &response),
            }
        })
    }

    /// A client transaction gave up waiting (timer B/F) or a provisional
    /// timeout was reported
    pub fn on_transaction_timeout(&self, handle: CallLegHandle, transaction: TransactionHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "on_transaction_timeout", |ctx| {
            warn!("{}: {} timed out", ctx.handle(), transaction);

            if ctx.leg.bye_transaction == Some(transaction) {
                ctx.leg.bye_transaction = None;
                ctx.set_state(CallLegState::Disconnected, StateChangeReason::Timeout);
                ctx.terminate(StateChangeReason::Timeout);
                return Ok(());
            }

            if let Some(invite) = ctx.leg.invite_by_transaction(transaction) {
                let (is_initial, modify) = match ctx.leg.invite(invite) {
                    Some(record) => (record.is_initial(), record.state()),
                    None => return Ok(()),
                };
                if is_initial {
                    match ctx.leg.state {
                        CallLegState::Proceeding => {
                            ctx.set_state(CallLegState::ProceedingTimeout, StateChangeReason::Timeout);
                        }
                        CallLegState::Inviting => {
                            ctx.set_state(CallLegState::Disconnected, StateChangeReason::Timeout);
                            ctx.terminate(StateChangeReason::Timeout);
                        }
                        CallLegState::Cancelling => ctx.terminate(StateChangeReason::Timeout),
                        CallLegState::Accepted => {
                            // our 2xx was never acknowledged
                            ctx.leg.active_transaction = None;
                            if let Err(e) = send_bye(ctx, StateChangeReason::Timeout) {
                                debug!("{}: BYE after missing ACK failed: {}", ctx.handle(), e);
                            }
                        }
                        other => debug!("{}: INVITE timeout ignored in {}", ctx.handle(), other),
                    }
                    return Ok(());
                }

                match modify {
                    ModifyState::ReinviteProceeding => {
                        ctx.set_modify_state(invite, ModifyState::ReinviteProceedingTimeout, StateChangeReason::Timeout);
                    }
                    ModifyState::ReinviteSent | ModifyState::ReinviteCancelling => {
                        ctx.leg.active_transaction = None;
                        ctx.set_modify_state(invite, ModifyState::Idle, StateChangeReason::Timeout);
                        if let Err(e) = send_bye(ctx, StateChangeReason::Timeout) {
                            debug!("{}: BYE after re-INVITE timeout failed: {}", ctx.handle(), e);
                        }
                    }
                    ModifyState::ReinviteAccepted => {
                        ctx.leg.active_transaction = None;
                        ctx.set_modify_state(invite, ModifyState::Terminated, StateChangeReason::Timeout);
                        if let Err(e) = send_bye(ctx, StateChangeReason::Timeout) {
                            debug!("{}: BYE after missing ACK failed: {}", ctx.handle(), e);
                        }
                    }
                    other => debug!("{}: re-INVITE timeout ignored in {:?}", ctx.handle(), other),
                }
                return Ok(());
            }

            if ctx.leg.general.get(&transaction).is_some_and(|g| !g.incoming) {
                ctx.leg.general.remove(&transaction);
                let handle = ctx.handle();
                ctx.emit(CallLegEvent::GeneralResponseReceived {
                    handle,
                    transaction,
                    status: 408,
                });
            }
            Ok(())
        })
    }

    /// The transaction layer is done with `transaction`
    pub fn on_transaction_terminated(&self, handle: CallLegHandle, transaction: TransactionHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "on_transaction_terminated", |ctx| {
            let leg = &mut *ctx.leg;
            if leg.active_transaction == Some(transaction) {
                leg.active_transaction = None;
            }
            for slot in [&mut leg.bye_transaction, &mut leg.incoming_bye, &mut leg.cancel_transaction] {
                if *slot == Some(transaction) {
                    *slot = None;
                }
            }
            leg.general.remove(&transaction);
            Ok(())
        })
    }

    pub fn on_final_destination_resolved(&self, handle: CallLegHandle, transaction: TransactionHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "on_final_destination_resolved", |ctx| {
            let handle = ctx.handle();
            ctx.emit(CallLegEvent::FinalDestinationResolved { handle, transaction });
            Ok(())
        })
    }

    pub fn on_new_connection_in_use(&self, handle: CallLegHandle, transaction: TransactionHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "on_new_connection_in_use", |ctx| {
            let handle = ctx.handle();
            ctx.emit(CallLegEvent::NewConnectionInUse { handle, transaction });
            Ok(())
        })
    }

    pub fn on_auth_credentials_required(&self, handle: CallLegHandle, transaction: TransactionHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "on_auth_credentials_required", |ctx| {
            let handle = ctx.handle();
            ctx.emit(CallLegEvent::AuthCredentialsRequired { handle, transaction });
            Ok(())
        })
    }

    /// An engine timer fired
    ///
    /// The refresh alert is delivered after an automatic refresh has already
    /// gone out, so a handler that refreshes on its own only does so when
    /// automatic refresh is off.
    pub fn on_timer_expired(&self, handle: CallLegHandle, kind: TimerKind) -> CallLegResult<()> {
        self.with_call_leg(handle, "on_timer_expired", |ctx| {
            if !ctx.leg.armed_timers.remove(&kind) {
                debug!("{}: stale {:?} timer", ctx.handle(), kind);
                return Ok(());
            }
            match kind {
                TimerKind::Forked1xx => {
                    if ctx.leg.is_fork() && ctx.leg.state.is_early_outgoing() {
                        info!("{}: no final response on the fork, terminating", ctx.handle());
                        ctx.terminate(StateChangeReason::Forked1xxTimeout);
                    }
                }
                TimerKind::SessionRefresh => {
                    let handle = ctx.handle();
                    ctx.emit(CallLegEvent::SessionTimerRefreshAlert { handle });
                    let auto = ctx.leg.session_timer.as_ref().is_some_and(|st| st.auto_refresh());
                    if auto {
                        if let Err(e) = super::session_timer_operations::refresh(ctx, None) {
                            warn!("{}: automatic session refresh failed: {}", handle, e);
                        }
                    }
                }
                TimerKind::SessionExpiry => {
                    warn!("{}: session expired without refresh", ctx.handle());
                    if ctx.leg.state.is_established() {
                        if let Err(e) = send_bye(ctx, StateChangeReason::SessionExpired) {
                            debug!("{}: BYE on expiry failed: {}", ctx.handle(), e);
                        }
                    } else {
                        ctx.terminate(StateChangeReason::SessionExpired);
                    }
                }
            }
            Ok(())
        })
    }

    pub(crate) fn run_follow_up(&self, follow_up: FollowUp) {
        let result = match &follow_up {
            FollowUp::ForkResponse {
                fork,
                transaction,
                response,
                created,
            } => self.with_call_leg(*fork, "fork_response", |ctx| {
                on_fork_response(ctx, *transaction, response, *created)
            }),
            FollowUp::TerminateFork(fork) => self.with_call_leg(*fork, "terminate_fork", |ctx| {
                if ctx.leg.state.is_early_outgoing() {
                    ctx.terminate(StateChangeReason::RemoteRejected);
                }
                Ok(())
            }),
        };
        if let Err(e) = result {
            self.follow_up_failed(&follow_up, e);
        }
    }
}

fn in_dialog_request(ctx: &mut OpCtx<'_>, tx: TransactionHandle, request: RequestInfo) -> CallLegResult<()> {
    if ctx.leg.state.is_terminated() {
        if request.method != Method::Ack {
            ctx.respond_status(tx, 481);
        }
        return Ok(());
    }

    match request.method {
        Method::Ack => return on_ack(ctx, &request),
        Method::Cancel => return on_cancel(ctx, tx),
        _ => {}
    }

    if let Some(remote) = ctx.leg.remote_cseq {
        if request.cseq < remote {
            warn!("{}: CSeq {} is below {}, answering 500", ctx.handle(), request.cseq, remote);
            ctx.respond_status(tx, 500);
            return Ok(());
        }
    }
    ctx.leg.remote_cseq = Some(request.cseq);

    match request.method.clone() {
        Method::Invite => on_reinvite(ctx, tx, request),
        Method::Bye => on_bye(ctx, tx),
        Method::Prack => on_prack(ctx, tx, &request),
        _ => on_general_request(ctx, tx, request),
    }
}

fn on_reinvite(ctx: &mut OpCtx<'_>, tx: TransactionHandle, request: RequestInfo) -> CallLegResult<()> {
    if ctx.leg.reinvite_in_progress().is_some() || ctx.leg.active_transaction.is_some() {
        ctx.respond_status(tx, 491);
        return Ok(());
    }
    if !ctx.policy().may_accept_reinvite(ctx.leg.state) {
        ctx.respond_status(tx, 500);
        return Ok(());
    }

    let verdict = ctx
        .leg
        .session_timer
        .as_mut()
        .map(|st| st.on_request(&request.session_timer, None));
    if let Some(RequestVerdict::TooSmall { min_se }) = verdict {
        let mut response = ctx.response(422);
        response.session_timer = SessionTimerNegotiator::too_small_headers(min_se);
        return ctx.respond(tx, response);
    }

    if !ctx.policy().keeps_completed_records() {
        super::reinvite_operations::discard_completed_reinvites(ctx.leg);
    }
    let invite = match ctx.leg.add_reinvite() {
        Ok(invite) => invite,
        Err(e) => {
            ctx.respond_status(tx, 500);
            return Err(e);
        }
    };
    if let Some(record) = ctx.leg.invite_mut(invite) {
        record.transaction = Some(tx);
        record.cseq = Some(request.cseq);
        record.remote_100rel = request.rel100;
    }
    ctx.leg.active_transaction = Some(tx);
    ctx.leg.prack = PrackStateMachine::new();
    if let Some(contact) = request.contact {
        ctx.leg.remote_contact = Some(contact);
    }

    let handle = ctx.handle();
    ctx.emit(CallLegEvent::ReInviteCreated { handle, invite });
    ctx.set_modify_state(invite, ModifyState::ReinviteRcvd, StateChangeReason::RemoteInviting);
    Ok(())
}

fn on_ack(ctx: &mut OpCtx<'_>, request: &RequestInfo) -> CallLegResult<()> {
    let invite = ctx.leg.invite_handles().into_iter().find(|h| {
        ctx.leg
            .invite(*h)
            .is_some_and(|r| r.cseq == Some(request.cseq) && r.state() != ModifyState::AckRcvd)
    });
    let Some(invite) = invite else {
        debug!("{}: ACK {} matches no INVITE", ctx.handle(), request.cseq);
        return Ok(());
    };
    let (is_initial, tx) = match ctx.leg.invite(invite) {
        Some(record) => (record.is_initial(), record.transaction()),
        None => return Ok(()),
    };
    if tx.is_some() && ctx.leg.active_transaction == tx {
        ctx.leg.active_transaction = None;
    }
    if let Some(contact) = request.contact.clone() {
        ctx.leg.remote_contact = Some(contact);
    }

    ctx.set_modify_state(invite, ModifyState::AckRcvd, StateChangeReason::RemoteAckReceived);
    if is_initial || (ctx.policy().ack_covers_reinvite() && ctx.leg.state == CallLegState::Accepted) {
        ctx.set_state(CallLegState::Connected, StateChangeReason::RemoteAckReceived);
    }
    Ok(())
}

fn on_cancel(ctx: &mut OpCtx<'_>, tx: TransactionHandle) -> CallLegResult<()> {
    if ctx.leg.state == CallLegState::Offering {
        ctx.respond_status(tx, 200);
        ctx.set_state(CallLegState::Cancelled, StateChangeReason::RemoteCancelled);
        return Ok(());
    }
    if let Some((invite, ModifyState::ReinviteRcvd)) = ctx.view().active_reinvite {
        ctx.respond_status(tx, 200);
        ctx.set_modify_state(invite, ModifyState::ReinviteCancelled, StateChangeReason::RemoteCancelled);
        return Ok(());
    }
    debug!("{}: CANCEL with nothing to cancel in {}", ctx.handle(), ctx.leg.state);
    ctx.respond_status(tx, 481);
    Ok(())
}

fn on_bye(ctx: &mut OpCtx<'_>, tx: TransactionHandle) -> CallLegResult<()> {
    let handle = ctx.handle();
    if ctx.config().manual_bye {
        ctx.leg.incoming_bye = Some(tx);
        ctx.emit(CallLegEvent::ByeCreated { handle, transaction: tx });
        return Ok(());
    }

    // an INVITE still waiting for its answer is ended with 487
    if ctx.leg.state == CallLegState::Offering {
        if let Some(invite_tx) = ctx.leg.active_transaction.take() {
            ctx.respond_status(invite_tx, 487);
        }
    }
    ctx.respond_status(tx, 200);
    ctx.emit(CallLegEvent::ByeCreated { handle, transaction: tx });
    ctx.set_state(CallLegState::Disconnected, StateChangeReason::RemoteDisconnected);
    ctx.terminate(StateChangeReason::RemoteDisconnected);
    Ok(())
}

fn on_prack(ctx: &mut OpCtx<'_>, tx: TransactionHandle, request: &RequestInfo) -> CallLegResult<()> {
    let matched = match request.rack.as_ref() {
        Some(rack) => ctx.with_prack(|prack| prack.on_prack_received(tx, rack)),
        None => false,
    };
    if !matched {
        debug!("{}: PRACK on {} does not match a reliable provisional", ctx.handle(), tx);
        ctx.respond_status(tx, 481);
        return Ok(());
    }
    if !ctx.config().manual_prack {
        ctx.respond_status(tx, 200);
        ctx.with_prack(|prack| prack.on_prack_response_sent(200));
    }
    Ok(())
}

fn on_general_request(ctx: &mut OpCtx<'_>, tx: TransactionHandle, request: RequestInfo) -> CallLegResult<()> {
    if request.method == Method::Update {
        let verdict = ctx
            .leg
            .session_timer
            .as_mut()
            .map(|st| st.on_request(&request.session_timer, None));
        if let Some(RequestVerdict::TooSmall { min_se }) = verdict {
            let mut response = ctx.response(422);
            response.session_timer = SessionTimerNegotiator::too_small_headers(min_se);
            return ctx.respond(tx, response);
        }
    }

    let method = request.method.clone();
    ctx.leg.general.insert(
        tx,
        GeneralTransaction {
            method: request.method,
            incoming: true,
            session_override: None,
            credentials: request.authorization,
            session_timer: request.session_timer,
        },
    );
    let handle = ctx.handle();
    ctx.emit(CallLegEvent::TransactionCreated {
        handle,
        transaction: tx,
        method,
    });
    Ok(())
}

fn on_invite_response(ctx: &mut OpCtx<'_>, tx: TransactionHandle, response: ResponseInfo) -> CallLegResult<()> {
    let Some(invite) = ctx.leg.invite_by_transaction(tx) else {
        debug!("{}: INVITE response on unknown {}", ctx.handle(), tx);
        return Ok(());
    };
    if ctx.leg.invite(invite).is_some_and(|r| !r.is_initial()) {
        return on_reinvite_response(ctx, invite, tx, &response);
    }
    match route_fork(ctx, tx, response)? {
        Some(response) => on_initial_response(ctx, tx, &response),
        None => Ok(()),
    }
}

/// Hand the response to a fork when its to-tag asks for it
fn route_fork(ctx: &mut OpCtx<'_>, tx: TransactionHandle, response: ResponseInfo) -> CallLegResult<Option<ResponseInfo>> {
    if !(101..300).contains(&response.status) || ctx.leg.is_fork() || ctx.leg.direction != Direction::Outgoing {
        return Ok(Some(response));
    }

    let route = forking::route_response(
        &ctx.leg.fork,
        ctx.leg.forking_enabled,
        ctx.leg.remote_tag(),
        response.to_tag.as_deref(),
    );
    match route {
        ForkRoute::Original => Ok(Some(response)),
        ForkRoute::UpdateRemoteTag => {
            let early = matches!(
                ctx.leg.state,
                CallLegState::Inviting | CallLegState::Proceeding | CallLegState::ProceedingTimeout | CallLegState::Cancelling
            );
            if !early {
                debug!("{}: ignoring {} from another branch", ctx.handle(), response.status);
                return Ok(None);
            }
            if let Some(tag) = response.to_tag.as_deref() {
                if ctx.leg.remote_tag().is_some() {
                    // the early dialog moves to the new branch
                    ctx.leg.route_set.clear();
                }
                ctx.leg.set_remote_tag(tag);
            }
            Ok(Some(response))
        }
        ForkRoute::NewFork => {
            let to_tag = response.to_tag.clone().unwrap_or_default();
            let manager = ctx.manager;
            let original: &CallLeg = &*ctx.leg;
            let fork = manager.insert_call_leg(|h| CallLeg::fork_from(original, h, &to_tag))?;
            info!("{}: response with to-tag {} created {}", ctx.handle(), to_tag, fork);
            ctx.leg.fork.add_fork(to_tag, fork);
            ctx.follow_up(FollowUp::ForkResponse {
                fork,
                transaction: tx,
                response,
                created: true,
            });
            Ok(None)
        }
        ForkRoute::ExistingFork(fork) => {
            ctx.follow_up(FollowUp::ForkResponse {
                fork,
                transaction: tx,
                response,
                created: false,
            });
            Ok(None)
        }
    }
}

fn on_fork_response(
    ctx: &mut OpCtx<'_>,
    tx: TransactionHandle,
    response: &ResponseInfo,
    created: bool,
) -> CallLegResult<()> {
    if ctx.leg.state.is_terminated() {
        return Ok(());
    }
    if created {
        let handle = ctx.handle();
        let original = ctx.leg.original();
        if let Some(record) = ctx.leg.initial_record_mut() {
            record.transaction = Some(tx);
        }
        ctx.emit(CallLegEvent::ForkedCallLegCreated { handle, original });
        if response.is_provisional() {
            let timeout = ctx.config().forked_1xx_timeout;
            ctx.start_timer(TimerKind::Forked1xx, timeout);
        }
    }
    on_initial_response(ctx, tx, response)
}

fn on_initial_response(ctx: &mut OpCtx<'_>, tx: TransactionHandle, response: &ResponseInfo) -> CallLegResult<()> {
    match response.status {
        100..=199 => on_initial_provisional(ctx, tx, response),
        200..=299 => on_initial_success(ctx, response),
        _ => on_initial_failure(ctx, response),
    }
}

/// Reliable provisional bookkeeping shared by INVITE and re-INVITE; false drops the response
fn accept_provisional(ctx: &mut OpCtx<'_>, response: &ResponseInfo) -> bool {
    let (Some(rseq), true) = (response.rseq, response.is_reliable_provisional()) else {
        return true;
    };
    let cseq = response.cseq;
    match ctx.with_prack(|prack| prack.on_reliable_provisional(rseq, cseq)) {
        ProvisionalOrder::New => true,
        order => {
            debug!("{}: dropping {:?} reliable provisional RSeq {}", ctx.handle(), order, rseq);
            false
        }
    }
}

fn auto_prack(ctx: &mut OpCtx<'_>, response: &ResponseInfo) {
    if response.is_reliable_provisional() && !ctx.config().manual_prack {
        if let Err(e) = super::prack_operations::send_prack_on(ctx) {
            warn!("{}: automatic PRACK failed: {}", ctx.handle(), e);
        }
    }
}

fn on_initial_provisional(ctx: &mut OpCtx<'_>, tx: TransactionHandle, response: &ResponseInfo) -> CallLegResult<()> {
    if response.to_tag.is_some() {
        ctx.leg.learn_route(&response.record_route, response.contact.as_ref());
    }
    if !accept_provisional(ctx, response) {
        return Ok(());
    }
    if matches!(ctx.leg.state, CallLegState::Inviting | CallLegState::ProceedingTimeout) {
        ctx.set_state(CallLegState::Proceeding, StateChangeReason::RemoteProvisional);
    }

    let handle = ctx.handle();
    ctx.emit(CallLegEvent::ProvisionalResponseReceived {
        handle,
        transaction: Some(tx),
        status: response.status,
        reliable: response.is_reliable_provisional(),
    });
    auto_prack(ctx, response);

    if ctx.leg.pending_state == Some(CallLegState::Cancelling) {
        info!("{}: sending the deferred CANCEL", handle);
        if let Err(e) = cancel_initial(ctx) {
            warn!("{}: deferred CANCEL failed: {}", handle, e);
        }
    }
    Ok(())
}

fn on_initial_success(ctx: &mut OpCtx<'_>, response: &ResponseInfo) -> CallLegResult<()> {
    let handle = ctx.handle();
    let acked = ctx.leg.initial_record().is_some_and(|r| r.ack_sent);
    if acked {
        // retransmitted 2xx, the ACK got lost
        let cseq = ctx.leg.initial_record().and_then(|r| r.cseq);
        if let Some(cseq) = cseq {
            if let Err(e) = ctx.send_ack(cseq) {
                debug!("{}: ACK retransmission failed: {}", handle, e);
            }
        }
        return Ok(());
    }
    if ctx.leg.state.is_established() {
        debug!("{}: 2xx retransmission while waiting for the ACK", handle);
        return Ok(());
    }

    if ctx.leg.remote_tag().is_none() {
        if let Some(tag) = response.to_tag.as_deref() {
            ctx.leg.set_remote_tag(tag);
        }
    }
    ctx.leg.learn_route(&response.record_route, response.contact.as_ref());

    let negotiation = ctx
        .leg
        .session_timer
        .as_mut()
        .map(|st| st.on_success_response(&response.session_timer, None));
    if let Some((negotiated, fault)) = negotiation {
        if let Some(fault) = fault {
            ctx.emit(CallLegEvent::SessionTimerNegotiationFault { handle, fault });
        }
        if negotiated.is_some() {
            ctx.schedule_session_timer();
        }
    }

    ctx.leg.prack.on_invite_completed();
    ctx.cancel_timer(TimerKind::Forked1xx);
    ctx.leg.active_transaction = None;

    let cancelling = ctx.leg.state == CallLegState::Cancelling
        || ctx.leg.pending_state == Some(CallLegState::Cancelling);
    ctx.leg.pending_state = None;
    ctx.set_state(CallLegState::RemoteAccepted, StateChangeReason::RemoteAccepted);

    if cancelling {
        // the CANCEL lost the race against the 2xx
        info!("{}: 2xx after CANCEL, sending BYE", handle);
        return send_bye(ctx, StateChangeReason::LocalDisconnecting);
    }
    if !ctx.config().manual_ack {
        ack_initial(ctx)?;
        ctx.set_state(CallLegState::Connected, StateChangeReason::LocalAckSent);
    }
    Ok(())
}

fn on_initial_failure(ctx: &mut OpCtx<'_>, response: &ResponseInfo) -> CallLegResult<()> {
    let handle = ctx.handle();
    let status = response.status;
    ctx.leg.active_transaction = None;
    ctx.leg.prack.on_invite_completed();
    ctx.cancel_timer(TimerKind::Forked1xx);
    for fork in ctx.leg.fork.forks() {
        ctx.follow_up(FollowUp::TerminateFork(fork));
    }
    let cancelling = ctx.leg.state == CallLegState::Cancelling;

    match status {
        300..=399 if !cancelling && response.contact.is_some() => {
            ctx.leg.remote_contact = response.contact.clone();
            clear_early_dialog(ctx.leg);
            ctx.set_state(CallLegState::Redirected, StateChangeReason::RemoteRedirected);
        }
        401 | 407 if !cancelling && !response.challenges.is_empty() => {
            ctx.leg.auth.update(&response.challenges);
            clear_early_dialog(ctx.leg);
            ctx.set_state(CallLegState::Unauthenticated, StateChangeReason::AuthNeeded);
        }
        422 if !cancelling && ctx.leg.session_timer.is_some() => {
            let fault = ctx
                .leg
                .session_timer
                .as_mut()
                .map(|st| st.on_too_small(&response.session_timer));
            if let Some(fault) = fault {
                ctx.emit(CallLegEvent::SessionTimerNegotiationFault { handle, fault });
            }
            clear_early_dialog(ctx.leg);
            let authenticate = !ctx.leg.auth.is_empty();
            match send_initial_invite(ctx, authenticate) {
                Ok(_) => ctx.set_state(CallLegState::Inviting, StateChangeReason::LocalInviting),
                Err(e) => {
                    warn!("{}: INVITE retry after 422 failed: {}", handle, e);
                    ctx.terminate(StateChangeReason::LocalFailure);
                }
            }
        }
        _ => {
            let reason = match status {
                487 if cancelling => StateChangeReason::LocalCancelled,
                408 => StateChangeReason::Timeout,
                503 => StateChangeReason::ServiceUnavailable,
                _ => StateChangeReason::RemoteRejected,
            };
            ctx.set_state(CallLegState::Disconnected, reason);
            ctx.terminate(reason);
        }
    }
    Ok(())
}

/// Forget the early dialog before the INVITE is sent again
fn clear_early_dialog(leg: &mut CallLeg) {
    if let Some(to) = leg.to.as_mut() {
        to.tag = None;
    }
    leg.route_set.clear();
}

fn on_reinvite_response(
    ctx: &mut OpCtx<'_>,
    invite: InviteHandle,
    tx: TransactionHandle,
    response: &ResponseInfo,
) -> CallLegResult<()> {
    let handle = ctx.handle();
    let Some((modify, ack_sent, session_override)) = ctx
        .leg
        .invite(invite)
        .map(|r| (r.state(), r.ack_sent, r.session_override))
    else {
        return Ok(());
    };

    match response.status {
        100..=199 => {
            if !accept_provisional(ctx, response) {
                return Ok(());
            }
            if matches!(modify, ModifyState::ReinviteSent | ModifyState::ReinviteProceedingTimeout) {
                ctx.set_modify_state(invite, ModifyState::ReinviteProceeding, StateChangeReason::RemoteProvisional);
            }
            ctx.emit(CallLegEvent::ProvisionalResponseReceived {
                handle,
                transaction: Some(tx),
                status: response.status,
                reliable: response.is_reliable_provisional(),
            });
            auto_prack(ctx, response);
        }
        200..=299 => {
            if ack_sent {
                if let Err(e) = ack_reinvite(ctx, invite) {
                    debug!("{}: re-INVITE ACK retransmission failed: {}", handle, e);
                }
                return Ok(());
            }
            if modify == ModifyState::ReinviteRemoteAccepted {
                return Ok(());
            }

            let negotiation = ctx
                .leg
                .session_timer
                .as_mut()
                .map(|st| st.on_success_response(&response.session_timer, session_override.as_ref()));
            if let Some((negotiated, fault)) = negotiation {
                if let Some(fault) = fault {
                    ctx.emit(CallLegEvent::SessionTimerNegotiationFault { handle, fault });
                }
                if negotiated.is_some() {
                    ctx.schedule_session_timer();
                }
            }
            if let Some(contact) = response.contact.clone() {
                ctx.leg.remote_contact = Some(contact);
            }
            ctx.leg.active_transaction = None;
            ctx.leg.prack.on_invite_completed();

            let was_cancelling = modify == ModifyState::ReinviteCancelling;
            ctx.set_modify_state(invite, ModifyState::ReinviteRemoteAccepted, StateChangeReason::RemoteAccepted);
            if ctx.policy().ack_covers_reinvite() {
                ctx.set_state(CallLegState::RemoteAccepted, StateChangeReason::RemoteAccepted);
            }
            if !ctx.config().manual_ack || was_cancelling {
                ack_reinvite(ctx, invite)?;
            }
        }
        status => {
            ctx.leg.active_transaction = None;
            ctx.leg.prack.on_invite_completed();
            if status == 422 {
                let fault = ctx
                    .leg
                    .session_timer
                    .as_mut()
                    .map(|st| st.on_too_small(&response.session_timer));
                if let Some(fault) = fault {
                    ctx.emit(CallLegEvent::SessionTimerNegotiationFault { handle, fault });
                }
            }
            if matches!(status, 401 | 407) {
                ctx.leg.auth.update(&response.challenges);
            }

            let reason = if status == 487 && modify == ModifyState::ReinviteCancelling {
                StateChangeReason::LocalCancelled
            } else {
                StateChangeReason::RemoteRejected
            };
            ctx.set_modify_state(invite, ModifyState::Idle, reason);

            // RFC 3261 14.1: the dialog is gone
            if matches!(status, 408 | 481) {
                info!("{}: re-INVITE answered {}, ending the dialog", handle, status);
                send_bye(ctx, StateChangeReason::RemoteDisconnected)?;
            }
        }
    }
    Ok(())
}

fn on_bye_response(ctx: &mut OpCtx<'_>, tx: TransactionHandle, response: &ResponseInfo) -> CallLegResult<()> {
    if ctx.leg.bye_transaction != Some(tx) || response.is_provisional() {
        return Ok(());
    }
    ctx.leg.bye_transaction = None;
    if !response.is_success() {
        debug!("{}: BYE answered {}, terminating anyway", ctx.handle(), response.status);
    }
    ctx.set_state(CallLegState::Disconnected, StateChangeReason::LocalDisconnected);
    ctx.terminate(StateChangeReason::LocalDisconnected);
    Ok(())
}

fn on_general_response(ctx: &mut OpCtx<'_>, tx: TransactionHandle, response: &ResponseInfo) -> CallLegResult<()> {
    let outgoing = ctx.leg.general.get(&tx).is_some_and(|g| !g.incoming);
    if !outgoing {
        debug!("{}: {} response on unknown {}", ctx.handle(), response.method, tx);
        return Ok(());
    }
    if response.is_provisional() {
        return Ok(());
    }
    let Some(general) = ctx.leg.general.remove(&tx) else {
        return Ok(());
    };

    let handle = ctx.handle();
    if general.method == Method::Update {
        match response.status {
            200..=299 => {
                let negotiation = ctx
                    .leg
                    .session_timer
                    .as_mut()
                    .map(|st| st.on_success_response(&response.session_timer, general.session_override.as_ref()));
                if let Some((negotiated, fault)) = negotiation {
                    if let Some(fault) = fault {
                        ctx.emit(CallLegEvent::SessionTimerNegotiationFault { handle, fault });
                    }
                    if negotiated.is_some() {
                        ctx.schedule_session_timer();
                    }
                }
            }
            422 => {
                let fault = ctx
                    .leg
                    .session_timer
                    .as_mut()
                    .map(|st| st.on_too_small(&response.session_timer));
                if let Some(fault) = fault {
                    ctx.emit(CallLegEvent::SessionTimerNegotiationFault { handle, fault });
                }
            }
            _ => {}
        }
    }
    if matches!(response.status, 401 | 407) {
        ctx.leg.auth.update(&response.challenges);
    }

    ctx.emit(CallLegEvent::GeneralResponseReceived {
        handle,
        transaction: tx,
        status: response.status,
    });
    Ok(())
}
