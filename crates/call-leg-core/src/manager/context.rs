//! Operation context
//!
//! [`OpCtx`] is what an operation sees while it holds a call-leg: the
//! manager, the call-leg itself and the queues of events and follow-ups that
//! are flushed once the operation is done. All state changes go through its
//! helpers so that each one is logged and reported exactly once.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::core::DialogManager;
use crate::arena::{CallLegHandle, InviteHandle};
use crate::callleg::legality::LegalityView;
use crate::callleg::{CallLeg, CallLegState, StateChangeReason};
use crate::config::CallLegMgrConfig;
use crate::errors::{CallLegError, CallLegResult};
use crate::events::CallLegEvent;
use crate::guard::GuardedOperation;
use crate::invite::{InvitePolicy, ModifyState};
use crate::message::{Method, OutgoingRequest, OutgoingResponse, ResponseInfo};
use crate::prack::PrackStateMachine;
use crate::transaction::{TimerKind, TransactionHandle, TransactionLayer};

/// Work on another call-leg, run after the current lock is released
#[derive(Debug)]
pub(crate) enum FollowUp {
    /// Process a forked response on its fork
    ForkResponse {
        fork: CallLegHandle,
        transaction: TransactionHandle,
        response: ResponseInfo,
        created: bool,
    },
    /// The original's INVITE failed; early forks go with it
    TerminateFork(CallLegHandle),
}

pub(crate) struct OpCtx<'a> {
    pub(crate) manager: &'a DialogManager,
    pub(crate) leg: &'a mut CallLeg,
    events: Vec<CallLegEvent>,
    follow_ups: Vec<FollowUp>,
}

impl<'a> OpCtx<'a> {
    pub(crate) fn new(manager: &'a DialogManager, leg: &'a mut CallLeg) -> Self {
        Self {
            manager,
            leg,
            events: Vec::new(),
            follow_ups: Vec::new(),
        }
    }

    pub(crate) fn into_parts(self) -> (Vec<CallLegEvent>, Vec<FollowUp>) {
        (self.events, self.follow_ups)
    }

    pub(crate) fn handle(&self) -> CallLegHandle {
        self.leg.handle
    }

    pub(crate) fn view(&self) -> LegalityView {
        LegalityView::of(self.leg)
    }

    pub(crate) fn config(&self) -> &'a CallLegMgrConfig {
        self.manager.config()
    }

    pub(crate) fn policy(&self) -> &'a InvitePolicy {
        self.manager.policy()
    }

    pub(crate) fn transactions(&self) -> Arc<dyn TransactionLayer> {
        self.manager.collaborators().transactions.clone()
    }

    pub(crate) fn emit(&mut self, event: CallLegEvent) {
        self.events.push(event);
    }

    pub(crate) fn follow_up(&mut self, follow_up: FollowUp) {
        self.follow_ups.push(follow_up);
    }

    /// Log a refused operation on its way out
    pub(crate) fn checked<T>(&self, result: CallLegResult<T>) -> CallLegResult<T> {
        if let Err(e) = &result {
            warn!("{}: {}", self.leg.handle, e);
        }
        result
    }

    /// Reentrancy check for destructive operations
    pub(crate) fn check_guard(&self, op: GuardedOperation) -> CallLegResult<()> {
        self.checked(self.config().reentrancy.check(op, self.leg.callbacks))
    }

    pub(crate) fn set_state(&mut self, new: CallLegState, reason: StateChangeReason) {
        let old = self.leg.state;
        if old == new {
            return;
        }
        if old.is_terminated() {
            warn!("{} is terminated, ignoring transition to {}", self.leg.handle, new);
            return;
        }
        info!("{} state {} -> {} ({:?})", self.leg.handle, old, new, reason);
        self.leg.state = new;
        if self.leg.pending_state == Some(new) {
            self.leg.pending_state = None;
        }
        if new.is_terminated() {
            self.leg.termination_reason = Some(reason);
        }
        self.emit(CallLegEvent::StateChanged {
            handle: self.leg.handle,
            old,
            new,
            reason,
        });
    }

    /// Change the state of an INVITE record; only re-INVITE records report it
    pub(crate) fn set_modify_state(&mut self, invite: InviteHandle, new: ModifyState, reason: StateChangeReason) {
        let handle = self.leg.handle;
        let Some(record) = self.leg.invite_mut(invite) else {
            debug!("{}: {} is gone", handle, invite);
            return;
        };
        let old = record.state;
        if old == new {
            return;
        }
        record.state = new;
        if record.is_initial {
            return;
        }
        info!("{} {} modify state {:?} -> {:?} ({:?})", handle, invite, old, new, reason);
        self.emit(CallLegEvent::ModifyStateChanged {
            handle,
            invite,
            old,
            new,
            reason,
        });
    }

    /// Run `f` on the PRACK machine and report a state change
    pub(crate) fn with_prack<R>(&mut self, f: impl FnOnce(&mut PrackStateMachine) -> R) -> R {
        let old = self.leg.prack.state();
        let result = f(&mut self.leg.prack);
        let new = self.leg.prack.state();
        if old != new {
            debug!("{} PRACK state {:?} -> {:?}", self.leg.handle, old, new);
            self.emit(CallLegEvent::PrackStateChanged {
                handle: self.leg.handle,
                old,
                new,
            });
        }
        result
    }

    pub(crate) fn start_timer(&mut self, kind: TimerKind, after: Duration) {
        self.leg.armed_timers.insert(kind);
        self.manager.collaborators().timers.start(self.leg.handle, kind, after);
    }

    pub(crate) fn cancel_timer(&mut self, kind: TimerKind) {
        if self.leg.armed_timers.remove(&kind) {
            self.manager.collaborators().timers.cancel(self.leg.handle, kind);
        }
    }

    fn cancel_all_timers(&mut self) {
        let armed: Vec<TimerKind> = self.leg.armed_timers.drain().collect();
        for kind in armed {
            self.manager.collaborators().timers.cancel(self.leg.handle, kind);
        }
    }

    /// Re-arm the refresh or expiry timer after a negotiation
    pub(crate) fn schedule_session_timer(&mut self) {
        self.cancel_timer(TimerKind::SessionRefresh);
        self.cancel_timer(TimerKind::SessionExpiry);
        let next = self.leg.session_timer.as_ref().and_then(|st| st.next_timer());
        if let Some((kind, after)) = next {
            debug!("{} session timer {:?} in {:?}", self.leg.handle, kind, after);
            self.start_timer(kind, after);
        }
    }

    /// Send a request on a new client transaction owned by this call-leg
    pub(crate) fn send_request(&mut self, request: OutgoingRequest) -> CallLegResult<TransactionHandle> {
        let method = request.method.clone();
        let tx = self
            .transactions()
            .send_request(self.leg.handle, request)
            .map_err(|e| {
                warn!("{}: sending {} failed: {}", self.leg.handle, method, e);
                CallLegError::from(e)
            })?;
        debug!("{} sent {} on {}", self.leg.handle, method, tx);
        Ok(tx)
    }

    /// Response template carrying the local tag and contact
    pub(crate) fn response(&self, status: u16) -> OutgoingResponse {
        let mut response =
            OutgoingResponse::new(status).with_to_tag(self.leg.local_tag().map(str::to_string));
        if status < 300 {
            response.contact = self.leg.local_contact.clone();
        }
        response
    }

    pub(crate) fn respond(&mut self, tx: TransactionHandle, response: OutgoingResponse) -> CallLegResult<()> {
        let status = response.status;
        self.transactions().respond(tx, response).map_err(|e| {
            warn!("{}: responding {} on {} failed: {}", self.leg.handle, status, tx, e);
            CallLegError::from(e)
        })?;
        debug!("{} responded {} on {}", self.leg.handle, status, tx);
        Ok(())
    }

    /// Answer with a bare status, logging instead of failing
    pub(crate) fn respond_status(&mut self, tx: TransactionHandle, status: u16) {
        let response = self.response(status);
        if let Err(e) = self.respond(tx, response) {
            debug!("{}: automatic {} not sent: {}", self.leg.handle, status, e);
        }
    }

    /// Send the ACK for the 2xx of the INVITE with `cseq`
    pub(crate) fn send_ack(&mut self, cseq: u32) -> CallLegResult<()> {
        let request = self.leg.build_request(Method::Ack, Some(cseq))?;
        self.transactions()
            .send_ack(self.leg.handle, request)
            .map_err(CallLegError::from)
    }

    /// Abnormal termination: nothing is sent, everything owned is released
    pub(crate) fn terminate(&mut self, reason: StateChangeReason) {
        if self.leg.state.is_terminated() {
            return;
        }
        let handle = self.leg.handle;

        for invite in self.leg.invite_handles() {
            let finished = self
                .leg
                .invite(invite)
                .is_some_and(|r| r.state == ModifyState::Terminated);
            if !finished {
                self.set_modify_state(invite, ModifyState::Terminated, reason);
            }
        }

        if let Some(subscription) = self.leg.refer_subscription.take() {
            match &self.manager.collaborators().subscriptions {
                Some(subscriptions) => subscriptions.terminate(subscription),
                None => debug!("{}: no subscription layer for {:?}", handle, subscription),
            }
        }

        let layer = self.transactions();
        for tx in self.leg.owned_transactions() {
            layer.terminate(tx);
        }
        self.leg.active_transaction = None;
        self.leg.bye_transaction = None;
        self.leg.incoming_bye = None;
        self.leg.cancel_transaction = None;
        self.leg.general.clear();
        self.leg.dns.clear();
        self.leg.server_auth = None;
        self.leg.pending_state = None;
        self.leg.prack.on_invite_completed();
        if let Some(st) = self.leg.session_timer.as_mut() {
            st.stop();
        }
        self.cancel_all_timers();

        self.set_state(CallLegState::Terminated, reason);
    }
}
