//! Legality of application operations
//!
//! Whether an operation is allowed depends on the call-leg state, the state
//! of the INVITE record bound to the active transaction, the PRACK state and
//! the fork relation together. [`LegalityView`] captures that tuple once and
//! every predicate here is a plain function over it. Predicates never mutate;
//! they return the record the operation applies to or `IllegalAction`.

use super::call_leg::CallLeg;
use super::state::CallLegState;
use crate::arena::InviteHandle;
use crate::errors::{CallLegError, CallLegResult};
use crate::invite::{InvitePolicy, ModifyState};
use crate::prack::PrackState;

/// Which INVITE an operation applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InviteTarget {
    Initial,
    ReInvite(InviteHandle),
}

/// State tuple the predicates work on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LegalityView {
    pub state: CallLegState,
    /// Re-INVITE record bound to the active transaction
    pub active_reinvite: Option<(InviteHandle, ModifyState)>,
    /// Any re-INVITE record with an open exchange
    pub reinvite_in_progress: Option<(InviteHandle, ModifyState)>,
    pub has_active_transaction: bool,
    pub is_fork: bool,
    pub has_refer_subscription: bool,
    pub is_refer_call_leg: bool,
    pub prack: PrackState,
}

impl LegalityView {
    pub fn of(leg: &CallLeg) -> Self {
        let active_reinvite = leg
            .active_transaction
            .and_then(|tx| leg.invite_by_transaction(tx))
            .and_then(|h| leg.invite(h).filter(|r| !r.is_initial()).map(|r| (h, r.state())));
        let reinvite_in_progress = leg
            .reinvite_in_progress()
            .and_then(|h| leg.invite(h).map(|r| (h, r.state())));
        Self {
            state: leg.state,
            active_reinvite,
            reinvite_in_progress,
            has_active_transaction: leg.active_transaction.is_some(),
            is_fork: leg.is_fork(),
            has_refer_subscription: leg.refer_subscription.is_some(),
            is_refer_call_leg: leg.is_refer_call_leg,
            prack: leg.prack.state(),
        }
    }

    fn illegal(&self, operation: &'static str) -> CallLegError {
        CallLegError::illegal_action(operation, self.state)
    }
}

/// `connect`: Idle or Redirected, no REFER in the way
pub(crate) fn connect(view: &LegalityView) -> CallLegResult<()> {
    let state_ok = matches!(view.state, CallLegState::Idle | CallLegState::Redirected);
    if !state_ok || view.has_refer_subscription || view.is_refer_call_leg {
        return Err(view.illegal("connect"));
    }
    Ok(())
}

/// `refer_connect`: a refer call-leg that has not been connected yet
pub(crate) fn refer_connect(view: &LegalityView) -> CallLegResult<()> {
    if view.state != CallLegState::Idle || !view.is_refer_call_leg {
        return Err(view.illegal("refer_connect"));
    }
    Ok(())
}

/// `authenticate`: the initial INVITE was challenged
pub(crate) fn authenticate(view: &LegalityView) -> CallLegResult<()> {
    if view.state != CallLegState::Unauthenticated {
        return Err(view.illegal("authenticate"));
    }
    Ok(())
}

pub(crate) fn accept(view: &LegalityView, policy: &InvitePolicy) -> CallLegResult<InviteTarget> {
    if view.state == CallLegState::Offering {
        return Ok(InviteTarget::Initial);
    }
    match view.active_reinvite {
        Some((h, ModifyState::ReinviteRcvd)) if policy.may_accept_reinvite(view.state) => {
            Ok(InviteTarget::ReInvite(h))
        }
        _ => Err(view.illegal("accept")),
    }
}

/// Status range is checked by the caller before this
pub(crate) fn reject(view: &LegalityView) -> CallLegResult<InviteTarget> {
    if matches!(view.state, CallLegState::Offering | CallLegState::Cancelled) {
        return Ok(InviteTarget::Initial);
    }
    match view.active_reinvite {
        Some((h, modify)) if view.state.is_established() && modify.is_received_or_cancelled() => {
            Ok(InviteTarget::ReInvite(h))
        }
        _ => Err(view.illegal("reject")),
    }
}

pub(crate) fn provisional(view: &LegalityView) -> CallLegResult<InviteTarget> {
    if view.state == CallLegState::Offering {
        return Ok(InviteTarget::Initial);
    }
    match view.active_reinvite {
        Some((h, ModifyState::ReinviteRcvd)) if view.state.is_established() => Ok(InviteTarget::ReInvite(h)),
        _ => Err(view.illegal("provisional_response")),
    }
}

/// `ack` on the call-leg; in legacy mode it also covers re-INVITEs
pub(crate) fn ack(view: &LegalityView, policy: &InvitePolicy, manual_ack: bool) -> CallLegResult<InviteTarget> {
    if !manual_ack || !policy.may_ack(view.state) {
        return Err(view.illegal("ack"));
    }
    if policy.ack_covers_reinvite() {
        if let Some((h, ModifyState::ReinviteRemoteAccepted)) = view.reinvite_in_progress {
            return Ok(InviteTarget::ReInvite(h));
        }
    }
    if view.state == CallLegState::RemoteAccepted {
        Ok(InviteTarget::Initial)
    } else {
        Err(view.illegal("ack"))
    }
}

/// `cancel`: only the original may cancel the initial INVITE
pub(crate) fn cancel(view: &LegalityView) -> CallLegResult<InviteTarget> {
    let initial_proceeding = matches!(
        view.state,
        CallLegState::Proceeding | CallLegState::ProceedingTimeout
    );
    if initial_proceeding && !view.is_fork && view.has_active_transaction {
        return Ok(InviteTarget::Initial);
    }
    match view.reinvite_in_progress {
        Some((h, modify)) if modify.is_proceeding() => Ok(InviteTarget::ReInvite(h)),
        _ => Err(view.illegal("cancel")),
    }
}

pub(crate) fn reinvite_create(view: &LegalityView, policy: &InvitePolicy) -> CallLegResult<()> {
    if !policy.may_create_reinvite(view.state) || view.reinvite_in_progress.is_some() {
        return Err(view.illegal("reinvite_create"));
    }
    Ok(())
}

pub(crate) fn reinvite_request(
    view: &LegalityView,
    policy: &InvitePolicy,
    record: ModifyState,
) -> CallLegResult<()> {
    if record != ModifyState::Idle
        || view.has_active_transaction
        || view.reinvite_in_progress.is_some()
        || !policy.may_create_reinvite(view.state)
    {
        return Err(CallLegError::illegal_action("reinvite_request", (view.state, record)));
    }
    Ok(())
}

pub(crate) fn reinvite_ack(view: &LegalityView, record: ModifyState) -> CallLegResult<()> {
    if record != ModifyState::ReinviteRemoteAccepted {
        return Err(CallLegError::illegal_action("reinvite_ack", (view.state, record)));
    }
    Ok(())
}

pub(crate) fn send_prack(view: &LegalityView) -> CallLegResult<()> {
    match view.prack {
        PrackState::RelProvResponseRcvd | PrackState::PrackFinalResponseRcvd => Ok(()),
        other => Err(CallLegError::illegal_action("send_prack", other)),
    }
}

pub(crate) fn send_prack_response(view: &LegalityView) -> CallLegResult<()> {
    match view.prack {
        PrackState::PrackRcvd => Ok(()),
        other => Err(CallLegError::illegal_action("send_prack_response", other)),
    }
}

/// Whether the 100rel status of the pending offer means anything
pub(crate) fn offer_pending(view: &LegalityView) -> Option<InviteTarget> {
    if view.state == CallLegState::Offering {
        return Some(InviteTarget::Initial);
    }
    match view.active_reinvite {
        Some((h, ModifyState::ReinviteRcvd)) => Some(InviteTarget::ReInvite(h)),
        _ => None,
    }
}

/// HA store: a settled Connected call-leg
pub(crate) fn store(view: &LegalityView) -> CallLegResult<()> {
    if view.state != CallLegState::Connected || view.has_active_transaction {
        return Err(view.illegal("store_connected"));
    }
    Ok(())
}

/// Identity setters are only meaningful before the first request
pub(crate) fn modify_identity(view: &LegalityView, operation: &'static str) -> CallLegResult<()> {
    if view.state != CallLegState::Idle {
        return Err(view.illegal(operation));
    }
    Ok(())
}

/// Any transition out of Terminated is refused
pub(crate) fn not_terminated(view: &LegalityView, operation: &'static str) -> CallLegResult<()> {
    if view.state.is_terminated() {
        return Err(view.illegal(operation));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::invite::InviteHandlingMode;

    fn invite_handle() -> InviteHandle {
        let mut arena = Arena::new();
        InviteHandle(arena.insert(()).unwrap())
    }

    fn view(state: CallLegState) -> LegalityView {
        LegalityView {
            state,
            active_reinvite: None,
            reinvite_in_progress: None,
            has_active_transaction: false,
            is_fork: false,
            has_refer_subscription: false,
            is_refer_call_leg: false,
            prack: PrackState::Idle,
        }
    }

    const ALL_STATES: [CallLegState; 16] = [
        CallLegState::Idle,
        CallLegState::Inviting,
        CallLegState::Redirected,
        CallLegState::Unauthenticated,
        CallLegState::Proceeding,
        CallLegState::ProceedingTimeout,
        CallLegState::Cancelling,
        CallLegState::Offering,
        CallLegState::Accepted,
        CallLegState::RemoteAccepted,
        CallLegState::Connected,
        CallLegState::Disconnecting,
        CallLegState::Disconnected,
        CallLegState::Cancelled,
        CallLegState::MsgSendFailure,
        CallLegState::Terminated,
    ];

    #[test]
    fn test_connect_only_from_idle_or_redirected() {
        for state in ALL_STATES {
            let allowed = connect(&view(state)).is_ok();
            assert_eq!(
                allowed,
                matches!(state, CallLegState::Idle | CallLegState::Redirected),
                "{state}"
            );
        }

        let mut v = view(CallLegState::Idle);
        v.has_refer_subscription = true;
        assert!(connect(&v).is_err());

        let mut v = view(CallLegState::Idle);
        v.is_refer_call_leg = true;
        assert!(connect(&v).is_err());
        assert!(refer_connect(&v).is_ok());
    }

    #[test]
    fn test_accept_reinvite_depends_on_mode() {
        let h = invite_handle();
        let current = InvitePolicy::new(InviteHandlingMode::Current);
        let legacy = InvitePolicy::new(InviteHandlingMode::Legacy);

        let mut v = view(CallLegState::Accepted);
        v.active_reinvite = Some((h, ModifyState::ReinviteRcvd));
        assert_eq!(accept(&v, &current).unwrap(), InviteTarget::ReInvite(h));
        assert!(accept(&v, &legacy).is_err());

        v.state = CallLegState::Connected;
        assert_eq!(accept(&v, &legacy).unwrap(), InviteTarget::ReInvite(h));

        assert_eq!(accept(&view(CallLegState::Offering), &legacy).unwrap(), InviteTarget::Initial);
        assert!(accept(&view(CallLegState::Connected), &current).is_err());
    }

    #[test]
    fn test_reject_requires_received_reinvite() {
        let h = invite_handle();
        assert!(reject(&view(CallLegState::Connected)).is_err());

        let mut v = view(CallLegState::Connected);
        v.active_reinvite = Some((h, ModifyState::ReinviteCancelled));
        assert_eq!(reject(&v).unwrap(), InviteTarget::ReInvite(h));

        v.active_reinvite = Some((h, ModifyState::ReinviteAccepted));
        assert!(reject(&v).is_err());

        assert!(reject(&view(CallLegState::Cancelled)).is_ok());
    }

    #[test]
    fn test_cancel_rules() {
        let mut v = view(CallLegState::Proceeding);
        assert!(cancel(&v).is_err(), "no active transaction");

        v.has_active_transaction = true;
        assert_eq!(cancel(&v).unwrap(), InviteTarget::Initial);

        v.is_fork = true;
        assert!(cancel(&v).is_err());

        let h = invite_handle();
        let mut v = view(CallLegState::Connected);
        v.reinvite_in_progress = Some((h, ModifyState::ReinviteSent));
        assert!(cancel(&v).is_err());
        v.reinvite_in_progress = Some((h, ModifyState::ReinviteProceedingTimeout));
        assert_eq!(cancel(&v).unwrap(), InviteTarget::ReInvite(h));
    }

    #[test]
    fn test_ack_requires_manual_mode() {
        let current = InvitePolicy::new(InviteHandlingMode::Current);
        let v = view(CallLegState::RemoteAccepted);
        assert!(ack(&v, &current, false).is_err());
        assert_eq!(ack(&v, &current, true).unwrap(), InviteTarget::Initial);
        assert!(ack(&view(CallLegState::Connected), &current, true).is_err());

        let legacy = InvitePolicy::new(InviteHandlingMode::Legacy);
        let h = invite_handle();
        let mut v = view(CallLegState::Connected);
        assert!(ack(&v, &legacy, true).is_err());
        v.reinvite_in_progress = Some((h, ModifyState::ReinviteRemoteAccepted));
        assert_eq!(ack(&v, &legacy, true).unwrap(), InviteTarget::ReInvite(h));
    }

    #[test]
    fn test_reinvite_request_needs_free_call_leg() {
        let policy = InvitePolicy::new(InviteHandlingMode::Current);
        let mut v = view(CallLegState::Connected);
        assert!(reinvite_request(&v, &policy, ModifyState::Idle).is_ok());
        assert!(reinvite_request(&v, &policy, ModifyState::ReinviteSent).is_err());

        v.has_active_transaction = true;
        assert!(reinvite_request(&v, &policy, ModifyState::Idle).is_err());
        assert!(reinvite_request(&view(CallLegState::Offering), &policy, ModifyState::Idle).is_err());
    }

    #[test]
    fn test_prack_predicates() {
        let mut v = view(CallLegState::Proceeding);
        assert!(send_prack(&v).is_err());
        v.prack = PrackState::RelProvResponseRcvd;
        assert!(send_prack(&v).is_ok());
        v.prack = PrackState::PrackFinalResponseRcvd;
        assert!(send_prack(&v).is_ok());
        assert!(send_prack_response(&v).is_err());
        v.prack = PrackState::PrackRcvd;
        assert!(send_prack_response(&v).is_ok());
    }

    #[test]
    fn test_offer_pending() {
        assert_eq!(offer_pending(&view(CallLegState::Offering)), Some(InviteTarget::Initial));
        assert_eq!(offer_pending(&view(CallLegState::Connected)), None);
    }
}
