//! Fail-over after the transaction layer could not deliver a request

mod common;

use common::{Harness, Sent};
use rvoip_call_leg_core::dns::{DnsState, DnsTarget};
use rvoip_call_leg_core::prelude::*;
use rvoip_call_leg_core::transaction::SecurityAssociation;

fn connected(h: &Harness) -> CallLegHandle {
    let (leg, tx, _) = h.outgoing_call();
    h.manager
        .on_response_received(leg, tx, ResponseInfo::new(200, Method::Invite, 1).with_to_tag("b1"))
        .unwrap();
    leg
}

#[test]
fn test_invite_fails_over_to_next_address() {
    common::init_tracing();
    let h = Harness::new(CallLegMgrConfig::default());
    let (leg, tx, _) = h.outgoing_call();

    h.manager.on_message_send_failure(leg, tx).unwrap();
    assert_eq!(h.state(leg), CallLegState::MsgSendFailure);
    assert_eq!(h.manager.dns_state(leg, DnsTarget::CallLeg).unwrap(), DnsState::MsgSendFailure);
    assert!(h.handler.events().contains(&CallLegEvent::MessageSendFailure {
        handle: leg,
        transaction: tx,
        method: Method::Invite,
    }));

    assert_eq!(
        h.manager.dns_list(leg, DnsTarget::CallLeg).unwrap(),
        vec!["192.0.2.10:5060".to_string(), "192.0.2.11:5060".to_string()]
    );
    assert_eq!(
        h.manager.dns_resend(leg, DnsTarget::CallLeg).unwrap_err().kind(),
        ErrorKind::IllegalAction,
        "nothing cloned yet"
    );

    let clone = h.manager.dns_continue(leg, DnsTarget::CallLeg).unwrap();
    assert!(h.transactions.contains(&Sent::Cloned { from: tx, to: clone }));
    assert_eq!(h.manager.call_leg_info(leg).unwrap().active_transaction, Some(clone));

    h.manager.dns_resend(leg, DnsTarget::CallLeg).unwrap();
    assert!(h.transactions.contains(&Sent::Resent(clone)));
    assert!(h.transactions.contains(&Sent::Terminated(tx)));
    assert_eq!(h.manager.dns_state(leg, DnsTarget::CallLeg).unwrap(), DnsState::Normal);
    assert!(h.handler.events().contains(&CallLegEvent::StateChanged {
        handle: leg,
        old: CallLegState::MsgSendFailure,
        new: CallLegState::Inviting,
        reason: StateChangeReason::DnsResent,
    }));

    // the clone now carries the INVITE
    h.manager
        .on_response_received(leg, clone, ResponseInfo::new(200, Method::Invite, 1).with_to_tag("b1"))
        .unwrap();
    assert_eq!(h.state(leg), CallLegState::Connected);
}

#[test]
fn test_second_continue_drops_the_previous_clone() {
    let h = Harness::new(CallLegMgrConfig::default());
    let (leg, tx, _) = h.outgoing_call();
    h.manager.on_message_send_failure(leg, tx).unwrap();

    let first = h.manager.dns_continue(leg, DnsTarget::CallLeg).unwrap();
    let second = h.manager.dns_continue(leg, DnsTarget::CallLeg).unwrap();
    assert_ne!(first, second);
    assert!(h.transactions.contains(&Sent::Cloned { from: first, to: second }));
    assert!(h.transactions.contains(&Sent::Terminated(first)));
}

#[test]
fn test_giving_up_on_first_invite_terminates() {
    let h = Harness::keeping_terminated();
    let (leg, tx, _) = h.outgoing_call();
    h.manager.on_message_send_failure(leg, tx).unwrap();

    h.manager.dns_give_up(leg, DnsTarget::CallLeg).unwrap();
    assert!(h.transactions.contains(&Sent::Terminated(tx)));
    let info = h.manager.call_leg_info(leg).unwrap();
    assert_eq!(info.state, CallLegState::Terminated);
    assert_eq!(info.termination_reason, Some(StateChangeReason::DnsGiveUp));
}

#[test]
fn test_giving_up_on_bye_terminates() {
    let h = Harness::keeping_terminated();
    let leg = connected(&h);
    h.manager.disconnect(leg).unwrap();
    let (bye_tx, _) = h.transactions.last_request(Method::Bye).unwrap();

    h.manager.on_message_send_failure(leg, bye_tx).unwrap();
    assert_eq!(h.state(leg), CallLegState::MsgSendFailure);
    h.manager.dns_give_up(leg, DnsTarget::CallLeg).unwrap();
    assert_eq!(h.state(leg), CallLegState::Terminated);
}

#[test]
fn test_reinvite_failure_is_tracked_on_the_record() {
    let h = Harness::new(CallLegMgrConfig::default());
    let leg = connected(&h);
    let invite = h.manager.reinvite_create(leg, None).unwrap();
    h.manager.reinvite_request(leg, invite).unwrap();
    let (tx, _) = h.transactions.last_request(Method::Invite).unwrap();

    h.manager.on_message_send_failure(leg, tx).unwrap();
    assert_eq!(h.manager.modify_state(leg, invite).unwrap(), ModifyState::MsgSendFailure);
    assert_eq!(h.state(leg), CallLegState::Connected);
    assert_eq!(
        h.manager.dns_state(leg, DnsTarget::ReInvite(invite)).unwrap(),
        DnsState::MsgSendFailure
    );
    assert_eq!(h.manager.dns_state(leg, DnsTarget::CallLeg).unwrap(), DnsState::Normal);

    h.manager.dns_give_up(leg, DnsTarget::ReInvite(invite)).unwrap();
    assert_eq!(h.manager.modify_state(leg, invite).unwrap(), ModifyState::Idle);
    assert_eq!(h.state(leg), CallLegState::Connected);
    assert!(h.manager.call_leg_info(leg).unwrap().active_transaction.is_none());
}

#[test]
fn test_general_request_gets_a_new_transaction() {
    let h = Harness::new(CallLegMgrConfig::default());
    let leg = connected(&h);
    let tx = h.manager.request_general(leg, Method::Info).unwrap();

    h.manager.on_message_send_failure(leg, tx).unwrap();
    assert_eq!(h.state(leg), CallLegState::Connected);
    assert_eq!(
        h.manager.dns_state(leg, DnsTarget::General(tx)).unwrap(),
        DnsState::MsgSendFailure
    );

    let clone = h.manager.dns_continue(leg, DnsTarget::General(tx)).unwrap();
    assert_eq!(
        h.manager.dns_state(leg, DnsTarget::General(clone)).unwrap(),
        DnsState::MsgSendFailure
    );
    h.manager.dns_resend(leg, DnsTarget::General(clone)).unwrap();
    assert_eq!(h.manager.dns_state(leg, DnsTarget::General(tx)).unwrap(), DnsState::Normal);

    h.manager
        .on_response_received(leg, clone, ResponseInfo::new(200, Method::Info, 2))
        .unwrap();
    assert!(h.handler.events().contains(&CallLegEvent::GeneralResponseReceived {
        handle: leg,
        transaction: clone,
        status: 200,
    }));
}

#[test]
fn test_failover_refused_with_security_association() {
    let h = Harness::new(CallLegMgrConfig::default());
    let (leg, tx, _) = h.outgoing_call();
    h.manager
        .set_security_association(leg, Some(SecurityAssociation(1)))
        .unwrap();
    h.manager.on_message_send_failure(leg, tx).unwrap();

    for err in [
        h.manager.dns_list(leg, DnsTarget::CallLeg).unwrap_err(),
        h.manager.dns_continue(leg, DnsTarget::CallLeg).unwrap_err(),
        h.manager.dns_give_up(leg, DnsTarget::CallLeg).unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::IllegalAction);
    }
    assert_eq!(h.state(leg), CallLegState::MsgSendFailure);
}

#[test]
fn test_dns_operations_without_failure() {
    let h = Harness::new(CallLegMgrConfig::default());
    let (leg, tx, _) = h.outgoing_call();

    assert_eq!(
        h.manager.dns_give_up(leg, DnsTarget::CallLeg).unwrap_err().kind(),
        ErrorKind::IllegalAction
    );
    assert_eq!(
        h.manager.on_message_send_failure(leg, h.server_tx()).unwrap_err().kind(),
        ErrorKind::InvalidHandle
    );
    assert_eq!(h.state(leg), CallLegState::Inviting);
    assert!(h.manager.dns_state(leg, DnsTarget::General(tx)).unwrap() == DnsState::Normal);
}
