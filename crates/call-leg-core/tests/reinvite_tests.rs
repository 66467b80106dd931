//! Re-INVITE records in both handling modes

mod common;

use common::{Harness, BOB};
use rvoip_call_leg_core::message::OutgoingRequest;
use rvoip_call_leg_core::prelude::*;

/// Outgoing call-leg in Connected, with the INVITE it sent
fn connected_outgoing(h: &Harness) -> (CallLegHandle, OutgoingRequest) {
    let (leg, tx, invite) = h.outgoing_call();
    h.manager
        .on_response_received(leg, tx, ResponseInfo::new(200, Method::Invite, 5).with_to_tag("b1"))
        .unwrap();
    if h.manager.config().manual_ack {
        h.manager.ack(leg).unwrap();
    }
    assert_eq!(h.state(leg), CallLegState::Connected);
    (leg, invite)
}

/// Request from Bob into a dialog we started
fn from_bob(invite: &OutgoingRequest, method: Method, cseq: u32) -> RequestInfo {
    RequestInfo::new(
        method,
        invite.call_id.clone(),
        NameAddr::new(BOB).with_tag("b1"),
        invite.from.clone(),
        cseq,
    )
}

fn modify_changes(h: &Harness, invite: InviteHandle) -> Vec<ModifyState> {
    h.handler
        .events()
        .iter()
        .filter_map(|e| match e {
            CallLegEvent::ModifyStateChanged { invite: i, new, .. } if *i == invite => Some(*new),
            _ => None,
        })
        .collect()
}

#[test]
fn test_outgoing_reinvite_is_acked() {
    common::init_tracing();
    let h = Harness::new(CallLegMgrConfig::default());
    let (leg, _) = connected_outgoing(&h);

    let invite = h.manager.reinvite_create(leg, Some(9)).unwrap();
    assert_eq!(h.manager.modify_state(leg, invite).unwrap(), ModifyState::Idle);
    h.manager.reinvite_request(leg, invite).unwrap();
    let (tx, request) = h.transactions.last_request(Method::Invite).unwrap();
    assert_eq!(request.cseq, 2);
    assert_eq!(request.to.tag.as_deref(), Some("b1"));

    h.manager
        .on_response_received(leg, tx, ResponseInfo::new(100, Method::Invite, 2))
        .unwrap();
    h.manager
        .on_response_received(leg, tx, ResponseInfo::new(183, Method::Invite, 2).with_to_tag("b1"))
        .unwrap();
    h.manager
        .on_response_received(leg, tx, ResponseInfo::new(200, Method::Invite, 2).with_to_tag("b1"))
        .unwrap();

    let acks = h.transactions.acks();
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[1].cseq, 2);
    assert_eq!(
        modify_changes(&h, invite),
        vec![
            ModifyState::ReinviteSent,
            ModifyState::ReinviteProceeding,
            ModifyState::ReinviteRemoteAccepted,
            ModifyState::AckSent,
        ]
    );
    assert_eq!(h.state(leg), CallLegState::Connected);

    // current handling keeps every record
    let second = h.manager.reinvite_create(leg, None).unwrap();
    assert_eq!(h.manager.invite_records(leg).unwrap().len(), 3);
    h.manager.reinvite_terminate(leg, second).unwrap();
    assert_eq!(h.manager.invite_records(leg).unwrap().len(), 2);
    assert_eq!(
        h.manager.modify_state(leg, second).unwrap_err().kind(),
        ErrorKind::InvalidHandle
    );
}

#[test]
fn test_reinvite_rejection_keeps_the_call() {
    let h = Harness::new(CallLegMgrConfig::default());
    let (leg, _) = connected_outgoing(&h);
    let invite = h.manager.reinvite_create(leg, None).unwrap();
    h.manager.reinvite_request(leg, invite).unwrap();
    let (tx, _) = h.transactions.last_request(Method::Invite).unwrap();

    h.manager
        .on_response_received(leg, tx, ResponseInfo::new(488, Method::Invite, 2))
        .unwrap();
    assert_eq!(h.manager.modify_state(leg, invite).unwrap(), ModifyState::Idle);
    assert_eq!(h.state(leg), CallLegState::Connected);
    assert!(h.transactions.last_request(Method::Bye).is_none());
}

#[test]
fn test_reinvite_481_ends_the_dialog() {
    let h = Harness::new(CallLegMgrConfig::default());
    let (leg, _) = connected_outgoing(&h);
    let invite = h.manager.reinvite_create(leg, None).unwrap();
    h.manager.reinvite_request(leg, invite).unwrap();
    let (tx, _) = h.transactions.last_request(Method::Invite).unwrap();

    h.manager
        .on_response_received(leg, tx, ResponseInfo::new(481, Method::Invite, 2))
        .unwrap();
    let (_, bye) = h.transactions.last_request(Method::Bye).unwrap();
    assert_eq!(bye.cseq, 3);
    assert_eq!(h.state(leg), CallLegState::Disconnecting);
}

#[test]
fn test_local_cancel_of_reinvite() {
    let h = Harness::new(CallLegMgrConfig::default());
    let (leg, _) = connected_outgoing(&h);
    let invite = h.manager.reinvite_create(leg, None).unwrap();
    h.manager.reinvite_request(leg, invite).unwrap();
    let (tx, _) = h.transactions.last_request(Method::Invite).unwrap();

    // nothing to cancel before a provisional
    assert_eq!(h.manager.cancel(leg).unwrap_err().kind(), ErrorKind::IllegalAction);

    h.manager
        .on_response_received(leg, tx, ResponseInfo::new(180, Method::Invite, 2).with_to_tag("b1"))
        .unwrap();
    h.manager.cancel(leg).unwrap();
    assert_eq!(h.transactions.cancels(), vec![tx]);
    assert_eq!(h.manager.modify_state(leg, invite).unwrap(), ModifyState::ReinviteCancelling);

    h.manager
        .on_response_received(leg, tx, ResponseInfo::new(487, Method::Invite, 2))
        .unwrap();
    assert!(h.handler.events().contains(&CallLegEvent::ModifyStateChanged {
        handle: leg,
        invite,
        old: ModifyState::ReinviteCancelling,
        new: ModifyState::Idle,
        reason: StateChangeReason::LocalCancelled,
    }));
    assert_eq!(h.state(leg), CallLegState::Connected);
}

#[test]
fn test_incoming_reinvite_accept_and_ack() {
    let h = Harness::new(CallLegMgrConfig::default());
    let (leg, invite) = connected_outgoing(&h);

    let (_, tx, _) = h.incoming_request(from_bob(&invite, Method::Invite, 5).with_contact("<sip:bob@192.0.2.50>"));
    let record = h
        .handler
        .events()
        .iter()
        .find_map(|e| match e {
            CallLegEvent::ReInviteCreated { handle, invite } if *handle == leg => Some(*invite),
            _ => None,
        })
        .expect("re-INVITE record created");
    assert_eq!(h.manager.modify_state(leg, record).unwrap(), ModifyState::ReinviteRcvd);
    assert_eq!(
        h.manager.call_leg_info(leg).unwrap().remote_contact.as_deref(),
        Some("<sip:bob@192.0.2.50>")
    );

    h.manager.provisional_response(leg, 180).unwrap();
    h.manager.accept(leg).unwrap();
    assert_eq!(h.transactions.statuses(tx), vec![180, 200]);
    assert_eq!(h.manager.modify_state(leg, record).unwrap(), ModifyState::ReinviteAccepted);

    h.incoming_request(from_bob(&invite, Method::Ack, 5));
    assert_eq!(h.manager.modify_state(leg, record).unwrap(), ModifyState::AckRcvd);
    assert_eq!(h.state(leg), CallLegState::Connected);
}

#[test]
fn test_reinvite_glare_is_answered_491() {
    let h = Harness::new(CallLegMgrConfig::default());
    let (leg, invite) = connected_outgoing(&h);
    let ours = h.manager.reinvite_create(leg, None).unwrap();
    h.manager.reinvite_request(leg, ours).unwrap();

    let (_, tx, _) = h.incoming_request(from_bob(&invite, Method::Invite, 5));
    assert_eq!(h.transactions.statuses(tx), vec![491]);
    assert_eq!(h.manager.modify_state(leg, ours).unwrap(), ModifyState::ReinviteSent);
}

#[test]
fn test_remote_cancel_of_reinvite() {
    let h = Harness::new(CallLegMgrConfig::default());
    let (leg, invite) = connected_outgoing(&h);
    let (_, invite_tx, _) = h.incoming_request(from_bob(&invite, Method::Invite, 5));

    let (_, cancel_tx, _) = h.incoming_request(from_bob(&invite, Method::Cancel, 5));
    assert_eq!(h.transactions.statuses(cancel_tx), vec![200]);
    let record = h.manager.invite_records(leg).unwrap()[1];
    assert_eq!(h.manager.modify_state(leg, record).unwrap(), ModifyState::ReinviteCancelled);

    h.manager.reject(leg, 487).unwrap();
    assert_eq!(h.transactions.statuses(invite_tx), vec![487]);
    assert_eq!(h.manager.modify_state(leg, record).unwrap(), ModifyState::Terminated);
    assert_eq!(h.state(leg), CallLegState::Connected);
}

#[test]
fn test_reinvite_timeout_sends_bye() {
    let h = Harness::new(CallLegMgrConfig::default());
    let (leg, _) = connected_outgoing(&h);
    let invite = h.manager.reinvite_create(leg, None).unwrap();
    h.manager.reinvite_request(leg, invite).unwrap();
    let (tx, _) = h.transactions.last_request(Method::Invite).unwrap();

    h.manager.on_transaction_timeout(leg, tx).unwrap();
    assert!(h.transactions.last_request(Method::Bye).is_some());
    assert_eq!(h.state(leg), CallLegState::Disconnecting);
}

#[test]
fn test_legacy_incoming_reinvite_moves_the_call_leg() {
    let h = Harness::new(CallLegMgrConfig::default().with_invite_handling(InviteHandlingMode::Legacy));
    let (leg, invite) = connected_outgoing(&h);

    h.incoming_request(from_bob(&invite, Method::Invite, 5));
    h.manager.accept(leg).unwrap();
    assert_eq!(h.state(leg), CallLegState::Accepted);

    // legacy handling only creates re-INVITEs in Connected
    assert_eq!(
        h.manager.reinvite_create(leg, None).unwrap_err().kind(),
        ErrorKind::IllegalAction
    );

    h.incoming_request(from_bob(&invite, Method::Ack, 5));
    assert_eq!(h.state(leg), CallLegState::Connected);
}

#[test]
fn test_legacy_manual_ack_covers_reinvite() {
    let h = Harness::new(
        CallLegMgrConfig::default()
            .with_invite_handling(InviteHandlingMode::Legacy)
            .with_manual_ack(true),
    );
    let (leg, _) = connected_outgoing(&h);

    let first = h.manager.reinvite_create(leg, None).unwrap();
    h.manager.reinvite_request(leg, first).unwrap();
    let (tx, _) = h.transactions.last_request(Method::Invite).unwrap();
    h.manager
        .on_response_received(leg, tx, ResponseInfo::new(200, Method::Invite, 2).with_to_tag("b1"))
        .unwrap();
    assert_eq!(h.state(leg), CallLegState::RemoteAccepted);
    assert_eq!(h.transactions.acks().len(), 1);

    h.manager.ack(leg).unwrap();
    assert_eq!(h.transactions.acks().len(), 2);
    assert_eq!(h.manager.modify_state(leg, first).unwrap(), ModifyState::AckSent);
    assert_eq!(h.state(leg), CallLegState::Connected);

    // completed records are discarded on the next create
    let second = h.manager.reinvite_create(leg, None).unwrap();
    let records = h.manager.invite_records(leg).unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.contains(&second));
    assert!(!records.contains(&first));
}

#[test]
fn test_current_manual_reinvite_ack() {
    let h = Harness::new(CallLegMgrConfig::default().with_manual_ack(true));
    let (leg, _) = connected_outgoing(&h);
    let invite = h.manager.reinvite_create(leg, None).unwrap();

    assert_eq!(
        h.manager.reinvite_ack(leg, invite).unwrap_err().kind(),
        ErrorKind::IllegalAction
    );
    h.manager.reinvite_request(leg, invite).unwrap();
    let (tx, _) = h.transactions.last_request(Method::Invite).unwrap();
    h.manager
        .on_response_received(leg, tx, ResponseInfo::new(200, Method::Invite, 2).with_to_tag("b1"))
        .unwrap();
    assert_eq!(
        h.manager.modify_state(leg, invite).unwrap(),
        ModifyState::ReinviteRemoteAccepted
    );
    assert_eq!(h.state(leg), CallLegState::Connected);

    h.manager.reinvite_ack(leg, invite).unwrap();
    assert_eq!(h.transactions.acks().len(), 2);
    assert_eq!(h.manager.modify_state(leg, invite).unwrap(), ModifyState::AckSent);
}
