//! The manager running on tokio with real timers and an event channel

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use common::{RecordingTransactions, ALICE, BOB};
use rvoip_call_leg_core::message::{RefresherRole, SessionTimerHeaders};
use rvoip_call_leg_core::prelude::*;
use rvoip_call_leg_core::transaction::TokioTimerService;
use rvoip_call_leg_core::{ChannelEventHandler, SessionTimerDefaults};

struct Running {
    manager: Arc<DialogManager>,
    transactions: Arc<RecordingTransactions>,
    timers: Arc<TokioTimerService>,
    events: tokio::sync::mpsc::UnboundedReceiver<CallLegEvent>,
}

fn start(config: CallLegMgrConfig) -> Running {
    let transactions = Arc::new(RecordingTransactions::default());
    let (timers, expiries) = TokioTimerService::new(Handle::current());
    let timers = Arc::new(timers);
    let manager = Arc::new(
        DialogManager::new(config, Collaborators::new(transactions.clone(), timers.clone())).unwrap(),
    );
    let (handler, events) = ChannelEventHandler::new();
    manager.set_event_handler(Arc::new(handler));

    let looping = manager.clone();
    tokio::spawn(async move { looping.run_timer_events(expiries).await });

    Running {
        manager,
        transactions,
        timers,
        events,
    }
}

fn connected_call(running: &Running, headers: SessionTimerHeaders) -> CallLegHandle {
    let manager = &running.manager;
    let leg = manager.create_call_leg(None).unwrap();
    manager.set_from(leg, NameAddr::new(ALICE)).unwrap();
    manager.set_to(leg, NameAddr::new(BOB)).unwrap();
    manager.connect(leg).unwrap();
    let (tx, _) = running.transactions.last_request(Method::Invite).unwrap();
    manager
        .on_response_received(
            leg,
            tx,
            ResponseInfo::new(200, Method::Invite, 1)
                .with_to_tag("b1")
                .with_session_timer(headers),
        )
        .unwrap();
    leg
}

fn drain(events: &mut tokio::sync::mpsc::UnboundedReceiver<CallLegEvent>) -> Vec<CallLegEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_events_reach_the_channel() {
    common::init_tracing();
    let mut running = start(CallLegMgrConfig::default());
    let leg = connected_call(&running, SessionTimerHeaders::default());

    let states: Vec<_> = drain(&mut running.events)
        .into_iter()
        .filter_map(|e| match e {
            CallLegEvent::StateChanged { handle, new, .. } if handle == leg => Some(new),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            CallLegState::Inviting,
            CallLegState::RemoteAccepted,
            CallLegState::Connected,
        ]
    );
    assert_eq!(running.timers.armed_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_session_expiry_fires_on_the_runtime() {
    let config = CallLegMgrConfig::default().with_session_timer(SessionTimerDefaults::default());
    let mut running = start(config);
    let leg = connected_call(
        &running,
        SessionTimerHeaders {
            session_expires: Some(1200),
            refresher: Some(RefresherRole::Uas),
            min_se: None,
            supported: true,
            required: true,
        },
    );
    assert_eq!(running.timers.armed_count(), 1);
    drain(&mut running.events);

    // just before the expiry nothing has happened
    tokio::time::sleep(Duration::from_secs(1100)).await;
    assert!(running.transactions.last_request(Method::Bye).is_none());

    tokio::time::sleep(Duration::from_secs(100)).await;
    assert!(running.transactions.last_request(Method::Bye).is_some());
    assert!(drain(&mut running.events).contains(&CallLegEvent::StateChanged {
        handle: leg,
        old: CallLegState::Connected,
        new: CallLegState::Disconnecting,
        reason: StateChangeReason::SessionExpired,
    }));
    assert_eq!(running.manager.state(leg).unwrap(), CallLegState::Disconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_terminated_call_leg_cancels_its_timers() {
    let config = CallLegMgrConfig::default().with_session_timer(SessionTimerDefaults::default());
    let running = start(config);
    let leg = connected_call(
        &running,
        SessionTimerHeaders {
            session_expires: Some(1800),
            refresher: Some(RefresherRole::Uac),
            min_se: None,
            supported: true,
            required: true,
        },
    );
    assert_eq!(running.timers.armed_count(), 1);

    running.manager.terminate(leg).unwrap();
    assert_eq!(running.timers.armed_count(), 0);
    assert_eq!(running.manager.call_leg_count(), 0);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(running.transactions.last_request(Method::Invite).map(|(_, r)| r.cseq) == Some(1));
}
