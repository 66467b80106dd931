//! Shared fixtures for the call-leg integration tests
//!
//! Every collaborator is an in-memory recorder so a test can drive the
//! manager the way a transaction layer would and then look at what went out.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use rvoip_call_leg_core::auth::{Challenge, Credentials};
use rvoip_call_leg_core::message::OutgoingResponse;
use rvoip_call_leg_core::message::OutgoingRequest;
use rvoip_call_leg_core::transaction::{
    Authenticator, CollaboratorError, SubscriptionHandle, SubscriptionLayer, TimerKind, TimerService,
};
use rvoip_call_leg_core::{
    CallLegEvent, CallLegEventHandler, CallLegHandle, CallLegMgrConfig, CallLegState, Collaborators, DialogManager,
    Method, NameAddr, RequestInfo, TransactionHandle, TransactionLayer,
};

/// Something the engine asked the transaction layer to do
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Request {
        owner: CallLegHandle,
        tx: TransactionHandle,
        request: OutgoingRequest,
    },
    Response {
        tx: TransactionHandle,
        response: OutgoingResponse,
    },
    Cancel {
        tx: TransactionHandle,
    },
    Ack {
        owner: CallLegHandle,
        request: OutgoingRequest,
    },
    Terminated(TransactionHandle),
    Detached(TransactionHandle),
    Cloned {
        from: TransactionHandle,
        to: TransactionHandle,
    },
    Resent(TransactionHandle),
}

/// Transaction layer that records everything and hands out sequential handles
#[derive(Default)]
pub struct RecordingTransactions {
    sent: Mutex<Vec<Sent>>,
    next: AtomicU64,
    fail_sends: AtomicBool,
}

impl RecordingTransactions {
    fn allocate(&self) -> TransactionHandle {
        TransactionHandle::new(self.next.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Requests sent so far with their transactions
    pub fn requests(&self) -> Vec<(TransactionHandle, OutgoingRequest)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Request { tx, request, .. } => Some((*tx, request.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn last_request(&self, method: Method) -> Option<(TransactionHandle, OutgoingRequest)> {
        self.requests().into_iter().rev().find(|(_, r)| r.method == method)
    }

    pub fn responses(&self, tx: TransactionHandle) -> Vec<OutgoingResponse> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Response { tx: t, response } if *t == tx => Some(response.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self, tx: TransactionHandle) -> Vec<u16> {
        self.responses(tx).iter().map(|r| r.status).collect()
    }

    pub fn acks(&self) -> Vec<OutgoingRequest> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Ack { request, .. } => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn cancels(&self) -> Vec<TransactionHandle> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Cancel { tx } => Some(*tx),
                _ => None,
            })
            .collect()
    }

    pub fn contains(&self, entry: &Sent) -> bool {
        self.sent.lock().contains(entry)
    }
}

impl TransactionLayer for RecordingTransactions {
    fn send_request(
        &self,
        owner: CallLegHandle,
        request: OutgoingRequest,
    ) -> Result<TransactionHandle, CollaboratorError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Failed("transport down".into()));
        }
        let tx = self.allocate();
        self.sent.lock().push(Sent::Request { owner, tx, request });
        Ok(tx)
    }

    fn respond(&self, tx: TransactionHandle, response: OutgoingResponse) -> Result<(), CollaboratorError> {
        self.sent.lock().push(Sent::Response { tx, response });
        Ok(())
    }

    fn cancel(&self, tx: TransactionHandle) -> Result<TransactionHandle, CollaboratorError> {
        self.sent.lock().push(Sent::Cancel { tx });
        Ok(self.allocate())
    }

    fn send_ack(&self, owner: CallLegHandle, request: OutgoingRequest) -> Result<(), CollaboratorError> {
        self.sent.lock().push(Sent::Ack { owner, request });
        Ok(())
    }

    fn terminate(&self, tx: TransactionHandle) {
        self.sent.lock().push(Sent::Terminated(tx));
    }

    fn detach(&self, tx: TransactionHandle) {
        self.sent.lock().push(Sent::Detached(tx));
    }

    fn clone_for_next_address(&self, tx: TransactionHandle) -> Result<TransactionHandle, CollaboratorError> {
        let to = self.allocate();
        self.sent.lock().push(Sent::Cloned { from: tx, to });
        Ok(to)
    }

    fn resend(&self, tx: TransactionHandle) -> Result<(), CollaboratorError> {
        self.sent.lock().push(Sent::Resent(tx));
        Ok(())
    }

    fn dns_list(&self, _tx: TransactionHandle) -> Result<Vec<String>, CollaboratorError> {
        Ok(vec!["192.0.2.10:5060".into(), "192.0.2.11:5060".into()])
    }
}

/// Timer service fired by hand
#[derive(Default)]
pub struct ManualTimers {
    armed: Mutex<HashMap<(CallLegHandle, TimerKind), Duration>>,
}

impl ManualTimers {
    pub fn armed(&self, owner: CallLegHandle, kind: TimerKind) -> Option<Duration> {
        self.armed.lock().get(&(owner, kind)).copied()
    }

    /// Disarm and report whether the timer was armed
    pub fn take(&self, owner: CallLegHandle, kind: TimerKind) -> bool {
        self.armed.lock().remove(&(owner, kind)).is_some()
    }
}

impl TimerService for ManualTimers {
    fn start(&self, owner: CallLegHandle, kind: TimerKind, after: Duration) {
        self.armed.lock().insert((owner, kind), after);
    }

    fn cancel(&self, owner: CallLegHandle, kind: TimerKind) {
        self.armed.lock().remove(&(owner, kind));
    }
}

type Reaction = Arc<dyn Fn(&DialogManager, &CallLegEvent) + Send + Sync>;

/// Records events and optionally runs a reaction inside the callback
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<CallLegEvent>>,
    reaction: Mutex<Option<Reaction>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<CallLegEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn react(&self, reaction: impl Fn(&DialogManager, &CallLegEvent) + Send + Sync + 'static) {
        *self.reaction.lock() = Some(Arc::new(reaction));
    }

    /// States `handle` went through, in order
    pub fn states(&self, handle: CallLegHandle) -> Vec<CallLegState> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CallLegEvent::StateChanged { handle: h, new, .. } if *h == handle => Some(*new),
                _ => None,
            })
            .collect()
    }
}

impl CallLegEventHandler for RecordingHandler {
    fn on_event(&self, manager: &DialogManager, event: &CallLegEvent) {
        self.events.lock().push(event.clone());
        // reactions may raise nested events
        let reaction = self.reaction.lock().clone();
        if let Some(reaction) = reaction {
            reaction(manager, event);
        }
    }
}

/// Authenticator producing predictable credentials; the password is "secret"
pub struct TestAuthenticator;

impl Authenticator for TestAuthenticator {
    fn build_credentials(
        &self,
        challenge: &Challenge,
        request: &OutgoingRequest,
    ) -> Result<Credentials, CollaboratorError> {
        Ok(Credentials {
            username: "alice".into(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            response: format!("{}:{}", request.method, request.cseq),
            proxy: challenge.proxy,
        })
    }

    fn verify(&self, credentials: &Credentials, password: &str, _method: &Method) -> bool {
        password == "secret" && credentials.username == "alice"
    }

    fn build_challenge(&self, realm: &str, proxy: bool) -> Challenge {
        let challenge = Challenge::digest(realm, "fresh-nonce");
        if proxy { challenge.for_proxy() } else { challenge }
    }
}

#[derive(Default)]
pub struct RecordingSubscriptions {
    pub terminated: Mutex<Vec<SubscriptionHandle>>,
}

impl SubscriptionLayer for RecordingSubscriptions {
    fn terminate(&self, subscription: SubscriptionHandle) {
        self.terminated.lock().push(subscription);
    }
}

pub const ALICE: &str = "sip:alice@atlanta.example.com";
pub const BOB: &str = "sip:bob@biloxi.example.com";

/// A manager wired to recording collaborators
pub struct Harness {
    pub manager: DialogManager,
    pub transactions: Arc<RecordingTransactions>,
    pub timers: Arc<ManualTimers>,
    pub handler: Arc<RecordingHandler>,
    pub subscriptions: Arc<RecordingSubscriptions>,
    next_server_tx: AtomicU64,
}

impl Harness {
    pub fn new(config: CallLegMgrConfig) -> Self {
        let transactions = Arc::new(RecordingTransactions::default());
        let timers = Arc::new(ManualTimers::default());
        let handler = Arc::new(RecordingHandler::default());
        let subscriptions = Arc::new(RecordingSubscriptions::default());
        let collaborators = Collaborators::new(transactions.clone(), timers.clone())
            .with_authenticator(Arc::new(TestAuthenticator))
            .with_subscriptions(subscriptions.clone());
        let manager = DialogManager::new(config, collaborators).expect("valid config");
        manager.set_event_handler(handler.clone());
        Self {
            manager,
            transactions,
            timers,
            handler,
            subscriptions,
            next_server_tx: AtomicU64::new(10_000),
        }
    }

    /// Default configuration, terminated call-legs kept for inspection
    pub fn keeping_terminated() -> Self {
        Self::keeping_terminated_with(CallLegMgrConfig::default())
    }

    pub fn keeping_terminated_with(config: CallLegMgrConfig) -> Self {
        Self::new(config.with_release_terminated(false))
    }

    /// Handle for a server transaction created by the transaction layer
    pub fn server_tx(&self) -> TransactionHandle {
        TransactionHandle::new(self.next_server_tx.fetch_add(1, Ordering::SeqCst))
    }

    pub fn state(&self, handle: CallLegHandle) -> CallLegState {
        self.manager.state(handle).expect("call-leg exists")
    }

    /// Create an outgoing call-leg from Alice to Bob and send the INVITE
    pub fn outgoing_call(&self) -> (CallLegHandle, TransactionHandle, OutgoingRequest) {
        let handle = self.manager.create_call_leg(Some(7)).expect("call-leg created");
        self.manager.set_from(handle, NameAddr::new(ALICE)).expect("from");
        self.manager.set_to(handle, NameAddr::new(BOB)).expect("to");
        self.manager.connect(handle).expect("connect");
        let (tx, invite) = self.transactions.last_request(Method::Invite).expect("INVITE sent");
        (handle, tx, invite)
    }

    /// Receive an initial INVITE from Bob
    pub fn incoming_call(&self, call_id: &str) -> (CallLegHandle, TransactionHandle, RequestInfo) {
        let request = RequestInfo::new(
            Method::Invite,
            call_id,
            NameAddr::new(BOB).with_tag("bob-1"),
            NameAddr::new(ALICE),
            1,
        )
        .with_contact("<sip:bob@192.0.2.4>");
        self.incoming_request(request)
    }

    pub fn incoming_request(&self, request: RequestInfo) -> (CallLegHandle, TransactionHandle, RequestInfo) {
        let tx = self.server_tx();
        let handle = self
            .manager
            .on_request_received(tx, request.clone())
            .expect("request matched");
        (handle, tx, request)
    }

    /// In-dialog request from Bob on an incoming call-leg
    pub fn request_from_bob(&self, handle: CallLegHandle, call_id: &str, method: Method, cseq: u32) -> RequestInfo {
        let local_tag = self
            .manager
            .call_leg_info(handle)
            .expect("call-leg exists")
            .local_tag
            .expect("local tag");
        RequestInfo::new(
            method,
            call_id,
            NameAddr::new(BOB).with_tag("bob-1"),
            NameAddr::new(ALICE).with_tag(local_tag),
            cseq,
        )
    }
}

/// Install a subscriber for test logs; ignores a second install
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
