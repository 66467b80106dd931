//! The call-leg aggregate
//!
//! A [`CallLeg`] owns everything that belongs to one dialog: identity,
//! sequencing, routing, its INVITE attempt records, the PRACK machine, the
//! optional session timer negotiator, the fork relation and the fail-over
//! bookkeeping. It has no knowledge of locking or event delivery; the
//! manager wraps it for that.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{CallLegState, Direction, StateChangeReason};
use crate::arena::{Arena, CallLegHandle, InviteHandle};
use crate::auth::{AuthObjectList, Credentials, ServerAuthSession};
use crate::config::SessionTimerDefaults;
use crate::dns::DnsFailoverController;
use crate::errors::{check_cseq, CallLegError, CallLegResult};
use crate::forking::ForkRelation;
use crate::guard::CallbackSet;
use crate::invite::{InviteModify, ModifyState};
use crate::message::{Method, NameAddr, OutgoingRequest, RequestInfo, SessionTimerHeaders};
use crate::prack::PrackStateMachine;
use crate::replaces::{OutboundReplaces, ReplacesHeader};
use crate::session_timer::{SessionTimerNegotiator, SessionTimerParams};
use crate::transaction::{SecurityAssociation, SubscriptionHandle, TimerKind, TransactionHandle};

/// A non-INVITE request exchanged inside the call-leg
#[derive(Debug, Clone)]
pub struct GeneralTransaction {
    pub method: Method,
    pub incoming: bool,
    /// Session timer values for an UPDATE refresh
    pub session_override: Option<SessionTimerParams>,
    /// Credentials carried by an incoming request
    pub credentials: Vec<Credentials>,
    /// Session timer headers of an incoming UPDATE
    pub session_timer: SessionTimerHeaders,
}

/// Read-only snapshot of a call-leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallLegInfo {
    pub handle: CallLegHandle,
    pub direction: Direction,
    pub state: CallLegState,
    pub call_id: Option<String>,
    pub local_tag: Option<String>,
    pub remote_tag: Option<String>,
    pub local_cseq: Option<u32>,
    pub remote_cseq: Option<u32>,
    pub route_set: Vec<String>,
    pub local_contact: Option<String>,
    pub remote_contact: Option<String>,
    pub active_transaction: Option<TransactionHandle>,
    pub is_fork: bool,
    pub forking_enabled: bool,
    pub owner: Option<u64>,
    pub termination_reason: Option<StateChangeReason>,
    pub created_at: DateTime<Utc>,
}

/// One SIP dialog and all of its sub-state machines
#[derive(Debug)]
pub struct CallLeg {
    pub(crate) handle: CallLegHandle,
    pub(crate) direction: Direction,
    pub(crate) state: CallLegState,
    /// Target state of a transition whose send is still in flight
    pub(crate) pending_state: Option<CallLegState>,
    /// State before the last INVITE/BYE went out, restored by DNS give-up
    pub(crate) state_before_send: CallLegState,
    pub(crate) call_id: Option<String>,
    pub(crate) from: Option<NameAddr>,
    pub(crate) to: Option<NameAddr>,
    /// Last CSeq used for a locally generated request
    pub(crate) local_cseq: Option<u32>,
    pub(crate) remote_cseq: Option<u32>,
    pub(crate) route_set: Vec<String>,
    pub(crate) local_contact: Option<String>,
    pub(crate) remote_contact: Option<String>,
    pub(crate) outbound_proxy: Option<String>,
    /// INVITE transaction currently driving the call-leg
    pub(crate) active_transaction: Option<TransactionHandle>,
    pub(crate) invites: Arena<InviteModify>,
    pub(crate) invite_sequence: u32,
    pub(crate) initial_invite: Option<InviteHandle>,
    pub(crate) prack: PrackStateMachine,
    pub(crate) refer_subscription: Option<SubscriptionHandle>,
    pub(crate) is_refer_call_leg: bool,
    pub(crate) replaces: OutboundReplaces,
    pub(crate) received_replaces: Option<ReplacesHeader>,
    pub(crate) session_timer: Option<SessionTimerNegotiator>,
    pub(crate) security_association: Option<SecurityAssociation>,
    pub(crate) fork: ForkRelation,
    pub(crate) forking_enabled: bool,
    pub(crate) owner: Option<u64>,
    pub(crate) termination_reason: Option<StateChangeReason>,
    pub(crate) dns: DnsFailoverController,
    pub(crate) auth: AuthObjectList,
    pub(crate) server_auth: Option<ServerAuthSession>,
    /// Credentials of the INVITE that created an incoming call-leg
    pub(crate) invite_credentials: Vec<Credentials>,
    pub(crate) bye_transaction: Option<TransactionHandle>,
    pub(crate) incoming_bye: Option<TransactionHandle>,
    pub(crate) cancel_transaction: Option<TransactionHandle>,
    pub(crate) general: HashMap<TransactionHandle, GeneralTransaction>,
    pub(crate) armed_timers: HashSet<TimerKind>,
    pub(crate) callbacks: CallbackSet,
    pub(crate) op_depth: u32,
    /// Bumped by every operation; the registry keeps the newest key it has seen
    pub(crate) index_epoch: u64,
    /// The owner gave the call-leg up with `detach_owner`
    pub(crate) detached: bool,
    pub(crate) released: bool,
    pub(crate) created_at: DateTime<Utc>,
}

/// Random tag for From/To headers
pub(crate) fn generate_tag() -> String {
    format!("{:08x}", rand::thread_rng().gen_range(0..u32::MAX))
}

pub(crate) fn generate_call_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl CallLeg {
    fn new(
        handle: CallLegHandle,
        direction: Direction,
        forking_enabled: bool,
        session_timer: Option<&SessionTimerDefaults>,
    ) -> Self {
        let mut invites = Arena::new();
        let initial_invite = invites.insert(InviteModify::new_initial(0)).map(InviteHandle);
        Self {
            handle,
            direction,
            state: CallLegState::Idle,
            pending_state: None,
            state_before_send: CallLegState::Idle,
            call_id: None,
            from: None,
            to: None,
            local_cseq: None,
            remote_cseq: None,
            route_set: Vec::new(),
            local_contact: None,
            remote_contact: None,
            outbound_proxy: None,
            active_transaction: None,
            invites,
            invite_sequence: 1,
            initial_invite,
            prack: PrackStateMachine::new(),
            refer_subscription: None,
            is_refer_call_leg: false,
            replaces: OutboundReplaces::default(),
            received_replaces: None,
            session_timer: session_timer.map(SessionTimerNegotiator::new),
            security_association: None,
            fork: ForkRelation::None,
            forking_enabled,
            owner: None,
            termination_reason: None,
            dns: DnsFailoverController::new(),
            auth: AuthObjectList::new(),
            server_auth: None,
            invite_credentials: Vec::new(),
            bye_transaction: None,
            incoming_bye: None,
            cancel_transaction: None,
            general: HashMap::new(),
            armed_timers: HashSet::new(),
            callbacks: CallbackSet::EMPTY,
            op_depth: 0,
            index_epoch: 0,
            detached: false,
            released: false,
            created_at: Utc::now(),
        }
    }

    /// Create an outgoing call-leg in Idle
    pub fn new_outgoing(
        handle: CallLegHandle,
        forking_enabled: bool,
        session_timer: Option<&SessionTimerDefaults>,
    ) -> Self {
        Self::new(handle, Direction::Outgoing, forking_enabled, session_timer)
    }

    /// Create the call-leg of a received initial INVITE. The local tag is
    /// generated here; the state stays Idle until the manager offers it.
    pub fn new_incoming(
        handle: CallLegHandle,
        request: &RequestInfo,
        session_timer: Option<&SessionTimerDefaults>,
    ) -> Self {
        let mut leg = Self::new(handle, Direction::Incoming, false, session_timer);
        leg.call_id = Some(request.call_id.clone());
        leg.from = Some(request.from.clone());
        leg.to = Some(request.to.clone().with_tag(generate_tag()));
        leg.remote_cseq = Some(request.cseq);
        leg.remote_contact = request.contact.clone();
        leg.route_set = request.record_route.clone();
        leg.received_replaces = request.replaces.clone();
        leg.invite_credentials = request.authorization.clone();
        leg
    }

    /// Clone the transaction independent state of an original into a fork
    pub fn fork_from(original: &CallLeg, handle: CallLegHandle, to_tag: &str) -> Self {
        let mut fork = Self::new(handle, Direction::Outgoing, original.forking_enabled, None);
        fork.state = CallLegState::Inviting;
        fork.state_before_send = CallLegState::Idle;
        fork.call_id = original.call_id.clone();
        fork.from = original.from.clone();
        fork.to = original
            .to
            .clone()
            .map(|to| NameAddr { tag: Some(to_tag.to_string()), ..to });
        fork.local_cseq = original.local_cseq;
        fork.local_contact = original.local_contact.clone();
        fork.remote_contact = original.remote_contact.clone();
        // in-dialog requests on every fork answer the same challenges
        fork.auth = original.auth.clone();
        fork.outbound_proxy = original.outbound_proxy.clone();
        fork.session_timer = original.session_timer.clone().map(|mut st| {
            st.stop();
            st
        });
        fork.security_association = original.security_association;
        fork.fork = ForkRelation::Fork {
            original: original.handle,
        };
        if let Some(record) = fork.initial_invite.and_then(|h| fork.invites.get_mut(h.0)) {
            record.cseq = original.initial_record().and_then(|r| r.cseq);
        }
        fork
    }

    pub fn handle(&self) -> CallLegHandle {
        self.handle
    }

    pub fn state(&self) -> CallLegState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Our own party: From for outgoing call-legs, To for incoming ones
    pub fn local_party(&self) -> Option<&NameAddr> {
        match self.direction {
            Direction::Outgoing => self.from.as_ref(),
            Direction::Incoming => self.to.as_ref(),
        }
    }

    pub fn remote_party(&self) -> Option<&NameAddr> {
        match self.direction {
            Direction::Outgoing => self.to.as_ref(),
            Direction::Incoming => self.from.as_ref(),
        }
    }

    pub fn local_tag(&self) -> Option<&str> {
        self.local_party().and_then(|p| p.tag.as_deref())
    }

    pub fn remote_tag(&self) -> Option<&str> {
        self.remote_party().and_then(|p| p.tag.as_deref())
    }

    pub(crate) fn set_remote_tag(&mut self, tag: &str) {
        let party = match self.direction {
            Direction::Outgoing => self.to.as_mut(),
            Direction::Incoming => self.from.as_mut(),
        };
        if let Some(party) = party {
            party.tag = Some(tag.to_string());
        }
    }

    /// Registry key: (Call-ID, local tag)
    pub(crate) fn index_key(&self) -> Option<(String, String)> {
        Some((self.call_id.clone()?, self.local_tag()?.to_string()))
    }

    pub fn is_fork(&self) -> bool {
        self.fork.is_fork()
    }

    pub fn original(&self) -> CallLegHandle {
        self.fork.original_of(self.handle)
    }

    /// Next CSeq for a locally generated request
    pub(crate) fn next_cseq(&mut self) -> CallLegResult<u32> {
        let next = match self.local_cseq {
            None => 1,
            Some(cseq) => cseq
                .checked_add(1)
                .ok_or_else(|| CallLegError::bad_param("CSeq space exhausted"))?,
        };
        check_cseq(next)?;
        self.local_cseq = Some(next);
        Ok(next)
    }

    /// Make sure Call-ID and local tag exist before the first request
    pub(crate) fn ensure_identity(&mut self) -> CallLegResult<()> {
        if self.from.is_none() || self.to.is_none() {
            return Err(CallLegError::bad_param("From and To must be set before connecting"));
        }
        if self.call_id.is_none() {
            self.call_id = Some(generate_call_id());
        }
        if let Some(from) = self.from.as_mut().filter(|f| f.tag.is_none()) {
            from.tag = Some(generate_tag());
        }
        Ok(())
    }

    /// Build an in-dialog request; ACK reuses `cseq`, everything else takes the next one
    pub(crate) fn build_request(&mut self, method: Method, cseq: Option<u32>) -> CallLegResult<OutgoingRequest> {
        let cseq = match (&method, cseq) {
            (Method::Ack, Some(cseq)) => cseq,
            _ => self.next_cseq()?,
        };
        let call_id = self
            .call_id
            .clone()
            .ok_or_else(|| CallLegError::bad_param("Call-ID is not set"))?;
        let local = self
            .local_party()
            .cloned()
            .ok_or_else(|| CallLegError::bad_param("local party is not set"))?;
        let remote = self
            .remote_party()
            .cloned()
            .ok_or_else(|| CallLegError::bad_param("remote party is not set"))?;

        Ok(OutgoingRequest {
            request_uri: self.remote_contact.clone().unwrap_or_else(|| remote.uri.clone()),
            method,
            call_id,
            from: local,
            to: remote,
            cseq,
            route_set: self.route_set.clone(),
            contact: self.local_contact.clone(),
            outbound_proxy: self.outbound_proxy.clone(),
            supported_100rel: false,
            session_timer: SessionTimerHeaders::default(),
            replaces: None,
            rack: None,
            authorization: Vec::new(),
        })
    }

    /// Adopt the routing information of the response that confirms or
    /// creates an early dialog
    pub(crate) fn learn_route(&mut self, record_route: &[String], contact: Option<&String>) {
        if self.route_set.is_empty() && !record_route.is_empty() {
            // UAC side keeps the Record-Route in reverse order
            self.route_set = record_route.iter().rev().cloned().collect();
        }
        if let Some(contact) = contact {
            self.remote_contact = Some(contact.clone());
        }
    }

    pub fn initial_record(&self) -> Option<&InviteModify> {
        self.initial_invite.and_then(|h| self.invites.get(h.0))
    }

    pub(crate) fn initial_record_mut(&mut self) -> Option<&mut InviteModify> {
        let handle = self.initial_invite?;
        self.invites.get_mut(handle.0)
    }

    pub fn invite(&self, handle: InviteHandle) -> Option<&InviteModify> {
        self.invites.get(handle.0)
    }

    pub(crate) fn invite_mut(&mut self, handle: InviteHandle) -> Option<&mut InviteModify> {
        self.invites.get_mut(handle.0)
    }

    /// Record attached to a transaction
    pub fn invite_by_transaction(&self, tx: TransactionHandle) -> Option<InviteHandle> {
        self.invites
            .iter()
            .find(|(_, record)| record.transaction == Some(tx))
            .map(|(h, _)| InviteHandle(h))
    }

    /// The re-INVITE record currently in progress, if any
    pub fn reinvite_in_progress(&self) -> Option<InviteHandle> {
        self.invites
            .iter()
            .find(|(_, record)| record.is_active_reinvite())
            .map(|(h, _)| InviteHandle(h))
    }

    /// Modify state of the record bound to the active transaction
    pub fn active_modify_state(&self) -> Option<ModifyState> {
        let tx = self.active_transaction?;
        let handle = self.invite_by_transaction(tx)?;
        self.invite(handle)
            .filter(|record| !record.is_initial)
            .map(|record| record.state)
    }

    /// Add a re-INVITE record
    pub(crate) fn add_reinvite(&mut self) -> CallLegResult<InviteHandle> {
        let sequence = self.invite_sequence;
        let handle = self
            .invites
            .insert(InviteModify::new_reinvite(sequence))
            .map(InviteHandle)
            .ok_or_else(|| CallLegError::out_of_resources("no room for another invite record"))?;
        self.invite_sequence += 1;
        Ok(handle)
    }

    pub(crate) fn remove_invite(&mut self, handle: InviteHandle) -> Option<InviteModify> {
        if Some(handle) == self.initial_invite {
            return None;
        }
        self.invites.remove(handle.0)
    }

    /// Records ordered by creation
    pub fn invite_handles(&self) -> Vec<InviteHandle> {
        let mut handles: Vec<_> = self
            .invites
            .iter()
            .map(|(h, record)| (record.sequence, InviteHandle(h)))
            .collect();
        handles.sort_by_key(|(sequence, _)| *sequence);
        handles.into_iter().map(|(_, h)| h).collect()
    }

    /// Transactions still pending on the call-leg; completed INVITE
    /// transactions are left to finish on their own
    pub(crate) fn owned_transactions(&self) -> Vec<TransactionHandle> {
        let mut txs: Vec<TransactionHandle> = Vec::new();
        txs.extend(self.active_transaction);
        txs.extend(self.bye_transaction);
        txs.extend(self.incoming_bye);
        txs.extend(self.cancel_transaction);
        txs.extend(self.prack.prack_transaction());
        txs.extend(self.prack.incoming_prack());
        txs.extend(self.general.keys().copied());
        txs.extend(self.dns.transactions());
        txs.sort();
        txs.dedup();
        txs
    }

    pub fn info(&self) -> CallLegInfo {
        CallLegInfo {
            handle: self.handle,
            direction: self.direction,
            state: self.state,
            call_id: self.call_id.clone(),
            local_tag: self.local_tag().map(str::to_string),
            remote_tag: self.remote_tag().map(str::to_string),
            local_cseq: self.local_cseq,
            remote_cseq: self.remote_cseq,
            route_set: self.route_set.clone(),
            local_contact: self.local_contact.clone(),
            remote_contact: self.remote_contact.clone(),
            active_transaction: self.active_transaction,
            is_fork: self.is_fork(),
            forking_enabled: self.forking_enabled,
            owner: self.owner,
            termination_reason: self.termination_reason,
            created_at: self.created_at,
        }
    }
}
