//! Reliable provisional responses (RFC 3262)
//!
//! One [`PrackStateMachine`] per call-leg tracks both directions:
//!
//! ```text
//!  UAC:  Idle ─▶ RelProvResponseRcvd ─▶ PrackSent ─▶ PrackFinalResponseRcvd
//!                       ▲                                   │ 401/407, retry
//!                       └────────────── SendPrack ◀─────────┘
//!
//!  UAS:  Idle ─▶ PrackRcvd ─▶ PrackFinalResponseSent
//! ```
//!
//! On the UAS side only one reliable provisional may be unacknowledged at a
//! time; RSeq values increase by one per reliable provisional.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{CallLegError, CallLegResult};
use crate::message::{Method, RAck};
use crate::transaction::TransactionHandle;

/// PRACK handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrackState {
    Idle,
    RelProvResponseRcvd,
    PrackSent,
    PrackFinalResponseRcvd,
    PrackRcvd,
    PrackFinalResponseSent,
}

/// How a received reliable provisional relates to the ones before it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionalOrder {
    New,
    Retransmission,
    OutOfOrder,
}

#[derive(Debug, Clone)]
pub struct PrackStateMachine {
    state: PrackState,
    last_rseq_received: Option<u32>,
    pending_rack: Option<RAck>,
    prack_transaction: Option<TransactionHandle>,
    next_rseq: u32,
    unacknowledged_rseq: Option<u32>,
    incoming_prack: Option<TransactionHandle>,
}

impl Default for PrackStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PrackStateMachine {
    pub fn new() -> Self {
        // RFC 3262: the first RSeq is chosen between 1 and 2**31 - 1
        let first = rand::thread_rng().gen_range(1..(1u32 << 31));
        Self::with_initial_rseq(first)
    }

    pub fn with_initial_rseq(first: u32) -> Self {
        Self {
            state: PrackState::Idle,
            last_rseq_received: None,
            pending_rack: None,
            prack_transaction: None,
            next_rseq: first,
            unacknowledged_rseq: None,
            incoming_prack: None,
        }
    }

    pub fn state(&self) -> PrackState {
        self.state
    }

    pub fn prack_transaction(&self) -> Option<TransactionHandle> {
        self.prack_transaction
    }

    pub fn incoming_prack(&self) -> Option<TransactionHandle> {
        self.incoming_prack
    }

    pub fn unacknowledged_rseq(&self) -> Option<u32> {
        self.unacknowledged_rseq
    }

    /// A reliable 1xx arrived for the INVITE with `cseq`
    pub fn on_reliable_provisional(&mut self, rseq: u32, cseq: u32) -> ProvisionalOrder {
        if let Some(last) = self.last_rseq_received {
            if rseq <= last {
                return ProvisionalOrder::Retransmission;
            }
            if rseq != last.wrapping_add(1) {
                return ProvisionalOrder::OutOfOrder;
            }
        }

        self.last_rseq_received = Some(rseq);
        self.pending_rack = Some(RAck {
            rseq,
            cseq,
            method: Method::Invite,
        });
        self.state = PrackState::RelProvResponseRcvd;
        ProvisionalOrder::New
    }

    pub fn can_send_prack(&self) -> bool {
        matches!(
            self.state,
            PrackState::RelProvResponseRcvd | PrackState::PrackFinalResponseRcvd
        )
    }

    /// RAck to place in the next PRACK
    pub fn rack_for_prack(&self) -> CallLegResult<RAck> {
        if !self.can_send_prack() {
            return Err(CallLegError::illegal_action("send_prack", self.state));
        }
        self.pending_rack
            .clone()
            .ok_or_else(|| CallLegError::illegal_action("send_prack", self.state))
    }

    pub fn on_prack_sent(&mut self, tx: TransactionHandle) {
        self.prack_transaction = Some(tx);
        self.state = PrackState::PrackSent;
    }

    /// Final response for our PRACK; returns false when `tx` is not our PRACK
    pub fn on_prack_final_response(&mut self, tx: TransactionHandle) -> bool {
        if self.prack_transaction != Some(tx) {
            return false;
        }
        self.state = PrackState::PrackFinalResponseRcvd;
        true
    }

    /// Reserve the RSeq of a reliable provisional about to be sent
    pub fn reserve_rseq(&mut self) -> CallLegResult<u32> {
        if self.unacknowledged_rseq.is_some() {
            return Err(CallLegError::illegal_action(
                "provisional_response_reliable",
                "unacknowledged reliable provisional",
            ));
        }
        let rseq = self.next_rseq;
        self.next_rseq = self.next_rseq.wrapping_add(1);
        self.unacknowledged_rseq = Some(rseq);
        Ok(rseq)
    }

    /// Undo a reservation whose provisional could not be sent
    pub fn release_rseq(&mut self, rseq: u32) {
        if self.unacknowledged_rseq == Some(rseq) {
            self.unacknowledged_rseq = None;
            self.next_rseq = rseq;
        }
    }

    /// A PRACK arrived; returns false when its RAck does not match
    pub fn on_prack_received(&mut self, tx: TransactionHandle, rack: &RAck) -> bool {
        if self.unacknowledged_rseq != Some(rack.rseq) {
            return false;
        }
        self.incoming_prack = Some(tx);
        self.state = PrackState::PrackRcvd;
        true
    }

    pub fn can_send_prack_response(&self) -> bool {
        self.state == PrackState::PrackRcvd
    }

    /// The application answered the PRACK; a 2xx acknowledges the provisional
    pub fn on_prack_response_sent(&mut self, status: u16) -> Option<TransactionHandle> {
        if (200..300).contains(&status) {
            self.unacknowledged_rseq = None;
        }
        self.state = PrackState::PrackFinalResponseSent;
        self.incoming_prack.take()
    }

    /// The INVITE exchange ended; unacknowledged provisionals no longer matter
    pub fn on_invite_completed(&mut self) {
        self.unacknowledged_rseq = None;
        self.pending_rack = None;
        self.prack_transaction = None;
        self.incoming_prack = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uac_flow() {
        let mut prack = PrackStateMachine::with_initial_rseq(1);
        assert!(!prack.can_send_prack());
        assert!(prack.rack_for_prack().is_err());

        assert_eq!(prack.on_reliable_provisional(10, 1), ProvisionalOrder::New);
        let rack = prack.rack_for_prack().unwrap();
        assert_eq!(rack.rseq, 10);
        assert_eq!(rack.cseq, 1);

        let tx = TransactionHandle::new(5);
        prack.on_prack_sent(tx);
        assert!(!prack.can_send_prack());
        assert!(!prack.on_prack_final_response(TransactionHandle::new(6)));
        assert!(prack.on_prack_final_response(tx));

        // re-sending after a challenge is allowed
        assert!(prack.can_send_prack());
    }

    #[test]
    fn test_uac_ordering() {
        let mut prack = PrackStateMachine::with_initial_rseq(1);
        assert_eq!(prack.on_reliable_provisional(10, 1), ProvisionalOrder::New);
        assert_eq!(prack.on_reliable_provisional(10, 1), ProvisionalOrder::Retransmission);
        assert_eq!(prack.on_reliable_provisional(12, 1), ProvisionalOrder::OutOfOrder);
        assert_eq!(prack.on_reliable_provisional(11, 1), ProvisionalOrder::New);
    }

    #[test]
    fn test_uas_single_outstanding() {
        let mut prack = PrackStateMachine::with_initial_rseq(100);
        assert_eq!(prack.reserve_rseq().unwrap(), 100);
        assert!(prack.reserve_rseq().is_err());

        let rack = RAck { rseq: 99, cseq: 1, method: Method::Invite };
        assert!(!prack.on_prack_received(TransactionHandle::new(1), &rack));

        let rack = RAck { rseq: 100, cseq: 1, method: Method::Invite };
        assert!(prack.on_prack_received(TransactionHandle::new(1), &rack));
        assert!(prack.can_send_prack_response());
        assert_eq!(prack.on_prack_response_sent(200), Some(TransactionHandle::new(1)));
        assert_eq!(prack.state(), PrackState::PrackFinalResponseSent);
        assert_eq!(prack.reserve_rseq().unwrap(), 101);
    }

    #[test]
    fn test_release_rseq() {
        let mut prack = PrackStateMachine::with_initial_rseq(7);
        let rseq = prack.reserve_rseq().unwrap();
        prack.release_rseq(rseq);
        assert_eq!(prack.reserve_rseq().unwrap(), 7);
    }
}
