//! INVITE attempt records ("modify" state machine)
//!
//! Every INVITE sent or received on a call-leg gets an [`InviteModify`]
//! record: the initial INVITE and each re-INVITE. The initial record follows
//! the call-leg's own state; re-INVITE records carry their own
//! [`ModifyState`]:
//!
//! ```text
//!  outgoing:  Idle ─▶ ReinviteSent ─▶ ReinviteProceeding ─▶ ReinviteRemoteAccepted ─▶ AckSent
//!                          │                 │ CANCEL
//!                          │                 └─▶ ReinviteCancelling ─▶ Idle (487)
//!                          └─▶ Idle (non-2xx final)
//!
//!  incoming:  ReinviteRcvd ─▶ ReinviteAccepted ─▶ AckRcvd
//!                  │ CANCEL       └─▶ Terminated (rejected)
//!                  └─▶ ReinviteCancelled ─▶ Terminated (rejected)
//! ```
//!
//! Only one record may be in progress at a time.

pub mod policy;

use serde::{Deserialize, Serialize};

use crate::message::Rel100Status;
use crate::session_timer::SessionTimerParams;
use crate::transaction::TransactionHandle;

pub use policy::{InviteHandlingMode, InvitePolicy};

/// State of one re-INVITE attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModifyState {
    Idle,
    ReinviteSent,
    ReinviteRcvd,
    ReinviteProceeding,
    ReinviteProceedingTimeout,
    ReinviteAccepted,
    ReinviteRemoteAccepted,
    ReinviteCancelled,
    ReinviteCancelling,
    AckSent,
    AckRcvd,
    MsgSendFailure,
    Terminated,
}

impl ModifyState {
    /// Whether an INVITE exchange is still open on this record
    pub fn is_in_progress(self) -> bool {
        !matches!(
            self,
            ModifyState::Idle | ModifyState::AckSent | ModifyState::AckRcvd | ModifyState::Terminated
        )
    }

    /// Re-INVITE received and waiting for the application (or already cancelled)
    pub fn is_received_or_cancelled(self) -> bool {
        matches!(self, ModifyState::ReinviteRcvd | ModifyState::ReinviteCancelled)
    }

    pub fn is_proceeding(self) -> bool {
        matches!(
            self,
            ModifyState::ReinviteProceeding | ModifyState::ReinviteProceedingTimeout
        )
    }
}

/// Record of one INVITE attempt
#[derive(Debug, Clone)]
pub struct InviteModify {
    pub(crate) transaction: Option<TransactionHandle>,
    pub(crate) state: ModifyState,
    pub(crate) is_initial: bool,
    pub(crate) app_handle: Option<u64>,
    pub(crate) sequence: u32,
    pub(crate) cseq: Option<u32>,
    /// What the INVITE said about 100rel (incoming only)
    pub(crate) remote_100rel: Rel100Status,
    /// Session timer values to use for this exchange instead of the call-leg's preference
    pub(crate) session_override: Option<SessionTimerParams>,
    /// A 2xx was answered with our ACK; used to re-send the ACK on a retransmitted 2xx
    pub(crate) ack_sent: bool,
}

impl InviteModify {
    pub fn new_initial(sequence: u32) -> Self {
        Self::new(sequence, true)
    }

    pub fn new_reinvite(sequence: u32) -> Self {
        Self::new(sequence, false)
    }

    fn new(sequence: u32, is_initial: bool) -> Self {
        Self {
            transaction: None,
            state: ModifyState::Idle,
            is_initial,
            app_handle: None,
            sequence,
            cseq: None,
            remote_100rel: Rel100Status::Undefined,
            session_override: None,
            ack_sent: false,
        }
    }

    pub fn state(&self) -> ModifyState {
        self.state
    }

    pub fn is_initial(&self) -> bool {
        self.is_initial
    }

    pub fn transaction(&self) -> Option<TransactionHandle> {
        self.transaction
    }

    pub fn app_handle(&self) -> Option<u64> {
        self.app_handle
    }

    /// Whether this record is the in-progress re-INVITE
    pub fn is_active_reinvite(&self) -> bool {
        !self.is_initial && self.state.is_in_progress()
    }
}
