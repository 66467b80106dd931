//! Re-INVITE handling policy
//!
//! The manager is configured once with an [`InviteHandlingMode`] and turns it
//! into an [`InvitePolicy`]. Operations ask the policy instead of checking the
//! mode themselves.

use serde::{Deserialize, Serialize};

use crate::callleg::CallLegState;

/// How re-INVITEs are tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InviteHandlingMode {
    /// Every re-INVITE has its own record kept for the life of the call-leg
    #[default]
    Current,
    /// Re-INVITE progress is folded back into the call-leg: only Connected
    /// accepts and acknowledges re-INVITEs and completed records are discarded
    Legacy,
}

/// Legality rules that differ between the two handling modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvitePolicy {
    mode: InviteHandlingMode,
}

impl InvitePolicy {
    pub fn new(mode: InviteHandlingMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> InviteHandlingMode {
        self.mode
    }

    /// Call-leg states in which a received re-INVITE may be accepted
    pub fn may_accept_reinvite(&self, state: CallLegState) -> bool {
        match self.mode {
            InviteHandlingMode::Current => state.is_established(),
            InviteHandlingMode::Legacy => state == CallLegState::Connected,
        }
    }

    /// Call-leg states in which `Ack` may be called
    pub fn may_ack(&self, state: CallLegState) -> bool {
        match self.mode {
            InviteHandlingMode::Current => state == CallLegState::RemoteAccepted,
            InviteHandlingMode::Legacy => {
                matches!(state, CallLegState::RemoteAccepted | CallLegState::Connected)
            }
        }
    }

    /// Whether `Ack` in Connected acknowledges a re-INVITE
    pub fn ack_covers_reinvite(&self) -> bool {
        self.mode == InviteHandlingMode::Legacy
    }

    /// Call-leg states in which a re-INVITE record may be created
    pub fn may_create_reinvite(&self, state: CallLegState) -> bool {
        match self.mode {
            InviteHandlingMode::Current => state.is_established(),
            InviteHandlingMode::Legacy => state == CallLegState::Connected,
        }
    }

    /// Whether finished re-INVITE records stay attached to the call-leg
    pub fn keeps_completed_records(&self) -> bool {
        self.mode == InviteHandlingMode::Current
    }
}
