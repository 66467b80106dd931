//! Call-leg states and state-change reasons

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of a call-leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallLegState {
    /// Created, nothing sent or received yet
    Idle,
    /// Initial INVITE sent, no response yet
    Inviting,
    /// 3xx received for the initial INVITE
    Redirected,
    /// 401/407 received for the initial INVITE
    Unauthenticated,
    /// 1xx received for the initial INVITE
    Proceeding,
    /// No final response arrived in time after a 1xx
    ProceedingTimeout,
    /// CANCEL sent for the initial INVITE, waiting for the 487
    Cancelling,
    /// Initial INVITE received, waiting for the application
    Offering,
    /// 2xx sent, waiting for ACK
    Accepted,
    /// 2xx received, ACK not sent yet
    RemoteAccepted,
    /// Session established
    Connected,
    /// BYE sent
    Disconnecting,
    /// Session over, waiting for cleanup
    Disconnected,
    /// CANCEL received for the initial INVITE
    Cancelled,
    /// Initial INVITE or BYE could not be delivered
    MsgSendFailure,
    /// Final state
    Terminated,
}

impl CallLegState {
    /// States in which an INVITE dialog is established
    pub fn is_established(self) -> bool {
        matches!(
            self,
            CallLegState::Connected | CallLegState::Accepted | CallLegState::RemoteAccepted
        )
    }

    /// Early states of an outgoing call-leg
    pub fn is_early_outgoing(self) -> bool {
        matches!(
            self,
            CallLegState::Inviting | CallLegState::Proceeding | CallLegState::ProceedingTimeout
        )
    }

    pub fn is_terminated(self) -> bool {
        self == CallLegState::Terminated
    }
}

impl fmt::Display for CallLegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Who created the call-leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Why a call-leg (or invite record) changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateChangeReason {
    Undefined,
    LocalInviting,
    RemoteInviting,
    LocalAccepted,
    RemoteAccepted,
    LocalAckSent,
    RemoteAckReceived,
    LocalRejected,
    RemoteRejected,
    RemoteProvisional,
    RemoteRedirected,
    AuthNeeded,
    LocalCancelling,
    LocalCancelled,
    RemoteCancelled,
    LocalDisconnecting,
    LocalDisconnected,
    RemoteDisconnected,
    LocalFailure,
    NetworkError,
    ServiceUnavailable,
    Timeout,
    DnsGiveUp,
    DnsResent,
    Forked1xxTimeout,
    SessionExpired,
    Restored,
    CallTerminated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_groups() {
        assert!(CallLegState::Accepted.is_established());
        assert!(!CallLegState::Offering.is_established());
        assert!(CallLegState::ProceedingTimeout.is_early_outgoing());
        assert!(!CallLegState::Cancelling.is_early_outgoing());
        assert_eq!(CallLegState::RemoteAccepted.to_string(), "RemoteAccepted");
    }
}
