//! Replaces header (RFC 3891) support
//!
//! Outgoing: a call-leg may carry a Replaces value into its initial INVITE.
//! The value is set either by the REFER path (from the Refer-To of the
//! triggering REFER) or by the application. Whichever write happened last is
//! the one sent; writing `None` suppresses the header.
//!
//! Incoming: an INVITE carrying Replaces is matched against the registry and
//! classified into a [`ReplacesMatch`] for the application to act on.

use serde::{Deserialize, Serialize};

use crate::arena::CallLegHandle;
use crate::callleg::{CallLegState, Direction};

/// Value of a Replaces header
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplacesHeader {
    pub call_id: String,
    pub to_tag: String,
    pub from_tag: String,
    pub early_only: bool,
}

impl ReplacesHeader {
    pub fn new(call_id: impl Into<String>, to_tag: impl Into<String>, from_tag: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            to_tag: to_tag.into(),
            from_tag: from_tag.into(),
            early_only: false,
        }
    }

    pub fn early_only(mut self) -> Self {
        self.early_only = true;
        self
    }
}

/// Who wrote the outbound Replaces value last
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplacesOrigin {
    Refer,
    Application,
}

/// Outbound Replaces slot of a call-leg
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundReplaces {
    value: Option<ReplacesHeader>,
    origin: Option<ReplacesOrigin>,
}

impl OutboundReplaces {
    pub fn set(&mut self, value: Option<ReplacesHeader>, origin: ReplacesOrigin) {
        self.value = value;
        self.origin = Some(origin);
    }

    pub fn value(&self) -> Option<&ReplacesHeader> {
        self.value.as_ref()
    }

    pub fn origin(&self) -> Option<ReplacesOrigin> {
        self.origin
    }

    pub fn clear(&mut self) {
        self.value = None;
        self.origin = None;
    }
}

/// Result of matching an incoming Replaces header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacesMatch {
    /// No dialog with this identity (answer 481)
    NotFound,
    /// The dialog exists and may be replaced
    Matched(CallLegHandle),
    /// `early-only` was requested but the dialog is already confirmed (answer 486)
    EarlyOnlyConfirmed(CallLegHandle),
    /// The dialog already ended (answer 603)
    Terminated(CallLegHandle),
}

/// Classify a candidate found by Call-ID and tags
pub fn classify(
    header: &ReplacesHeader,
    candidate: Option<(CallLegHandle, CallLegState, Direction)>,
) -> ReplacesMatch {
    let Some((handle, state, direction)) = candidate else {
        return ReplacesMatch::NotFound;
    };

    match state {
        CallLegState::Terminated | CallLegState::Disconnected => ReplacesMatch::Terminated(handle),
        CallLegState::Connected | CallLegState::Accepted | CallLegState::RemoteAccepted
            if header.early_only =>
        {
            ReplacesMatch::EarlyOnlyConfirmed(handle)
        }
        // An early dialog we initiated cannot be replaced by the remote side
        CallLegState::Inviting | CallLegState::Proceeding | CallLegState::ProceedingTimeout
            if direction == Direction::Outgoing =>
        {
            ReplacesMatch::NotFound
        }
        CallLegState::Idle => ReplacesMatch::NotFound,
        _ => ReplacesMatch::Matched(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Arena, CallLegHandle};

    fn handle() -> CallLegHandle {
        let mut arena = Arena::new();
        CallLegHandle(arena.insert(()).unwrap())
    }

    #[test]
    fn test_last_write_wins() {
        let mut slot = OutboundReplaces::default();
        slot.set(Some(ReplacesHeader::new("c", "t", "f")), ReplacesOrigin::Refer);
        assert_eq!(slot.origin(), Some(ReplacesOrigin::Refer));

        slot.set(None, ReplacesOrigin::Application);
        assert!(slot.value().is_none());
        assert_eq!(slot.origin(), Some(ReplacesOrigin::Application));
    }

    #[test]
    fn test_classify() {
        let h = handle();
        let header = ReplacesHeader::new("c", "t", "f");
        assert_eq!(classify(&header, None), ReplacesMatch::NotFound);
        assert_eq!(
            classify(&header, Some((h, CallLegState::Connected, Direction::Incoming))),
            ReplacesMatch::Matched(h)
        );
        assert_eq!(
            classify(&header.clone().early_only(), Some((h, CallLegState::Connected, Direction::Incoming))),
            ReplacesMatch::EarlyOnlyConfirmed(h)
        );
        assert_eq!(
            classify(&header, Some((h, CallLegState::Terminated, Direction::Incoming))),
            ReplacesMatch::Terminated(h)
        );
        assert_eq!(
            classify(&header, Some((h, CallLegState::Proceeding, Direction::Outgoing))),
            ReplacesMatch::NotFound
        );
        assert_eq!(
            classify(&header, Some((h, CallLegState::Offering, Direction::Incoming))),
            ReplacesMatch::Matched(h)
        );
    }
}
