//! High-availability store and restore of connected call-legs
//!
//! A Connected call-leg can be written into an opaque buffer on one instance
//! and rebuilt on another. The buffer is JSON with a version number; it is an
//! internal format and only guaranteed to be readable by the same version.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::callleg::{CallLeg, CallLegState, Direction};
use crate::errors::{check_cseq, CallLegError, CallLegResult};
use crate::message::NameAddr;
use crate::session_timer::SessionTimerNegotiator;

/// Current buffer layout version
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Persisted part of a connected call-leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCallLeg {
    pub version: u32,
    pub direction: Direction,
    pub call_id: String,
    pub from: NameAddr,
    pub to: NameAddr,
    pub local_cseq: Option<u32>,
    pub remote_cseq: Option<u32>,
    pub route_set: Vec<String>,
    pub local_contact: Option<String>,
    pub remote_contact: Option<String>,
    pub outbound_proxy: Option<String>,
    pub forking_enabled: bool,
    #[serde(default)]
    pub session_timer: Option<StoredSessionTimer>,
    pub stored_at: DateTime<Utc>,
}

/// Negotiated session timer, restored without its running timers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSessionTimer {
    pub negotiator: serde_json::Value,
}

impl StoredCallLeg {
    /// Capture a call-leg; the caller has checked it is Connected
    pub fn capture(leg: &CallLeg) -> CallLegResult<Self> {
        let missing = |what: &str| CallLegError::bad_param(format!("connected call-leg has no {what}"));
        let session_timer = leg
            .session_timer
            .as_ref()
            .map(|st| {
                serde_json::to_value(st)
                    .map(|negotiator| StoredSessionTimer { negotiator })
                    .map_err(|e| CallLegError::unknown(format!("session timer encoding failed: {e}")))
            })
            .transpose()?;

        Ok(Self {
            version: STORE_FORMAT_VERSION,
            direction: leg.direction,
            call_id: leg.call_id.clone().ok_or_else(|| missing("Call-ID"))?,
            from: leg.from.clone().ok_or_else(|| missing("From"))?,
            to: leg.to.clone().ok_or_else(|| missing("To"))?,
            local_cseq: leg.local_cseq,
            remote_cseq: leg.remote_cseq,
            route_set: leg.route_set.clone(),
            local_contact: leg.local_contact.clone(),
            remote_contact: leg.remote_contact.clone(),
            outbound_proxy: leg.outbound_proxy.clone(),
            forking_enabled: leg.forking_enabled,
            session_timer,
            stored_at: Utc::now(),
        })
    }

    pub fn encode(&self) -> CallLegResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| CallLegError::unknown(format!("store encoding failed: {e}")))
    }

    pub fn decode(buffer: &[u8]) -> CallLegResult<Self> {
        let stored: StoredCallLeg = serde_json::from_slice(buffer)
            .map_err(|e| CallLegError::bad_param(format!("malformed call-leg buffer: {e}")))?;
        if stored.version != STORE_FORMAT_VERSION {
            return Err(CallLegError::bad_param(format!(
                "unsupported call-leg buffer version {}",
                stored.version
            )));
        }
        if let Some(cseq) = stored.local_cseq {
            check_cseq(cseq)?;
        }
        if stored.from.tag.is_none() || stored.to.tag.is_none() {
            return Err(CallLegError::bad_param("stored call-leg is missing a tag"));
        }
        Ok(stored)
    }

    /// Write the stored fields into an Idle call-leg; the caller moves it to Connected
    pub fn apply(self, leg: &mut CallLeg) -> CallLegResult<()> {
        let session_timer = match self.session_timer {
            Some(stored) => Some(
                serde_json::from_value::<SessionTimerNegotiator>(stored.negotiator)
                    .map_err(|e| CallLegError::bad_param(format!("malformed session timer: {e}")))?,
            ),
            None => None,
        };

        leg.direction = self.direction;
        leg.call_id = Some(self.call_id);
        leg.from = Some(self.from);
        leg.to = Some(self.to);
        leg.local_cseq = self.local_cseq;
        leg.remote_cseq = self.remote_cseq;
        leg.route_set = self.route_set;
        leg.local_contact = self.local_contact;
        leg.remote_contact = self.remote_contact;
        leg.outbound_proxy = self.outbound_proxy;
        leg.forking_enabled = self.forking_enabled;
        if session_timer.is_some() {
            leg.session_timer = session_timer;
        }
        leg.state_before_send = CallLegState::Connected;
        debug!(
            "Restored {} stored at {} (Call-ID {:?})",
            leg.handle(),
            self.stored_at,
            leg.call_id
        );
        Ok(())
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

    fn connected_leg() -> CallLeg {
        let mut leg = CallLeg::new_outgoing(handle(), true, None);
        leg.call_id = Some("abc@host".into());
        leg.from = Some(NameAddr::new("sip:alice@a.example").with_tag("l1"));
        leg.to = Some(NameAddr::new("sip:bob@b.example").with_tag("r1"));
        leg.local_cseq = Some(4);
        leg.remote_cseq = Some(9);
        leg.route_set = vec!["<sip:p1;lr>".into(), "<sip:p2;lr>".into()];
        leg.state = CallLegState::Connected;
        leg
    }

    #[test]
    fn test_store_restore_identity() {
        let leg = connected_leg();
        let buffer = StoredCallLeg::capture(&leg).unwrap().encode().unwrap();

        let mut restored = CallLeg::new_outgoing(handle(), false, None);
        StoredCallLeg::decode(&buffer).unwrap().apply(&mut restored).unwrap();

        assert_eq!(restored.call_id, leg.call_id);
        assert_eq!(restored.local_tag(), Some("l1"));
        assert_eq!(restored.remote_tag(), Some("r1"));
        assert_eq!(restored.local_cseq, Some(4));
        assert_eq!(restored.remote_cseq, Some(9));
        assert_eq!(restored.route_set, leg.route_set);
        assert_eq!(restored.state(), CallLegState::Idle);
    }

    #[test]
    fn test_rejects_garbage_and_versions() {
        assert!(StoredCallLeg::decode(b"not json").is_err());

        let mut stored = StoredCallLeg::capture(&connected_leg()).unwrap();
        stored.version = 99;
        let buffer = serde_json::to_vec(&stored).unwrap();
        let err = StoredCallLeg::decode(&buffer).unwrap_err();
        assert!(err.to_string().contains("version 99"));
    }

    #[test]
    fn test_rejects_out_of_range_cseq() {
        let mut stored = StoredCallLeg::capture(&connected_leg()).unwrap();
        stored.local_cseq = Some(u32::MAX);
        let buffer = serde_json::to_vec(&stored).unwrap();
        let err = StoredCallLeg::decode(&buffer).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::BadParam);
    }
}
