//! Session timer negotiation (RFC 4028)
//!
//! A [`SessionTimerNegotiator`] keeps two things apart:
//!
//! - the **preference** of the call-leg (Session-Expires, Min-SE, refresher
//!   preference) set by configuration or by the application
//! - the **negotiated** values agreed in the last successful INVITE/UPDATE
//!   exchange, which may differ from the preference
//!
//! ## Negotiation Rules
//!
//! - UAS: a Session-Expires below the local Min-SE is answered with 422 and
//!   the local Min-SE. Otherwise the interval may be lowered to the local
//!   preference, never below the request's Min-SE.
//! - UAC: a 2xx carrying Session-Expires sets the interval and refresher. A
//!   2xx without it means the peer does not support timers; the local side
//!   then refreshes on its own. A 422 raises the Min-SE used for the next try.
//!
//! ## Timers
//!
//! - local refresher: the refresh alert fires `session_expires - alert_time`
//!   seconds after negotiation, or at half the interval when no alert time fits
//! - remote refresher: the session expires `session_expires - min(32, session_expires/3)`
//!   seconds after the last refresh

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{RefreshMethod, SessionTimerDefaults};
use crate::errors::{CallLegError, CallLegResult};
use crate::message::{RefresherRole, SessionTimerHeaders};
use crate::transaction::TimerKind;

/// Lowest Min-SE allowed by RFC 4028
pub const RFC_MIN_SE: u32 = 90;

/// Seconds before expiry at which a session without refresh is torn down
const EXPIRY_PRECEDER: u32 = 32;

/// Which side the call-leg would like to refresh the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RefresherPreference {
    #[default]
    DontCare,
    Local,
    Remote,
}

/// Which side refreshes the session after negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefresherType {
    None,
    Local,
    Remote,
}

/// Session timer preference of a call-leg or of one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTimerParams {
    /// Seconds; 0 disables session timers
    pub session_expires: u32,
    pub min_se: u32,
    pub refresher: RefresherPreference,
}

impl SessionTimerParams {
    pub fn new(session_expires: u32, min_se: u32, refresher: RefresherPreference) -> Self {
        Self {
            session_expires,
            min_se,
            refresher,
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, RFC_MIN_SE, RefresherPreference::DontCare)
    }

    pub fn is_enabled(&self) -> bool {
        self.session_expires != 0
    }

    pub fn validate(&self) -> CallLegResult<()> {
        if self.is_enabled() && self.min_se > self.session_expires {
            return Err(CallLegError::bad_param(format!(
                "min-SE {} is larger than session-expires {}",
                self.min_se, self.session_expires
            )));
        }
        Ok(())
    }
}

/// Values agreed for the current session interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedTimer {
    pub session_expires: u32,
    pub min_se: u32,
    pub refresher: RefresherType,
}

/// Reported to the application through `SessionTimerNegotiationFault`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationFault {
    /// 422 received; the next attempt must use at least this interval
    SessionExpiresTooSmall { required_min_se: u32 },
    /// The 2xx did not carry Session-Expires
    RemoteNotSupported,
    /// The peer picked the other refresher
    RefresherPreferenceRejected,
}

/// What to do with a received INVITE/UPDATE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestVerdict {
    /// Session timers do not apply to this exchange
    NotUsed,
    /// Answer 2xx with these values once the application accepts
    Accept(NegotiatedTimer),
    /// Answer 422 carrying this Min-SE
    TooSmall { min_se: u32 },
}

/// Per call-leg negotiation state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTimerNegotiator {
    preference: SessionTimerParams,
    alert_time: u32,
    negotiated: Option<NegotiatedTimer>,
    /// Negotiated on the UAS side, applied when the 2xx goes out
    pending: Option<NegotiatedTimer>,
    /// Highest Min-SE learnt from the peer (requests and 422 responses)
    remote_min_se: u32,
    auto_refresh: bool,
    refresh_method: RefreshMethod,
}

impl SessionTimerNegotiator {
    pub fn new(defaults: &SessionTimerDefaults) -> Self {
        Self {
            preference: SessionTimerParams::new(
                defaults.session_expires,
                defaults.min_se,
                defaults.refresher,
            ),
            alert_time: defaults.alert_time,
            negotiated: None,
            pending: None,
            remote_min_se: 0,
            auto_refresh: defaults.auto_refresh,
            refresh_method: defaults.refresh_method,
        }
    }

    pub fn auto_refresh(&self) -> bool {
        self.auto_refresh
    }

    pub fn refresh_method(&self) -> RefreshMethod {
        self.refresh_method
    }

    pub fn preference(&self) -> &SessionTimerParams {
        &self.preference
    }

    pub fn negotiated(&self) -> Option<NegotiatedTimer> {
        self.negotiated
    }

    pub fn is_enabled(&self) -> bool {
        self.preference.is_enabled()
    }

    /// Replace the preference. A session-expires of 0 disables timers and
    /// drops the negotiated values; the caller stops the running timer.
    pub fn set_preference(&mut self, params: SessionTimerParams) -> CallLegResult<()> {
        params.validate()?;
        self.preference = params;
        if !params.is_enabled() {
            self.negotiated = None;
            self.pending = None;
        }
        Ok(())
    }

    pub fn set_alert_time(&mut self, alert_time: u32) {
        self.alert_time = alert_time;
    }

    /// Forget the negotiated interval; the next refresh negotiates again
    pub fn stop(&mut self) {
        self.negotiated = None;
        self.pending = None;
    }

    fn effective<'a>(&'a self, local: Option<&'a SessionTimerParams>) -> &'a SessionTimerParams {
        local.unwrap_or(&self.preference)
    }

    /// Headers for an outgoing INVITE or UPDATE
    pub fn request_headers(&self, local: Option<&SessionTimerParams>) -> SessionTimerHeaders {
        let params = self.effective(local);
        if !params.is_enabled() {
            return SessionTimerHeaders {
                supported: true,
                ..Default::default()
            };
        }

        let min_se = params.min_se.max(self.remote_min_se);
        let session_expires = params.session_expires.max(min_se);
        let refresher = match params.refresher {
            RefresherPreference::Local => Some(RefresherRole::Uac),
            RefresherPreference::Remote => Some(RefresherRole::Uas),
            RefresherPreference::DontCare => None,
        };

        SessionTimerHeaders {
            session_expires: Some(session_expires),
            refresher,
            min_se: Some(min_se),
            supported: true,
            required: false,
        }
    }

    /// Evaluate a received INVITE/UPDATE (local side is the UAS)
    pub fn on_request(
        &mut self,
        headers: &SessionTimerHeaders,
        local: Option<&SessionTimerParams>,
    ) -> RequestVerdict {
        let params = *self.effective(local);
        if let Some(remote_min) = headers.min_se {
            self.remote_min_se = self.remote_min_se.max(remote_min);
        }
        if !params.is_enabled() {
            return RequestVerdict::NotUsed;
        }

        let negotiated = match headers.session_expires {
            Some(requested) => {
                if requested < params.min_se {
                    debug!(
                        "Session-Expires {} below local Min-SE {}, answering 422",
                        requested, params.min_se
                    );
                    return RequestVerdict::TooSmall {
                        min_se: params.min_se,
                    };
                }

                let floor = headers.min_se.unwrap_or(RFC_MIN_SE).max(params.min_se);
                let session_expires = if params.session_expires < requested && params.session_expires >= floor {
                    params.session_expires
                } else {
                    requested
                };

                let refresher = match headers.refresher {
                    Some(RefresherRole::Uac) => RefresherType::Remote,
                    Some(RefresherRole::Uas) => RefresherType::Local,
                    None => match params.refresher {
                        RefresherPreference::Local => RefresherType::Local,
                        _ if headers.supported => RefresherType::Remote,
                        _ => RefresherType::Local,
                    },
                };

                NegotiatedTimer {
                    session_expires,
                    min_se: floor,
                    refresher,
                }
            }
            None => {
                // The peer did not ask; insert our own interval
                let refresher = if headers.supported && params.refresher == RefresherPreference::Remote {
                    RefresherType::Remote
                } else {
                    RefresherType::Local
                };
                let min_se = params.min_se.max(self.remote_min_se);
                NegotiatedTimer {
                    session_expires: params.session_expires.max(min_se),
                    min_se,
                    refresher,
                }
            }
        };

        self.pending = Some(negotiated);
        RequestVerdict::Accept(negotiated)
    }

    /// Headers for our 2xx to an INVITE/UPDATE negotiated by [`on_request`](Self::on_request)
    pub fn response_headers(&self) -> SessionTimerHeaders {
        match self.pending {
            Some(pending) => SessionTimerHeaders {
                session_expires: Some(pending.session_expires),
                refresher: Some(match pending.refresher {
                    RefresherType::Remote => RefresherRole::Uac,
                    _ => RefresherRole::Uas,
                }),
                min_se: None,
                supported: true,
                required: pending.refresher == RefresherType::Remote,
            },
            None => SessionTimerHeaders {
                supported: true,
                ..Default::default()
            },
        }
    }

    /// Headers for a 422 answer
    pub fn too_small_headers(min_se: u32) -> SessionTimerHeaders {
        SessionTimerHeaders {
            min_se: Some(min_se),
            supported: true,
            ..Default::default()
        }
    }

    /// Our 2xx went out: the pending values become the negotiated ones
    pub fn commit_pending(&mut self) -> Option<NegotiatedTimer> {
        if let Some(pending) = self.pending.take() {
            self.negotiated = Some(pending);
        }
        self.negotiated
    }

    /// The pending values were never used (exchange rejected)
    pub fn discard_pending(&mut self) {
        self.pending = None;
    }

    /// A 2xx arrived for our INVITE/UPDATE (local side is the UAC)
    pub fn on_success_response(
        &mut self,
        headers: &SessionTimerHeaders,
        local: Option<&SessionTimerParams>,
    ) -> (Option<NegotiatedTimer>, Option<NegotiationFault>) {
        let params = *self.effective(local);
        if !params.is_enabled() {
            return (None, None);
        }

        let requested = self.request_headers(Some(&params));
        let requested_se = requested.session_expires.unwrap_or(params.session_expires);
        let min_se = requested.min_se.unwrap_or(params.min_se);

        let (negotiated, fault) = match headers.session_expires {
            Some(granted) => {
                let session_expires = if granted < min_se {
                    warn!(
                        "Granted Session-Expires {} is below local Min-SE {}, keeping {}",
                        granted, min_se, requested_se
                    );
                    requested_se
                } else {
                    granted
                };
                let refresher = match headers.refresher {
                    Some(RefresherRole::Uas) => RefresherType::Remote,
                    _ => RefresherType::Local,
                };
                let fault = match (params.refresher, refresher) {
                    (RefresherPreference::Local, RefresherType::Remote)
                    | (RefresherPreference::Remote, RefresherType::Local) => {
                        Some(NegotiationFault::RefresherPreferenceRejected)
                    }
                    _ => None,
                };
                (
                    NegotiatedTimer {
                        session_expires,
                        min_se,
                        refresher,
                    },
                    fault,
                )
            }
            None => (
                NegotiatedTimer {
                    session_expires: requested_se,
                    min_se,
                    refresher: RefresherType::Local,
                },
                Some(NegotiationFault::RemoteNotSupported),
            ),
        };

        self.negotiated = Some(negotiated);
        (Some(negotiated), fault)
    }

    /// A 422 arrived; raise the floor for the next attempt
    pub fn on_too_small(&mut self, headers: &SessionTimerHeaders) -> NegotiationFault {
        if let Some(min_se) = headers.min_se {
            self.remote_min_se = self.remote_min_se.max(min_se);
        }
        NegotiationFault::SessionExpiresTooSmall {
            required_min_se: self.remote_min_se.max(self.preference.min_se),
        }
    }

    /// Timer to arm for the current negotiated interval
    pub fn next_timer(&self) -> Option<(TimerKind, Duration)> {
        let negotiated = self.negotiated?;
        let se = negotiated.session_expires;
        if se == 0 {
            return None;
        }

        match negotiated.refresher {
            RefresherType::Local => {
                let after = if self.alert_time > 0 && self.alert_time < se {
                    se - self.alert_time
                } else {
                    se / 2
                };
                Some((TimerKind::SessionRefresh, Duration::from_secs(u64::from(after))))
            }
            RefresherType::Remote => {
                let after = se - EXPIRY_PRECEDER.min(se / 3);
                Some((TimerKind::SessionExpiry, Duration::from_secs(u64::from(after))))
            }
            RefresherType::None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiator() -> SessionTimerNegotiator {
        SessionTimerNegotiator::new(&SessionTimerDefaults::default())
    }

    #[test]
    fn test_invalid_preference_leaves_previous() {
        let mut st = negotiator();
        let before = *st.preference();
        let err = st
            .set_preference(SessionTimerParams::new(100, 200, RefresherPreference::Local))
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::BadParam);
        assert_eq!(*st.preference(), before);
    }

    #[test]
    fn test_disable_and_reenable() {
        let mut st = negotiator();
        st.negotiated = Some(NegotiatedTimer {
            session_expires: 1800,
            min_se: 90,
            refresher: RefresherType::Local,
        });
        st.set_preference(SessionTimerParams::new(0, 500, RefresherPreference::DontCare))
            .unwrap();
        assert!(!st.is_enabled());
        assert!(st.negotiated().is_none());
        assert!(st.next_timer().is_none());

        st.set_preference(SessionTimerParams::new(600, 90, RefresherPreference::Local))
            .unwrap();
        assert!(st.is_enabled());
    }

    #[test]
    fn test_uas_rejects_small_interval() {
        let mut st = negotiator();
        let headers = SessionTimerHeaders {
            session_expires: Some(60),
            supported: true,
            ..Default::default()
        };
        assert_eq!(st.on_request(&headers, None), RequestVerdict::TooSmall { min_se: 90 });
    }

    #[test]
    fn test_uas_lowers_to_preference() {
        let mut st = negotiator();
        st.set_preference(SessionTimerParams::new(900, 90, RefresherPreference::DontCare))
            .unwrap();
        let headers = SessionTimerHeaders {
            session_expires: Some(3600),
            min_se: Some(120),
            supported: true,
            ..Default::default()
        };
        let RequestVerdict::Accept(negotiated) = st.on_request(&headers, None) else {
            panic!("expected accept");
        };
        assert_eq!(negotiated.session_expires, 900);
        assert_eq!(negotiated.refresher, RefresherType::Remote);

        let response = st.response_headers();
        assert_eq!(response.refresher, Some(RefresherRole::Uac));
        assert!(response.required);
        assert_eq!(st.commit_pending(), Some(negotiated));
    }

    #[test]
    fn test_uac_without_remote_support() {
        let mut st = negotiator();
        let (negotiated, fault) = st.on_success_response(&SessionTimerHeaders::default(), None);
        assert_eq!(fault, Some(NegotiationFault::RemoteNotSupported));
        assert_eq!(negotiated.unwrap().refresher, RefresherType::Local);
        assert_eq!(negotiated.unwrap().session_expires, 1800);
    }

    #[test]
    fn test_422_raises_floor() {
        let mut st = negotiator();
        let fault = st.on_too_small(&SessionTimerHeaders {
            min_se: Some(3600),
            ..Default::default()
        });
        assert_eq!(
            fault,
            NegotiationFault::SessionExpiresTooSmall { required_min_se: 3600 }
        );
        let headers = st.request_headers(None);
        assert_eq!(headers.session_expires, Some(3600));
        assert_eq!(headers.min_se, Some(3600));
    }

    #[test]
    fn test_override_does_not_touch_preference() {
        let mut st = negotiator();
        let local = SessionTimerParams::new(300, 90, RefresherPreference::Remote);
        let headers = st.request_headers(Some(&local));
        assert_eq!(headers.session_expires, Some(300));
        assert_eq!(headers.refresher, Some(RefresherRole::Uas));
        assert_eq!(st.preference().session_expires, 1800);

        let (negotiated, fault) = st.on_success_response(
            &SessionTimerHeaders {
                session_expires: Some(300),
                refresher: Some(RefresherRole::Uas),
                ..Default::default()
            },
            Some(&local),
        );
        assert_eq!(fault, None);
        assert_eq!(negotiated.unwrap().refresher, RefresherType::Remote);
    }

    #[test]
    fn test_timer_schedule() {
        let mut st = negotiator();
        st.set_alert_time(0);
        st.negotiated = Some(NegotiatedTimer {
            session_expires: 1800,
            min_se: 90,
            refresher: RefresherType::Local,
        });
        assert_eq!(
            st.next_timer(),
            Some((TimerKind::SessionRefresh, Duration::from_secs(900)))
        );

        st.set_alert_time(60);
        assert_eq!(
            st.next_timer(),
            Some((TimerKind::SessionRefresh, Duration::from_secs(1740)))
        );

        st.negotiated = Some(NegotiatedTimer {
            session_expires: 90,
            min_se: 90,
            refresher: RefresherType::Remote,
        });
        assert_eq!(
            st.next_timer(),
            Some((TimerKind::SessionExpiry, Duration::from_secs(60)))
        );
    }
}
