//! Configuration for the call-leg manager
//!
//! [`CallLegMgrConfig`] is handed to [`DialogManager::new`](crate::manager::DialogManager::new)
//! and is immutable afterwards. Every manager-wide behavior switch lives here:
//! re-INVITE handling mode, manual ACK/PRACK/BYE handling, REFER compatibility,
//! forking defaults, session timer defaults and the reentrancy table.
//!
//! ## Examples
//!
//! ```rust
//! use std::time::Duration;
//! use rvoip_call_leg_core::config::{CallLegMgrConfig, SessionTimerDefaults};
//! use rvoip_call_leg_core::invite::InviteHandlingMode;
//!
//! let config = CallLegMgrConfig::default()
//!     .with_max_call_legs(5000)
//!     .with_manual_ack(true)
//!     .with_invite_handling(InviteHandlingMode::Current)
//!     .with_forked_1xx_timeout(Duration::from_secs(64))
//!     .with_session_timer(SessionTimerDefaults::default());
//!
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{CallLegError, CallLegResult};
use crate::guard::ReentrancyPolicy;
use crate::invite::InviteHandlingMode;
use crate::session_timer::{RefresherPreference, SessionTimerParams, RFC_MIN_SE};

/// Method used to refresh a session whose refresher is the local side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RefreshMethod {
    #[default]
    Invite,
    Update,
}

/// Session timer values given to every new call-leg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTimerDefaults {
    /// Preferred Session-Expires in seconds (0 disables)
    pub session_expires: u32,

    /// Min-SE in seconds
    pub min_se: u32,

    /// Refresher preference
    pub refresher: RefresherPreference,

    /// Seconds before expiry at which the refresh alert fires
    pub alert_time: u32,

    /// Send the refresh automatically when the alert fires
    pub auto_refresh: bool,

    /// Request used for automatic refreshes
    pub refresh_method: RefreshMethod,
}

impl Default for SessionTimerDefaults {
    fn default() -> Self {
        Self {
            session_expires: 1800,
            min_se: RFC_MIN_SE,
            refresher: RefresherPreference::DontCare,
            alert_time: 32,
            auto_refresh: true,
            refresh_method: RefreshMethod::Invite,
        }
    }
}

impl SessionTimerDefaults {
    pub fn with_session_expires(mut self, seconds: u32) -> Self {
        self.session_expires = seconds;
        self
    }

    pub fn with_min_se(mut self, seconds: u32) -> Self {
        self.min_se = seconds;
        self
    }

    pub fn with_refresher(mut self, refresher: RefresherPreference) -> Self {
        self.refresher = refresher;
        self
    }

    pub fn with_alert_time(mut self, seconds: u32) -> Self {
        self.alert_time = seconds;
        self
    }

    pub fn with_auto_refresh(mut self, auto_refresh: bool) -> Self {
        self.auto_refresh = auto_refresh;
        self
    }

    pub fn with_refresh_method(mut self, method: RefreshMethod) -> Self {
        self.refresh_method = method;
        self
    }

    pub fn params(&self) -> SessionTimerParams {
        SessionTimerParams::new(self.session_expires, self.min_se, self.refresher)
    }
}

/// Manager-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallLegMgrConfig {
    /// Maximum number of simultaneous call-legs
    pub max_call_legs: usize,

    /// How re-INVITEs are tracked
    pub invite_handling: InviteHandlingMode,

    /// The application sends the ACK for a 2xx itself (`ack`)
    pub manual_ack: bool,

    /// The application sends PRACK and answers received PRACKs itself
    pub manual_prack: bool,

    /// The application answers received BYEs itself (`bye_accept` / `bye_reject`)
    pub manual_bye: bool,

    /// Call-legs created by REFER are plain call-legs connected with `connect`
    pub refer_compatibility: bool,

    /// Forking flag given to new outgoing call-legs
    pub forking_enabled: bool,

    /// Lifetime of a fork that received a 1xx but no 2xx (zero disables)
    pub forked_1xx_timeout: Duration,

    /// Advertise 100rel in outgoing INVITEs
    pub supported_100rel: bool,

    /// Release terminated call-legs without waiting for the owner to detach
    pub release_terminated: bool,

    /// Session timer defaults; `None` leaves new call-legs without a negotiator
    pub session_timer: Option<SessionTimerDefaults>,

    /// Operations blocked while given callbacks run
    pub reentrancy: ReentrancyPolicy,
}

impl Default for CallLegMgrConfig {
    fn default() -> Self {
        Self {
            max_call_legs: 1000,
            invite_handling: InviteHandlingMode::Current,
            manual_ack: false,
            manual_prack: false,
            manual_bye: false,
            refer_compatibility: false,
            forking_enabled: true,
            forked_1xx_timeout: Duration::from_secs(32),
            supported_100rel: true,
            release_terminated: true,
            session_timer: None,
            reentrancy: ReentrancyPolicy::default(),
        }
    }
}

impl CallLegMgrConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of simultaneous call-legs
    pub fn with_max_call_legs(mut self, max: usize) -> Self {
        self.max_call_legs = max;
        self
    }

    /// Select legacy or current re-INVITE handling
    pub fn with_invite_handling(mut self, mode: InviteHandlingMode) -> Self {
        self.invite_handling = mode;
        self
    }

    pub fn with_manual_ack(mut self, manual: bool) -> Self {
        self.manual_ack = manual;
        self
    }

    pub fn with_manual_prack(mut self, manual: bool) -> Self {
        self.manual_prack = manual;
        self
    }

    pub fn with_manual_bye(mut self, manual: bool) -> Self {
        self.manual_bye = manual;
        self
    }

    pub fn with_refer_compatibility(mut self, enabled: bool) -> Self {
        self.refer_compatibility = enabled;
        self
    }

    pub fn with_forking(mut self, enabled: bool) -> Self {
        self.forking_enabled = enabled;
        self
    }

    pub fn with_forked_1xx_timeout(mut self, timeout: Duration) -> Self {
        self.forked_1xx_timeout = timeout;
        self
    }

    pub fn with_supported_100rel(mut self, supported: bool) -> Self {
        self.supported_100rel = supported;
        self
    }

    /// Keep terminated call-legs until their owner detaches
    pub fn with_release_terminated(mut self, release: bool) -> Self {
        self.release_terminated = release;
        self
    }

    pub fn with_session_timer(mut self, defaults: SessionTimerDefaults) -> Self {
        self.session_timer = Some(defaults);
        self
    }

    pub fn with_reentrancy(mut self, policy: ReentrancyPolicy) -> Self {
        self.reentrancy = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> CallLegResult<()> {
        if self.max_call_legs == 0 {
            return Err(CallLegError::bad_param("max_call_legs must be greater than 0"));
        }

        if let Some(st) = &self.session_timer {
            st.params().validate()?;
            if st.min_se < RFC_MIN_SE {
                return Err(CallLegError::bad_param(format!(
                    "session timer min-SE {} is below {}",
                    st.min_se, RFC_MIN_SE
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = CallLegMgrConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.forking_enabled);
        assert!(config.release_terminated);
        assert!(config.session_timer.is_none());
    }

    #[test]
    fn test_invalid_configs() {
        assert!(CallLegMgrConfig::default().with_max_call_legs(0).validate().is_err());

        let st = SessionTimerDefaults::default().with_session_expires(100).with_min_se(200);
        assert!(CallLegMgrConfig::default().with_session_timer(st).validate().is_err());

        let st = SessionTimerDefaults::default().with_min_se(30);
        assert!(CallLegMgrConfig::default().with_session_timer(st).validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = CallLegMgrConfig::default()
            .with_manual_prack(true)
            .with_invite_handling(InviteHandlingMode::Legacy)
            .with_session_timer(SessionTimerDefaults::default().with_refresh_method(RefreshMethod::Update));
        let json = serde_json::to_string(&config).unwrap();
        let back: CallLegMgrConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
