//! Authentication bookkeeping for a call-leg
//!
//! Digest computation is done by the [`Authenticator`](crate::transaction::Authenticator)
//! collaborator. This module only keeps track of:
//!
//! - the challenges received in 401/407 responses (client side), stored in an
//!   ordered [`AuthObjectList`] until the application calls `authenticate`
//! - the credentials found in a received request while the application walks
//!   them with `auth_begin`/`auth_proceed` (server side)

use serde::{Deserialize, Serialize};

use crate::transaction::TransactionHandle;

/// A WWW-Authenticate / Proxy-Authenticate challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub scheme: String,
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub stale: bool,
    /// Proxy-Authenticate (407) rather than WWW-Authenticate (401)
    pub proxy: bool,
}

impl Challenge {
    pub fn digest(realm: impl Into<String>, nonce: impl Into<String>) -> Self {
        Self {
            scheme: "Digest".to_string(),
            realm: realm.into(),
            nonce: nonce.into(),
            opaque: None,
            stale: false,
            proxy: false,
        }
    }

    pub fn for_proxy(mut self) -> Self {
        self.proxy = true;
        self
    }
}

/// An Authorization / Proxy-Authorization header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub response: String,
    pub proxy: bool,
}

/// Progress of one stored challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthObjectState {
    /// Received, no credentials produced yet
    Pending,
    /// Credentials were sent in a retried request
    Used,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthObject {
    pub challenge: Challenge,
    pub state: AuthObjectState,
}

/// Ordered list of the challenges the call-leg has to answer
#[derive(Debug, Clone, Default)]
pub struct AuthObjectList {
    objects: Vec<AuthObject>,
}

impl AuthObjectList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the challenges of a 401/407. A challenge for a realm already
    /// held replaces the old one (a stale nonce refresh).
    pub fn update(&mut self, challenges: &[Challenge]) {
        for challenge in challenges {
            match self
                .objects
                .iter_mut()
                .find(|obj| obj.challenge.realm == challenge.realm && obj.challenge.proxy == challenge.proxy)
            {
                Some(existing) => {
                    existing.challenge = challenge.clone();
                    existing.state = AuthObjectState::Pending;
                }
                None => self.objects.push(AuthObject {
                    challenge: challenge.clone(),
                    state: AuthObjectState::Pending,
                }),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn challenges(&self) -> impl Iterator<Item = &Challenge> {
        self.objects.iter().map(|obj| &obj.challenge)
    }

    pub fn mark_used(&mut self) {
        for obj in &mut self.objects {
            obj.state = AuthObjectState::Used;
        }
    }

    pub fn has_pending(&self) -> bool {
        self.objects
            .iter()
            .any(|obj| obj.state == AuthObjectState::Pending)
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }
}

/// What the application decided for the credentials currently presented
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAction {
    /// Verify the credentials against this password
    UsePassword(String),
    /// Skip these credentials and move on to the next header
    Skip,
    /// Stop and report success
    Success,
    /// Stop and report failure
    Failure,
}

/// Server-side walk over the credentials of one received request
#[derive(Debug, Clone)]
pub struct ServerAuthSession {
    pub transaction: TransactionHandle,
    credentials: Vec<Credentials>,
    cursor: usize,
}

/// Outcome of advancing a [`ServerAuthSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Present the next credentials to the application
    Found(Credentials),
    /// Walk finished with this verdict
    Completed(bool),
}

impl ServerAuthSession {
    pub fn new(transaction: TransactionHandle, credentials: Vec<Credentials>) -> Self {
        Self {
            transaction,
            credentials,
            cursor: 0,
        }
    }

    pub fn current(&self) -> Option<&Credentials> {
        self.credentials.get(self.cursor)
    }

    /// First step of the walk
    pub fn start(&self) -> AuthStep {
        match self.current() {
            Some(credentials) => AuthStep::Found(credentials.clone()),
            None => AuthStep::Completed(false),
        }
    }

    /// Move past the current credentials
    pub fn advance(&mut self) -> AuthStep {
        self.cursor += 1;
        self.start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(user: &str) -> Credentials {
        Credentials {
            username: user.to_string(),
            realm: "example.com".to_string(),
            nonce: "n".to_string(),
            response: "r".to_string(),
            proxy: false,
        }
    }

    #[test]
    fn test_stale_challenge_replaces_existing() {
        let mut list = AuthObjectList::new();
        list.update(&[Challenge::digest("example.com", "n1")]);
        list.mark_used();
        assert!(!list.has_pending());

        list.update(&[Challenge::digest("example.com", "n2")]);
        assert_eq!(list.len(), 1);
        assert!(list.has_pending());
        assert_eq!(list.challenges().next().unwrap().nonce, "n2");

        list.update(&[Challenge::digest("proxy.example.com", "p1").for_proxy()]);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_server_walk() {
        let tx = TransactionHandle::new(7);
        let mut session = ServerAuthSession::new(tx, vec![creds("alice"), creds("bob")]);
        assert_eq!(session.start(), AuthStep::Found(creds("alice")));
        assert_eq!(session.advance(), AuthStep::Found(creds("bob")));
        assert_eq!(session.advance(), AuthStep::Completed(false));
    }

    #[test]
    fn test_server_walk_without_credentials() {
        let session = ServerAuthSession::new(TransactionHandle::new(1), Vec::new());
        assert_eq!(session.start(), AuthStep::Completed(false));
    }
}
