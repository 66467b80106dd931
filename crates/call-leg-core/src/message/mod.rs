//! Message summaries exchanged with the transaction layer
//!
//! Parsing and serialization belong to the message layer. The engine only
//! sees the fields that drive call-leg behavior: identity, sequencing,
//! routing, reliability, session timer and authentication headers. Incoming
//! traffic arrives as [`RequestInfo`] / [`ResponseInfo`], outgoing traffic is
//! handed over as [`OutgoingRequest`] / [`OutgoingResponse`] for the
//! transaction layer to encode.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::auth::{Challenge, Credentials};
use crate::replaces::ReplacesHeader;

/// SIP request method
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Invite,
    Ack,
    Cancel,
    Bye,
    Prack,
    Update,
    Refer,
    Info,
    Message,
    Options,
    Notify,
    Subscribe,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Cancel => "CANCEL",
            Method::Bye => "BYE",
            Method::Prack => "PRACK",
            Method::Update => "UPDATE",
            Method::Refer => "REFER",
            Method::Info => "INFO",
            Method::Message => "MESSAGE",
            Method::Options => "OPTIONS",
            Method::Notify => "NOTIFY",
            Method::Subscribe => "SUBSCRIBE",
            Method::Other(name) => name,
        }
    }

    /// Methods that have their own dedicated handling on a call-leg
    pub fn is_session_method(&self) -> bool {
        matches!(
            self,
            Method::Invite | Method::Ack | Method::Cancel | Method::Bye | Method::Prack
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A From/To party: URI, display name and tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameAddr {
    pub uri: String,
    pub display_name: Option<String>,
    pub tag: Option<String>,
}

impl NameAddr {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            display_name: None,
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// `refresher` parameter of a Session-Expires header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefresherRole {
    Uac,
    Uas,
}

/// Session timer related headers (Session-Expires, Min-SE, Supported/Require: timer)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTimerHeaders {
    pub session_expires: Option<u32>,
    pub refresher: Option<RefresherRole>,
    pub min_se: Option<u32>,
    pub supported: bool,
    pub required: bool,
}

impl SessionTimerHeaders {
    pub fn is_empty(&self) -> bool {
        self.session_expires.is_none() && self.min_se.is_none() && !self.supported && !self.required
    }
}

/// What a received message says about the `100rel` option tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rel100Status {
    #[default]
    Undefined,
    Supported,
    Required,
}

/// RAck header of a PRACK request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RAck {
    pub rseq: u32,
    pub cseq: u32,
    pub method: Method,
}

/// A request received from the transaction layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub method: Method,
    pub call_id: String,
    pub from: NameAddr,
    pub to: NameAddr,
    pub cseq: u32,
    pub contact: Option<String>,
    pub record_route: Vec<String>,
    pub rel100: Rel100Status,
    pub rack: Option<RAck>,
    pub session_timer: SessionTimerHeaders,
    pub replaces: Option<ReplacesHeader>,
    pub authorization: Vec<Credentials>,
    pub body: Option<Bytes>,
}

impl RequestInfo {
    pub fn new(
        method: Method,
        call_id: impl Into<String>,
        from: NameAddr,
        to: NameAddr,
        cseq: u32,
    ) -> Self {
        Self {
            method,
            call_id: call_id.into(),
            from,
            to,
            cseq,
            contact: None,
            record_route: Vec::new(),
            rel100: Rel100Status::Undefined,
            rack: None,
            session_timer: SessionTimerHeaders::default(),
            replaces: None,
            authorization: Vec::new(),
            body: None,
        }
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    pub fn with_record_route(mut self, routes: Vec<String>) -> Self {
        self.record_route = routes;
        self
    }

    pub fn with_rel100(mut self, status: Rel100Status) -> Self {
        self.rel100 = status;
        self
    }

    pub fn with_rack(mut self, rack: RAck) -> Self {
        self.rack = Some(rack);
        self
    }

    pub fn with_session_timer(mut self, headers: SessionTimerHeaders) -> Self {
        self.session_timer = headers;
        self
    }

    pub fn with_replaces(mut self, replaces: ReplacesHeader) -> Self {
        self.replaces = Some(replaces);
        self
    }

    pub fn with_authorization(mut self, credentials: Credentials) -> Self {
        self.authorization.push(credentials);
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

/// A response received from the transaction layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status: u16,
    /// Method from the CSeq header
    pub method: Method,
    pub cseq: u32,
    pub to_tag: Option<String>,
    pub contact: Option<String>,
    pub record_route: Vec<String>,
    pub rseq: Option<u32>,
    pub require_100rel: bool,
    pub session_timer: SessionTimerHeaders,
    pub challenges: Vec<Challenge>,
    pub body: Option<Bytes>,
}

impl ResponseInfo {
    pub fn new(status: u16, method: Method, cseq: u32) -> Self {
        Self {
            status,
            method,
            cseq,
            to_tag: None,
            contact: None,
            record_route: Vec::new(),
            rseq: None,
            require_100rel: false,
            session_timer: SessionTimerHeaders::default(),
            challenges: Vec::new(),
            body: None,
        }
    }

    pub fn with_to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    pub fn with_record_route(mut self, routes: Vec<String>) -> Self {
        self.record_route = routes;
        self
    }

    /// Mark this provisional as reliable (Require: 100rel with RSeq)
    pub fn with_rseq(mut self, rseq: u32) -> Self {
        self.rseq = Some(rseq);
        self.require_100rel = true;
        self
    }

    pub fn with_session_timer(mut self, headers: SessionTimerHeaders) -> Self {
        self.session_timer = headers;
        self
    }

    pub fn with_challenge(mut self, challenge: Challenge) -> Self {
        self.challenges.push(challenge);
        self
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_reliable_provisional(&self) -> bool {
        self.status > 100 && self.is_provisional() && self.require_100rel && self.rseq.is_some()
    }
}

/// A request the engine asks the transaction layer to send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingRequest {
    pub method: Method,
    pub request_uri: String,
    pub call_id: String,
    pub from: NameAddr,
    pub to: NameAddr,
    pub cseq: u32,
    pub route_set: Vec<String>,
    pub contact: Option<String>,
    pub outbound_proxy: Option<String>,
    pub supported_100rel: bool,
    pub session_timer: SessionTimerHeaders,
    pub replaces: Option<ReplacesHeader>,
    pub rack: Option<RAck>,
    pub authorization: Vec<Credentials>,
}

/// A response the engine asks the transaction layer to send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingResponse {
    pub status: u16,
    pub to_tag: Option<String>,
    pub contact: Option<String>,
    pub rseq: Option<u32>,
    pub session_timer: SessionTimerHeaders,
    pub challenges: Vec<Challenge>,
}

impl OutgoingResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            to_tag: None,
            contact: None,
            rseq: None,
            session_timer: SessionTimerHeaders::default(),
            challenges: Vec::new(),
        }
    }

    pub fn with_to_tag(mut self, tag: Option<String>) -> Self {
        self.to_tag = tag;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reliable_provisional_detection() {
        let resp = ResponseInfo::new(183, Method::Invite, 1).with_rseq(1);
        assert!(resp.is_reliable_provisional());

        let resp = ResponseInfo::new(180, Method::Invite, 1);
        assert!(!resp.is_reliable_provisional());

        let mut resp = ResponseInfo::new(100, Method::Invite, 1);
        resp.rseq = Some(1);
        resp.require_100rel = true;
        assert!(!resp.is_reliable_provisional());
    }

    #[test]
    fn test_method_display() {
        assert_eq!(Method::Prack.to_string(), "PRACK");
        assert_eq!(Method::Other("PUBLISH".into()).to_string(), "PUBLISH");
        assert!(Method::Bye.is_session_method());
        assert!(!Method::Update.is_session_method());
    }
}
