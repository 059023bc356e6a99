//! The message envelope and the tool-call types it carries.

use crate::identifier::Identifier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Speaker role a [`Message`] is attributed to, mirroring the roles a chat
/// transcript distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The human user.
    User,
    /// An agent speaking in its own voice.
    #[serde(rename = "assistant")]
    Agent,
    /// A team service reporting a tool result.
    Tool,
    /// Workspace-level bookkeeping (start/stop announcements, etc).
    System,
}

/// The taxonomy of failures the runtime can report, shared by every
/// component so a caller can pattern-match on `kind` instead of a
/// component-specific error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The destination or channel named in an envelope has no registration.
    UnknownIdentifier,
    /// An envelope named both or neither of destination/channel.
    MalformedEnvelope,
    /// A target inbox rejected delivery after the backpressure window elapsed.
    InboxFull,
    /// An agent or team-service handler panicked or returned an error.
    HandlerCrash,
    /// A team-service invocation exceeded its deadline.
    Timeout,
    /// The same invocation id was submitted while already outstanding.
    DuplicateInvocation,
    /// The workspace was stopped while the operation was in flight.
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::UnknownIdentifier => "unknown_identifier",
            ErrorKind::MalformedEnvelope => "malformed_envelope",
            ErrorKind::InboxFull => "inbox_full",
            ErrorKind::HandlerCrash => "handler_crash",
            ErrorKind::Timeout => "timeout",
            ErrorKind::DuplicateInvocation => "duplicate_invocation",
            ErrorKind::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

/// A request to run a named tool, carried inside a [`Message`] addressed to
/// a team service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub invocation_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub deadline_ms: Option<u64>,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            invocation_id: Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
            deadline_ms: None,
        }
    }

    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }
}

/// The error carried by a failed [`ToolObservation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationError {
    pub kind: ErrorKind,
    pub message: String,
}

/// The outcome of a [`ToolInvocation`], carried back inside a `Message`
/// addressed to the invoking agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolObservation {
    pub invocation_id: String,
    pub ok: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<ObservationError>,
}

impl ToolObservation {
    pub fn success(invocation_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(invocation_id: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            ok: false,
            result: None,
            error: Some(ObservationError {
                kind,
                message: message.into(),
            }),
        }
    }
}

/// The single envelope type every principal in a workspace exchanges.
///
/// A message names exactly one of `destination` (a direct recipient) or
/// `channel` (a broadcast target); the router rejects any envelope that
/// names both or neither with [`ErrorKind::MalformedEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub source: Identifier,
    pub destination: Option<Identifier>,
    pub channel: Option<Identifier>,
    pub content: Arc<str>,
    pub role: Role,
    #[serde(default)]
    pub actions: Vec<ToolInvocation>,
    #[serde(default)]
    pub observations: Vec<ToolObservation>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub timestamp: u64,
    pub reply_to: Option<String>,
}

impl Message {
    /// A message addressed directly at a single principal.
    pub fn direct(
        source: Identifier,
        destination: Identifier,
        content: impl Into<Arc<str>>,
        role: Role,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            source,
            destination: Some(destination),
            channel: None,
            content: content.into(),
            role,
            actions: Vec::new(),
            observations: Vec::new(),
            metadata: HashMap::new(),
            timestamp: 0,
            reply_to: None,
        }
    }

    /// A message broadcast to every member of a channel.
    pub fn broadcast(
        source: Identifier,
        channel: Identifier,
        content: impl Into<Arc<str>>,
        role: Role,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            source,
            destination: None,
            channel: Some(channel),
            content: content.into(),
            role,
            actions: Vec::new(),
            observations: Vec::new(),
            metadata: HashMap::new(),
            timestamp: 0,
            reply_to: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }

    pub fn with_actions(mut self, actions: Vec<ToolInvocation>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_observations(mut self, observations: Vec<ToolObservation>) -> Self {
        self.observations = observations;
        self
    }

    /// Readdress a copy of this message at a new direct destination,
    /// preserving everything else including `source`.
    pub fn retargeted_direct(&self, destination: Identifier) -> Self {
        let mut copy = self.clone();
        copy.destination = Some(destination);
        copy.channel = None;
        copy
    }

    /// Readdress a copy of this message at a new channel.
    pub fn retargeted_channel(&self, channel: Identifier) -> Self {
        let mut copy = self.clone();
        copy.destination = None;
        copy.channel = Some(channel);
        copy
    }

    pub fn is_broadcast(&self) -> bool {
        self.channel.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_and_broadcast_are_mutually_exclusive() {
        let a = Identifier::agent("a");
        let b = Identifier::agent("b");
        let m = Message::direct(a.clone(), b.clone(), "hi", Role::Agent);
        assert_eq!(m.destination, Some(b));
        assert!(m.channel.is_none());
        assert!(!m.is_broadcast());

        let ch = Identifier::channel("news");
        let m = Message::broadcast(a, ch.clone(), "hi", Role::Agent);
        assert_eq!(m.channel, Some(ch));
        assert!(m.destination.is_none());
        assert!(m.is_broadcast());
    }

    #[test]
    fn retargeting_preserves_source_and_content() {
        let a = Identifier::agent("a");
        let b = Identifier::agent("b");
        let c = Identifier::agent("c");
        let original = Message::direct(a.clone(), b, "payload", Role::Agent);
        let retargeted = original.retargeted_direct(c.clone());
        assert_eq!(retargeted.source, a);
        assert_eq!(retargeted.destination, Some(c));
        assert_eq!(retargeted.content.as_ref(), "payload");
    }

    #[test]
    fn tool_observation_constructors() {
        let ok = ToolObservation::success("id-1", serde_json::json!({"x": 1}));
        assert!(ok.ok);
        let err = ToolObservation::failure("id-2", ErrorKind::Timeout, "too slow");
        assert!(!err.ok);
        assert_eq!(err.error.unwrap().kind, ErrorKind::Timeout);
    }
}
