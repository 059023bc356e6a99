//! The envelope the [`crate::router::Router`] actually moves. A `Event` is a
//! superset of [`Message`]: every message travels as one, and the router
//! also uses it to announce lifecycle milestones and diagnostics.

use crate::identifier::Identifier;
use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Everything the router can carry between principals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// An ordinary message between agents, teams, channels, or the human.
    Message(Message),
    /// A fire-and-forget request to run a team-provided tool.
    TeamServiceRequest(Message),
    /// The result of a previously issued `TeamServiceRequest`.
    TeamServiceResponse(Message),
    /// Emitted when an agent runtime finishes initializing.
    AgentStarted { agent: Identifier, timestamp: u64 },
    /// Emitted when an agent runtime has fully stopped.
    AgentStopped { agent: Identifier, timestamp: u64 },
    /// Requests that every component take a durable snapshot.
    Snapshot {
        timestamp: u64,
        label: Option<String>,
    },
    /// Diagnostic: an event could not be delivered to its target.
    DeadLetter {
        original: Box<Event>,
        intended_target: Identifier,
        reason: String,
        timestamp: u64,
    },
    /// Diagnostic: a handler (agent or team service) crashed.
    HandlerCrash {
        source: Identifier,
        message: String,
        timestamp: u64,
    },
}

impl Event {
    pub fn timestamp(&self) -> u64 {
        match self {
            Event::Message(m) | Event::TeamServiceRequest(m) | Event::TeamServiceResponse(m) => {
                m.timestamp
            }
            Event::AgentStarted { timestamp, .. }
            | Event::AgentStopped { timestamp, .. }
            | Event::Snapshot { timestamp, .. }
            | Event::DeadLetter { timestamp, .. }
            | Event::HandlerCrash { timestamp, .. } => *timestamp,
        }
    }

    pub fn set_timestamp(&mut self, tick: u64) {
        match self {
            Event::Message(m) | Event::TeamServiceRequest(m) | Event::TeamServiceResponse(m) => {
                m.timestamp = tick;
            }
            Event::AgentStarted { timestamp, .. }
            | Event::AgentStopped { timestamp, .. }
            | Event::Snapshot { timestamp, .. }
            | Event::DeadLetter { timestamp, .. }
            | Event::HandlerCrash { timestamp, .. } => {
                *timestamp = tick;
            }
        }
    }

    pub fn source(&self) -> Option<&Identifier> {
        match self {
            Event::Message(m) | Event::TeamServiceRequest(m) | Event::TeamServiceResponse(m) => {
                Some(&m.source)
            }
            Event::AgentStarted { agent, .. } | Event::AgentStopped { agent, .. } => Some(agent),
            Event::HandlerCrash { source, .. } => Some(source),
            Event::Snapshot { .. } | Event::DeadLetter { .. } => None,
        }
    }

    pub fn destination(&self) -> Option<&Identifier> {
        match self {
            Event::Message(m) | Event::TeamServiceRequest(m) | Event::TeamServiceResponse(m) => {
                m.destination.as_ref()
            }
            _ => None,
        }
    }

    pub fn channel(&self) -> Option<&Identifier> {
        match self {
            Event::Message(m) | Event::TeamServiceRequest(m) | Event::TeamServiceResponse(m) => {
                m.channel.as_ref()
            }
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Event::Message(m) | Event::TeamServiceRequest(m) | Event::TeamServiceResponse(m) => {
                Some(m)
            }
            _ => None,
        }
    }
}

/// Observes every event that passes through a [`crate::router::Router`].
///
/// Implementations get a default no-op `on_event`, matching the rest of the
/// crate's observability traits: a listener only overrides what it cares
/// about.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use chorus::{Event, RouterListener};
///
/// struct Logger;
///
/// #[async_trait]
/// impl RouterListener for Logger {
///     async fn on_event(&self, event: &Event) {
///         log::debug!("event at tick {}", event.timestamp());
///     }
/// }
/// ```
#[async_trait]
pub trait RouterListener: Send + Sync {
    async fn on_event(&self, _event: &Event) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    #[test]
    fn timestamp_round_trips_across_variants() {
        let mut ev = Event::AgentStarted {
            agent: Identifier::agent("a"),
            timestamp: 0,
        };
        ev.set_timestamp(42);
        assert_eq!(ev.timestamp(), 42);

        let mut ev = Event::Message(Message::direct(
            Identifier::agent("a"),
            Identifier::agent("b"),
            "hi",
            Role::Agent,
        ));
        ev.set_timestamp(7);
        assert_eq!(ev.timestamp(), 7);
    }

    #[test]
    fn destination_and_channel_are_message_only() {
        let ev = Event::Snapshot {
            timestamp: 1,
            label: None,
        };
        assert!(ev.destination().is_none());
        assert!(ev.channel().is_none());
    }
}
