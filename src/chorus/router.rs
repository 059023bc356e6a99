//! The message and event bus every principal in a workspace registers with.

use crate::channel::Channel;
use crate::config::ChorusConfig;
use crate::event::{Event, RouterListener};
use crate::identifier::Identifier;
use crate::inbox::Inbox;
use crate::message::ErrorKind;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// The well-known identifier of the diagnostic channel every router
/// auto-registers. Dead letters and handler crashes are published here so a
/// workspace can observe them without each component wiring up its own
/// side channel.
pub const DIAGNOSTIC_DEAD_LETTERS: &str = "diagnostic:dead_letters";

#[derive(Debug, Clone)]
pub enum RouterError {
    UnknownIdentifier(Identifier),
    MalformedEnvelope(String),
    InboxFull(Identifier),
}

impl RouterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::UnknownIdentifier(_) => ErrorKind::UnknownIdentifier,
            RouterError::MalformedEnvelope(_) => ErrorKind::MalformedEnvelope,
            RouterError::InboxFull(_) => ErrorKind::InboxFull,
        }
    }
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::UnknownIdentifier(id) => write!(f, "unknown identifier: {}", id),
            RouterError::MalformedEnvelope(reason) => write!(f, "malformed envelope: {}", reason),
            RouterError::InboxFull(id) => write!(f, "inbox full: {}", id),
        }
    }
}

impl std::error::Error for RouterError {}

struct RouterState {
    inboxes: RwLock<HashMap<Identifier, Inbox>>,
    channels: RwLock<HashMap<Identifier, Channel>>,
    listeners: RwLock<Vec<Arc<dyn RouterListener>>>,
    tick: AtomicU64,
    config: ChorusConfig,
}

/// Cloneable handle to the message bus. Every clone shares the same
/// registrations, channels, and tick counter.
#[derive(Clone)]
pub struct Router {
    state: Arc<RouterState>,
}

impl Router {
    pub fn new(config: ChorusConfig) -> Self {
        let router = Self {
            state: Arc::new(RouterState {
                inboxes: RwLock::new(HashMap::new()),
                channels: RwLock::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                tick: AtomicU64::new(0),
                config,
            }),
        };
        let diagnostic_id = Identifier::from(DIAGNOSTIC_DEAD_LETTERS);
        let diagnostic_inbox = Inbox::bounded(router.state.config.inbox_capacity.max(4096));
        router
            .state
            .inboxes
            .try_write()
            .expect("router just constructed, no contention yet")
            .insert(diagnostic_id, diagnostic_inbox);
        router
    }

    pub fn diagnostic_identifier() -> Identifier {
        Identifier::from(DIAGNOSTIC_DEAD_LETTERS)
    }

    pub fn config(&self) -> &ChorusConfig {
        &self.state.config
    }

    pub fn current_tick(&self) -> u64 {
        self.state.tick.load(Ordering::SeqCst)
    }

    /// Register a new principal with its own bounded inbox, returning a
    /// handle the caller can `recv()` from.
    pub async fn register(&self, id: Identifier) -> Inbox {
        self.register_with_capacity(id, self.state.config.inbox_capacity)
            .await
    }

    pub async fn register_with_capacity(&self, id: Identifier, capacity: usize) -> Inbox {
        let inbox = Inbox::bounded(capacity);
        self.state.inboxes.write().await.insert(id, inbox.clone());
        inbox
    }

    pub async fn unregister(&self, id: &Identifier) {
        if let Some(inbox) = self.state.inboxes.write().await.remove(id) {
            inbox.close();
        }
    }

    pub async fn is_registered(&self, id: &Identifier) -> bool {
        self.state.inboxes.read().await.contains_key(id)
    }

    pub async fn register_channel(&self, channel: Channel) {
        self.state
            .channels
            .write()
            .await
            .insert(channel.identifier(), channel);
    }

    pub async fn add_channel_member(&self, channel: &Identifier, member: impl Into<String>) {
        if let Some(c) = self.state.channels.write().await.get_mut(channel) {
            c.add_member(member);
        }
    }

    pub async fn channel_members(&self, channel: &Identifier) -> Option<Vec<Identifier>> {
        self.state
            .channels
            .read()
            .await
            .get(channel)
            .map(|c| c.member_identifiers())
    }

    /// Channels this agent name currently belongs to.
    pub async fn channels_for_member(&self, agent_name: &str) -> Vec<Identifier> {
        self.state
            .channels
            .read()
            .await
            .values()
            .filter(|c| c.has_member(agent_name))
            .map(|c| c.identifier())
            .collect()
    }

    pub async fn subscribe(&self, listener: Arc<dyn RouterListener>) {
        self.state.listeners.write().await.push(listener);
    }

    /// Stamp the event with the next tick, resolve its destination or
    /// channel, and deliver it. Direct sends block (bounded by the
    /// configured backpressure timeout) for inbox room; channel fan-out is
    /// best-effort per member and fails fast on the first missing or full
    /// target rather than partially delivering.
    pub async fn send(&self, mut event: Event) -> Result<(), RouterError> {
        let tick = self.state.tick.fetch_add(1, Ordering::SeqCst);
        event.set_timestamp(tick);

        let has_destination = event.destination().is_some();
        let has_channel = event.channel().is_some();
        let is_envelope_event = matches!(
            event,
            Event::Message(_) | Event::TeamServiceRequest(_) | Event::TeamServiceResponse(_)
        );

        if is_envelope_event {
            if has_destination == has_channel {
                let reason = if has_destination {
                    "message names both a destination and a channel".to_string()
                } else {
                    "message names neither a destination nor a channel".to_string()
                };
                return Err(RouterError::MalformedEnvelope(reason));
            }
        }

        if let Some(destination) = event.destination().cloned() {
            self.deliver_direct(destination, event).await?;
        } else if let Some(channel) = event.channel().cloned() {
            self.deliver_broadcast(channel, event).await?;
        } else {
            // Lifecycle/diagnostic events with no addressee: notify
            // listeners only.
            self.notify_listeners(&event).await;
            return Ok(());
        }
        Ok(())
    }

    async fn deliver_direct(&self, destination: Identifier, event: Event) -> Result<(), RouterError> {
        let inbox = {
            let inboxes = self.state.inboxes.read().await;
            inboxes.get(&destination).cloned()
        };
        let inbox = match inbox {
            Some(inbox) => inbox,
            None => {
                self.dead_letter(event.clone(), destination.clone(), "destination not registered")
                    .await;
                return Err(RouterError::UnknownIdentifier(destination));
            }
        };
        match inbox
            .enqueue(event.clone(), self.state.config.backpressure_timeout())
            .await
        {
            Ok(()) => {
                self.notify_listeners(&event).await;
                Ok(())
            }
            Err(_) => {
                self.dead_letter(event, destination.clone(), "inbox full or closed")
                    .await;
                Err(RouterError::InboxFull(destination))
            }
        }
    }

    async fn deliver_broadcast(&self, channel: Identifier, event: Event) -> Result<(), RouterError> {
        let members = self.channel_members(&channel).await;
        let members = match members {
            Some(m) => m,
            None => {
                self.dead_letter(event.clone(), channel.clone(), "channel not registered")
                    .await;
                return Err(RouterError::UnknownIdentifier(channel));
            }
        };

        let source = event.source().cloned();
        let targets: Vec<Identifier> = members
            .into_iter()
            .filter(|m| Some(m) != source.as_ref())
            .collect();

        let inboxes = {
            let registry = self.state.inboxes.read().await;
            let mut resolved = Vec::with_capacity(targets.len());
            for target in &targets {
                match registry.get(target) {
                    Some(inbox) => resolved.push((target.clone(), inbox.clone())),
                    None => return Err(RouterError::UnknownIdentifier(target.clone())),
                }
            }
            resolved
        };

        for (target, inbox) in inboxes {
            if inbox.try_enqueue(event.clone()).is_err() {
                self.dead_letter(event.clone(), target.clone(), "inbox full or closed")
                    .await;
                return Err(RouterError::InboxFull(target));
            }
        }
        self.notify_listeners(&event).await;
        Ok(())
    }

    async fn dead_letter(&self, original: Event, intended_target: Identifier, reason: &str) {
        let tick = self.current_tick();
        let dead_letter = Event::DeadLetter {
            original: Box::new(original),
            intended_target,
            reason: reason.to_string(),
            timestamp: tick,
        };
        if let Some(inbox) = self
            .state
            .inboxes
            .read()
            .await
            .get(&Self::diagnostic_identifier())
        {
            let _ = inbox.try_enqueue(dead_letter.clone());
        }
        self.notify_listeners(&dead_letter).await;
    }

    async fn notify_listeners(&self, event: &Event) {
        let listeners = self.state.listeners.read().await;
        for listener in listeners.iter() {
            listener.on_event(event).await;
        }
    }
}
