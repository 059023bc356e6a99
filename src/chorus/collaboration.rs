//! How a team reshapes messages addressed to it.

use crate::identifier::Identifier;
use crate::message::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// A message the policy has decided to deliver, paired with the identifier
/// it is addressed to (always equal to `message.destination` or
/// `message.channel`, whichever the policy set — kept alongside the
/// message purely so callers don't have to re-inspect it).
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    pub target: Identifier,
    pub message: Message,
}

impl RoutedMessage {
    fn direct(target: Identifier, message: Message) -> Self {
        let message = message.retargeted_direct(target.clone());
        Self { target, message }
    }

    fn broadcast(target: Identifier, message: Message) -> Self {
        let message = message.retargeted_channel(target.clone());
        Self { target, message }
    }
}

/// How a team turns one inbound message into zero or more outbound ones.
/// Custom implementations should be pure functions of the message plus the
/// team's static membership — no state that isn't derivable from the
/// message stream itself.
#[async_trait]
pub trait CollaborationPolicy: Send + Sync {
    /// The member name member-outbound routing treats as the team's single
    /// point of contact, if this policy has one.
    fn coordinator(&self) -> Option<&str> {
        None
    }

    /// A message from outside the team, addressed to the team identifier.
    async fn on_inbound(&self, team: &Identifier, members: &[String], message: Message) -> Vec<RoutedMessage>;

    /// A message from a team member, addressed to the team identifier.
    async fn on_member_outbound(
        &self,
        team: &Identifier,
        members: &[String],
        message: Message,
    ) -> Vec<RoutedMessage>;
}

/// All traffic funnels through one member (the coordinator); other members
/// only ever hear from the coordinator, never directly from outside.
pub struct CentralizedPolicy {
    coordinator: String,
    // Bookkeeping needed to honor the documented behavior (routing a
    // coordinator reply back to whoever originally asked) without making
    // every custom policy carry the same state: message id -> original
    // external sender.
    correlations: Mutex<HashMap<String, Identifier>>,
}

impl CentralizedPolicy {
    pub fn new(coordinator: impl Into<String>) -> Self {
        Self {
            coordinator: coordinator.into(),
            correlations: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CollaborationPolicy for CentralizedPolicy {
    fn coordinator(&self) -> Option<&str> {
        Some(&self.coordinator)
    }

    async fn on_inbound(&self, team: &Identifier, _members: &[String], message: Message) -> Vec<RoutedMessage> {
        let _ = team;
        self.correlations
            .lock()
            .unwrap()
            .insert(message.message_id.clone(), message.source.clone());
        vec![RoutedMessage::direct(
            Identifier::agent(self.coordinator.clone()),
            message,
        )]
    }

    async fn on_member_outbound(
        &self,
        _team: &Identifier,
        _members: &[String],
        message: Message,
    ) -> Vec<RoutedMessage> {
        if message.source.as_str() != self.coordinator {
            // Non-coordinator members funnel through the coordinator.
            return vec![RoutedMessage::direct(
                Identifier::agent(self.coordinator.clone()),
                message,
            )];
        }
        let original_sender = message
            .reply_to
            .as_ref()
            .and_then(|id| self.correlations.lock().unwrap().remove(id));
        match original_sender {
            Some(sender) => vec![RoutedMessage::direct(sender, message)],
            None => {
                log::debug!(
                    "coordinator message has no traceable original sender (reply_to={:?}); dropping",
                    message.reply_to
                );
                Vec::new()
            }
        }
    }
}

/// No single point of contact: every team-addressed message, whether from
/// outside or from a member, is broadcast to the whole team over its
/// internal channel.
pub struct DecentralizedPolicy;

#[async_trait]
impl CollaborationPolicy for DecentralizedPolicy {
    async fn on_inbound(&self, team: &Identifier, _members: &[String], message: Message) -> Vec<RoutedMessage> {
        vec![RoutedMessage::broadcast(internal_channel(team), message)]
    }

    async fn on_member_outbound(
        &self,
        team: &Identifier,
        _members: &[String],
        message: Message,
    ) -> Vec<RoutedMessage> {
        vec![RoutedMessage::broadcast(internal_channel(team), message)]
    }
}

/// The channel identifier a team's decentralized traffic is broadcast over.
pub fn internal_channel(team: &Identifier) -> Identifier {
    match team.team_name() {
        Some(name) => Identifier::channel(name),
        None => Identifier::channel(team.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    #[tokio::test]
    async fn centralized_routes_inbound_to_coordinator() {
        let policy = CentralizedPolicy::new("lead");
        let team = Identifier::team("research");
        let msg = Message::direct(Identifier::human(), team.clone(), "hi", Role::User);
        let routed = policy.on_inbound(&team, &["lead".into(), "aide".into()], msg).await;
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].target, Identifier::agent("lead"));
    }

    #[tokio::test]
    async fn centralized_routes_coordinator_reply_back_to_original_sender() {
        let policy = CentralizedPolicy::new("lead");
        let team = Identifier::team("research");
        let inbound = Message::direct(Identifier::human(), team.clone(), "hi", Role::User);
        let inbound_id = inbound.message_id.clone();
        policy.on_inbound(&team, &["lead".into()], inbound).await;

        let reply = Message::direct(Identifier::agent("lead"), team.clone(), "answer", Role::Agent)
            .with_reply_to(inbound_id);
        let routed = policy.on_member_outbound(&team, &["lead".into()], reply).await;
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].target, Identifier::human());
    }

    #[tokio::test]
    async fn centralized_funnels_non_coordinator_outbound_through_coordinator() {
        let policy = CentralizedPolicy::new("lead");
        let team = Identifier::team("research");
        let msg = Message::direct(Identifier::agent("aide"), team.clone(), "status", Role::Agent);
        let routed = policy
            .on_member_outbound(&team, &["lead".into(), "aide".into()], msg)
            .await;
        assert_eq!(routed[0].target, Identifier::agent("lead"));
    }

    #[tokio::test]
    async fn decentralized_broadcasts_on_team_channel() {
        let policy = DecentralizedPolicy;
        let team = Identifier::team("research");
        let msg = Message::direct(Identifier::human(), team.clone(), "hi", Role::User);
        let routed = policy.on_inbound(&team, &["a".into(), "b".into()], msg).await;
        assert_eq!(routed[0].target, Identifier::channel("research"));
        assert!(routed[0].message.is_broadcast());
    }
}
