//! The flat naming space every principal in a workspace is addressed by.
//!
//! An [`Identifier`] names an agent, a team, a channel, the human user, or a
//! team service. Identifiers are plain, case-sensitive strings; the prefixes
//! (`team:`, `channel:`, `service:`) are conventions this module enforces via
//! constructors so callers never hand-assemble them incorrectly.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The well-known identifier of the human user.
pub const HUMAN: &str = "human";

/// Name-addressed principal: an agent, a team, a channel, the user, or a
/// team service.
///
/// # Examples
///
/// ```
/// use chorus::Identifier;
///
/// let agent = Identifier::agent("researcher");
/// let team = Identifier::team("research-team");
/// assert_eq!(team.as_str(), "team:research-team");
/// assert_eq!(team.team_name(), Some("research-team"));
/// assert!(agent.team_name().is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    /// Wrap an already-formatted identifier string verbatim.
    pub fn agent(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Build the identifier for the human user.
    pub fn human() -> Self {
        Self(HUMAN.to_string())
    }

    /// Build a team identifier (`team:<name>`).
    pub fn team(name: impl AsRef<str>) -> Self {
        Self(format!("team:{}", name.as_ref()))
    }

    /// Build a channel identifier (`channel:<name>`).
    pub fn channel(name: impl AsRef<str>) -> Self {
        Self(format!("channel:{}", name.as_ref()))
    }

    /// Build a team-service identifier (`service:<team>/<tool>`).
    pub fn service(team: impl AsRef<str>, tool: impl AsRef<str>) -> Self {
        Self(format!("service:{}/{}", team.as_ref(), tool.as_ref()))
    }

    /// Borrow the raw identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` if this identifies the human user.
    pub fn is_human(&self) -> bool {
        self.0 == HUMAN
    }

    /// `true` if this identifies a team.
    pub fn is_team(&self) -> bool {
        self.0.starts_with("team:")
    }

    /// `true` if this identifies a channel.
    pub fn is_channel(&self) -> bool {
        self.0.starts_with("channel:")
    }

    /// `true` if this identifies a team service.
    pub fn is_service(&self) -> bool {
        self.0.starts_with("service:")
    }

    /// The bare team name, if this is a team identifier.
    pub fn team_name(&self) -> Option<&str> {
        self.0.strip_prefix("team:")
    }

    /// The bare channel name, if this is a channel identifier.
    pub fn channel_name(&self) -> Option<&str> {
        self.0.strip_prefix("channel:")
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_prefixed_identifiers() {
        assert_eq!(Identifier::team("t").as_str(), "team:t");
        assert_eq!(Identifier::channel("c").as_str(), "channel:c");
        assert_eq!(Identifier::service("t", "tool").as_str(), "service:t/tool");
        assert_eq!(Identifier::human().as_str(), "human");
    }

    #[test]
    fn classifies_identifiers() {
        assert!(Identifier::team("t").is_team());
        assert!(Identifier::channel("c").is_channel());
        assert!(Identifier::service("t", "x").is_service());
        assert!(Identifier::human().is_human());
        assert!(!Identifier::agent("bob").is_team());
    }

    #[test]
    fn extracts_bare_names() {
        assert_eq!(Identifier::team("research").team_name(), Some("research"));
        assert_eq!(Identifier::channel("news").channel_name(), Some("news"));
        assert_eq!(Identifier::agent("bob").team_name(), None);
    }
}
