//! Named broadcast groups agents and teams can be members of.

use crate::identifier::Identifier;
use std::collections::{HashMap, HashSet};

/// A broadcast group: anything addressed to `channel.identifier()` is fanned
/// out to every member by the [`crate::router::Router`].
#[derive(Debug, Clone)]
pub struct Channel {
    name: String,
    members: HashSet<String>,
    pub metadata: HashMap<String, String>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: HashSet::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for m in members {
            self.members.insert(m.into());
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identifier(&self) -> Identifier {
        Identifier::channel(&self.name)
    }

    pub fn add_member(&mut self, name: impl Into<String>) {
        self.members.insert(name.into());
    }

    pub fn remove_member(&mut self, name: &str) {
        self.members.remove(name);
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.members.contains(name)
    }

    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|s| s.as_str())
    }

    pub fn member_identifiers(&self) -> Vec<Identifier> {
        self.members.iter().map(Identifier::agent).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_round_trips() {
        let mut channel = Channel::new("news").with_members(["a", "b"]);
        assert!(channel.has_member("a"));
        assert!(channel.has_member("b"));
        assert!(!channel.has_member("c"));
        channel.add_member("c");
        assert!(channel.has_member("c"));
        channel.remove_member("a");
        assert!(!channel.has_member("a"));
        assert_eq!(channel.identifier(), Identifier::channel("news"));
    }
}
