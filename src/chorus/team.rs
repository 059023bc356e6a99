//! A named group of agents sharing a collaboration policy and a set of
//! team services.

use crate::collaboration::CollaborationPolicy;
use crate::identifier::Identifier;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum TeamError {
    DuplicateMember(String),
    DuplicateService(String),
    UnknownMember(String),
    InvalidCoordinator(String),
}

impl fmt::Display for TeamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeamError::DuplicateMember(name) => write!(f, "duplicate team member: {}", name),
            TeamError::DuplicateService(name) => write!(f, "duplicate team service: {}", name),
            TeamError::UnknownMember(name) => write!(f, "team member not a registered agent: {}", name),
            TeamError::InvalidCoordinator(name) => {
                write!(f, "coordinator '{}' is not a team member", name)
            }
        }
    }
}

impl std::error::Error for TeamError {}

/// A team: an ordered, unique list of member agent names, a collaboration
/// policy governing how team-addressed traffic flows, and the tool names
/// it exposes as team services.
pub struct Team {
    pub name: String,
    pub member_names: Vec<String>,
    pub collaboration_policy: Arc<dyn CollaborationPolicy>,
    pub service_names: Vec<String>,
}

impl Team {
    pub fn new(name: impl Into<String>, collaboration_policy: Arc<dyn CollaborationPolicy>) -> Self {
        Self {
            name: name.into(),
            member_names: Vec::new(),
            collaboration_policy,
            service_names: Vec::new(),
        }
    }

    pub fn identifier(&self) -> Identifier {
        Identifier::team(&self.name)
    }

    pub fn with_member(mut self, name: impl Into<String>) -> Result<Self, TeamError> {
        let name = name.into();
        if self.member_names.contains(&name) {
            return Err(TeamError::DuplicateMember(name));
        }
        self.member_names.push(name);
        Ok(self)
    }

    pub fn with_service(mut self, tool_name: impl Into<String>) -> Result<Self, TeamError> {
        let tool_name = tool_name.into();
        if self.service_names.contains(&tool_name) {
            return Err(TeamError::DuplicateService(tool_name));
        }
        self.service_names.push(tool_name);
        Ok(self)
    }

    /// Confirm every member resolves against the set of agents actually
    /// registered in the workspace, and that the policy's coordinator (if
    /// any) is itself a member.
    pub fn validate(&self, known_agents: &HashSet<String>) -> Result<(), TeamError> {
        for member in &self.member_names {
            if !known_agents.contains(member) {
                return Err(TeamError::UnknownMember(member.clone()));
            }
        }
        if let Some(coordinator) = self.collaboration_policy.coordinator() {
            if !self.member_names.iter().any(|m| m == coordinator) {
                return Err(TeamError::InvalidCoordinator(coordinator.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaboration::CentralizedPolicy;

    #[test]
    fn rejects_duplicate_members() {
        let team = Team::new("research", Arc::new(CentralizedPolicy::new("lead")))
            .with_member("lead")
            .unwrap();
        assert!(matches!(team.with_member("lead"), Err(TeamError::DuplicateMember(_))));
    }

    #[test]
    fn validate_requires_coordinator_membership() {
        let team = Team::new("research", Arc::new(CentralizedPolicy::new("lead")))
            .with_member("aide")
            .unwrap();
        let known: HashSet<String> = ["aide".to_string()].into_iter().collect();
        assert!(matches!(
            team.validate(&known),
            Err(TeamError::InvalidCoordinator(_))
        ));
    }

    #[test]
    fn validate_requires_known_members() {
        let team = Team::new("research", Arc::new(CentralizedPolicy::new("lead")))
            .with_member("lead")
            .unwrap();
        let known: HashSet<String> = HashSet::new();
        assert!(matches!(team.validate(&known), Err(TeamError::UnknownMember(_))));
    }
}
