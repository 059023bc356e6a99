// src/lib.rs

pub mod chorus;

pub use chorus::agent::{AgentBehavior, AgentContext, AgentFactory, AgentKind, AgentRuntime, StepOutcome};
pub use chorus::channel::Channel;
pub use chorus::collaboration::{CentralizedPolicy, CollaborationPolicy, DecentralizedPolicy, RoutedMessage};
pub use chorus::config::ChorusConfig;
pub use chorus::event::{Event, RouterListener};
pub use chorus::identifier::Identifier;
pub use chorus::message::{ErrorKind, Message, Role, ToolInvocation, ToolObservation};
pub use chorus::router::Router;
pub use chorus::stop_condition::{HumanSignal, MessageCountReached, NoActivity, StopCondition, StopConditionEvaluator};
pub use chorus::team::Team;
pub use chorus::team_service::{TeamService, TeamServiceRuntime};
pub use chorus::workspace::{AgentSpec, TeamSpec, WorkspaceController, WorkspaceSpec};
