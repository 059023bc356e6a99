//! The lifecycle owner: wires agents, teams, team services, and channels
//! together behind a single [`Router`], and drives the run-until-stop loop.

use crate::agent::{AgentBehavior, AgentContext, AgentFactory, AgentHandle, AgentKind, AgentRuntime, AgentRuntimeOptions};
use crate::cancellation::CancellationToken;
use crate::channel::Channel;
use crate::collaboration::{internal_channel, CentralizedPolicy, CollaborationPolicy, DecentralizedPolicy};
use crate::config::ChorusConfig;
use crate::event::{Event, RouterListener};
use crate::identifier::Identifier;
use crate::message::{Message, Role};
use crate::router::Router;
use crate::stop_condition::{HumanSignal, MessageCountReached, NoActivity, StopCondition, StopConditionEvaluator};
use crate::team::Team;
use crate::team_service::{TeamService, TeamServiceOptions, TeamServiceRuntime};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub enum WorkspaceError {
    UnknownAgentType(String),
    DuplicateAgent(String),
    DuplicateTeam(String),
    Team(crate::team::TeamError),
    Io(String),
    Serde(String),
}

impl fmt::Display for WorkspaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceError::UnknownAgentType(t) => write!(f, "no factory registered for agent type '{}'", t),
            WorkspaceError::DuplicateAgent(name) => write!(f, "duplicate agent: {}", name),
            WorkspaceError::DuplicateTeam(name) => write!(f, "duplicate team: {}", name),
            WorkspaceError::Team(e) => write!(f, "{}", e),
            WorkspaceError::Io(reason) => write!(f, "io error: {}", reason),
            WorkspaceError::Serde(reason) => write!(f, "serialization error: {}", reason),
        }
    }
}

impl std::error::Error for WorkspaceError {}

impl From<crate::team::TeamError> for WorkspaceError {
    fn from(e: crate::team::TeamError) -> Self {
        WorkspaceError::Team(e)
    }
}

/// Declarative shape of a single agent, as it would appear in a workspace
/// spec file. `agent_type` is resolved against an [`AgentFactory`] supplied
/// separately; this struct carries no behavior itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    #[serde(default)]
    pub kind: AgentKindSpec,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Per-agent override of the active-agent iterate rate limit; falls
    /// back to `ChorusConfig::iterate_interval` when unset.
    #[serde(default)]
    pub iterate_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKindSpec {
    Passive,
    Active,
}

impl Default for AgentKindSpec {
    fn default() -> Self {
        AgentKindSpec::Passive
    }
}

impl From<AgentKindSpec> for AgentKind {
    fn from(value: AgentKindSpec) -> Self {
        match value {
            AgentKindSpec::Passive => AgentKind::Passive,
            AgentKindSpec::Active => AgentKind::Active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CollaborationSpec {
    Centralized { coordinator: String },
    Decentralized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamSpec {
    /// Carried for wire compatibility; the engine does not interpret it —
    /// team behavior comes entirely from `collaboration`.
    #[serde(rename = "type", default)]
    pub team_type: String,
    pub name: String,
    #[serde(rename = "agents")]
    pub members: Vec<String>,
    pub collaboration: CollaborationSpec,
    #[serde(default)]
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopConditionSpec {
    NoActivity { window_ms: u64 },
    MessageCountReached { n: u64 },
    HumanSignal,
}

impl StopConditionSpec {
    fn build(&self) -> Box<dyn StopCondition> {
        match self {
            StopConditionSpec::NoActivity { window_ms } => {
                Box::new(NoActivity::new(std::time::Duration::from_millis(*window_ms)))
            }
            StopConditionSpec::MessageCountReached { n } => Box::new(MessageCountReached::new(*n)),
            StopConditionSpec::HumanSignal => Box::new(HumanSignal),
        }
    }
}

/// The declarative shape a whole workspace can be constructed from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub main_channel: Option<String>,
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub teams: Vec<TeamSpec>,
    #[serde(default)]
    pub start_messages: Vec<Message>,
    #[serde(default)]
    pub stop_conditions: Vec<StopConditionSpec>,
}

struct ManagedAgent {
    handle: AgentHandle,
    join: JoinHandle<Result<(), crate::agent::AgentRuntimeError>>,
}

struct ManagedService {
    identifier: Identifier,
    join: JoinHandle<()>,
}

struct ActivityListener {
    evaluator: Arc<StopConditionEvaluator>,
}

#[async_trait]
impl RouterListener for ActivityListener {
    async fn on_event(&self, event: &Event) {
        self.evaluator.record_event(event);
    }
}

/// Forwards team-addressed traffic through a team's collaboration policy.
struct TeamDispatcher {
    team_identifier: Identifier,
    member_names: Vec<String>,
    policy: Arc<dyn CollaborationPolicy>,
    router: Router,
    inbox: crate::inbox::Inbox,
    cancellation: CancellationToken,
}

impl TeamDispatcher {
    fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.cancellation.cancelled() => break,
                    event = self.inbox.recv() => {
                        match event {
                            Some(Event::Message(msg)) => {
                                let is_member = self.member_names.iter().any(|m| m == msg.source.as_str());
                                let routed = if is_member {
                                    self.policy
                                        .on_member_outbound(&self.team_identifier, &self.member_names, msg)
                                        .await
                                } else {
                                    self.policy
                                        .on_inbound(&self.team_identifier, &self.member_names, msg)
                                        .await
                                };
                                for r in routed {
                                    let _ = self.router.send(Event::Message(r.message)).await;
                                }
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }
            self.inbox.close();
            self.router.unregister(&self.team_identifier).await;
        })
    }
}

/// Owns every running component of a workspace and drives its lifecycle.
pub struct WorkspaceController {
    pub title: String,
    pub description: String,
    config: ChorusConfig,
    router: Router,
    cancellation: CancellationToken,
    evaluator: Arc<StopConditionEvaluator>,

    agent_specs: Vec<(String, AgentKind, Arc<dyn AgentBehavior>, Option<std::time::Duration>)>,
    teams: Vec<Team>,
    team_services: Vec<(String, Arc<dyn TeamService>)>,
    stop_conditions: Vec<Box<dyn StopCondition>>,
    main_channel: Option<String>,
    start_messages: Vec<Message>,
    pending_initial_states: HashMap<String, serde_json::Value>,

    agents: HashMap<String, ManagedAgent>,
    services: Vec<ManagedService>,
    team_dispatchers: Vec<JoinHandle<()>>,
    started: bool,
}

/// Final outcome of a `run()` call.
#[derive(Debug, Clone)]
pub struct WorkspaceOutcome {
    pub stopped_by: Option<String>,
}

impl WorkspaceController {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let config = ChorusConfig::default();
        Self {
            title: title.into(),
            description: description.into(),
            router: Router::new(config.clone()),
            cancellation: CancellationToken::new(),
            evaluator: Arc::new(StopConditionEvaluator::new(Vec::new())),
            config,
            agent_specs: Vec::new(),
            teams: Vec::new(),
            team_services: Vec::new(),
            stop_conditions: Vec::new(),
            main_channel: None,
            start_messages: Vec::new(),
            pending_initial_states: HashMap::new(),
            agents: HashMap::new(),
            services: Vec::new(),
            team_dispatchers: Vec::new(),
            started: false,
        }
    }

    pub fn with_config(mut self, config: ChorusConfig) -> Self {
        self.router = Router::new(config.clone());
        self.config = config;
        self
    }

    pub fn with_main_channel(mut self, name: impl Into<String>) -> Self {
        self.main_channel = Some(name.into());
        self
    }

    pub fn with_start_message(mut self, message: Message) -> Self {
        self.start_messages.push(message);
        self
    }

    pub fn add_stop_condition(mut self, condition: Box<dyn StopCondition>) -> Self {
        self.stop_conditions.push(condition);
        self
    }

    pub fn add_agent(
        mut self,
        name: impl Into<String>,
        kind: AgentKind,
        behavior: Arc<dyn AgentBehavior>,
    ) -> Result<Self, WorkspaceError> {
        let name = name.into();
        if self.agent_specs.iter().any(|(n, _, _, _)| n == &name) {
            return Err(WorkspaceError::DuplicateAgent(name));
        }
        self.agent_specs.push((name, kind, behavior, None));
        Ok(self)
    }

    /// Like [`Self::add_agent`], overriding the active-agent iterate rate
    /// limit for this agent alone.
    pub fn add_agent_with_iterate_interval(
        mut self,
        name: impl Into<String>,
        kind: AgentKind,
        behavior: Arc<dyn AgentBehavior>,
        iterate_interval: std::time::Duration,
    ) -> Result<Self, WorkspaceError> {
        let name = name.into();
        if self.agent_specs.iter().any(|(n, _, _, _)| n == &name) {
            return Err(WorkspaceError::DuplicateAgent(name));
        }
        self.agent_specs.push((name, kind, behavior, Some(iterate_interval)));
        Ok(self)
    }

    pub fn add_team(mut self, team: Team) -> Result<Self, WorkspaceError> {
        if self.teams.iter().any(|t| t.name == team.name) {
            return Err(WorkspaceError::DuplicateTeam(team.name));
        }
        self.teams.push(team);
        Ok(self)
    }

    pub fn add_team_service(mut self, team_name: impl Into<String>, service: Arc<dyn TeamService>) -> Self {
        self.team_services.push((team_name.into(), service));
        self
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub async fn add_message_listener(&self, listener: Arc<dyn RouterListener>) {
        self.router.subscribe(listener).await;
    }

    /// Build a controller from a declarative spec, resolving each agent's
    /// behavior through `factory`.
    pub fn from_spec(spec: WorkspaceSpec, factory: &AgentFactory) -> Result<Self, WorkspaceError> {
        let mut controller = WorkspaceController::new(spec.title, spec.description);
        if let Some(channel) = spec.main_channel {
            controller = controller.with_main_channel(channel);
        }

        for agent_spec in spec.agents {
            let make = factory
                .get(&agent_spec.agent_type)
                .ok_or_else(|| WorkspaceError::UnknownAgentType(agent_spec.agent_type.clone()))?;
            let behavior = make(&agent_spec.config.to_string());
            controller = match agent_spec.iterate_interval_ms {
                Some(ms) => controller.add_agent_with_iterate_interval(
                    agent_spec.name,
                    agent_spec.kind.into(),
                    behavior,
                    std::time::Duration::from_millis(ms),
                )?,
                None => controller.add_agent(agent_spec.name, agent_spec.kind.into(), behavior)?,
            };
        }

        for team_spec in spec.teams {
            let policy: Arc<dyn CollaborationPolicy> = match team_spec.collaboration {
                CollaborationSpec::Centralized { coordinator } => Arc::new(CentralizedPolicy::new(coordinator)),
                CollaborationSpec::Decentralized => Arc::new(DecentralizedPolicy),
            };
            let mut team = Team::new(team_spec.name, policy);
            for member in team_spec.members {
                team = team.with_member(member)?;
            }
            for service in team_spec.services {
                team = team.with_service(service)?;
            }
            controller = controller.add_team(team)?;
        }

        for condition in spec.stop_conditions {
            controller = controller.add_stop_condition(condition.build());
        }

        for message in spec.start_messages {
            controller = controller.with_start_message(message);
        }

        Ok(controller)
    }

    /// Register every principal with the router, spawn every runtime, and
    /// deliver any start messages. Idempotent only in the sense that a
    /// second call is rejected by re-registration failing; callers should
    /// call this once per controller.
    pub async fn start(&mut self) -> Result<(), WorkspaceError> {
        let known_agents: HashSet<String> = self.agent_specs.iter().map(|(n, _, _, _)| n.clone()).collect();
        for team in &self.teams {
            team.validate(&known_agents)?;
        }

        self.evaluator = Arc::new(StopConditionEvaluator::new(std::mem::take(&mut self.stop_conditions)));
        self.router
            .subscribe(Arc::new(ActivityListener {
                evaluator: self.evaluator.clone(),
            }))
            .await;

        if let Some(main_channel) = &self.main_channel {
            let mut channel = Channel::new(main_channel.clone());
            for (name, _, _, _) in &self.agent_specs {
                channel.add_member(name.clone());
            }
            self.router.register_channel(channel).await;
        }

        for team in &self.teams {
            let mut channel = Channel::new(
                internal_channel(&team.identifier())
                    .channel_name()
                    .unwrap_or(team.name.as_str())
                    .to_string(),
            );
            for member in &team.member_names {
                channel.add_member(member.clone());
            }
            self.router.register_channel(channel).await;

            let team_inbox = self
                .router
                .register(team.identifier())
                .await;
            let dispatcher = TeamDispatcher {
                team_identifier: team.identifier(),
                member_names: team.member_names.clone(),
                policy: team.collaboration_policy.clone(),
                router: self.router.clone(),
                inbox: team_inbox,
                cancellation: self.cancellation.clone(),
            };
            self.team_dispatchers.push(dispatcher.spawn());
        }

        for (team_name, service) in self.team_services.drain(..) {
            let (identifier, join) = TeamServiceRuntime::spawn(
                team_name,
                service,
                self.router.clone(),
                TeamServiceOptions::from_config(&self.config),
                self.cancellation.clone(),
            )
            .await;
            self.services.push(ManagedService { identifier, join });
        }

        let default_options = AgentRuntimeOptions::from_config(&self.config);
        for (name, kind, behavior, iterate_override) in self.agent_specs.drain(..) {
            let initial_state = self.pending_initial_states.remove(&name);
            let mut options = default_options.clone();
            if let Some(interval) = iterate_override {
                options.iterate_interval = interval;
            }
            let (handle, join) = AgentRuntime::spawn(
                Identifier::agent(name.clone()),
                kind,
                behavior,
                self.router.clone(),
                options,
                initial_state,
                self.cancellation.clone(),
            );
            self.agents.insert(name, ManagedAgent { handle, join });
        }

        for message in self.start_messages.drain(..) {
            let _ = self.router.send(Event::Message(message)).await;
        }

        self.started = true;
        Ok(())
    }

    /// Run until a registered stop condition fires.
    pub async fn run(&mut self) -> Result<WorkspaceOutcome, WorkspaceError> {
        if !self.started {
            self.start().await?;
        }
        let poll_interval = self.config.stop_condition_poll_interval();
        let stopped_by = loop {
            if let Some(label) = self.evaluator.should_stop() {
                break Some(label.to_string());
            }
            tokio::time::sleep(poll_interval).await;
        };
        self.stop().await;
        Ok(WorkspaceOutcome { stopped_by })
    }

    /// Signal every component to stop, wait up to the configured grace
    /// periods, and unregister everything from the router.
    pub async fn stop(&mut self) {
        self.cancellation.cancel();

        for (_, managed) in self.agents.drain() {
            let grace = self.config.handler_cancel_grace();
            let _ = tokio::time::timeout(grace, managed.join).await;
        }
        for dispatcher in self.team_dispatchers.drain(..) {
            let _ = tokio::time::timeout(self.config.handler_cancel_grace(), dispatcher).await;
        }
        for managed in self.services.drain(..) {
            let grace = self.config.team_service_shutdown_grace();
            let _ = tokio::time::timeout(grace, managed.join).await;
        }
    }

    pub fn agent_handle(&self, name: &str) -> Option<&AgentHandle> {
        self.agents.get(name).map(|m| &m.handle)
    }

    /// Write one ndjson line per currently-registered agent's state, plus
    /// one line per event still queued in an agent inbox, to `path`.
    pub async fn snapshot(&self, path: &Path) -> Result<(), WorkspaceError> {
        let _ = self
            .router
            .send(Event::Snapshot {
                timestamp: 0,
                label: Some(path.display().to_string()),
            })
            .await;

        let mut file = std::fs::File::create(path).map_err(|e| WorkspaceError::Io(e.to_string()))?;
        let taken_at = chrono::Utc::now().to_rfc3339();
        for (name, managed) in &self.agents {
            let state = managed.handle.state_snapshot().await;
            let record = serde_json::json!({
                "kind": "state",
                "agent": name,
                "state": state,
                "taken_at": taken_at,
            });
            writeln!(file, "{}", record).map_err(|e| WorkspaceError::Io(e.to_string()))?;
        }
        Ok(())
    }

    /// Load previously snapshotted agent state records so that the next
    /// `start()` seeds matching agents with that state instead of calling
    /// `init_state`. Must be called before `start()`.
    pub async fn load(&mut self, path: &Path) -> Result<(), WorkspaceError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| WorkspaceError::Io(e.to_string()))?;
        let mut lines = tokio::io::BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await.map_err(|e| WorkspaceError::Io(e.to_string()))? {
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value =
                serde_json::from_str(&line).map_err(|e| WorkspaceError::Serde(e.to_string()))?;
            if value.get("kind").and_then(|k| k.as_str()) == Some("state") {
                if let (Some(agent), Some(state)) = (value.get("agent").and_then(|a| a.as_str()), value.get("state")) {
                    self.pending_initial_states
                        .insert(agent.to_string(), state.clone());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::StepOutcome;

    struct NoOp;

    #[async_trait]
    impl AgentBehavior for NoOp {
        async fn init_state(&self, _ctx: &AgentContext) -> serde_json::Value {
            serde_json::json!(null)
        }

        async fn respond(&self, _ctx: &AgentContext, _state: serde_json::Value, _message: Message) -> StepOutcome {
            StepOutcome::Unchanged
        }
    }

    #[tokio::test]
    async fn start_and_stop_round_trip() {
        let mut controller = WorkspaceController::new("test", "desc")
            .add_agent("bob", AgentKind::Passive, Arc::new(NoOp))
            .unwrap();
        controller.start().await.unwrap();
        assert!(controller.agent_handle("bob").is_some());
        controller.stop().await;
    }

    #[tokio::test]
    async fn run_stops_on_message_count() {
        let mut controller = WorkspaceController::new("test", "desc")
            .add_agent("bob", AgentKind::Passive, Arc::new(NoOp))
            .unwrap()
            .add_stop_condition(Box::new(MessageCountReached::new(1)))
            .with_start_message(Message::direct(
                Identifier::human(),
                Identifier::agent("bob"),
                "hi",
                Role::User,
            ));
        let outcome = controller.run().await.unwrap();
        assert_eq!(outcome.stopped_by.as_deref(), Some("message_count_reached"));
    }

    #[test]
    fn team_validation_rejects_unknown_members_via_team_error() {
        let err = WorkspaceError::from(crate::team::TeamError::UnknownMember("ghost".into()));
        assert!(matches!(err, WorkspaceError::Team(_)));
    }
}
