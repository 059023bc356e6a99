//! End-to-end scenarios exercising a [`WorkspaceController`] the way a
//! caller actually would: build agents and teams, start the workspace,
//! drive it with messages, and observe what comes out.

use async_trait::async_trait;
use chorus::{
    AgentBehavior, AgentContext, AgentKind, CentralizedPolicy, ChorusConfig, Event, Identifier, Message,
    MessageCountReached, Role, StepOutcome, Team, TeamService, ToolInvocation, ToolObservation,
    WorkspaceController,
};
use std::sync::Arc;
use std::time::Duration;

/// Echoes every message it receives back to its sender, tracking a
/// received count in state.
struct Echo;

#[async_trait]
impl AgentBehavior for Echo {
    async fn init_state(&self, _ctx: &AgentContext) -> serde_json::Value {
        serde_json::json!({"received": 0})
    }

    async fn respond(&self, ctx: &AgentContext, state: serde_json::Value, message: Message) -> StepOutcome {
        let received = state["received"].as_i64().unwrap_or(0) + 1;
        ctx.send(Message::direct(
            ctx.identifier().clone(),
            message.source,
            message.content,
            Role::Agent,
        ));
        StepOutcome::NewState(serde_json::json!({"received": received}))
    }
}

/// Forwards every message it receives to a fixed downstream agent.
struct Forwarder {
    downstream: Identifier,
}

#[async_trait]
impl AgentBehavior for Forwarder {
    async fn init_state(&self, _ctx: &AgentContext) -> serde_json::Value {
        serde_json::json!(null)
    }

    async fn respond(&self, ctx: &AgentContext, _state: serde_json::Value, message: Message) -> StepOutcome {
        ctx.send(Message::direct(
            ctx.identifier().clone(),
            self.downstream.clone(),
            message.content,
            Role::Agent,
        ));
        StepOutcome::Unchanged
    }
}

/// A team service that doubles a number, used to exercise the
/// request/response round trip from inside an agent step.
struct Doubler;

#[async_trait]
impl TeamService for Doubler {
    fn tool_name(&self) -> &str {
        "double"
    }

    async fn call(&self, invocation: ToolInvocation) -> ToolObservation {
        let n = invocation.arguments["n"].as_i64().unwrap_or(0);
        ToolObservation::success(invocation.invocation_id, serde_json::json!({"result": n * 2}))
    }
}

/// Calls a team service once on its first message, then reports the result
/// back to whoever sent it.
struct ServiceCaller {
    service: Identifier,
}

#[async_trait]
impl AgentBehavior for ServiceCaller {
    async fn init_state(&self, _ctx: &AgentContext) -> serde_json::Value {
        serde_json::json!(null)
    }

    async fn respond(&self, ctx: &AgentContext, _state: serde_json::Value, message: Message) -> StepOutcome {
        let observation = ctx
            .team_services()
            .invoke(self.service.clone(), "double", serde_json::json!({"n": 21}), None)
            .await;
        let reply = observation
            .result
            .map(|r| r.to_string())
            .unwrap_or_else(|| "error".to_string());
        ctx.send(Message::direct(
            ctx.identifier().clone(),
            message.source,
            reply,
            Role::Agent,
        ));
        StepOutcome::Unchanged
    }
}

#[tokio::test]
async fn e1_direct_message_round_trip() {
    let mut workspace = WorkspaceController::new("e1", "direct round trip")
        .add_agent("echo", AgentKind::Passive, Arc::new(Echo))
        .unwrap();
    workspace.start().await.unwrap();

    let router = workspace.router();
    let human_inbox = router.register(Identifier::human()).await;
    router
        .send(Event::Message(Message::direct(
            Identifier::human(),
            Identifier::agent("echo"),
            "hello",
            Role::User,
        )))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_millis(500), human_inbox.recv())
        .await
        .expect("echo should reply")
        .unwrap();
    assert_eq!(reply.as_message().unwrap().content.as_ref(), "hello");

    workspace.stop().await;
}

#[tokio::test]
async fn e2_multi_hop_forward_chain() {
    let mut workspace = WorkspaceController::new("e2", "forward chain")
        .add_agent("echo", AgentKind::Passive, Arc::new(Echo))
        .unwrap()
        .add_agent(
            "forwarder",
            AgentKind::Passive,
            Arc::new(Forwarder {
                downstream: Identifier::agent("echo"),
            }),
        )
        .unwrap();
    workspace.start().await.unwrap();

    let router = workspace.router();
    let human_inbox = router.register(Identifier::human()).await;
    router
        .send(Event::Message(Message::direct(
            Identifier::human(),
            Identifier::agent("forwarder"),
            "relay",
            Role::User,
        )))
        .await
        .unwrap();

    // forwarder relays to echo, echo replies to forwarder (not back to the
    // human) since it echoes to `message.source`.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(human_inbox.is_empty());

    workspace.stop().await;
}

#[tokio::test]
async fn e3_centralized_team_routes_through_coordinator() {
    let team = Team::new("research", Arc::new(CentralizedPolicy::new("lead")))
        .with_member("lead")
        .unwrap()
        .with_member("aide")
        .unwrap();

    let mut workspace = WorkspaceController::new("e3", "centralized team")
        .add_agent("lead", AgentKind::Passive, Arc::new(Echo))
        .unwrap()
        .add_agent("aide", AgentKind::Passive, Arc::new(Echo))
        .unwrap()
        .add_team(team)
        .unwrap();
    workspace.start().await.unwrap();

    let router = workspace.router();
    let human_inbox = router.register(Identifier::human()).await;
    router
        .send(Event::Message(Message::direct(
            Identifier::human(),
            Identifier::team("research"),
            "status?",
            Role::User,
        )))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_millis(500), human_inbox.recv())
        .await
        .expect("coordinator should reply back to original sender")
        .unwrap();
    assert_eq!(reply.as_message().unwrap().content.as_ref(), "status?");

    workspace.stop().await;
}

#[tokio::test]
async fn e4_team_service_round_trip() {
    let mut workspace = WorkspaceController::new("e4", "team service")
        .add_agent(
            "caller",
            AgentKind::Passive,
            Arc::new(ServiceCaller {
                service: Identifier::service("research", "double"),
            }),
        )
        .unwrap()
        .add_team_service("research", Arc::new(Doubler));
    workspace.start().await.unwrap();

    let router = workspace.router();
    let human_inbox = router.register(Identifier::human()).await;
    router
        .send(Event::Message(Message::direct(
            Identifier::human(),
            Identifier::agent("caller"),
            "go",
            Role::User,
        )))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_millis(500), human_inbox.recv())
        .await
        .expect("caller should report the service result")
        .unwrap();
    assert_eq!(reply.as_message().unwrap().content.as_ref(), r#"{"result":42}"#);

    workspace.stop().await;
}

#[tokio::test]
async fn e5_workspace_stops_on_message_count() {
    let mut workspace = WorkspaceController::new("e5", "stop condition")
        .add_agent("echo", AgentKind::Passive, Arc::new(Echo))
        .unwrap()
        .add_stop_condition(Box::new(MessageCountReached::new(1)))
        .with_start_message(Message::direct(
            Identifier::human(),
            Identifier::agent("echo"),
            "hi",
            Role::User,
        ));

    let outcome = tokio::time::timeout(Duration::from_secs(2), workspace.run())
        .await
        .expect("workspace should stop on its own")
        .unwrap();
    assert_eq!(outcome.stopped_by.as_deref(), Some("message_count_reached"));
}

#[tokio::test]
async fn e6_unknown_destination_surfaces_as_error_not_panic() {
    let mut workspace = WorkspaceController::new("e6", "unknown destination")
        .add_agent("echo", AgentKind::Passive, Arc::new(Echo))
        .unwrap();
    workspace.start().await.unwrap();

    let router = workspace.router();
    let result = router
        .send(Event::Message(Message::direct(
            Identifier::human(),
            Identifier::agent("ghost"),
            "hi",
            Role::User,
        )))
        .await;
    assert!(result.is_err());

    workspace.stop().await;
}

#[tokio::test]
async fn config_overrides_apply_to_router_defaults() {
    let mut config = ChorusConfig::default();
    config.inbox_capacity = 4;
    let workspace = WorkspaceController::new("config", "override").with_config(config.clone());
    assert_eq!(workspace.router().config().inbox_capacity, 4);
}
