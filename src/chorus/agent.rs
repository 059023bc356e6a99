//! Per-agent actor: one dedicated task, one FIFO inbox, a finite-state
//! lifecycle, and exactly one in-flight step at a time.

use crate::cancellation::CancellationToken;
use crate::config::ChorusConfig;
use crate::event::Event;
use crate::identifier::Identifier;
use crate::inbox::Inbox;
use crate::message::{ErrorKind, Message, ToolInvocation, ToolObservation};
use crate::router::Router;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;

/// Whether an agent acts only when spoken to, or also gets to think on its
/// own between messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// Only `respond()` is ever called, when a message arrives.
    Passive,
    /// `iterate()` is called on a rate-limited cadence whenever the inbox
    /// is empty, in addition to `respond()` when a message arrives.
    Active,
}

/// What a single step of an agent's behavior did to its private state.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The step produced a new opaque state; outbound sends made during the
    /// step are committed atomically with this transition.
    NewState(serde_json::Value),
    /// The step made no state change (but any sends it queued are still
    /// committed).
    Unchanged,
    /// The handler failed; no state change and no queued sends are
    /// committed.
    Crashed(String),
}

/// The capability every agent implements: how it reacts to an inbound
/// message, and — for [`AgentKind::Active`] agents — how it spends idle
/// time. State is an opaque JSON value the runtime threads through calls
/// and is responsible for persisting; `AgentBehavior` implementations never
/// hold it themselves.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    /// Produce the agent's initial state when its runtime starts.
    async fn init_state(&self, ctx: &AgentContext) -> serde_json::Value;

    /// Handle one inbound message.
    async fn respond(
        &self,
        ctx: &AgentContext,
        state: serde_json::Value,
        message: Message,
    ) -> StepOutcome;

    /// Called instead of `respond` when the inbox is empty, for
    /// [`AgentKind::Active`] agents only, no more often than the
    /// configured `iterate_interval`.
    async fn iterate(&self, ctx: &AgentContext, _state: serde_json::Value) -> StepOutcome {
        let _ = ctx;
        StepOutcome::Unchanged
    }
}

/// Construct an agent's [`AgentBehavior`] from its declarative
/// [`crate::workspace::AgentSpec`]. Keyed by `AgentSpec.agent_type`.
pub type AgentFactory = HashMap<String, Arc<dyn Fn(&str) -> Arc<dyn AgentBehavior> + Send + Sync>>;

#[derive(Debug, Clone)]
pub enum AgentRuntimeError {
    HandlerCrash(String),
    Cancelled,
}

impl fmt::Display for AgentRuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRuntimeError::HandlerCrash(reason) => write!(f, "handler crashed: {}", reason),
            AgentRuntimeError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for AgentRuntimeError {}

/// The lifecycle an [`AgentRuntime`] moves through, in order, never
/// skipping or reversing a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentLifecycle {
    Created,
    Initializing,
    Idle,
    Running,
    Stopping,
    Stopped,
}

struct ReplyRegistry {
    pending: AsyncMutex<HashMap<String, oneshot::Sender<ToolObservation>>>,
}

impl ReplyRegistry {
    fn new() -> Self {
        Self {
            pending: AsyncMutex::new(HashMap::new()),
        }
    }

    async fn register(&self, invocation_id: String) -> oneshot::Receiver<ToolObservation> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(invocation_id, tx);
        rx
    }

    async fn resolve(&self, invocation_id: &str, observation: ToolObservation) -> bool {
        if let Some(tx) = self.pending.lock().await.remove(invocation_id) {
            let _ = tx.send(observation);
            true
        } else {
            false
        }
    }
}

/// Handle an [`AgentBehavior`] uses to act on the world: send messages, see
/// what channels it belongs to, peek its own inbox, and invoke team
/// services. Constructed fresh per step by the runtime.
pub struct AgentContext {
    name: Identifier,
    reply_identifier: Identifier,
    router: Router,
    inbox: Inbox,
    cancellation: CancellationToken,
    started_at_tick: u64,
    replies: Arc<ReplyRegistry>,
    pending_sends: std::sync::Mutex<Vec<Event>>,
}

impl AgentContext {
    fn new(
        name: Identifier,
        reply_identifier: Identifier,
        router: Router,
        inbox: Inbox,
        cancellation: CancellationToken,
        replies: Arc<ReplyRegistry>,
    ) -> Self {
        let started_at_tick = router.current_tick();
        Self {
            name,
            reply_identifier,
            router,
            inbox,
            cancellation,
            started_at_tick,
            replies,
            pending_sends: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.name
    }

    /// Queue a message for delivery. The `source` field is stamped with
    /// this agent's identity regardless of what the caller set. Queued
    /// sends are not delivered until the step completes without crashing;
    /// a `StepOutcome::Crashed` step discards everything queued during it.
    pub fn send(&self, message: Message) {
        let mut message = message;
        message.source = self.name.clone();
        self.pending_sends.lock().unwrap().push(Event::Message(message));
    }

    pub async fn list_channels(&self) -> Vec<Identifier> {
        self.router.channels_for_member(self.name.as_str()).await
    }

    /// Non-destructive peek at everything currently queued in this agent's
    /// own inbox.
    pub fn list_inbox(&self) -> Vec<Event> {
        self.inbox.snapshot()
    }

    /// The router's logical clock at the moment this step began.
    pub fn now(&self) -> u64 {
        self.started_at_tick
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn team_services(&self) -> TeamServiceClient<'_> {
        TeamServiceClient { ctx: self }
    }

    fn drain_pending_sends(&self) -> Vec<Event> {
        std::mem::take(&mut *self.pending_sends.lock().unwrap())
    }
}

/// The handle `AgentContext::team_services()` hands back for invoking
/// team-provided tools.
pub struct TeamServiceClient<'a> {
    ctx: &'a AgentContext,
}

impl<'a> TeamServiceClient<'a> {
    /// Fire a request and suspend until the matching response arrives, the
    /// service's own deadline elapses, or the workspace is cancelled.
    /// Implements the two-step fire-and-forget protocol transparently: the
    /// request is routed immediately (so the agent's own step is not what's
    /// blocking the service), and the response is correlated by
    /// `invocation_id` independent of anything else arriving in the
    /// agent's inbox in the meantime.
    pub async fn invoke(
        &self,
        service: Identifier,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
        deadline: Option<Duration>,
    ) -> ToolObservation {
        let invocation = ToolInvocation::new(tool_name, arguments);
        let invocation = match deadline {
            Some(d) => invocation.with_deadline_ms(d.as_millis() as u64),
            None => invocation,
        };
        let invocation_id = invocation.invocation_id.clone();

        let receiver = self.ctx.replies.register(invocation_id.clone()).await;

        // The request's `source` is the agent's dedicated reply address,
        // not its public identity: the team-service runtime replies to
        // `source`, and replies must land on a inbox only the reply pump
        // consumes so they can never be stolen by the main dispatch loop
        // while it is itself blocked awaiting this call.
        let request = Message::direct(
            self.ctx.reply_identifier.clone(),
            service.clone(),
            "",
            crate::message::Role::Tool,
        )
        .with_actions(vec![invocation]);

        if let Err(e) = self
            .ctx
            .router
            .send(Event::TeamServiceRequest(request))
            .await
        {
            return ToolObservation::failure(invocation_id, ErrorKind::UnknownIdentifier, e.to_string());
        }

        tokio::select! {
            _ = self.ctx.cancellation.cancelled() => {
                ToolObservation::failure(invocation_id, ErrorKind::Cancelled, "workspace stopped")
            }
            result = receiver => {
                match result {
                    Ok(observation) => observation,
                    Err(_) => ToolObservation::failure(invocation_id, ErrorKind::Cancelled, "reply channel dropped"),
                }
            }
        }
    }
}

/// Options controlling a single agent's runtime loop, falling back to the
/// workspace-wide [`ChorusConfig`] when not overridden.
#[derive(Debug, Clone)]
pub struct AgentRuntimeOptions {
    pub iterate_interval: Duration,
    pub backpressure_timeout: Duration,
    pub cancel_grace: Duration,
}

impl AgentRuntimeOptions {
    pub fn from_config(config: &ChorusConfig) -> Self {
        Self {
            iterate_interval: config.iterate_interval(),
            backpressure_timeout: config.backpressure_timeout(),
            cancel_grace: config.handler_cancel_grace(),
        }
    }
}

/// A lightweight, cloneable view onto a running agent: enough to observe
/// its lifecycle and state, or ask it to stop, without owning its task.
#[derive(Clone)]
pub struct AgentHandle {
    pub name: Identifier,
    lifecycle: Arc<RwLock<AgentLifecycle>>,
    state: Arc<RwLock<serde_json::Value>>,
    cancellation: CancellationToken,
}

impl AgentHandle {
    pub async fn lifecycle(&self) -> AgentLifecycle {
        *self.lifecycle.read().await
    }

    pub async fn state_snapshot(&self) -> serde_json::Value {
        self.state.read().await.clone()
    }

    pub fn stop(&self) {
        self.cancellation.cancel();
    }
}

/// Drives one agent's behavior on a dedicated task: pop-or-idle scheduling,
/// all-or-nothing commit of sends per step, and graceful shutdown.
pub struct AgentRuntime;

impl AgentRuntime {
    /// Spawn the agent's task. Returns a handle for observation/control and
    /// the `JoinHandle` so the workspace can await full shutdown.
    pub fn spawn(
        name: Identifier,
        kind: AgentKind,
        behavior: Arc<dyn AgentBehavior>,
        router: Router,
        options: AgentRuntimeOptions,
        initial_state: Option<serde_json::Value>,
        cancellation: CancellationToken,
    ) -> (AgentHandle, JoinHandle<Result<(), AgentRuntimeError>>) {
        let lifecycle = Arc::new(RwLock::new(AgentLifecycle::Created));
        let state_cell = Arc::new(RwLock::new(serde_json::Value::Null));
        let replies = Arc::new(ReplyRegistry::new());
        let reply_identifier = Identifier::agent(format!("{}#replies", name.as_str()));

        let handle = AgentHandle {
            name: name.clone(),
            lifecycle: lifecycle.clone(),
            state: state_cell.clone(),
            cancellation: cancellation.clone(),
        };

        let join = tokio::spawn(async move {
            *lifecycle.write().await = AgentLifecycle::Initializing;
            let inbox = router.register(name.clone()).await;

            // Team-service responses are addressed to this dedicated
            // identifier and drained by a separate task below, so that a
            // `team_services().invoke()` call blocking inside `respond`
            // never has to wait on itself to pump its own inbox.
            let reply_inbox = router.register(reply_identifier.clone()).await;
            let reply_pump = tokio::spawn(reply_pump(
                reply_inbox,
                replies.clone(),
                cancellation.clone(),
            ));

            let ctx = AgentContext::new(
                name.clone(),
                reply_identifier.clone(),
                router.clone(),
                inbox.clone(),
                cancellation.clone(),
                replies.clone(),
            );

            let mut state = match initial_state {
                Some(s) => s,
                None => behavior.init_state(&ctx).await,
            };
            *state_cell.write().await = state.clone();

            let _ = router
                .send(Event::AgentStarted {
                    agent: name.clone(),
                    timestamp: 0,
                })
                .await;

            *lifecycle.write().await = AgentLifecycle::Idle;

            let mut last_iterate = tokio::time::Instant::now() - options.iterate_interval;
            let result = loop {
                if cancellation.is_cancelled() {
                    break Ok(());
                }

                if let Some(event) = inbox.try_recv() {
                    if let Event::Message(msg) = event {
                        *lifecycle.write().await = AgentLifecycle::Running;
                        let ctx = AgentContext::new(
                            name.clone(),
                            reply_identifier.clone(),
                            router.clone(),
                            inbox.clone(),
                            cancellation.clone(),
                            replies.clone(),
                        );
                        let outcome = behavior.respond(&ctx, state.clone(), msg).await;
                        match Self::commit_step(&router, &ctx, outcome, &mut state).await {
                            Ok(()) => {}
                            Err(reason) => break Err(AgentRuntimeError::HandlerCrash(reason)),
                        }
                        *state_cell.write().await = state.clone();
                        *lifecycle.write().await = AgentLifecycle::Idle;
                    }
                    continue;
                }

                if kind == AgentKind::Active {
                    let elapsed = last_iterate.elapsed();
                    if elapsed < options.iterate_interval {
                        // Sleep out the remainder of the rate-limit window.
                        // Any message that arrives during the sleep is
                        // picked up by the `try_recv` at the top of the
                        // next iteration, so responding still takes
                        // priority over iterating without this wait
                        // consuming (and dropping) it here.
                        tokio::select! {
                            _ = tokio::time::sleep(options.iterate_interval - elapsed) => {}
                            _ = cancellation.cancelled() => break Ok(()),
                        }
                        continue;
                    }
                    last_iterate = tokio::time::Instant::now();
                    *lifecycle.write().await = AgentLifecycle::Running;
                    let ctx = AgentContext::new(
                        name.clone(),
                        reply_identifier.clone(),
                        router.clone(),
                        inbox.clone(),
                        cancellation.clone(),
                        replies.clone(),
                    );
                    let outcome = behavior.iterate(&ctx, state.clone()).await;
                    match Self::commit_step(&router, &ctx, outcome, &mut state).await {
                        Ok(()) => {}
                        Err(reason) => break Err(AgentRuntimeError::HandlerCrash(reason)),
                    }
                    *state_cell.write().await = state.clone();
                    *lifecycle.write().await = AgentLifecycle::Idle;
                    continue;
                }

                tokio::select! {
                    _ = cancellation.cancelled() => break Ok(()),
                    event = inbox_wait(&inbox) => {
                        if let Some(Event::Message(msg)) = event {
                            *lifecycle.write().await = AgentLifecycle::Running;
                            let ctx = AgentContext::new(
                                name.clone(),
                                reply_identifier.clone(),
                                router.clone(),
                                inbox.clone(),
                                cancellation.clone(),
                                replies.clone(),
                            );
                            let outcome = behavior.respond(&ctx, state.clone(), msg).await;
                            match Self::commit_step(&router, &ctx, outcome, &mut state).await {
                                Ok(()) => {
                                    *state_cell.write().await = state.clone();
                                    *lifecycle.write().await = AgentLifecycle::Idle;
                                }
                                Err(reason) => {
                                    break Err(AgentRuntimeError::HandlerCrash(reason));
                                }
                            }
                        }
                    }
                }
            };

            *lifecycle.write().await = AgentLifecycle::Stopping;
            inbox.close();
            router.unregister(&name).await;
            reply_pump.abort();
            router.unregister(&reply_identifier).await;
            let _ = router
                .send(Event::AgentStopped {
                    agent: name.clone(),
                    timestamp: 0,
                })
                .await;
            *lifecycle.write().await = AgentLifecycle::Stopped;
            result
        });

        (handle, join)
    }

    async fn commit_step(
        router: &Router,
        ctx: &AgentContext,
        outcome: StepOutcome,
        state: &mut serde_json::Value,
    ) -> Result<(), String> {
        match outcome {
            StepOutcome::Crashed(reason) => {
                ctx.drain_pending_sends();
                let _ = router
                    .send(Event::HandlerCrash {
                        source: ctx.name.clone(),
                        message: reason.clone(),
                        timestamp: 0,
                    })
                    .await;
                Err(reason)
            }
            outcome => {
                let pending = ctx.drain_pending_sends();
                if let StepOutcome::NewState(new_state) = outcome {
                    *state = new_state;
                }
                for event in pending {
                    let _ = router.send(event).await;
                }
                Ok(())
            }
        }
    }
}

async fn inbox_wait(inbox: &Inbox) -> Option<Event> {
    inbox.recv().await
}

/// Drains an agent's dedicated reply inbox and resolves the matching
/// `oneshot` in `replies` for each `TeamServiceResponse` that arrives,
/// independent of whatever the agent's main dispatch loop is doing.
async fn reply_pump(inbox: Inbox, replies: Arc<ReplyRegistry>, cancellation: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            event = inbox_wait(&inbox) => {
                match event {
                    Some(Event::TeamServiceResponse(msg)) => {
                        if let (Some(reply_to), Some(observation)) =
                            (msg.reply_to.clone(), msg.observations.first().cloned())
                        {
                            replies.resolve(&reply_to, observation).await;
                        }
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    struct Echo;

    #[async_trait]
    impl AgentBehavior for Echo {
        async fn init_state(&self, _ctx: &AgentContext) -> serde_json::Value {
            serde_json::json!({"count": 0})
        }

        async fn respond(
            &self,
            ctx: &AgentContext,
            state: serde_json::Value,
            message: Message,
        ) -> StepOutcome {
            let count = state["count"].as_i64().unwrap_or(0) + 1;
            ctx.send(Message::direct(
                ctx.identifier().clone(),
                message.source,
                message.content,
                Role::Agent,
            ));
            StepOutcome::NewState(serde_json::json!({"count": count}))
        }
    }

    #[tokio::test]
    async fn passive_agent_echoes_and_updates_state() {
        let router = Router::new(ChorusConfig::default());
        let sender_inbox = router.register(Identifier::agent("sender")).await;

        let (handle, join) = AgentRuntime::spawn(
            Identifier::agent("echo"),
            AgentKind::Passive,
            Arc::new(Echo),
            router.clone(),
            AgentRuntimeOptions::from_config(&ChorusConfig::default()),
            None,
            CancellationToken::new(),
        );

        // give the runtime a moment to register and reach Idle.
        tokio::time::sleep(Duration::from_millis(20)).await;

        router
            .send(Event::Message(Message::direct(
                Identifier::agent("sender"),
                Identifier::agent("echo"),
                "ping",
                Role::User,
            )))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_millis(500), sender_inbox.recv())
            .await
            .expect("reply should arrive")
            .unwrap();
        assert_eq!(reply.as_message().unwrap().content.as_ref(), "ping");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.state_snapshot().await["count"], 1);

        handle.stop();
        join.await.unwrap().unwrap();
        assert_eq!(handle.lifecycle().await, AgentLifecycle::Stopped);
    }
}
