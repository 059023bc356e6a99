//! Team-provided tools, invoked by agents and executed with bounded
//! parallelism on their own dedicated task.

use crate::cancellation::CancellationToken;
use crate::config::ChorusConfig;
use crate::event::Event;
use crate::identifier::Identifier;
use crate::message::{ErrorKind, Message, ToolObservation};
use crate::router::Router;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

/// A tool a team exposes to its members. One invocation at a time per
/// `invocation_id`; concurrent invocations across ids are bounded by
/// `TeamServiceOptions::parallelism`.
#[async_trait]
pub trait TeamService: Send + Sync {
    fn tool_name(&self) -> &str;
    async fn call(&self, invocation: crate::message::ToolInvocation) -> ToolObservation;
}

#[derive(Debug, Clone)]
pub struct TeamServiceOptions {
    pub parallelism: usize,
    pub shutdown_grace: Duration,
}

impl TeamServiceOptions {
    pub fn from_config(config: &ChorusConfig) -> Self {
        Self {
            parallelism: config.team_service_parallelism,
            shutdown_grace: config.team_service_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TeamServiceError {
    DuplicateInvocation(String),
    Timeout(String),
    Cancelled,
}

impl TeamServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TeamServiceError::DuplicateInvocation(_) => ErrorKind::DuplicateInvocation,
            TeamServiceError::Timeout(_) => ErrorKind::Timeout,
            TeamServiceError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl fmt::Display for TeamServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeamServiceError::DuplicateInvocation(id) => {
                write!(f, "duplicate invocation: {}", id)
            }
            TeamServiceError::Timeout(id) => write!(f, "invocation {} timed out", id),
            TeamServiceError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for TeamServiceError {}

/// Drives a single [`TeamService`] on its own task: pulls
/// `TeamServiceRequest` events addressed to it, runs each with bounded
/// parallelism, and replies with a `TeamServiceResponse`.
pub struct TeamServiceRuntime;

impl TeamServiceRuntime {
    /// Register the service under `service:<team>/<tool_name>` and spawn
    /// its task. Returns the identifier it was registered under and the
    /// `JoinHandle` for the workspace to await on shutdown.
    pub async fn spawn(
        team: impl AsRef<str>,
        service: Arc<dyn TeamService>,
        router: Router,
        options: TeamServiceOptions,
        cancellation: CancellationToken,
    ) -> (Identifier, JoinHandle<()>) {
        let identifier = Identifier::service(team.as_ref(), service.tool_name());
        let inbox = router.register(identifier.clone()).await;
        let semaphore = Arc::new(Semaphore::new(options.parallelism.max(1)));
        let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        let identifier_for_task = identifier.clone();
        let join = tokio::spawn(async move {
            let mut workers: Vec<JoinHandle<()>> = Vec::new();
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    event = inbox.recv() => {
                        match event {
                            Some(Event::TeamServiceRequest(msg)) => {
                                let service = service.clone();
                                let router = router.clone();
                                let semaphore = semaphore.clone();
                                let in_flight = in_flight.clone();
                                let identifier = identifier_for_task.clone();
                                workers.push(tokio::spawn(async move {
                                    handle_request(service, router, semaphore, in_flight, identifier, msg).await;
                                }));
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }

            // Drain whatever is still queued, up to the grace period,
            // before force-cancelling anything left outstanding.
            let drain_deadline = tokio::time::Instant::now() + options.shutdown_grace;
            while tokio::time::Instant::now() < drain_deadline {
                match inbox.try_recv() {
                    Some(Event::TeamServiceRequest(msg)) => {
                        let service = service.clone();
                        let router = router.clone();
                        let semaphore = semaphore.clone();
                        let in_flight = in_flight.clone();
                        let identifier = identifier_for_task.clone();
                        workers.push(tokio::spawn(async move {
                            handle_request(service, router, semaphore, in_flight, identifier, msg).await;
                        }));
                    }
                    Some(_) => {}
                    None => break,
                }
            }

            let remaining = drain_deadline.saturating_duration_since(tokio::time::Instant::now());
            let _ = tokio::time::timeout(remaining, futures_join_all(&mut workers)).await;
            for w in workers {
                w.abort();
            }
            inbox.close();
            router.unregister(&identifier_for_task).await;
        });

        (identifier, join)
    }
}

async fn futures_join_all(workers: &mut [JoinHandle<()>]) {
    for w in workers.iter_mut() {
        let _ = w.await;
    }
}

async fn handle_request(
    service: Arc<dyn TeamService>,
    router: Router,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    identifier: Identifier,
    msg: Message,
) {
    let invocation = match msg.actions.first().cloned() {
        Some(i) => i,
        None => return,
    };
    let invocation_id = invocation.invocation_id.clone();

    {
        let mut in_flight = in_flight.lock().await;
        if !in_flight.insert(invocation_id.clone()) {
            drop(in_flight);
            reply(
                &router,
                &identifier,
                &msg,
                ToolObservation::failure(
                    invocation_id,
                    ErrorKind::DuplicateInvocation,
                    "invocation already outstanding",
                ),
            )
            .await;
            return;
        }
    }

    let _permit = match semaphore.acquire().await {
        Ok(permit) => permit,
        Err(_) => {
            in_flight.lock().await.remove(&invocation_id);
            reply(
                &router,
                &identifier,
                &msg,
                ToolObservation::failure(invocation_id, ErrorKind::Cancelled, "team service is shutting down"),
            )
            .await;
            return;
        }
    };
    let observation = match invocation.deadline_ms {
        Some(ms) => {
            match tokio::time::timeout(Duration::from_millis(ms), service.call(invocation)).await {
                Ok(obs) => obs,
                Err(_) => ToolObservation::failure(
                    invocation_id.clone(),
                    ErrorKind::Timeout,
                    "tool invocation exceeded its deadline",
                ),
            }
        }
        None => service.call(invocation).await,
    };

    in_flight.lock().await.remove(&invocation_id);
    reply(&router, &identifier, &msg, observation).await;
}

async fn reply(router: &Router, identifier: &Identifier, request: &Message, observation: ToolObservation) {
    let response = Message::direct(
        identifier.clone(),
        request.source.clone(),
        "",
        crate::message::Role::Tool,
    )
    .with_reply_to(observation.invocation_id.clone())
    .with_observations(vec![observation]);
    let _ = router.send(Event::TeamServiceResponse(response)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Identifier as Id;
    use crate::message::ToolInvocation;

    struct Double;

    #[async_trait]
    impl TeamService for Double {
        fn tool_name(&self) -> &str {
            "double"
        }

        async fn call(&self, invocation: crate::message::ToolInvocation) -> ToolObservation {
            let n = invocation.arguments["n"].as_i64().unwrap_or(0);
            ToolObservation::success(invocation.invocation_id, serde_json::json!({"result": n * 2}))
        }
    }

    #[tokio::test]
    async fn invocation_round_trips_through_router() {
        let router = Router::new(ChorusConfig::default());
        let agent_inbox = router.register(Id::agent("caller")).await;
        let cancellation = CancellationToken::new();

        let (service_id, _join) = TeamServiceRuntime::spawn(
            "research",
            Arc::new(Double),
            router.clone(),
            TeamServiceOptions::from_config(&ChorusConfig::default()),
            cancellation.clone(),
        )
        .await;
        assert_eq!(service_id, Identifier::service("research", "double"));

        let invocation = ToolInvocation::new("double", serde_json::json!({"n": 21}));
        let invocation_id = invocation.invocation_id.clone();
        let request = Message::direct(Id::agent("caller"), service_id, "", crate::message::Role::Tool)
            .with_actions(vec![invocation]);
        router.send(Event::TeamServiceRequest(request)).await.unwrap();

        let response = tokio::time::timeout(Duration::from_millis(500), agent_inbox.recv())
            .await
            .unwrap()
            .unwrap();
        let msg = response.as_message().unwrap();
        assert_eq!(msg.reply_to.as_deref(), Some(invocation_id.as_str()));
        assert_eq!(msg.observations[0].result, Some(serde_json::json!({"result": 42})));

        cancellation.cancel();
    }

    #[tokio::test]
    async fn duplicate_invocation_is_rejected() {
        let router = Router::new(ChorusConfig::default());
        let agent_inbox = router.register(Id::agent("caller")).await;
        let cancellation = CancellationToken::new();

        struct Slow;
        #[async_trait]
        impl TeamService for Slow {
            fn tool_name(&self) -> &str {
                "slow"
            }
            async fn call(&self, invocation: crate::message::ToolInvocation) -> ToolObservation {
                tokio::time::sleep(Duration::from_millis(100)).await;
                ToolObservation::success(invocation.invocation_id, serde_json::json!(null))
            }
        }

        let (service_id, _join) = TeamServiceRuntime::spawn(
            "research",
            Arc::new(Slow),
            router.clone(),
            TeamServiceOptions::from_config(&ChorusConfig::default()),
            cancellation.clone(),
        )
        .await;

        let invocation = ToolInvocation::new("slow", serde_json::json!({}));
        let invocation_id = invocation.invocation_id.clone();
        for _ in 0..2 {
            let request = Message::direct(
                Id::agent("caller"),
                service_id.clone(),
                "",
                crate::message::Role::Tool,
            )
            .with_actions(vec![invocation.clone()]);
            router.send(Event::TeamServiceRequest(request)).await.unwrap();
        }

        let first = tokio::time::timeout(Duration::from_millis(500), agent_inbox.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_millis(500), agent_inbox.recv())
            .await
            .unwrap()
            .unwrap();

        let results: Vec<_> = [first, second]
            .into_iter()
            .map(|e| e.as_message().unwrap().observations[0].clone())
            .collect();
        assert!(results.iter().any(|o| !o.ok
            && o.error.as_ref().unwrap().kind == ErrorKind::DuplicateInvocation));
        assert!(results.iter().any(|o| o.ok));
        let _ = invocation_id;

        cancellation.cancel();
    }
}
