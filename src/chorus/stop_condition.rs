//! Predicates that decide when a running workspace should stop on its own.

use crate::event::Event;
use crate::identifier::Identifier;
use crate::message::Message;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A point-in-time view of workspace activity a [`StopCondition`] judges.
#[derive(Debug, Clone)]
pub struct ActivitySnapshot {
    pub idle_for: Duration,
    pub total_messages: u64,
    pub human_signal_seen: bool,
}

/// A single stopping criterion. Evaluated disjunctively: the workspace
/// stops as soon as any registered condition returns `true`.
pub trait StopCondition: Send + Sync {
    fn label(&self) -> &str {
        "stop_condition"
    }

    fn should_stop(&self, snapshot: &ActivitySnapshot) -> bool;
}

/// Stops the workspace once no event has been observed for `window`.
pub struct NoActivity {
    window: Duration,
}

impl NoActivity {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }
}

impl StopCondition for NoActivity {
    fn label(&self) -> &str {
        "no_activity"
    }

    fn should_stop(&self, snapshot: &ActivitySnapshot) -> bool {
        snapshot.idle_for >= self.window
    }
}

/// Stops the workspace once `n` total messages have been observed.
pub struct MessageCountReached {
    n: u64,
}

impl MessageCountReached {
    pub fn new(n: u64) -> Self {
        Self { n }
    }
}

impl StopCondition for MessageCountReached {
    fn label(&self) -> &str {
        "message_count_reached"
    }

    fn should_stop(&self, snapshot: &ActivitySnapshot) -> bool {
        snapshot.total_messages >= self.n
    }
}

/// Stops the workspace the moment the human sends a message tagged
/// `metadata["stop"] = "true"`.
pub struct HumanSignal;

impl StopCondition for HumanSignal {
    fn label(&self) -> &str {
        "human_signal"
    }

    fn should_stop(&self, snapshot: &ActivitySnapshot) -> bool {
        snapshot.human_signal_seen
    }
}

struct State {
    last_activity: Instant,
    total_messages: u64,
    human_signal_seen: bool,
}

/// Tracks activity and evaluates every registered [`StopCondition`]
/// against it.
pub struct StopConditionEvaluator {
    conditions: Vec<Box<dyn StopCondition>>,
    state: Mutex<State>,
}

impl StopConditionEvaluator {
    pub fn new(conditions: Vec<Box<dyn StopCondition>>) -> Self {
        Self {
            conditions,
            state: Mutex::new(State {
                last_activity: Instant::now(),
                total_messages: 0,
                human_signal_seen: false,
            }),
        }
    }

    /// Feed the evaluator a routed event, updating activity bookkeeping.
    pub fn record_event(&self, event: &Event) {
        let mut state = self.state.lock().unwrap();
        state.last_activity = Instant::now();
        if let Event::Message(m) = event {
            state.total_messages += 1;
            if is_human_stop_signal(m) {
                state.human_signal_seen = true;
            }
        }
    }

    /// Mark that an agent step just completed, even if it produced no
    /// outbound event, so idle-window conditions see it as activity too.
    pub fn record_step(&self) {
        self.state.lock().unwrap().last_activity = Instant::now();
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        let state = self.state.lock().unwrap();
        ActivitySnapshot {
            idle_for: state.last_activity.elapsed(),
            total_messages: state.total_messages,
            human_signal_seen: state.human_signal_seen,
        }
    }

    pub fn should_stop(&self) -> Option<&str> {
        let snapshot = self.snapshot();
        self.conditions
            .iter()
            .find(|c| c.should_stop(&snapshot))
            .map(|c| c.label())
    }
}

fn is_human_stop_signal(message: &Message) -> bool {
    message.source == Identifier::human() && message.metadata.get("stop").map(String::as_str) == Some("true")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    #[test]
    fn message_count_triggers() {
        let evaluator = StopConditionEvaluator::new(vec![Box::new(MessageCountReached::new(2))]);
        assert!(evaluator.should_stop().is_none());
        for _ in 0..2 {
            evaluator.record_event(&Event::Message(Message::direct(
                Identifier::agent("a"),
                Identifier::agent("b"),
                "x",
                Role::Agent,
            )));
        }
        assert_eq!(evaluator.should_stop(), Some("message_count_reached"));
    }

    #[test]
    fn human_signal_triggers_on_tagged_message() {
        let evaluator = StopConditionEvaluator::new(vec![Box::new(HumanSignal)]);
        evaluator.record_event(&Event::Message(Message::direct(
            Identifier::human(),
            Identifier::agent("b"),
            "stop please",
            Role::User,
        )));
        assert!(evaluator.should_stop().is_none());

        evaluator.record_event(&Event::Message(
            Message::direct(Identifier::human(), Identifier::agent("b"), "done", Role::User)
                .with_metadata("stop", "true"),
        ));
        assert_eq!(evaluator.should_stop(), Some("human_signal"));
    }

    #[test]
    fn no_activity_triggers_after_window() {
        let evaluator = StopConditionEvaluator::new(vec![Box::new(NoActivity::new(Duration::from_millis(10)))]);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(evaluator.should_stop(), Some("no_activity"));
    }
}
