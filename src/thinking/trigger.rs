//! Rule-based memory triggers
//!
//! A rule pairs a predicate over memories with a named action and a
//! cooldown. `check_and_trigger` evaluates every rule that is out of
//! cooldown against a candidate list and fires each rule at most once per
//! call, on the first candidate that matches.

use crate::clock::Clock;
use crate::error::{Result, RuntimeError};
use crate::memory::{MemoryRetrieval, RetrievalOptions, SharedMemory};
use crate::types::{MemoryId, MemoryItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Candidates examined when no context is given
const RECENT_CANDIDATES: usize = 20;
const MAX_HISTORY: usize = 100;

pub type TriggerCondition = Arc<dyn Fn(&MemoryItem) -> bool + Send + Sync>;

/// Handler run when a rule fires
#[async_trait]
pub trait TriggerAction: Send + Sync {
    /// Returns an optional output recorded in the [`TriggerResult`]
    async fn run(&self, rule_id: &str, memory: &MemoryItem) -> Result<Option<String>>;
}

#[derive(Clone)]
pub struct TriggerRule {
    pub id: String,
    pub description: String,
    pub condition: TriggerCondition,
    /// Name of the registered action to run
    pub action: String,
    pub cooldown: Duration,
}

impl TriggerRule {
    pub fn new<F>(id: impl Into<String>, action: impl Into<String>, cooldown: Duration, condition: F) -> Self
    where
        F: Fn(&MemoryItem) -> bool + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            description: String::new(),
            condition: Arc::new(condition),
            action: action.into(),
            cooldown,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl fmt::Debug for TriggerRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerRule")
            .field("id", &self.id)
            .field("action", &self.action)
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

/// Record of one fired rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerResult {
    pub rule_id: String,
    pub action: String,
    pub memory_id: MemoryId,
    pub fired_at: DateTime<Utc>,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[derive(Default)]
struct TriggerState {
    rules: Vec<TriggerRule>,
    actions: HashMap<String, Arc<dyn TriggerAction>>,
    last_fired: HashMap<String, DateTime<Utc>>,
    history: VecDeque<TriggerResult>,
}

/// A rule that matched, with its cooldown already claimed
struct Firing {
    rule: TriggerRule,
    memory: MemoryItem,
    action: Option<Arc<dyn TriggerAction>>,
}

/// Trigger rules of one agent
///
/// Rules and cooldowns sit behind a short-lived lock that is never held
/// while an action runs, so actions may call back into the trigger.
pub struct MemoryTrigger {
    memory: SharedMemory,
    retrieval: Arc<MemoryRetrieval>,
    clock: Arc<dyn Clock>,
    state: Mutex<TriggerState>,
}

impl MemoryTrigger {
    pub fn new(memory: SharedMemory, retrieval: Arc<MemoryRetrieval>, clock: Arc<dyn Clock>) -> Self {
        Self {
            memory,
            retrieval,
            clock,
            state: Mutex::new(TriggerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, TriggerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a rule, replacing any rule with the same id
    pub fn add_rule(&self, rule: TriggerRule) {
        let mut state = self.state();
        state.rules.retain(|existing| existing.id != rule.id);
        state.rules.push(rule);
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut state = self.state();
        let before = state.rules.len();
        state.rules.retain(|rule| rule.id != rule_id);
        state.last_fired.remove(rule_id);
        state.rules.len() != before
    }

    pub fn register_action(&self, name: impl Into<String>, action: Arc<dyn TriggerAction>) {
        self.state().actions.insert(name.into(), action);
    }

    pub fn rules(&self) -> Vec<TriggerRule> {
        self.state().rules.clone()
    }

    /// Fire every eligible rule at most once
    ///
    /// With a context, candidates come from retrieval against it; otherwise
    /// the most recent memories are used. A rule's cooldown starts when it
    /// matches, before its action runs.
    pub async fn check_and_trigger(&self, context: Option<&str>) -> Vec<TriggerResult> {
        if self.state().rules.is_empty() {
            return Vec::new();
        }

        let candidates: Vec<MemoryItem> = match context {
            Some(context) => self
                .retrieval
                .retrieve(&self.memory, context, RetrievalOptions::default())
                .await
                .into_iter()
                .map(|scored| scored.memory)
                .collect(),
            None => self.memory.read().await.get_recent(RECENT_CANDIDATES),
        };

        let now = self.clock.now();
        let firings = self.claim(&candidates, now);

        let mut fired = Vec::with_capacity(firings.len());
        for firing in firings {
            fired.push(Self::run_action(firing, now).await);
        }

        if !fired.is_empty() {
            let mut state = self.state();
            for result in &fired {
                state.history.push_back(result.clone());
            }
            while state.history.len() > MAX_HISTORY {
                state.history.pop_front();
            }
        }
        fired
    }

    pub fn reset_cooldown(&self, rule_id: &str) {
        self.state().last_fired.remove(rule_id);
    }

    pub fn history(&self) -> Vec<TriggerResult> {
        self.state().history.iter().cloned().collect()
    }

    /// Match rules against candidates and start the cooldown of each match
    fn claim(&self, candidates: &[MemoryItem], now: DateTime<Utc>) -> Vec<Firing> {
        let mut state = self.state();
        let mut firings = Vec::new();
        for rule in state.rules.clone() {
            if in_cooldown(&state.last_fired, &rule, now) {
                tracing::debug!("Trigger {} in cooldown", rule.id);
                continue;
            }
            let Some(memory) = candidates.iter().find(|memory| (rule.condition)(*memory)) else {
                continue;
            };

            state.last_fired.insert(rule.id.clone(), now);
            firings.push(Firing {
                action: state.actions.get(&rule.action).cloned(),
                memory: memory.clone(),
                rule,
            });
        }
        firings
    }

    async fn run_action(firing: Firing, now: DateTime<Utc>) -> TriggerResult {
        let Firing {
            rule,
            memory,
            action,
        } = firing;
        let outcome = match action {
            Some(action) => action.run(&rule.id, &memory).await,
            None => Err(RuntimeError::InvalidOperation(format!(
                "no action registered as {}",
                rule.action
            ))),
        };

        let (success, output, error) = match outcome {
            Ok(output) => {
                tracing::debug!("Trigger {} fired on memory {}", rule.id, memory.id);
                (true, output, None)
            }
            Err(e) => {
                tracing::warn!("Trigger {} action {} failed: {}", rule.id, rule.action, e);
                (false, None, Some(e.to_string()))
            }
        };

        TriggerResult {
            rule_id: rule.id,
            action: rule.action,
            memory_id: memory.id,
            fired_at: now,
            success,
            output,
            error,
        }
    }
}

fn in_cooldown(
    last_fired: &HashMap<String, DateTime<Utc>>,
    rule: &TriggerRule,
    now: DateTime<Utc>,
) -> bool {
    let Some(last) = last_fired.get(&rule.id) else {
        return false;
    };
    let cooldown = chrono::Duration::from_std(rule.cooldown).unwrap_or(chrono::Duration::MAX);
    now - *last < cooldown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{MemoryConfig, RetrievalConfig};
    use crate::memory::{shared, MemoryStore};
    use crate::types::{MemoryType, NewMemory};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl TriggerAction for Counting {
        async fn run(&self, _rule_id: &str, memory: &MemoryItem) -> Result<Option<String>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(memory.content.clone()))
        }
    }

    async fn setup() -> (MemoryTrigger, ManualClock, Arc<Counting>) {
        let clock = ManualClock::starting_now();
        let memory = shared(MemoryStore::new("agent", MemoryConfig::default(), Arc::new(clock.clone())));
        {
            let mut store = memory.write().await;
            store.add(NewMemory::new(MemoryType::Episodic, "deadline tomorrow", 0.9));
            clock.advance(chrono::Duration::seconds(1));
            store.add(NewMemory::new(MemoryType::Episodic, "another deadline friday", 0.9));
            clock.advance(chrono::Duration::seconds(1));
            store.add(NewMemory::new(MemoryType::Semantic, "rust is memory safe", 0.3));
        }
        let retrieval = Arc::new(MemoryRetrieval::new(
            RetrievalConfig::default(),
            None,
            Arc::new(clock.clone()),
        ));
        let trigger = MemoryTrigger::new(memory, retrieval, Arc::new(clock.clone()));
        let action = Arc::new(Counting(AtomicUsize::new(0)));
        trigger.register_action("remind", action.clone());
        (trigger, clock, action)
    }

    fn deadline_rule() -> TriggerRule {
        TriggerRule::new("deadline", "remind", Duration::from_secs(60), |m: &MemoryItem| {
            m.content.contains("deadline")
        })
    }

    #[tokio::test]
    async fn test_fires_once_on_first_match() {
        let (trigger, _, action) = setup().await;
        trigger.add_rule(deadline_rule());

        let results = trigger.check_and_trigger(None).await;
        assert_eq!(results.len(), 1);
        // most recent first
        assert_eq!(results[0].output.as_deref(), Some("another deadline friday"));
        assert!(results[0].success);
        assert_eq!(action.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cooldown_skips_and_resets() {
        let (trigger, clock, action) = setup().await;
        trigger.add_rule(deadline_rule());

        trigger.check_and_trigger(None).await;
        assert!(trigger.check_and_trigger(None).await.is_empty());

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(trigger.check_and_trigger(None).await.len(), 1);

        trigger.reset_cooldown("deadline");
        assert_eq!(trigger.check_and_trigger(None).await.len(), 1);
        assert_eq!(action.0.load(Ordering::SeqCst), 3);
        assert_eq!(trigger.history().len(), 3);
    }

    #[tokio::test]
    async fn test_context_uses_retrieval() {
        let (trigger, _, _) = setup().await;
        trigger.add_rule(TriggerRule::new(
            "any",
            "remind",
            Duration::from_secs(60),
            |_: &MemoryItem| true,
        ));

        let results = trigger.check_and_trigger(Some("rust memory safety")).await;
        assert_eq!(results[0].output.as_deref(), Some("rust is memory safe"));
    }

    #[tokio::test]
    async fn test_missing_action_is_recorded_as_failure() {
        let (trigger, _, _) = setup().await;
        trigger.add_rule(TriggerRule::new("orphan", "nobody", Duration::ZERO, |_: &MemoryItem| true));

        let results = trigger.check_and_trigger(None).await;
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("nobody"));
    }

    #[tokio::test]
    async fn test_remove_rule() {
        let (trigger, _, _) = setup().await;
        trigger.add_rule(deadline_rule());
        assert!(trigger.remove_rule("deadline"));
        assert!(!trigger.remove_rule("deadline"));
        assert!(trigger.check_and_trigger(None).await.is_empty());
    }

    struct Reentrant {
        trigger: std::sync::OnceLock<Arc<MemoryTrigger>>,
        seen_history: AtomicUsize,
    }

    #[async_trait]
    impl TriggerAction for Reentrant {
        async fn run(&self, _rule_id: &str, _memory: &MemoryItem) -> Result<Option<String>> {
            let Some(trigger) = self.trigger.get() else {
                return Ok(None);
            };
            // the rule is already in cooldown, so this returns without firing
            let nested = trigger.check_and_trigger(None).await;
            self.seen_history
                .store(trigger.history().len() + nested.len(), Ordering::SeqCst);
            Ok(Some(format!("rules: {}", trigger.rules().len())))
        }
    }

    #[tokio::test]
    async fn test_action_may_call_back_into_trigger() {
        let (trigger, _, _) = setup().await;
        let trigger = Arc::new(trigger);
        let action = Arc::new(Reentrant {
            trigger: std::sync::OnceLock::new(),
            seen_history: AtomicUsize::new(usize::MAX),
        });
        let _ = action.trigger.set(Arc::clone(&trigger));
        trigger.register_action("reenter", action.clone());
        trigger.add_rule(TriggerRule::new(
            "deadline",
            "reenter",
            Duration::from_secs(60),
            |m: &MemoryItem| m.content.contains("deadline"),
        ));

        let results = tokio::time::timeout(Duration::from_secs(5), trigger.check_and_trigger(None))
            .await
            .expect("action deadlocked the trigger");
        assert_eq!(results[0].output.as_deref(), Some("rules: 1"));
        assert_eq!(action.seen_history.load(Ordering::SeqCst), 0);
        assert_eq!(trigger.history().len(), 1);
    }
}
