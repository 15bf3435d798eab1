//! Scheduler-driven autonomous thinking
//!
//! One scheduler task per configured topic periodically asks the agent's
//! model to reflect on that topic. Each run is tracked as a [`ThinkingTask`]
//! going `pending -> running -> completed` (or `failed`). Completed thoughts
//! are handed to an optional [`ThoughtSink`], which the agent uses to store
//! them as semantic memories.

use crate::clock::Clock;
use crate::config::ThinkingConfig;
use crate::error::{Result, RuntimeError};
use crate::memory::text::token_set;
use crate::services::{ChatMessage, ChatProvider, Scheduler, TaskDef, TaskFuture};
use crate::types::AgentId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

const PROMPT_TEMPLATES: [&str; 4] = [
    "请深入思考关于「{topic}」的问题，总结你目前的见解。",
    "关于「{topic}」，有哪些值得探索的新角度或尚未解决的问题？",
    "回顾你对「{topic}」的了解，有什么可以修正或补充的地方？",
    "如果要向一位新手解释「{topic}」，你会怎么讲？请给出要点。",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// What started a thought
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingTrigger {
    Scheduled,
    Memory,
    Manual,
}

/// One autonomous thought
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingTask {
    pub id: Uuid,
    pub agent_id: AgentId,
    pub topic: String,
    pub prompt: String,
    pub trigger: ThinkingTrigger,
    pub status: ThinkingStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Receiver of completed thoughts
#[async_trait]
pub trait ThoughtSink: Send + Sync {
    async fn record(&self, task: &ThinkingTask) -> Result<()>;
}

struct ThinkingInner {
    agent_id: AgentId,
    system_prompt: String,
    config: ThinkingConfig,
    topics: Vec<String>,
    llm: Arc<dyn ChatProvider>,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    history: Mutex<VecDeque<ThinkingTask>>,
    sink: Option<Arc<dyn ThoughtSink>>,
}

impl ThinkingInner {
    async fn think(&self, topic: &str, trigger: ThinkingTrigger) -> ThinkingTask {
        let prompt = self.build_prompt(topic);
        let mut task = ThinkingTask {
            id: Uuid::new_v4(),
            agent_id: self.agent_id.clone(),
            topic: topic.to_string(),
            prompt: prompt.clone(),
            trigger,
            status: ThinkingStatus::Pending,
            result: None,
            error: None,
            created_at: self.clock.now(),
            completed_at: None,
        };
        self.track(&task);

        task.status = ThinkingStatus::Running;
        self.track(&task);
        tracing::debug!("Agent {} thinking about {}", self.agent_id, topic);

        let mut messages = Vec::with_capacity(2);
        if !self.system_prompt.is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        messages.push(ChatMessage::user(prompt));

        match self.llm.chat(&messages).await {
            Ok(response) => {
                task.status = ThinkingStatus::Completed;
                task.result = Some(response.content.trim().to_string());
            }
            Err(e) => {
                tracing::warn!("Agent {} failed to think about {}: {}", self.agent_id, topic, e);
                task.status = ThinkingStatus::Failed;
                task.error = Some(e.to_string());
            }
        }
        task.completed_at = Some(self.clock.now());
        self.track(&task);

        if task.status == ThinkingStatus::Completed {
            if let Some(sink) = &self.sink {
                if let Err(e) = sink.record(&task).await {
                    tracing::warn!("Recording thought {} failed: {}", task.id, e);
                }
            }
        }
        task
    }

    fn build_prompt(&self, topic: &str) -> String {
        let index = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..PROMPT_TEMPLATES.len());
        PROMPT_TEMPLATES[index].replace("{topic}", topic)
    }

    fn track(&self, task: &ThinkingTask) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = history.iter_mut().rev().find(|t| t.id == task.id) {
            *existing = task.clone();
            return;
        }
        history.push_back(task.clone());
        while history.len() > self.config.max_history {
            history.pop_front();
        }
    }
}

/// Periodic self-prompting for one agent
#[derive(Clone)]
pub struct AutonomousThinking {
    inner: Arc<ThinkingInner>,
    scheduler: Arc<dyn Scheduler>,
    task_ids: Arc<Mutex<Vec<String>>>,
}

impl AutonomousThinking {
    pub fn new(
        agent_id: impl Into<AgentId>,
        config: ThinkingConfig,
        llm: Arc<dyn ChatProvider>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        rng: StdRng,
    ) -> Self {
        let topics = config.topics.clone();
        Self {
            inner: Arc::new(ThinkingInner {
                agent_id: agent_id.into(),
                system_prompt: String::new(),
                config,
                topics,
                llm,
                clock,
                rng: Mutex::new(rng),
                history: Mutex::new(VecDeque::new()),
                sink: None,
            }),
            scheduler,
            task_ids: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Finish construction; only valid before the instance is shared
    pub fn configure(
        mut self,
        system_prompt: impl Into<String>,
        topics: Option<Vec<String>>,
        sink: Option<Arc<dyn ThoughtSink>>,
    ) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.system_prompt = system_prompt.into();
            if let Some(topics) = topics {
                inner.topics = topics;
            }
            inner.sink = sink;
        } else {
            tracing::warn!(
                "Thinking for {} already shared; configuration ignored",
                self.inner.agent_id
            );
        }
        self
    }

    /// Register one scheduler task per topic; returns how many were started
    pub fn start(&self) -> Result<usize> {
        let config = &self.inner.config;
        if !config.enabled || self.inner.topics.is_empty() {
            return Ok(0);
        }

        let mut task_ids = self.task_ids.lock().unwrap_or_else(PoisonError::into_inner);
        if !task_ids.is_empty() {
            return Err(RuntimeError::InvalidOperation(format!(
                "thinking already started for {}",
                self.inner.agent_id
            )));
        }

        for (index, topic) in self.inner.topics.iter().enumerate() {
            let id = format!("thinking:{}:{}", self.inner.agent_id, index);
            self.scheduler.register(TaskDef {
                id: id.clone(),
                description: format!("think about {}", topic),
                interval: config.interval,
                timeout: config.timeout,
                run_immediately: false,
            })?;

            let inner = Arc::clone(&self.inner);
            let topic = topic.clone();
            self.scheduler.bind_handler(
                &id,
                Arc::new(move || -> TaskFuture {
                    let inner = Arc::clone(&inner);
                    let topic = topic.clone();
                    Box::pin(async move {
                        let task = inner.think(&topic, ThinkingTrigger::Scheduled).await;
                        match task.error {
                            Some(error) => Err(RuntimeError::Llm(error)),
                            None => Ok(()),
                        }
                    })
                }),
            )?;
            task_ids.push(id);
        }

        tracing::info!(
            "Agent {} thinking about {} topic(s) every {:?}",
            self.inner.agent_id,
            task_ids.len(),
            config.interval
        );
        Ok(task_ids.len())
    }

    /// Unregister every scheduled task
    pub fn stop(&self) {
        let mut task_ids = self.task_ids.lock().unwrap_or_else(PoisonError::into_inner);
        for id in task_ids.drain(..) {
            if let Err(e) = self.scheduler.unregister(&id) {
                tracing::warn!("Failed to unregister {}: {}", id, e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self
            .task_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Think about a topic now
    pub async fn think(&self, topic: &str) -> ThinkingTask {
        self.inner.think(topic, ThinkingTrigger::Manual).await
    }

    /// Think about the first configured topic a memory mentions
    ///
    /// Does nothing unless memory-triggered thinking is enabled.
    pub async fn trigger_from_memory(&self, content: &str) -> Option<ThinkingTask> {
        if !self.inner.config.memory_triggered {
            return None;
        }
        let topic = self.match_topic(content)?;
        Some(self.inner.think(&topic, ThinkingTrigger::Memory).await)
    }

    /// Recent thoughts, oldest first
    pub fn history(&self) -> Vec<ThinkingTask> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn topics(&self) -> &[String] {
        &self.inner.topics
    }

    pub fn memory_triggered(&self) -> bool {
        self.inner.config.memory_triggered
    }

    fn match_topic(&self, content: &str) -> Option<String> {
        let lowered = content.to_lowercase();
        let tokens = token_set(content);
        self.inner
            .topics
            .iter()
            .find(|topic| {
                let topic_lower = topic.to_lowercase();
                lowered.contains(&topic_lower)
                    || token_set(&topic_lower).iter().any(|t| tokens.contains(t))
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::services::{ChatResponse, IntervalScheduler};
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Scripted {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatProvider for Scripted {
        async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RuntimeError::Llm("model unavailable".to_string()));
            }
            let prompt = &messages[messages.len() - 1].content;
            Ok(ChatResponse::text(format!(" thought on: {} ", prompt)))
        }
    }

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<ThinkingTask>>);

    #[async_trait]
    impl ThoughtSink for CollectingSink {
        async fn record(&self, task: &ThinkingTask) -> Result<()> {
            self.0.lock().unwrap().push(task.clone());
            Ok(())
        }
    }

    fn thinking(config: ThinkingConfig, fail: bool) -> (AutonomousThinking, Arc<Scripted>, IntervalScheduler) {
        let llm = Arc::new(Scripted {
            fail,
            calls: AtomicUsize::new(0),
        });
        let scheduler = IntervalScheduler::new();
        let thinking = AutonomousThinking::new(
            "agent",
            config,
            llm.clone(),
            Arc::new(scheduler.clone()),
            Arc::new(SystemClock),
            StdRng::seed_from_u64(42),
        );
        (thinking, llm, scheduler)
    }

    fn topics(topics: &[&str]) -> ThinkingConfig {
        ThinkingConfig {
            enabled: true,
            interval: Duration::from_millis(10),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_think_completes_and_records() {
        let (thinking, _, _) = thinking(topics(&[]), false);
        let sink = Arc::new(CollectingSink::default());
        let thinking = thinking.configure("You are curious.", None, Some(sink.clone()));

        let task = thinking.think("ownership").await;
        assert_eq!(task.status, ThinkingStatus::Completed);
        assert!(task.prompt.contains("ownership"));
        assert!(task.result.as_deref().unwrap().starts_with("thought on:"));
        assert!(task.completed_at.is_some());

        let history = thinking.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ThinkingStatus::Completed);
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_thought_is_kept_but_not_recorded() {
        let (thinking, _, _) = thinking(topics(&[]), true);
        let sink = Arc::new(CollectingSink::default());
        let thinking = thinking.configure("", None, Some(sink.clone()));

        let task = thinking.think("lifetimes").await;
        assert_eq!(task.status, ThinkingStatus::Failed);
        assert!(task.error.unwrap().contains("model unavailable"));
        assert_eq!(thinking.history()[0].status, ThinkingStatus::Failed);
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (thinking, _, _) = thinking(
            ThinkingConfig {
                max_history: 2,
                ..Default::default()
            },
            false,
        );
        for topic in ["a", "b", "c"] {
            thinking.think(topic).await;
        }
        let history: Vec<String> = thinking.history().into_iter().map(|t| t.topic).collect();
        assert_eq!(history, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_prompts_are_seeded() {
        let (a, _, _) = thinking(topics(&[]), false);
        let (b, _, _) = thinking(topics(&[]), false);
        for _ in 0..4 {
            assert_eq!(a.think("x").await.prompt, b.think("x").await.prompt);
        }
    }

    #[tokio::test]
    async fn test_start_schedules_each_topic() {
        let (thinking, llm, scheduler) = thinking(topics(&["rust", "tokio"]), false);
        assert_eq!(thinking.start().unwrap(), 2);
        assert!(thinking.start().is_err());
        assert_eq!(
            scheduler.task_ids(),
            vec!["thinking:agent:0".to_string(), "thinking:agent:1".to_string()]
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(llm.calls.load(Ordering::SeqCst) >= 2);
        assert!(thinking
            .history()
            .iter()
            .all(|t| t.trigger == ThinkingTrigger::Scheduled));

        thinking.stop();
        assert!(!thinking.is_running());
        assert!(scheduler.task_ids().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_start_is_noop() {
        let (thinking, _, scheduler) = thinking(
            ThinkingConfig {
                topics: vec!["rust".to_string()],
                ..Default::default()
            },
            false,
        );
        assert_eq!(thinking.start().unwrap(), 0);
        assert!(scheduler.task_ids().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_from_memory() {
        let (gated, _, _) = thinking(topics(&["async rust"]), false);
        assert!(gated.trigger_from_memory("we talked about async rust").await.is_none());

        let (thinking, _, _) = thinking(
            ThinkingConfig {
                memory_triggered: true,
                ..topics(&["async rust", "databases"])
            },
            false,
        );
        let task = thinking
            .trigger_from_memory("Notes on Async Rust executors")
            .await
            .unwrap();
        assert_eq!(task.topic, "async rust");
        assert_eq!(task.trigger, ThinkingTrigger::Memory);
        assert!(thinking.trigger_from_memory("gardening tips").await.is_none());
    }
}
