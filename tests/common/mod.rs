//! Common test utilities and helpers

#![allow(dead_code)]

use agent_runtime::{
    AgentServices, ChatMessage, ChatProvider, ChatResponse, PersistRecord, RecordSink, Result,
    RuntimeConfig, RuntimeError, TurnEvent,
};
use agent_runtime::config::AgentProfile;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

/// Chat provider that plays back queued replies, then answers with a prefix
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<ChatResponse>>>,
    prefix: String,
    delay: Duration,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedProvider {
    pub fn new(prefix: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            prefix: prefix.to_string(),
            delay: Duration::ZERO,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Wait this long before every reply
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_reply(&self, text: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Ok(ChatResponse::text(text)));
    }

    pub fn push_failure(&self, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(RuntimeError::Llm(message.to_string())));
    }

    /// Every conversation the provider was sent, in call order
    pub fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().unwrap().clone()
    }

    /// The last message of every call, which is the user turn
    pub fn questions(&self) -> Vec<String> {
        self.prompts()
            .iter()
            .filter_map(|prompt| prompt.last().map(|m| m.content.clone()))
            .collect()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.replies.lock().unwrap().pop_front();
        match scripted {
            Some(reply) => reply,
            None => {
                let question = messages.last().map(|m| m.content.as_str()).unwrap_or("");
                Ok(ChatResponse::text(format!("{} {}", self.prefix, question)))
            }
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Sink that keeps everything it is asked to persist
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<PersistRecord>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<PersistRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn memory_count(&self) -> usize {
        self.records()
            .iter()
            .filter(|r| matches!(r, PersistRecord::Memory(_)))
            .count()
    }

    pub fn thought_count(&self) -> usize {
        self.records()
            .iter()
            .filter(|r| matches!(r, PersistRecord::Thought(_)))
            .count()
    }
}

#[async_trait]
impl RecordSink for RecordingSink {
    async fn persist(&self, record: &PersistRecord) -> Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Default configuration with a near-zero mailbox debounce
pub fn test_config(profiles: Vec<AgentProfile>) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.mailbox.debounce = Duration::from_millis(1);
    config.agents = profiles;
    config
}

/// Seeded services around a provider
pub fn services(provider: Arc<ScriptedProvider>) -> AgentServices {
    AgentServices::new(provider).with_seed(42)
}

/// Drain a turn stream, failing the test if it does not end in time
pub async fn collect_turn(stream: UnboundedReceiverStream<TurnEvent>) -> Vec<TurnEvent> {
    tokio::time::timeout(WAIT, stream.collect::<Vec<_>>())
        .await
        .expect("turn did not finish in time")
}

/// Poll `check` until it returns true or [`WAIT`] elapses
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let polled = tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    polled.is_ok()
}
