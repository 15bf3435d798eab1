//! Per-agent priority mailbox
//!
//! Messages are kept sorted by priority (urgent first) and FIFO within a
//! priority tier. A single consumer task drains the queue: after a debounce
//! delay it pops the head, awaits the handler, and only then looks at the
//! next message. Sending never blocks and never spawns a second consumer.
//!
//! On overflow the oldest queued message is dropped so the new one always
//! gets in. `normal` messages that wait longer than the aging threshold are
//! promoted to `high` on the next enqueue.

use crate::clock::Clock;
use crate::config::MailboxConfig;
use crate::error::Result;
use crate::types::{MessageId, Metadata};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Message priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Sort rank; lower is delivered first
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

/// What a queued message asks the agent to do
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    /// A message to assess and answer or decline
    #[default]
    Chat,
    /// Another agent's answer to `question`; the message content is the
    /// answer and `reply_to` the id this agent got for the question
    Observation { question: String },
}

/// A message waiting in a mailbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxMessage {
    pub id: MessageId,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub kind: MessageKind,
}

/// Optional parts of a send
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Caller-chosen message id; a fresh one is generated otherwise
    pub id: Option<MessageId>,
    pub priority: Priority,
    pub reply_to: Option<MessageId>,
    pub metadata: Metadata,
    pub kind: MessageKind,
}

impl SendOptions {
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn reply_to(mut self, id: MessageId) -> Self {
        self.reply_to = Some(id);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Consumer of dequeued messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: MailboxMessage) -> Result<()>;
}

/// Mailbox counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MailboxStats {
    pub pending: usize,
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub promoted: u64,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<MailboxMessage>,
    paused: bool,
    consumer_active: bool,
    enqueued: u64,
    processed: u64,
    failed: u64,
    dropped: u64,
    promoted: u64,
}

struct MailboxInner {
    owner: String,
    config: MailboxConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    handler: Mutex<Option<Arc<dyn MessageHandler>>>,
}

impl MailboxInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Priority mailbox with a single-consumer processing loop
#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<MailboxInner>,
}

impl Mailbox {
    /// Create a mailbox; `owner` only labels log lines
    pub fn new(owner: impl Into<String>, config: MailboxConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(MailboxInner {
                owner: owner.into(),
                config,
                clock,
                state: Mutex::new(QueueState::default()),
                handler: Mutex::new(None),
            }),
        }
    }

    /// Enqueue a message and make sure the consumer is scheduled
    pub fn send(
        &self,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        content: impl Into<String>,
        options: SendOptions,
    ) -> MailboxMessage {
        let now = self.inner.clock.now();
        let message = MailboxMessage {
            id: options.id.unwrap_or_default(),
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            content: content.into(),
            priority: options.priority,
            timestamp: now,
            reply_to: options.reply_to,
            metadata: options.metadata,
            kind: options.kind,
        };

        let has_handler = self.inner.handler().is_some();
        let spawn = {
            let mut state = self.inner.state();

            if state.queue.len() >= self.inner.config.max_size {
                if let Some(dropped) = state.queue.pop_front() {
                    state.dropped += 1;
                    tracing::warn!(
                        "Mailbox {} full ({}), dropped oldest message {}",
                        self.inner.owner,
                        self.inner.config.max_size,
                        dropped.id
                    );
                }
            }

            insert_by_priority(&mut state.queue, message.clone());
            let promoted = promote_aged(
                &mut state.queue,
                now,
                self.inner.config.aging_threshold,
            );
            if promoted > 0 {
                state.promoted += promoted as u64;
                tracing::debug!(
                    "Mailbox {} promoted {} aged message(s) to high",
                    self.inner.owner,
                    promoted
                );
            }
            state.enqueued += 1;

            claim_consumer(&mut state, has_handler)
        };

        tracing::debug!(
            "Mailbox {} queued {} from {} ({:?})",
            self.inner.owner,
            message.id,
            message.sender_id,
            message.priority
        );

        if spawn {
            self.spawn_consumer();
        }
        message
    }

    /// Install the handler and start draining anything already queued
    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self
            .inner
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
        self.kick();
    }

    /// Stop dequeuing; queued messages are kept
    ///
    /// A handler already running finishes normally.
    pub fn pause(&self) {
        self.inner.state().paused = true;
        tracing::debug!("Mailbox {} paused", self.inner.owner);
    }

    /// Resume dequeuing
    pub fn resume(&self) {
        self.inner.state().paused = false;
        tracing::debug!("Mailbox {} resumed", self.inner.owner);
        self.kick();
    }

    /// Drop every queued message; returns how many were discarded
    pub fn clear(&self) -> usize {
        let mut state = self.inner.state();
        let count = state.queue.len();
        state.queue.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.inner.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state().queue.is_empty()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state().paused
    }

    /// Snapshot of queued messages in delivery order
    pub fn pending(&self) -> Vec<MailboxMessage> {
        self.inner.state().queue.iter().cloned().collect()
    }

    pub fn stats(&self) -> MailboxStats {
        let state = self.inner.state();
        MailboxStats {
            pending: state.queue.len(),
            enqueued: state.enqueued,
            processed: state.processed,
            failed: state.failed,
            dropped: state.dropped,
            promoted: state.promoted,
        }
    }

    fn kick(&self) {
        let has_handler = self.inner.handler().is_some();
        let spawn = {
            let mut state = self.inner.state();
            !state.queue.is_empty() && claim_consumer(&mut state, has_handler)
        };
        if spawn {
            self.spawn_consumer();
        }
    }

    fn spawn_consumer(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = Arc::clone(&self.inner);
                runtime.spawn(consume(inner));
            }
            Err(_) => {
                // retried on the next send/resume from inside a runtime
                tracing::warn!(
                    "Mailbox {} has no tokio runtime; messages stay queued",
                    self.inner.owner
                );
                self.inner.state().consumer_active = false;
            }
        }
    }
}

/// Mark the consumer as active if one may start now
fn claim_consumer(state: &mut QueueState, has_handler: bool) -> bool {
    if state.paused || state.consumer_active || !has_handler {
        return false;
    }
    state.consumer_active = true;
    true
}

/// Insert after every message of equal or higher priority
fn insert_by_priority(queue: &mut VecDeque<MailboxMessage>, message: MailboxMessage) {
    let rank = message.priority.rank();
    match queue.iter().position(|queued| queued.priority.rank() > rank) {
        Some(index) => queue.insert(index, message),
        None => queue.push_back(message),
    }
}

/// Promote aged `normal` messages to `high`, keeping the queue ordered
fn promote_aged(
    queue: &mut VecDeque<MailboxMessage>,
    now: DateTime<Utc>,
    threshold: std::time::Duration,
) -> usize {
    let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
    let mut promoted = 0;
    for message in queue.iter_mut() {
        if message.priority == Priority::Normal && now - message.timestamp >= threshold {
            message.priority = Priority::High;
            promoted += 1;
        }
    }
    if promoted > 0 {
        // stable: promoted messages keep their arrival order among the highs
        queue
            .make_contiguous()
            .sort_by_key(|message| message.priority.rank());
    }
    promoted
}

/// The single consumer loop
async fn consume(inner: Arc<MailboxInner>) {
    loop {
        tokio::time::sleep(inner.config.debounce).await;

        let next = {
            let mut state = inner.state();
            let handler = inner.handler();
            match (state.paused, handler) {
                (false, Some(handler)) => state.queue.pop_front().map(|m| (m, handler)),
                _ => None,
            }
            .or_else(|| {
                state.consumer_active = false;
                None
            })
        };

        let Some((message, handler)) = next else {
            return;
        };

        let message_id = message.id;
        let outcome = tokio::spawn(async move { handler.handle(message).await }).await;

        let mut state = inner.state();
        match outcome {
            Ok(Ok(())) => {
                state.processed += 1;
            }
            Ok(Err(e)) => {
                state.failed += 1;
                tracing::error!(
                    "Mailbox {} handler failed on {}: {}",
                    inner.owner,
                    message_id,
                    e
                );
            }
            Err(join_error) => {
                state.failed += 1;
                tracing::error!(
                    "Mailbox {} handler panicked on {}: {}",
                    inner.owner,
                    message_id,
                    join_error
                );
            }
        }
    }
}
