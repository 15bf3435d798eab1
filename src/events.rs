//! Event types and broadcasting
//!
//! Two kinds of events leave an agent:
//! - [`AgentEvent`]: advisory lifecycle notifications (`agent:message_received`,
//!   `agent:rejected`, ...). Fire-and-forget; nobody has to listen.
//! - [`TurnEvent`]: the ordered outcome of one request, delivered on a single
//!   stream per request and mirrored to [`AgentResponse`] subscribers.

use crate::reject::RejectPolicy;
use crate::services::ToolCall;
use crate::types::{AgentId, MemoryId, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Advisory lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Message accepted into an agent's mailbox
    MessageReceived {
        agent_id: AgentId,
        message_id: MessageId,
        sender_id: String,
        timestamp: DateTime<Utc>,
    },
    /// Message fully handled (answered, declined or failed)
    MessageProcessed {
        agent_id: AgentId,
        message_id: MessageId,
        responded: bool,
        timestamp: DateTime<Utc>,
    },
    /// Capability assessment produced for a message
    CapabilityCheck {
        agent_id: AgentId,
        message_id: MessageId,
        confidence: f32,
        can_respond: bool,
        timestamp: DateTime<Utc>,
    },
    /// Message declined under a reject policy
    Rejected {
        agent_id: AgentId,
        message_id: MessageId,
        policy: RejectPolicy,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Agent wants to learn about a topic it could not answer, or absorbed something
    Learning {
        agent_id: AgentId,
        topic: String,
        memory_id: Option<MemoryId>,
        timestamp: DateTime<Utc>,
    },
}

impl AgentEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::MessageReceived { .. } => "agent:message_received",
            AgentEvent::MessageProcessed { .. } => "agent:message_processed",
            AgentEvent::CapabilityCheck { .. } => "agent:capability_check",
            AgentEvent::Rejected { .. } => "agent:rejected",
            AgentEvent::Learning { .. } => "agent:learning",
        }
    }
}

/// Broadcast channel for [`AgentEvent`]s
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBroadcaster {
    /// Create new broadcaster with channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event; having no subscribers is not an error
    pub fn emit(&self, event: AgentEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Get subscriber count
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// One step in the life of a single request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// The agent accepted the message and is calling the model
    Thinking,
    /// The model reported a tool invocation
    ToolCallStarted { call: ToolCall },
    /// The tool invocation finished
    ToolCallFinished {
        call: ToolCall,
        output: Option<String>,
    },
    /// Reply text
    Delta { text: String },
    /// The turn completed with a reply
    Done { reply: String },
    /// The agent declined to answer
    Declined {
        policy: RejectPolicy,
        reply: Option<String>,
    },
    /// The model call failed; no reply was produced
    Failed { error: String },
}

impl TurnEvent {
    /// Whether this event ends the turn
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnEvent::Done { .. } | TurnEvent::Declined { .. } | TurnEvent::Failed { .. }
        )
    }
}

/// A [`TurnEvent`] tagged with the agent and message it belongs to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub agent_id: AgentId,
    pub agent_name: String,
    pub message_id: MessageId,
    pub reply_to: Option<MessageId>,
    /// Content of the message being answered
    pub question: String,
    pub event: TurnEvent,
}
