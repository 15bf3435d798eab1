//! Session: a set of agents sharing one conversation
//!
//! A user message is routed to one agent or to all of them. Each dispatch is
//! recorded in a [`TurnState`]. Once started, the session forwards every
//! agent's [`AgentResponse`] to its own subscribers, and when an agent
//! finishes an answer it is queued in every other agent's mailbox, behind
//! that agent's own copy of the question, to be observed and learned from.

use crate::agent::{Agent, AgentServices};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::events::{AgentResponse, EventBroadcaster, TurnEvent};
use crate::mailbox::{Priority, SendOptions};
use crate::types::{AgentId, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const USER_SENDER_ID: &str = "user";
pub const USER_SENDER_NAME: &str = "User";

const RESPONSE_CAPACITY: usize = 1024;
const MAX_TURNS: usize = 256;

/// Who a user message is for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "agent_id", rename_all = "snake_case")]
pub enum MessageTarget {
    All,
    Agent(AgentId),
}

/// One agent's copy of a user message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchedMessage {
    pub agent_id: AgentId,
    pub message_id: MessageId,
}

/// A user message and where it went
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnState {
    pub id: Uuid,
    pub content: String,
    pub target: MessageTarget,
    pub priority: Priority,
    pub started_at: DateTime<Utc>,
    pub dispatched: Vec<DispatchedMessage>,
}

impl TurnState {
    /// Message id the given agent received for this turn
    pub fn message_for(&self, agent_id: &str) -> Option<MessageId> {
        self.dispatched
            .iter()
            .find(|d| d.agent_id == agent_id)
            .map(|d| d.message_id)
    }
}

struct SessionInner {
    agents: Vec<Agent>,
    services: AgentServices,
    turns: Mutex<VecDeque<TurnState>>,
    message_turns: Mutex<HashMap<MessageId, Uuid>>,
    responses: broadcast::Sender<AgentResponse>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

/// Owner of a set of agents
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Build one agent per configured profile
    pub fn new(config: &RuntimeConfig, services: AgentServices) -> Result<Self> {
        config.validate()?;
        let agents = config
            .agents
            .iter()
            .map(|profile| Agent::new(profile.clone(), config, services.clone()))
            .collect();
        Self::from_agents(agents, services)
    }

    /// Wrap agents built elsewhere; ids must be unique
    pub fn from_agents(agents: Vec<Agent>, services: AgentServices) -> Result<Self> {
        let mut seen = HashSet::new();
        for agent in &agents {
            if !seen.insert(agent.id().clone()) {
                return Err(RuntimeError::Config(format!(
                    "duplicate agent id: {}",
                    agent.id()
                )));
            }
        }

        let (responses, _) = broadcast::channel(RESPONSE_CAPACITY);
        Ok(Self {
            inner: Arc::new(SessionInner {
                agents,
                services,
                turns: Mutex::new(VecDeque::new()),
                message_turns: Mutex::new(HashMap::new()),
                responses,
                forwarders: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn agents(&self) -> &[Agent] {
        &self.inner.agents
    }

    pub fn agent(&self, id: &str) -> Option<&Agent> {
        self.inner.agents.iter().find(|agent| agent.id() == id)
    }

    /// Advisory events of every agent in the session
    pub fn events(&self) -> &EventBroadcaster {
        &self.inner.services.events
    }

    /// Start every agent and begin forwarding their responses
    ///
    /// Must be called from inside a tokio runtime. Starting twice is an error.
    pub fn start(&self) -> Result<()> {
        let mut forwarders = self.inner.forwarders();
        if !forwarders.is_empty() {
            return Err(RuntimeError::InvalidOperation(
                "session already started".to_string(),
            ));
        }

        for agent in &self.inner.agents {
            agent.start()?;
            let rx = agent.subscribe();
            let session = Arc::downgrade(&self.inner);
            forwarders.push(tokio::spawn(forward(session, rx)));
        }
        tracing::info!("Session started with {} agent(s)", self.inner.agents.len());
        Ok(())
    }

    /// Route a user message at normal priority
    pub fn send_user_message(&self, content: &str, target: MessageTarget) -> Result<TurnState> {
        self.dispatch(content, target, Priority::Normal)
    }

    /// Route a user message at the given priority
    pub fn dispatch(
        &self,
        content: &str,
        target: MessageTarget,
        priority: Priority,
    ) -> Result<TurnState> {
        let recipients: Vec<&Agent> = match &target {
            MessageTarget::All => self.inner.agents.iter().collect(),
            MessageTarget::Agent(id) => vec![self
                .agent(id)
                .ok_or_else(|| RuntimeError::AgentNotFound(id.clone()))?],
        };

        let turn = TurnState {
            id: Uuid::new_v4(),
            content: content.to_string(),
            target,
            priority,
            started_at: self.inner.services.clock.now(),
            dispatched: recipients
                .iter()
                .map(|agent| DispatchedMessage {
                    agent_id: agent.id().clone(),
                    message_id: MessageId::new(),
                })
                .collect(),
        };
        // known before any copy is enqueued, so an early answer finds its siblings
        self.inner.remember_turn(turn.clone());

        for (agent, dispatched) in recipients.iter().zip(&turn.dispatched) {
            agent.receive(
                USER_SENDER_ID,
                USER_SENDER_NAME,
                content,
                SendOptions::with_priority(priority)
                    .with_id(dispatched.message_id)
                    .metadata("turnId", json!(turn.id.to_string())),
            );
        }

        tracing::debug!(
            "Turn {} dispatched to {} agent(s)",
            turn.id,
            turn.dispatched.len()
        );
        Ok(turn)
    }

    /// Responses of every agent, once the session is started
    pub fn subscribe(&self) -> broadcast::Receiver<AgentResponse> {
        self.inner.responses.subscribe()
    }

    pub fn turn(&self, id: Uuid) -> Option<TurnState> {
        self.inner.turns().iter().find(|turn| turn.id == id).cloned()
    }

    /// Stop every agent and stop forwarding
    pub fn shutdown(&self) {
        for agent in &self.inner.agents {
            agent.stop();
        }
        self.inner.abort_forwarders();
        tracing::info!("Session shut down");
    }
}

impl SessionInner {
    fn turns(&self) -> MutexGuard<'_, VecDeque<TurnState>> {
        self.turns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn message_turns(&self) -> MutexGuard<'_, HashMap<MessageId, Uuid>> {
        self.message_turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn forwarders(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.forwarders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remember_turn(&self, turn: TurnState) {
        {
            let mut message_turns = self.message_turns();
            for dispatched in &turn.dispatched {
                message_turns.insert(dispatched.message_id, turn.id);
            }
        }
        let evicted = {
            let mut turns = self.turns();
            turns.push_back(turn);
            if turns.len() > MAX_TURNS {
                turns.pop_front()
            } else {
                None
            }
        };
        if let Some(evicted) = evicted {
            let mut message_turns = self.message_turns();
            for dispatched in &evicted.dispatched {
                message_turns.remove(&dispatched.message_id);
            }
        }
    }

    /// Message id and priority `agent_id` got for the turn `message_id`
    /// belongs to
    fn sibling_message(
        &self,
        message_id: &MessageId,
        agent_id: &str,
    ) -> Option<(MessageId, Priority)> {
        let turn_id = self.message_turns().get(message_id).copied()?;
        self.turns()
            .iter()
            .find(|turn| turn.id == turn_id)
            .and_then(|turn| Some((turn.message_for(agent_id)?, turn.priority)))
    }

    fn abort_forwarders(&self) {
        for handle in self.forwarders().drain(..) {
            handle.abort();
        }
    }

    fn handle_response(&self, response: AgentResponse) {
        if self.responses.send(response.clone()).is_err() {
            tracing::trace!("No session subscribers");
        }

        let TurnEvent::Done { reply } = &response.event else {
            return;
        };
        if reply.is_empty() {
            return;
        }

        for agent in &self.agents {
            if agent.id() == &response.agent_id {
                continue;
            }
            let (question_id, priority) = self
                .sibling_message(&response.message_id, agent.id())
                .unwrap_or((response.message_id, Priority::Normal));
            agent.overhear(
                question_id,
                &response.question,
                reply,
                &response.agent_id,
                &response.agent_name,
                priority,
            );
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.abort_forwarders();
    }
}

async fn forward(session: Weak<SessionInner>, mut rx: broadcast::Receiver<AgentResponse>) {
    loop {
        let response = match rx.recv().await {
            Ok(response) => response,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Session forwarder lagged, skipped {} responses", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(session) = session.upgrade() else {
            return;
        };
        session.handle_response(response);
    }
}
