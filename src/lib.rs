//! Agent Actor Runtime
//!
//! Gives each conversational agent its own inbox, a policy for deciding
//! whether it can answer, a memory it can write to and query, and background
//! loops that consolidate memory and learn from other agents.
//!
//! # Architecture
//!
//! The runtime is organized leaf-first:
//! - **Mailbox**: priority queue with a single-consumer processing loop
//! - **Capability / Reject**: decide whether to answer, and how to decline
//! - **Memory**: bounded typed store, retrieval and consolidation
//! - **Knowledge**: observe other agents' answers and absorb them
//! - **Thinking**: scheduler-driven self-prompting and memory triggers
//! - **Agent / Session**: composition and routing
//!
//! The language model, embeddings, summarization, persistence and
//! scheduling are collaborators passed in through [`AgentServices`].
//!
//! # Example
//!
//! ```ignore
//! use agent_runtime::{AgentServices, MessageTarget, RuntimeConfig, Session};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RuntimeConfig::from_file("runtime.toml".as_ref())?;
//!     let session = Session::new(&config, AgentServices::new(my_provider()))?;
//!     session.start()?;
//!
//!     let mut responses = session.subscribe();
//!     session.send_user_message("What is ownership?", MessageTarget::All)?;
//!     while let Ok(response) = responses.recv().await {
//!         println!("{}: {:?}", response.agent_name, response.event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod capability;
pub mod clock;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod events;
pub mod knowledge;
pub mod mailbox;
pub mod memory;
pub mod reject;
pub mod services;
pub mod session;
pub mod thinking;
pub mod types;

// Re-export commonly used types
pub use agent::{Agent, AgentServices};
pub use capability::{CapabilityAssessment, CapabilityChecker, SuggestedAction};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AgentProfile, RuntimeConfig};
pub use embeddings::{EmbeddingService, HashingEmbedder};
pub use error::{Result, RuntimeError};
pub use events::{AgentEvent, AgentResponse, EventBroadcaster, TurnEvent};
pub use knowledge::{AbsorptionResult, KnowledgeAbsorber, KnowledgeObserver, LearningRecord};
pub use mailbox::{Mailbox, MailboxMessage, MessageHandler, MessageKind, Priority, SendOptions};
pub use memory::{
    ConsolidationResult, MemoryConsolidation, MemoryRetrieval, MemoryStats, MemoryStore,
    RetrievalOptions, ScoredMemory, SharedMemory,
};
pub use reject::{PendingQuestion, RejectOutcome, RejectPolicy, RejectPolicyHandler};
pub use services::{
    ChatMessage, ChatProvider, ChatResponse, IntervalScheduler, PersistRecord, RecordSink,
    Scheduler, Summarizer, ToolCall, ToolCategory,
};
pub use session::{MessageTarget, Session, TurnState};
pub use thinking::{AutonomousThinking, MemoryTrigger, ThinkingTask, TriggerRule};
pub use types::{AgentId, MemoryId, MemoryItem, MemoryType, MessageId, NewMemory};
