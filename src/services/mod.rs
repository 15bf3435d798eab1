//! Collaborator capabilities consumed by the runtime
//!
//! - `llm`: the language model call
//! - `tools`: typed tool calls reported by the model
//! - `summarizer`: optional text condensation
//! - `persistence`: optional "persist one record" sink
//! - `scheduler`: interval task scheduling

pub mod llm;
pub mod persistence;
pub mod scheduler;
pub mod summarizer;
pub mod tools;

pub use llm::{ChatMessage, ChatProvider, ChatResponse, ChatRole, ToolInvocation};
pub use persistence::{PersistRecord, RecordSink};
pub use scheduler::{
    IntervalScheduler, Scheduler, TaskDef, TaskFuture, TaskHandler, TaskRun, TaskStatus,
};
pub use summarizer::{ChatSummarizer, Summarizer};
pub use tools::{FileOperation, ToolCall, ToolCategory};
