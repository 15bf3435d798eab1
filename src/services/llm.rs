//! Language model collaborator
//!
//! The runtime never talks HTTP itself. Callers hand each agent a
//! [`ChatProvider`]; failures come back as `Err` and are absorbed at the call
//! site (`respond`, `think`) without retry.

use crate::error::Result;
use crate::services::tools::ToolCall;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Role of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One chat message sent to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A tool invocation the model made while producing its answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub call: ToolCall,
    pub output: Option<String>,
}

/// Model reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    /// Tool invocations reported by the provider, in call order
    #[serde(default)]
    pub tool_calls: Vec<ToolInvocation>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// The "language model call" capability
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Send a conversation and wait for the reply
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse>;

    /// Provider name for logging
    fn name(&self) -> &str {
        "chat"
    }
}
