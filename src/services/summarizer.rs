//! Summarization collaborator
//!
//! Optional. Without one, consolidation falls back to plain concatenation and
//! absorbed knowledge is stored verbatim.

use crate::error::{Result, RuntimeError};
use crate::services::llm::{ChatMessage, ChatProvider};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String>;
}

/// Summarizer backed by a chat model
pub struct ChatSummarizer {
    provider: Arc<dyn ChatProvider>,
    max_chars: usize,
}

impl ChatSummarizer {
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self {
            provider,
            max_chars: 4000,
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }
}

#[async_trait]
impl Summarizer for ChatSummarizer {
    async fn summarize(&self, text: &str) -> Result<String> {
        let excerpt: String = text.chars().take(self.max_chars).collect();
        let messages = [
            ChatMessage::system(
                "Condense the following notes into one short paragraph. Keep every distinct fact.",
            ),
            ChatMessage::user(excerpt),
        ];

        let response = self.provider.chat(&messages).await?;
        let summary = response.content.trim().to_string();
        if summary.is_empty() {
            return Err(RuntimeError::Summarizer("empty summary".to_string()));
        }
        Ok(summary)
    }
}
