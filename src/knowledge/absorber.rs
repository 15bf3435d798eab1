//! Absorption of learning records into semantic memory
//!
//! Every absorption counts against a daily quota that resets when the UTC
//! date changes. Quota and validation failures are reported in the returned
//! [`AbsorptionResult`], never as errors.

use crate::clock::Clock;
use crate::config::KnowledgeConfig;
use crate::embeddings::EmbeddingService;
use crate::knowledge::observer::LearningRecord;
use crate::memory::SharedMemory;
use crate::services::Summarizer;
use crate::types::{MemoryId, MemoryType, NewMemory};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Importance given to absorbed knowledge
pub const ABSORBED_IMPORTANCE: f32 = 0.6;

pub const QUOTA_EXCEEDED: &str = "已达到每日吸收上限";
pub const EMPTY_RECORD: &str = "问题或答案为空";
pub const ANSWER_TOO_SHORT: &str = "答案过短";

/// Outcome of absorbing one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsorptionResult {
    pub success: bool,
    pub memory_id: Option<MemoryId>,
    pub reason: Option<String>,
}

impl AbsorptionResult {
    fn absorbed(memory_id: MemoryId) -> Self {
        Self {
            success: true,
            memory_id: Some(memory_id),
            reason: None,
        }
    }

    fn refused(reason: &str) -> Self {
        Self {
            success: false,
            memory_id: None,
            reason: Some(reason.to_string()),
        }
    }

    pub fn is_quota_exceeded(&self) -> bool {
        self.reason.as_deref() == Some(QUOTA_EXCEEDED)
    }
}

pub struct KnowledgeAbsorber {
    config: KnowledgeConfig,
    memory: SharedMemory,
    summarizer: Option<Arc<dyn Summarizer>>,
    embedder: Option<Arc<dyn EmbeddingService>>,
    clock: Arc<dyn Clock>,
    quota_day: NaiveDate,
    absorbed_today: u32,
}

impl KnowledgeAbsorber {
    pub fn new(config: KnowledgeConfig, memory: SharedMemory, clock: Arc<dyn Clock>) -> Self {
        let quota_day = clock.now().date_naive();
        Self {
            config,
            memory,
            summarizer: None,
            embedder: None,
            clock,
            quota_day,
            absorbed_today: 0,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Option<Arc<dyn Summarizer>>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_embedder(mut self, embedder: Option<Arc<dyn EmbeddingService>>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Absorb one record as a semantic memory
    pub async fn absorb(&mut self, record: &LearningRecord) -> AbsorptionResult {
        self.roll_quota_day();
        if self.absorbed_today >= self.config.max_daily_absorptions {
            tracing::warn!(
                "Daily absorption quota ({}) reached",
                self.config.max_daily_absorptions
            );
            return AbsorptionResult::refused(QUOTA_EXCEEDED);
        }

        let question = record.question.trim();
        let answer = record.answer.trim();
        if question.is_empty() || answer.is_empty() {
            return AbsorptionResult::refused(EMPTY_RECORD);
        }
        if answer.chars().count() < self.config.min_answer_length {
            return AbsorptionResult::refused(ANSWER_TOO_SHORT);
        }

        let formatted = format!(
            "[learned from {}]\nQ: {}\nA: {}",
            record.source_agent_name, question, answer
        );
        let content = match &self.summarizer {
            Some(summarizer) => match summarizer.summarize(&formatted).await {
                Ok(summary) => summary,
                Err(e) => {
                    tracing::warn!("Summarizer failed, storing record verbatim: {}", e);
                    formatted
                }
            },
            None => formatted,
        };

        let mut memory = NewMemory::new(MemoryType::Semantic, content, ABSORBED_IMPORTANCE)
            .with_metadata("source", json!("learned"))
            .with_metadata("sourceAgentId", json!(record.source_agent_id))
            .with_metadata("sourceAgentName", json!(record.source_agent_name))
            .with_metadata("recordId", json!(record.id.to_string()))
            .with_metadata("questionId", json!(record.question_id.to_string()))
            .with_metadata("quality", json!(record.quality));
        if let Some(embedder) = &self.embedder {
            match embedder.embed(&memory.content).await {
                Ok(embedding) => memory = memory.with_embedding(embedding),
                Err(e) => tracing::warn!("Embedding absorbed knowledge failed: {}", e),
            }
        }

        let item = self.memory.write().await.add(memory);
        self.absorbed_today += 1;
        tracing::debug!(
            "Absorbed answer from {} as memory {} ({}/{} today)",
            record.source_agent_id,
            item.id,
            self.absorbed_today,
            self.config.max_daily_absorptions
        );
        AbsorptionResult::absorbed(item.id)
    }

    /// Absorb records in order, stopping at the daily quota
    ///
    /// Once the quota is hit every remaining record gets the quota reason.
    pub async fn absorb_batch(&mut self, records: &[LearningRecord]) -> Vec<AbsorptionResult> {
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let result = self.absorb(record).await;
            let exhausted = result.is_quota_exceeded();
            results.push(result);
            if exhausted {
                break;
            }
        }
        while results.len() < records.len() {
            results.push(AbsorptionResult::refused(QUOTA_EXCEEDED));
        }
        results
    }

    pub fn absorbed_today(&mut self) -> u32 {
        self.roll_quota_day();
        self.absorbed_today
    }

    pub fn remaining_today(&mut self) -> u32 {
        self.roll_quota_day();
        self.config
            .max_daily_absorptions
            .saturating_sub(self.absorbed_today)
    }

    fn roll_quota_day(&mut self) {
        let today = self.clock.now().date_naive();
        if today != self.quota_day {
            self.quota_day = today;
            self.absorbed_today = 0;
        }
    }
}
