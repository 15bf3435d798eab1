//! Observation of other agents' answers
//!
//! The observer buffers answers an agent overhears so they can later be
//! absorbed as knowledge. Self-observations are ignored, and when a topic
//! allow-list is configured only answers mentioning one of the topics are
//! kept.

use crate::clock::Clock;
use crate::config::KnowledgeConfig;
use crate::types::{AgentId, MessageId};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

static ORDERED_LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*\d+[.)、]\s*\S").expect("Valid ordered list regex")
});

/// An answer overheard from another agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedAnswer {
    pub question_id: MessageId,
    pub question: String,
    pub answer: String,
    pub source_agent_id: AgentId,
    pub source_agent_name: String,
    pub quality: f32,
    pub observed_at: DateTime<Utc>,
}

/// An observation in absorbable form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRecord {
    pub id: Uuid,
    pub question_id: MessageId,
    pub question: String,
    pub answer: String,
    pub source_agent_id: AgentId,
    pub source_agent_name: String,
    pub quality: f32,
    pub observed_at: DateTime<Utc>,
}

impl From<&ObservedAnswer> for LearningRecord {
    fn from(observed: &ObservedAnswer) -> Self {
        Self {
            id: Uuid::new_v4(),
            question_id: observed.question_id,
            question: observed.question.clone(),
            answer: observed.answer.clone(),
            source_agent_id: observed.source_agent_id.clone(),
            source_agent_name: observed.source_agent_name.clone(),
            quality: observed.quality,
            observed_at: observed.observed_at,
        }
    }
}

pub struct KnowledgeObserver {
    agent_id: AgentId,
    relevant_topics: Vec<String>,
    max_observations: usize,
    clock: Arc<dyn Clock>,
    observations: VecDeque<ObservedAnswer>,
}

impl KnowledgeObserver {
    pub fn new(agent_id: impl Into<AgentId>, config: &KnowledgeConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            agent_id: agent_id.into(),
            relevant_topics: config
                .relevant_topics
                .iter()
                .map(|topic| topic.to_lowercase())
                .filter(|topic| !topic.is_empty())
                .collect(),
            max_observations: config.max_observations,
            clock,
            observations: VecDeque::new(),
        }
    }

    /// Buffer an answer; false when it is the agent's own or off-topic
    pub fn observe(
        &mut self,
        question_id: MessageId,
        question: &str,
        answer: &str,
        source_agent_id: &str,
        source_agent_name: &str,
    ) -> bool {
        if source_agent_id == self.agent_id {
            return false;
        }
        if !self.is_relevant(question, answer) {
            tracing::debug!(
                "Agent {} ignored off-topic answer from {}",
                self.agent_id,
                source_agent_id
            );
            return false;
        }

        if self.observations.len() >= self.max_observations {
            self.observations.pop_front();
        }
        self.observations.push_back(ObservedAnswer {
            question_id,
            question: question.to_string(),
            answer: answer.to_string(),
            source_agent_id: source_agent_id.to_string(),
            source_agent_name: source_agent_name.to_string(),
            quality: quality_score(answer),
            observed_at: self.clock.now(),
        });
        true
    }

    /// Snapshot every buffered observation as a learning record
    pub fn to_learning_records(&self) -> Vec<LearningRecord> {
        self.observations.iter().map(LearningRecord::from).collect()
    }

    /// Discard buffered observations
    pub fn clear(&mut self) {
        self.observations.clear();
    }

    pub fn observations(&self) -> impl Iterator<Item = &ObservedAnswer> {
        self.observations.iter()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    fn is_relevant(&self, question: &str, answer: &str) -> bool {
        if self.relevant_topics.is_empty() {
            return true;
        }
        let text = format!("{} {}", question, answer).to_lowercase();
        self.relevant_topics.iter().any(|topic| text.contains(topic))
    }
}

/// Heuristic answer quality in [0, 1]
pub fn quality_score(answer: &str) -> f32 {
    let length = answer.chars().count();
    let mut score: f32 = 0.5;
    if length > 100 {
        score += 0.1;
    }
    if length > 500 {
        score += 0.1;
    }
    if answer.contains('\n') {
        score += 0.05;
    }
    if ORDERED_LIST.is_match(answer) {
        score += 0.05;
    }
    if answer.contains("```") {
        score += 0.1;
    }
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn observer(topics: &[&str]) -> KnowledgeObserver {
        let config = KnowledgeConfig {
            relevant_topics: topics.iter().map(|t| t.to_string()).collect(),
            max_observations: 3,
            ..Default::default()
        };
        KnowledgeObserver::new("me", &config, Arc::new(SystemClock))
    }

    #[test]
    fn test_rejects_self_observation() {
        let mut observer = observer(&[]);
        assert!(!observer.observe(MessageId::new(), "q", "a", "me", "Me"));
        assert!(observer.is_empty());
    }

    #[test]
    fn test_allow_list_is_case_insensitive() {
        let mut observer = observer(&["Rust"]);
        assert!(observer.observe(MessageId::new(), "what is RUST?", "a language", "other", "Other"));
        assert!(!observer.observe(MessageId::new(), "what is go?", "a language", "other", "Other"));
        assert_eq!(observer.len(), 1);
    }

    #[test]
    fn test_buffer_is_bounded() {
        let mut observer = observer(&[]);
        for i in 0..5 {
            observer.observe(MessageId::new(), &format!("q{}", i), "answer", "other", "Other");
        }
        let questions: Vec<String> = observer.observations().map(|o| o.question.clone()).collect();
        assert_eq!(questions, vec!["q2", "q3", "q4"]);
    }

    #[test]
    fn test_records_and_clear() {
        let mut observer = observer(&[]);
        let id = MessageId::new();
        observer.observe(id, "q", "an answer", "other", "Other");
        let records = observer.to_learning_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].question_id, id);
        assert_eq!(records[0].source_agent_name, "Other");

        observer.clear();
        assert!(observer.is_empty());
    }

    #[test]
    fn test_quality_score() {
        assert_eq!(quality_score("short"), 0.5);
        let long = "x".repeat(150);
        assert!((quality_score(&long) - 0.6).abs() < 1e-6);

        let structured = format!("{}\n1. first\n2. second\n```rust\nfn main() {{}}\n```", "y".repeat(600));
        assert!((quality_score(&structured) - 0.9).abs() < 1e-6);
    }
}
