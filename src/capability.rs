//! Capability assessment
//!
//! Scores an inbound message against an agent's declared competence and
//! decides whether the agent should respond, learn, delegate or reject.
//!
//! # Scoring
//!
//! The score starts at 0.5 and is adjusted by:
//! - keyword overlap with the system-prompt keyword table (weight 0.3)
//! - tool need: +0.2 when covered by the agent's tools, -0.3 otherwise
//! - overlap with recently handled topics (up to 0.2)
//! - familiarity: +0.1 when a past topic appears verbatim in the message
//!
//! The result is clamped to [0, 1]; 0.5 or more means the agent responds.

use crate::config::{AgentProfile, CapabilityConfig};
use crate::memory::text::{token_set, tokenize};
use crate::services::ToolCategory;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

const BASE_SCORE: f32 = 0.5;
const KEYWORD_WEIGHT: f32 = 0.3;
const TOOLS_COVERED_BONUS: f32 = 0.2;
const TOOLS_MISSING_PENALTY: f32 = 0.3;
const TOPIC_WEIGHT: f32 = 0.2;
const FAMILIARITY_BONUS: f32 = 0.1;
const RESPOND_THRESHOLD: f32 = 0.5;
const LEARN_THRESHOLD: f32 = 0.3;
const KEYWORD_REINFORCEMENT: f32 = 0.2;

/// What the agent should do with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestedAction {
    Respond,
    Reject,
    Delegate,
    Learn,
}

/// Outcome of one assessment; never stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityAssessment {
    pub can_respond: bool,
    pub confidence: f32,
    pub reason: Option<String>,
    pub suggested_action: SuggestedAction,
    /// Tool categories the message needs but the agent lacks
    pub required_capabilities: Vec<ToolCategory>,
}

/// Per-agent capability policy
#[derive(Debug, Clone)]
pub struct CapabilityChecker {
    config: CapabilityConfig,
    keywords: HashMap<String, f32>,
    tools: HashSet<ToolCategory>,
    topics: VecDeque<String>,
}

impl CapabilityChecker {
    pub fn new(profile: &AgentProfile, config: CapabilityConfig) -> Self {
        let tools = profile
            .tools
            .iter()
            .filter_map(|name| ToolCategory::from_tool_name(name))
            .collect();

        Self {
            config,
            keywords: keyword_table(&profile.system_prompt),
            tools,
            topics: VecDeque::new(),
        }
    }

    /// Score a message
    pub fn assess(&self, content: &str) -> CapabilityAssessment {
        let tokens = token_set(content);
        let mut score = BASE_SCORE;

        score += self.keyword_score(&tokens) * KEYWORD_WEIGHT;

        let needed = required_tools(content);
        let missing: Vec<ToolCategory> = needed
            .iter()
            .filter(|category| !self.tools.contains(category))
            .copied()
            .collect();
        if !needed.is_empty() {
            if missing.is_empty() {
                score += TOOLS_COVERED_BONUS;
            } else {
                score -= TOOLS_MISSING_PENALTY;
            }
        }

        score += self.topic_score(&tokens);

        let lowered = content.to_lowercase();
        if self
            .topics
            .iter()
            .any(|topic| !topic.is_empty() && lowered.contains(&topic.to_lowercase()))
        {
            score += FAMILIARITY_BONUS;
        }

        let confidence = score.clamp(0.0, 1.0);
        let can_respond = confidence >= RESPOND_THRESHOLD;

        let (suggested_action, reason) = if can_respond {
            (SuggestedAction::Respond, None)
        } else {
            let reason = if missing.is_empty() {
                format!("low confidence ({:.2})", confidence)
            } else {
                let names: Vec<&str> = missing.iter().map(ToolCategory::as_str).collect();
                format!("missing tools: {}", names.join(", "))
            };
            let action = if confidence >= LEARN_THRESHOLD && self.config.learning_enabled {
                SuggestedAction::Learn
            } else if self.config.reject_unknown {
                SuggestedAction::Reject
            } else {
                SuggestedAction::Delegate
            };
            (action, Some(reason))
        };

        tracing::debug!(
            "Capability check: confidence={:.2} action={:?}",
            confidence,
            suggested_action
        );

        CapabilityAssessment {
            can_respond,
            confidence,
            reason,
            suggested_action,
            required_capabilities: missing,
        }
    }

    /// Strengthen keywords after successful learning and remember the topic
    ///
    /// Weights only ever grow and never exceed 1.0.
    pub fn update_capability<S: AsRef<str>>(&mut self, topic: &str, keywords: &[S]) {
        for keyword in keywords {
            for token in tokenize(keyword.as_ref()) {
                let weight = self.keywords.entry(token).or_insert(0.0);
                *weight = (*weight + KEYWORD_REINFORCEMENT).min(1.0);
            }
        }
        self.record_topic(topic);
    }

    /// Append a handled topic to the rolling history
    pub fn record_topic(&mut self, topic: &str) {
        let topic = topic.trim();
        if topic.is_empty() || self.topics.back().map(String::as_str) == Some(topic) {
            return;
        }
        self.topics.push_back(topic.to_string());
        while self.topics.len() > self.config.max_topic_history {
            self.topics.pop_front();
        }
    }

    pub fn keyword_weight(&self, word: &str) -> Option<f32> {
        self.keywords.get(&word.to_lowercase()).copied()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(String::as_str)
    }

    fn keyword_score(&self, tokens: &HashSet<String>) -> f32 {
        if tokens.is_empty() || self.keywords.is_empty() {
            return 0.0;
        }
        let matched: f32 = tokens
            .iter()
            .filter_map(|token| self.keywords.get(token))
            .sum();
        (matched / tokens.len() as f32).min(1.0)
    }

    fn topic_score(&self, tokens: &HashSet<String>) -> f32 {
        if tokens.is_empty() || self.topics.is_empty() {
            return 0.0;
        }
        let topic_tokens: HashSet<String> = self
            .topics
            .iter()
            .flat_map(|topic| tokenize(topic))
            .collect();
        let overlap = tokens.intersection(&topic_tokens).count() as f32 / tokens.len() as f32;
        (overlap * TOPIC_WEIGHT).min(TOPIC_WEIGHT)
    }
}

/// Token frequency normalized by the most frequent token
fn keyword_table(prompt: &str) -> HashMap<String, f32> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    for token in tokenize(prompt) {
        *counts.entry(token).or_insert(0) += 1;
    }
    let max = counts.values().copied().max().unwrap_or(0);
    if max == 0 {
        return HashMap::new();
    }
    counts
        .into_iter()
        .map(|(token, count)| (token, count as f32 / max as f32))
        .collect()
}

/// Tool categories a message seems to need
fn required_tools(content: &str) -> BTreeSet<ToolCategory> {
    let lowered = content.to_lowercase();
    ToolCategory::ALL
        .into_iter()
        .filter(|category| {
            category
                .triggers()
                .iter()
                .any(|trigger| lowered.contains(trigger))
        })
        .collect()
}
