//! Runtime configuration
//!
//! One TOML document configures every component of every agent in a session.
//! All sections are optional and fall back to their defaults. Durations are
//! written in seconds, except the mailbox debounce which is in milliseconds.

use crate::error::{Result, RuntimeError};
use crate::reject::RejectPolicy;
use crate::types::AgentId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub mailbox: MailboxConfig,
    pub capability: CapabilityConfig,
    pub reject: RejectConfig,
    pub memory: MemoryConfig,
    pub retrieval: RetrievalConfig,
    pub consolidation: ConsolidationConfig,
    pub knowledge: KnowledgeConfig,
    pub thinking: ThinkingConfig,
    pub agents: Vec<AgentProfile>,
}

/// Identity and competence of one agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Tool names the agent can call (matched against tool categories)
    #[serde(default)]
    pub tools: Vec<String>,
    /// Per-agent override of `reject.policy`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_policy: Option<RejectPolicy>,
    /// Per-agent override of `thinking.topics`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_topics: Option<Vec<String>>,
}

impl AgentProfile {
    pub fn new(id: impl Into<AgentId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reject_policy(mut self, policy: RejectPolicy) -> Self {
        self.reject_policy = Some(policy);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Hard capacity; the oldest message is dropped on overflow
    pub max_size: usize,

    /// Delay before the consumer picks up the next message
    #[serde(rename = "debounce_ms", with = "serde_duration_millis")]
    pub debounce: Duration,

    /// Age after which a `normal` message is promoted to `high`
    #[serde(rename = "aging_threshold_secs", with = "serde_duration")]
    pub aging_threshold: Duration,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            debounce: Duration::from_millis(100),
            aging_threshold: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    pub learning_enabled: bool,
    pub reject_unknown: bool,
    pub max_topic_history: usize,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            learning_enabled: true,
            reject_unknown: false,
            max_topic_history: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RejectConfig {
    pub policy: RejectPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_items: usize,
    /// Retention penalty per day of age
    pub decay_rate: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_items: 1000,
            decay_rate: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub min_similarity: f32,
    pub recency_boost: f32,
    pub importance_boost: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity: 0.1,
            recency_boost: 0.1,
            importance_boost: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub enabled: bool,

    #[serde(with = "serde_duration")]
    pub interval: Duration,

    /// Jaccard similarity at or above which two memories merge
    pub similarity_threshold: f32,

    /// Memories older than this are prune candidates
    #[serde(with = "serde_duration")]
    pub max_age: Duration,

    /// Prune candidates accessed fewer times than this are deleted
    pub min_access_for_retention: u32,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(86_400), // daily
            similarity_threshold: 0.8,
            max_age: Duration::from_secs(30 * 86_400),
            min_access_for_retention: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// Allow-list of topics worth observing; empty means everything is relevant
    pub relevant_topics: Vec<String>,
    pub max_observations: usize,
    pub max_daily_absorptions: u32,
    pub min_answer_length: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            relevant_topics: Vec::new(),
            max_observations: 100,
            max_daily_absorptions: 20,
            min_answer_length: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThinkingConfig {
    pub enabled: bool,

    #[serde(with = "serde_duration")]
    pub interval: Duration,

    pub topics: Vec<String>,

    /// Allow memories to trigger thinking outside the timer
    pub memory_triggered: bool,

    /// Per-thought timeout, enforced by the scheduler
    #[serde(with = "serde_duration")]
    pub timeout: Duration,

    pub max_history: usize,
}

impl Default for ThinkingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(3_600),
            topics: Vec::new(),
            memory_triggered: false,
            timeout: Duration::from_secs(120),
            max_history: 100,
        }
    }
}

// Custom serde module for Duration (serialize/deserialize as seconds)
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod serde_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl RuntimeConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let toml_str =
            toml::to_string_pretty(self).map_err(|e| RuntimeError::Config(e.to_string()))?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.mailbox.max_size == 0 {
            return Err(invalid("mailbox.max_size must be at least 1"));
        }
        if self.memory.max_items == 0 {
            return Err(invalid("memory.max_items must be at least 1"));
        }
        if self.memory.decay_rate < 0.0 {
            return Err(invalid("memory.decay_rate must not be negative"));
        }

        unit_interval("retrieval.min_similarity", self.retrieval.min_similarity)?;
        unit_interval("retrieval.recency_boost", self.retrieval.recency_boost)?;
        unit_interval("retrieval.importance_boost", self.retrieval.importance_boost)?;
        unit_interval(
            "consolidation.similarity_threshold",
            self.consolidation.similarity_threshold,
        )?;

        if self.consolidation.interval.is_zero() {
            return Err(invalid("consolidation.interval must be positive"));
        }
        if self.thinking.interval.is_zero() {
            return Err(invalid("thinking.interval must be positive"));
        }
        if self.thinking.timeout.is_zero() {
            return Err(invalid("thinking.timeout must be positive"));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(invalid("agent id must not be empty"));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(invalid(&format!("duplicate agent id: {}", agent.id)));
            }
        }

        Ok(())
    }
}

fn invalid(message: &str) -> RuntimeError {
    RuntimeError::Config(message.to_string())
}

fn unit_interval(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(&format!("{} must be between 0 and 1", name)));
    }
    Ok(())
}
