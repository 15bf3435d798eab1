//! Reject policies and pending questions
//!
//! When an agent decides not to answer, one of four policies runs:
//!
//! | policy           | reply                 | recorded as pending |
//! |------------------|-----------------------|---------------------|
//! | `silent`         | none                  | yes                 |
//! | `polite`         | random apology        | no                  |
//! | `delegate`       | "ask someone else"    | no                  |
//! | `learn_and_wait` | none                  | yes, waiting        |
//!
//! Recorded questions stay pending until another agent's answer is matched
//! to them with [`RejectPolicyHandler::mark_answered`].

use crate::clock::Clock;
use crate::mailbox::MailboxMessage;
use crate::types::MessageId;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const POLITE_TEMPLATES: [&str; 3] = [
    "抱歉，这个问题超出了我的专业范围。",
    "不好意思，我暂时无法回答这个问题。",
    "这个问题我不太擅长，恐怕帮不上忙。",
];

const DELEGATE_TEMPLATE: &str = "这个问题其他成员可能更擅长，建议向他们请教。";

/// Strategy applied to a message the agent will not answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectPolicy {
    Silent,
    #[default]
    Polite,
    Delegate,
    LearnAndWait,
}

impl RejectPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectPolicy::Silent => "silent",
            RejectPolicy::Polite => "polite",
            RejectPolicy::Delegate => "delegate",
            RejectPolicy::LearnAndWait => "learn_and_wait",
        }
    }

    /// Whether this policy parks the question for later answering
    pub fn records_question(&self) -> bool {
        matches!(self, RejectPolicy::Silent | RejectPolicy::LearnAndWait)
    }
}

impl fmt::Display for RejectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A question the agent declined but may learn the answer to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub message_id: MessageId,
    pub content: String,
    pub sender_id: String,
    pub sender_name: String,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub answered: bool,
    pub answer: Option<String>,
    pub answered_by: Option<String>,
    pub answered_at: Option<DateTime<Utc>>,
}

/// Result of executing a policy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectOutcome {
    pub policy: RejectPolicy,
    /// Text to send back, if any
    pub reply: Option<String>,
    pub recorded: bool,
    pub suggest_delegate: bool,
    pub waiting_for_answer: bool,
}

/// Executes the configured policy and tracks pending questions
#[derive(Debug)]
pub struct RejectPolicyHandler {
    policy: RejectPolicy,
    clock: Arc<dyn Clock>,
    rng: StdRng,
    questions: Vec<PendingQuestion>,
}

impl RejectPolicyHandler {
    pub fn new(policy: RejectPolicy, clock: Arc<dyn Clock>, rng: StdRng) -> Self {
        Self {
            policy,
            clock,
            rng,
            questions: Vec::new(),
        }
    }

    pub fn policy(&self) -> RejectPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: RejectPolicy) {
        self.policy = policy;
    }

    /// Run the policy for one declined message
    pub fn execute(&mut self, message: &MailboxMessage, reason: Option<&str>) -> RejectOutcome {
        let policy = self.policy;
        if policy.records_question() {
            self.record(message, reason);
        }

        let outcome = match policy {
            RejectPolicy::Silent => RejectOutcome {
                policy,
                reply: None,
                recorded: true,
                suggest_delegate: false,
                waiting_for_answer: false,
            },
            RejectPolicy::Polite => {
                let template = POLITE_TEMPLATES
                    .choose(&mut self.rng)
                    .copied()
                    .unwrap_or(POLITE_TEMPLATES[0]);
                let reply = match reason {
                    Some(reason) if !reason.is_empty() => format!("{}（{}）", template, reason),
                    _ => template.to_string(),
                };
                RejectOutcome {
                    policy,
                    reply: Some(reply),
                    recorded: false,
                    suggest_delegate: false,
                    waiting_for_answer: false,
                }
            }
            RejectPolicy::Delegate => RejectOutcome {
                policy,
                reply: Some(DELEGATE_TEMPLATE.to_string()),
                recorded: false,
                suggest_delegate: true,
                waiting_for_answer: false,
            },
            RejectPolicy::LearnAndWait => RejectOutcome {
                policy,
                reply: None,
                recorded: true,
                suggest_delegate: false,
                waiting_for_answer: true,
            },
        };

        tracing::debug!(
            "Rejected message {} with policy {} (recorded: {})",
            message.id,
            policy,
            outcome.recorded
        );
        outcome
    }

    /// Mark a recorded question as answered; false if unknown or already answered
    pub fn mark_answered(
        &mut self,
        message_id: &MessageId,
        answer: impl Into<String>,
        answered_by: impl Into<String>,
    ) -> bool {
        let now = self.clock.now();
        match self
            .questions
            .iter_mut()
            .find(|q| &q.message_id == message_id && !q.answered)
        {
            Some(question) => {
                question.answered = true;
                question.answer = Some(answer.into());
                question.answered_by = Some(answered_by.into());
                question.answered_at = Some(now);
                true
            }
            None => false,
        }
    }

    /// Remove and return every answered question
    pub fn cleanup_answered(&mut self) -> Vec<PendingQuestion> {
        let (answered, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.questions)
            .into_iter()
            .partition(|q| q.answered);
        self.questions = pending;
        answered
    }

    /// Unanswered questions, oldest first
    pub fn pending(&self) -> Vec<PendingQuestion> {
        self.questions
            .iter()
            .filter(|q| !q.answered)
            .cloned()
            .collect()
    }

    pub fn get(&self, message_id: &MessageId) -> Option<&PendingQuestion> {
        self.questions.iter().find(|q| &q.message_id == message_id)
    }

    /// Recorded questions, answered or not
    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    fn record(&mut self, message: &MailboxMessage, reason: Option<&str>) {
        if self.get(&message.id).is_some() {
            return;
        }
        self.questions.push(PendingQuestion {
            message_id: message.id,
            content: message.content.clone(),
            sender_id: message.sender_id.clone(),
            sender_name: message.sender_name.clone(),
            reason: reason.map(str::to_string),
            timestamp: self.clock.now(),
            answered: false,
            answer: None,
            answered_by: None,
            answered_at: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mailbox::Priority;
    use rand::SeedableRng;

    fn handler(policy: RejectPolicy) -> RejectPolicyHandler {
        RejectPolicyHandler::new(
            policy,
            Arc::new(ManualClock::starting_now()),
            StdRng::seed_from_u64(7),
        )
    }

    fn message(content: &str) -> MailboxMessage {
        MailboxMessage {
            id: MessageId::new(),
            sender_id: "user".to_string(),
            sender_name: "User".to_string(),
            content: content.to_string(),
            priority: Priority::Normal,
            timestamp: Utc::now(),
            reply_to: None,
            metadata: Default::default(),
            kind: Default::default(),
        }
    }

    #[test]
    fn test_silent_records_without_reply() {
        let mut handler = handler(RejectPolicy::Silent);
        let outcome = handler.execute(&message("q"), Some("low confidence"));
        assert_eq!(outcome.reply, None);
        assert!(outcome.recorded);
        assert!(!outcome.waiting_for_answer);
        assert_eq!(handler.pending().len(), 1);
        assert_eq!(handler.pending()[0].reason.as_deref(), Some("low confidence"));
    }

    #[test]
    fn test_polite_replies_without_recording() {
        let mut handler = handler(RejectPolicy::Polite);
        let outcome = handler.execute(&message("q"), Some("missing tools: search"));
        let reply = outcome.reply.unwrap();
        assert!(POLITE_TEMPLATES.iter().any(|t| reply.starts_with(t)));
        assert!(reply.contains("missing tools: search"));
        assert!(!outcome.recorded);
        assert!(handler.is_empty());
    }

    #[test]
    fn test_polite_is_deterministic_with_seed() {
        let mut a = handler(RejectPolicy::Polite);
        let mut b = handler(RejectPolicy::Polite);
        for _ in 0..5 {
            assert_eq!(
                a.execute(&message("q"), None).reply,
                b.execute(&message("q"), None).reply
            );
        }
    }

    #[test]
    fn test_delegate_suggests_delegation() {
        let mut handler = handler(RejectPolicy::Delegate);
        let outcome = handler.execute(&message("q"), None);
        assert!(outcome.suggest_delegate);
        assert_eq!(outcome.reply.as_deref(), Some(DELEGATE_TEMPLATE));
        assert!(handler.is_empty());
    }

    #[test]
    fn test_learn_and_wait_lifecycle() {
        let mut handler = handler(RejectPolicy::LearnAndWait);
        let asked = message("what is a monad");
        let outcome = handler.execute(&asked, None);
        assert!(outcome.waiting_for_answer);
        assert!(outcome.recorded);

        assert!(handler.mark_answered(&asked.id, "a monoid in the category of endofunctors", "bob"));
        assert!(!handler.mark_answered(&asked.id, "again", "carol"));
        assert!(handler.pending().is_empty());

        let answered = handler.cleanup_answered();
        assert_eq!(answered.len(), 1);
        assert_eq!(answered[0].answered_by.as_deref(), Some("bob"));
        assert!(answered[0].answered_at.is_some());
        assert!(handler.is_empty());
    }

    #[test]
    fn test_mark_unknown_question() {
        let mut handler = handler(RejectPolicy::Silent);
        assert!(!handler.mark_answered(&MessageId::new(), "x", "y"));
    }

    #[test]
    fn test_policy_serde_names() {
        let json = serde_json::to_string(&RejectPolicy::LearnAndWait).unwrap();
        assert_eq!(json, "\"learn_and_wait\"");
        assert_eq!(RejectPolicy::default(), RejectPolicy::Polite);
    }
}
