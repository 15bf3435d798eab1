//! Autonomous behaviour independent of incoming messages
//!
//! - `autonomous`: scheduler-driven self-prompting on configured topics
//! - `trigger`: cooldown-gated rules that fire actions on matching memories

pub mod autonomous;
pub mod trigger;

pub use autonomous::{
    AutonomousThinking, ThinkingStatus, ThinkingTask, ThinkingTrigger, ThoughtSink,
};
pub use trigger::{MemoryTrigger, TriggerAction, TriggerCondition, TriggerResult, TriggerRule};
