//! Learning from other agents
//!
//! [`KnowledgeObserver`] buffers answers an agent overhears;
//! [`KnowledgeAbsorber`] turns qualifying ones into semantic memories,
//! subject to a daily quota.

pub mod absorber;
pub mod observer;

pub use absorber::{AbsorptionResult, KnowledgeAbsorber, QUOTA_EXCEEDED};
pub use observer::{quality_score, KnowledgeObserver, LearningRecord, ObservedAnswer};
