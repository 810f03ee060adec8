//! Conversation engine: per-user state, intent classification, step routing
//! and the orchestrator that ties them together.

pub mod classifier;
pub mod locks;
pub mod orchestrator;
pub mod phrases;
pub mod router;
pub mod state;
pub mod store;

pub use classifier::{
    Classification, IntentClassifier, IntentTag, KeywordClassifier, LlmIntentClassifier,
    route_intent,
};
pub use locks::UserLocks;
pub use orchestrator::Orchestrator;
pub use router::{Entry, OutcomeKind, StepOutcome, StepRouter};
pub use state::{ConversationState, FieldValue, FlowData, FlowName, Step, SubState};
pub use store::{ConversationStateStore, InMemoryStateStore, StatePatch, spawn_sweep_task};
