//! Error types for AutoSherpa.

use std::time::Duration;

use crate::conversation::state::{FlowName, Step};

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Classification error: {0}")]
    Classification(#[from] ClassificationError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Commit error: {0}")]
    Commit(#[from] CommitError),

    #[error("Compose error: {0}")]
    Compose(#[from] ComposeError),

    #[error("Flow definition error: {0}")]
    Definition(#[from] DefinitionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Channel-related errors. Delivery failures surface here and stop at the
/// channel layer.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Intent classifier failures. Never fatal: the orchestrator falls back to
/// the general-intent path.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("Classifier timed out after {0:?}")]
    Timeout(Duration),

    #[error("Classifier unavailable: {0}")]
    Unavailable(#[from] LlmError),

    #[error("Unparseable classifier output: {0}")]
    Unparseable(String),
}

/// Per-flow extractor failures. The router answers these with the flow's
/// deterministic parser.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Extractor for {flow} timed out after {timeout:?}")]
    Timeout { flow: FlowName, timeout: Duration },

    #[error("Extractor for {flow} unavailable: {source}")]
    Unavailable {
        flow: FlowName,
        #[source]
        source: LlmError,
    },

    #[error("Unparseable extractor output for {flow}: {reason}")]
    Unparseable { flow: FlowName, reason: String },
}

/// A state that the flow tables do not allow. Aborts the flow.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("No flow definition registered for {0}")]
    UnknownFlow(FlowName),

    #[error("Step {step} is not declared by flow {flow}")]
    UndeclaredStep { flow: FlowName, step: Step },

    #[error("Step {step} of {flow} is awaiting confirmation but has no commit action")]
    MissingCommit { flow: FlowName, step: Step },

    #[error("No transition out of step {step} of {flow} matches the collected data")]
    NoTransition { flow: FlowName, step: Step },

    #[error("Flow {flow} did not settle after {hops} transitions")]
    Unsettled { flow: FlowName, hops: usize },

    #[error("Hand-off from {from} to {to} is not allowed here")]
    InvalidHandoff { from: FlowName, to: FlowName },

    #[error("State store failed: {0}")]
    Store(#[from] DatabaseError),
}

/// Record store commit failure at a confirmation point. Retryable.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("Commit timed out after {0:?}")]
    Timeout(Duration),

    #[error("Commit rejected: {0}")]
    Rejected(String),

    #[error("Commit failed: {0}")]
    Database(#[from] DatabaseError),
}

/// Reply composition failure. Replaced by a generic templated message.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("No template for {flow} step {step}")]
    NoTemplate { flow: FlowName, step: Step },

    #[error("Missing data for reply: {0}")]
    MissingData(String),
}

/// A flow table that fails its load-time checks.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("Flow {flow} does not declare its entry step {step}")]
    MissingEntry { flow: FlowName, step: Step },

    #[error("Flow {flow} declares step {step} twice")]
    DuplicateStep { flow: FlowName, step: Step },

    #[error("Flow {flow} step {from} targets undeclared step {to}")]
    UndeclaredTarget { flow: FlowName, from: Step, to: Step },

    #[error("Flow {flow} step {step} uses undeclared field {field}")]
    UndeclaredField {
        flow: FlowName,
        step: Step,
        field: String,
    },

    #[error("Flow {flow} step {step} has no outgoing transition")]
    DeadEnd { flow: FlowName, step: Step },

    #[error("Flow {flow} step {step} is unreachable from the entry step")]
    Unreachable { flow: FlowName, step: Step },

    #[error("Flow {flow} declares the terminal step as a regular step")]
    TerminalDeclared { flow: FlowName },

    #[error("No definition registered for flow {0}")]
    MissingFlow(FlowName),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
