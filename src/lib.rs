//! AutoSherpa: conversation orchestration and step routing for a car
//! dealership assistant.

pub mod channels;
pub mod config;
pub mod conversation;
pub mod error;
pub mod flows;
pub mod llm;
pub mod store;
