//! Services layer for the Hypnos memory system
//!
//! Provides the reasoning oracle contract and its LLM-backed implementation.

pub mod llm;
pub mod oracle;

pub use llm::{LlmConfig, LlmService};
pub use oracle::{
    parse_review_response, OracleError, ReasoningOracle, ReviewItem, ReviewVerdict, Verdict,
};
