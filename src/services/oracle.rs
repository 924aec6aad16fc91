//! Reasoning oracle contract and response validation
//!
//! The oracle is an external, possibly slow and possibly wrong reasoning
//! service. Everything it returns is treated as untrusted text and validated
//! into [`Verdict`]s here before the lifecycle engine acts on it.

use crate::types::{Decision, Domain, MemoryId};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Oracle failures
#[derive(Error, Debug, Clone)]
pub enum OracleError {
    /// The call exceeded its time bound
    #[error("Oracle call timed out after {0:?}")]
    Timeout(Duration),

    /// Transport or API failure
    #[error("Oracle unavailable: {0}")]
    Unavailable(String),

    /// The response could not be understood at all
    #[error("Malformed oracle response: {0}")]
    Malformed(String),

    /// Missing credentials or endpoint
    #[error("Oracle not configured: {0}")]
    NotConfigured(String),
}

impl OracleError {
    /// Failures worth retrying on the next tick
    pub fn is_transient(&self) -> bool {
        matches!(self, OracleError::Timeout(_) | OracleError::Unavailable(_))
    }
}

impl From<reqwest::Error> for OracleError {
    fn from(err: reqwest::Error) -> Self {
        OracleError::Unavailable(err.to_string())
    }
}

/// One record submitted for review
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewItem {
    pub id: MemoryId,
    pub content: String,
    pub tags: Vec<String>,
    pub domain: Domain,
}

/// External reasoning service used by the sleep and think cycles
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    /// Ask for a promote/extend/archive/forget decision on every item
    async fn review_batch(&self, items: &[ReviewItem]) -> Result<String, OracleError>;

    /// Ask for a free-form reflection on a topic
    async fn reflect(&self, topic: &str, context: &str) -> Result<String, OracleError>;
}

/// Validated oracle decision for one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Promote,
    Extend,
    Archive,
    Forget,
    /// Present but not understood; counts as a failed review
    Invalid,
}

impl Verdict {
    /// Case-insensitive; accepts `important` for promote and `context` for extend
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "promote" | "important" => Verdict::Promote,
            "extend" | "context" => Verdict::Extend,
            "archive" => Verdict::Archive,
            "forget" => Verdict::Forget,
            _ => Verdict::Invalid,
        }
    }

    pub fn decision(&self) -> Option<Decision> {
        match self {
            Verdict::Promote => Some(Decision::Promote),
            Verdict::Extend => Some(Decision::Extend),
            Verdict::Archive => Some(Decision::Archive),
            Verdict::Forget => Some(Decision::Forget),
            Verdict::Invalid => None,
        }
    }
}

/// A verdict with the oracle's stated reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewVerdict {
    pub verdict: Verdict,
    pub reason: String,
}

/// Build the review prompt for a batch
pub fn review_prompt(items: &[ReviewItem]) -> String {
    let listing: Vec<String> = items
        .iter()
        .map(|item| {
            format!(
                "ID: {}\nDomain: {}\nTags: {}\nContent:\n{}",
                item.id,
                item.domain,
                if item.tags.is_empty() {
                    "(none)".to_string()
                } else {
                    item.tags.join(", ")
                },
                item.content
            )
        })
        .collect();

    format!(
        r#"You are reviewing expired memories for an agent's long-term memory during its sleep cycle.

For each memory below decide exactly one of:
- promote: durable knowledge worth keeping indefinitely
- extend: still useful context, keep for another week
- archive: no longer active but worth keeping as history
- forget: noise, duplicated or wrong

Memories:

{}

Respond with ONLY a JSON object keyed by memory ID:
{{"<id>": {{"decision": "promote|extend|archive|forget", "reason": "<one sentence>"}}}}
"#,
        listing.join("\n\n---\n\n")
    )
}

/// Build the reflection prompt for a think task
pub fn reflection_prompt(topic: &str, context: &str) -> String {
    let context = if context.trim().is_empty() {
        "(no additional context)"
    } else {
        context
    };
    format!(
        r#"Take a moment to think deeply about the following topic.

Topic: {}

Context:
{}

Write down the insights worth remembering: connections to what you already know,
open questions, and anything that should change how you act in the future."#,
        topic, context
    )
}

/// Remove a surrounding Markdown code fence, if any
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let body = match trimmed.find('\n') {
        Some(pos) => &trimmed[pos + 1..],
        None => return "",
    };
    body.trim_end().trim_end_matches("```").trim()
}

/// Find the outermost JSON value in text that may carry surrounding prose
fn extract_json(text: &str) -> Option<Value> {
    let body = strip_code_fence(text);
    if let Ok(value) = serde_json::from_str(body) {
        return Some(value);
    }

    let start = body.find(|c: char| c == '{' || c == '[')?;
    let close = if body[start..].starts_with('{') { '}' } else { ']' };
    let end = body.rfind(close)?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&body[start..=end]).ok()
}

fn verdict_from_value(value: &Value) -> ReviewVerdict {
    match value {
        Value::String(s) => ReviewVerdict {
            verdict: Verdict::parse(s),
            reason: String::new(),
        },
        Value::Object(map) => ReviewVerdict {
            verdict: map
                .get("decision")
                .and_then(Value::as_str)
                .map(Verdict::parse)
                .unwrap_or(Verdict::Invalid),
            reason: map
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        _ => ReviewVerdict {
            verdict: Verdict::Invalid,
            reason: String::new(),
        },
    }
}

/// Validate a review response into per-record verdicts
///
/// Accepts a JSON object keyed by id or an array of `{id, decision, reason}`,
/// optionally inside a code fence. Entries with unparseable ids are dropped;
/// when an id appears twice the first entry wins. Records absent from the
/// result are treated by the caller as having no decision.
pub fn parse_review_response(text: &str) -> Result<HashMap<MemoryId, ReviewVerdict>, OracleError> {
    let value = extract_json(text).ok_or_else(|| {
        OracleError::Malformed(format!(
            "no JSON found in response: {}",
            text.chars().take(120).collect::<String>()
        ))
    })?;

    let mut verdicts = HashMap::new();
    let mut record = |raw_id: &str, verdict: ReviewVerdict| match MemoryId::from_string(raw_id) {
        Ok(id) => {
            verdicts.entry(id).or_insert(verdict);
        }
        Err(_) => warn!("Oracle returned a decision for unknown id '{}'", raw_id),
    };

    match &value {
        Value::Object(map) => {
            for (raw_id, entry) in map {
                record(raw_id.as_str(), verdict_from_value(entry));
            }
        }
        Value::Array(entries) => {
            for entry in entries {
                match entry.get("id").and_then(Value::as_str) {
                    Some(raw_id) => record(raw_id, verdict_from_value(entry)),
                    None => warn!("Oracle returned an array entry without an id"),
                }
            }
        }
        other => {
            return Err(OracleError::Malformed(format!(
                "expected an object or array, got {}",
                other
            )))
        }
    }

    Ok(verdicts)
}
