//! Wire adapter for the legacy request/response contract.
//!
//! Clients send `{ prompt, compile, h, w, override }` where the flags are the
//! literal strings `"True"`/`"False"` and the dimensions may be numbers,
//! numeric strings or empty strings. Everything past this module works with
//! [`InferenceRequest`] and [`InferenceOutcome`] only.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Result, ServerError},
    orchestrator::InferenceOutcome,
};

pub const DEFAULT_DIMENSION: usize = 256;

/// Response value clients read as "the safety gate suppressed this image".
pub const REJECTED_SENTINEL: &str = "420";

/// Raw request body. Every field is optional on the wire so that malformed
/// input is reported by [`InferencePayload::into_request`] as a validation
/// failure rather than a deserialization error.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InferencePayload {
    #[serde(default)]
    pub prompt: Value,
    #[serde(default)]
    pub compile: Value,
    #[serde(default)]
    pub h: Value,
    #[serde(default)]
    pub w: Value,
    #[serde(default, rename = "override")]
    pub override_safety: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRequest {
    pub prompt: String,
    pub height: usize,
    pub width: usize,
    pub compile: bool,
    pub override_safety: bool,
}

impl InferenceRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            height: DEFAULT_DIMENSION,
            width: DEFAULT_DIMENSION,
            compile: false,
            override_safety: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct InferenceResponse {
    pub img: String,
}

impl From<InferenceOutcome> for InferenceResponse {
    fn from(outcome: InferenceOutcome) -> Self {
        let img = match outcome {
            InferenceOutcome::Uploaded(url) => url,
            InferenceOutcome::Rejected => REJECTED_SENTINEL.to_string(),
        };
        Self { img }
    }
}

impl InferencePayload {
    pub fn into_request(self) -> Result<InferenceRequest> {
        let prompt = parse_prompt(&self.prompt)?;
        Ok(InferenceRequest {
            prompt,
            height: parse_dimension("h", &self.h)?,
            width: parse_dimension("w", &self.w)?,
            compile: parse_flag(&self.compile),
            override_safety: parse_flag(&self.override_safety),
        })
    }
}

fn parse_prompt(value: &Value) -> Result<String> {
    let prompt = match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Null => String::new(),
        Value::Array(_) | Value::Object(_) => {
            return Err(ServerError::InvalidRequest(
                "prompt must be a string".to_string(),
            ))
        }
    };
    if prompt.trim().is_empty() {
        return Err(ServerError::InvalidRequest(
            "prompt must not be empty".to_string(),
        ));
    }
    Ok(prompt)
}

/// Only the exact text `"True"` (or a native `true`) enables a flag.
pub fn parse_flag(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::String(text) => text == "True",
        _ => false,
    }
}

/// Missing, `null` or empty values fall back to [`DEFAULT_DIMENSION`];
/// anything else passes through unbounded.
pub fn parse_dimension(field: &str, value: &Value) -> Result<usize> {
    let invalid = || {
        ServerError::InvalidRequest(format!(
            "`{field}` must be a non-negative integer or an empty string"
        ))
    };
    match value {
        Value::Null => Ok(DEFAULT_DIMENSION),
        Value::String(text) if text.trim().is_empty() => Ok(DEFAULT_DIMENSION),
        Value::String(text) => text.trim().parse().map_err(|_| invalid()),
        Value::Number(number) => number
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(invalid),
        _ => Err(invalid()),
    }
}
