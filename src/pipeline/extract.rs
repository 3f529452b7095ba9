use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use super::cancel::{Interrupted, RunContext};
use super::llm::{LlmClient, LlmError};
use super::retry::RetryPolicy;
use crate::models::FieldMap;

/// Key of the fallback record when the reply could not be parsed.
pub const RAW_RESPONSE_KEY: &str = "raw_response";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    /// Non-transient LLM failure, or transient after the retry budget ran out.
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// Outcome of parsing one model reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedFields {
    /// A JSON object, passed through with every key the model returned.
    Parsed(FieldMap),
    /// Not a JSON object even after fence stripping.
    Unparseable { raw_response: String },
}

impl ExtractedFields {
    pub fn is_parsed(&self) -> bool {
        matches!(self, ExtractedFields::Parsed(_))
    }

    /// Flat record form: unparseable replies become `{"raw_response": ...}`.
    pub fn into_field_map(self) -> FieldMap {
        match self {
            ExtractedFields::Parsed(map) => map,
            ExtractedFields::Unparseable { raw_response } => {
                let mut map = FieldMap::new();
                map.insert(RAW_RESPONSE_KEY.into(), Value::String(raw_response));
                map
            }
        }
    }
}

/// Strip one leading ```json / ``` fence and one trailing ``` fence.
pub fn strip_code_fences(content: &str) -> &str {
    let mut s = content.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

/// Parse a model reply into a field map, repairing markdown fences.
pub fn parse_model_response(content: &str) -> ExtractedFields {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(content.trim()) {
        return ExtractedFields::Parsed(map);
    }
    match serde_json::from_str::<Value>(strip_code_fences(content)) {
        Ok(Value::Object(map)) => ExtractedFields::Parsed(map),
        _ => ExtractedFields::Unparseable {
            raw_response: strip_code_fences(content).to_string(),
        },
    }
}

/// Runs one extraction prompt through the LLM with retry, then parses the
/// reply. Returned keys are never filtered or augmented here.
#[derive(Clone)]
pub struct ExtractionEngine {
    llm: Arc<dyn LlmClient>,
    retry: RetryPolicy,
}

impl ExtractionEngine {
    pub fn new(llm: Arc<dyn LlmClient>, retry: RetryPolicy) -> Self {
        Self { llm, retry }
    }

    /// Raw model reply, with transport retry and cancellation.
    pub async fn invoke(&self, prompt: &str, ctx: &RunContext) -> Result<String, ExtractionError> {
        let reply = ctx
            .guard(self.retry.run(|| self.llm.invoke(prompt)))
            .await??;
        Ok(reply)
    }

    pub async fn extract(
        &self,
        prompt: &str,
        ctx: &RunContext,
    ) -> Result<ExtractedFields, ExtractionError> {
        tracing::trace!(prompt = %prompt, "Extraction prompt");
        let reply = self.invoke(prompt, ctx).await?;
        let fields = parse_model_response(&reply);
        match &fields {
            ExtractedFields::Parsed(map) => {
                tracing::debug!(fields = map.len(), "Extraction reply parsed");
            }
            ExtractedFields::Unparseable { raw_response } => {
                tracing::warn!(
                    reply_chars = raw_response.chars().count(),
                    "Extraction reply is not a JSON object, keeping raw response"
                );
            }
        }
        Ok(fields)
    }
}
