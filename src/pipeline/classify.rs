use serde_json::Value;

use super::cancel::RunContext;
use super::extract::{strip_code_fences, ExtractionEngine, ExtractionError};
use super::prompt::{build_classification_prompt, CLASSIFY_KEY};
use crate::models::DocumentLabel;

/// Keyword lists per label. Checked in `DocumentLabel::PRIORITY` order.
fn keywords(label: DocumentLabel) -> &'static [&'static str] {
    match label {
        DocumentLabel::Express => &["运单号", "快递单号", "收件人", "寄件人", "物流"],
        DocumentLabel::SamplingForm => &["抽样编号", "抽样基数", "备样量", "被抽样单位"],
        DocumentLabel::TestReport => &["检测项目", "检测结果", "检验依据", "检验结论"],
        DocumentLabel::Unknown => &[],
    }
}

/// Deterministic keyword classification.
pub fn classify_by_keywords(text: &str) -> DocumentLabel {
    DocumentLabel::PRIORITY
        .into_iter()
        .find(|label| keywords(*label).iter().any(|kw| text.contains(kw)))
        .unwrap_or(DocumentLabel::Unknown)
}

/// Read the label out of a classifier reply. `None` if the reply is not a
/// JSON object with a recognised label under the classification key.
pub fn parse_classification(reply: &str) -> Option<DocumentLabel> {
    let value: Value = serde_json::from_str(strip_code_fences(reply)).ok()?;
    value
        .get(CLASSIFY_KEY)
        .and_then(Value::as_str)
        .and_then(DocumentLabel::from_label)
}

/// First `max_chars` characters (not bytes) of `text`.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// How a label was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationSource {
    Llm,
    KeywordFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub label: DocumentLabel,
    pub source: ClassificationSource,
}

/// LLM classifier with keyword fallback.
///
/// Transport errors (after retry) propagate; an unusable reply falls back to
/// keywords.
pub struct Classifier {
    engine: ExtractionEngine,
    prefix_chars: usize,
}

impl Classifier {
    pub fn new(engine: ExtractionEngine, prefix_chars: usize) -> Self {
        Self {
            engine,
            prefix_chars,
        }
    }

    pub async fn classify(
        &self,
        ocr_text: &str,
        ctx: &RunContext,
    ) -> Result<Classification, ExtractionError> {
        let prefix = truncate_chars(ocr_text, self.prefix_chars);
        let prompt = build_classification_prompt(prefix);
        let reply = self.engine.invoke(&prompt, ctx).await?;

        if let Some(label) = parse_classification(&reply) {
            return Ok(Classification {
                label,
                source: ClassificationSource::Llm,
            });
        }

        let label = classify_by_keywords(ocr_text);
        tracing::warn!(
            label = %label,
            "Classifier reply unusable, using keyword fallback"
        );
        Ok(Classification {
            label,
            source: ClassificationSource::KeywordFallback,
        })
    }
}
