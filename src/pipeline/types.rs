use serde::{Deserialize, Serialize};

use crate::models::FieldMap;

/// Coarse progress tag carried by every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Start,
    OcrCompleted,
    Classified,
    Completed,
    ValidationFailed,
    OcrFailed,
    ClassifyFailed,
    TemplateFailed,
    ExtractFailed,
    MergeFailed,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::OcrCompleted => "ocr_completed",
            Self::Classified => "classified",
            Self::Completed => "completed",
            Self::ValidationFailed => "validation_failed",
            Self::OcrFailed => "ocr_failed",
            Self::ClassifyFailed => "classify_failed",
            Self::TemplateFailed => "template_failed",
            Self::ExtractFailed => "extract_failed",
            Self::MergeFailed => "merge_failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        self.as_str().ends_with("_failed")
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    OcrFailure,
    ClassificationFailure,
    TemplateNotFound,
    ExtractionFailure,
    MergeConfigurationError,
    LlmTransientError,
    StorageFailure,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Uniform result of every pipeline entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionEnvelope {
    pub success: bool,
    pub document_id: String,
    /// Classified label, or the template name when a template was given.
    pub document_type: Option<String>,
    pub template_id: Option<String>,
    pub extraction_data: FieldMap,
    /// Truncated for transport.
    pub ocr_text: String,
    pub ocr_confidence: f32,
    /// Wall-clock seconds.
    pub processing_time: f64,
    pub step: Step,
    pub error: Option<ErrorDetail>,
    #[serde(flatten, default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeSummary>,
}

impl ExtractionEnvelope {
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

// ═══════════════════════════════════════════════════════════
// Merge output
// ═══════════════════════════════════════════════════════════

/// Which sides of a merge produced input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    BothPresent,
    DocTypeAOnly,
    DocTypeBOnly,
    Neither,
}

/// One extraction on one side of a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleResult {
    pub source: String,
    /// 1-indexed page for doc_type_a samples; `None` for whole-file results.
    pub page: Option<usize>,
    pub data: FieldMap,
    pub ocr_confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl SampleResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// One joined record. `errors` lists failures of the contributing samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub sample_index: usize,
    pub data: FieldMap,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorDetail>,
}

impl MergedRecord {
    pub fn is_usable(&self) -> bool {
        self.errors.is_empty() && !self.data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubResults {
    pub results_a: Vec<SampleResult>,
    pub result_b: Option<SampleResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub extraction_results: Vec<MergedRecord>,
    pub sample_count: usize,
    pub sub_results: SubResults,
    pub state: MergeState,
}
