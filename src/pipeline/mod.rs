pub mod cancel;
pub mod classify;
pub mod extract;
pub mod llm;
pub mod merge;
pub mod ocr;
pub mod persist;
pub mod processor;
pub mod prompt;
pub mod retry;
pub mod template;
pub mod types;

pub use cancel::{CancelToken, Interrupted, RunContext};
pub use classify::{Classification, ClassificationSource, Classifier};
pub use extract::{ExtractedFields, ExtractionEngine, ExtractionError};
pub use llm::{LlmClient, LlmError, MockLlmClient, OpenAiCompatClient};
pub use merge::{MergeEngine, MergeInput, MergeOutcome};
pub use ocr::{CachingOcrEngine, MockOcrEngine, OcrDocument, OcrEngine, OcrError, OcrLine, OcrPage};
pub use persist::{save_for_review, PersistError, PersistenceRouter};
pub use processor::{DocumentProcessor, ProgressObserver, RecordingProgress};
pub use retry::{RecordingSleeper, RetryPolicy, Sleeper, TokioSleeper};
pub use template::{MergeConfigError, MergePlan, MergeTemplate, TemplateError, TemplateResolver};
pub use types::*;

use thiserror::Error;

use crate::store::StoreError;

/// Every way a pipeline run can fail. Entry points fold this into the
/// envelope's `error` via [`PipelineError::kind`].
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Ocr(#[from] OcrError),

    #[error("Classification failed: {0}")]
    Classification(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Merge configuration error: {0}")]
    MergeConfig(#[from] MergeConfigError),

    #[error("LLM unavailable after retries: {0}")]
    LlmTransient(LlmError),

    #[error("Template storage failure: {0}")]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::Ocr(_) => ErrorKind::OcrFailure,
            PipelineError::Classification(_) => ErrorKind::ClassificationFailure,
            PipelineError::TemplateNotFound(_) => ErrorKind::TemplateNotFound,
            PipelineError::Extraction(_) => ErrorKind::ExtractionFailure,
            PipelineError::MergeConfig(_) => ErrorKind::MergeConfigurationError,
            PipelineError::LlmTransient(_) => ErrorKind::LlmTransientError,
            PipelineError::Storage(_) => ErrorKind::StorageFailure,
            PipelineError::Interrupted(_) => ErrorKind::Cancelled,
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail::new(self.kind(), self.to_string())
    }

    /// Map an extraction-layer failure. Exhausted transient errors keep their
    /// own kind; anything else becomes the stage's failure via `stage`.
    pub fn from_llm_stage(err: ExtractionError, stage: fn(String) -> PipelineError) -> Self {
        match err {
            ExtractionError::Llm(e) if e.is_transient() => PipelineError::LlmTransient(e),
            ExtractionError::Llm(e) => stage(e.to_string()),
            ExtractionError::Interrupted(i) => PipelineError::Interrupted(i),
        }
    }
}

impl From<TemplateError> for PipelineError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::Storage(e) => PipelineError::Storage(e),
        }
    }
}
