//! Document processing orchestrator.
//!
//! Four entry points share one result envelope:
//! auto-classify (OCR → classify → template by code → extract),
//! template (template by id → OCR → extract), merge (delegates to
//! [`MergeEngine`]) and text-only (classify → template → extract).
//!
//! Collaborators are injected as trait objects so the processor is fully
//! testable with mock implementations. Entry points never return `Err`; every
//! failure becomes an envelope with `success = false`.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::Instrument;

use super::cancel::RunContext;
use super::classify::{truncate_chars, Classifier};
use super::extract::{ExtractedFields, ExtractionEngine};
use super::llm::LlmClient;
use super::merge::{MergeEngine, MergeInput};
use super::ocr::{CachingOcrEngine, OcrEngine, OcrError};
use super::prompt::build_extraction_prompt;
use super::retry::RetryPolicy;
use super::template::TemplateResolver;
use super::types::{ErrorKind, ExtractionEnvelope, MergeSummary, Step};
use super::PipelineError;
use crate::config::PipelineConfig;
use crate::models::{FieldMap, Template};
use crate::store::TemplateStore;

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Stage a run is in; decides the `*_failed` step on error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Validate,
    Ocr,
    Classify,
    Template,
    Extract,
    Merge,
}

impl Stage {
    fn failed_step(self) -> Step {
        match self {
            Stage::Validate => Step::ValidationFailed,
            Stage::Ocr => Step::OcrFailed,
            Stage::Classify => Step::ClassifyFailed,
            Stage::Template => Step::TemplateFailed,
            Stage::Extract => Step::ExtractFailed,
            Stage::Merge => Step::MergeFailed,
        }
    }
}

/// Receives coarse progress for external polling. Called synchronously at
/// each transition; implementations must not block.
pub trait ProgressObserver: Send + Sync {
    fn on_step(&self, document_id: &str, step: Step);
}

/// Keeps every reported step in order.
#[derive(Default)]
pub struct RecordingProgress {
    steps: std::sync::Mutex<Vec<(String, Step)>>,
}

impl RecordingProgress {
    pub fn steps(&self) -> Vec<(String, Step)> {
        self.steps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl ProgressObserver for RecordingProgress {
    fn on_step(&self, document_id: &str, step: Step) {
        self.steps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((document_id.to_string(), step));
    }
}

/// Per-invocation state. Never shared between runs.
struct RunState {
    observer: Option<Arc<dyn ProgressObserver>>,
    document_id: String,
    started: Instant,
    stage: Stage,
    document_type: Option<String>,
    template_id: Option<String>,
    ocr_text: String,
    ocr_confidence: f32,
    /// Data kept on failure for diagnostics (e.g. the raw reply).
    partial_data: FieldMap,
    merge: Option<MergeSummary>,
}

impl RunState {
    fn new(document_id: &str, observer: Option<Arc<dyn ProgressObserver>>) -> Self {
        let run = Self {
            observer,
            document_id: document_id.to_string(),
            started: Instant::now(),
            stage: Stage::Validate,
            document_type: None,
            template_id: None,
            ocr_text: String::new(),
            ocr_confidence: 0.0,
            partial_data: FieldMap::new(),
            merge: None,
        };
        run.advance(Step::Start);
        run
    }

    fn advance(&self, step: Step) {
        if let Some(observer) = &self.observer {
            observer.on_step(&self.document_id, step);
        }
    }

    fn finish(mut self, result: Result<FieldMap, PipelineError>, preview_chars: usize) -> ExtractionEnvelope {
        let processing_time = self.started.elapsed().as_secs_f64();
        let ocr_text = preview(&self.ocr_text, preview_chars);
        let (success, step, data, error) = match result {
            Ok(data) => (true, Step::Completed, data, None),
            Err(e) => {
                tracing::warn!(
                    doc_id = %self.document_id,
                    stage = ?self.stage,
                    kind = ?e.kind(),
                    error = %e,
                    "Document processing failed"
                );
                let partial = std::mem::take(&mut self.partial_data);
                (false, self.stage.failed_step(), partial, Some(e.detail()))
            }
        };
        self.advance(step);
        if success {
            tracing::info!(
                doc_id = %self.document_id,
                fields = data.len(),
                elapsed_ms = (processing_time * 1000.0) as u64,
                "Document processed"
            );
        }
        ExtractionEnvelope {
            success,
            document_id: self.document_id,
            document_type: self.document_type,
            template_id: self.template_id,
            extraction_data: data,
            ocr_text,
            ocr_confidence: self.ocr_confidence,
            processing_time,
            step,
            error,
            merge: self.merge,
        }
    }
}

/// First `max_chars` characters, with "..." appended when cut.
fn preview(text: &str, max_chars: usize) -> String {
    let head = truncate_chars(text, max_chars);
    if head.len() < text.len() {
        format!("{head}...")
    } else {
        head.to_string()
    }
}

fn require_tenant(tenant_id: Option<&str>) -> Result<&str, PipelineError> {
    match tenant_id.map(str::trim) {
        Some(t) if !t.is_empty() => Ok(t),
        _ => Err(PipelineError::Validation(
            "tenant_id is required to resolve a template".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives OCR, classification, template resolution, extraction and merge.
///
/// Built once and reused across invocations; holds no per-run state.
pub struct DocumentProcessor {
    ocr: Arc<dyn OcrEngine>,
    resolver: TemplateResolver,
    extractor: ExtractionEngine,
    classifier: Classifier,
    merge: MergeEngine,
    config: PipelineConfig,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl DocumentProcessor {
    pub fn new(
        ocr: Arc<dyn OcrEngine>,
        llm: Arc<dyn LlmClient>,
        templates: Arc<dyn TemplateStore>,
        config: PipelineConfig,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        Self::with_retry_policy(ocr, llm, templates, config, retry)
    }

    pub fn with_retry_policy(
        ocr: Arc<dyn OcrEngine>,
        llm: Arc<dyn LlmClient>,
        templates: Arc<dyn TemplateStore>,
        config: PipelineConfig,
        retry: RetryPolicy,
    ) -> Self {
        let ocr: Arc<dyn OcrEngine> = if config.ocr_cache_capacity > 0 {
            Arc::new(CachingOcrEngine::new(ocr, config.ocr_cache_capacity))
        } else {
            ocr
        };
        let extractor = ExtractionEngine::new(llm, retry);
        Self {
            resolver: TemplateResolver::new(templates),
            classifier: Classifier::new(extractor.clone(), config.classify_prefix_chars),
            merge: MergeEngine::new(ocr.clone(), extractor.clone(), config.sample_concurrency),
            extractor,
            ocr,
            config,
            observer: None,
        }
    }

    pub fn with_progress(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn run_context(&self, ctx: &RunContext) -> RunContext {
        ctx.clone().with_default_timeout(self.config.run_timeout())
    }

    /// OCR → classify → template by inferred label → extract.
    pub async fn process_auto(
        &self,
        document_id: &str,
        path: &Path,
        tenant_id: Option<&str>,
        ctx: &RunContext,
    ) -> ExtractionEnvelope {
        let ctx = self.run_context(ctx);
        let span = tracing::info_span!("process_auto", doc_id = %document_id);
        let mut run = RunState::new(document_id, self.observer.clone());
        let result = self
            .auto_inner(&mut run, path, tenant_id, &ctx)
            .instrument(span)
            .await;
        run.finish(result, self.config.ocr_preview_chars)
    }

    /// Template by id → OCR → extract.
    pub async fn process_with_template(
        &self,
        document_id: &str,
        path: &Path,
        template_id: &str,
        ctx: &RunContext,
    ) -> ExtractionEnvelope {
        let ctx = self.run_context(ctx);
        let span = tracing::info_span!("process_with_template", doc_id = %document_id, template_id);
        let mut run = RunState::new(document_id, self.observer.clone());
        let result = self
            .template_inner(&mut run, path, template_id, &ctx)
            .instrument(span)
            .await;
        run.finish(result, self.config.ocr_preview_chars)
    }

    /// Merge template: per-side OCR and extraction, then join.
    pub async fn process_merge(
        &self,
        document_id: &str,
        template_id: &str,
        inputs: &[MergeInput],
        ctx: &RunContext,
    ) -> ExtractionEnvelope {
        let ctx = self.run_context(ctx);
        let span = tracing::info_span!("process_merge", doc_id = %document_id, template_id);
        let mut run = RunState::new(document_id, self.observer.clone());
        let result = self
            .merge_inner(&mut run, template_id, inputs, &ctx)
            .instrument(span)
            .await;
        run.finish(result, self.config.ocr_preview_chars)
    }

    /// Externally supplied text: classify → template by inferred label → extract.
    /// Confidence is reported as 1.0 since no OCR ran.
    pub async fn process_text(
        &self,
        document_id: &str,
        text: &str,
        tenant_id: Option<&str>,
        ctx: &RunContext,
    ) -> ExtractionEnvelope {
        let ctx = self.run_context(ctx);
        let span = tracing::info_span!("process_text", doc_id = %document_id);
        let mut run = RunState::new(document_id, self.observer.clone());
        let result = self
            .text_inner(&mut run, text, tenant_id, &ctx)
            .instrument(span)
            .await;
        run.finish(result, self.config.ocr_preview_chars)
    }

    // -----------------------------------------------------------------------
    // Entry point bodies
    // -----------------------------------------------------------------------

    async fn auto_inner(
        &self,
        run: &mut RunState,
        path: &Path,
        tenant_id: Option<&str>,
        ctx: &RunContext,
    ) -> Result<FieldMap, PipelineError> {
        let tenant = require_tenant(tenant_id)?;
        let text = self.run_ocr(run, path, ctx).await?;
        self.classify_and_extract(run, tenant, &text, ctx).await
    }

    async fn template_inner(
        &self,
        run: &mut RunState,
        path: &Path,
        template_id: &str,
        ctx: &RunContext,
    ) -> Result<FieldMap, PipelineError> {
        if template_id.trim().is_empty() {
            return Err(PipelineError::Validation("template_id is required".into()));
        }

        // Resolve before OCR so a bad id costs nothing.
        run.stage = Stage::Template;
        let template = ctx
            .guard(self.resolver.resolve(template_id))
            .await??
            .ok_or_else(|| PipelineError::TemplateNotFound(template_id.to_string()))?;
        if template.is_merge() {
            return Err(PipelineError::Validation(format!(
                "template '{template_id}' is a merge template; use merge processing"
            )));
        }
        run.document_type = Some(template.name.clone());
        run.template_id = Some(template.id.clone());

        let text = self.run_ocr(run, path, ctx).await?;
        self.extract_with(run, &template, &text, ctx).await
    }

    async fn merge_inner(
        &self,
        run: &mut RunState,
        template_id: &str,
        inputs: &[MergeInput],
        ctx: &RunContext,
    ) -> Result<FieldMap, PipelineError> {
        if template_id.trim().is_empty() {
            return Err(PipelineError::Validation("template_id is required".into()));
        }

        run.stage = Stage::Template;
        let merge_template = ctx
            .guard(self.resolver.resolve_merge(template_id))
            .await??
            .ok_or_else(|| PipelineError::TemplateNotFound(template_id.to_string()))?;
        run.document_type = Some(merge_template.template.name.clone());
        run.template_id = Some(merge_template.template.id.clone());
        if !merge_template.template.is_merge() {
            return Err(PipelineError::Validation(format!(
                "template '{template_id}' is not a merge template"
            )));
        }
        let plan = merge_template.plan()?;

        run.stage = Stage::Merge;
        let outcome = self.merge.run(&plan, inputs, ctx).await?;
        run.ocr_text = outcome.ocr_text;
        run.ocr_confidence = outcome.ocr_confidence;
        run.advance(Step::OcrCompleted);

        // The envelope mirrors the first usable record; failed leading
        // samples stay visible in `extraction_results`.
        let summary = outcome.summary;
        let usable = summary
            .extraction_results
            .iter()
            .find(|r| r.is_usable())
            .map(|r| r.data.clone());
        let result = match usable {
            Some(data) => Ok(data),
            None => {
                run.partial_data = summary
                    .extraction_results
                    .first()
                    .map(|r| r.data.clone())
                    .unwrap_or_default();
                Err(merge_failure(&summary))
            }
        };
        run.merge = Some(summary);
        result
    }

    async fn text_inner(
        &self,
        run: &mut RunState,
        text: &str,
        tenant_id: Option<&str>,
        ctx: &RunContext,
    ) -> Result<FieldMap, PipelineError> {
        let tenant = require_tenant(tenant_id)?;
        if text.trim().is_empty() {
            return Err(PipelineError::Validation("text is empty".into()));
        }
        run.ocr_text = text.to_string();
        run.ocr_confidence = 1.0;
        self.classify_and_extract(run, tenant, text, ctx).await
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    async fn run_ocr(
        &self,
        run: &mut RunState,
        path: &Path,
        ctx: &RunContext,
    ) -> Result<String, PipelineError> {
        run.stage = Stage::Ocr;
        let doc = ctx.guard(self.ocr.process(path)).await??;
        if doc.text.trim().is_empty() {
            return Err(OcrError::Recognition("no text recognised".into()).into());
        }
        tracing::info!(
            doc_id = %run.document_id,
            chars = doc.text.chars().count(),
            lines = doc.total_lines,
            confidence = doc.confidence,
            "OCR completed"
        );
        run.ocr_text = doc.text.clone();
        run.ocr_confidence = doc.confidence;
        run.advance(Step::OcrCompleted);
        Ok(doc.text)
    }

    async fn classify_and_extract(
        &self,
        run: &mut RunState,
        tenant_id: &str,
        text: &str,
        ctx: &RunContext,
    ) -> Result<FieldMap, PipelineError> {
        run.stage = Stage::Classify;
        let classification = self
            .classifier
            .classify(text, ctx)
            .await
            .map_err(|e| PipelineError::from_llm_stage(e, PipelineError::Classification))?;
        let label = classification.label;
        tracing::info!(
            doc_id = %run.document_id,
            label = %label,
            source = ?classification.source,
            "Document classified"
        );
        run.document_type = Some(label.to_string());
        run.advance(Step::Classified);

        run.stage = Stage::Template;
        let template = ctx
            .guard(self.resolver.resolve_by_code(tenant_id, label.as_str()))
            .await??
            .ok_or_else(|| {
                PipelineError::TemplateNotFound(format!(
                    "no template for document type '{label}' in tenant '{tenant_id}'"
                ))
            })?;
        if template.is_merge() {
            return Err(PipelineError::Validation(format!(
                "template '{}' is a merge template; use merge processing",
                template.id
            )));
        }
        run.template_id = Some(template.id.clone());

        self.extract_with(run, &template, text, ctx).await
    }

    async fn extract_with(
        &self,
        run: &mut RunState,
        template: &Template,
        text: &str,
        ctx: &RunContext,
    ) -> Result<FieldMap, PipelineError> {
        run.stage = Stage::Extract;
        let prompt = build_extraction_prompt(template, text);
        tracing::debug!(
            doc_id = %run.document_id,
            template_id = %template.id,
            fields = template.fields.len(),
            prompt_chars = prompt.chars().count(),
            "Extraction prompt built"
        );

        let extracted = self
            .extractor
            .extract(&prompt, ctx)
            .await
            .map_err(|e| PipelineError::from_llm_stage(e, PipelineError::Extraction))?;

        match extracted {
            ExtractedFields::Parsed(map) if map.is_empty() => {
                Err(PipelineError::Extraction("LLM returned no fields".into()))
            }
            ExtractedFields::Parsed(map) => Ok(map),
            unparseable @ ExtractedFields::Unparseable { .. } => {
                run.partial_data = unparseable.into_field_map();
                Err(PipelineError::Extraction(
                    "LLM reply is not a JSON object".into(),
                ))
            }
        }
    }
}

/// Best description of why no merged record is usable.
fn merge_failure(summary: &MergeSummary) -> PipelineError {
    let first_error = summary
        .extraction_results
        .iter()
        .flat_map(|r| r.errors.iter())
        .next();
    match first_error {
        Some(e) if e.kind == ErrorKind::OcrFailure => {
            PipelineError::Ocr(OcrError::Recognition(e.message.clone()))
        }
        Some(e) if e.kind == ErrorKind::LlmTransientError => {
            PipelineError::Extraction(format!("LLM unavailable after retries: {}", e.message))
        }
        Some(e) => PipelineError::Extraction(e.message.clone()),
        None if summary.sub_results.results_a.is_empty() && summary.sub_results.result_b.is_none() => {
            PipelineError::Validation("no input matched either merge document type".into())
        }
        None => PipelineError::Extraction("merge produced no fields".into()),
    }
}
