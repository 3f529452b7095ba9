use std::path::PathBuf;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};

use super::cancel::{Interrupted, RunContext};
use super::extract::{ExtractedFields, ExtractionEngine, ExtractionError};
use super::ocr::OcrEngine;
use super::prompt::build_extraction_prompt;
use super::template::MergePlan;
use super::types::{
    ErrorDetail, ErrorKind, MergeState, MergeSummary, MergedRecord, SampleResult, SubResults,
};
use crate::models::{FieldMap, Template};

/// One input file tagged with the document type it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeInput {
    pub path: PathBuf,
    pub doc_type: String,
}

impl MergeInput {
    pub fn new(path: impl Into<PathBuf>, doc_type: &str) -> Self {
        Self {
            path: path.into(),
            doc_type: doc_type.to_string(),
        }
    }
}

/// Everything a merge run produced, before it is folded into an envelope.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub summary: MergeSummary,
    /// OCR text of every processed page and file, in processing order.
    pub ocr_text: String,
    pub ocr_confidence: f32,
}

/// Join doc_type_a samples with the doc_type_b result.
///
/// Each a-sample gets its own record: a-fields first, then b-fields
/// overwrite (b wins on conflicts). Without a-samples there is exactly one
/// record holding b's fields, or an empty record when b is absent too.
pub fn join(results_a: &[SampleResult], result_b: Option<&SampleResult>) -> (Vec<MergedRecord>, MergeState) {
    let b_errors: Vec<ErrorDetail> = result_b.and_then(|b| b.error.clone()).into_iter().collect();

    if results_a.is_empty() {
        let record = MergedRecord {
            sample_index: 1,
            data: result_b.map(|b| b.data.clone()).unwrap_or_default(),
            errors: b_errors,
        };
        let state = if result_b.is_some() {
            MergeState::DocTypeBOnly
        } else {
            MergeState::Neither
        };
        return (vec![record], state);
    }

    let records = results_a
        .iter()
        .enumerate()
        .map(|(i, a)| {
            let mut data = a.data.clone();
            if let Some(b) = result_b {
                for (k, v) in &b.data {
                    data.insert(k.clone(), v.clone());
                }
            }
            let mut errors: Vec<ErrorDetail> = a.error.clone().into_iter().collect();
            errors.extend(b_errors.iter().cloned());
            MergedRecord {
                sample_index: i + 1,
                data,
                errors,
            }
        })
        .collect();

    let state = if result_b.is_some() {
        MergeState::BothPresent
    } else {
        MergeState::DocTypeAOnly
    };
    (records, state)
}

/// Runs OCR and extraction for both sides of a merge template and joins them.
///
/// doc_type_a files are processed page by page (one sample per page) through a
/// bounded ordered pool; doc_type_b is processed once over the whole file. A
/// failing sample is recorded and the others continue; only cancellation
/// stops the run.
pub struct MergeEngine {
    ocr: Arc<dyn OcrEngine>,
    extractor: ExtractionEngine,
    concurrency: usize,
}

struct SampleText<'a> {
    source: String,
    page: Option<usize>,
    text: &'a str,
    confidence: f32,
}

impl MergeEngine {
    pub fn new(ocr: Arc<dyn OcrEngine>, extractor: ExtractionEngine, concurrency: usize) -> Self {
        Self {
            ocr,
            extractor,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(
        &self,
        plan: &MergePlan,
        inputs: &[MergeInput],
        ctx: &RunContext,
    ) -> Result<MergeOutcome, Interrupted> {
        let mut results_a = Vec::new();
        let mut result_b: Option<SampleResult> = None;
        let mut texts: Vec<String> = Vec::new();
        let mut confidences: Vec<f32> = Vec::new();

        for input in inputs {
            if input.doc_type == plan.rule.doc_type_a {
                let samples = self
                    .process_side_a(&plan.sub_template_a, input, ctx, &mut texts, &mut confidences)
                    .await?;
                results_a.extend(samples);
            } else if input.doc_type == plan.rule.doc_type_b {
                if result_b.is_some() {
                    tracing::warn!(
                        path = %input.path.display(),
                        doc_type = %input.doc_type,
                        "Additional doc_type_b file ignored"
                    );
                    continue;
                }
                result_b = Some(
                    self.process_side_b(&plan.sub_template_b, input, ctx, &mut texts, &mut confidences)
                        .await?,
                );
            } else {
                tracing::debug!(
                    path = %input.path.display(),
                    doc_type = %input.doc_type,
                    "Input matches neither merge side, skipped"
                );
            }
        }

        let (records, state) = join(&results_a, result_b.as_ref());
        tracing::info!(
            template_id = %plan.template.id,
            samples_a = results_a.len(),
            has_b = result_b.is_some(),
            records = records.len(),
            "Merge joined"
        );

        let ocr_confidence = if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f32>() / confidences.len() as f32
        };

        Ok(MergeOutcome {
            summary: MergeSummary {
                sample_count: records.len(),
                extraction_results: records,
                sub_results: SubResults {
                    results_a,
                    result_b,
                },
                state,
            },
            ocr_text: texts.join("\n\n"),
            ocr_confidence,
        })
    }

    async fn process_side_a(
        &self,
        template: &Template,
        input: &MergeInput,
        ctx: &RunContext,
        texts: &mut Vec<String>,
        confidences: &mut Vec<f32>,
    ) -> Result<Vec<SampleResult>, Interrupted> {
        let source = input.path.display().to_string();
        let pages = match ctx.guard(self.ocr.process_per_page(&input.path)).await? {
            Ok(pages) => pages,
            Err(e) => {
                tracing::warn!(path = %source, error = %e, "Per-page OCR failed");
                return Ok(vec![SampleResult {
                    source,
                    page: None,
                    data: FieldMap::new(),
                    ocr_confidence: 0.0,
                    error: Some(ErrorDetail::new(ErrorKind::OcrFailure, e.to_string())),
                }]);
            }
        };

        if pages.is_empty() {
            tracing::warn!(path = %source, "Per-page OCR returned no pages");
            return Ok(vec![SampleResult {
                source,
                page: None,
                data: FieldMap::new(),
                ocr_confidence: 0.0,
                error: Some(ErrorDetail::new(ErrorKind::OcrFailure, "No pages recognised")),
            }]);
        }

        for page in &pages {
            texts.push(page.text.clone());
            confidences.push(page.confidence);
        }

        // `buffered` keeps page order regardless of completion order.
        let samples: Vec<Result<SampleResult, Interrupted>> = stream::iter(pages.iter().map(|page| {
            self.extract_sample(
                template,
                SampleText {
                    source: source.clone(),
                    page: Some(page.page),
                    text: &page.text,
                    confidence: page.confidence,
                },
                ctx,
            )
        }))
        .buffered(self.concurrency)
        .collect()
        .await;

        samples.into_iter().collect()
    }

    async fn process_side_b(
        &self,
        template: &Template,
        input: &MergeInput,
        ctx: &RunContext,
        texts: &mut Vec<String>,
        confidences: &mut Vec<f32>,
    ) -> Result<SampleResult, Interrupted> {
        let source = input.path.display().to_string();
        let doc = match ctx.guard(self.ocr.process(&input.path)).await? {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(path = %source, error = %e, "OCR failed");
                return Ok(SampleResult {
                    source,
                    page: None,
                    data: FieldMap::new(),
                    ocr_confidence: 0.0,
                    error: Some(ErrorDetail::new(ErrorKind::OcrFailure, e.to_string())),
                });
            }
        };
        texts.push(doc.text.clone());
        confidences.push(doc.confidence);

        self.extract_sample(
            template,
            SampleText {
                source,
                page: None,
                text: &doc.text,
                confidence: doc.confidence,
            },
            ctx,
        )
        .await
    }

    async fn extract_sample(
        &self,
        template: &Template,
        sample: SampleText<'_>,
        ctx: &RunContext,
    ) -> Result<SampleResult, Interrupted> {
        let mut result = SampleResult {
            source: sample.source,
            page: sample.page,
            data: FieldMap::new(),
            ocr_confidence: sample.confidence,
            error: None,
        };

        if sample.text.trim().is_empty() {
            result.error = Some(ErrorDetail::new(ErrorKind::OcrFailure, "No text recognised"));
            return Ok(result);
        }

        let prompt = build_extraction_prompt(template, sample.text);
        match self.extractor.extract(&prompt, ctx).await {
            Ok(ExtractedFields::Parsed(map)) if map.is_empty() => {
                result.error = Some(ErrorDetail::new(
                    ErrorKind::ExtractionFailure,
                    "LLM returned no fields",
                ));
            }
            Ok(ExtractedFields::Parsed(map)) => result.data = map,
            Ok(unparseable @ ExtractedFields::Unparseable { .. }) => {
                result.data = unparseable.into_field_map();
                result.error = Some(ErrorDetail::new(
                    ErrorKind::ExtractionFailure,
                    "LLM reply is not a JSON object",
                ));
            }
            Err(ExtractionError::Interrupted(i)) => return Err(i),
            Err(ExtractionError::Llm(e)) => {
                let kind = if e.is_transient() {
                    ErrorKind::LlmTransientError
                } else {
                    ErrorKind::ExtractionFailure
                };
                result.error = Some(ErrorDetail::new(kind, e.to_string()));
            }
        }

        if let Some(error) = &result.error {
            tracing::warn!(
                source = %result.source,
                page = ?result.page,
                kind = ?error.kind,
                error = %error.message,
                "Merge sample failed"
            );
        }
        Ok(result)
    }
}
