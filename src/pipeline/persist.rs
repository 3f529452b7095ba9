use std::collections::HashMap;

use thiserror::Error;

use super::types::ExtractionEnvelope;
use crate::models::{DocumentStatus, DocumentTable};
use crate::store::{ResultStore, StoreError};

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("No persistence target for document type '{0}'")]
    UnknownDocumentType(String),

    /// Merge envelopes carry one record per sample; the flat map covers only one.
    #[error("Document '{0}' is a merge result; persist its extraction_results per sample")]
    MergeEnvelope(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Maps document types (codes, labels, template names) to result tables.
/// Built once at startup.
#[derive(Debug, Clone)]
pub struct PersistenceRouter {
    routes: HashMap<String, DocumentTable>,
}

impl Default for PersistenceRouter {
    fn default() -> Self {
        let mut router = Self {
            routes: HashMap::new(),
        };
        for alias in ["inspection_report", "检测报告", "测试单"] {
            router.add(alias, DocumentTable::InspectionReports);
        }
        for alias in ["express", "快递单"] {
            router.add(alias, DocumentTable::Expresses);
        }
        for alias in ["sampling", "sampling_form", "抽样单"] {
            router.add(alias, DocumentTable::SamplingForms);
        }
        for alias in ["lighting_combined", "照明综合报告", "照明综合"] {
            router.add(alias, DocumentTable::LightingReports);
        }
        router
    }
}

impl PersistenceRouter {
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn with_route(mut self, alias: &str, table: DocumentTable) -> Self {
        self.add(alias, table);
        self
    }

    fn add(&mut self, alias: &str, table: DocumentTable) {
        self.routes.insert(alias.trim().to_string(), table);
    }

    pub fn route(&self, document_type: &str) -> Option<DocumentTable> {
        self.routes.get(document_type.trim()).copied()
    }

    pub fn require(&self, document_type: &str) -> Result<DocumentTable, PersistError> {
        self.route(document_type)
            .ok_or_else(|| PersistError::UnknownDocumentType(document_type.to_string()))
    }
}

/// Store one envelope for human review.
///
/// Success: the flat field map goes to the routed table (unknown keys
/// included) and the document moves to `pending_review`. Failure: the
/// document is marked `failed` with the error message and nothing else is
/// written. Returns the table written to, if any.
///
/// Successful merge envelopes are refused before anything is written.
pub async fn save_for_review(
    store: &dyn ResultStore,
    router: &PersistenceRouter,
    envelope: &ExtractionEnvelope,
) -> Result<Option<DocumentTable>, PersistError> {
    let doc_id = envelope.document_id.as_str();

    if !envelope.success {
        let message = envelope.error_message().unwrap_or("processing failed");
        store
            .update_status(doc_id, DocumentStatus::Failed, Some(message))
            .await?;
        tracing::info!(doc_id, step = %envelope.step, "Failed document recorded");
        return Ok(None);
    }

    if envelope.merge.is_some() {
        return Err(PersistError::MergeEnvelope(doc_id.to_string()));
    }

    let document_type = envelope.document_type.as_deref().unwrap_or_default();
    let table = router.require(document_type)?;
    store
        .save_extraction(table, doc_id, &envelope.extraction_data)
        .await?;
    store
        .update_status(doc_id, DocumentStatus::PendingReview, None)
        .await?;
    tracing::info!(
        doc_id,
        table = table.table_name(),
        fields = envelope.extraction_data.len(),
        "Extraction saved for review"
    );
    Ok(Some(table))
}
