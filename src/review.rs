//! Human review of extracted records.
//!
//! A reviewer confirms (optionally with edits) or rejects what the pipeline
//! saved for review. Confirmation enforces the template's review rules,
//! stamps the record as validated, completes the document and hands the
//! record to the push notifier in the background.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::models::{DocumentStatus, DocumentTable, FieldMap, Template};
use crate::pipeline::persist::PersistenceRouter;
use crate::push::{convert_by_field_mapping, publish_detached, PushNotifier};
use crate::store::{ResultStore, StoreError};

#[derive(Error, Debug)]
pub enum ReviewError {
    #[error("Review rules violated: {}", .0.join("; "))]
    RuleViolation(Vec<String>),

    #[error("No result table for template '{0}'")]
    UnknownDocumentType(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Check every `review_enforced` field. Absent or empty values pass; a
/// present value must be one of the allowed values. All violations are
/// reported together.
pub fn validate_review_rules(template: &Template, data: &FieldMap) -> Result<(), ReviewError> {
    let violations: Vec<String> = template
        .fields
        .iter()
        .filter(|f| f.review_enforced)
        .filter_map(|field| {
            let value = display_value(data.get(&field.key)?)?;
            if field.review_allowed_values.iter().any(|a| a == &value) {
                None
            } else {
                Some(format!(
                    "{} ({}) = '{}', allowed: {}",
                    field.label,
                    field.key,
                    value,
                    field.review_allowed_values.join("/")
                ))
            }
        })
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ReviewError::RuleViolation(violations))
    }
}

/// Trimmed string form of a value, `None` when empty.
fn display_value(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Outcome of a confirmation. `publication` completes when the background
/// push finishes; dropping it leaves the push running.
pub struct ReviewConfirmation {
    pub document_id: String,
    pub table: DocumentTable,
    pub publication: JoinHandle<()>,
}

pub struct ReviewService {
    store: Arc<dyn ResultStore>,
    router: PersistenceRouter,
    notifier: Arc<dyn PushNotifier>,
}

impl ReviewService {
    pub fn new(
        store: Arc<dyn ResultStore>,
        router: PersistenceRouter,
        notifier: Arc<dyn PushNotifier>,
    ) -> Self {
        Self {
            store,
            router,
            notifier,
        }
    }

    fn table_for(&self, template: &Template) -> Result<DocumentTable, ReviewError> {
        self.router
            .route(&template.code)
            .or_else(|| self.router.route(&template.name))
            .ok_or_else(|| ReviewError::UnknownDocumentType(template.code.clone()))
    }

    /// Confirm reviewed data for one document.
    ///
    /// Nothing is written when a review rule fails.
    pub async fn confirm(
        &self,
        template: &Template,
        document_id: &str,
        data: FieldMap,
        reviewer: &str,
        notes: Option<&str>,
    ) -> Result<ReviewConfirmation, ReviewError> {
        validate_review_rules(template, &data)?;
        let table = self.table_for(template)?;

        let mut stored = data.clone();
        stored.insert("is_validated".into(), Value::Bool(true));
        stored.insert("validated_at".into(), Value::String(Utc::now().to_rfc3339()));
        stored.insert("validated_by".into(), Value::String(reviewer.to_string()));
        if let Some(notes) = notes.map(str::trim).filter(|n| !n.is_empty()) {
            stored.insert("validation_notes".into(), Value::String(notes.to_string()));
        }

        self.store.save_extraction(table, document_id, &stored).await?;
        self.store
            .update_status(document_id, DocumentStatus::Completed, None)
            .await?;
        tracing::info!(
            doc_id = document_id,
            template_id = %template.id,
            table = table.table_name(),
            reviewer,
            "Review confirmed"
        );

        let record = convert_by_field_mapping(&data, &template.field_mapping());
        let publication =
            publish_detached(self.notifier.clone(), document_id.to_string(), record);

        Ok(ReviewConfirmation {
            document_id: document_id.to_string(),
            table,
            publication,
        })
    }

    /// Send a document back. The stored extraction is left as is.
    pub async fn reject(&self, document_id: &str, reason: &str) -> Result<(), ReviewError> {
        let message = format!("审核打回: {}", reason.trim());
        self.store
            .update_status(document_id, DocumentStatus::Failed, Some(&message))
            .await?;
        tracing::info!(doc_id = document_id, "Review rejected");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
