//! Storage collaborators: template configuration (read-only to the pipeline)
//! and extraction results (written by persistence/review callers).
//!
//! Both are object-safe async traits so the pipeline can be wired against
//! `SqliteStore` in production and `InMemoryStore` in tests.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{DocumentStatus, DocumentTable, FieldMap, MergeRule, Template};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Stored record is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage task failed: {0}")]
    TaskJoin(String),

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}

/// Processing status of one document as seen by the review workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Keyed lookup of tenant templates.
///
/// Returning `Ok(None)` means "not found"; `Err` is reserved for the
/// store itself failing.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get_template(&self, template_id: &str) -> Result<Option<Template>, StoreError>;

    async fn find_template_by_code(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Option<Template>, StoreError>;

    async fn find_template_by_name(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<Template>, StoreError>;

    async fn get_merge_rule(&self, template_id: &str) -> Result<Option<MergeRule>, StoreError>;

    /// Templates for a tenant ordered by `sort_order`, then name.
    async fn list_templates(
        &self,
        tenant_id: &str,
        active_only: bool,
    ) -> Result<Vec<Template>, StoreError>;
}

/// Flat field-map persistence keyed by document id.
///
/// Implementations store whatever keys they are given; filtering against a
/// template's declared fields is the caller's decision.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Upsert: existing keys are overwritten, other stored keys are kept.
    async fn save_extraction(
        &self,
        table: DocumentTable,
        document_id: &str,
        fields: &FieldMap,
    ) -> Result<(), StoreError>;

    async fn get_extraction(
        &self,
        table: DocumentTable,
        document_id: &str,
    ) -> Result<Option<FieldMap>, StoreError>;

    async fn update_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn get_status(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError>;
}

/// Sort the way list queries order templates.
pub(crate) fn sort_templates(templates: &mut [Template]) {
    templates.sort_by(|a, b| {
        a.sort_order
            .cmp(&b.sort_order)
            .then_with(|| a.name.cmp(&b.name))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traits_are_object_safe() {
        fn _assert_templates(_: &dyn TemplateStore) {}
        fn _assert_results(_: &dyn ResultStore) {}
    }
}
