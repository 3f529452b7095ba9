//! Publication of reviewed records to an external table service.
//!
//! The pipeline never pushes on its own. Review confirmation hands a converted
//! record to [`publish_detached`], which runs the push in a background task so
//! a slow or failing endpoint never blocks or fails the review.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::models::FieldMap;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PushError {
    #[error("Push endpoint rejected record: {0}")]
    Rejected(String),

    #[error("Push transport failed: {0}")]
    Transport(String),
}

/// External notifier receiving records keyed by external column names.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn push(&self, document_id: &str, record: &FieldMap) -> Result<(), PushError>;
}

/// Rename `data` keys to external columns. Keys without a mapping and
/// null/empty values are dropped.
pub fn convert_by_field_mapping(data: &FieldMap, mapping: &BTreeMap<String, String>) -> FieldMap {
    data.iter()
        .filter(|(_, value)| !is_empty_value(value))
        .filter_map(|(key, value)| {
            mapping
                .get(key)
                .map(|column| (column.clone(), value.clone()))
        })
        .collect()
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Fire-and-forget push. Failures are logged, never returned.
///
/// The handle is returned so callers that care (tests, graceful shutdown)
/// can await completion; dropping it does not cancel the push.
pub fn publish_detached(
    notifier: Arc<dyn PushNotifier>,
    document_id: String,
    record: FieldMap,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if record.is_empty() {
            tracing::debug!(doc_id = %document_id, "Nothing to push");
            return;
        }
        match notifier.push(&document_id, &record).await {
            Ok(()) => {
                tracing::info!(doc_id = %document_id, columns = record.len(), "Record pushed");
            }
            Err(e) => {
                tracing::warn!(doc_id = %document_id, error = %e, "Push failed, review unaffected");
            }
        }
    })
}

// ═══════════════════════════════════════════════════════════
// Test double
// ═══════════════════════════════════════════════════════════

/// Notifier that keeps every record it receives. Optionally fails every push.
#[derive(Default)]
pub struct RecordingNotifier {
    pushed: Mutex<Vec<(String, FieldMap)>>,
    failure: Option<PushError>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: PushError) -> Self {
        Self {
            pushed: Mutex::new(Vec::new()),
            failure: Some(error),
        }
    }

    /// Records received so far, successful or not.
    pub fn pushed(&self) -> Vec<(String, FieldMap)> {
        self.pushed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl PushNotifier for RecordingNotifier {
    async fn push(&self, document_id: &str, record: &FieldMap) -> Result<(), PushError> {
        self.pushed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((document_id.to_string(), record.clone()));
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> FieldMap {
        json!({
            "tracking_number": "SF100",
            "receiver": "",
            "sender": null,
            "weight": 2.5,
            "internal_note": "skip me"
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn mapping() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("tracking_number".to_string(), "快递单号".to_string()),
            ("receiver".to_string(), "收件人".to_string()),
            ("sender".to_string(), "寄件人".to_string()),
            ("weight".to_string(), "重量".to_string()),
        ])
    }

    #[test]
    fn mapping_renames_and_drops() {
        let out = convert_by_field_mapping(&data(), &mapping());
        assert_eq!(out.len(), 2);
        assert_eq!(out["快递单号"], "SF100");
        assert_eq!(out["重量"], 2.5);
        assert!(!out.contains_key("收件人"));
        assert!(!out.contains_key("internal_note"));
    }

    #[test]
    fn empty_mapping_yields_empty_record() {
        assert!(convert_by_field_mapping(&data(), &BTreeMap::new()).is_empty());
    }

    #[tokio::test]
    async fn detached_push_delivers_record() {
        let notifier = Arc::new(RecordingNotifier::new());
        let record = convert_by_field_mapping(&data(), &mapping());
        publish_detached(notifier.clone(), "doc-1".into(), record)
            .await
            .unwrap();
        let pushed = notifier.pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].0, "doc-1");
    }

    #[tokio::test]
    async fn failed_push_does_not_panic_the_task() {
        let notifier = Arc::new(RecordingNotifier::failing(PushError::Transport(
            "connection reset".into(),
        )));
        let handle = publish_detached(notifier.clone(), "doc-1".into(), data());
        assert!(handle.await.is_ok());
        assert_eq!(notifier.pushed().len(), 1);
    }

    #[tokio::test]
    async fn empty_record_is_not_pushed() {
        let notifier = Arc::new(RecordingNotifier::new());
        publish_detached(notifier.clone(), "doc-1".into(), FieldMap::new())
            .await
            .unwrap();
        assert!(notifier.pushed().is_empty());
    }
}
