use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use super::{sort_templates, DocumentRecord, ResultStore, StoreError, TemplateStore};
use crate::models::{DocumentStatus, DocumentTable, FieldMap, MergeRule, Template};

#[derive(Default)]
struct Inner {
    templates: HashMap<String, Template>,
    merge_rules: HashMap<String, MergeRule>,
    extractions: HashMap<(DocumentTable, String), FieldMap>,
    documents: HashMap<String, DocumentRecord>,
}

/// Process-local store for tests and embedded use.
///
/// `set_unavailable(true)` makes every call fail with
/// `StoreError::Unavailable`, which is how tests exercise infra failures.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
    template_reads: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a template. An embedded merge rule is indexed too.
    pub fn insert_template(&self, template: Template) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(rule) = &template.merge_rule {
            inner
                .merge_rules
                .insert(template.id.clone(), rule.clone());
        }
        inner.templates.insert(template.id.clone(), template);
    }

    pub fn insert_merge_rule(&self, rule: MergeRule) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.merge_rules.insert(rule.template_id.clone(), rule);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of template lookups served (any method of `TemplateStore`).
    pub fn template_reads(&self) -> usize {
        self.template_reads.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }
        Ok(())
    }

    fn read_templates<T>(&self, f: impl FnOnce(&Inner) -> T) -> Result<T, StoreError> {
        self.check_available()?;
        self.template_reads.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&inner))
    }
}

#[async_trait]
impl TemplateStore for InMemoryStore {
    async fn get_template(&self, template_id: &str) -> Result<Option<Template>, StoreError> {
        self.read_templates(|inner| inner.templates.get(template_id).cloned())
    }

    async fn find_template_by_code(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Option<Template>, StoreError> {
        self.read_templates(|inner| {
            inner
                .templates
                .values()
                .find(|t| t.tenant_id == tenant_id && t.code == code)
                .cloned()
        })
    }

    async fn find_template_by_name(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<Template>, StoreError> {
        self.read_templates(|inner| {
            inner
                .templates
                .values()
                .find(|t| t.tenant_id == tenant_id && t.name == name)
                .cloned()
        })
    }

    async fn get_merge_rule(&self, template_id: &str) -> Result<Option<MergeRule>, StoreError> {
        self.read_templates(|inner| inner.merge_rules.get(template_id).cloned())
    }

    async fn list_templates(
        &self,
        tenant_id: &str,
        active_only: bool,
    ) -> Result<Vec<Template>, StoreError> {
        let mut templates = self.read_templates(|inner| {
            inner
                .templates
                .values()
                .filter(|t| t.tenant_id == tenant_id && (!active_only || t.is_active))
                .cloned()
                .collect::<Vec<_>>()
        })?;
        sort_templates(&mut templates);
        Ok(templates)
    }
}

#[async_trait]
impl ResultStore for InMemoryStore {
    async fn save_extraction(
        &self,
        table: DocumentTable,
        document_id: &str,
        fields: &FieldMap,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let stored = inner
            .extractions
            .entry((table, document_id.to_string()))
            .or_default();
        for (k, v) in fields {
            stored.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn get_extraction(
        &self,
        table: DocumentTable,
        document_id: &str,
    ) -> Result<Option<FieldMap>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .extractions
            .get(&(table, document_id.to_string()))
            .cloned())
    }

    async fn update_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.documents.insert(
            document_id.to_string(),
            DocumentRecord {
                document_id: document_id.to_string(),
                status,
                error_message: error_message.map(str::to_string),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_status(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.documents.get(document_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{merge_rule, single};
    use serde_json::json;

    #[tokio::test]
    async fn lookup_by_code_is_tenant_scoped() {
        let store = InMemoryStore::new();
        store.insert_template(single("t1", "express", vec![]));

        assert!(store
            .find_template_by_code("tenant-1", "express")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_template_by_code("tenant-2", "express")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn embedded_merge_rule_is_indexed() {
        let store = InMemoryStore::new();
        let mut t = single("m1", "lighting_combined", vec![]);
        t.merge_rule = Some(merge_rule("m1", "积分球", "光分布"));
        store.insert_template(t);

        let rule = store.get_merge_rule("m1").await.unwrap().unwrap();
        assert_eq!(rule.doc_type_a, "积分球");
    }

    #[tokio::test]
    async fn list_orders_by_sort_order_then_name() {
        let store = InMemoryStore::new();
        let mut a = single("a", "a", vec![]);
        a.sort_order = 2;
        let mut b = single("b", "b", vec![]);
        b.sort_order = 1;
        let mut c = single("c", "c", vec![]);
        c.sort_order = 1;
        c.name = "aaa".into();
        let mut inactive = single("d", "d", vec![]);
        inactive.is_active = false;
        for t in [a, b, c, inactive] {
            store.insert_template(t);
        }

        let ids: Vec<String> = store
            .list_templates("tenant-1", true)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
        assert_eq!(store.list_templates("tenant-1", false).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn save_extraction_upserts_and_keeps_unknown_keys() {
        let store = InMemoryStore::new();
        let mut first = FieldMap::new();
        first.insert("sender".into(), json!("张三"));
        first.insert("unexpected".into(), json!("kept"));
        store
            .save_extraction(DocumentTable::Expresses, "doc-1", &first)
            .await
            .unwrap();

        let mut second = FieldMap::new();
        second.insert("sender".into(), json!("李四"));
        store
            .save_extraction(DocumentTable::Expresses, "doc-1", &second)
            .await
            .unwrap();

        let stored = store
            .get_extraction(DocumentTable::Expresses, "doc-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["sender"], "李四");
        assert_eq!(stored["unexpected"], "kept");
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get_template("t1").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.get_status("doc").await.is_err());
    }
}
