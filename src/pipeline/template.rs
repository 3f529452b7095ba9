use std::sync::Arc;

use thiserror::Error;

use crate::models::{MergeRule, Template};
use crate::store::{StoreError, TemplateStore};

/// Legacy classifier labels and their canonical template codes.
const CODE_ALIASES: &[(&str, &str)] = &[
    ("检测报告", "inspection_report"),
    ("测试单", "inspection_report"),
    ("快递单", "express"),
    ("抽样单", "sampling"),
];

/// Translate a legacy label into a template code. Unknown input is returned as is.
pub fn canonical_code(label: &str) -> &str {
    let label = label.trim();
    CODE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == label)
        .map(|(_, code)| *code)
        .unwrap_or(label)
}

#[derive(Error, Debug)]
pub enum TemplateError {
    /// The store itself failed; distinct from "not found" and worth retrying.
    #[error("Template storage failure: {0}")]
    Storage(#[from] StoreError),
}

/// Why a merge template cannot run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeConfigError {
    #[error("Merge template '{0}' has no merge rule")]
    RuleMissing(String),

    #[error("Merge rule of '{template_id}' does not name a sub-template for '{doc_type}'")]
    SubTemplateUnset { template_id: String, doc_type: String },

    #[error("Sub-template '{sub_template_id}' for '{doc_type}' was not found")]
    SubTemplateMissing {
        sub_template_id: String,
        doc_type: String,
    },

    #[error("Sub-template '{0}' is not a single-mode template")]
    SubTemplateNotSingle(String),

    #[error("Merge rule pairs doc type '{0}' with itself")]
    IdenticalDocTypes(String),
}

/// A merge template with whatever parts could be resolved.
///
/// Resolution never fails because a part is missing; [`MergeTemplate::plan`]
/// reports the precise configuration problem instead.
#[derive(Debug, Clone)]
pub struct MergeTemplate {
    pub template: Template,
    pub rule: Option<MergeRule>,
    pub sub_template_a: Option<Template>,
    pub sub_template_b: Option<Template>,
}

/// Fully resolved merge configuration.
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub template: Template,
    pub rule: MergeRule,
    pub sub_template_a: Template,
    pub sub_template_b: Template,
}

impl MergeTemplate {
    pub fn plan(self) -> Result<MergePlan, MergeConfigError> {
        let rule = self
            .rule
            .ok_or_else(|| MergeConfigError::RuleMissing(self.template.id.clone()))?;
        if rule.doc_type_a == rule.doc_type_b {
            return Err(MergeConfigError::IdenticalDocTypes(rule.doc_type_a));
        }

        let sub_a = require_sub(&rule, &rule.doc_type_a, rule.sub_template_a.as_deref(), self.sub_template_a)?;
        let sub_b = require_sub(&rule, &rule.doc_type_b, rule.sub_template_b.as_deref(), self.sub_template_b)?;

        Ok(MergePlan {
            template: self.template,
            rule,
            sub_template_a: sub_a,
            sub_template_b: sub_b,
        })
    }
}

fn require_sub(
    rule: &MergeRule,
    doc_type: &str,
    sub_id: Option<&str>,
    resolved: Option<Template>,
) -> Result<Template, MergeConfigError> {
    let sub_id = sub_id.ok_or_else(|| MergeConfigError::SubTemplateUnset {
        template_id: rule.template_id.clone(),
        doc_type: doc_type.to_string(),
    })?;
    let sub = resolved.ok_or_else(|| MergeConfigError::SubTemplateMissing {
        sub_template_id: sub_id.to_string(),
        doc_type: doc_type.to_string(),
    })?;
    if sub.is_merge() {
        return Err(MergeConfigError::SubTemplateNotSingle(sub.id));
    }
    Ok(sub)
}

/// Loads templates from storage and normalises them for prompting:
/// fields and examples sorted by `sort_order` (stable), inactive examples removed.
#[derive(Clone)]
pub struct TemplateResolver {
    store: Arc<dyn TemplateStore>,
}

impl TemplateResolver {
    pub fn new(store: Arc<dyn TemplateStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, template_id: &str) -> Result<Option<Template>, TemplateError> {
        let template = self.store.get_template(template_id).await?;
        Ok(template.map(normalize))
    }

    /// Lookup by tenant and code, accepting legacy labels.
    ///
    /// Tries the canonical code, then the label as a code, then the label as
    /// a template name.
    pub async fn resolve_by_code(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Option<Template>, TemplateError> {
        let canonical = canonical_code(code);
        if let Some(t) = self.store.find_template_by_code(tenant_id, canonical).await? {
            return Ok(Some(normalize(t)));
        }
        if canonical != code.trim() {
            if let Some(t) = self.store.find_template_by_code(tenant_id, code.trim()).await? {
                return Ok(Some(normalize(t)));
            }
        }
        let by_name = self.store.find_template_by_name(tenant_id, code.trim()).await?;
        if by_name.is_none() {
            tracing::debug!(tenant_id, code, canonical, "No template for code");
        }
        Ok(by_name.map(normalize))
    }

    /// Resolve a merge template with its rule and both sub-templates.
    /// Missing parts are left `None`; only an absent base template is `None`.
    pub async fn resolve_merge(
        &self,
        template_id: &str,
    ) -> Result<Option<MergeTemplate>, TemplateError> {
        let Some(template) = self.resolve(template_id).await? else {
            return Ok(None);
        };

        let rule = match self.store.get_merge_rule(template_id).await? {
            Some(rule) => Some(rule),
            None => template.merge_rule.clone(),
        };

        let (mut sub_a, mut sub_b) = (None, None);
        if let Some(rule) = &rule {
            if let Some(id) = &rule.sub_template_a {
                sub_a = self.resolve(id).await?;
            }
            if let Some(id) = &rule.sub_template_b {
                sub_b = self.resolve(id).await?;
            }
            if sub_a.is_none() || sub_b.is_none() {
                tracing::warn!(template_id, "Merge template resolved without all sub-templates");
            }
        } else {
            tracing::warn!(template_id, "Merge template has no merge rule");
        }

        Ok(Some(MergeTemplate {
            template,
            rule,
            sub_template_a: sub_a,
            sub_template_b: sub_b,
        }))
    }
}

fn normalize(mut template: Template) -> Template {
    template.fields.sort_by_key(|f| f.sort_order);
    template.examples.retain(|e| e.is_active);
    template.examples.sort_by_key(|e| e.sort_order);
    template
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{field, merge_rule, single};
    use crate::models::{Example, FieldType, ProcessMode};
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn resolver(store: Arc<InMemoryStore>) -> TemplateResolver {
        TemplateResolver::new(store)
    }

    fn merge_template(id: &str) -> Template {
        let mut t = single(id, "lighting_combined", vec![]);
        t.process_mode = ProcessMode::Merge;
        t.name = "照明综合报告".into();
        t
    }

    #[test]
    fn aliases_map_to_codes() {
        assert_eq!(canonical_code("检测报告"), "inspection_report");
        assert_eq!(canonical_code("测试单"), "inspection_report");
        assert_eq!(canonical_code(" 快递单 "), "express");
        assert_eq!(canonical_code("抽样单"), "sampling");
        assert_eq!(canonical_code("custom"), "custom");
    }

    #[tokio::test]
    async fn resolve_sorts_fields_and_filters_examples() {
        let store = Arc::new(InMemoryStore::new());
        let mut second = field("b", "B", FieldType::Text);
        second.sort_order = 2;
        let mut first = field("a", "A", FieldType::Text);
        first.sort_order = 1;
        let mut t = single("t1", "express", vec![second, first]);
        t.examples = vec![
            Example {
                input_text: "late".into(),
                output: json!({}),
                is_active: true,
                sort_order: 5,
            },
            Example {
                input_text: "off".into(),
                output: json!({}),
                is_active: false,
                sort_order: 0,
            },
            Example {
                input_text: "early".into(),
                output: json!({}),
                is_active: true,
                sort_order: 1,
            },
        ];
        store.insert_template(t);

        let t = resolver(store).resolve("t1").await.unwrap().unwrap();
        assert_eq!(t.field_keys(), vec!["a", "b"]);
        let inputs: Vec<&str> = t.examples.iter().map(|e| e.input_text.as_str()).collect();
        assert_eq!(inputs, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn absent_template_is_none() {
        let store = Arc::new(InMemoryStore::new());
        let r = resolver(store);
        assert!(r.resolve("nope").await.unwrap().is_none());
        assert!(r.resolve_by_code("tenant-1", "nope").await.unwrap().is_none());
        assert!(r.resolve_merge("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn by_code_accepts_legacy_labels_and_names() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_template(single("t1", "inspection_report", vec![]));
        let mut named = single("t2", "lighting", vec![]);
        named.name = "光分布".into();
        store.insert_template(named);
        let r = resolver(store);

        let t = r.resolve_by_code("tenant-1", "测试单").await.unwrap().unwrap();
        assert_eq!(t.id, "t1");
        let t = r.resolve_by_code("tenant-1", "光分布").await.unwrap().unwrap();
        assert_eq!(t.id, "t2");
    }

    #[tokio::test]
    async fn storage_failure_is_not_not_found() {
        let store = Arc::new(InMemoryStore::new());
        store.set_unavailable(true);
        let err = resolver(store).resolve("t1").await.unwrap_err();
        assert!(matches!(err, TemplateError::Storage(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn merge_without_rule_resolves_degraded() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_template(merge_template("m1"));

        let merge = resolver(store).resolve_merge("m1").await.unwrap().unwrap();
        assert!(merge.rule.is_none());
        assert_eq!(
            merge.plan().unwrap_err(),
            MergeConfigError::RuleMissing("m1".into())
        );
    }

    #[tokio::test]
    async fn merge_with_missing_sub_template_resolves_degraded() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_template(merge_template("m1"));
        store.insert_merge_rule(merge_rule("m1", "积分球", "光分布"));
        store.insert_template(single("m1-a", "sphere", vec![]));

        let merge = resolver(store).resolve_merge("m1").await.unwrap().unwrap();
        assert!(merge.sub_template_a.is_some());
        assert!(merge.sub_template_b.is_none());
        assert_eq!(
            merge.plan().unwrap_err(),
            MergeConfigError::SubTemplateMissing {
                sub_template_id: "m1-b".into(),
                doc_type: "光分布".into()
            }
        );
    }

    #[tokio::test]
    async fn complete_merge_plans() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_template(merge_template("m1"));
        store.insert_merge_rule(merge_rule("m1", "积分球", "光分布"));
        store.insert_template(single("m1-a", "sphere", vec![]));
        store.insert_template(single("m1-b", "distribution", vec![]));

        let plan = resolver(store)
            .resolve_merge("m1")
            .await
            .unwrap()
            .unwrap()
            .plan()
            .unwrap();
        assert_eq!(plan.sub_template_a.id, "m1-a");
        assert_eq!(plan.sub_template_b.id, "m1-b");
    }

    #[tokio::test]
    async fn nested_merge_sub_template_rejected() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_template(merge_template("m1"));
        store.insert_merge_rule(merge_rule("m1", "积分球", "光分布"));
        store.insert_template(merge_template("m1-a"));
        store.insert_template(single("m1-b", "distribution", vec![]));

        let err = resolver(store)
            .resolve_merge("m1")
            .await
            .unwrap()
            .unwrap()
            .plan()
            .unwrap_err();
        assert_eq!(err, MergeConfigError::SubTemplateNotSingle("m1-a".into()));
    }
}
