use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::enums::{FieldType, ProcessMode};

fn default_true() -> bool {
    true
}

/// Tenant-scoped extraction template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub tenant_id: String,
    /// Unique within a tenant.
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub process_mode: ProcessMode,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub examples: Vec<Example>,
    #[serde(default)]
    pub merge_rule: Option<MergeRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub key: String,
    pub label: String,
    #[serde(default = "default_field_type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub extraction_hint: String,
    #[serde(default)]
    pub feishu_column: Option<String>,
    #[serde(default)]
    pub review_enforced: bool,
    #[serde(default)]
    pub review_allowed_values: Vec<String>,
    #[serde(default)]
    pub sort_order: i32,
}

fn default_field_type() -> FieldType {
    FieldType::Text
}

/// Few-shot example. `output` is either a JSON object or a string holding one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub input_text: String,
    pub output: Value,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub sort_order: i32,
}

/// Pairs two single-mode sub-templates under one merge template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRule {
    pub template_id: String,
    pub doc_type_a: String,
    pub doc_type_b: String,
    #[serde(default)]
    pub sub_template_a: Option<String>,
    #[serde(default)]
    pub sub_template_b: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateInvariantError {
    #[error("Duplicate field key '{0}'")]
    DuplicateFieldKey(String),

    #[error("Field '{0}' enforces review but lists no allowed values")]
    MissingAllowedValues(String),

    #[error("Merge template has no merge rule")]
    MergeRuleMissing,

    #[error("Merge rule pairs doc type '{0}' with itself")]
    IdenticalDocTypes(String),
}

impl Template {
    pub fn is_merge(&self) -> bool {
        self.process_mode == ProcessMode::Merge
    }

    /// Check the structural invariants of a stored template.
    pub fn validate(&self) -> Result<(), TemplateInvariantError> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.key.as_str()) {
                return Err(TemplateInvariantError::DuplicateFieldKey(field.key.clone()));
            }
            if field.review_enforced && field.review_allowed_values.is_empty() {
                return Err(TemplateInvariantError::MissingAllowedValues(field.key.clone()));
            }
        }

        if self.is_merge() {
            let rule = self
                .merge_rule
                .as_ref()
                .ok_or(TemplateInvariantError::MergeRuleMissing)?;
            rule.validate()?;
        }
        Ok(())
    }

    /// Declared field keys in template order.
    pub fn field_keys(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.key.as_str()).collect()
    }

    /// `{field_key: external_column}` for fields that declare a column.
    pub fn field_mapping(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .filter_map(|f| {
                f.feishu_column
                    .as_ref()
                    .filter(|c| !c.trim().is_empty())
                    .map(|c| (f.key.clone(), c.clone()))
            })
            .collect()
    }

    pub fn field(&self, key: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.key == key)
    }
}

impl MergeRule {
    pub fn validate(&self) -> Result<(), TemplateInvariantError> {
        if self.doc_type_a == self.doc_type_b {
            return Err(TemplateInvariantError::IdenticalDocTypes(self.doc_type_a.clone()));
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn valid_single_template_passes() {
        let t = single("t1", "express", vec![field("tracking_number", "快递单号", FieldType::Text)]);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn duplicate_keys_rejected() {
        let t = single(
            "t1",
            "express",
            vec![
                field("sender", "寄件人", FieldType::Text),
                field("sender", "寄件人2", FieldType::Text),
            ],
        );
        assert_eq!(
            t.validate(),
            Err(TemplateInvariantError::DuplicateFieldKey("sender".into()))
        );
    }

    #[test]
    fn enforced_review_needs_allowed_values() {
        let mut f = field("inspection_conclusion", "检验结论", FieldType::Text);
        f.review_enforced = true;
        let t = single("t1", "inspection_report", vec![f]);
        assert!(matches!(
            t.validate(),
            Err(TemplateInvariantError::MissingAllowedValues(_))
        ));
    }

    #[test]
    fn merge_template_requires_rule() {
        let mut t = single("m1", "lighting_combined", vec![]);
        t.process_mode = ProcessMode::Merge;
        assert_eq!(t.validate(), Err(TemplateInvariantError::MergeRuleMissing));

        t.merge_rule = Some(merge_rule("m1", "积分球", "积分球"));
        assert!(matches!(
            t.validate(),
            Err(TemplateInvariantError::IdenticalDocTypes(_))
        ));

        t.merge_rule = Some(merge_rule("m1", "积分球", "光分布"));
        assert!(t.validate().is_ok());
    }

    #[test]
    fn field_mapping_skips_unmapped_fields() {
        let mut a = field("sample_name", "样品名称", FieldType::Text);
        a.feishu_column = Some("样品名称".into());
        let mut b = field("notes", "备注", FieldType::Text);
        b.feishu_column = Some("  ".into());
        let c = field("inspector", "主检", FieldType::Text);
        let t = single("t1", "inspection_report", vec![a, b, c]);

        let mapping = t.field_mapping();
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping["sample_name"], "样品名称");
    }

    #[test]
    fn template_deserializes_with_defaults() {
        let json = r#"{
            "id": "t1", "tenant_id": "x", "code": "express", "name": "快递单",
            "process_mode": "single",
            "fields": [{"key": "sender", "label": "寄件人"}]
        }"#;
        let t: Template = serde_json::from_str(json).unwrap();
        assert!(t.is_active);
        assert_eq!(t.fields[0].field_type, FieldType::Text);
        assert!(t.examples.is_empty());
        assert!(t.merge_rule.is_none());
    }
}
