use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid enum value for {field}: {value}")]
pub struct ParseEnumError {
    pub field: String,
    pub value: String,
}

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(ParseEnumError {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(ProcessMode {
    Single => "single",
    Merge => "merge",
});

str_enum!(FieldType {
    Text => "text",
    Date => "date",
    Number => "number",
});

str_enum!(DocumentStatus {
    Processing => "processing",
    PendingReview => "pending_review",
    Completed => "completed",
    Failed => "failed",
});

/// Closed label set produced by the classification stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentLabel {
    #[serde(rename = "快递单")]
    Express,
    #[serde(rename = "抽样单")]
    SamplingForm,
    #[serde(rename = "测试单")]
    TestReport,
    #[serde(rename = "未知")]
    Unknown,
}

impl DocumentLabel {
    /// Labels in fallback priority order (most specific first).
    pub const PRIORITY: [DocumentLabel; 3] = [
        DocumentLabel::Express,
        DocumentLabel::SamplingForm,
        DocumentLabel::TestReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Express => "快递单",
            Self::SamplingForm => "抽样单",
            Self::TestReport => "测试单",
            Self::Unknown => "未知",
        }
    }

    /// Parse a classifier label. Accepts the canonical strings only.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "快递单" => Some(Self::Express),
            "抽样单" => Some(Self::SamplingForm),
            "测试单" => Some(Self::TestReport),
            "未知" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for DocumentLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistence target for a document type. Resolved through
/// `pipeline::persist::PersistenceRouter`, never by raw table-name strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentTable {
    InspectionReports,
    Expresses,
    SamplingForms,
    LightingReports,
}

impl DocumentTable {
    pub const ALL: [DocumentTable; 4] = [
        DocumentTable::InspectionReports,
        DocumentTable::Expresses,
        DocumentTable::SamplingForms,
        DocumentTable::LightingReports,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            Self::InspectionReports => "inspection_reports",
            Self::Expresses => "expresses",
            Self::SamplingForms => "sampling_forms",
            Self::LightingReports => "lighting_reports",
        }
    }

    pub fn from_table_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.table_name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn process_mode_round_trips_through_str() {
        assert_eq!(ProcessMode::from_str("merge").unwrap(), ProcessMode::Merge);
        assert_eq!(ProcessMode::Single.as_str(), "single");
    }

    #[test]
    fn unknown_value_is_rejected() {
        let err = FieldType::from_str("currency").unwrap_err();
        assert_eq!(err.field, "FieldType");
        assert_eq!(err.value, "currency");
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&DocumentStatus::PendingReview).unwrap();
        assert_eq!(json, "\"pending_review\"");
        let parsed: FieldType = serde_json::from_str("\"date\"").unwrap();
        assert_eq!(parsed, FieldType::Date);
    }

    #[test]
    fn labels_parse_canonical_strings() {
        assert_eq!(DocumentLabel::from_label("快递单"), Some(DocumentLabel::Express));
        assert_eq!(DocumentLabel::from_label(" 测试单 "), Some(DocumentLabel::TestReport));
        assert_eq!(DocumentLabel::from_label("发票"), None);
    }

    #[test]
    fn table_names_round_trip() {
        for table in DocumentTable::ALL {
            assert_eq!(DocumentTable::from_table_name(table.table_name()), Some(table));
        }
        assert_eq!(DocumentTable::from_table_name("documents"), None);
    }

    #[test]
    fn label_serializes_as_chinese() {
        let json = serde_json::to_string(&DocumentLabel::SamplingForm).unwrap();
        assert_eq!(json, "\"抽样单\"");
    }
}
