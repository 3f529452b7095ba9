pub mod enums;
pub mod template;

pub use enums::*;
pub use template::*;

/// Flat `field_key -> value` record as produced by extraction.
/// Insertion order is preserved (serde_json `preserve_order`).
pub type FieldMap = serde_json::Map<String, serde_json::Value>;

#[cfg(test)]
pub(crate) use template::fixtures;

/// Fresh document id for callers that do not bring their own.
pub fn new_document_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
