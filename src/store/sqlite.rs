use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{sort_templates, DocumentRecord, ResultStore, StoreError, TemplateStore};
use crate::models::{DocumentStatus, DocumentTable, FieldMap, MergeRule, Template};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS document_templates (
    id          TEXT PRIMARY KEY,
    tenant_id   TEXT NOT NULL,
    code        TEXT NOT NULL,
    name        TEXT NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 1,
    sort_order  INTEGER NOT NULL DEFAULT 0,
    body        TEXT NOT NULL,
    UNIQUE (tenant_id, code)
);
CREATE TABLE IF NOT EXISTS template_merge_rules (
    template_id TEXT PRIMARY KEY,
    body        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS extraction_results (
    table_name  TEXT NOT NULL,
    document_id TEXT NOT NULL,
    body        TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (table_name, document_id)
);
CREATE TABLE IF NOT EXISTS documents (
    document_id   TEXT PRIMARY KEY,
    status        TEXT NOT NULL,
    error_message TEXT,
    updated_at    TEXT NOT NULL
);
";

/// SQLite-backed template and result store.
///
/// rusqlite is blocking, so every call runs on the blocking pool with the
/// connection behind a mutex.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        Self::init(Connection::open(path)?)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA journal_mode=DELETE;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or replace a template (admin seeding). An embedded merge rule
    /// is written to the rule table as well.
    pub async fn upsert_template(&self, template: &Template) -> Result<(), StoreError> {
        let body = serde_json::to_string(template)?;
        let rule = template
            .merge_rule
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let t = template.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO document_templates (id, tenant_id, code, name, is_active, sort_order, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    tenant_id = excluded.tenant_id, code = excluded.code, name = excluded.name,
                    is_active = excluded.is_active, sort_order = excluded.sort_order,
                    body = excluded.body",
                params![t.id, t.tenant_id, t.code, t.name, t.is_active, t.sort_order, body],
            )?;
            if let Some(rule) = rule {
                conn.execute(
                    "INSERT OR REPLACE INTO template_merge_rules (template_id, body) VALUES (?1, ?2)",
                    params![t.id, rule],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn upsert_merge_rule(&self, rule: &MergeRule) -> Result<(), StoreError> {
        let body = serde_json::to_string(rule)?;
        let template_id = rule.template_id.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO template_merge_rules (template_id, body) VALUES (?1, ?2)",
                params![template_id, body],
            )?;
            Ok(())
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::TaskJoin(e.to_string()))?
    }

    async fn query_template(
        &self,
        sql: &'static str,
        args: [String; 2],
    ) -> Result<Option<Template>, StoreError> {
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(sql, params![args[0], args[1]], |row| row.get(0))
                .optional()?;
            body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
                .transpose()
        })
        .await
    }
}

#[async_trait]
impl TemplateStore for SqliteStore {
    async fn get_template(&self, template_id: &str) -> Result<Option<Template>, StoreError> {
        let id = template_id.to_string();
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM document_templates WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn find_template_by_code(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Option<Template>, StoreError> {
        self.query_template(
            "SELECT body FROM document_templates WHERE tenant_id = ?1 AND code = ?2",
            [tenant_id.to_string(), code.to_string()],
        )
        .await
    }

    async fn find_template_by_name(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<Template>, StoreError> {
        self.query_template(
            "SELECT body FROM document_templates WHERE tenant_id = ?1 AND name = ?2
             ORDER BY sort_order LIMIT 1",
            [tenant_id.to_string(), name.to_string()],
        )
        .await
    }

    async fn get_merge_rule(&self, template_id: &str) -> Result<Option<MergeRule>, StoreError> {
        let id = template_id.to_string();
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM template_merge_rules WHERE template_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn list_templates(
        &self,
        tenant_id: &str,
        active_only: bool,
    ) -> Result<Vec<Template>, StoreError> {
        let tenant = tenant_id.to_string();
        let mut templates = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT body FROM document_templates
                     WHERE tenant_id = ?1 AND (?2 = 0 OR is_active = 1)",
                )?;
                let rows = stmt.query_map(params![tenant, active_only], |row| {
                    row.get::<_, String>(0)
                })?;
                let mut out = Vec::new();
                for body in rows {
                    out.push(serde_json::from_str::<Template>(&body?)?);
                }
                Ok(out)
            })
            .await?;
        sort_templates(&mut templates);
        Ok(templates)
    }
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn save_extraction(
        &self,
        table: DocumentTable,
        document_id: &str,
        fields: &FieldMap,
    ) -> Result<(), StoreError> {
        let id = document_id.to_string();
        let incoming = fields.clone();
        self.with_conn(move |conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT body FROM extraction_results WHERE table_name = ?1 AND document_id = ?2",
                    params![table.table_name(), id],
                    |row| row.get(0),
                )
                .optional()?;
            let mut merged: FieldMap = match existing {
                Some(body) => serde_json::from_str(&body)?,
                None => FieldMap::new(),
            };
            for (k, v) in incoming {
                merged.insert(k, v);
            }
            conn.execute(
                "INSERT OR REPLACE INTO extraction_results (table_name, document_id, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    table.table_name(),
                    id,
                    serde_json::to_string(&merged)?,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_extraction(
        &self,
        table: DocumentTable,
        document_id: &str,
    ) -> Result<Option<FieldMap>, StoreError> {
        let id = document_id.to_string();
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM extraction_results WHERE table_name = ?1 AND document_id = ?2",
                    params![table.table_name(), id],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn update_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let id = document_id.to_string();
        let message = error_message.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO documents (document_id, status, error_message, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, status.as_str(), message, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_status(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let id = document_id.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, String, Option<String>, String)> = conn
                .query_row(
                    "SELECT document_id, status, error_message, updated_at
                     FROM documents WHERE document_id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            let Some((document_id, status, error_message, updated_at)) = row else {
                return Ok(None);
            };
            let status = status
                .parse::<DocumentStatus>()
                .map_err(|e| StoreError::InvalidValue(e.to_string()))?;
            let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                .map_err(|e| StoreError::InvalidValue(e.to_string()))?
                .with_timezone(&Utc);
            Ok(Some(DocumentRecord {
                document_id,
                status,
                error_message,
                updated_at,
            }))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{field, merge_rule, single};
    use crate::models::FieldType;
    use serde_json::json;

    #[tokio::test]
    async fn template_round_trips_through_sqlite() {
        let store = SqliteStore::open_in_memory().unwrap();
        let t = single("t1", "express", vec![field("sender", "寄件人", FieldType::Text)]);
        store.upsert_template(&t).await.unwrap();

        assert_eq!(store.get_template("t1").await.unwrap(), Some(t.clone()));
        assert_eq!(
            store.find_template_by_code("tenant-1", "express").await.unwrap(),
            Some(t.clone())
        );
        assert_eq!(
            store.find_template_by_name("tenant-1", "express").await.unwrap(),
            Some(t)
        );
        assert!(store.get_template("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn merge_rule_stored_with_template() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut t = single("m1", "lighting_combined", vec![]);
        t.merge_rule = Some(merge_rule("m1", "积分球", "光分布"));
        store.upsert_template(&t).await.unwrap();

        let rule = store.get_merge_rule("m1").await.unwrap().unwrap();
        assert_eq!(rule.doc_type_b, "光分布");
        assert!(store.get_merge_rule("t-other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_inactive() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut off = single("t2", "sampling", vec![]);
        off.is_active = false;
        store.upsert_template(&single("t1", "express", vec![])).await.unwrap();
        store.upsert_template(&off).await.unwrap();

        assert_eq!(store.list_templates("tenant-1", true).await.unwrap().len(), 1);
        assert_eq!(store.list_templates("tenant-1", false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn extraction_upsert_merges_keys() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut first = FieldMap::new();
        first.insert("a".into(), json!("1"));
        first.insert("b".into(), json!("2"));
        store
            .save_extraction(DocumentTable::SamplingForms, "doc-1", &first)
            .await
            .unwrap();
        let mut second = FieldMap::new();
        second.insert("b".into(), json!("3"));
        store
            .save_extraction(DocumentTable::SamplingForms, "doc-1", &second)
            .await
            .unwrap();

        let stored = store
            .get_extraction(DocumentTable::SamplingForms, "doc-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["a"], "1");
        assert_eq!(stored["b"], "3");
        assert!(store
            .get_extraction(DocumentTable::Expresses, "doc-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn status_persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("neoflow.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .update_status("doc-1", DocumentStatus::Failed, Some("OCR failed"))
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let record = store.get_status("doc-1").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("OCR failed"));
    }
}
