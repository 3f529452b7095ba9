use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OcrError {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("OCR recognition failed: {0}")]
    Recognition(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One recognised text line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrLine {
    pub text: String,
    pub confidence: f32,
}

/// Whole-file OCR output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrDocument {
    pub text: String,
    /// 0.0 - 1.0
    pub confidence: f32,
    pub lines: Vec<OcrLine>,
    pub total_lines: usize,
}

impl OcrDocument {
    /// Build a document from plain lines, each at the given confidence.
    pub fn from_text(text: &str, confidence: f32) -> Self {
        let lines: Vec<OcrLine> = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| OcrLine {
                text: l.to_string(),
                confidence,
            })
            .collect();
        Self {
            text: text.to_string(),
            confidence,
            total_lines: lines.len(),
            lines,
        }
    }
}

/// Per-page OCR output. `page` is 1-indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrPage {
    pub page: usize,
    pub text: String,
    pub confidence: f32,
    pub lines: Vec<OcrLine>,
}

/// OCR engine abstraction (allows mocking).
///
/// Implementations must report a missing file as `OcrError::FileNotFound`,
/// distinct from recognition failures.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn process(&self, path: &Path) -> Result<OcrDocument, OcrError>;

    async fn process_per_page(&self, path: &Path) -> Result<Vec<OcrPage>, OcrError>;
}

// ═══════════════════════════════════════════════════════════
// Mock engine
// ═══════════════════════════════════════════════════════════

/// Mock OCR engine for testing: canned results per path plus call counters.
///
/// A path registered only with pages still answers `process` (pages joined);
/// a path registered only as a document answers `process_per_page` with one page.
#[derive(Default)]
pub struct MockOcrEngine {
    documents: HashMap<PathBuf, OcrDocument>,
    pages: HashMap<PathBuf, Vec<OcrPage>>,
    failures: HashMap<PathBuf, String>,
    process_calls: AtomicUsize,
    page_calls: AtomicUsize,
}

impl MockOcrEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, path: impl Into<PathBuf>, text: &str, confidence: f32) -> Self {
        self.documents
            .insert(path.into(), OcrDocument::from_text(text, confidence));
        self
    }

    pub fn with_pages(mut self, path: impl Into<PathBuf>, pages: &[&str]) -> Self {
        let pages = pages
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let doc = OcrDocument::from_text(text, 0.9);
                OcrPage {
                    page: i + 1,
                    text: doc.text,
                    confidence: doc.confidence,
                    lines: doc.lines,
                }
            })
            .collect();
        self.pages.insert(path.into(), pages);
        self
    }

    /// Every call for `path` fails with a recognition error.
    pub fn with_failure(mut self, path: impl Into<PathBuf>, message: &str) -> Self {
        self.failures.insert(path.into(), message.to_string());
        self
    }

    pub fn process_calls(&self) -> usize {
        self.process_calls.load(Ordering::SeqCst)
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.process_calls() + self.page_calls()
    }

    fn check_failure(&self, path: &Path) -> Result<(), OcrError> {
        match self.failures.get(path) {
            Some(message) => Err(OcrError::Recognition(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl OcrEngine for MockOcrEngine {
    async fn process(&self, path: &Path) -> Result<OcrDocument, OcrError> {
        self.process_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure(path)?;
        if let Some(doc) = self.documents.get(path) {
            return Ok(doc.clone());
        }
        let pages = self
            .pages
            .get(path)
            .ok_or_else(|| OcrError::FileNotFound(path.to_path_buf()))?;
        let text = pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let confidence = if pages.is_empty() {
            0.0
        } else {
            pages.iter().map(|p| p.confidence).sum::<f32>() / pages.len() as f32
        };
        let lines: Vec<OcrLine> = pages.iter().flat_map(|p| p.lines.clone()).collect();
        Ok(OcrDocument {
            text,
            confidence,
            total_lines: lines.len(),
            lines,
        })
    }

    async fn process_per_page(&self, path: &Path) -> Result<Vec<OcrPage>, OcrError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure(path)?;
        if let Some(pages) = self.pages.get(path) {
            return Ok(pages.clone());
        }
        let doc = self
            .documents
            .get(path)
            .ok_or_else(|| OcrError::FileNotFound(path.to_path_buf()))?;
        Ok(vec![OcrPage {
            page: 1,
            text: doc.text.clone(),
            confidence: doc.confidence,
            lines: doc.lines.clone(),
        }])
    }
}

// ═══════════════════════════════════════════════════════════
// Content-addressed cache
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OcrMode {
    Whole,
    PerPage,
}

#[derive(Clone)]
enum Cached {
    Whole(OcrDocument),
    PerPage(Vec<OcrPage>),
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<(String, OcrMode), Cached>,
    order: VecDeque<(String, OcrMode)>,
}

/// Wraps an engine with a bounded FIFO cache keyed by the SHA-256 of the file
/// content and the OCR mode. Errors are never cached.
pub struct CachingOcrEngine {
    inner: Arc<dyn OcrEngine>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl CachingOcrEngine {
    pub fn new(inner: Arc<dyn OcrEngine>, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &(String, OcrMode)) -> Option<Cached> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entries.get(key).cloned()
    }

    fn store(&self, key: (String, OcrMode), value: Cached) {
        if self.capacity == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.entries.insert(key.clone(), value).is_none() {
            state.order.push_back(key);
        }
        while state.order.len() > self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.entries.remove(&oldest);
            }
        }
    }
}

/// Compute the SHA-256 content hash of a file (base64).
pub async fn content_hash(path: &Path) -> Result<String, OcrError> {
    let content = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => OcrError::FileNotFound(path.to_path_buf()),
        _ => OcrError::Io(e),
    })?;
    let hash = Sha256::digest(&content);
    Ok(base64::engine::general_purpose::STANDARD.encode(hash))
}

#[async_trait]
impl OcrEngine for CachingOcrEngine {
    async fn process(&self, path: &Path) -> Result<OcrDocument, OcrError> {
        let key = (content_hash(path).await?, OcrMode::Whole);
        if let Some(Cached::Whole(doc)) = self.lookup(&key) {
            tracing::debug!(path = %path.display(), "OCR cache hit");
            return Ok(doc);
        }
        let doc = self.inner.process(path).await?;
        self.store(key, Cached::Whole(doc.clone()));
        Ok(doc)
    }

    async fn process_per_page(&self, path: &Path) -> Result<Vec<OcrPage>, OcrError> {
        let key = (content_hash(path).await?, OcrMode::PerPage);
        if let Some(Cached::PerPage(pages)) = self.lookup(&key) {
            tracing::debug!(path = %path.display(), "OCR cache hit (per page)");
            return Ok(pages);
        }
        let pages = self.inner.process_per_page(path).await?;
        self.store(key, Cached::PerPage(pages.clone()));
        Ok(pages)
    }
}
