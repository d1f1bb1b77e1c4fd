//! Memory store
//!
//! An append-only log of embedded session records with nearest-neighbour
//! retrieval. The SQLite log (when persistence is on) is the source of
//! truth; the in-process `VectorIndex` is rebuilt from it on open.
//!
//! # Concurrency
//!
//! Writers take `writer` for the whole add (check, persist, index), so
//! insertion order in the log matches index order. The index itself sits
//! behind an `RwLock` that is write-locked only for the final in-memory
//! push, so a query sees either the whole record or none of it.

pub mod embedder;
pub mod index;

pub use embedder::{embedder_from_config, Embedder, HashingEmbedder, OllamaEmbedder};
pub use index::{euclidean_distance, VectorIndex};

use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::MemoryRepository;

/// What a record captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Perception,
    ToolOutput,
    FinalAnswer,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Perception => "perception",
            Self::ToolOutput => "tool_output",
            Self::FinalAnswer => "final_answer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "perception" => Some(Self::Perception),
            "tool_output" => Some(Self::ToolOutput),
            "final_answer" => Some(Self::FinalAnswer),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One embedded, timestamped unit of session history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub session_id: String,
    pub kind: RecordKind,
    pub tool_name: Option<String>,
    pub text: String,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub embedding: Vec<f32>,
    pub timestamp: DateTime<Utc>,
}

/// A record to be added; id and embedding are filled in when absent
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub id: Option<String>,
    pub session_id: String,
    pub kind: RecordKind,
    pub tool_name: Option<String>,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
}

impl NewRecord {
    pub fn new(session_id: impl Into<String>, kind: RecordKind, text: impl Into<String>) -> Self {
        Self {
            id: None,
            session_id: session_id.into(),
            kind,
            tool_name: None,
            text: text.into(),
            embedding: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool_name = Some(tool.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// A query hit
#[derive(Debug, Clone, Serialize)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    pub distance: f32,
}

/// Retrieval request
#[derive(Debug, Clone)]
pub struct MemoryQuery {
    pub text: String,
    pub k: usize,
    pub kind: Option<RecordKind>,
    pub session_id: Option<String>,
}

impl MemoryQuery {
    pub fn new(text: impl Into<String>, k: usize) -> Self {
        Self {
            text: text.into(),
            k,
            kind: None,
            session_id: None,
        }
    }

    pub fn kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

pub struct MemoryStore {
    embedder: Arc<dyn Embedder>,
    index: RwLock<VectorIndex>,
    writer: Mutex<()>,
    log: Option<MemoryRepository>,
}

impl MemoryStore {
    /// Store without a persistent log
    pub fn in_memory(embedder: Arc<dyn Embedder>, dimension: usize) -> Self {
        Self {
            embedder,
            index: RwLock::new(VectorIndex::new(dimension)),
            writer: Mutex::new(()),
            log: None,
        }
    }

    /// Store backed by the SQLite log; the index is rebuilt before returning
    pub async fn open(
        log: MemoryRepository,
        embedder: Arc<dyn Embedder>,
        dimension: usize,
    ) -> Result<Self, EngineError> {
        let store = Self {
            embedder,
            index: RwLock::new(VectorIndex::new(dimension)),
            writer: Mutex::new(()),
            log: Some(log),
        };
        let loaded = store.rebuild_index().await?;
        info!(records = loaded, dimension, "Memory store opened");
        Ok(store)
    }

    pub async fn dimension(&self) -> usize {
        self.index.read().await.dimension()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    /// Append a record, embedding its text when no vector was supplied.
    ///
    /// Rejects duplicate ids and vectors of the wrong dimension before
    /// anything is written.
    pub async fn add(&self, new: NewRecord) -> Result<MemoryRecord, EngineError> {
        let embedding = match new.embedding {
            Some(v) => v,
            None => self.embedder.embed(&new.text).await?,
        };

        let record = MemoryRecord {
            id: new.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            session_id: new.session_id,
            kind: new.kind,
            tool_name: new.tool_name,
            text: new.text,
            embedding,
            timestamp: Utc::now(),
        };

        let _writer = self.writer.lock().await;
        self.index.read().await.check(&record)?;

        if let Some(log) = &self.log {
            log.insert(&record)
                .await
                .map_err(|e| EngineError::Database(format!("{:#}", e)))?;
        }

        self.index.write().await.insert(record.clone())?;

        debug!(
            id = %record.id,
            session_id = %record.session_id,
            kind = %record.kind,
            "Memory record added"
        );
        Ok(record)
    }

    /// The `k` records nearest to `text`, optionally of one kind
    pub async fn query(
        &self,
        text: &str,
        k: usize,
        kind: Option<RecordKind>,
    ) -> Result<Vec<MemoryRecord>, EngineError> {
        let query = MemoryQuery {
            text: text.to_string(),
            k,
            kind,
            session_id: None,
        };
        Ok(self
            .query_with(&query)
            .await?
            .into_iter()
            .map(|hit| hit.record)
            .collect())
    }

    /// Nearest-neighbour search with distances, closest first
    pub async fn query_with(&self, query: &MemoryQuery) -> Result<Vec<ScoredRecord>, EngineError> {
        if query.k == 0 || self.is_empty().await {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed(&query.text).await?;
        let index = self.index.read().await;
        if vector.len() != index.dimension() {
            return Err(EngineError::DimensionMismatch {
                expected: index.dimension(),
                actual: vector.len(),
            });
        }

        Ok(index.search(&vector, query.k, |r| {
            query.kind.map_or(true, |k| r.kind == k)
                && query
                    .session_id
                    .as_deref()
                    .map_or(true, |s| r.session_id == s)
        }))
    }

    /// Every record of one session in insertion order
    pub async fn session_records(&self, session_id: &str) -> Vec<MemoryRecord> {
        self.index
            .read()
            .await
            .records()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Rebuild the index from the log. Returns the number of indexed records.
    ///
    /// Without a log the in-process index is already authoritative.
    pub async fn rebuild_index(&self) -> Result<usize, EngineError> {
        let Some(log) = &self.log else {
            return Ok(self.len().await);
        };

        let _writer = self.writer.lock().await;
        let stored = log
            .load_all()
            .await
            .map_err(|e| EngineError::Database(format!("{:#}", e)))?;

        let dimension = self.index.read().await.dimension();
        let mut rebuilt = VectorIndex::new(dimension);
        for row in stored {
            if row.dimension != dimension || row.record.embedding.len() != dimension {
                warn!(
                    id = %row.record.id,
                    seq = row.seq,
                    stored = row.dimension,
                    expected = dimension,
                    "Skipping memory record with mismatched dimension"
                );
                continue;
            }
            if let Err(e) = rebuilt.insert(row.record) {
                warn!(seq = row.seq, error = %e, "Skipping unreadable memory record");
            }
        }

        let count = rebuilt.len();
        *self.index.write().await = rebuilt;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tempfile::TempDir;

    fn store(dim: usize) -> MemoryStore {
        MemoryStore::in_memory(Arc::new(HashingEmbedder::new(dim)), dim)
    }

    #[tokio::test]
    async fn test_query_on_empty_store() {
        let store = store(32);
        let hits = store.query("anything", 3, None).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_own_text_comes_back_first() {
        let store = store(128);
        store
            .add(NewRecord::new("s1", RecordKind::ToolOutput, "weather in lisbon is sunny"))
            .await
            .unwrap();
        let target = store
            .add(NewRecord::new("s1", RecordKind::ToolOutput, "F1 driver standings 2024"))
            .await
            .unwrap();
        store
            .add(NewRecord::new("s1", RecordKind::Perception, "user wants cooking recipes"))
            .await
            .unwrap();

        let hits = store
            .query_with(&MemoryQuery::new("F1 driver standings 2024", 3))
            .await
            .unwrap();
        assert_eq!(hits[0].record.id, target.id);
        assert!(hits[0].distance < 1e-5);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[tokio::test]
    async fn test_wrong_dimension_rejected_at_insert() {
        let store = store(8);
        let err = store
            .add(NewRecord::new("s1", RecordKind::ToolOutput, "x").with_embedding(vec![1.0; 4]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::DimensionMismatch { expected: 8, actual: 4 }
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_id_never_overwrites() {
        let store = store(16);
        store
            .add(NewRecord::new("s1", RecordKind::ToolOutput, "first").with_id("r1"))
            .await
            .unwrap();
        let err = store
            .add(NewRecord::new("s1", RecordKind::ToolOutput, "second").with_id("r1"))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::DuplicateRecord(_)));
        let records = store.session_records("s1").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "first");
    }

    #[tokio::test]
    async fn test_kind_and_session_filters() {
        let store = store(64);
        store
            .add(NewRecord::new("a", RecordKind::Perception, "standings"))
            .await
            .unwrap();
        store
            .add(NewRecord::new("a", RecordKind::ToolOutput, "standings table").with_tool("search"))
            .await
            .unwrap();
        store
            .add(NewRecord::new("b", RecordKind::ToolOutput, "standings"))
            .await
            .unwrap();

        let outputs = store
            .query("standings", 10, Some(RecordKind::ToolOutput))
            .await
            .unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().all(|r| r.kind == RecordKind::ToolOutput));

        let only_a = store
            .query_with(
                &MemoryQuery::new("standings", 10)
                    .kind(RecordKind::ToolOutput)
                    .session("a"),
            )
            .await
            .unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].record.tool_name.as_deref(), Some("search"));
    }

    #[tokio::test]
    async fn test_log_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("memory.db");
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(32));

        {
            let db = Database::new(&db_path).await.unwrap();
            let store = MemoryStore::open(db.memory(), embedder.clone(), 32)
                .await
                .unwrap();
            store
                .add(NewRecord::new("s1", RecordKind::ToolOutput, "sheet created"))
                .await
                .unwrap();
            store
                .add(NewRecord::new("s1", RecordKind::FinalAnswer, "done"))
                .await
                .unwrap();
            db.close().await.unwrap();
        }

        let db = Database::new(&db_path).await.unwrap();
        let store = MemoryStore::open(db.memory(), embedder, 32).await.unwrap();
        assert_eq!(store.len().await, 2);

        let hits = store.query("sheet created", 1, None).await.unwrap();
        assert_eq!(hits[0].text, "sheet created");
        let session = store.session_records("s1").await;
        assert_eq!(session[1].kind, RecordKind::FinalAnswer);
    }

    #[tokio::test]
    async fn test_reopen_with_other_dimension_skips_rows() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("memory.db")).await.unwrap();

        let small = MemoryStore::open(db.memory(), Arc::new(HashingEmbedder::new(8)), 8)
            .await
            .unwrap();
        small
            .add(NewRecord::new("s", RecordKind::ToolOutput, "x"))
            .await
            .unwrap();

        let large = MemoryStore::open(db.memory(), Arc::new(HashingEmbedder::new(16)), 16)
            .await
            .unwrap();
        assert!(large.is_empty().await);
    }

    #[test]
    fn test_record_kind_names() {
        for kind in [
            RecordKind::Perception,
            RecordKind::ToolOutput,
            RecordKind::FinalAnswer,
        ] {
            assert_eq!(RecordKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RecordKind::parse("other"), None);
    }
}
