//! Memory log repository
//!
//! Rows are only ever inserted. `seq` preserves insertion order so the
//! vector index can be rebuilt exactly as it was built live.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};

use crate::memory::{MemoryRecord, RecordKind};

/// A row as stored, before dimension checks
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub seq: i64,
    pub record: MemoryRecord,
    pub dimension: usize,
}

/// Repository for the append-only memory log
#[derive(Clone)]
pub struct MemoryRepository {
    pool: SqlitePool,
}

impl MemoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one record
    pub async fn insert(&self, record: &MemoryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO memory_records
                (id, session_id, kind, tool_name, text, embedding, dimension, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(record.kind.as_str())
        .bind(record.tool_name.as_deref())
        .bind(&record.text)
        .bind(embedding_to_blob(&record.embedding))
        .bind(record.embedding.len() as i64)
        .bind(record.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert memory record")?;

        Ok(())
    }

    /// Every record in insertion order
    pub async fn load_all(&self) -> Result<Vec<StoredRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, id, session_id, kind, tool_name, text, embedding, dimension, created_at
            FROM memory_records
            ORDER BY seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load memory records")?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let kind_str: String = row.get("kind");
            let kind = RecordKind::parse(&kind_str)
                .with_context(|| format!("Unknown record kind '{}'", kind_str))?;
            let blob: Vec<u8> = row.get("embedding");
            let created_at: i64 = row.get("created_at");
            let dimension: i64 = row.get("dimension");

            records.push(StoredRecord {
                seq: row.get("seq"),
                dimension: dimension.max(0) as usize,
                record: MemoryRecord {
                    id: row.get("id"),
                    session_id: row.get("session_id"),
                    kind,
                    tool_name: row.get("tool_name"),
                    text: row.get("text"),
                    embedding: blob_to_embedding(&blob),
                    timestamp: millis_to_datetime(created_at),
                },
            });
        }

        Ok(records)
    }

    /// Number of stored records
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM memory_records")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count memory records")?;
        Ok(count)
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Serialize an embedding vector to a little-endian byte blob.
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        buf.extend_from_slice(&val.to_le_bytes());
    }
    buf
}

/// Deserialize a little-endian byte blob; a trailing partial value is dropped.
pub fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
