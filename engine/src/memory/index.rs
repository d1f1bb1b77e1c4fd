//! Exact nearest-neighbour index
//!
//! A flat scan over every stored vector. Session memories stay in the
//! hundreds to low thousands of records, where a scan is both exact and fast
//! enough. The index is derived state: it can always be rebuilt from the log.

use sdk::errors::EngineError;
use std::collections::HashSet;

use super::{MemoryRecord, ScoredRecord};

/// Euclidean (L2) distance between two vectors of equal length
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    records: Vec<MemoryRecord>,
    ids: HashSet<String>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            records: Vec::new(),
            ids: HashSet::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Records in insertion order
    pub fn records(&self) -> &[MemoryRecord] {
        &self.records
    }

    /// Check a record without inserting it
    pub fn check(&self, record: &MemoryRecord) -> Result<(), EngineError> {
        if record.embedding.len() != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                actual: record.embedding.len(),
            });
        }
        if record.embedding.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::Embedding(format!(
                "embedding for record '{}' contains non-finite values",
                record.id
            )));
        }
        if self.contains(&record.id) {
            return Err(EngineError::DuplicateRecord(record.id.clone()));
        }
        Ok(())
    }

    pub fn insert(&mut self, record: MemoryRecord) -> Result<(), EngineError> {
        self.check(&record)?;
        self.ids.insert(record.id.clone());
        self.records.push(record);
        Ok(())
    }

    /// The `k` records nearest to `query` that pass `filter`, closest first.
    ///
    /// Equal distances keep insertion order.
    pub fn search<F>(&self, query: &[f32], k: usize, filter: F) -> Vec<ScoredRecord>
    where
        F: Fn(&MemoryRecord) -> bool,
    {
        if k == 0 || query.len() != self.dimension {
            return Vec::new();
        }

        let mut scored: Vec<(f32, usize)> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| filter(r))
            .map(|(i, r)| (euclidean_distance(query, &r.embedding), i))
            .collect();

        // Insertion position breaks ties
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.truncate(k);
        scored
            .into_iter()
            .map(|(distance, i)| ScoredRecord {
                distance,
                record: self.records[i].clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RecordKind;
    use chrono::Utc;

    fn rec(id: &str, kind: RecordKind, v: Vec<f32>) -> MemoryRecord {
        MemoryRecord {
            id: id.to_string(),
            session_id: "s".to_string(),
            kind,
            tool_name: None,
            text: id.to_string(),
            embedding: v,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_distance() {
        assert_eq!(euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]), 5.0);
        assert_eq!(euclidean_distance(&[1.0, 1.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_search_orders_by_distance_with_stable_ties() {
        let mut index = VectorIndex::new(2);
        index.insert(rec("far", RecordKind::ToolOutput, vec![10.0, 0.0])).unwrap();
        index.insert(rec("tie-a", RecordKind::ToolOutput, vec![1.0, 0.0])).unwrap();
        index.insert(rec("tie-b", RecordKind::ToolOutput, vec![0.0, 1.0])).unwrap();
        index.insert(rec("exact", RecordKind::ToolOutput, vec![0.0, 0.0])).unwrap();

        let hits = index.search(&[0.0, 0.0], 3, |_| true);
        let ids: Vec<&str> = hits.iter().map(|h| h.record.id.as_str()).collect();
        assert_eq!(ids, vec!["exact", "tie-a", "tie-b"]);
    }

    #[test]
    fn test_search_with_filter() {
        let mut index = VectorIndex::new(1);
        index.insert(rec("p", RecordKind::Perception, vec![0.0])).unwrap();
        index.insert(rec("t", RecordKind::ToolOutput, vec![5.0])).unwrap();

        let hits = index.search(&[0.0], 5, |r| r.kind == RecordKind::ToolOutput);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, "t");
    }

    #[test]
    fn test_search_keeps_only_k_nearest() {
        let mut index = VectorIndex::new(1);
        for i in (0..50).rev() {
            index
                .insert(rec(&format!("r{}", i), RecordKind::ToolOutput, vec![i as f32]))
                .unwrap();
        }

        let hits = index.search(&[0.0], 3, |_| true);
        let found: Vec<(&str, f32)> = hits
            .iter()
            .map(|h| (h.record.id.as_str(), h.distance))
            .collect();
        assert_eq!(found, vec![("r0", 0.0), ("r1", 1.0), ("r2", 2.0)]);
    }

    #[test]
    fn test_rejects_bad_records() {
        let mut index = VectorIndex::new(2);
        assert!(matches!(
            index.insert(rec("a", RecordKind::Perception, vec![1.0])),
            Err(EngineError::DimensionMismatch { expected: 2, actual: 1 })
        ));
        assert!(index
            .insert(rec("nan", RecordKind::Perception, vec![f32::NAN, 0.0]))
            .is_err());

        index.insert(rec("a", RecordKind::Perception, vec![1.0, 0.0])).unwrap();
        assert!(matches!(
            index.insert(rec("a", RecordKind::Perception, vec![1.0, 0.0])),
            Err(EngineError::DuplicateRecord(_))
        ));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_empty_index_search() {
        let index = VectorIndex::new(3);
        assert!(index.search(&[0.0, 0.0, 0.0], 3, |_| true).is_empty());
    }
}
