// 🔍 Deduplication Engine - one row per key, last write wins
//
// Overlapping exports (e.g. two monthly files both covering a month boundary)
// repeat rows. The copy from the most recently modified file survives; within
// a single file, or between files with equal timestamps, the later one wins.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::records::{AssetSnapshot, CanonicalRecord};

// ============================================================================
// KEYS & PROVENANCE
// ============================================================================

/// Identity used to spot duplicates.
pub trait DedupKey {
    fn dedup_key(&self) -> String;
}

impl DedupKey for CanonicalRecord {
    fn dedup_key(&self) -> String {
        self.external_id().to_string()
    }
}

impl DedupKey for AssetSnapshot {
    fn dedup_key(&self) -> String {
        self.external_id()
    }
}

/// A row plus where it came from.
#[derive(Debug, Clone)]
pub struct Sourced<T> {
    pub item: T,
    pub source: PathBuf,
    pub modified: SystemTime,
}

impl<T> Sourced<T> {
    pub fn new(item: T, source: impl Into<PathBuf>, modified: SystemTime) -> Self {
        Sourced {
            item,
            source: source.into(),
            modified,
        }
    }
}

// ============================================================================
// DUPLICATE MATCH RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStrategy {
    /// The surviving copy came from a more recently modified file
    NewerFile,

    /// Same recency; the copy seen later wins
    LaterOccurrence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateMatch {
    pub key: String,
    pub kept_source: PathBuf,
    pub dropped_source: PathBuf,
    pub strategy: MatchStrategy,
}

// ============================================================================
// DEDUPLICATION ENGINE
// ============================================================================

#[derive(Debug, Default)]
pub struct DeduplicationEngine;

impl DeduplicationEngine {
    pub fn new() -> Self {
        DeduplicationEngine
    }

    /// Collapse rows sharing a key. Survivors keep first-seen order.
    pub fn deduplicate<T: DedupKey>(&self, rows: Vec<Sourced<T>>) -> (Vec<T>, Vec<DuplicateMatch>) {
        let mut slots: Vec<Sourced<T>> = Vec::with_capacity(rows.len());
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut matches = Vec::new();

        for row in rows {
            let key = row.item.dedup_key();
            let Some(&slot) = index.get(&key) else {
                index.insert(key, slots.len());
                slots.push(row);
                continue;
            };

            let existing = &slots[slot];
            // Incoming row is later in input order, so it wins ties
            let (strategy, incoming_wins) = if row.modified > existing.modified {
                (MatchStrategy::NewerFile, true)
            } else if row.modified < existing.modified {
                (MatchStrategy::NewerFile, false)
            } else {
                (MatchStrategy::LaterOccurrence, true)
            };

            let (kept_source, dropped_source) = if incoming_wins {
                (row.source.clone(), existing.source.clone())
            } else {
                (existing.source.clone(), row.source.clone())
            };

            debug!(
                key = %key,
                kept = %kept_source.display(),
                dropped = %dropped_source.display(),
                "duplicate resolved"
            );
            matches.push(DuplicateMatch {
                key,
                kept_source,
                dropped_source,
                strategy,
            });

            if incoming_wins {
                slots[slot] = row;
            }
        }

        (slots.into_iter().map(|s| s.item).collect(), matches)
    }
}
