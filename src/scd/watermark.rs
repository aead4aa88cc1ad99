//! Per-stream watermarks.
//!
//! Each source stream owns two cursors: `<stream>/entities` tracks the highest
//! processed `arrival_seq`, `<stream>/events` the highest processed event
//! `arrival_ts`. Records at or below a cursor are already processed.
//! Cursors only move forward, and only the pipeline coordinator moves them.

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::storage::ScdStorage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub cursor: String,
    pub position: i64,
    pub updated_at: i64,
}

pub fn entities_cursor(stream: &str) -> String {
    format!("{}/entities", stream)
}

pub fn events_cursor(stream: &str) -> String {
    format!("{}/events", stream)
}

pub struct WatermarkStore {
    marks: RwLock<BTreeMap<String, Watermark>>,
    storage: Option<Arc<ScdStorage>>,
}

impl WatermarkStore {
    pub fn in_memory() -> Self {
        Self {
            marks: RwLock::new(BTreeMap::new()),
            storage: None,
        }
    }

    pub fn open(storage: Arc<ScdStorage>) -> Result<Self> {
        let marks: BTreeMap<String, Watermark> = storage
            .load_watermarks()?
            .into_iter()
            .map(|(cursor, position, updated_at)| {
                (
                    cursor.clone(),
                    Watermark {
                        cursor,
                        position,
                        updated_at,
                    },
                )
            })
            .collect();
        info!(cursors = marks.len(), "watermarks loaded");
        Ok(Self {
            marks: RwLock::new(marks),
            storage: Some(storage),
        })
    }

    pub fn position(&self, cursor: &str) -> Option<i64> {
        self.marks.read().get(cursor).map(|w| w.position)
    }

    /// True when `marker` is at or below the cursor.
    pub fn is_processed(&self, cursor: &str, marker: i64) -> bool {
        self.position(cursor).is_some_and(|p| marker <= p)
    }

    /// Move a cursor forward. Returns false (and writes nothing) when
    /// `position` would not advance it.
    pub fn advance(&self, cursor: &str, position: i64) -> Result<bool> {
        let mut marks = self.marks.write();
        if let Some(current) = marks.get(cursor) {
            if position <= current.position {
                debug!(cursor, position, current = current.position, "watermark not advanced");
                return Ok(false);
            }
        }
        if let Some(storage) = &self.storage {
            storage.set_watermark(cursor, position)?;
        }
        marks.insert(
            cursor.to_string(),
            Watermark {
                cursor: cursor.to_string(),
                position,
                updated_at: Utc::now().timestamp_millis(),
            },
        );
        info!(cursor, position, "watermark advanced");
        Ok(true)
    }

    pub fn all(&self) -> Vec<Watermark> {
        self.marks.read().values().cloned().collect()
    }
}
