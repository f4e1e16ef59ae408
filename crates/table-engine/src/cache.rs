//! Pattern metadata cache.
//!
//! Clear-pattern selection only needs the first rho of the upcoming
//! pattern. Entries are keyed by path and invalidated when the file's
//! modification time changes.

use crate::pattern::{load_pattern, Coordinate};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use table_core::TableResult;
use tracing::trace;

/// Summary of a pattern file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternMetadata {
    /// First point after normalisation.
    pub first: Option<Coordinate>,
    /// Last point after normalisation.
    pub last: Option<Coordinate>,
    /// Number of points.
    pub points: usize,
}

impl PatternMetadata {
    /// Build from parsed coordinates.
    pub fn from_points(points: &[Coordinate]) -> Self {
        Self {
            first: points.first().copied(),
            last: points.last().copied(),
            points: points.len(),
        }
    }
}

/// Path-keyed, mtime-validated metadata cache.
#[derive(Debug, Default)]
pub struct MetadataCache {
    entries: Mutex<HashMap<PathBuf, (SystemTime, PatternMetadata)>>,
}

impl MetadataCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata for `path`, parsing the file only on a miss or a stale entry.
    pub async fn metadata(&self, path: &Path) -> TableResult<PatternMetadata> {
        let modified = tokio::fs::metadata(path).await?.modified()?;
        let cached = self.entries.lock().get(path).cloned();
        if let Some((stamp, meta)) = cached {
            if stamp == modified {
                trace!(path = %path.display(), "Metadata cache hit");
                return Ok(meta);
            }
        }

        let meta = PatternMetadata::from_points(&load_pattern(path).await?);
        self.remember(path, modified, meta.clone());
        Ok(meta)
    }

    /// Record metadata from a parse that already happened.
    pub fn remember(&self, path: &Path, modified: SystemTime, meta: PatternMetadata) {
        self.entries
            .lock()
            .insert(path.to_path_buf(), (modified, meta));
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
