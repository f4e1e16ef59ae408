//! Clear-pattern selection.
//!
//! Clear patterns live in the pattern directory as
//! `clear_from_in{suffix}.thr`, `clear_from_out{suffix}.thr` and
//! `clear_sideway{suffix}.thr`, where the suffix depends on the table type
//! (`""`, `"_mini"`, `"_pro"`).

use crate::cache::MetadataCache;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use table_core::settings::PatternSettings;
use table_core::{TableError, TableType};
use tracing::{debug, warn};

/// How the clear pattern before each main pattern is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearMode {
    /// No clear patterns.
    #[default]
    None,
    /// Uniformly random from the table's clear set.
    Random,
    /// From outside when the next pattern starts near the centre, else from inside.
    Adaptive,
    /// Always `clear_from_in`.
    ClearFromIn,
    /// Always `clear_from_out`.
    ClearFromOut,
    /// Always `clear_sideway`.
    ClearSideway,
}

impl FromStr for ClearMode {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(ClearMode::None),
            "random" => Ok(ClearMode::Random),
            "adaptive" => Ok(ClearMode::Adaptive),
            "clear_from_in" => Ok(ClearMode::ClearFromIn),
            "clear_from_out" => Ok(ClearMode::ClearFromOut),
            "clear_sideway" => Ok(ClearMode::ClearSideway),
            other => Err(TableError::Config(format!("unknown clear mode '{}'", other))),
        }
    }
}

/// One member of a table's clear set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearKind {
    /// Spiral from the centre outwards.
    FromIn,
    /// Spiral from the rim inwards.
    FromOut,
    /// Side-to-side sweep.
    Sideway,
}

impl ClearKind {
    const ALL: [ClearKind; 3] = [ClearKind::FromIn, ClearKind::FromOut, ClearKind::Sideway];

    fn stem(self) -> &'static str {
        match self {
            ClearKind::FromIn => "clear_from_in",
            ClearKind::FromOut => "clear_from_out",
            ClearKind::Sideway => "clear_sideway",
        }
    }
}

/// Resolves clear modes to files.
#[derive(Debug)]
pub struct ClearSelector<'a> {
    patterns: &'a PatternSettings,
    table_type: TableType,
    cache: &'a MetadataCache,
}

impl<'a> ClearSelector<'a> {
    /// Selector for the given table.
    pub fn new(patterns: &'a PatternSettings, table_type: TableType, cache: &'a MetadataCache) -> Self {
        Self {
            patterns,
            table_type,
            cache,
        }
    }

    /// Built-in file of `kind` for this table type.
    pub fn builtin(&self, kind: ClearKind) -> PathBuf {
        self.patterns.dir.join(format!(
            "{}{}.thr",
            kind.stem(),
            self.table_type.clear_suffix()
        ))
    }

    /// File of `kind`, honouring a custom override that exists on disk.
    pub async fn file_for(&self, kind: ClearKind) -> PathBuf {
        let custom = match kind {
            ClearKind::FromIn => self.patterns.custom_clear_from_in.as_deref(),
            ClearKind::FromOut => self.patterns.custom_clear_from_out.as_deref(),
            ClearKind::Sideway => None,
        };
        if let Some(name) = custom.filter(|n| !n.trim().is_empty()) {
            let path = self.patterns.dir.join(name);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                debug!(?kind, path = %path.display(), "Custom clear pattern");
                return path;
            }
            warn!(?kind, path = %path.display(), "Custom clear pattern missing, using built-in");
        }
        self.builtin(kind)
    }

    /// Clear pattern to run before `next`, if any.
    pub async fn select(&self, mode: ClearMode, next: &Path) -> Option<PathBuf> {
        let kind = match mode {
            ClearMode::None => return None,
            ClearMode::ClearFromIn => ClearKind::FromIn,
            ClearMode::ClearFromOut => ClearKind::FromOut,
            ClearMode::ClearSideway => ClearKind::Sideway,
            ClearMode::Random => *ClearKind::ALL.choose(&mut rand::thread_rng())?,
            ClearMode::Adaptive => self.adaptive_kind(next).await,
        };
        Some(self.file_for(kind).await)
    }

    async fn adaptive_kind(&self, next: &Path) -> ClearKind {
        match self.cache.metadata(next).await {
            Ok(meta) => match meta.first {
                Some((_, rho)) if rho < 0.5 => ClearKind::FromOut,
                _ => ClearKind::FromIn,
            },
            Err(e) => {
                warn!(path = %next.display(), error = %e, "No metadata for adaptive clear");
                ClearKind::FromIn
            }
        }
    }
}
