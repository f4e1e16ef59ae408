//! Playlist sequencing.
//!
//! A playlist pass is one concrete, ordered list of files: each main pattern
//! optionally preceded by its clear pattern. Shuffling works on whole
//! (clear, main) pairs, so a clear pattern always stays directly in front of
//! the pattern it was chosen for.

use crate::clear::{ClearMode, ClearSelector};
use crate::pattern::resolve_pattern_path;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use table_core::TableError;

/// Repeat behaviour of a playlist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Run the built sequence once.
    #[default]
    Single,
    /// Loop until stopped, reshuffling every pass when shuffle is on.
    Indefinite,
}

impl RunMode {
    /// Name published in the session record.
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Single => "single",
            RunMode::Indefinite => "indefinite",
        }
    }
}

impl FromStr for RunMode {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(RunMode::Single),
            "indefinite" => Ok(RunMode::Indefinite),
            other => Err(TableError::Config(format!("unknown run mode '{}'", other))),
        }
    }
}

/// Run parameters supplied by whoever starts the playlist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaylistOptions {
    /// Playlist name, published in status.
    pub name: String,
    /// Main pattern files, relative to the pattern directory or absolute.
    pub files: Vec<String>,
    /// Sleep between consecutive main patterns.
    pub pause_time: Duration,
    /// Clear pattern policy.
    pub clear_mode: ClearMode,
    /// Repeat behaviour.
    pub run_mode: RunMode,
    /// Shuffle (clear, main) pairs each pass.
    pub shuffle: bool,
}

/// Role of a sequence entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// A pattern from the playlist.
    Main,
    /// A clear pattern inserted before a main pattern.
    Clear,
}

/// One file of a built pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceEntry {
    /// Resolved file.
    pub path: PathBuf,
    /// Main or clear.
    pub kind: EntryKind,
}

impl SequenceEntry {
    /// Display name published in the session record.
    pub fn label(&self) -> String {
        self.path.display().to_string()
    }
}

/// Build one pass: optional shuffle of the main patterns, then a clear
/// pattern inserted in front of each.
pub async fn build_sequence(
    options: &PlaylistOptions,
    pattern_dir: &Path,
    selector: &ClearSelector<'_>,
) -> Vec<SequenceEntry> {
    let mut mains: Vec<PathBuf> = options
        .files
        .iter()
        .map(|f| resolve_pattern_path(pattern_dir, f))
        .collect();
    if options.shuffle {
        mains.shuffle(&mut rand::thread_rng());
    }

    let mut sequence = Vec::with_capacity(mains.len() * 2);
    for main in mains {
        if let Some(clear) = selector.select(options.clear_mode, &main).await {
            sequence.push(SequenceEntry {
                path: clear,
                kind: EntryKind::Clear,
            });
        }
        sequence.push(SequenceEntry {
            path: main,
            kind: EntryKind::Main,
        });
    }
    sequence
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MetadataCache;
    use table_core::settings::PatternSettings;
    use table_core::TableType;

    fn options(files: &[&str]) -> PlaylistOptions {
        PlaylistOptions {
            name: "evening".to_string(),
            files: files.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn run_mode_names() {
        assert_eq!("Indefinite".parse::<RunMode>().unwrap(), RunMode::Indefinite);
        assert_eq!(RunMode::Single.as_str(), "single");
        assert!("twice".parse::<RunMode>().is_err());
    }

    #[tokio::test]
    async fn no_clear_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let patterns = PatternSettings {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let cache = MetadataCache::new();
        let selector = ClearSelector::new(&patterns, TableType::DuneWeaver, &cache);

        let seq = build_sequence(&options(&["a.thr", "b.thr"]), dir.path(), &selector).await;
        let names: Vec<_> = seq.iter().map(|e| e.path.clone()).collect();
        assert_eq!(
            names,
            vec![dir.path().join("a.thr"), dir.path().join("b.thr")]
        );
        assert!(seq.iter().all(|e| e.kind == EntryKind::Main));
    }

    #[tokio::test]
    async fn shuffle_preserves_clear_main_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let patterns = PatternSettings {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let cache = MetadataCache::new();
        let selector = ClearSelector::new(&patterns, TableType::DuneWeaver, &cache);

        let files: Vec<String> = (0..8).map(|i| format!("p{}.thr", i)).collect();
        let refs: Vec<&str> = files.iter().map(String::as_str).collect();
        let mut opts = options(&refs);
        opts.shuffle = true;
        opts.clear_mode = ClearMode::ClearFromIn;

        for _ in 0..10 {
            let seq = build_sequence(&opts, dir.path(), &selector).await;
            assert_eq!(seq.len(), 16);
            for pair in seq.chunks(2) {
                assert_eq!(pair[0].kind, EntryKind::Clear);
                assert_eq!(pair[0].path, dir.path().join("clear_from_in.thr"));
                assert_eq!(pair[1].kind, EntryKind::Main);
            }
            let mut mains: Vec<_> = seq
                .iter()
                .filter(|e| e.kind == EntryKind::Main)
                .map(|e| e.path.clone())
                .collect();
            mains.sort();
            let mut expected: Vec<_> = files.iter().map(|f| dir.path().join(f)).collect();
            expected.sort();
            assert_eq!(mains, expected);
        }
    }
}
