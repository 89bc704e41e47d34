//! Puzzle identifiers and the on-disk data layout.
//!
//! ```text
//! <data_root>/buffers/shared/{visible,hidden}_NN.bin
//! <data_root>/puzzles/<source>/level_<L>/transform_<P>.py
//! <data_root>/puzzles/<source>/level_<L>/{visible,hidden}_outputs_<P>.bin
//! ```

use crate::config::types::{GradeError, Result};
use crate::corpus::oracle::oracle_path;
use crate::corpus::CorpusSet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// `<source>_level_<L>_puzzle_<P>`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PuzzleId {
    pub source: String,
    pub level: u32,
    pub number: u32,
}

impl PuzzleId {
    pub fn new(source: impl Into<String>, level: u32, number: u32) -> Result<Self> {
        let source = source.into();
        if !is_source_token(&source) {
            return Err(GradeError::PuzzleNotFound(format!(
                "invalid puzzle source {:?}",
                source
            )));
        }
        Ok(Self {
            source,
            level,
            number,
        })
    }

    pub fn level_dir_name(&self) -> String {
        format!("level_{}", self.level)
    }
}

fn is_source_token(source: &str) -> bool {
    !source.is_empty()
        && source
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn parse_decimal(text: &str, what: &str, id: &str) -> Result<u32> {
    if text.is_empty() || !text.chars().all(|c| c.is_ascii_digit()) {
        return Err(GradeError::PuzzleNotFound(format!(
            "malformed {} in puzzle id {:?}",
            what, id
        )));
    }
    text.parse().map_err(|_| {
        GradeError::PuzzleNotFound(format!("{} out of range in puzzle id {:?}", what, id))
    })
}

impl FromStr for PuzzleId {
    type Err = GradeError;

    fn from_str(id: &str) -> Result<Self> {
        let parts: Vec<&str> = id.split('_').collect();
        match parts.as_slice() {
            [source, "level", level, "puzzle", number] => {
                let level = parse_decimal(level, "level", id)?;
                let number = parse_decimal(number, "puzzle number", id)?;
                PuzzleId::new(*source, level, number)
            }
            _ => Err(GradeError::PuzzleNotFound(format!(
                "puzzle id {:?} does not match <source>_level_<L>_puzzle_<P>",
                id
            ))),
        }
    }
}

impl std::fmt::Display for PuzzleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_level_{}_puzzle_{}",
            self.source, self.level, self.number
        )
    }
}

/// A puzzle resolved against the data root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PuzzleLocation {
    pub id: PuzzleId,
    /// `puzzles/<source>/level_<L>`
    pub dir: PathBuf,
}

impl PuzzleLocation {
    pub fn transform_path(&self) -> PathBuf {
        self.dir.join(format!("transform_{}.py", self.id.number))
    }

    pub fn oracle_path(&self, set: CorpusSet) -> PathBuf {
        oracle_path(&self.dir, set, self.id.number)
    }

    pub fn has_oracle(&self) -> bool {
        CorpusSet::ALL
            .iter()
            .all(|set| self.oracle_path(*set).is_file())
    }
}

/// One discovered puzzle and the state of its fixtures.
#[derive(Clone, Debug, Serialize)]
pub struct CatalogEntry {
    pub id: PuzzleId,
    pub has_reference: bool,
    pub has_oracle: bool,
}

/// Paths under a data root.
#[derive(Clone, Debug)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn corpus_dir(&self) -> PathBuf {
        self.root.join("buffers").join("shared")
    }

    pub fn puzzles_dir(&self) -> PathBuf {
        self.root.join("puzzles")
    }

    pub fn locate(&self, id: &PuzzleId) -> PuzzleLocation {
        PuzzleLocation {
            id: id.clone(),
            dir: self
                .puzzles_dir()
                .join(&id.source)
                .join(id.level_dir_name()),
        }
    }

    /// Resolve a puzzle whose oracle files are both present.
    pub fn resolve(&self, id: &PuzzleId) -> Result<PuzzleLocation> {
        let location = self.locate(id);
        if !location.dir.is_dir() {
            return Err(GradeError::PuzzleNotFound(format!("no such puzzle: {}", id)));
        }
        if !location.has_oracle() {
            return Err(GradeError::PuzzleNotFound(format!(
                "puzzle {} has no oracle outputs",
                id
            )));
        }
        Ok(location)
    }

    /// Resolve a puzzle by its trusted reference transform, oracle optional.
    pub fn resolve_reference(&self, id: &PuzzleId) -> Result<PuzzleLocation> {
        let location = self.locate(id);
        if !location.transform_path().is_file() {
            return Err(GradeError::PuzzleNotFound(format!(
                "puzzle {} has no reference transform",
                id
            )));
        }
        Ok(location)
    }

    /// Every `transform_<P>.py` or oracle pair under `puzzles/`, sorted by id.
    pub fn discover(&self) -> Result<Vec<CatalogEntry>> {
        let puzzles_dir = self.puzzles_dir();
        let mut ids = std::collections::BTreeSet::new();

        if !puzzles_dir.is_dir() {
            return Ok(Vec::new());
        }

        for source_entry in std::fs::read_dir(&puzzles_dir)? {
            let source_entry = source_entry?;
            let source = source_entry.file_name().to_string_lossy().to_string();
            if !source_entry.file_type()?.is_dir() || !is_source_token(&source) {
                continue;
            }

            for level_entry in std::fs::read_dir(source_entry.path())? {
                let level_entry = level_entry?;
                let level_name = level_entry.file_name().to_string_lossy().to_string();
                let level = match level_name
                    .strip_prefix("level_")
                    .and_then(|l| l.parse::<u32>().ok())
                {
                    Some(level) if level_entry.file_type()?.is_dir() => level,
                    _ => continue,
                };

                for file in std::fs::read_dir(level_entry.path())? {
                    let file_name = file?.file_name().to_string_lossy().to_string();
                    if let Some(number) = puzzle_number_from_file(&file_name) {
                        ids.insert(PuzzleId::new(source.clone(), level, number)?);
                    }
                }
            }
        }

        Ok(ids
            .into_iter()
            .map(|id| {
                let location = self.locate(&id);
                CatalogEntry {
                    has_reference: location.transform_path().is_file(),
                    has_oracle: location.has_oracle(),
                    id,
                }
            })
            .collect())
    }
}

fn puzzle_number_from_file(file_name: &str) -> Option<u32> {
    let stem = file_name.strip_suffix(".py").and_then(|s| s.strip_prefix("transform_"));
    let stem = stem.or_else(|| {
        file_name
            .strip_suffix(".bin")
            .and_then(|s| s.strip_prefix("visible_outputs_"))
    })?;
    stem.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_id() {
        let id: PuzzleId = "examples_level_1_puzzle_3".parse().unwrap();
        assert_eq!(id.source, "examples");
        assert_eq!(id.level, 1);
        assert_eq!(id.number, 3);
        assert_eq!(id.to_string(), "examples_level_1_puzzle_3");
    }

    #[test]
    fn rejects_malformed_ids() {
        for bad in [
            "",
            "examples",
            "examples_level_x_puzzle_3",
            "examples_level_1_puzzle_",
            "examples_level_1_puzzle_3_extra",
            "../etc_level_1_puzzle_1",
            "examples_stage_1_puzzle_1",
            "examples_level_-1_puzzle_1",
        ] {
            let err = bad.parse::<PuzzleId>().unwrap_err();
            assert!(matches!(err, GradeError::PuzzleNotFound(_)), "{}", bad);
        }
    }

    #[test]
    fn source_allows_dashes() {
        let id: PuzzleId = "bench-2024_level_10_puzzle_7".parse().unwrap();
        assert_eq!(id.source, "bench-2024");
        assert_eq!(id.level_dir_name(), "level_10");
    }

    #[test]
    fn resolve_requires_both_oracle_files() {
        let root = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(root.path());
        let id: PuzzleId = "examples_level_1_puzzle_2".parse().unwrap();

        assert!(layout.resolve(&id).is_err());

        let dir = root.path().join("puzzles/examples/level_1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("visible_outputs_2.bin"), b"").unwrap();
        assert!(layout.resolve(&id).is_err());

        std::fs::write(dir.join("hidden_outputs_2.bin"), b"").unwrap();
        let location = layout.resolve(&id).unwrap();
        assert_eq!(location.dir, dir);
    }

    #[test]
    fn discover_lists_transforms_and_oracles() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("puzzles/examples/level_1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("transform_1.py"), "").unwrap();
        std::fs::write(dir.join("transform_2.py"), "").unwrap();
        std::fs::write(dir.join("visible_outputs_2.bin"), b"").unwrap();
        std::fs::write(dir.join("hidden_outputs_2.bin"), b"").unwrap();
        std::fs::write(dir.join("notes.txt"), "").unwrap();
        std::fs::create_dir_all(root.path().join("puzzles/examples/drafts")).unwrap();

        let entries = DataLayout::new(root.path()).discover().unwrap();
        let ids: Vec<String> = entries.iter().map(|e| e.id.to_string()).collect();
        assert_eq!(
            ids,
            vec!["examples_level_1_puzzle_1", "examples_level_1_puzzle_2"]
        );
        assert!(!entries[0].has_oracle);
        assert!(entries[1].has_oracle && entries[1].has_reference);
    }
}
