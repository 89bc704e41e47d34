//! Input corpus and reference outputs
//!
//! Fixed test buffers shared by every puzzle, the per-puzzle expected outputs,
//! and the on-disk layout that locates both.

pub mod buffer;
pub mod catalog;
pub mod generate;
pub mod oracle;
pub mod store;

pub use buffer::Buffer;
pub use catalog::{DataLayout, PuzzleId, PuzzleLocation};
pub use oracle::PuzzleOracle;
pub use store::{shared_corpus, Corpus};

use serde::{Deserialize, Serialize};

/// Length in bytes of every corpus buffer and every transform output.
pub const BUFFER_LEN: usize = 64;

/// Number of buffers in each corpus set.
pub const CORPUS_SIZE: usize = 24;

/// The two corpus sets, in grading order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorpusSet {
    Visible,
    Hidden,
}

impl CorpusSet {
    pub const ALL: [CorpusSet; 2] = [CorpusSet::Visible, CorpusSet::Hidden];

    pub fn prefix(self) -> &'static str {
        match self {
            CorpusSet::Visible => "visible",
            CorpusSet::Hidden => "hidden",
        }
    }

    /// File name of the 1-based `position` buffer, e.g. `visible_01.bin`.
    pub fn buffer_file_name(self, position: usize) -> String {
        format!("{}_{:02}.bin", self.prefix(), position)
    }
}

impl std::fmt::Display for CorpusSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}
