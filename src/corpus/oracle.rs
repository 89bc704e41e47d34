use crate::config::types::{GradeError, Result};
use crate::corpus::{Buffer, Corpus, CorpusSet, BUFFER_LEN, CORPUS_SIZE};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Expected outputs of one puzzle, aligned with corpus order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PuzzleOracle {
    visible: Vec<Buffer>,
    hidden: Vec<Buffer>,
}

/// `visible_outputs_<P>.bin` / `hidden_outputs_<P>.bin`
pub fn oracle_file_name(set: CorpusSet, puzzle_number: u32) -> String {
    format!("{}_outputs_{}.bin", set.prefix(), puzzle_number)
}

pub fn oracle_path(dir: &Path, set: CorpusSet, puzzle_number: u32) -> PathBuf {
    dir.join(oracle_file_name(set, puzzle_number))
}

impl PuzzleOracle {
    pub fn new(visible: Vec<Buffer>, hidden: Vec<Buffer>) -> Result<Self> {
        for (set, outputs) in [(CorpusSet::Visible, &visible), (CorpusSet::Hidden, &hidden)] {
            if outputs.len() != CORPUS_SIZE {
                return Err(GradeError::Oracle(format!(
                    "{} oracle must hold {} outputs, got {}",
                    set,
                    CORPUS_SIZE,
                    outputs.len()
                )));
            }
        }
        Ok(Self { visible, hidden })
    }

    /// Expected outputs of an in-process bytewise reference.
    pub fn from_transform(corpus: &Corpus, f: impl Fn(&Buffer) -> Buffer) -> Self {
        Self {
            visible: corpus.visible().iter().map(&f).collect(),
            hidden: corpus.hidden().iter().map(&f).collect(),
        }
    }

    /// Read both oracle files of puzzle `puzzle_number` from `dir`.
    pub fn load(dir: &Path, puzzle_number: u32) -> Result<Self> {
        let visible = load_outputs(&oracle_path(dir, CorpusSet::Visible, puzzle_number))?;
        let hidden = load_outputs(&oracle_path(dir, CorpusSet::Hidden, puzzle_number))?;
        Self::new(visible, hidden)
    }

    /// Write both oracle files. Each lands via a temp file and rename, so a
    /// reader never observes a half-written oracle.
    pub fn write(&self, dir: &Path, puzzle_number: u32) -> Result<()> {
        for set in CorpusSet::ALL {
            let target = oracle_path(dir, set, puzzle_number);
            let staging = dir.join(format!(
                ".{}.tmp-{}",
                oracle_file_name(set, puzzle_number),
                uuid::Uuid::new_v4()
            ));

            let mut data = Vec::with_capacity(CORPUS_SIZE * BUFFER_LEN);
            for buffer in self.expected(set) {
                data.extend_from_slice(buffer.as_bytes());
            }

            let write_staged = || -> std::io::Result<()> {
                let mut file = std::fs::File::create(&staging)?;
                file.write_all(&data)?;
                file.sync_all()?;
                std::fs::rename(&staging, &target)
            };

            if let Err(e) = write_staged() {
                let _ = std::fs::remove_file(&staging);
                return Err(GradeError::Oracle(format!(
                    "failed to write {}: {}",
                    target.display(),
                    e
                )));
            }
        }
        Ok(())
    }

    pub fn expected(&self, set: CorpusSet) -> &[Buffer] {
        match set {
            CorpusSet::Visible => &self.visible,
            CorpusSet::Hidden => &self.hidden,
        }
    }

    pub fn visible(&self) -> &[Buffer] {
        &self.visible
    }

    pub fn hidden(&self) -> &[Buffer] {
        &self.hidden
    }
}

fn load_outputs(path: &Path) -> Result<Vec<Buffer>> {
    let data = std::fs::read(path)
        .map_err(|e| GradeError::Oracle(format!("failed to read {}: {}", path.display(), e)))?;
    if data.len() != CORPUS_SIZE * BUFFER_LEN {
        return Err(GradeError::Oracle(format!(
            "{} holds {} bytes, expected {}",
            path.display(),
            data.len(),
            CORPUS_SIZE * BUFFER_LEN
        )));
    }
    data.chunks_exact(BUFFER_LEN).map(Buffer::from_slice).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::generate::generate_corpus;

    #[test]
    fn write_then_load_returns_same_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = generate_corpus().unwrap();
        let oracle = PuzzleOracle::from_transform(&corpus, |b| b.map(|x| x ^ 0xA5));

        oracle.write(dir.path(), 1).unwrap();
        let size = std::fs::metadata(dir.path().join("visible_outputs_1.bin"))
            .unwrap()
            .len();
        assert_eq!(size as usize, CORPUS_SIZE * BUFFER_LEN);
        assert_eq!(PuzzleOracle::load(dir.path(), 1).unwrap(), oracle);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn load_rejects_short_oracle_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("visible_outputs_2.bin"), vec![0u8; 64 * 20]).unwrap();
        std::fs::write(
            dir.path().join("hidden_outputs_2.bin"),
            vec![0u8; CORPUS_SIZE * BUFFER_LEN],
        )
        .unwrap();
        let err = PuzzleOracle::load(dir.path(), 2).unwrap_err();
        assert!(matches!(err, GradeError::Oracle(_)));
    }

    #[test]
    fn new_rejects_wrong_count() {
        assert!(PuzzleOracle::new(vec![Buffer::filled(0); CORPUS_SIZE], vec![]).is_err());
    }
}
