use crate::config::types::{GradeError, Result};
use crate::corpus::{Buffer, CorpusSet, BUFFER_LEN, CORPUS_SIZE};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

/// The visible and hidden buffer sets, in corpus order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Corpus {
    visible: Vec<Buffer>,
    hidden: Vec<Buffer>,
}

impl Corpus {
    pub fn new(visible: Vec<Buffer>, hidden: Vec<Buffer>) -> Result<Self> {
        for (set, buffers) in [(CorpusSet::Visible, &visible), (CorpusSet::Hidden, &hidden)] {
            if buffers.len() != CORPUS_SIZE {
                return Err(GradeError::Corpus(format!(
                    "{} set must hold {} buffers, got {}",
                    set,
                    CORPUS_SIZE,
                    buffers.len()
                )));
            }
        }
        Ok(Self { visible, hidden })
    }

    /// Read `visible_01.bin ..` and `hidden_01.bin ..` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let visible = load_set(dir, CorpusSet::Visible)?;
        let hidden = load_set(dir, CorpusSet::Hidden)?;
        Self::new(visible, hidden)
    }

    /// Write every buffer file into `dir`, creating it if needed.
    pub fn write(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for set in CorpusSet::ALL {
            for (i, buffer) in self.set(set).iter().enumerate() {
                let path = dir.join(set.buffer_file_name(i + 1));
                std::fs::write(&path, buffer.as_bytes()).map_err(|e| {
                    GradeError::Corpus(format!("failed to write {}: {}", path.display(), e))
                })?;
            }
        }
        Ok(())
    }

    pub fn set(&self, set: CorpusSet) -> &[Buffer] {
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

    /// SHA-256 over both sets in corpus order, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for buffer in self.visible.iter().chain(self.hidden.iter()) {
            hasher.update(buffer.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Byte values that never occur anywhere in `set`.
    pub fn missing_byte_values(&self, set: CorpusSet) -> Vec<u8> {
        let mut seen = [false; 256];
        for buffer in self.set(set) {
            for &b in buffer.as_bytes() {
                seen[b as usize] = true;
            }
        }
        (0..=255u8).filter(|b| !seen[*b as usize]).collect()
    }
}

fn load_set(dir: &Path, set: CorpusSet) -> Result<Vec<Buffer>> {
    (1..=CORPUS_SIZE)
        .map(|position| {
            let path = dir.join(set.buffer_file_name(position));
            let bytes = std::fs::read(&path).map_err(|e| {
                GradeError::Corpus(format!("failed to read {}: {}", path.display(), e))
            })?;
            if bytes.len() != BUFFER_LEN {
                return Err(GradeError::Corpus(format!(
                    "{} holds {} bytes, expected {}",
                    path.display(),
                    bytes.len(),
                    BUFFER_LEN
                )));
            }
            Buffer::from_slice(&bytes)
        })
        .collect()
}

type CorpusCache = Mutex<HashMap<PathBuf, Arc<Corpus>>>;

static CORPUS_CACHE: OnceLock<CorpusCache> = OnceLock::new();

/// Process-wide corpus, loaded once per directory and never invalidated.
pub fn shared_corpus(dir: &Path) -> Result<Arc<Corpus>> {
    let key = dir.canonicalize().map_err(|e| {
        GradeError::Corpus(format!("corpus directory {} unavailable: {}", dir.display(), e))
    })?;

    let cache = CORPUS_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut entries = cache
        .lock()
        .map_err(|_| GradeError::Corpus("corpus cache lock poisoned".to_string()))?;

    if let Some(corpus) = entries.get(&key) {
        return Ok(Arc::clone(corpus));
    }

    let corpus = Arc::new(Corpus::load(&key)?);
    log::debug!(
        "corpus loaded from {} (fingerprint {})",
        key.display(),
        &corpus.fingerprint()[..16]
    );
    entries.insert(key, Arc::clone(&corpus));
    Ok(corpus)
}
