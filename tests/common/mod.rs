#![allow(dead_code)]

use gradebox::corpus::generate::write_corpus;
use gradebox::corpus::DataLayout;
use std::path::{Path, PathBuf};

pub fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures")
}

/// A data root with the generated corpus and the example puzzles' reference transforms.
pub fn data_root_with_fixtures(root: &Path) -> DataLayout {
    let layout = DataLayout::new(root);
    write_corpus(&layout.corpus_dir(), false).unwrap();

    let level_dir = layout.puzzles_dir().join("examples").join("level_1");
    std::fs::create_dir_all(&level_dir).unwrap();
    let source = fixtures_dir().join("puzzles/examples/level_1");
    for entry in std::fs::read_dir(source).unwrap() {
        let entry = entry.unwrap();
        std::fs::copy(entry.path(), level_dir.join(entry.file_name())).unwrap();
    }
    layout
}

pub fn python3() -> Option<PathBuf> {
    ["/usr/bin/python3", "/usr/local/bin/python3", "/bin/python3"]
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Report a test that returns early because the host lacks something it needs.
pub fn skip(reason: &str) {
    let current = std::thread::current();
    eprintln!("SKIPPED {}: {}", current.name().unwrap_or("test"), reason);
}
