//! Data root layout: corpus generation, discovery and oracle files.

mod common;

use gradebox::corpus::generate::{generate_corpus, write_corpus, GenerateOutcome};
use gradebox::corpus::{
    shared_corpus, Corpus, CorpusSet, DataLayout, PuzzleId, PuzzleOracle, BUFFER_LEN, CORPUS_SIZE,
};
use gradebox::GradeError;

#[test]
fn generated_corpus_has_expected_shape() {
    let corpus = generate_corpus().unwrap();
    assert_eq!(corpus.visible().len(), CORPUS_SIZE);
    assert_eq!(corpus.hidden().len(), CORPUS_SIZE);
    assert!(corpus
        .visible()
        .iter()
        .chain(corpus.hidden())
        .all(|b| b.as_bytes().len() == BUFFER_LEN));
    assert_eq!(corpus.visible()[0].as_bytes(), &[0u8; BUFFER_LEN][..]);
    assert_eq!(corpus.visible()[1].as_bytes(), &[0xFFu8; BUFFER_LEN][..]);
    assert_eq!(generate_corpus().unwrap().fingerprint(), corpus.fingerprint());
}

#[test]
fn gen_corpus_is_idempotent_and_guards_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let corpus_dir = dir.path().join("buffers/shared");

    assert_eq!(write_corpus(&corpus_dir, false).unwrap(), GenerateOutcome::Written);
    assert_eq!(write_corpus(&corpus_dir, false).unwrap(), GenerateOutcome::Unchanged);

    std::fs::write(corpus_dir.join("hidden_07.bin"), [0x42u8; BUFFER_LEN]).unwrap();
    assert!(matches!(
        write_corpus(&corpus_dir, false),
        Err(GradeError::Corpus(_))
    ));
    assert_eq!(write_corpus(&corpus_dir, true).unwrap(), GenerateOutcome::Overwritten);
    assert_eq!(Corpus::load(&corpus_dir).unwrap(), generate_corpus().unwrap());
}

#[test]
fn short_corpus_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path(), false).unwrap();
    std::fs::write(dir.path().join("visible_24.bin"), [0u8; 63]).unwrap();
    assert!(Corpus::load(dir.path()).is_err());
}

#[test]
fn discovery_lists_fixture_puzzles() {
    let dir = tempfile::tempdir().unwrap();
    let layout = common::data_root_with_fixtures(dir.path());

    let entries = layout.discover().unwrap();
    let ids: Vec<String> = entries.iter().map(|e| e.id.to_string()).collect();
    assert_eq!(
        ids,
        (1..=5)
            .map(|p| format!("examples_level_1_puzzle_{}", p))
            .collect::<Vec<_>>()
    );
    assert!(entries.iter().all(|e| e.has_reference && !e.has_oracle));
}

#[test]
fn resolve_requires_both_oracle_files() {
    let dir = tempfile::tempdir().unwrap();
    let layout = common::data_root_with_fixtures(dir.path());
    let id: PuzzleId = "examples_level_1_puzzle_1".parse().unwrap();

    assert!(matches!(
        layout.resolve(&id),
        Err(GradeError::PuzzleNotFound(_))
    ));
    assert!(layout.resolve_reference(&id).is_ok());

    let corpus = shared_corpus(&layout.corpus_dir()).unwrap();
    let oracle = PuzzleOracle::from_transform(&corpus, |b| b.map(|x| x ^ 0xA5));
    let location = layout.locate(&id);
    oracle.write(&location.dir, id.number).unwrap();

    let resolved = layout.resolve(&id).unwrap();
    assert_eq!(PuzzleOracle::load(&resolved.dir, 1).unwrap(), oracle);
    let size = std::fs::metadata(resolved.oracle_path(CorpusSet::Hidden))
        .unwrap()
        .len();
    assert_eq!(size as usize, CORPUS_SIZE * BUFFER_LEN);

    let leftovers = std::fs::read_dir(&location.dir)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .contains(".tmp-")
        })
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn truncated_oracle_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let id = PuzzleId::new("examples", 2, 9).unwrap();
    let location = layout.locate(&id);
    std::fs::create_dir_all(&location.dir).unwrap();
    std::fs::write(location.oracle_path(CorpusSet::Visible), vec![0u8; CORPUS_SIZE * BUFFER_LEN]).unwrap();
    std::fs::write(location.oracle_path(CorpusSet::Hidden), vec![0u8; 100]).unwrap();

    assert!(PuzzleOracle::load(&location.dir, 9).is_err());
}
