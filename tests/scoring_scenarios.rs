//! Scoring against generated corpora and oracles.

use gradebox::corpus::generate::generate_corpus;
use gradebox::corpus::{Buffer, PuzzleOracle, CORPUS_SIZE};
use gradebox::outcome::RunOutputs;
use gradebox::scoring::{leaderboard_order, rank, score, ScoreRecord, SubmissionRecord};
use std::cmp::Ordering;

fn outputs_for(f: impl Fn(u8) -> u8, execution_time: f64) -> (RunOutputs, PuzzleOracle) {
    let corpus = generate_corpus().unwrap();
    let oracle = PuzzleOracle::from_transform(&corpus, |b| b.map(|x| x ^ 0xA5));
    let apply = |set: &[Buffer]| set.iter().map(|b| b.map(&f)).collect::<Vec<_>>();
    let outputs = RunOutputs::new(
        apply(corpus.visible()),
        apply(corpus.hidden()),
        execution_time,
    )
    .unwrap();
    (outputs, oracle)
}

#[test]
fn exact_transform_scores_full_marks() {
    let (outputs, oracle) = outputs_for(|x| x ^ 0xA5, 0.01);
    let record = score(&outputs, &oracle);
    assert_eq!(record.visible_correct, CORPUS_SIZE);
    assert_eq!(record.hidden_correct, CORPUS_SIZE);
    assert_eq!(record.total_score, 1.0);
}

#[test]
fn wrong_constant_scores_zero() {
    // x ^ 0x5A never equals x ^ 0xA5
    let (outputs, oracle) = outputs_for(|x| x ^ 0x5A, 0.01);
    let record = score(&outputs, &oracle);
    assert_eq!(record.visible_correct, 0);
    assert_eq!(record.hidden_correct, 0);
    assert_eq!(record.total_score, 0.0);
}

#[test]
fn identical_outputs_score_bit_identically() {
    let (outputs, oracle) = outputs_for(|x| if x < 0x80 { x ^ 0xA5 } else { x }, 0.2);
    let first = score(&outputs, &oracle);
    let second = score(&outputs, &oracle);
    assert_eq!(first.total_score.to_bits(), second.total_score.to_bits());
    assert_eq!(
        first.total_score,
        (first.visible_correct + first.hidden_correct) as f64 / (2.0 * CORPUS_SIZE as f64)
    );
}

#[test]
fn leaderboard_prefers_score_then_speed() {
    let fast_partial = ScoreRecord::from_counts(12, 12, 0.01);
    let slow_perfect = ScoreRecord::from_counts(24, 24, 0.9);
    let fast_perfect = ScoreRecord::from_counts(24, 24, 0.1);

    assert_eq!(leaderboard_order(&slow_perfect, &fast_partial), Ordering::Less);
    assert_eq!(leaderboard_order(&fast_perfect, &slow_perfect), Ordering::Less);

    let mut records = vec![
        SubmissionRecord::new("examples_level_1_puzzle_1", &fast_partial, "a"),
        SubmissionRecord::new("examples_level_1_puzzle_1", &slow_perfect, "bb"),
        SubmissionRecord::new("examples_level_1_puzzle_1", &fast_perfect, "ccc"),
    ];
    rank(&mut records);
    let lengths: Vec<usize> = records.iter().map(|r| r.code_length).collect();
    assert_eq!(lengths, vec![3, 2, 1]);
}
