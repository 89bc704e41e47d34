//! Scoring of run outputs against a puzzle oracle.
//!
//! Exact byte equality per buffer, no partial credit. Scores are derived from
//! integer counts with a single division each, so identical outputs always
//! produce bit-identical scores.

use crate::corpus::{Buffer, PuzzleOracle, CORPUS_SIZE};
use crate::outcome::RunOutputs;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub visible_score: f64,
    pub hidden_score: f64,
    pub total_score: f64,
    pub execution_time: f64,
    pub visible_correct: usize,
    pub hidden_correct: usize,
}

impl ScoreRecord {
    pub fn from_counts(visible_correct: usize, hidden_correct: usize, execution_time: f64) -> Self {
        let n = CORPUS_SIZE as f64;
        Self {
            visible_score: visible_correct as f64 / n,
            hidden_score: hidden_correct as f64 / n,
            total_score: (visible_correct + hidden_correct) as f64 / (2.0 * n),
            execution_time,
            visible_correct,
            hidden_correct,
        }
    }

    pub fn is_perfect(&self) -> bool {
        self.visible_correct == CORPUS_SIZE && self.hidden_correct == CORPUS_SIZE
    }
}

/// Number of positions where `produced` and `expected` are byte-identical.
pub fn count_matches(produced: &[Buffer], expected: &[Buffer]) -> usize {
    produced
        .iter()
        .zip(expected.iter())
        .filter(|(a, b)| a == b)
        .count()
}

pub fn score(outputs: &RunOutputs, oracle: &PuzzleOracle) -> ScoreRecord {
    ScoreRecord::from_counts(
        count_matches(&outputs.visible, oracle.visible()),
        count_matches(&outputs.hidden, oracle.hidden()),
        outputs.execution_time,
    )
}

/// Leaderboard order: higher `total_score` first, then faster `execution_time`.
pub fn leaderboard_order(a: &ScoreRecord, b: &ScoreRecord) -> Ordering {
    b.total_score
        .total_cmp(&a.total_score)
        .then_with(|| a.execution_time.total_cmp(&b.execution_time))
}

/// What the collaborator persists for one graded submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub puzzle_id: String,
    pub visible_score: f64,
    pub hidden_score: f64,
    pub total_score: f64,
    pub execution_time: f64,
    pub code_length: usize,
    pub timestamp: DateTime<Utc>,
}

impl SubmissionRecord {
    pub fn new(puzzle_id: impl Into<String>, score: &ScoreRecord, source: &str) -> Self {
        Self {
            puzzle_id: puzzle_id.into(),
            visible_score: score.visible_score,
            hidden_score: score.hidden_score,
            total_score: score.total_score,
            execution_time: score.execution_time,
            code_length: source.chars().count(),
            timestamp: Utc::now(),
        }
    }

    pub fn score(&self) -> ScoreRecord {
        let n = CORPUS_SIZE as f64;
        ScoreRecord {
            visible_score: self.visible_score,
            hidden_score: self.hidden_score,
            total_score: self.total_score,
            execution_time: self.execution_time,
            visible_correct: (self.visible_score * n).round() as usize,
            hidden_correct: (self.hidden_score * n).round() as usize,
        }
    }
}

/// Sort submissions into leaderboard order.
pub fn rank(records: &mut [SubmissionRecord]) {
    records.sort_by(|a, b| leaderboard_order(&a.score(), &b.score()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs(visible: Vec<Buffer>, hidden: Vec<Buffer>) -> RunOutputs {
        RunOutputs::new(visible, hidden, 0.5).unwrap()
    }

    #[test]
    fn perfect_outputs_score_one() {
        let expected = vec![Buffer::filled(7); CORPUS_SIZE];
        let oracle = PuzzleOracle::new(expected.clone(), expected.clone()).unwrap();
        let record = score(&outputs(expected.clone(), expected), &oracle);
        assert_eq!(record.visible_score, 1.0);
        assert_eq!(record.hidden_score, 1.0);
        assert_eq!(record.total_score, 1.0);
        assert!(record.is_perfect());
    }

    #[test]
    fn single_byte_difference_misses_buffer() {
        let expected = vec![Buffer::filled(7); CORPUS_SIZE];
        let oracle = PuzzleOracle::new(expected.clone(), expected.clone()).unwrap();

        let mut produced = expected.clone();
        let mut bytes = [7u8; 64];
        bytes[63] = 8;
        produced[5] = Buffer::new(bytes);

        let record = score(&outputs(produced, expected), &oracle);
        assert_eq!(record.visible_correct, CORPUS_SIZE - 1);
        assert_eq!(record.hidden_correct, CORPUS_SIZE);
        assert_eq!(record.visible_score, 23.0 / 24.0);
        assert_eq!(record.total_score, 47.0 / 48.0);
    }

    #[test]
    fn counts_are_independent_per_set() {
        let record = ScoreRecord::from_counts(12, 6, 0.1);
        assert_eq!(record.visible_score, 0.5);
        assert_eq!(record.hidden_score, 0.25);
        assert_eq!(record.total_score, 18.0 / 48.0);
    }

    #[test]
    fn leaderboard_prefers_score_then_speed() {
        let slow_perfect = ScoreRecord::from_counts(24, 24, 0.9);
        let fast_perfect = ScoreRecord::from_counts(24, 24, 0.1);
        let fast_partial = ScoreRecord::from_counts(24, 20, 0.01);

        let mut records = [fast_partial.clone(), slow_perfect.clone(), fast_perfect.clone()];
        records.sort_by(leaderboard_order);
        assert_eq!(records, [fast_perfect, slow_perfect, fast_partial]);
    }

    #[test]
    fn rank_orders_submission_records() {
        let a = SubmissionRecord::new("p", &ScoreRecord::from_counts(10, 10, 0.2), "x");
        let b = SubmissionRecord::new("p", &ScoreRecord::from_counts(24, 24, 0.3), "xy");
        let c = SubmissionRecord::new("p", &ScoreRecord::from_counts(24, 24, 0.1), "xyz");
        let mut records = vec![a, b, c];
        rank(&mut records);
        let lengths: Vec<usize> = records.iter().map(|r| r.code_length).collect();
        assert_eq!(lengths, vec![3, 2, 1]);
    }
}
