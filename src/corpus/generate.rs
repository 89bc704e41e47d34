//! Deterministic corpus generation.
//!
//! The visible set is built from hand-picked patterns that make a transform's
//! behavior easy to read off (uniform fills, single-byte flips, ramps, bit
//! patterns). The hidden set uses arithmetic sequences, short repeating
//! patterns and text prefixes, padded with seeded random bytes.

use crate::config::types::{GradeError, Result};
use crate::corpus::{Buffer, Corpus, BUFFER_LEN, CORPUS_SIZE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

const VISIBLE_SEED: u64 = 4;
const HIDDEN_SEED: u64 = 1337;

/// What `write_corpus` did on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateOutcome {
    Written,
    Unchanged,
    Overwritten,
}

pub fn generate_corpus() -> Result<Corpus> {
    Corpus::new(visible_buffers(), hidden_buffers())
}

/// Generate the corpus into `dir`. An existing corpus with different content
/// is only replaced when `force` is set.
pub fn write_corpus(dir: &Path, force: bool) -> Result<GenerateOutcome> {
    let corpus = generate_corpus()?;
    let existing = dir.join("visible_01.bin").exists();

    if existing {
        match Corpus::load(dir) {
            Ok(current) if current == corpus => return Ok(GenerateOutcome::Unchanged),
            Ok(_) | Err(_) if !force => {
                return Err(GradeError::Corpus(format!(
                    "{} already holds a different corpus; pass --force to replace it",
                    dir.display()
                )))
            }
            _ => {}
        }
    }

    corpus.write(dir)?;
    log::info!(
        "corpus written to {} (fingerprint {})",
        dir.display(),
        corpus.fingerprint()
    );
    Ok(if existing {
        GenerateOutcome::Overwritten
    } else {
        GenerateOutcome::Written
    })
}

fn random_buffer(rng: &mut StdRng) -> Buffer {
    Buffer::from_fn(|_| rng.gen())
}

fn with_first_byte(fill: u8, first: u8) -> Buffer {
    Buffer::from_fn(|i| if i == 0 { first } else { fill })
}

fn text_buffer(text: &str, tail: impl FnMut(usize) -> u8) -> Buffer {
    let encoded = text.as_bytes();
    let mut tail = tail;
    Buffer::from_fn(|i| if i < encoded.len() { encoded[i] } else { tail(i) })
}

fn visible_buffers() -> Vec<Buffer> {
    let mut buffers = vec![Buffer::filled(0x00), Buffer::filled(0xFF)];

    for first in [0x01, 0x02, 0x80, 0xAA] {
        buffers.push(with_first_byte(0x00, first));
    }
    for first in [0x00, 0xF0, 0x0F, 0x55] {
        buffers.push(with_first_byte(0xFF, first));
    }

    buffers.push(Buffer::from_fn(|i| i as u8));
    buffers.push(Buffer::from_fn(|i| 0xFF - i as u8));

    buffers.push(Buffer::from_fn(|i| if i % 2 == 0 { 0xAA } else { 0x55 }));
    buffers.push(Buffer::from_fn(|i| if i % 2 == 0 { 0x55 } else { 0xAA }));

    buffers.push(Buffer::filled(0xF0));
    buffers.push(Buffer::filled(0x0F));

    buffers.push(Buffer::from_fn(|i| 1u8 << (i / 8)));

    let greeting = b"Hello, World! ";
    buffers.push(Buffer::from_fn(|i| greeting[i % greeting.len()]));

    let mut fib = [0u8; BUFFER_LEN];
    fib[0] = 1;
    fib[1] = 1;
    for i in 2..BUFFER_LEN {
        fib[i] = fib[i - 1].wrapping_add(fib[i - 2]);
    }
    buffers.push(Buffer::new(fib));

    let mut rng = StdRng::seed_from_u64(VISIBLE_SEED);
    while buffers.len() < CORPUS_SIZE {
        buffers.push(random_buffer(&mut rng));
    }
    buffers
}

fn hidden_buffers() -> Vec<Buffer> {
    let mut rng = StdRng::seed_from_u64(HIDDEN_SEED);
    let mut buffers = vec![
        Buffer::from_fn(|x| (x ^ (x >> 4)) as u8),
        Buffer::from_fn(|x| ((x * 7 + 13) % 256) as u8),
        Buffer::from_fn(|x| ((x * x) % 256) as u8),
        Buffer::from_fn(|x| pow_mod(3, x as u32, 256) as u8),
    ];

    for _ in 0..4 {
        let period = rng.gen_range(2..=8usize);
        let pattern: Vec<u8> = (0..period).map(|_| rng.gen()).collect();
        buffers.push(Buffer::from_fn(|i| pattern[i % period]));
    }

    for _ in 0..4 {
        buffers.push(Buffer::from_fn(|i| {
            let step = rng.gen_range(1..=7usize);
            let offset = rng.gen_range(0..=255usize);
            ((i * step + offset) % 256) as u8
        }));
    }

    for text in ["Test 123!", "Python<>", "0xCAFE :)", "Binary..."] {
        buffers.push(text_buffer(text, |_| rng.gen()));
    }

    while buffers.len() < CORPUS_SIZE {
        buffers.push(random_buffer(&mut rng));
    }
    buffers
}

fn pow_mod(base: u32, exp: u32, modulus: u32) -> u32 {
    let mut result = 1u32;
    let mut base = base % modulus;
    let mut exp = exp;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result * base % modulus;
        }
        base = base * base % modulus;
        exp >>= 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_is_deterministic() {
        let first = generate_corpus().unwrap();
        let second = generate_corpus().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn visible_patterns_are_in_place() {
        let corpus = generate_corpus().unwrap();
        let visible = corpus.visible();
        assert_eq!(visible.len(), CORPUS_SIZE);
        assert_eq!(visible[0], Buffer::filled(0x00));
        assert_eq!(visible[1], Buffer::filled(0xFF));
        assert_eq!(visible[4].as_bytes()[0], 0x80);
        assert_eq!(visible[10].as_bytes()[63], 0x3F);
        assert_eq!(visible[11].as_bytes()[0], 0xFF);
        assert_eq!(visible[11].as_bytes()[63], 0xC0);
        assert_eq!(visible[16].as_bytes()[8], 0x02);
        assert_eq!(visible[16].as_bytes()[63], 0x80);
        assert_eq!(&visible[17].as_bytes()[..5], b"Hello");
        assert_eq!(&visible[18].as_bytes()[..6], &[1, 1, 2, 3, 5, 8]);
    }

    #[test]
    fn hidden_patterns_are_in_place() {
        let corpus = generate_corpus().unwrap();
        let hidden = corpus.hidden();
        assert_eq!(hidden.len(), CORPUS_SIZE);
        assert_eq!(hidden[0].as_bytes()[17], (17 ^ 1) as u8);
        assert_eq!(hidden[1].as_bytes()[0], 13);
        assert_eq!(hidden[2].as_bytes()[20], (400 % 256) as u8);
        assert_eq!(&hidden[3].as_bytes()[..5], &[1, 3, 9, 27, 81]);
        assert_eq!(&hidden[12].as_bytes()[..9], b"Test 123!");
        assert_eq!(&hidden[15].as_bytes()[..9], b"Binary...");
    }

    #[test]
    fn pow_mod_matches_naive() {
        let mut naive = 1u32;
        for exp in 0..64 {
            assert_eq!(pow_mod(3, exp, 256), naive);
            naive = naive * 3 % 256;
        }
    }

    #[test]
    fn write_is_idempotent_and_guards_foreign_corpus() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(write_corpus(dir.path(), false).unwrap(), GenerateOutcome::Written);
        assert_eq!(write_corpus(dir.path(), false).unwrap(), GenerateOutcome::Unchanged);

        std::fs::write(dir.path().join("hidden_03.bin"), [0u8; BUFFER_LEN]).unwrap();
        assert!(write_corpus(dir.path(), false).is_err());
        assert_eq!(write_corpus(dir.path(), true).unwrap(), GenerateOutcome::Overwritten);
        assert_eq!(
            Corpus::load(dir.path()).unwrap(),
            generate_corpus().unwrap()
        );
    }
}
