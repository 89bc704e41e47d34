// End-to-end grading latency: provisioning, sandbox launch, runner, scoring.
// Runs isolated when root, degraded otherwise. Skips when python3 is missing.

use gradebox::corpus::generate::write_corpus;
use gradebox::corpus::{shared_corpus, DataLayout, PuzzleId, PuzzleOracle};
use gradebox::{Controller, GradeConfig};
use std::path::Path;
use std::time::{Duration, Instant};

const ITERATIONS: usize = 30;
const WARMUP_ITERATIONS: usize = 3;

const SUBMISSION: &str = "def transform(b):\n    return bytes(x ^ 0xA5 for x in b)\n";

struct LatencyStats {
    p50: Duration,
    p95: Duration,
    min: Duration,
    max: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();
        let sum: Duration = samples.iter().sum();

        Self {
            p50: samples[len / 2],
            p95: samples[(len as f64 * 0.95) as usize],
            min: samples[0],
            max: samples[len - 1],
            mean: sum / len as u32,
        }
    }

    fn print(&self, label: &str) {
        println!("\n{}", label);
        println!("  p50: {:?}", self.p50);
        println!("  p95: {:?}", self.p95);
        println!("  min: {:?}", self.min);
        println!("  max: {:?}", self.max);
        println!("  mean: {:?}", self.mean);
    }
}

fn prepare_data_root(root: &Path) -> String {
    let layout = DataLayout::new(root);
    write_corpus(&layout.corpus_dir(), false).expect("corpus");
    let corpus = shared_corpus(&layout.corpus_dir()).expect("load corpus");

    let id = PuzzleId::new("bench", 1, 1).expect("puzzle id");
    let location = layout.locate(&id);
    std::fs::create_dir_all(&location.dir).expect("puzzle dir");
    PuzzleOracle::from_transform(&corpus, |buffer| buffer.map(|b| b ^ 0xA5))
        .write(&location.dir, id.number)
        .expect("oracle");
    id.to_string()
}

fn main() {
    let python = Path::new("/usr/bin/python3");
    if !python.exists() {
        println!("python3 not found at {}; skipping", python.display());
        return;
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let puzzle = prepare_data_root(dir.path());
    let config = GradeConfig {
        data_root: dir.path().to_path_buf(),
        runtime_root: dir.path().join("runs"),
        allow_degraded: true,
        strict_mode: false,
        ..GradeConfig::default()
    };
    let controller = Controller::new(config).expect("controller");

    println!("=== gradebox grade latency ({:?}) ===", controller.launch_mode());
    println!("Iterations: {} (after {} warmup)", ITERATIONS, WARMUP_ITERATIONS);

    for _ in 0..WARMUP_ITERATIONS {
        let _ = controller.grade(&puzzle, SUBMISSION);
    }

    let mut samples = Vec::with_capacity(ITERATIONS);
    let mut failures = 0;
    for _ in 0..ITERATIONS {
        let start = Instant::now();
        let report = controller.grade(&puzzle, SUBMISSION);
        samples.push(start.elapsed());
        if !report.score.map(|s| s.is_perfect()).unwrap_or(false) {
            failures += 1;
        }
    }

    LatencyStats::from_samples(samples).print("Perfect XOR submission");
    if failures > 0 {
        println!("\n{} of {} runs did not score perfectly", failures, ITERATIONS);
    }
}
