use crate::config::types::{GradeConfig, GradeError};
use crate::controller::{read_source, Controller, GradeReport, LaunchMode};
use crate::corpus::generate::{write_corpus, GenerateOutcome};
use crate::corpus::{shared_corpus, CorpusSet, DataLayout, PuzzleOracle};
use crate::outcome::ExecutionResult;
use crate::scoring::{rank, SubmissionRecord};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Process exit statuses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Exit {
    Success = 0,
    /// A graded failure, or a command that could not complete
    Failure = 1,
    Config = 2,
}

#[derive(Parser)]
#[command(author, version, about = "Sandboxed grading of byte-transform submissions", long_about = None)]
struct Cli {
    /// JSON config file (defaults to ./gradebox.json when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Data root holding buffers/shared and puzzles/
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,
    /// Run without namespace isolation when isolation is unavailable. Implies non-strict mode.
    #[arg(long, global = true)]
    allow_degraded: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade one or more submissions against a puzzle
    Grade {
        /// Puzzle id, e.g. examples_level_1_puzzle_1
        #[arg(long)]
        puzzle: String,
        /// Submission file, or - for stdin. Repeat to grade several in turn.
        #[arg(long, required = true)]
        source: Vec<PathBuf>,
    },
    /// Write the shared input corpus under the data root
    GenCorpus {
        /// Replace an existing corpus with different content
        #[arg(long)]
        force: bool,
    },
    /// Run a puzzle's reference transform and write its oracle files
    BuildOracle {
        #[arg(long)]
        puzzle: String,
    },
    /// Verify the corpus and every discovered puzzle's fixtures
    Check,
}

/// Parse arguments, run the command and map the outcome to an exit status.
pub fn run() -> i32 {
    env_logger::init();

    if let Err(e) = crate::kernel::signal::install_shutdown_handlers() {
        log::warn!("{}", e);
    }

    let cli = Cli::parse();
    let exit = match execute(cli) {
        Ok(exit) => exit,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            if is_config_error(&e) {
                Exit::Config
            } else {
                Exit::Failure
            }
        }
    };
    exit as i32
}

fn is_config_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<GradeError>(),
            Some(GradeError::Config(_))
        )
    })
}

fn load_config(cli: &Cli) -> Result<GradeConfig> {
    let mut config = match &cli.config {
        Some(path) => GradeConfig::load_from_file(path)?,
        None => GradeConfig::load_default()?,
    };

    if let Some(data_root) = &cli.data_root {
        config.data_root = data_root.clone();
    }
    if cli.allow_degraded {
        config.allow_degraded = true;
        config.strict_mode = false;
    }

    crate::observability::audit::init_audit_logger(config.audit_log_path.clone())
        .context("audit log unavailable")?;
    Ok(config)
}

fn execute(cli: Cli) -> Result<Exit> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Grade { puzzle, source } => grade(config, &puzzle, &source),
        Commands::GenCorpus { force } => gen_corpus(&config, force),
        Commands::BuildOracle { puzzle } => {
            let controller = Controller::new(config)?;
            let oracle = controller
                .build_oracle(&puzzle)
                .with_context(|| format!("building oracle for {}", puzzle))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "puzzle_id": puzzle,
                    "visible_outputs": oracle.visible().len(),
                    "hidden_outputs": oracle.hidden().len(),
                }))?
            );
            Ok(Exit::Success)
        }
        Commands::Check => check(config),
    }
}

fn grade(config: GradeConfig, puzzle: &str, sources: &[PathBuf]) -> Result<Exit> {
    let controller = Controller::new(config)?;
    if let LaunchMode::Unavailable(reason) = controller.launch_mode() {
        eprintln!("Warning: {}; pass --allow-degraded for development runs", reason);
    }

    let mut reports = Vec::new();
    let mut records = Vec::new();
    for path in sources {
        let source = read_source(path)
            .with_context(|| format!("reading submission {}", path.display()))?;
        let report = controller.grade(puzzle, &source);
        if let Some(score) = &report.score {
            records.push(SubmissionRecord::new(report.puzzle_id.clone(), score, &source));
        }
        reports.push(report);
    }

    let all_succeeded = reports
        .iter()
        .all(|r| matches!(r.result, ExecutionResult::Success(_)));

    if let [report] = reports.as_slice() {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        rank(&mut records);
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "results": reports.iter().map(summary).collect::<Vec<_>>(),
                "leaderboard": records,
            }))?
        );
    }

    Ok(if all_succeeded { Exit::Success } else { Exit::Failure })
}

fn summary(report: &GradeReport) -> serde_json::Value {
    serde_json::json!({
        "result": report.result,
        "score": report.score,
    })
}

fn gen_corpus(config: &GradeConfig, force: bool) -> Result<Exit> {
    let dir = config.corpus_dir();
    let outcome = write_corpus(&dir, force)?;
    let verb = match outcome {
        GenerateOutcome::Written => "written",
        GenerateOutcome::Unchanged => "already up to date",
        GenerateOutcome::Overwritten => "replaced",
    };
    eprintln!("Corpus {} at {}", verb, dir.display());
    Ok(Exit::Success)
}

fn check(config: GradeConfig) -> Result<Exit> {
    crate::config::validator::validate_config(&config)?;
    let layout = DataLayout::new(config.data_root.clone());
    let mut problems = 0usize;

    match shared_corpus(&layout.corpus_dir()) {
        Ok(corpus) => {
            let missing = corpus.missing_byte_values(CorpusSet::Visible);
            println!(
                "corpus: ok (fingerprint {}, visible covers {}/256 byte values)",
                &corpus.fingerprint()[..16],
                256 - missing.len()
            );
            if !missing.is_empty() {
                let listed: Vec<String> = missing.iter().map(|b| format!("{:02x}", b)).collect();
                println!("  missing from visible: {}", listed.join(" "));
            }
        }
        Err(e) => {
            problems += 1;
            println!("corpus: {}", e);
        }
    }

    let entries = layout.discover()?;
    for entry in &entries {
        let location = layout.locate(&entry.id);
        let oracle = if entry.has_oracle {
            match PuzzleOracle::load(&location.dir, entry.id.number) {
                Ok(_) => "oracle ok".to_string(),
                Err(e) => {
                    problems += 1;
                    format!("oracle invalid: {}", e)
                }
            }
        } else {
            problems += 1;
            "oracle missing".to_string()
        };
        let reference = if entry.has_reference {
            "reference"
        } else {
            "no reference"
        };
        println!("{}: {}, {}", entry.id, reference, oracle);
    }

    let support = LaunchMode::host_support(&config.cgroup_base);
    if let Err(reason) = &support {
        println!("isolation: {}", reason);
    }
    let mode = LaunchMode::decide(support, config.allow_degraded, config.strict_mode);
    println!(
        "launch: {:?}, namespaces {}, cgroup v2 {}",
        mode,
        if crate::kernel::namespace::NamespaceIsolation::is_supported() {
            "available"
        } else {
            "unavailable"
        },
        if crate::kernel::cgroup::backend::cgroup_v2_available() {
            "available"
        } else {
            "unavailable"
        }
    );

    println!("{} puzzle(s), {} problem(s)", entries.len(), problems);
    Ok(if problems == 0 { Exit::Success } else { Exit::Failure })
}
