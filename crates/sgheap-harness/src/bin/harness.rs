//! CLI entrypoint for the sgheap workload harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sgheap_harness::Workload;
use sgheap_harness::structured_log::{LogEmitter, validate_log_file};

/// Workload replay tooling for sgheap.
#[derive(Debug, Parser)]
#[command(name = "sgheap-harness")]
#[command(about = "Replay heap workloads and check their structured logs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a workload file against a simulated heap.
    Run {
        /// Workload JSON path.
        #[arg(long)]
        workload: PathBuf,
        /// JSONL log output path (if omitted, the log is discarded).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Run id stamped into harness trace ids.
        #[arg(long, default_value = "run")]
        run_id: String,
        /// Print the summary as JSON instead of the pool reports.
        #[arg(long)]
        json: bool,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        /// JSONL log path.
        #[arg(long)]
        log: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            workload,
            log,
            run_id,
            json,
        } => {
            let script = Workload::from_file(&workload)?;
            eprintln!(
                "Replaying {} ({} steps) from {}",
                script.name,
                script.steps.len(),
                workload.display()
            );
            let summary = match &log {
                Some(path) => script.run(&mut LogEmitter::to_file(path, &run_id)?)?,
                None => script.run(&mut LogEmitter::sink(&run_id))?,
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                for report in &summary.reports {
                    print!("{report}");
                }
                println!(
                    "allocations={} failed={} frees={} shrink={:?}",
                    summary.allocations,
                    summary.failed_allocations,
                    summary.frees,
                    summary.shrink_results
                );
            }
            for mismatch in &summary.mismatches {
                eprintln!("MISMATCH: {mismatch}");
            }
            if !summary.leaked_buffers.is_empty() {
                eprintln!("Leaked buffers: {}", summary.leaked_buffers.join(", "));
            }
            if !summary.passed() {
                return Err(format!("workload {} failed", summary.workload).into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            if !errors.is_empty() {
                return Err(format!(
                    "{} validation errors in {} lines of {}",
                    errors.len(),
                    lines,
                    log.display()
                )
                .into());
            }
            println!("{}: {lines} lines valid", log.display());
        }
    }

    Ok(())
}
