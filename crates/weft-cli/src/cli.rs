//! CLI argument parsing using `clap` (derive).

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use weft_core::JobId;

/// Command-line arguments for `weft`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "weft",
    version,
    about = "Plan, audit and execute dependency-ordered jobs.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `weft.toml` in the current directory, if it exists.
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `WEFT_LOG` or `info` is used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Submit a new goal for planning.
    Submit {
        goal: String,
        #[arg(long, default_value = "default")]
        project: String,
    },
    /// Show the resolved status of a job.
    Status { job: JobId },
    /// Approve the current plan of a job.
    Approve { job: JobId },
    /// Reject the current plan and re-plan with feedback.
    Revise { job: JobId, feedback: String },
    /// Cancel a job and all of its open tasks.
    Cancel { job: JobId },
    /// Answer the question a task is waiting on.
    Resume {
        job: JobId,
        task: String,
        answer: String,
    },
    /// Print the event log of a job.
    Events {
        job: JobId,
        /// Only the last N events.
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },
    /// Run a worker: recover, plan, claim, execute, release.
    Worker {
        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,
        /// Sleep between idle cycles.
        #[arg(long, value_name = "MS", default_value_t = 1000)]
        interval_ms: u64,
        #[arg(long, value_name = "ID", default_value = "worker-1")]
        worker_id: String,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: &str = "job-01J9Z3QK8W0000000000000000";

    #[test]
    fn parses_resume_with_global_flags_after_subcommand() {
        let args = CliArgs::try_parse_from([
            "weft", "resume", JOB, "deploy", "eu-west-1", "--log-level", "debug",
        ])
        .unwrap();
        assert_eq!(args.log_level, Some(LogLevel::Debug));
        match args.command {
            Command::Resume { job, task, answer } => {
                assert_eq!(job.to_string(), JOB);
                assert_eq!(task, "deploy");
                assert_eq!(answer, "eu-west-1");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn worker_defaults() {
        let args = CliArgs::try_parse_from(["weft", "worker"]).unwrap();
        assert_eq!(args.config, None);
        assert!(matches!(
            args.command,
            Command::Worker { once: false, interval_ms: 1000, .. }
        ));
    }

    #[test]
    fn rejects_malformed_job_id() {
        assert!(CliArgs::try_parse_from(["weft", "status", "not-an-id"]).is_err());
    }
}
