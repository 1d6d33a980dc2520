// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

mod config;
mod matrix;
mod workload;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use opfs_logging::CliLoggingArgs;
use serde::Serialize;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use crate::config::StressConfig;
use crate::workload::WorkloadParams;

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.logging.init("opfs-stress")?;

    let config = StressConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Matrix(args) => {
            let report = matrix::probe_matrix(&config.sandbox)?;
            emit(&report, args.json_output.as_ref())?;
            if !report.passed() {
                bail!("{} probe(s) disagree with the lock mode table", report.mismatches);
            }
        }
        Command::Run(args) => {
            let report = workload::run_workload(&config.sandbox, args.params())?;
            emit(&report, args.json_output.as_ref())?;
            if !report.passed() {
                bail!(
                    "workload failed: {} compatibility violation(s), {} permission violation(s), {} leaked handle(s)",
                    report.violation_count,
                    report.permission_violations,
                    report.leaked_handles
                );
            }
        }
    }
    Ok(())
}

fn emit<T: Serialize>(report: &T, json_output: Option<&PathBuf>) -> Result<()> {
    if let Some(path) = json_output {
        serde_json::to_writer_pretty(File::create(path)?, report)?;
    }
    write_json_to_stdout(report)
}

fn write_json_to_stdout<T: Serialize>(value: &T) -> Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    out.flush()?;
    Ok(())
}

#[derive(Parser)]
#[command(author, version, about = "Access handle lock conformance and stress runner")]
struct Cli {
    /// TOML file with a [sandbox] section
    #[arg(long, global = true, env = "OPFS_STRESS_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    logging: CliLoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe every mode pair and every mode's write permission
    Matrix(MatrixArgs),
    /// Hammer shared files from many threads and check lock invariants
    Run(RunArgs),
}

#[derive(Args)]
struct MatrixArgs {
    /// Optional path for writing the JSON report
    #[arg(long)]
    json_output: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Number of worker threads to spawn
    #[arg(long, default_value_t = 8, env = "OPFS_STRESS_THREADS")]
    threads: usize,

    /// Open/close cycles per worker
    #[arg(long, default_value_t = 2000, env = "OPFS_STRESS_ITERATIONS")]
    iterations: usize,

    /// Number of files the workers contend on
    #[arg(long, default_value_t = 4, env = "OPFS_STRESS_FILES")]
    files: usize,

    /// Largest single write in bytes
    #[arg(long, default_value_t = 4096, env = "OPFS_STRESS_MAX_WRITE_BYTES")]
    max_write_bytes: usize,

    /// RNG seed; derived from the clock when omitted
    #[arg(long, env = "OPFS_STRESS_SEED")]
    seed: Option<u64>,

    /// Optional path for writing the JSON report
    #[arg(long)]
    json_output: Option<PathBuf>,
}

impl RunArgs {
    fn params(&self) -> WorkloadParams {
        WorkloadParams {
            threads: self.threads,
            iterations: self.iterations,
            files: self.files,
            max_write_bytes: self.max_write_bytes,
            seed: self.seed.unwrap_or_else(workload::default_seed),
        }
    }
}
