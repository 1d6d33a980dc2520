// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Multi-threaded open/write/close workload with a lock compatibility observer

use anyhow::{Context, Result};
use opfs_core::{AccessHandle, FsError, FsResult, LockMode, OpenOptions, Sandbox, SandboxConfig, SandboxStats};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tracing::{debug, info, warn};

/// Violations kept verbatim in the report; the rest are only counted.
const MAX_RECORDED_VIOLATIONS: usize = 32;

/// Parameters of one `run` invocation
#[derive(Debug, Clone)]
pub struct WorkloadParams {
    pub threads: usize,
    pub iterations: usize,
    pub files: usize,
    pub max_write_bytes: usize,
    pub seed: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModeCounts {
    pub readwrite: u64,
    pub read_only: u64,
    pub readwrite_unsafe: u64,
}

impl ModeCounts {
    fn increment(&mut self, mode: LockMode) {
        match mode {
            LockMode::ReadWrite => self.readwrite += 1,
            LockMode::ReadOnly => self.read_only += 1,
            LockMode::ReadWriteUnsafe => self.readwrite_unsafe += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.readwrite + self.read_only + self.readwrite_unsafe
    }
}

impl std::ops::AddAssign<&ModeCounts> for ModeCounts {
    fn add_assign(&mut self, other: &ModeCounts) {
        self.readwrite += other.readwrite;
        self.read_only += other.read_only;
        self.readwrite_unsafe += other.readwrite_unsafe;
    }
}

/// A grant observed while an incompatible mode was already held on the same file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub file: String,
    pub requested: LockMode,
    pub held: LockMode,
}

#[derive(Debug, Default)]
struct WorkerResult {
    grants: ModeCounts,
    conflicts: ModeCounts,
    writes: u64,
    truncates: u64,
    flushes: u64,
    reads: u64,
    not_writable: u64,
    permission_violations: u64,
    injected_faults: u64,
    limit_rejections: u64,
    fatal_errors: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub phase: String,
    pub threads: usize,
    pub iterations: usize,
    pub files: usize,
    pub seed: u64,
    pub start_time: String,
    pub end_time: String,
    pub grants: ModeCounts,
    pub conflicts: ModeCounts,
    pub writes: u64,
    pub truncates: u64,
    pub flushes: u64,
    pub reads: u64,
    pub not_writable: u64,
    pub permission_violations: u64,
    pub injected_faults: u64,
    pub limit_rejections: u64,
    pub violation_count: u64,
    pub violations: Vec<Violation>,
    pub leaked_handles: u32,
    pub fatal_errors: HashMap<String, u64>,
    pub final_stats: SandboxStats,
    pub status: String,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.violation_count == 0
            && self.permission_violations == 0
            && self.leaked_handles == 0
            && self.fatal_errors.is_empty()
    }
}

/// Modes that workers have been granted and not yet given back, per file.
///
/// Workers record a grant after `open` returns and withdraw it before
/// `close`, so the recorded set is always a subset of what the lock table
/// holds. Any incompatible pair seen here is therefore a real violation.
#[derive(Default)]
struct Observer {
    held: Mutex<HashMap<usize, Vec<LockMode>>>,
    violations: Mutex<(u64, Vec<Violation>)>,
}

impl Observer {
    fn record_grant(&self, file: usize, mode: LockMode) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let modes = held.entry(file).or_default();
        let conflicting: Vec<_> = modes.iter().copied().filter(|other| !mode.is_compatible_with(*other)).collect();
        modes.push(mode);
        drop(held);

        if conflicting.is_empty() {
            return;
        }
        let mut violations = self.violations.lock().unwrap_or_else(PoisonError::into_inner);
        for held in conflicting {
            warn!(file, requested = %mode, %held, "incompatible lock granted");
            violations.0 += 1;
            if violations.1.len() < MAX_RECORDED_VIOLATIONS {
                violations.1.push(Violation {
                    file: file_path(file),
                    requested: mode,
                    held,
                });
            }
        }
    }

    fn withdraw(&self, file: usize, mode: LockMode) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(modes) = held.get_mut(&file) {
            if let Some(index) = modes.iter().position(|m| *m == mode) {
                modes.swap_remove(index);
            }
        }
    }

    fn into_violations(self) -> (u64, Vec<Violation>) {
        self.violations.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

fn file_path(index: usize) -> String {
    format!("stress/file-{index:03}.bin")
}

/// Derive a seed from the wall clock and process id when none is given.
pub fn default_seed() -> u64 {
    let seed_base = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    seed_base ^ ((std::process::id() as u64) << 32)
}

struct Worker {
    id: usize,
    sandbox: Sandbox,
    observer: Arc<Observer>,
    params: WorkloadParams,
}

impl Worker {
    fn run(self) -> WorkerResult {
        let mut rng = SmallRng::seed_from_u64(self.params.seed ^ self.id as u64);
        let mut result = WorkerResult::default();

        for _ in 0..self.params.iterations {
            let file = rng.gen_range(0..self.params.files);
            let mode = *LockMode::ALL.choose(&mut rng).unwrap_or(&LockMode::ReadWrite);

            match self.sandbox.open(&file_path(file), OpenOptions::with_mode(mode)) {
                Ok(handle) => {
                    result.grants.increment(mode);
                    self.observer.record_grant(file, mode);
                    self.exercise(&handle, mode, &mut rng, &mut result);
                    self.observer.withdraw(file, mode);
                    if let Err(err) = handle.close() {
                        *result.fatal_errors.entry(format!("close_{}", label(&err))).or_insert(0) += 1;
                    }
                }
                Err(FsError::Conflict) => result.conflicts.increment(mode),
                Err(FsError::TooManyOpenFiles) => result.limit_rejections += 1,
                Err(err) => {
                    debug!(worker = self.id, %err, "open failed");
                    *result.fatal_errors.entry(format!("open_{}", label(&err))).or_insert(0) += 1;
                }
            }
        }
        result
    }

    fn exercise(&self, handle: &AccessHandle, mode: LockMode, rng: &mut SmallRng, result: &mut WorkerResult) {
        let len = rng.gen_range(1..=self.params.max_write_bytes.max(1));
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        let offset = rng.gen_range(0..4096u64);

        if self.check_mutation("write", mode, handle.write(&data, offset), result) {
            result.writes += 1;
        }
        if rng.gen_bool(0.5) {
            if self.check_mutation("flush", mode, handle.flush(), result) {
                result.flushes += 1;
            }
        } else if self.check_mutation("truncate", mode, handle.truncate(offset + len as u64 / 2), result) {
            result.truncates += 1;
        }

        let mut buf = vec![0u8; len];
        match handle.read(&mut buf, offset) {
            Ok(_) => result.reads += 1,
            Err(FsError::NoSpace | FsError::Io(_)) => result.injected_faults += 1,
            Err(err) => {
                *result.fatal_errors.entry(format!("read_{}", label(&err))).or_insert(0) += 1;
            }
        }
        thread::yield_now();
    }

    /// Check a mutating call's outcome against the mode's write permission.
    /// Returns whether the call succeeded.
    fn check_mutation<T>(&self, op: &str, mode: LockMode, outcome: FsResult<T>, result: &mut WorkerResult) -> bool {
        match outcome {
            Ok(_) if mode.is_writable() => return true,
            Err(FsError::NotWritable) if !mode.is_writable() => result.not_writable += 1,
            Err(FsError::NoSpace | FsError::Io(_)) => result.injected_faults += 1,
            Ok(_) | Err(FsError::NotWritable) => {
                warn!(worker = self.id, %mode, op, "write permission does not match mode");
                result.permission_violations += 1;
            }
            Err(err) => {
                *result.fatal_errors.entry(format!("{op}_{}", label(&err))).or_insert(0) += 1;
            }
        }
        false
    }
}

fn label(err: &FsError) -> String {
    format!("{:?}", err.category()).to_lowercase()
}

/// Run the workload against a fresh sandbox built from `config`.
pub fn run_workload(config: &SandboxConfig, params: WorkloadParams) -> Result<RunReport> {
    anyhow::ensure!(params.threads > 0, "at least one worker thread is required");
    anyhow::ensure!(params.files > 0, "at least one file is required");

    let sandbox = Sandbox::new(config.clone());
    sandbox.create_directory("stress").context("failed to create stress directory")?;
    for index in 0..params.files {
        sandbox
            .create_file(&file_path(index))
            .with_context(|| format!("failed to create {}", file_path(index)))?;
    }

    info!(
        threads = params.threads,
        iterations = params.iterations,
        files = params.files,
        seed = params.seed,
        "starting access handle workload"
    );
    let start_time = chrono::Utc::now();
    let observer = Arc::new(Observer::default());

    let mut handles = Vec::with_capacity(params.threads);
    for id in 0..params.threads {
        let worker = Worker {
            id,
            sandbox: sandbox.clone(),
            observer: Arc::clone(&observer),
            params: params.clone(),
        };
        handles.push(thread::spawn(move || worker.run()));
    }

    let mut total = WorkerResult::default();
    for handle in handles {
        match handle.join() {
            Ok(result) => {
                total.grants += &result.grants;
                total.conflicts += &result.conflicts;
                total.writes += result.writes;
                total.truncates += result.truncates;
                total.flushes += result.flushes;
                total.reads += result.reads;
                total.not_writable += result.not_writable;
                total.permission_violations += result.permission_violations;
                total.injected_faults += result.injected_faults;
                total.limit_rejections += result.limit_rejections;
                merge_counts(&mut total.fatal_errors, &result.fatal_errors);
            }
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                *total.fatal_errors.entry("thread_panic".to_string()).or_insert(0) += 1;
                warn!("worker thread panicked: {}", msg);
            }
        }
    }
    let end_time = chrono::Utc::now();

    let observer = Arc::try_unwrap(observer).map_err(|_| anyhow::anyhow!("observer still shared after join"))?;
    let (violation_count, violations) = observer.into_violations();
    let final_stats = sandbox.stats();

    let mut report = RunReport {
        phase: "workload".to_string(),
        threads: params.threads,
        iterations: params.iterations,
        files: params.files,
        seed: params.seed,
        start_time: start_time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        end_time: end_time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        grants: total.grants,
        conflicts: total.conflicts,
        writes: total.writes,
        truncates: total.truncates,
        flushes: total.flushes,
        reads: total.reads,
        not_writable: total.not_writable,
        permission_violations: total.permission_violations,
        injected_faults: total.injected_faults,
        limit_rejections: total.limit_rejections,
        violation_count,
        violations,
        leaked_handles: final_stats.open_handles,
        fatal_errors: total.fatal_errors,
        final_stats,
        status: String::new(),
    };
    report.status = if report.passed() { "passed" } else { "failed" }.to_string();
    info!(
        grants = report.grants.total(),
        conflicts = report.conflicts.total(),
        violations = report.violation_count,
        status = %report.status,
        "workload finished"
    );
    Ok(report)
}

fn merge_counts(target: &mut HashMap<String, u64>, source: &HashMap<String, u64>) {
    for (key, value) in source {
        *target.entry(key.clone()).or_insert(0) += value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opfs_core::fault::{FaultErrno, FaultOp, FaultPolicy, FaultRule};

    fn params(threads: usize, iterations: usize, files: usize) -> WorkloadParams {
        WorkloadParams {
            threads,
            iterations,
            files,
            max_write_bytes: 256,
            seed: 0x5eed,
        }
    }

    #[test]
    fn contended_workload_has_no_violations() {
        let report = run_workload(&SandboxConfig::default(), params(8, 400, 2)).unwrap();
        assert!(report.passed(), "{report:?}");
        assert_eq!(report.status, "passed");
        assert_eq!(report.grants.total() + report.conflicts.total(), 8 * 400);
        let writable = report.grants.readwrite + report.grants.readwrite_unsafe;
        assert_eq!(report.writes, writable);
        assert_eq!(report.truncates + report.flushes, writable);
        assert!(report.truncates > 0 && report.flushes > 0);
        // Every read-only grant is refused once for the write and once for truncate or flush.
        assert_eq!(report.not_writable, 2 * report.grants.read_only);
        assert_eq!(report.final_stats.locked_files, 0);
    }

    #[test]
    fn single_worker_never_conflicts() {
        let report = run_workload(&SandboxConfig::default(), params(1, 200, 3)).unwrap();
        assert_eq!(report.conflicts.total(), 0);
        assert_eq!(report.grants.total(), 200);
        assert_eq!(report.final_stats.files, 3);
    }

    #[test]
    fn injected_faults_are_counted_not_fatal() {
        let mut config = SandboxConfig::default();
        config.faults = FaultPolicy {
            enabled: true,
            rules: vec![FaultRule {
                op: FaultOp::Write,
                errno: FaultErrno::Eio,
                start_after: 0,
                max_faults: Some(5),
            }],
        };
        let report = run_workload(&config, params(1, 100, 1)).unwrap();
        assert!(report.passed(), "{report:?}");
        assert!(report.injected_faults > 0);
        assert!(report.injected_faults <= 5);
    }

    #[test]
    fn handle_limit_rejections_are_reported() {
        let mut config = SandboxConfig::default();
        config.limits.max_open_handles = 1;
        let report = run_workload(&config, params(4, 200, 4)).unwrap();
        assert!(report.passed(), "{report:?}");
        assert_eq!(
            report.grants.total() + report.conflicts.total() + report.limit_rejections,
            4 * 200
        );
    }

    #[test]
    fn observer_flags_incompatible_grants() {
        let observer = Observer::default();
        observer.record_grant(0, LockMode::ReadOnly);
        observer.record_grant(0, LockMode::ReadOnly);
        observer.record_grant(1, LockMode::ReadWrite);
        observer.record_grant(0, LockMode::ReadWriteUnsafe);
        observer.withdraw(0, LockMode::ReadWriteUnsafe);
        observer.record_grant(0, LockMode::ReadOnly);

        let (count, violations) = observer.into_violations();
        assert_eq!(count, 2);
        assert_eq!(
            violations[0],
            Violation {
                file: file_path(0),
                requested: LockMode::ReadWriteUnsafe,
                held: LockMode::ReadOnly,
            }
        );
    }

    #[test]
    fn mutation_outcomes_are_checked_against_mode() {
        let worker = Worker {
            id: 0,
            sandbox: Sandbox::default(),
            observer: Arc::default(),
            params: params(1, 1, 1),
        };
        let mut result = WorkerResult::default();

        assert!(worker.check_mutation("flush", LockMode::ReadWriteUnsafe, Ok(()), &mut result));
        assert!(!worker.check_mutation("truncate", LockMode::ReadOnly, Err::<(), _>(FsError::NotWritable), &mut result));
        assert!(!worker.check_mutation("truncate", LockMode::ReadOnly, Ok(()), &mut result));
        assert!(!worker.check_mutation("flush", LockMode::ReadWrite, Err::<(), _>(FsError::NotWritable), &mut result));
        assert!(!worker.check_mutation("flush", LockMode::ReadWrite, Err::<(), _>(FsError::HandleClosed), &mut result));

        assert_eq!(result.not_writable, 1);
        assert_eq!(result.permission_violations, 2);
        assert_eq!(result.fatal_errors.get("flush_invalidstate"), Some(&1));
    }

    #[test]
    fn rejects_empty_workloads() {
        assert!(run_workload(&SandboxConfig::default(), params(0, 10, 1)).is_err());
        assert!(run_workload(&SandboxConfig::default(), params(1, 10, 0)).is_err());
    }

    #[test]
    fn mode_counts_serialize_with_wire_names() {
        let mut counts = ModeCounts::default();
        counts.increment(LockMode::ReadOnly);
        let json = serde_json::to_value(counts).unwrap();
        assert_eq!(json["read-only"], 1);
        assert_eq!(json["readwrite-unsafe"], 0);
    }
}
