use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use chrono::Utc;
use log::{debug, error, info, warn};

use crate::config::TranscodeConfig;
use crate::ffmpeg::Transformer;
use crate::ffprobe::{MediaInspector, ProbeData};
use crate::job::{is_marked_output, Job};
use crate::journal::{format_elapsed, Journal, JournalEntry, JournalSnapshot, Outcome};
use crate::liveness::{LivenessProbe, Owner, ProcessProbe};
use crate::registry::{LockRegistry, RegistryError};

/// Why the journal rules a job out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
    Succeeded,
    Failed(String),
    Skipped(String),
}

/// Terminal state of one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The input is itself a transform output
    AlreadyMarked,
    /// The journal already holds an outcome for this job
    Excluded(Exclusion),
    /// Not worth transforming; recorded as skipped
    SkippedLowValue(String),
    /// Another live process holds the output's lock
    LostRace { owner: Owner },
    /// Found complete on the re-check after locking
    AlreadyDone,
    Transformed { elapsed: Duration },
    TransformFailed(String),
    /// A local I/O or inspection problem; nothing recorded, retried next run
    Abandoned(String),
}

/// Counters for one pass over the candidates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub candidates: usize,
    pub already_marked: usize,
    pub excluded: usize,
    pub skipped_low_value: usize,
    pub lost_race: usize,
    pub already_done: usize,
    pub transformed: usize,
    pub failed: usize,
    pub abandoned: usize,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &JobOutcome) {
        self.candidates += 1;
        match outcome {
            JobOutcome::AlreadyMarked => self.already_marked += 1,
            JobOutcome::Excluded(_) => self.excluded += 1,
            JobOutcome::SkippedLowValue(_) => self.skipped_low_value += 1,
            JobOutcome::LostRace { .. } => self.lost_race += 1,
            JobOutcome::AlreadyDone => self.already_done += 1,
            JobOutcome::Transformed { .. } => self.transformed += 1,
            JobOutcome::TransformFailed(_) => self.failed += 1,
            JobOutcome::Abandoned(_) => self.abandoned += 1,
        }
    }
}

pub struct Orchestrator<I, T, P = ProcessProbe> {
    registry: LockRegistry<P>,
    journal: Journal,
    snapshot: JournalSnapshot,
    inspector: I,
    transformer: T,
    min_bitrate_bps: u64,
    retry_failed: bool,
}

impl<I, T, P> Orchestrator<I, T, P>
where
    I: MediaInspector,
    T: Transformer,
    P: LivenessProbe,
{
    pub fn new(cfg: &TranscodeConfig, registry: LockRegistry<P>, journal: Journal, inspector: I, transformer: T) -> Self {
        Self {
            registry,
            journal,
            snapshot: JournalSnapshot::new(cfg.journal_refresh_interval()),
            inspector,
            transformer,
            min_bitrate_bps: cfg.min_bitrate_bps,
            retry_failed: cfg.retry_failed,
        }
    }

    /// Process every candidate in order. Per-job problems never stop the pass.
    pub async fn run(&mut self, candidates: &[PathBuf]) -> RunSummary {
        let mut summary = RunSummary::default();
        for (index, input) in candidates.iter().enumerate() {
            debug!("[{}/{}] {}", index + 1, candidates.len(), input.display());
            let outcome = self.process_job(input).await;
            summary.record(&outcome);
        }
        info!(
            "Run complete: {} candidates, {} transformed, {} failed, {} skipped (low value), \
             {} excluded by journal, {} already done, {} held elsewhere, {} abandoned, {} prior outputs",
            summary.candidates,
            summary.transformed,
            summary.failed,
            summary.skipped_low_value,
            summary.excluded,
            summary.already_done,
            summary.lost_race,
            summary.abandoned,
            summary.already_marked
        );
        summary
    }

    pub async fn process_job(&mut self, input: &Path) -> JobOutcome {
        if is_marked_output(input) {
            debug!("Item {:?} is a transform output, ignoring", input);
            return JobOutcome::AlreadyMarked;
        }

        let job = Job::new(input.to_path_buf());
        info!("Checking item {}", job.key);

        match self.snapshot.lookup(&self.journal, &job.key) {
            Ok(Some(outcome)) => {
                if let Some(exclusion) = self.exclusion_for(&outcome) {
                    info!("Item {:?} excluded by journal: {:?}", input, exclusion);
                    return JobOutcome::Excluded(exclusion);
                }
                info!("Item {:?} failed previously, retrying", input);
            }
            Ok(None) => {}
            Err(e) => {
                error!("Item {:?}: cannot read journal: {}", input, e);
                return JobOutcome::Abandoned(e.to_string());
            }
        }

        let probe = match self.inspector.inspect(input).await {
            Ok(p) => p,
            Err(e) => {
                warn!("Item {:?}: inspection failed, will retry next run: {:#}", input, e);
                return JobOutcome::Abandoned(format!("{:#}", e));
            }
        };

        if let Some(reason) = low_value_reason(&probe, self.min_bitrate_bps) {
            let entry = JournalEntry::skipped(job.key.clone(), Utc::now(), reason.clone());
            if let Err(e) = self.journal.append(&entry) {
                error!("Item {:?}: cannot record skip: {}", input, e);
                return JobOutcome::Abandoned(e.to_string());
            }
            self.snapshot.record(&entry);
            info!("Item {:?} skipped: {}", input, reason);
            return JobOutcome::SkippedLowValue(reason);
        }

        let lock_name = job.output().to_string_lossy().to_string();
        let guard = match self.registry.try_acquire(&lock_name) {
            Ok(guard) => guard,
            Err(RegistryError::Held { owner, .. }) => {
                info!("Item {:?} already transcoding by {}", input, owner);
                return JobOutcome::LostRace { owner };
            }
            Err(e) => {
                error!("Item {:?}: lock registry unavailable: {}", input, e);
                return JobOutcome::Abandoned(e.to_string());
            }
        };

        let (outcome, recorded) = self.run_locked(&job, &probe).await;

        if let Err(e) = guard.release() {
            warn!("Item {:?}: failed to release lock: {}", input, e);
        }
        if let Some(entry) = recorded {
            self.snapshot.record(&entry);
        }
        outcome
    }

    /// Steps taken while holding the output's lock. Returns the journal record
    /// written, if any, so the caller can fold it into the snapshot.
    async fn run_locked(&self, job: &Job, probe: &ProbeData) -> (JobOutcome, Option<JournalEntry>) {
        let input = job.input();

        // Time passed since the snapshot lookup; a sibling may have finished the job
        if job.output().exists() {
            info!("Item {:?} already transcoded", input);
            return (JobOutcome::AlreadyDone, None);
        }
        match self.journal.latest(&job.key) {
            Ok(Some(outcome)) if self.exclusion_for(&outcome).is_some() => {
                info!("Item {:?} recorded by another process meanwhile", input);
                return (JobOutcome::AlreadyDone, None);
            }
            Ok(_) => {}
            Err(e) => {
                error!("Item {:?}: cannot re-read journal: {}", input, e);
                return (JobOutcome::Abandoned(e.to_string()), None);
            }
        }

        // Leftover from a run that died mid-transform; we hold the lock so nobody else is writing it
        if let Err(e) = remove_if_exists(&job.temp_output) {
            error!("Item {:?}: cannot clear stale temp file {:?}: {}", input, job.temp_output, e);
            return (JobOutcome::Abandoned(e.to_string()), None);
        }

        let args = self.transformer.command_line(input, &job.temp_output, probe);
        let started_at = Utc::now();
        let clock = Instant::now();
        info!("Item {:?} transcoding -> {:?}", input, job.output());

        let entry = match self.transformer.transform(input, &job.temp_output, probe).await {
            Ok(()) => {
                if let Err(e) = fs::rename(&job.temp_output, job.output()) {
                    error!("Item {:?}: cannot move {:?} into place: {}", input, job.temp_output, e);
                    return (JobOutcome::Abandoned(e.to_string()), None);
                }
                let elapsed = clock.elapsed();
                info!("Item {:?} transcoded in {}", input, format_elapsed(elapsed));
                JournalEntry::succeeded(job.key.clone(), started_at, elapsed, args)
            }
            Err(e) => {
                error!("Item {:?} transform failed: {}", input, e);
                if let Err(rm) = remove_if_exists(&job.temp_output) {
                    warn!("Item {:?}: cannot remove partial output {:?}: {}", input, job.temp_output, rm);
                }
                JournalEntry::failed(job.key.clone(), started_at, clock.elapsed(), args, e.to_string())
            }
        };

        if let Err(e) = self.journal.append(&entry) {
            error!("Item {:?}: cannot record outcome: {}", input, e);
        }

        let outcome = match &entry.outcome {
            Outcome::Failed { error } => JobOutcome::TransformFailed(error.clone()),
            _ => JobOutcome::Transformed {
                elapsed: clock.elapsed(),
            },
        };
        (outcome, Some(entry))
    }

    fn exclusion_for(&self, outcome: &Outcome) -> Option<Exclusion> {
        match outcome {
            Outcome::Succeeded => Some(Exclusion::Succeeded),
            Outcome::Skipped { reason } => Some(Exclusion::Skipped(reason.clone())),
            Outcome::Failed { .. } if self.retry_failed => None,
            Outcome::Failed { error } => Some(Exclusion::Failed(error.clone())),
        }
    }
}

/// `Some(reason)` when the measured bit rate says the file is not worth transforming.
/// An unknown bit rate counts as zero.
pub fn low_value_reason(probe: &ProbeData, min_bitrate_bps: u64) -> Option<String> {
    let measured = probe.bit_rate_bps();
    if measured.unwrap_or(0) >= min_bitrate_bps {
        return None;
    }
    Some(match measured {
        Some(bps) => format!(
            "bit rate {} below minimum {}",
            format_bit_rate(bps),
            format_bit_rate(min_bitrate_bps)
        ),
        None => "unknown bit rate".to_string(),
    })
}

fn format_bit_rate(bps: u64) -> String {
    format!("{:.2} Mbps", bps as f64 / 1_000_000.0)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
