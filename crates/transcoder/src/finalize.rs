use std::path::{Path, PathBuf};
use humansize::{format_size, BINARY};
use log::{debug, info, warn};

use crate::job::{is_marked_output, Job};
use crate::journal::{JournalScan, Outcome};

/// What happened to one input during finalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeAction {
    /// Dry run: would have been removed
    WouldRemove,
    Removed,
    /// Journal records a failure or skip; the original stays
    Kept(String),
    /// No journal record, or the output is missing
    Untouched,
    RemoveFailed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeSummary {
    pub examined: usize,
    pub removed: usize,
    pub would_remove: usize,
    pub kept: usize,
    pub untouched: usize,
    pub failed: usize,
    pub bytes_reclaimed: u64,
}

/// Decide and, unless `dry_run`, remove originals whose latest record is a success
/// and whose output is present. Failures are logged and do not stop the pass.
pub fn finalize(media: &[PathBuf], journal: &JournalScan, dry_run: bool) -> FinalizeSummary {
    let outcomes = journal.latest_outcomes();
    let mut summary = FinalizeSummary::default();

    for input in media.iter().filter(|p| !is_marked_output(p)) {
        summary.examined += 1;
        let job = Job::new(input.clone());
        let action = match outcomes.get(&job.key) {
            None => {
                debug!("Media file {:?} does not exist in transcode journal", input);
                FinalizeAction::Untouched
            }
            Some(Outcome::Failed { error }) => {
                warn!("Media file {:?} has errors in transcode journal, keeping: {}", input, error);
                FinalizeAction::Kept(error.clone())
            }
            Some(Outcome::Skipped { reason }) => {
                warn!("Media file {:?} was skipped in transcode journal, keeping: {}", input, reason);
                FinalizeAction::Kept(reason.clone())
            }
            Some(Outcome::Succeeded) if !job.output().exists() => {
                warn!("Media file {:?} transcoded but {:?} is missing, keeping", input, job.output());
                FinalizeAction::Untouched
            }
            Some(Outcome::Succeeded) => remove_original(input, dry_run, &mut summary.bytes_reclaimed),
        };

        match action {
            FinalizeAction::WouldRemove => summary.would_remove += 1,
            FinalizeAction::Removed => summary.removed += 1,
            FinalizeAction::Kept(_) => summary.kept += 1,
            FinalizeAction::Untouched => summary.untouched += 1,
            FinalizeAction::RemoveFailed(_) => summary.failed += 1,
        }
    }

    info!(
        "Finalize complete: {} examined, {} removed, {} would remove, {} kept, {} failed, {} reclaimed",
        summary.examined,
        summary.removed,
        summary.would_remove,
        summary.kept,
        summary.failed,
        format_size(summary.bytes_reclaimed, BINARY)
    );
    summary
}

fn remove_original(input: &Path, dry_run: bool, reclaimed: &mut u64) -> FinalizeAction {
    let size = std::fs::metadata(input).map(|m| m.len()).unwrap_or(0);
    if dry_run {
        info!("Would remove original media file {:?} ({})", input, format_size(size, BINARY));
        *reclaimed += size;
        return FinalizeAction::WouldRemove;
    }
    info!("Removing original media file {:?} ({})", input, format_size(size, BINARY));
    match std::fs::remove_file(input) {
        Ok(()) => {
            *reclaimed += size;
            FinalizeAction::Removed
        }
        Err(e) => {
            warn!("Failed to remove original media file {:?}: {}", input, e);
            FinalizeAction::RemoveFailed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{Journal, JournalEntry};
    use chrono::Utc;
    use std::time::Duration;

    struct Library {
        dir: tempfile::TempDir,
        journal: Journal,
    }

    impl Library {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let journal = Journal::open(dir.path().join("journal.ndjson")).unwrap();
            Self { dir, journal }
        }

        fn file(&self, name: &str, bytes: usize) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, vec![0u8; bytes]).unwrap();
            path
        }
    }

    #[test]
    fn test_dry_run_removes_nothing() {
        let lib = Library::new();
        let input = lib.file("Film.mp4", 1024);
        let job = Job::new(input.clone());
        lib.file("Film.av1.mkv", 10);
        lib.journal
            .append(&JournalEntry::succeeded(job.key, Utc::now(), Duration::from_secs(1), vec![]))
            .unwrap();

        let summary = finalize(&[input.clone()], &lib.journal.read_all().unwrap(), true);
        assert_eq!(summary.would_remove, 1);
        assert_eq!(summary.bytes_reclaimed, 1024);
        assert!(input.exists());
    }

    #[test]
    fn test_apply_removes_only_successes_with_output() {
        let lib = Library::new();
        let done = lib.file("Done.mp4", 2048);
        let failed = lib.file("Failed.mp4", 10);
        let skipped = lib.file("Skipped.mp4", 10);
        let unknown = lib.file("Unknown.mp4", 10);
        let missing_output = lib.file("Missing.mp4", 10);
        let produced = lib.file("Done.av1.mkv", 10);

        let now = Utc::now();
        let j = &lib.journal;
        j.append(&JournalEntry::succeeded(Job::new(done.clone()).key, now, Duration::ZERO, vec![])).unwrap();
        j.append(&JournalEntry::failed(Job::new(failed.clone()).key, now, Duration::ZERO, vec![], "exit 1")).unwrap();
        j.append(&JournalEntry::skipped(Job::new(skipped.clone()).key, now, "low bit rate")).unwrap();
        j.append(&JournalEntry::succeeded(Job::new(missing_output.clone()).key, now, Duration::ZERO, vec![])).unwrap();

        let media = vec![done.clone(), failed.clone(), skipped.clone(), unknown.clone(), missing_output.clone(), produced.clone()];
        let summary = finalize(&media, &j.read_all().unwrap(), false);

        assert_eq!(summary.examined, 5);
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.kept, 2);
        assert_eq!(summary.untouched, 2);
        assert_eq!(summary.bytes_reclaimed, 2048);
        assert!(!done.exists());
        assert!(produced.exists());
        assert!(failed.exists() && skipped.exists() && unknown.exists() && missing_output.exists());
    }
}
