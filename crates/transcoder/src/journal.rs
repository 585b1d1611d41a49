use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flock::{control_path, FileLock};
use crate::job::JobKey;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode journal record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl JournalError {
    fn io(path: &Path, source: io::Error) -> Self {
        JournalError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// How a job ended. Any outcome stops the job from being attempted again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed { error: String },
    Skipped { reason: String },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed { .. } => "failed",
            Outcome::Skipped { .. } => "skipped",
        }
    }
}

/// A decoded journal record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub key: JobKey,
    /// Absent in records written without one, or with an unreadable timestamp
    pub start_time: Option<DateTime<Utc>>,
    /// Human-readable elapsed time, `"0s"` when no work was done
    pub duration: String,
    /// Transform invocation, for diagnostics
    pub args: Vec<String>,
    pub outcome: Outcome,
}

impl JournalEntry {
    pub fn succeeded(key: JobKey, start_time: DateTime<Utc>, elapsed: Duration, args: Vec<String>) -> Self {
        Self {
            key,
            start_time: Some(start_time),
            duration: format_elapsed(elapsed),
            args,
            outcome: Outcome::Succeeded,
        }
    }

    pub fn failed(
        key: JobKey,
        start_time: DateTime<Utc>,
        elapsed: Duration,
        args: Vec<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            key,
            start_time: Some(start_time),
            duration: format_elapsed(elapsed),
            args,
            outcome: Outcome::Failed { error: error.into() },
        }
    }

    pub fn skipped(key: JobKey, start_time: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            key,
            start_time: Some(start_time),
            duration: format_elapsed(Duration::ZERO),
            args: Vec::new(),
            outcome: Outcome::Skipped { reason: reason.into() },
        }
    }

    fn to_record(&self) -> JournalRecord {
        let (error, skipped) = match &self.outcome {
            Outcome::Succeeded => (None, None),
            Outcome::Failed { error } => (Some(error.clone()), None),
            Outcome::Skipped { reason } => (None, Some(reason.clone())),
        };
        JournalRecord {
            input: Some(self.key.input.clone()),
            output: Some(self.key.output.clone()),
            start_time: self.start_time.map(|t| t.to_rfc3339()),
            duration: Some(self.duration.clone()),
            args: self.args.clone(),
            error,
            skipped,
        }
    }
}

/// Millisecond precision, e.g. `"1h 2m 3s 40ms"`
pub fn format_elapsed(elapsed: Duration) -> String {
    let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    humantime::format_duration(Duration::from_millis(millis)).to_string()
}

/// On-disk shape of one line; every field optional so decoding can report what is missing
#[derive(Debug, Default, Serialize, Deserialize)]
struct JournalRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    input: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    skipped: Option<String>,
}

/// Result of decoding one line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalLine {
    Entry(JournalEntry),
    Unparseable(String),
}

/// Decode a single journal line. Empty `error`/`skipped` strings count as absent.
pub fn decode_line(line: &str) -> JournalLine {
    let record: JournalRecord = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return JournalLine::Unparseable(format!("invalid JSON: {}", e)),
    };

    let (Some(input), Some(output)) = (record.input, record.output) else {
        return JournalLine::Unparseable("missing input or output".to_string());
    };
    // The outcome is what matters for idempotency; a bad timestamp must not hide it
    let start_time = record
        .start_time
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));

    let error = record.error.filter(|e| !e.is_empty());
    let skipped = record.skipped.filter(|s| !s.is_empty());
    let outcome = match (error, skipped) {
        (None, None) => Outcome::Succeeded,
        (Some(error), None) => Outcome::Failed { error },
        (None, Some(reason)) => Outcome::Skipped { reason },
        (Some(_), Some(_)) => {
            return JournalLine::Unparseable("both error and skipped present".to_string());
        }
    };

    JournalLine::Entry(JournalEntry {
        key: JobKey { input, output },
        start_time,
        duration: record.duration.unwrap_or_else(|| "0s".to_string()),
        args: record.args,
        outcome,
    })
}

/// Everything readable from the journal at one point in time
#[derive(Debug, Clone, Default)]
pub struct JournalScan {
    pub entries: Vec<JournalEntry>,
    /// Lines dropped because they could not be decoded
    pub unparseable: usize,
}

impl JournalScan {
    /// Latest outcome per job; a later record supersedes an earlier one
    pub fn latest_outcomes(&self) -> HashMap<JobKey, Outcome> {
        self.entries
            .iter()
            .map(|e| (e.key.clone(), e.outcome.clone()))
            .collect()
    }
}

/// Handle on the shared, append-only journal file. One JSON record per line.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
    control: PathBuf,
}

impl Journal {
    /// Creates the journal's parent directory; failure here is a setup error
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| JournalError::io(parent, e))?;
        }
        let control = control_path(&path);
        Ok(Self { path, control })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append one record
    pub fn append(&self, entry: &JournalEntry) -> Result<(), JournalError> {
        let mut line = serde_json::to_vec(&entry.to_record())?;
        line.push(b'\n');

        let _lock = FileLock::exclusive(&self.control).map_err(|e| JournalError::io(&self.control, e))?;
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| JournalError::io(&self.path, e))?;

        // A writer that died mid-record leaves no trailing newline; start on a fresh line
        if !ends_with_newline(&mut file).map_err(|e| JournalError::io(&self.path, e))? {
            line.insert(0, b'\n');
        }

        file.write_all(&line).map_err(|e| JournalError::io(&self.path, e))?;
        file.flush().map_err(|e| JournalError::io(&self.path, e))?;
        file.sync_data().map_err(|e| JournalError::io(&self.path, e))?;
        debug!("Journal: {} {}", entry.outcome.label(), entry.key);
        Ok(())
    }

    /// Every decodable record, in file order. A missing journal reads as empty.
    pub fn read_all(&self) -> Result<JournalScan, JournalError> {
        let _lock = FileLock::shared(&self.control).map_err(|e| JournalError::io(&self.control, e))?;
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(JournalScan::default()),
            Err(e) => return Err(JournalError::io(&self.path, e)),
        };

        let mut scan = JournalScan::default();
        for (index, raw) in BufReader::new(file).split(b'\n').enumerate() {
            let raw = raw.map_err(|e| JournalError::io(&self.path, e))?;
            let Ok(line) = std::str::from_utf8(&raw) else {
                warn!("Skipping non-UTF-8 journal record at line {}", index + 1);
                scan.unparseable += 1;
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }
            match decode_line(line) {
                JournalLine::Entry(entry) => scan.entries.push(entry),
                JournalLine::Unparseable(reason) => {
                    warn!("Skipping journal record at line {}: {}", index + 1, reason);
                    scan.unparseable += 1;
                }
            }
        }
        Ok(scan)
    }

    /// Latest outcome for `key`, read fresh from disk
    pub fn latest(&self, key: &JobKey) -> Result<Option<Outcome>, JournalError> {
        Ok(self
            .read_all()?
            .entries
            .into_iter()
            .rev()
            .find(|e| &e.key == key)
            .map(|e| e.outcome))
    }
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// In-memory view of the journal, re-read once it is older than `max_age`
#[derive(Debug)]
pub struct JournalSnapshot {
    outcomes: HashMap<JobKey, Outcome>,
    loaded_at: Option<Instant>,
    max_age: Duration,
}

impl JournalSnapshot {
    pub fn new(max_age: Duration) -> Self {
        Self {
            outcomes: HashMap::new(),
            loaded_at: None,
            max_age,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.loaded_at.map_or(true, |t| t.elapsed() >= self.max_age)
    }

    /// Reload from disk; returns the number of unparseable records seen
    pub fn refresh(&mut self, journal: &Journal) -> Result<usize, JournalError> {
        let scan = journal.read_all()?;
        if scan.unparseable > 0 {
            warn!("Journal {} has {} unparseable record(s)", journal.path().display(), scan.unparseable);
        }
        debug!("Journal snapshot refreshed: {} record(s)", scan.entries.len());
        self.outcomes = scan.latest_outcomes();
        self.loaded_at = Some(Instant::now());
        Ok(scan.unparseable)
    }

    /// Outcome recorded for `key`, refreshing first if the snapshot is stale
    pub fn lookup(&mut self, journal: &Journal, key: &JobKey) -> Result<Option<Outcome>, JournalError> {
        if self.is_stale() {
            self.refresh(journal)?;
        }
        Ok(self.outcomes.get(key).cloned())
    }

    /// Make a record this process just appended visible without a re-read
    pub fn record(&mut self, entry: &JournalEntry) {
        self.outcomes.insert(entry.key.clone(), entry.outcome.clone());
    }
}
