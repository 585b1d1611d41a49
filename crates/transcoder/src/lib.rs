pub mod config;
pub mod job;
pub mod scan;
pub mod liveness;
pub mod flock;
pub mod registry;
pub mod journal;
pub mod ffprobe;
pub mod ffmpeg;
pub mod orchestrator;
pub mod finalize;

pub use config::TranscodeConfig;
pub use job::{Job, JobKey};
pub use liveness::{LivenessProbe, Owner, ProcessProbe};
pub use registry::{LockGuard, LockRegistry, RegistryError};
pub use journal::{Journal, JournalEntry, JournalError, JournalScan, Outcome};
pub use ffprobe::{FfprobeInspector, MediaInspector, ProbeData};
pub use ffmpeg::{FfmpegTransformer, TransformError, Transformer};
pub use orchestrator::{JobOutcome, Orchestrator, RunSummary};
