use std::fmt;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

/// Stem suffix carried by every final output
pub const OUTPUT_MARKER: &str = ".av1";
/// Stem suffix carried by in-progress outputs
pub const TEMP_MARKER: &str = ".av1.partial";

const OUTPUT_SUFFIX: &str = "av1.mkv";
const TEMP_SUFFIX: &str = "partial.mkv";

/// Identity of a job: the input file and the output derived from it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub input: PathBuf,
    pub output: PathBuf,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.input.display(), self.output.display())
    }
}

/// A unit of work discovered in the input directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub key: JobKey,
    /// Where the transform writes before the atomic rename
    pub temp_output: PathBuf,
}

impl Job {
    pub fn new(input: PathBuf) -> Self {
        let output = output_path_for(&input);
        let temp_output = temp_path_for(&output);
        Self {
            key: JobKey { input, output },
            temp_output,
        }
    }

    pub fn input(&self) -> &Path {
        &self.key.input
    }

    pub fn output(&self) -> &Path {
        &self.key.output
    }
}

/// `Movie.mp4` -> `Movie.av1.mkv`, in the same directory
pub fn output_path_for(input: &Path) -> PathBuf {
    input.with_extension(OUTPUT_SUFFIX)
}

/// `Movie.av1.mkv` -> `Movie.av1.partial.mkv`, next to the output so the final
/// rename never crosses filesystems.
///
/// Derived from the output rather than the input: every output ends in
/// `.av1.mkv`, so no input can ever have this path as its output.
pub fn temp_path_for(output: &Path) -> PathBuf {
    output.with_extension(TEMP_SUFFIX)
}

/// True for files produced by a previous transform (final or temporary)
pub fn is_marked_output(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|stem| {
            let stem = stem.to_lowercase();
            stem.ends_with(OUTPUT_MARKER) || stem.ends_with(TEMP_MARKER)
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_output_and_temp_paths() {
        let job = Job::new(PathBuf::from("/media/shows/Episode 01.mp4"));
        assert_eq!(job.output(), Path::new("/media/shows/Episode 01.av1.mkv"));
        assert_eq!(job.temp_output, PathBuf::from("/media/shows/Episode 01.av1.partial.mkv"));
        assert_ne!(job.output(), job.temp_output.as_path());
    }

    #[test]
    fn test_temp_path_is_never_another_jobs_output() {
        let dir = Path::new("/m");
        let movie = Job::new(dir.join("Movie.mp4"));
        let tmp_named = Job::new(dir.join("Movie.tmp.mkv"));
        let partial_named = Job::new(dir.join("Movie.av1.partial.mkv"));

        assert_eq!(tmp_named.output(), Path::new("/m/Movie.tmp.av1.mkv"));
        assert_ne!(movie.temp_output.as_path(), tmp_named.output());
        assert_ne!(movie.temp_output.as_path(), partial_named.output());
        assert!(is_marked_output(&movie.temp_output));
        assert!(is_marked_output(partial_named.input()), "temp files are never picked up as input");
    }

    #[test]
    fn test_marker_detection() {
        assert!(is_marked_output(Path::new("/m/Film.av1.mkv")));
        assert!(is_marked_output(Path::new("/m/Film.av1.partial.mkv")));
        assert!(is_marked_output(Path::new("/m/Film.tmp.av1.mkv")));
        assert!(is_marked_output(Path::new("/m/Film.AV1.MKV")));
        assert!(!is_marked_output(Path::new("/m/Film.mkv")));
        assert!(!is_marked_output(Path::new("/m/av1 documentary.mkv")));
    }

    #[test]
    fn test_multi_dot_names_keep_their_stem() {
        let job = Job::new(PathBuf::from("/m/Some.Show.S01E02.1080p.mkv"));
        assert_eq!(job.output(), Path::new("/m/Some.Show.S01E02.1080p.av1.mkv"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Every derived path is recognised as a prior output, so it is never picked up as input again
        #[test]
        fn test_derived_paths_are_marked(
            stem in "[A-Za-z0-9 _-]{1,24}",
            ext in prop_oneof![Just("mkv"), Just("mp4"), Just("avi"), Just("webm"), Just("mov")],
        ) {
            let input = PathBuf::from(format!("/library/{}.{}", stem, ext));
            prop_assert!(!is_marked_output(&input));

            let job = Job::new(input.clone());
            prop_assert!(is_marked_output(job.output()));
            prop_assert!(is_marked_output(&job.temp_output));
            prop_assert_eq!(job.output().parent(), input.parent());
            prop_assert_eq!(job.temp_output.parent(), input.parent());
            prop_assert!(!job.temp_output.to_string_lossy().ends_with(".av1.mkv"));
        }

        #[test]
        fn test_naming_is_deterministic(stem in "[A-Za-z0-9._-]{1,24}") {
            let input = PathBuf::from(format!("/library/{}.mp4", stem));
            prop_assert_eq!(Job::new(input.clone()), Job::new(input));
        }
    }
}
