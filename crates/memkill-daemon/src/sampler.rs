//! Resident-memory sampling.
//!
//! The watchdog reads the process's resident set size once per tick. The
//! production sampler parses the `VmRSS:` line of `/proc/<pid>/status`,
//! which reports kilobytes. Reads are bounded so a path pointed at
//! something unexpected cannot balloon memory.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use thiserror::Error;

/// Maximum bytes read from the status file. The real file is a few hundred
/// bytes; 64 KiB is generous.
pub const MAX_STATUS_FILE_SIZE: u64 = 64 * 1024;

/// RSS sampling errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SampleError {
    /// Failed to read the status file.
    #[error("failed to read '{path}': {source}")]
    Read {
        /// Path that failed to read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The status file had no parseable `VmRSS:` line.
    #[error("failed to parse '{path}': {reason}")]
    Parse {
        /// Path that failed to parse.
        path: String,
        /// Reason for the parse failure.
        reason: String,
    },
}

/// Source of resident-memory samples.
pub trait RssSampler: Send + Sync {
    /// Returns the current resident set size in kilobytes.
    ///
    /// # Errors
    ///
    /// Returns a [`SampleError`] if the sample cannot be taken; the watchdog
    /// logs it and retries on the next tick.
    fn sample_kb(&self) -> Result<u64, SampleError>;
}

/// Samples RSS from a procfs `status` file.
#[derive(Debug, Clone)]
pub struct ProcStatusSampler {
    status_path: PathBuf,
}

impl ProcStatusSampler {
    /// Samples the current process via `/proc/self/status`.
    #[must_use]
    pub fn for_self() -> Self {
        Self {
            status_path: PathBuf::from("/proc/self/status"),
        }
    }

    /// Samples the process with `pid`.
    #[must_use]
    pub fn for_pid(pid: i32) -> Self {
        Self {
            status_path: PathBuf::from(format!("/proc/{pid}/status")),
        }
    }

    /// Samples from an explicit file path.
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            status_path: path.into(),
        }
    }
}

impl RssSampler for ProcStatusSampler {
    fn sample_kb(&self) -> Result<u64, SampleError> {
        let path = self.status_path.display().to_string();
        let file = File::open(&self.status_path).map_err(|source| SampleError::Read {
            path: path.clone(),
            source,
        })?;

        let mut contents = String::new();
        file.take(MAX_STATUS_FILE_SIZE)
            .read_to_string(&mut contents)
            .map_err(|source| SampleError::Read {
                path: path.clone(),
                source,
            })?;

        parse_vm_rss(&contents).ok_or(SampleError::Parse {
            path,
            reason: "no VmRSS line".to_owned(),
        })
    }
}

/// Extracts the kilobyte value from a `VmRSS:\t  123456 kB` line.
fn parse_vm_rss(contents: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let rest = line.strip_prefix("VmRSS:")?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn status_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write status");
        file
    }

    #[test]
    fn test_parses_vm_rss_line() {
        let file = status_file(
            "Name:\tsidekiq\nVmPeak:\t  900000 kB\nVmRSS:\t  123456 kB\nThreads:\t25\n",
        );
        let sampler = ProcStatusSampler::from_path(file.path());
        assert_eq!(sampler.sample_kb().expect("sample"), 123_456);
    }

    #[test]
    fn test_missing_vm_rss_is_parse_error() {
        let file = status_file("Name:\tsidekiq\nThreads:\t25\n");
        let sampler = ProcStatusSampler::from_path(file.path());
        assert!(matches!(
            sampler.sample_kb(),
            Err(SampleError::Parse { .. })
        ));
    }

    #[test]
    fn test_garbage_vm_rss_is_parse_error() {
        let file = status_file("VmRSS:\tnot-a-number kB\n");
        let sampler = ProcStatusSampler::from_path(file.path());
        assert!(matches!(
            sampler.sample_kb(),
            Err(SampleError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let sampler = ProcStatusSampler::from_path("/nonexistent/status");
        assert!(matches!(sampler.sample_kb(), Err(SampleError::Read { .. })));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_samples_own_process() {
        let sampler = ProcStatusSampler::for_self();
        let rss = sampler.sample_kb().expect("own RSS should be readable");
        assert!(rss > 0);
    }
}
