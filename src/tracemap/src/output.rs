use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::stats::Stats;

/// Where a result goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Existing node under /dev, opened for writing
    Device(PathBuf),
    /// Our own stdout (`-`)
    Stdout,
    /// Regular file, created exclusively after unlinking whatever was there
    File(PathBuf),
}

impl Destination {
    pub fn resolve<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.starts_with("/dev/") {
            Destination::Device(path.to_path_buf())
        } else if path.as_os_str() == "-" {
            Destination::Stdout
        } else {
            Destination::File(path.to_path_buf())
        }
    }

    fn open(&self) -> Result<File> {
        match self {
            Destination::Device(path) => OpenOptions::new()
                .write(true)
                .open(path)
                .with_context(|| format!("Unable to open '{}'", path.display())),
            Destination::Stdout => {
                let fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
                if fd < 0 {
                    bail!("Unable to open stdout: {}", std::io::Error::last_os_error());
                }
                Ok(unsafe { File::from_raw_fd(fd) })
            }
            Destination::File(path) => {
                // Ignore errors
                let _ = fs::remove_file(path);
                OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(path)
                    .with_context(|| format!("Unable to create '{}'", path.display()))
            }
        }
    }
}

/// Which runs a corpus minimizer wants to see tuples for
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CminPolicy {
    /// Only report crashing runs
    pub crashes_only: bool,
    /// Report regardless of crash status
    pub allow_any: bool,
}

impl CminPolicy {
    pub fn from_env() -> Self {
        Self {
            crashes_only: env::var_os("AFL_CMIN_CRASHES_ONLY").is_some(),
            allow_any: env::var_os("AFL_CMIN_ALLOW_ANY").is_some(),
        }
    }

    fn suppresses(&self, run: RunFlags) -> bool {
        run.timed_out || (!self.allow_any && run.crashed != self.crashes_only)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// The whole map, verbatim
    Binary,
    /// `index:count` per non-zero entry
    Text,
    /// `<count><index>` per non-zero entry, as the corpus minimizer parses it
    CorpusMin(CminPolicy),
}

/// How the run that produced the map ended
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunFlags {
    pub timed_out: bool,
    pub crashed: bool,
}

/// Serialize `map` to `dest`. Returns the number of non-zero entries.
///
/// `stats` is updated with every non-zero entry, whether or not a line was emitted for it.
pub fn write_results(
    map: &[u8],
    dest: &Destination,
    format: OutputFormat,
    run: RunFlags,
    stats: &mut Stats,
) -> Result<u32> {
    let file = dest.open()?;
    let mut tuples = 0;

    for &count in map.iter().filter(|&&c| c != 0) {
        tuples += 1;
        stats.record(count);
    }

    let mut out = BufWriter::new(file);
    match format {
        OutputFormat::Binary => out.write_all(map)?,
        OutputFormat::Text => {
            for (i, &count) in map.iter().enumerate().filter(|(_, c)| **c != 0) {
                writeln!(out, "{:06}:{}", i, count)?;
            }
        }
        OutputFormat::CorpusMin(policy) => {
            if !policy.suppresses(run) {
                for (i, &count) in map.iter().enumerate().filter(|(_, c)| **c != 0) {
                    writeln!(out, "{}{}", count, i)?;
                }
            }
        }
    }
    out.flush()
        .with_context(|| format!("Short write to {:?}", dest))?;

    Ok(tuples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_map() -> Vec<u8> {
        let mut map = vec![0u8; 1024];
        map[3] = 1;
        map[100] = 8;
        map[1023] = 4;
        map
    }

    #[test]
    fn test_resolve() {
        assert_eq!(Destination::resolve("-"), Destination::Stdout);
        assert_eq!(
            Destination::resolve("/dev/null"),
            Destination::Device(PathBuf::from("/dev/null"))
        );
        assert_eq!(
            Destination::resolve("/tmp/devices"),
            Destination::File(PathBuf::from("/tmp/devices"))
        );
    }

    #[test]
    fn test_binary_round_trip() {
        let dir = tempdir().expect("failed to create temporary dir");
        let path = dir.path().join("map");
        let map = sample_map();
        let mut stats = Stats::default();

        let n = write_results(
            &map,
            &Destination::resolve(&path),
            OutputFormat::Binary,
            RunFlags::default(),
            &mut stats,
        )
        .expect("failed to write results");

        assert_eq!(n, 3);
        assert_eq!(fs::read(&path).expect("failed to read back"), map);
        assert_eq!(stats.highest, 8);
        assert_eq!(stats.total, 13);
    }

    #[test]
    fn test_text_format() {
        let dir = tempdir().expect("failed to create temporary dir");
        let path = dir.path().join("map.txt");
        let mut stats = Stats::default();

        write_results(
            &sample_map(),
            &Destination::resolve(&path),
            OutputFormat::Text,
            RunFlags::default(),
            &mut stats,
        )
        .expect("failed to write results");

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "000003:1\n000100:8\n001023:4\n");
    }

    #[test]
    fn test_existing_file_replaced() {
        let dir = tempdir().expect("failed to create temporary dir");
        let path = dir.path().join("map.txt");
        fs::write(&path, "stale contents that are long").unwrap();

        write_results(
            &[0u8, 2],
            &Destination::resolve(&path),
            OutputFormat::Text,
            RunFlags::default(),
            &mut Stats::default(),
        )
        .expect("failed to write results");

        assert_eq!(fs::read_to_string(&path).unwrap(), "000001:2\n");
    }

    #[test]
    fn test_cmin_format() {
        let dir = tempdir().expect("failed to create temporary dir");
        let path = dir.path().join("cmin");

        write_results(
            &sample_map(),
            &Destination::resolve(&path),
            OutputFormat::CorpusMin(CminPolicy::default()),
            RunFlags::default(),
            &mut Stats::default(),
        )
        .expect("failed to write results");

        assert_eq!(fs::read_to_string(&path).unwrap(), "13\n8100\n41023\n");
    }

    #[test]
    fn test_cmin_lines_unseparated() {
        let dir = tempdir().expect("failed to create temporary dir");
        let path = dir.path().join("cmin");
        let mut map = vec![0u8; 64];
        map[3] = 12;
        map[23] = 1;

        write_results(
            &map,
            &Destination::resolve(&path),
            OutputFormat::CorpusMin(CminPolicy::default()),
            RunFlags::default(),
            &mut Stats::default(),
        )
        .expect("failed to write results");

        // Count then index with nothing between. With raw counts different
        // tuples can print the same line; bucketed counts are a single digit.
        assert_eq!(fs::read(&path).unwrap(), b"123\n123\n");
    }

    #[test]
    fn test_cmin_timeout_writes_nothing() {
        let dir = tempdir().expect("failed to create temporary dir");
        let path = dir.path().join("cmin");
        let mut stats = Stats::default();
        let policy = CminPolicy {
            crashes_only: false,
            allow_any: true,
        };

        let n = write_results(
            &sample_map(),
            &Destination::resolve(&path),
            OutputFormat::CorpusMin(policy),
            RunFlags {
                timed_out: true,
                crashed: false,
            },
            &mut stats,
        )
        .expect("failed to write results");

        assert_eq!(n, 3);
        assert!(fs::read(&path).unwrap().is_empty());
        assert_eq!(stats.tuples, 3);
    }

    #[test]
    fn test_cmin_crash_policy() {
        let run_crashed = RunFlags {
            timed_out: false,
            crashed: true,
        };
        let run_ok = RunFlags::default();

        let default = CminPolicy::default();
        assert!(default.suppresses(run_crashed));
        assert!(!default.suppresses(run_ok));

        let crashes_only = CminPolicy {
            crashes_only: true,
            allow_any: false,
        };
        assert!(!crashes_only.suppresses(run_crashed));
        assert!(crashes_only.suppresses(run_ok));

        let any = CminPolicy {
            crashes_only: false,
            allow_any: true,
        };
        assert!(!any.suppresses(run_crashed));
        assert!(!any.suppresses(run_ok));
    }
}
