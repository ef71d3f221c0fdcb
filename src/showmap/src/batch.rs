use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};

use tracemap::{write_results, Destination, OutputFormat, Stats, TraceMap};

use crate::error::HarnessError;
use crate::exec::{ExecOutcome, Executor};
use crate::signals::RunSignals;

#[derive(Debug, Default)]
pub struct BatchSummary {
    /// Inputs executed and written out
    pub executed: u32,
    /// Stopped early because the user asked us to
    pub aborted: bool,
    /// Outcome of the last input
    pub last: Option<ExecOutcome>,
}

/// Regular, non-hidden files directly under `dir`, in name order
pub fn list_inputs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut inputs = Vec::new();

    for entry in fs::read_dir(dir)
        .with_context(|| format!("cannot open directory {}", dir.display()))?
    {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if !entry.file_type()?.is_file() {
            continue;
        }
        inputs.push(entry.path());
    }

    inputs.sort();

    Ok(inputs)
}

/// Read a whole input. Problems are only warned about; the input still runs, empty.
fn load_input(path: &Path) -> Vec<u8> {
    match fs::read(path) {
        Ok(data) => {
            if data.is_empty() {
                warn!("Zero-sized input file '{}'.", path.display());
            }
            data
        }
        Err(e) => {
            warn!("Unable to open '{}': {}", path.display(), e);
            Vec::new()
        }
    }
}

/// Create `out_dir` (mode 0700) unless it already exists
pub fn prepare_out_dir(out_dir: &Path) -> Result<()> {
    if !out_dir.is_dir() {
        DirBuilder::new()
            .mode(0o700)
            .create(out_dir)
            .with_context(|| format!("cannot create output directory {}", out_dir.display()))?;
    }

    Ok(())
}

/// Run every input and write one result per input into `out_dir`, under the
/// input's own name. `inputs` comes from [`list_inputs`] and `out_dir` from
/// [`prepare_out_dir`], both done before the target is ever started.
pub fn run_batch<E: Executor>(
    executor: &mut E,
    map: &mut TraceMap,
    inputs: &[PathBuf],
    out_dir: &Path,
    format: OutputFormat,
    signals: &RunSignals,
    stats: &mut Stats,
) -> Result<BatchSummary> {
    let mut summary = BatchSummary::default();

    for path in inputs {
        if signals.aborted() {
            summary.aborted = true;
            break;
        }

        let input = load_input(path);
        let outcome = executor.execute(map, &input)?;
        if outcome == ExecOutcome::ExecFailed {
            return Err(HarnessError::ExecFailed(executor.target()).into());
        }

        // `list_inputs` only hands out paths with a file name
        let name = path.file_name().unwrap_or_default();
        let dest = Destination::File(out_dir.join(name));
        let tuples = write_results(map.as_slice(), &dest, format, outcome.run_flags(), stats)?;
        debug!("{}: {:?}, {} tuples", path.display(), outcome, tuples);

        summary.executed += 1;
        summary.last = Some(outcome);

        if outcome == ExecOutcome::Aborted || signals.aborted() {
            summary.aborted = true;
            break;
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Pretends every input byte hit the edge of the same value
    struct Echo {
        seen: Vec<Vec<u8>>,
        abort_after: Option<(usize, &'static RunSignals)>,
    }

    impl Executor for Echo {
        fn execute(&mut self, map: &mut TraceMap, input: &[u8]) -> Result<ExecOutcome> {
            map.reset();
            for &b in input {
                let slot = &mut map.as_mut_slice()[b as usize];
                *slot = slot.saturating_add(1);
            }
            self.seen.push(input.to_vec());

            if let Some((n, signals)) = self.abort_after {
                if self.seen.len() == n {
                    signals.request_abort();
                }
            }

            Ok(ExecOutcome::Success { exit_code: 0 })
        }

        fn target(&self) -> String {
            "echo".to_string()
        }
    }

    #[test]
    fn test_batch_skips_hidden_and_runs_empty() {
        let in_dir = tempdir().expect("failed to create temporary dir");
        let out_root = tempdir().expect("failed to create temporary dir");
        let out_dir = out_root.path().join("maps");

        fs::write(in_dir.path().join("a.bin"), b"AAB").unwrap();
        fs::write(in_dir.path().join(".hidden"), b"zzz").unwrap();
        fs::write(in_dir.path().join("b.bin"), b"").unwrap();
        fs::create_dir(in_dir.path().join("subdir")).unwrap();

        let mut map = TraceMap::anonymous(256).unwrap();
        let mut exec = Echo {
            seen: Vec::new(),
            abort_after: None,
        };
        let signals = RunSignals::new();
        let mut stats = Stats::default();

        let inputs = list_inputs(in_dir.path()).expect("failed to list inputs");
        prepare_out_dir(&out_dir).expect("failed to create output dir");
        let summary = run_batch(
            &mut exec,
            &mut map,
            &inputs,
            &out_dir,
            OutputFormat::Text,
            &signals,
            &mut stats,
        )
        .expect("batch failed");

        assert_eq!(summary.executed, 2);
        assert!(!summary.aborted);
        assert_eq!(exec.seen, vec![b"AAB".to_vec(), Vec::new()]);

        let mut written: Vec<_> = fs::read_dir(&out_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        written.sort();
        assert_eq!(written, vec!["a.bin", "b.bin"]);

        assert_eq!(
            fs::read_to_string(out_dir.join("a.bin")).unwrap(),
            "000065:2\n000066:1\n"
        );
        assert!(fs::read(out_dir.join("b.bin")).unwrap().is_empty());
        assert_eq!(stats.tuples, 2);
        assert_eq!(stats.total, 3);
    }

    #[test]
    fn test_batch_stops_after_abort() {
        static SIGNALS: RunSignals = RunSignals::new();

        let in_dir = tempdir().expect("failed to create temporary dir");
        let out_dir = tempdir().expect("failed to create temporary dir");
        for name in &["1", "2", "3"] {
            fs::write(in_dir.path().join(name), name.as_bytes()).unwrap();
        }

        let mut map = TraceMap::anonymous(256).unwrap();
        let mut exec = Echo {
            seen: Vec::new(),
            abort_after: Some((2, &SIGNALS)),
        };

        let inputs = list_inputs(in_dir.path()).expect("failed to list inputs");
        let summary = run_batch(
            &mut exec,
            &mut map,
            &inputs,
            out_dir.path(),
            OutputFormat::Binary,
            &SIGNALS,
            &mut Stats::default(),
        )
        .expect("batch failed");

        assert!(summary.aborted);
        assert_eq!(summary.executed, 2);
        // The in-flight input still got its result
        assert_eq!(fs::read(out_dir.path().join("2")).unwrap()[b'2' as usize], 1);
        assert!(!out_dir.path().join("3").exists());
    }

    #[test]
    fn test_missing_input_dir() {
        assert!(list_inputs(Path::new("/nonexistent/showmap/inputs")).is_err());
    }

    #[test]
    fn test_out_dir_created_private() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempdir().expect("failed to create temporary dir");
        let out_dir = root.path().join("maps");

        prepare_out_dir(&out_dir).expect("failed to create output dir");
        let mode = fs::metadata(&out_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        // Existing directories are fine
        prepare_out_dir(&out_dir).expect("failed to reuse output dir");
    }
}
