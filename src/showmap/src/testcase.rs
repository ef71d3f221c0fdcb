use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::config::PLACEHOLDER;

/// Rewrite argument `slot` so the placeholder names `path`
pub fn substitute(argv: &[String], slot: usize, path: &Path) -> Vec<String> {
    let mut out = argv.to_vec();
    out[slot] = argv[slot].replace(PLACEHOLDER, &path.to_string_lossy());
    out
}

enum Delivery {
    /// Descriptor the target inherits as its stdin. Rewound and truncated for every input.
    Stdin(File),
    /// File named on the target's command line
    Named { path: PathBuf, _dir: TempDir },
}

/// Where the fork server's children find the current input
pub struct Testcase {
    delivery: Delivery,
}

impl Testcase {
    pub fn stdin() -> Result<Self> {
        let file = tempfile::tempfile().with_context(|| "Failed to create stdin testcase file")?;
        Ok(Self {
            delivery: Delivery::Stdin(file),
        })
    }

    /// Input goes to a file in a private scratch directory
    pub fn named() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("showmap")
            .tempdir()
            .with_context(|| "Failed to create testcase directory")?;
        let path = dir.path().join(".cur_input");

        Ok(Self {
            delivery: Delivery::Named { path, _dir: dir },
        })
    }

    /// Path the target should be told to read, if it reads a file
    pub fn path(&self) -> Option<&Path> {
        match &self.delivery {
            Delivery::Stdin(_) => None,
            Delivery::Named { path, .. } => Some(path),
        }
    }

    /// Descriptor to install as the target's stdin, if it reads stdin
    pub fn stdin_fd(&self) -> Option<RawFd> {
        match &self.delivery {
            Delivery::Stdin(file) => Some(file.as_raw_fd()),
            Delivery::Named { .. } => None,
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.delivery {
            Delivery::Stdin(file) => {
                file.seek(SeekFrom::Start(0))?;
                file.write_all(data)?;
                file.set_len(data.len() as u64)?;
                file.seek(SeekFrom::Start(0))?;
            }
            Delivery::Named { path, .. } => {
                // Ignore errors
                let _ = fs::remove_file(path.as_path());
                let mut file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(path.as_path())
                    .with_context(|| format!("Unable to create '{}'", path.display()))?;
                file.write_all(data)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_substitute() {
        let argv: Vec<String> = vec!["./t".into(), "-x".into(), "--in=@@".into()];
        let out = substitute(&argv, 2, Path::new("/tmp/a"));
        assert_eq!(out, vec!["./t", "-x", "--in=/tmp/a"]);
    }

    #[test]
    fn test_stdin_rewound_and_truncated() {
        let mut tc = Testcase::stdin().expect("failed to create testcase");
        assert!(tc.path().is_none());

        tc.write(b"a much longer first input").unwrap();
        tc.write(b"short").unwrap();

        let fd = tc.stdin_fd().unwrap();
        let mut file = unsafe { <File as std::os::unix::io::FromRawFd>::from_raw_fd(libc::dup(fd)) };
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"short");
    }

    #[test]
    fn test_named_rewritten() {
        let mut tc = Testcase::named().expect("failed to create testcase");
        assert!(tc.stdin_fd().is_none());

        tc.write(b"first").unwrap();
        tc.write(b"2nd").unwrap();
        assert_eq!(fs::read(tc.path().unwrap()).unwrap(), b"2nd");
    }
}
