use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use tracemap::constants::{MAP_SIZE, MAP_SIZE_ENV_VAR};
use tracemap::{ClassifyMode, CminPolicy, OutputFormat};

use crate::error::ConfigError;

/// Argument placeholder that stands in for the current input file
pub const PLACEHOLDER: &str = "@@";

/// Default memory limit for the target (MB)
pub const MEM_LIMIT: u64 = 50;

/// Default memory limit under the binary translation backend (MB)
pub const MEM_LIMIT_QEMU: u64 = 200;

pub const MIN_MEM_LIMIT: u64 = 5;
pub const MIN_TIMEOUT_MS: u32 = 20;

/// Fully validated run configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Target program followed by its arguments
    pub target_argv: Vec<String>,
    /// Result destination, or the output directory in batch mode
    pub out: PathBuf,
    /// Batch mode input directory
    pub in_dir: Option<PathBuf>,
    /// File substituted for the placeholder in single-shot mode
    pub at_file: Option<PathBuf>,
    /// 0 disables the timeout
    pub timeout_ms: u32,
    /// 0 means unlimited
    pub mem_limit_mb: u64,
    pub quiet: bool,
    pub edges_only: bool,
    pub raw: bool,
    pub binary: bool,
    pub cmin_mode: bool,
    pub keep_cores: bool,
    /// Binary translation tracer, when the target is not natively instrumented
    pub qemu_trace: Option<PathBuf>,
    pub map_size: usize,
    pub cmin_policy: CminPolicy,
    /// `AFL_PRELOAD`
    pub preload: Option<String>,
    /// `LD_BIND_LAZY` was set, don't force eager binding
    pub bind_lazy: bool,
}

impl Config {
    pub fn new(target_argv: Vec<String>, out: PathBuf) -> Self {
        Self {
            target_argv,
            out,
            in_dir: None,
            at_file: None,
            timeout_ms: 0,
            mem_limit_mb: MEM_LIMIT,
            quiet: false,
            edges_only: false,
            raw: false,
            binary: false,
            cmin_mode: false,
            keep_cores: false,
            qemu_trace: None,
            map_size: MAP_SIZE,
            cmin_policy: CminPolicy::default(),
            preload: None,
            bind_lazy: false,
        }
    }

    /// Pick up the settings that are only ever passed through the environment
    pub fn load_env(&mut self) -> Result<(), ConfigError> {
        self.cmin_policy = CminPolicy::from_env();
        self.preload = env::var("AFL_PRELOAD").ok();
        self.bind_lazy = env::var_os("LD_BIND_LAZY").is_some();

        if let Some(size) = env::var_os(MAP_SIZE_ENV_VAR) {
            let size = size.to_string_lossy();
            self.map_size = match usize::from_str(&size) {
                Ok(n) if n >= 4 => n,
                _ => return Err(ConfigError::BadMapSize(size.into_owned())),
            };
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_argv.is_empty() {
            return Err(ConfigError::MissingTarget);
        }

        if self.edges_only && self.raw {
            return Err(ConfigError::Conflict('e', 'r'));
        }

        if self.at_file.is_some() && self.in_dir.is_some() {
            return Err(ConfigError::Conflict('A', 'i'));
        }

        if self.placeholder_slot()?.is_some() && self.in_dir.is_none() && self.at_file.is_none()
        {
            return Err(ConfigError::PlaceholderWithoutFile);
        }

        if self.qemu_trace.is_some() {
            if let Some(preload) = &self.preload {
                if preload.contains(',') {
                    return Err(ConfigError::CommaInPreload);
                }
            }
        }

        if let Some(arg) = self.target_argv.iter().find(|a| a.contains('\0')) {
            return Err(ConfigError::NulInArgument(arg.clone()));
        }

        Ok(())
    }

    /// Index into `target_argv` of the one argument carrying the placeholder
    pub fn placeholder_slot(&self) -> Result<Option<usize>, ConfigError> {
        find_placeholder(&self.target_argv)
    }

    pub fn classify_mode(&self) -> ClassifyMode {
        if self.edges_only {
            ClassifyMode::EdgesOnly
        } else if self.raw {
            ClassifyMode::Raw
        } else if self.binary {
            ClassifyMode::Binary
        } else {
            ClassifyMode::Human
        }
    }

    pub fn output_format(&self) -> OutputFormat {
        if self.binary {
            OutputFormat::Binary
        } else if self.cmin_mode {
            OutputFormat::CorpusMin(self.cmin_policy)
        } else {
            OutputFormat::Text
        }
    }
}

/// Index of the one argument carrying the placeholder. argv[0] never counts.
pub fn find_placeholder(argv: &[String]) -> Result<Option<usize>, ConfigError> {
    let mut slots = argv
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, a)| a.contains(PLACEHOLDER))
        .map(|(i, _)| i);

    let first = slots.next();
    if slots.next().is_some() {
        return Err(ConfigError::MultiplePlaceholders);
    }

    Ok(first)
}

/// Parse a `-m` value: `none`, or a number with an optional k/M/G/T suffix. Result in MB.
pub fn parse_mem_limit(s: &str) -> Result<u64, ConfigError> {
    if s == "none" {
        return Ok(0);
    }

    let bad = || ConfigError::BadMemLimit(s.to_string());
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or_else(|| s.len());
    let (digits, suffix) = s.split_at(split);
    let value = u64::from_str(digits).map_err(|_| bad())?;

    let mb = match suffix {
        "" | "M" => value,
        "k" => value / 1024,
        "G" => value.checked_mul(1024).ok_or_else(bad)?,
        "T" => value.checked_mul(1024 * 1024).ok_or_else(bad)?,
        _ => return Err(bad()),
    };

    if mb < MIN_MEM_LIMIT {
        return Err(ConfigError::LowMemLimit(mb));
    }

    // Has to fit RLIMIT_AS in bytes
    if mb.checked_mul(1 << 20).is_none() {
        return Err(bad());
    }

    Ok(mb)
}

/// Parse a `-t` value: `none` or milliseconds
pub fn parse_timeout(s: &str) -> Result<u32, ConfigError> {
    if s == "none" {
        return Ok(0);
    }

    let ms = u32::from_str(s).map_err(|_| ConfigError::BadTimeout(s.to_string()))?;
    if ms < MIN_TIMEOUT_MS {
        return Err(ConfigError::LowTimeout(ms));
    }

    Ok(ms)
}
