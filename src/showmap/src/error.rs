use thiserror::Error;

/// Bad or conflicting options. Reported before anything is spawned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("-{0} and -{1} are mutually exclusive")]
    Conflict(char, char),
    #[error("Bad syntax used for -m: '{0}'")]
    BadMemLimit(String),
    #[error("Dangerously low value of -m: {0} MB")]
    LowMemLimit(u64),
    #[error("Bad syntax used for -t: '{0}'")]
    BadTimeout(String),
    #[error("Dangerously low value of -t: {0} ms")]
    LowTimeout(u32),
    #[error("Bad trace map size: '{0}'")]
    BadMapSize(String),
    #[error("No target program given")]
    MissingTarget,
    #[error("Target arguments contain more than one @@ placeholder slot")]
    MultiplePlaceholders,
    #[error("Target arguments use @@ but no file was given with -A")]
    PlaceholderWithoutFile,
    #[error("Comma (',') is not allowed in AFL_PRELOAD with the binary translation backend")]
    CommaInPreload,
    #[error("Argument contains an interior NUL byte: {0:?}")]
    NulInArgument(String),
}

/// Fatal conditions that end the session
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Unable to execute '{0}'")]
    ExecFailed(String),
    #[error("Fork server protocol error: {0}")]
    Protocol(String),
    #[error("Fork server is misbehaving (OOM?): bad pid {0}")]
    ForkserverMisbehaving(i32),
    #[error("Fork server handshake failed: {0}")]
    ForkserverHandshake(String),
    #[error("Target map size {target} is larger than the harness map {ours}")]
    MapTooSmall { target: usize, ours: usize },
    #[error("No instrumentation detected")]
    NoInstrumentation,
}
