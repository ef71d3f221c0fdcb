//! Runs an instrumented target against one input, or a directory of inputs
//! through a fork server, and reports the trace map it leaves behind.

pub mod batch;
pub mod config;
pub mod env;
pub mod error;
pub mod exec;
pub mod forkserver;
pub mod session;
pub mod signals;
pub mod testcase;
pub mod transform;

pub use config::Config;
pub use error::{ConfigError, HarnessError};
pub use exec::{ExecOutcome, Executor};
pub use session::{Report, Session};
pub use signals::RunSignals;
