//! Trace map plumbing shared by the harness and instrumented targets: the
//! shared hit count buffer, count classification, and result serialization.

pub mod classify;
pub mod constants;
pub mod output;
pub mod shm;
pub mod stats;

pub use classify::{classify, ClassifyMode};
pub use output::{write_results, CminPolicy, Destination, OutputFormat, RunFlags};
pub use shm::TraceMap;
pub use stats::Stats;
