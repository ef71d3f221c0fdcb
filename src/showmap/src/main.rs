use std::path::PathBuf;
use std::process::exit;

use anyhow::Result;
use env_logger::Env;
use log::info;
use structopt::StructOpt;

use showmap::config::{parse_mem_limit, parse_timeout, MEM_LIMIT, MEM_LIMIT_QEMU};
use showmap::{Config, HarnessError, RunSignals, Session};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "showmap",
    about = "Run an instrumented target and display the contents of its trace map"
)]
struct Opt {
    /// File to write the trace data to (`-` for stdout)
    ///
    /// With `--input-dir` this is a directory and each map is written there individually.
    #[structopt(short, parse(from_os_str))]
    out: PathBuf,

    /// Process all files in this directory through a fork server
    #[structopt(short = "i", long = "input-dir", parse(from_os_str))]
    in_dir: Option<PathBuf>,

    /// Timeout for each run in milliseconds, or `none`
    #[structopt(short, parse(try_from_str = parse_timeout))]
    timeout: Option<u32>,

    /// Memory limit for the child process in megabytes (k/M/G/T suffixes), or `none`
    #[structopt(short, parse(try_from_str = parse_mem_limit))]
    mem_limit: Option<u64>,

    /// File substituted for @@ in the target arguments
    #[structopt(short = "A", parse(from_os_str))]
    at_file: Option<PathBuf>,

    /// Sink the program's output and don't show messages
    #[structopt(short)]
    quiet: bool,

    /// Show edge coverage only, ignore hit counts
    #[structopt(short)]
    edges_only: bool,

    /// Show real tuple values instead of bucketed ones
    #[structopt(short)]
    raw: bool,

    /// Write the map in raw binary form
    #[structopt(short)]
    binary: bool,

    /// Write output in the syntax expected by the corpus minimizer
    #[structopt(short = "Z")]
    cmin_mode: bool,

    /// Allow core dumps
    #[structopt(short = "c")]
    keep_cores: bool,

    /// Run the target under the binary translating tracer
    #[structopt(short = "Q")]
    qemu: bool,

    /// Tracer used by `-Q`
    #[structopt(long, parse(from_os_str), default_value = "afl-qemu-trace")]
    qemu_trace: PathBuf,

    /// Target program and its arguments
    #[structopt(last = true, required = true)]
    target: Vec<String>,
}

impl Opt {
    fn into_config(self) -> Result<Config> {
        let mut config = Config::new(self.target, self.out);
        config.load_env()?;

        let default_mem_limit = if self.qemu { MEM_LIMIT_QEMU } else { MEM_LIMIT };

        config.in_dir = self.in_dir;
        config.at_file = self.at_file;
        config.timeout_ms = self.timeout.unwrap_or(0);
        config.mem_limit_mb = self.mem_limit.unwrap_or(default_mem_limit);
        config.quiet = self.quiet || self.cmin_mode;
        config.edges_only = self.edges_only;
        config.raw = self.raw;
        config.binary = self.binary;
        config.cmin_mode = self.cmin_mode;
        config.keep_cores = self.keep_cores;
        if self.qemu {
            config.qemu_trace = Some(self.qemu_trace);
        }

        config.validate()?;

        Ok(config)
    }
}

fn _main() -> Result<i32> {
    let opts = Opt::from_args();
    let quiet = opts.quiet || opts.cmin_mode;

    env_logger::Builder::from_env(Env::default().default_filter_or(if quiet {
        "warn"
    } else {
        "info"
    }))
    .init();

    let config = opts.into_config()?;
    let out = config.out.clone();

    let signals = RunSignals::install()?;
    let mut session = Session::new(config, signals)?;
    let report = session.run()?;

    if !quiet {
        if report.stats.tuples == 0 {
            return Err(HarnessError::NoInstrumentation.into());
        }

        info!(
            "Captured {} tuples (highest value {}, total values {}) in '{}'.",
            report.stats.tuples,
            report.stats.highest,
            report.stats.total,
            out.display()
        );
    }

    Ok(report.exit_code())
}

fn main() {
    match _main() {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("showmap: {:#}", e);
            exit(1);
        }
    }
}
