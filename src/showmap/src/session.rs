use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};

use tracemap::{write_results, Destination, Stats, TraceMap};

use crate::batch;
use crate::config::Config;
use crate::env::TargetEnv;
use crate::error::HarnessError;
use crate::exec::{finish_map, ChildSetup, CrashCause, DirectExecutor, ExecOutcome};
use crate::forkserver::Forkserver;
use crate::signals::RunSignals;
use crate::testcase::{substitute, Testcase};
use crate::transform::{ArgvTransform, Native, QemuTrace};

/// What a whole session did
#[derive(Debug, Default)]
pub struct Report {
    pub stats: Stats,
    /// Outcome of the last execution
    pub last: Option<ExecOutcome>,
    pub aborted: bool,
}

impl Report {
    /// `2 * crashed + timed_out` of the last execution, 1 after an abort
    pub fn exit_code(&self) -> i32 {
        if self.aborted {
            return 1;
        }

        self.last.map(|o| o.exit_code()).unwrap_or(0)
    }
}

/// One harness session: a trace map, the environment the target sees, and
/// the signals that steer execution.
pub struct Session {
    config: Config,
    map: TraceMap,
    env: TargetEnv,
    transform: Box<dyn ArgvTransform>,
    signals: &'static RunSignals,
    stats: Stats,
}

impl Session {
    pub fn new(config: Config, signals: &'static RunSignals) -> Result<Self> {
        config.validate()?;

        let transform: Box<dyn ArgvTransform> = match &config.qemu_trace {
            Some(tracer) => Box::new(QemuTrace::new(tracer.clone())),
            None => Box::new(Native),
        };

        let map = TraceMap::create(config.map_size).with_context(|| "shmget() failed")?;
        let env = TargetEnv::prepare(TargetEnv::inherit(), &config, &map, transform.as_ref());

        Ok(Self {
            config,
            map,
            env,
            transform,
            signals,
            stats: Stats::default(),
        })
    }

    pub fn map(&self) -> &TraceMap {
        &self.map
    }

    pub fn run(&mut self) -> Result<Report> {
        match self.config.in_dir.clone() {
            Some(in_dir) => self.run_batch(&in_dir),
            None => self.run_single(),
        }
    }

    fn child_setup(&self, argv: &[String]) -> Result<ChildSetup> {
        ChildSetup::new(
            argv,
            &self.env,
            self.config.mem_limit_mb,
            self.config.keep_cores,
            self.config.quiet,
        )
    }

    /// Spawn the target once, directly, with whatever stdin we have
    fn run_single(&mut self) -> Result<Report> {
        let mut argv = self.transform.rewrite(&self.config.target_argv);
        if let (Some(slot), Some(at_file)) = (
            crate::config::find_placeholder(&argv)?,
            self.config.at_file.as_ref(),
        ) {
            argv = substitute(&argv, slot, at_file);
        }

        let setup = self.child_setup(&argv)?;
        let target = setup.target();
        let mut executor = DirectExecutor::new(setup, self.config.timeout_ms, self.signals);

        info!("Executing '{}'...", target);
        if !self.config.quiet {
            info!("-- Program output begins --");
        }

        let outcome = executor.run(&mut self.map)?;
        if outcome == ExecOutcome::ExecFailed {
            return Err(HarnessError::ExecFailed(target).into());
        }
        finish_map(&mut self.map, outcome, self.config.classify_mode());

        if !self.config.quiet {
            info!("-- Program output ends --");
            match outcome {
                ExecOutcome::TimedOut => warn!("+++ Program timed off +++"),
                ExecOutcome::Aborted => warn!("+++ Program aborted by user +++"),
                ExecOutcome::Crashed(CrashCause::Signal(sig)) => {
                    warn!("+++ Program killed by signal {} +++", sig as i32)
                }
                ExecOutcome::Crashed(CrashCause::Sanitizer) => {
                    warn!("+++ Program reported a sanitizer error +++")
                }
                _ => (),
            }
        }

        write_results(
            self.map.as_slice(),
            &Destination::resolve(&self.config.out),
            self.config.output_format(),
            outcome.run_flags(),
            &mut self.stats,
        )?;

        Ok(Report {
            stats: self.stats,
            last: Some(outcome),
            aborted: outcome == ExecOutcome::Aborted || self.signals.aborted(),
        })
    }

    /// Bring up a fork server and push every input in `in_dir` through it
    fn run_batch(&mut self, in_dir: &Path) -> Result<Report> {
        // Directory problems are setup errors, found before the target ever runs
        let inputs = batch::list_inputs(in_dir)?;
        batch::prepare_out_dir(&self.config.out)?;

        let mut argv = self.transform.rewrite(&self.config.target_argv);
        let testcase = match crate::config::find_placeholder(&argv)? {
            Some(slot) => {
                let tc = Testcase::named()?;
                if let Some(path) = tc.path() {
                    argv = substitute(&argv, slot, path);
                }
                tc
            }
            None => Testcase::stdin()?,
        };

        let setup = self.child_setup(&argv)?;
        info!("Executing '{}'...", setup.target());

        let mut forkserver = Forkserver::start(
            &setup,
            testcase,
            &mut self.map,
            self.config.timeout_ms,
            self.config.classify_mode(),
            self.signals,
        )?;

        let summary = batch::run_batch(
            &mut forkserver,
            &mut self.map,
            &inputs,
            &self.config.out,
            self.config.output_format(),
            self.signals,
            &mut self.stats,
        )?;

        if summary.aborted {
            warn!("+++ showmap folder mode aborted by user +++");
        }
        info!("Processed {} input files.", summary.executed);

        Ok(Report {
            stats: self.stats,
            last: summary.last,
            aborted: summary.aborted,
        })
    }
}

#[test]
fn test_report_exit_code() {
    let mut report = Report::default();
    assert_eq!(report.exit_code(), 0);

    report.last = Some(ExecOutcome::TimedOut);
    assert_eq!(report.exit_code(), 1);

    report.last = Some(ExecOutcome::Crashed(CrashCause::Sanitizer));
    assert_eq!(report.exit_code(), 2);

    report.aborted = true;
    assert_eq!(report.exit_code(), 1);
}
