use std::ffi::CString;
use std::iter;
use std::ptr;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};

use anyhow::{Context, Result};
use log::debug;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup2, fork, setsid, ForkResult, Pid};

use tracemap::constants::MSAN_ERROR;
use tracemap::{classify, ClassifyMode, RunFlags, TraceMap};

use crate::env::TargetEnv;
use crate::signals::{arm_timer, disarm_timer, RunSignals};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashCause {
    Signal(Signal),
    /// Exited with the code MSAN reports bugs with
    Sanitizer,
}

/// What one execution of the target did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Success { exit_code: i32 },
    TimedOut,
    Crashed(CrashCause),
    /// The target image could not be loaded
    ExecFailed,
    /// The user asked us to stop while this execution was in flight
    Aborted,
}

impl ExecOutcome {
    pub fn timed_out(&self) -> bool {
        matches!(self, ExecOutcome::TimedOut)
    }

    pub fn crashed(&self) -> bool {
        matches!(self, ExecOutcome::Crashed(_))
    }

    pub fn run_flags(&self) -> RunFlags {
        RunFlags {
            timed_out: self.timed_out(),
            crashed: self.crashed(),
        }
    }

    /// Process exit code this outcome maps to
    pub fn exit_code(&self) -> i32 {
        2 * self.crashed() as i32 + self.timed_out() as i32
    }

    /// Whether the map holds counts from a real run and should be classified.
    /// A child killed by an abort still ran; its partial counts get written.
    fn ran(&self) -> bool {
        !matches!(self, ExecOutcome::ExecFailed)
    }
}

/// Decide how an execution ended.
///
/// The exec failure sentinel beats everything, then a timeout beats whatever
/// the exit status says. A child we killed because of an abort is not a crash.
pub fn classify_outcome(
    exec_failed: bool,
    status: WaitStatus,
    timed_out: bool,
    aborted: bool,
) -> ExecOutcome {
    if exec_failed {
        return ExecOutcome::ExecFailed;
    }

    if timed_out {
        return ExecOutcome::TimedOut;
    }

    match status {
        WaitStatus::Signaled(_, _, _) if aborted => ExecOutcome::Aborted,
        WaitStatus::Signaled(_, sig, _) => ExecOutcome::Crashed(CrashCause::Signal(sig)),
        WaitStatus::Exited(_, MSAN_ERROR) => ExecOutcome::Crashed(CrashCause::Sanitizer),
        WaitStatus::Exited(_, code) => ExecOutcome::Success { exit_code: code },
        _ => ExecOutcome::Success { exit_code: 0 },
    }
}

/// Run the count classifier over `map`, but only if `outcome` came from a real run
pub fn finish_map(map: &mut TraceMap, outcome: ExecOutcome, mode: ClassifyMode) {
    if outcome.ran() {
        classify(map.as_mut_slice(), mode);
    }
}

/// Runs one input through the target
pub trait Executor {
    fn execute(&mut self, map: &mut TraceMap, input: &[u8]) -> Result<ExecOutcome>;

    /// Program being run, for error messages
    fn target(&self) -> String;
}

/// Everything a freshly forked child needs to become the target.
///
/// All allocation happens up front, including the NULL terminated pointer
/// arrays `execve(2)` takes: between `fork(2)` and `execve(2)` the child only
/// issues raw syscalls.
pub struct ChildSetup {
    path: CString,
    /// Backing storage for `argv_ptrs`
    _argv: Vec<CString>,
    /// Backing storage for `envp_ptrs`
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
    mem_limit_mb: u64,
    keep_cores: bool,
    dev_null: Option<File>,
}

impl ChildSetup {
    pub fn new(
        argv: &[String],
        env: &TargetEnv,
        mem_limit_mb: u64,
        keep_cores: bool,
        quiet: bool,
    ) -> Result<Self> {
        let argv = argv
            .iter()
            .map(|a| CString::new(a.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| "Target argument contains NUL")?;

        let path = argv
            .first()
            .cloned()
            .with_context(|| "Empty target command line")?;

        let dev_null = if quiet {
            Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open("/dev/null")
                    .with_context(|| "Unable to open /dev/null")?,
            )
        } else {
            None
        };

        let envp = env.to_envp()?;

        Ok(Self {
            path,
            argv_ptrs: null_terminated(&argv),
            envp_ptrs: null_terminated(&envp),
            _argv: argv,
            _envp: envp,
            mem_limit_mb,
            keep_cores,
            dev_null,
        })
    }

    pub fn target(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Fork a child that execs the target. `redirects` are `(from, to)` descriptor pairs
    /// installed in the child before exec.
    pub fn spawn(&self, map: &mut TraceMap, redirects: &[(RawFd, RawFd)]) -> Result<Pid> {
        match unsafe { fork() }.with_context(|| "fork() failed")? {
            ForkResult::Parent { child } => {
                debug!("Spawned {} as pid {}", self.target(), child);
                Ok(child)
            }
            // Never return from the child branch. Either exec succeeds or we `_exit`.
            ForkResult::Child => self.exec_child(map, redirects),
        }
    }

    fn exec_child(&self, map: &mut TraceMap, redirects: &[(RawFd, RawFd)]) -> ! {
        if let Some(null) = &self.dev_null {
            let fd = null.as_raw_fd();
            if dup2(fd, libc::STDOUT_FILENO).is_err() || dup2(fd, libc::STDERR_FILENO).is_err() {
                map.mark_exec_failed();
                unsafe { libc::_exit(1) };
            }
        }

        for &(from, to) in redirects {
            if dup2(from, to).is_err() {
                map.mark_exec_failed();
                unsafe { libc::_exit(1) };
            }
        }

        // Ignore errors
        unsafe {
            if self.mem_limit_mb > 0 {
                let bytes = self.mem_limit_mb.saturating_mul(1 << 20) as libc::rlim_t;
                let r = libc::rlimit {
                    rlim_cur: bytes,
                    rlim_max: bytes,
                };
                libc::setrlimit(libc::RLIMIT_AS, &r);
            }

            let core = if self.keep_cores { libc::RLIM_INFINITY } else { 0 };
            let r = libc::rlimit {
                rlim_cur: core,
                rlim_max: core,
            };
            libc::setrlimit(libc::RLIMIT_CORE, &r);
        }

        // Keep our job control signals away from the target
        let _ = setsid();

        unsafe {
            libc::execve(
                self.path.as_ptr(),
                self.argv_ptrs.as_ptr(),
                self.envp_ptrs.as_ptr(),
            )
        };

        // Only reached if the exec failed
        map.mark_exec_failed();
        unsafe { libc::_exit(0) }
    }
}

/// Pointers into `strings`, followed by NULL. Moving the `Vec<CString>`
/// afterwards does not move the string buffers.
fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(iter::once(ptr::null()))
        .collect()
}

/// Spawns the target from scratch for every execution
pub struct DirectExecutor {
    setup: ChildSetup,
    timeout_ms: u32,
    signals: &'static RunSignals,
}

impl DirectExecutor {
    pub fn new(setup: ChildSetup, timeout_ms: u32, signals: &'static RunSignals) -> Self {
        Self {
            setup,
            timeout_ms,
            signals,
        }
    }

    pub fn setup(&self) -> &ChildSetup {
        &self.setup
    }

    /// Run the target once. Counts in `map` are left raw.
    pub fn run(&mut self, map: &mut TraceMap) -> Result<ExecOutcome> {
        map.reset();
        self.signals.begin(0);

        let child = self.setup.spawn(map, &[])?;
        self.signals.track_child(child.as_raw());

        arm_timer(self.timeout_ms)?;
        let status = waitpid(child, None).with_context(|| "waitpid() failed");
        self.signals.untrack_child();
        disarm_timer()?;
        let status = status?;

        map.barrier();

        Ok(classify_outcome(
            map.exec_failed(),
            status,
            self.signals.timed_out(),
            self.signals.aborted(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid() -> Pid {
        Pid::from_raw(42)
    }

    #[test]
    fn test_exec_failure_wins() {
        for status in &[
            WaitStatus::Exited(pid(), 0),
            WaitStatus::Exited(pid(), 1),
            WaitStatus::Signaled(pid(), Signal::SIGSEGV, false),
        ] {
            assert_eq!(
                classify_outcome(true, *status, true, false),
                ExecOutcome::ExecFailed
            );
        }
    }

    #[test]
    fn test_timeout_beats_crash() {
        let status = WaitStatus::Signaled(pid(), Signal::SIGKILL, false);
        let outcome = classify_outcome(false, status, true, false);
        assert_eq!(outcome, ExecOutcome::TimedOut);
        assert!(!outcome.crashed());
        assert_eq!(outcome.exit_code(), 1);
    }

    #[test]
    fn test_signals_and_exits() {
        let segv = WaitStatus::Signaled(pid(), Signal::SIGSEGV, true);
        assert_eq!(
            classify_outcome(false, segv, false, false),
            ExecOutcome::Crashed(CrashCause::Signal(Signal::SIGSEGV))
        );
        assert_eq!(classify_outcome(false, segv, false, false).exit_code(), 2);
        assert_eq!(
            classify_outcome(false, segv, false, true),
            ExecOutcome::Aborted
        );
        assert_eq!(
            classify_outcome(false, WaitStatus::Exited(pid(), MSAN_ERROR), false, false),
            ExecOutcome::Crashed(CrashCause::Sanitizer)
        );
        assert_eq!(
            classify_outcome(false, WaitStatus::Exited(pid(), 3), false, false),
            ExecOutcome::Success { exit_code: 3 }
        );
    }

    #[test]
    fn test_finish_map_skips_failed_runs() {
        let mut map = TraceMap::anonymous(8).unwrap();
        map.as_mut_slice()[5] = 200;

        finish_map(&mut map, ExecOutcome::ExecFailed, ClassifyMode::Human);
        assert_eq!(map.as_slice()[5], 200);

        finish_map(&mut map, ExecOutcome::TimedOut, ClassifyMode::Human);
        assert_eq!(map.as_slice()[5], 8);
    }

    #[test]
    fn test_exec_arrays_null_terminated() {
        let strings = vec![CString::new("a").unwrap(), CString::new("bc").unwrap()];
        let ptrs = null_terminated(&strings);
        let moved = strings;

        assert_eq!(ptrs.len(), 3);
        assert!(ptrs[2].is_null());
        assert_eq!(ptrs[1], moved[1].as_ptr());
        assert_eq!(unsafe { std::ffi::CStr::from_ptr(ptrs[0]) }.to_bytes(), b"a");
    }

    #[test]
    fn test_finish_map_buckets_aborted_runs() {
        let mut map = TraceMap::anonymous(8).unwrap();
        map.as_mut_slice()[5] = 40;

        finish_map(&mut map, ExecOutcome::Aborted, ClassifyMode::Human);
        assert_eq!(map.as_slice()[5], 7);
    }
}
