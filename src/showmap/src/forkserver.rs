use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd};

use anyhow::{Context, Result};
use log::{debug, info};
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, pipe2, read, write, Pid};

use tracemap::constants::*;
use tracemap::{ClassifyMode, TraceMap};

use crate::error::HarnessError;
use crate::exec::{classify_outcome, finish_map, ChildSetup, ExecOutcome, Executor};
use crate::signals::{arm_timer, disarm_timer, RunSignals};
use crate::testcase::Testcase;

/// How much longer than a single execution the companion may take to say hello
const FORK_WAIT_MULT: u32 = 10;

/// Client side of the fork server protocol.
///
/// The companion is the target itself, stopped right after its static
/// initialization. For every input we send a 4 byte "go" word (was the
/// previous child killed by a timeout?), read back the pid of the fresh child
/// it forked, and then read back that child's `wait(2)` status. Any short read
/// or write means the companion died or lost sync, which ends the session.
///
/// The reference implementation of the other end can be found at [0].
///
/// [0]: https://github.com/AFLplusplus/AFLplusplus/blob/stable/src/afl-forkserver.c
pub struct Forkserver {
    pid: Pid,
    /// Control pipe, we write
    ctl: File,
    /// Status pipe, we read
    st: File,
    testcase: Testcase,
    timeout_ms: u32,
    mode: ClassifyMode,
    signals: &'static RunSignals,
    prev_timed_out: bool,
    target: String,
}

impl Forkserver {
    /// Spawn the companion through `setup` and wait for its hello.
    ///
    /// `setup`'s command line must already point at `testcase`'s file if the
    /// target reads a file instead of stdin.
    pub fn start(
        setup: &ChildSetup,
        testcase: Testcase,
        map: &mut TraceMap,
        timeout_ms: u32,
        mode: ClassifyMode,
        signals: &'static RunSignals,
    ) -> Result<Self> {
        let (ctl_read, ctl_write) = pipe2(OFlag::O_CLOEXEC).with_context(|| "pipe() failed")?;
        let (st_read, st_write) = pipe2(OFlag::O_CLOEXEC).with_context(|| "pipe() failed")?;
        let ctl = unsafe { File::from_raw_fd(ctl_write) };
        let st = unsafe { File::from_raw_fd(st_read) };

        let mut redirects = vec![(ctl_read, FORKSRV_CTL_FD), (st_write, FORKSRV_ST_FD)];
        if let Some(fd) = testcase.stdin_fd() {
            redirects.push((fd, libc::STDIN_FILENO));
        }

        map.reset();
        signals.begin(0);

        let pid = setup.spawn(map, &redirects);
        let _ = close(ctl_read);
        let _ = close(st_write);
        let pid = pid?;

        // From here on dropping `server` tears the companion down
        let mut server = Self {
            pid,
            ctl,
            st,
            testcase,
            timeout_ms,
            mode,
            signals,
            prev_timed_out: false,
            target: setup.target(),
        };

        signals.track_child(pid.as_raw());
        arm_timer(timeout_ms.saturating_mul(FORK_WAIT_MULT))?;
        let hello = server.recv();
        signals.untrack_child();
        disarm_timer()?;

        match hello {
            Some(word) => server.check_hello(u32::from_ne_bytes(word), map)?,
            None => return Err(server.diagnose_handshake(map)),
        }

        info!("All right - fork server is up.");

        Ok(server)
    }

    fn check_hello(&self, hello: u32, map: &TraceMap) -> Result<()> {
        debug!("Fork server hello: {:#010x}", hello);

        if hello & FS_OPT_ENABLED == FS_OPT_ENABLED && hello & FS_OPT_MAPSIZE == FS_OPT_MAPSIZE {
            let size = fs_opt_get_mapsize(hello);
            if size > map.len() {
                return Err(HarnessError::MapTooSmall {
                    target: size,
                    ours: map.len(),
                }
                .into());
            }
            debug!("Target map size: {}", size);
        }

        Ok(())
    }

    /// Figure out why the companion never said hello
    fn diagnose_handshake(&mut self, map: &TraceMap) -> anyhow::Error {
        let timed_out = self.signals.timed_out();
        if timed_out {
            let _ = kill(self.pid, Signal::SIGKILL);
        }

        let status = waitpid(self.pid, None);
        // Reaped, nothing left for drop to kill
        self.pid = Pid::from_raw(0);
        map.barrier();

        if map.exec_failed() {
            return HarnessError::ExecFailed(self.target.clone()).into();
        }

        let reason = if timed_out {
            "Timeout while initializing fork server".to_string()
        } else {
            match status {
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    format!("Fork server crashed with signal {}", sig)
                }
                Ok(WaitStatus::Exited(_, code)) => format!(
                    "Target exited with {} before the handshake, is it instrumented?",
                    code
                ),
                Ok(other) => format!("Unexpected fork server status {:?}", other),
                Err(e) => format!("waitpid() failed: {}", e),
            }
        };

        HarnessError::ForkserverHandshake(reason).into()
    }

    /// One full 4 byte word from the status pipe, or nothing
    fn recv(&self) -> Option<[u8; 4]> {
        let mut word = [0u8; 4];
        match read(self.st.as_raw_fd(), &mut word) {
            Ok(4) => Some(word),
            _ => None,
        }
    }

    fn send(&self, word: [u8; 4]) -> bool {
        matches!(write(self.ctl.as_raw_fd(), &word), Ok(4))
    }

    /// Either a benign shutdown (we were asked to stop) or a dead companion
    fn lost(&self, map: &mut TraceMap, what: &str) -> Result<ExecOutcome> {
        if self.signals.aborted() {
            map.barrier();
            finish_map(map, ExecOutcome::Aborted, self.mode);
            return Ok(ExecOutcome::Aborted);
        }

        Err(HarnessError::Protocol(what.to_string()).into())
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Run one input. Leaves classified counts in `map`.
    pub fn run(&mut self, map: &mut TraceMap, input: &[u8]) -> Result<ExecOutcome> {
        if self.signals.aborted() {
            return Ok(ExecOutcome::Aborted);
        }

        map.reset();
        self.testcase.write(input)?;

        self.signals.begin(0);
        if !self.send((self.prev_timed_out as u32).to_ne_bytes()) {
            return self.lost(map, "Unable to request new process from fork server (OOM?)");
        }

        let child = match self.recv() {
            Some(word) => i32::from_ne_bytes(word),
            None => {
                return self.lost(map, "Unable to request new process from fork server (OOM?)");
            }
        };
        if child <= 0 {
            return Err(HarnessError::ForkserverMisbehaving(child).into());
        }

        self.signals.track_child(child);
        arm_timer(self.timeout_ms)?;
        let status = self.recv();
        self.signals.untrack_child();
        disarm_timer()?;

        let status = match status {
            Some(word) => i32::from_ne_bytes(word),
            None => {
                return self.lost(map, "Unable to communicate with fork server (OOM?)");
            }
        };

        map.barrier();

        let status = WaitStatus::from_raw(Pid::from_raw(child), status).map_err(|e| {
            HarnessError::Protocol(format!("Undecodable child status {:#x}: {}", status, e))
        })?;

        let timed_out = self.signals.timed_out();
        let outcome = classify_outcome(map.exec_failed(), status, timed_out, self.signals.aborted());
        self.prev_timed_out = timed_out;

        finish_map(map, outcome, self.mode);

        Ok(outcome)
    }
}

impl Executor for Forkserver {
    fn execute(&mut self, map: &mut TraceMap, input: &[u8]) -> Result<ExecOutcome> {
        self.run(map, input)
    }

    fn target(&self) -> String {
        self.target.clone()
    }
}

impl Drop for Forkserver {
    fn drop(&mut self) {
        if self.pid.as_raw() > 0 {
            let _ = kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}
