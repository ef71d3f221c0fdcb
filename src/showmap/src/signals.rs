use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use anyhow::{bail, Result};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static SIGNALS: RunSignals = RunSignals::new();

/// State shared with our signal handlers.
///
/// Handlers only ever store to these atomics (and `kill(2)` the tracked
/// child); the run loop polls them at well defined points.
#[derive(Debug)]
pub struct RunSignals {
    aborted: AtomicBool,
    timed_out: AtomicBool,
    /// Pid of the execution in flight, 0 when there is none
    child: AtomicI32,
}

impl RunSignals {
    pub const fn new() -> Self {
        Self {
            aborted: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            child: AtomicI32::new(0),
        }
    }

    /// The process-wide instance our handlers write to
    pub fn global() -> &'static RunSignals {
        &SIGNALS
    }

    /// Route SIGHUP/SIGINT/SIGTERM to an abort and SIGALRM to a timeout
    pub fn install() -> Result<&'static RunSignals> {
        let stop = SigAction::new(
            SigHandler::Handler(handle_stop_sig),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let timeout = SigAction::new(
            SigHandler::Handler(handle_timeout),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        unsafe {
            for sig in &[Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM] {
                sigaction(*sig, &stop)?;
            }
            sigaction(Signal::SIGALRM, &timeout)?;
        }

        Ok(Self::global())
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn request_abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.kill_child();
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    fn expire(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
        self.kill_child();
    }

    /// Start a new execution: forget the previous timeout and track `pid`
    pub fn begin(&self, pid: i32) {
        self.timed_out.store(false, Ordering::SeqCst);
        self.child.store(pid, Ordering::SeqCst);
    }

    pub fn track_child(&self, pid: i32) {
        self.child.store(pid, Ordering::SeqCst);
    }

    pub fn untrack_child(&self) {
        self.child.store(0, Ordering::SeqCst);
    }

    pub fn child(&self) -> i32 {
        self.child.load(Ordering::SeqCst)
    }

    fn kill_child(&self) {
        let pid = self.child.load(Ordering::SeqCst);
        if pid > 0 {
            unsafe { libc::kill(pid, libc::SIGKILL) };
        }
    }
}

extern "C" fn handle_stop_sig(_: libc::c_int) {
    SIGNALS.request_abort();
}

extern "C" fn handle_timeout(_: libc::c_int) {
    SIGNALS.expire();
}

fn set_timer(ms: u32) -> Result<()> {
    let it = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: (ms / 1000) as libc::time_t,
            tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
        },
    };

    if unsafe { libc::setitimer(libc::ITIMER_REAL, &it, ptr::null_mut()) } != 0 {
        bail!("setitimer() failed: {}", std::io::Error::last_os_error());
    }

    Ok(())
}

/// One-shot SIGALRM after `ms` milliseconds. 0 leaves the timer disarmed.
pub fn arm_timer(ms: u32) -> Result<()> {
    set_timer(ms)
}

pub fn disarm_timer() -> Result<()> {
    set_timer(0)
}
