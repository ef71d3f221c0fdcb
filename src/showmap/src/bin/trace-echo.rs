//! Minimal self-instrumented target.
//!
//! Counts every input byte into the trace map slot of the same value, so the
//! map it leaves behind is predictable. Speaks the companion side of the fork
//! server protocol when the harness set up the pipes, otherwise runs once.
//!
//! Inputs starting with `crash` die by SIGSEGV, `hang` never return, and
//! `fail` plant the exec failure sentinel.
//!
//! Under the fork server, the last map slot holds 1 when the go word for the
//! current run said the previous child was killed by a timeout.

use std::env;
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::process::exit;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use nix::sys::signal::{raise, signal, SigHandler, Signal};
use nix::unistd::{close, fork, read, write, ForkResult};

use tracemap::constants::*;
use tracemap::TraceMap;

fn load_input() -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    match env::args_os().nth(1) {
        Some(path) => {
            let mut file = OpenOptions::new().read(true).open(path)?;
            file.read_to_end(&mut buffer)?;
        }
        None => {
            let stdin = io::stdin();
            let mut handle = stdin.lock();
            handle.read_to_end(&mut buffer)?;
        }
    }

    Ok(buffer)
}

/// Test code. Returns the exit code.
fn work(map: &mut TraceMap) -> i32 {
    let input = match load_input() {
        Ok(i) => i,
        Err(e) => {
            eprintln!("Failed to read input: {}", e);
            return 1;
        }
    };

    let shmem = map.as_mut_slice();
    for &b in &input {
        let slot = b as usize % shmem.len();
        shmem[slot] = shmem[slot].saturating_add(1);
    }

    if input.starts_with(b"crash") {
        // The runtime's own SIGSEGV handler would swallow a raised signal
        unsafe {
            let _ = signal(Signal::SIGSEGV, SigHandler::SigDfl);
        }
        let _ = raise(Signal::SIGSEGV);
    } else if input.starts_with(b"hang") {
        loop {
            thread::sleep(Duration::from_secs(1));
        }
    } else if input.starts_with(b"fail") {
        map.mark_exec_failed();
        return 3;
    }

    0
}

/// Phone home. `false` means nobody is listening and we run standalone.
fn hello(map_size: usize) -> bool {
    // Must be exactly 4 bytes
    let val: u32 = FS_OPT_ENABLED | FS_OPT_MAPSIZE | fs_opt_set_mapsize(map_size);
    matches!(write(FORKSRV_ST_FD, &val.to_ne_bytes()), Ok(4))
}

fn serve(map: &mut TraceMap) -> Result<()> {
    loop {
        // Exactly 4 bytes. We always fork a fresh child, whether or not the
        // last one was killed, but leave the flag where the harness can see it.
        let mut was_killed = [0u8; 4];
        if read(FORKSRV_CTL_FD, &mut was_killed)? != 4 {
            // Harness went away
            return Ok(());
        }
        if u32::from_ne_bytes(was_killed) != 0 {
            let shmem = map.as_mut_slice();
            let last = shmem.len() - 1;
            shmem[last] = 1;
        }

        // Be careful not to return from the child branch -- we must always exit
        // the child process so we can reap its status.
        let child = match unsafe { fork() }? {
            ForkResult::Parent { child } => child,
            ForkResult::Child => {
                let _ = close(FORKSRV_CTL_FD);
                let _ = close(FORKSRV_ST_FD);
                let code = work(map);
                unsafe { libc::_exit(code) };
            }
        };

        if write(FORKSRV_ST_FD, &child.as_raw().to_ne_bytes())? != 4 {
            bail!("Failed to report child pid");
        }

        let mut status: libc::c_int = 0;
        if unsafe { libc::waitpid(child.as_raw(), &mut status, 0) } < 0 {
            bail!("waitpid() failed: {}", io::Error::last_os_error());
        }

        if write(FORKSRV_ST_FD, &status.to_ne_bytes())? != 4 {
            bail!("Failed to report child status");
        }
    }
}

fn map_size() -> usize {
    env::var(MAP_SIZE_ENV_VAR)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(MAP_SIZE)
}

fn _main() -> Result<i32> {
    let mut map = TraceMap::attach_from_env(map_size())?;

    if hello(map.len()) {
        serve(&mut map)?;
        Ok(0)
    } else {
        Ok(work(&mut map))
    }
}

fn main() {
    match _main() {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("trace-echo: {}", e);
            exit(1);
        }
    }
}
