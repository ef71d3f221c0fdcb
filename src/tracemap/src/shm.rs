use std::env;
use std::ptr;
use std::slice;
use std::str::FromStr;
use std::sync::atomic::{compiler_fence, fence, Ordering};

use anyhow::{bail, Context, Result};
use libc::{c_void, calloc, free, shmat, shmctl, shmdt, shmget, IPC_CREAT, IPC_EXCL, IPC_PRIVATE, IPC_RMID};
use log::debug;

use crate::constants::*;

enum SharedMemPtr {
    /// Segment we created with `shmget`. Detached with `shmdt` and removed with `IPC_RMID`
    Owned { id: i32, ptr: *mut c_void },
    /// Segment someone else created. Only detached
    Attached { id: i32, ptr: *mut c_void },
    /// Allocated with `calloc`, must be released with `free`
    Anon(*mut c_void),
}

/// Hit count map shared between the harness and an instrumented target.
///
/// Each byte is a saturating counter for one instrumented edge. Exactly one
/// writer (the target) and one reader (the harness) touch the map per
/// execution cycle, never at the same time: the harness resets it before the
/// target runs and only reads it after the target's exit status is known.
/// There is no locking; the caller enforces that ordering.
pub struct TraceMap {
    shared_mem: SharedMemPtr,
    size: usize,
}

impl TraceMap {
    /// Create a fresh private SysV segment of `size` bytes and attach it
    pub fn create(size: usize) -> Result<Self> {
        if size < 4 {
            bail!("Trace map of {} bytes cannot hold the exec failure sentinel", size);
        }

        let id = unsafe { shmget(IPC_PRIVATE, size, IPC_CREAT | IPC_EXCL | 0o600) };
        if id < 0 {
            bail!("shmget() failed: {}", std::io::Error::last_os_error());
        }

        let ptr = unsafe { shmat(id, ptr::null(), 0) };
        if ptr == -1isize as *mut c_void {
            let err = std::io::Error::last_os_error();
            unsafe { shmctl(id, IPC_RMID, ptr::null_mut()) };
            bail!("Failed to shmat() trace map: {}", err);
        }

        debug!("Created {} byte trace map with shm id {}", size, id);

        let mut map = Self {
            shared_mem: SharedMemPtr::Owned { id, ptr },
            size,
        };
        map.reset();

        Ok(map)
    }

    /// Attach an existing segment by id
    pub fn attach(id: i32, size: usize) -> Result<Self> {
        let ptr = unsafe { shmat(id, ptr::null(), 0) };
        if ptr == -1isize as *mut c_void {
            bail!(
                "Failed to shmat() trace map {}: {}",
                id,
                std::io::Error::last_os_error()
            );
        }

        Ok(Self {
            shared_mem: SharedMemPtr::Attached { id, ptr },
            size,
        })
    }

    /// Attach the segment published in `SHM_ENV_VAR`. Falls back to a private
    /// anonymous buffer when we are not running under a harness.
    pub fn attach_from_env(size: usize) -> Result<Self> {
        match env::var_os(SHM_ENV_VAR) {
            Some(id) => {
                let id = i32::from_str(&id.to_string_lossy())
                    .with_context(|| format!("Malformed {}", SHM_ENV_VAR))?;
                Self::attach(id, size)
            }
            None => Self::anonymous(size),
        }
    }

    /// Process-private, zeroed buffer. Nothing else can see it.
    pub fn anonymous(size: usize) -> Result<Self> {
        let ptr = unsafe { calloc(size, 1) };
        if ptr.is_null() {
            bail!("Failed to calloc() trace map");
        }

        Ok(Self {
            shared_mem: SharedMemPtr::Anon(ptr),
            size,
        })
    }

    /// Environment entry a child needs to attach this map before its runtime initializes.
    ///
    /// Anonymous maps have no handle.
    pub fn export_handle(&self) -> Option<(&'static str, String)> {
        match self.shared_mem {
            SharedMemPtr::Owned { id, .. } | SharedMemPtr::Attached { id, .. } => {
                Some((SHM_ENV_VAR, id.to_string()))
            }
            SharedMemPtr::Anon(_) => None,
        }
    }

    /// Release the mapping now instead of at drop
    pub fn detach(self) {
        drop(self)
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn ptr(&self) -> *mut u8 {
        let p = match self.shared_mem {
            SharedMemPtr::Owned { ptr, .. } => ptr,
            SharedMemPtr::Attached { ptr, .. } => ptr,
            SharedMemPtr::Anon(ptr) => ptr,
        };

        p as *mut u8
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr(), self.size) }
    }

    /// Copy out the current contents
    pub fn read_raw(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    /// Zero the map. Fenced on both sides so the target never sees a partially
    /// cleared map and we never see stale counts.
    pub fn reset(&mut self) {
        fence(Ordering::SeqCst);
        unsafe { ptr::write_bytes(self.ptr(), 0, self.size) };
        fence(Ordering::SeqCst);
    }

    /// Order our reads after whatever the target wrote before it exited
    pub fn barrier(&self) {
        compiler_fence(Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    /// First word of the map, native endian
    pub fn head_word(&self) -> u32 {
        unsafe { ptr::read_volatile(self.ptr() as *const u32) }
    }

    /// Tell the harness the target image could not be loaded.
    ///
    /// Called from a forked child right before it gives up, so this must not allocate.
    pub fn mark_exec_failed(&mut self) {
        unsafe { ptr::write_volatile(self.ptr() as *mut u32, EXEC_FAIL_SIG) };
    }

    pub fn exec_failed(&self) -> bool {
        self.head_word() == EXEC_FAIL_SIG
    }
}

impl Drop for TraceMap {
    fn drop(&mut self) {
        match self.shared_mem {
            SharedMemPtr::Owned { id, ptr } => unsafe {
                shmdt(ptr);
                shmctl(id, IPC_RMID, ptr::null_mut());
            },
            SharedMemPtr::Attached { ptr, .. } => {
                if unsafe { shmdt(ptr) } != 0 {
                    // Panic instead of leak memory over time
                    panic!("Failed to shmdt() trace map");
                }
            }
            SharedMemPtr::Anon(p) => unsafe { free(p) },
        }
    }
}
