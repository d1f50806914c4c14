//! clone3 syscall wrapper

use crate::{JailError, Result};
use libc::pid_t;

/// clone3 clone_args structure (from linux/sched.h)
#[repr(C)]
#[derive(Debug, Default)]
pub struct CloneArgs {
    /// Flags for the new process
    pub flags: u64,
    /// File descriptor for pidfd
    pub pidfd: u64,
    /// Pointer to child TID in child memory
    pub child_tid: u64,
    /// Pointer to child TID in parent memory
    pub parent_tid: u64,
    /// Signal to deliver on child termination
    pub exit_signal: u64,
    /// Stack pointer (0 = copy parent stack)
    pub stack: u64,
    /// Stack size (0 if using parent stack)
    pub stack_size: u64,
    /// TLS pointer
    pub tls: u64,
}

/// clone3 syscall number
const SYS_CLONE3: libc::c_long = 435;

/// Wrapper around the clone3 syscall
///
/// # Safety
/// This function makes a raw syscall and forks the process. In a
/// multi-threaded parent the child may only run async-signal-safe code.
pub unsafe fn clone3(args: &CloneArgs) -> Result<pid_t> {
    // SAFETY: Making clone3 syscall with valid args
    let ret = unsafe {
        libc::syscall(
            SYS_CLONE3,
            std::ptr::from_ref(args),
            std::mem::size_of::<CloneArgs>(),
        )
    };

    if ret == -1 {
        return Err(JailError::Launch(format!(
            "clone3 failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    Ok(ret as pid_t)
}

/// Fork a child into the namespaces in `namespace_flags`.
///
/// The child runs `child_fn` and exits with its return value; it must not
/// allocate, lock or touch anything a parent thread might hold.
pub fn clone_into_namespaces(
    namespace_flags: u64,
    child_fn: impl FnOnce() -> i32,
) -> Result<pid_t> {
    let args = CloneArgs {
        flags: namespace_flags,
        #[allow(clippy::cast_sign_loss)]
        exit_signal: libc::SIGCHLD as u64,
        ..Default::default()
    };

    // SAFETY: We're forking the process with clone3
    let pid = unsafe { clone3(&args)? };

    if pid == 0 {
        // Child process
        let code = child_fn();
        // SAFETY: Exiting child process without running parent destructors
        unsafe { libc::_exit(code) };
    }

    // Parent process
    Ok(pid)
}
