//! Confined shell with PID and user namespace isolation

use crate::config::IdMapping;
use crate::host::{ConfinedProcess, Host};
use crate::pipe::{create_pipe, forward_to_sink};
use crate::{JailError, LogSink, Result};
use nix::sched::CloneFlags;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

/// Default `PATH` inside the jail.
const JAIL_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Namespace shape of a jail session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Create new PID namespace
    pub pid: bool,
    /// UID map of the user namespace
    pub uid_mappings: Vec<IdMapping>,
    /// GID map of the user namespace
    pub gid_mappings: Vec<IdMapping>,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            pid: true,
            uid_mappings: crate::config::default_uid_mappings(),
            gid_mappings: crate::config::default_gid_mappings(),
        }
    }
}

impl NamespaceConfig {
    /// A user namespace is created whenever any id mapping is configured.
    #[must_use]
    pub fn user(&self) -> bool {
        !self.uid_mappings.is_empty() || !self.gid_mappings.is_empty()
    }

    /// Convert to nix CloneFlags
    ///
    /// A private mount namespace comes with the user namespace: `chroot`
    /// needs `CAP_SYS_CHROOT` in the user namespace owning the mounts.
    #[must_use]
    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();

        if self.user() {
            flags |= CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS;
        }
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }

        flags
    }
}

/// Everything needed to start the confined shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// New root directory of the shell
    pub root: PathBuf,
    pub shell: PathBuf,
    pub env: Vec<(String, String)>,
    pub namespaces: NamespaceConfig,
}

impl LaunchSpec {
    pub(crate) fn reentry(&self, pid: i32) -> ReentryTarget {
        ReentryTarget {
            pid,
            namespaces: self.namespaces.clone(),
            env: self.env.clone(),
        }
    }
}

/// Where commands re-enter the jail: the confined shell's namespaces and root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReentryTarget {
    pub pid: i32,
    pub namespaces: NamespaceConfig,
    pub env: Vec<(String, String)>,
}

/// Host-derived baseline environment overlaid with `overrides`.
///
/// An override replaces a baseline variable in place; new keys are appended
/// in the order given.
#[must_use]
pub fn jail_environment(shell: &Path, overrides: &[(String, String)]) -> Vec<(String, String)> {
    let host = |key: &str, fallback: &str| std::env::var(key).unwrap_or_else(|_| fallback.into());

    let mut env = vec![
        ("PATH".to_owned(), JAIL_PATH.to_owned()),
        ("HOME".to_owned(), "/root".to_owned()),
        ("SHELL".to_owned(), shell.display().to_string()),
        ("TERM".to_owned(), host("TERM", "linux")),
        ("LANG".to_owned(), host("LANG", "C.UTF-8")),
    ];

    for (key, value) in overrides {
        match env.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1.clone_from(value),
            None => env.push((key.clone(), value.clone())),
        }
    }
    env
}

/// Start the confined shell through `host`.
pub fn launch(host: &dyn Host, spec: &LaunchSpec, sink: &LogSink) -> Result<Box<dyn ConfinedProcess>> {
    tracing::debug!(
        root = %spec.root.display(),
        shell = %spec.shell.display(),
        pid_ns = spec.namespaces.pid,
        user_ns = spec.namespaces.user(),
        "launching confined shell"
    );

    let process = host.spawn_confined(spec, sink).map_err(|e| match e {
        JailError::Launch(_) => e,
        other => JailError::Launch(other.to_string()),
    })?;

    tracing::info!(pid = process.pid(), root = %spec.root.display(), "confined shell started");
    Ok(process)
}

/// The real confined shell, started with clone3
#[derive(Debug)]
pub struct ConfinedShell {
    pid: Pid,
    /// Held open and never written so the shell blocks on stdin
    stdin: Option<File>,
    forwarder: Option<JoinHandle<()>>,
    reaped: bool,
}

impl ConfinedProcess for ConfinedShell {
    fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    fn kill(&mut self) -> Result<()> {
        match kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(JailError::Nix(e)),
        }
    }

    fn wait(&mut self) -> Result<()> {
        self.stdin = None;
        let result = if self.reaped {
            Ok(())
        } else {
            self.reaped = true;
            waitpid(self.pid, None).map(drop).map_err(JailError::Nix)
        };

        if let Some(forwarder) = self.forwarder.take() {
            // A grandchild outside a PID namespace may still hold the pipe.
            if forwarder.is_finished() {
                let _ = forwarder.join();
            } else {
                tracing::debug!(pid = self.pid.as_raw(), "output forwarder still draining, detaching");
            }
        }
        result
    }
}

impl Drop for ConfinedShell {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = ConfinedProcess::kill(self);
            let _ = ConfinedProcess::wait(self);
        }
    }
}

/// File descriptors the child touches, captured before the fork
#[derive(Clone, Copy)]
struct ChildFds {
    stdin: RawFd,
    output: RawFd,
    sync: RawFd,
    error: RawFd,
    /// Parent ends, closed first thing in the child
    parent_ends: [RawFd; 4],
}

fn cstring(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|e| JailError::Launch(format!("invalid launch argument: {e}")))
}

/// Spawn the shell of `spec` with clone3.
///
/// The child blocks on a sync pipe until the parent has written its id
/// maps, then chroots and execs. A close-on-exec error pipe reports the
/// errno of a failed `chroot`, `chdir` or `execve` back to the parent.
pub fn spawn_shell(spec: &LaunchSpec, sink: &LogSink) -> Result<ConfinedShell> {
    // Everything the child needs is allocated before the fork.
    let root = cstring(spec.root.as_os_str().as_bytes())?;
    let slash = cstring(b"/")?;
    let shell = cstring(spec.shell.as_os_str().as_bytes())?;
    let envs = spec
        .env
        .iter()
        .map(|(k, v)| cstring(format!("{k}={v}").as_bytes()))
        .collect::<Result<Vec<_>>>()?;
    let argv = [shell.as_ptr(), std::ptr::null()];
    let envp: Vec<*const libc::c_char> = envs
        .iter()
        .map(|e| e.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    let (stdin_rx, stdin_tx) = create_pipe()?;
    let (output_rx, output_tx) = create_pipe()?;
    let (sync_rx, mut sync_tx) = create_pipe()?;
    let (mut error_rx, error_tx) = create_pipe()?;

    let fds = ChildFds {
        stdin: stdin_rx.as_raw_fd(),
        output: output_tx.as_raw_fd(),
        sync: sync_rx.as_raw_fd(),
        error: error_tx.as_raw_fd(),
        parent_ends: [
            stdin_tx.as_raw_fd(),
            output_rx.as_raw_fd(),
            sync_tx.as_raw_fd(),
            error_rx.as_raw_fd(),
        ],
    };

    #[allow(clippy::cast_sign_loss)]
    let flags = spec.namespaces.to_clone_flags().bits() as u64;
    let raw = super::clone3::clone_into_namespaces(flags, || {
        // SAFETY: only async-signal-safe calls on memory prepared above
        unsafe { child_exec(fds, root.as_ptr(), slash.as_ptr(), argv.as_ptr(), envp.as_ptr()) }
    })?;
    let pid = Pid::from_raw(raw);

    drop(stdin_rx);
    drop(output_tx);
    drop(sync_rx);
    drop(error_tx);

    let abort = |reason: String| -> JailError {
        let _ = kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
        JailError::Launch(reason)
    };

    if spec.namespaces.user() {
        if let Err(e) = write_id_maps(raw, &spec.namespaces) {
            // Closing the sync pipe without a byte makes the child give up.
            drop(sync_tx);
            return Err(abort(format!("failed to write id maps for pid {raw}: {e}")));
        }
    }

    if let Err(e) = sync_tx.write_all(&[1]) {
        return Err(abort(format!("failed to release confined shell: {e}")));
    }
    drop(sync_tx);

    let mut errno = [0u8; 4];
    match error_rx.read(&mut errno) {
        Ok(0) => {}
        Ok(_) => {
            let err = std::io::Error::from_raw_os_error(i32::from_ne_bytes(errno));
            return Err(abort(format!(
                "failed to start {} in {}: {err}",
                spec.shell.display(),
                spec.root.display()
            )));
        }
        Err(e) => return Err(abort(format!("failed to read launch status: {e}"))),
    }

    let forwarder = match forward_to_sink(output_rx, sink.clone()) {
        Ok(forwarder) => forwarder,
        Err(e) => return Err(abort(format!("failed to forward shell output: {e}"))),
    };

    Ok(ConfinedShell {
        pid,
        stdin: Some(stdin_tx),
        forwarder: Some(forwarder),
        reaped: false,
    })
}

fn write_id_maps(pid: i32, namespaces: &NamespaceConfig) -> std::io::Result<()> {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));
    if !namespaces.uid_mappings.is_empty() {
        std::fs::write(
            proc_dir.join("uid_map"),
            IdMapping::render(&namespaces.uid_mappings),
        )?;
    }
    if !namespaces.gid_mappings.is_empty() {
        std::fs::write(
            proc_dir.join("gid_map"),
            IdMapping::render(&namespaces.gid_mappings),
        )?;
    }
    Ok(())
}

/// Child side of [`spawn_shell`]. Returns only on failure.
///
/// # Safety
/// Must run in a freshly cloned child with valid, NUL-terminated pointers.
unsafe fn child_exec(
    fds: ChildFds,
    root: *const libc::c_char,
    slash: *const libc::c_char,
    argv: *const *const libc::c_char,
    envp: *const *const libc::c_char,
) -> i32 {
    unsafe {
        for fd in fds.parent_ends {
            libc::close(fd);
        }

        let mut go = 0u8;
        if libc::read(fds.sync, std::ptr::from_mut(&mut go).cast(), 1) != 1 {
            return 1;
        }

        let failed = libc::dup2(fds.stdin, 0) < 0
            || libc::dup2(fds.output, 1) < 0
            || libc::dup2(fds.output, 2) < 0
            || libc::chroot(root) != 0
            || libc::chdir(slash) != 0
            || {
                libc::execve(*argv, argv, envp);
                true
            };

        if failed {
            let errno = nix::errno::Errno::last_raw().to_ne_bytes();
            libc::write(fds.error, errno.as_ptr().cast(), errno.len());
        }
        127
    }
}
