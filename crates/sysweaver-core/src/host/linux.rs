//! Host operations against the running Linux kernel

use super::{ConfinedProcess, Host, MountRequest, UnmountMode, mountinfo};
use crate::isolation::loopdev::{self, LoopDevice};
use crate::isolation::mounts::WRITE_PROBE_NAME;
use crate::isolation::namespace::{self, LaunchSpec, ReentryTarget};
use crate::{JailError, LogSink, Result};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Real privileged operations: syscalls via nix, `losetup` and `nsenter`
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxHost;

impl LinuxHost {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Resolve `tool` on `PATH`, falling back to the bare name.
    fn tool(name: &str) -> PathBuf {
        which::which(name).unwrap_or_else(|_| PathBuf::from(name))
    }
}

impl Host for LinuxHost {
    fn mount(&self, request: &MountRequest) -> Result<()> {
        nix::mount::mount(
            request.source.as_deref(),
            &request.target,
            request.fs_type.as_deref(),
            request.flags,
            request.data.as_deref(),
        )
        .map_err(|e| {
            JailError::Mount(format!(
                "failed to mount {} at {} ({:?}): {e}",
                request.fs_type.as_deref().unwrap_or("bind"),
                request.target.display(),
                request.flags
            ))
        })
    }

    fn unmount(&self, target: &Path, mode: UnmountMode) -> Result<()> {
        nix::mount::umount2(target, mode.flags()).map_err(|e| {
            JailError::Mount(format!("{mode} unmount of {} failed: {e}", target.display()))
        })
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        let table = std::fs::read_to_string(MOUNTINFO)?;
        let target = target.canonicalize().unwrap_or_else(|_| target.to_path_buf());
        Ok(mountinfo::contains(&table, &target))
    }

    fn probe_writable(&self, dir: &Path) -> Result<bool> {
        let marker = dir.join(format!("{WRITE_PROBE_NAME}.{}", std::process::id()));
        match OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(_) => {
                if let Err(e) = std::fs::remove_file(&marker) {
                    tracing::error!(marker = %marker.display(), error = %e, "failed to remove write probe");
                }
                Ok(true)
            }
            Err(e)
                if e.raw_os_error() == Some(libc::EROFS)
                    || e.kind() == ErrorKind::PermissionDenied =>
            {
                Ok(false)
            }
            Err(e) => Err(JailError::Mount(format!(
                "write probe in {} failed: {e}",
                dir.display()
            ))),
        }
    }

    fn loop_devices(&self) -> Result<Vec<LoopDevice>> {
        let output = Command::new(Self::tool("losetup"))
            .args(["--list", "--noheadings", "--raw", "--output", "NAME,BACK-FILE"])
            .output()?;
        if !output.status.success() {
            return Err(JailError::Mount(format!(
                "losetup --list failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(loopdev::parse_losetup_list(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    fn detach_loop_device(&self, device: &Path) -> Result<()> {
        let output = Command::new(Self::tool("losetup"))
            .arg("-d")
            .arg(device)
            .output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(JailError::Mount(format!(
                "losetup -d {} failed: {}",
                device.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn spawn_confined(
        &self,
        spec: &LaunchSpec,
        sink: &LogSink,
    ) -> Result<Box<dyn ConfinedProcess>> {
        let shell = namespace::spawn_shell(spec, sink)?;
        Ok(Box::new(shell))
    }

    fn reentry_command(&self, target: &ReentryTarget, program: &str, args: &[&str]) -> Command {
        let mut command = Command::new(Self::tool("nsenter"));
        command
            .arg("--target")
            .arg(target.pid.to_string())
            .arg("--mount");
        if target.namespaces.user() {
            command.arg("--user");
        }
        if target.namespaces.pid {
            command.arg("--pid");
        }
        command
            .arg("--root")
            .arg("--wd")
            .arg("--")
            .arg(program)
            .args(args);
        command.env_clear().envs(target.env.iter().map(|(k, v)| (k, v)));
        command
    }
}
