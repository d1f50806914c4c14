//! Privileged host operations
//!
//! Everything that needs root or a real kernel goes through [`Host`]:
//! mounting, unmounting, mount-table queries, the template write probe,
//! loop-device handling, spawning the confined shell and building the
//! command that re-enters it. [`LinuxHost`] is the real implementation;
//! tests substitute recording doubles.

mod linux;
pub mod mountinfo;

pub use linux::LinuxHost;

use crate::isolation::loopdev::LoopDevice;
use crate::isolation::namespace::{LaunchSpec, ReentryTarget};
use crate::{LogSink, Result};
use nix::mount::{MntFlags, MsFlags};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Capability interface over the privileged operations a jail performs
pub trait Host: Send + Sync {
    /// Perform a single `mount(2)`.
    fn mount(&self, request: &MountRequest) -> Result<()>;

    /// Perform a single `umount2(2)` with the flags of `mode`.
    fn unmount(&self, target: &Path, mode: UnmountMode) -> Result<()>;

    /// Whether `target` is currently a mount point.
    fn is_mounted(&self, target: &Path) -> Result<bool>;

    /// Try to create a marker file in `dir`; `true` if that succeeded.
    fn probe_writable(&self, dir: &Path) -> Result<bool>;

    /// All attached loop devices.
    fn loop_devices(&self) -> Result<Vec<LoopDevice>>;

    fn detach_loop_device(&self, device: &Path) -> Result<()>;

    /// Start the confined shell described by `spec`, its output going to `sink`.
    fn spawn_confined(&self, spec: &LaunchSpec, sink: &LogSink)
    -> Result<Box<dyn ConfinedProcess>>;

    /// Command that runs `program` inside the confined root of `target`.
    fn reentry_command(&self, target: &ReentryTarget, program: &str, args: &[&str]) -> Command;
}

/// Handle to the long-lived confined shell
pub trait ConfinedProcess: Send + fmt::Debug {
    /// Process id as seen from the host.
    fn pid(&self) -> i32;

    fn kill(&mut self) -> Result<()>;

    /// Reap the process and release its pipes.
    fn wait(&mut self) -> Result<()>;
}

/// Arguments of one `mount(2)` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub fs_type: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
}

impl MountRequest {
    /// Overlay of `upper` on top of `lower`, mounted at `target`.
    #[must_use]
    pub fn overlay(lower: &Path, upper: &Path, work: &Path, target: &Path) -> Self {
        Self {
            source: Some(PathBuf::from("overlay")),
            target: target.to_path_buf(),
            fs_type: Some("overlay".into()),
            flags: MsFlags::empty(),
            data: Some(format!(
                "lowerdir={},upperdir={},workdir={}",
                lower.display(),
                upper.display(),
                work.display()
            )),
        }
    }

    #[must_use]
    pub fn bind(source: &Path, target: &Path, recursive: bool) -> Self {
        let mut flags = MsFlags::MS_BIND;
        if recursive {
            flags |= MsFlags::MS_REC;
        }
        Self {
            source: Some(source.to_path_buf()),
            target: target.to_path_buf(),
            fs_type: None,
            flags,
            data: None,
        }
    }

    /// Bind mounts ignore `MS_RDONLY` on creation; this is the remount that
    /// actually makes them read-only.
    #[must_use]
    pub fn remount_read_only(target: &Path) -> Self {
        Self {
            source: None,
            target: target.to_path_buf(),
            fs_type: None,
            flags: MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            data: None,
        }
    }

    #[must_use]
    pub fn filesystem(
        fs_type: &str,
        source: &Path,
        target: &Path,
        flags: MsFlags,
        data: Option<String>,
    ) -> Self {
        Self {
            source: Some(source.to_path_buf()),
            target: target.to_path_buf(),
            fs_type: Some(fs_type.to_owned()),
            flags,
            data,
        }
    }

    #[must_use]
    pub fn is_remount(&self) -> bool {
        self.flags.contains(MsFlags::MS_REMOUNT)
    }
}

/// Unmount strategies, weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountMode {
    Plain,
    Force,
    Detach,
}

impl UnmountMode {
    /// Order in which teardown tries the strategies.
    pub const ESCALATION: [Self; 3] = [Self::Plain, Self::Force, Self::Detach];

    #[must_use]
    pub const fn flags(self) -> MntFlags {
        match self {
            Self::Plain => MntFlags::empty(),
            Self::Force => MntFlags::MNT_FORCE,
            Self::Detach => MntFlags::MNT_DETACH,
        }
    }
}

impl fmt::Display for UnmountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plain => "plain",
            Self::Force => "force",
            Self::Detach => "detach",
        })
    }
}
