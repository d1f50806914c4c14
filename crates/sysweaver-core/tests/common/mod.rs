//! Recording host double and on-disk fixtures shared by the integration tests

#![allow(dead_code)]

use nix::mount::MsFlags;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use sysweaver_core::host::{ConfinedProcess, MountRequest, UnmountMode};
use sysweaver_core::isolation::loopdev::LoopDevice;
use sysweaver_core::isolation::{LaunchSpec, ReentryTarget};
use sysweaver_core::{Host, Jail, JailConfig, JailError, LogSink, Result};
use tempfile::TempDir;

pub const SHELL_PID: i32 = 4242;

/// One privileged operation the jail asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Mount { target: PathBuf, flags: MsFlags },
    Unmount { target: PathBuf, mode: UnmountMode },
    Probe(PathBuf),
    ListLoops,
    DetachLoop(PathBuf),
    Spawn(LaunchSpec),
    Kill(i32),
    Wait(i32),
    Reentry { program: String, args: Vec<String> },
}

#[derive(Debug, Default)]
struct State {
    mounted: Vec<PathBuf>,
    fail_mount: Option<PathBuf>,
    failing_unmounts: HashMap<PathBuf, Vec<UnmountMode>>,
    writable: bool,
    writable_targets: Vec<PathBuf>,
    fail_spawn: bool,
    loops: Vec<LoopDevice>,
}

/// In-memory host that records every call and keeps a fake mount table
#[derive(Debug, Default)]
pub struct MockHost {
    calls: Arc<Mutex<Vec<Call>>>,
    state: Mutex<State>,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mounting `target` fails.
    pub fn fail_mount_at(&self, target: impl Into<PathBuf>) {
        self.state.lock().fail_mount = Some(target.into());
    }

    /// Unmounting `target` with any of `modes` fails.
    pub fn fail_unmount(&self, target: impl Into<PathBuf>, modes: &[UnmountMode]) {
        self.state
            .lock()
            .failing_unmounts
            .insert(target.into(), modes.to_vec());
    }

    /// Write probes succeed, as if the read-only remount did nothing.
    pub fn writable_binds(&self) {
        self.state.lock().writable = true;
    }

    /// Only the probe at `target` succeeds.
    pub fn writable_at(&self, target: impl Into<PathBuf>) {
        self.state.lock().writable_targets.push(target.into());
    }

    pub fn fail_spawn(&self) {
        self.state.lock().fail_spawn = true;
    }

    pub fn attach_loop(&self, device: &str, backing_file: impl Into<PathBuf>) {
        self.state.lock().loops.push(LoopDevice {
            device: PathBuf::from(device),
            backing_file: backing_file.into(),
        });
    }

    /// Mount a target behind the jail's back.
    pub fn mount_externally(&self, target: impl Into<PathBuf>) {
        self.state.lock().mounted.push(target.into());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        self.state.lock().mounted.clone()
    }

    /// Targets of successful new mounts, in order.
    pub fn mount_targets(&self) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Mount { target, flags } if !flags.contains(MsFlags::MS_REMOUNT) => {
                    Some(target)
                }
                _ => None,
            })
            .collect()
    }

    /// Targets of every unmount attempt, in order.
    pub fn unmount_attempts(&self) -> Vec<(PathBuf, UnmountMode)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Unmount { target, mode } => Some((target, mode)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

impl Host for MockHost {
    fn mount(&self, request: &MountRequest) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_mount.as_deref() == Some(request.target.as_path()) && !request.is_remount() {
            return Err(JailError::Mount(format!(
                "mock refused {}",
                request.target.display()
            )));
        }
        self.record(Call::Mount {
            target: request.target.clone(),
            flags: request.flags,
        });
        if !request.is_remount() {
            state.mounted.push(request.target.clone());
        }
        Ok(())
    }

    fn unmount(&self, target: &Path, mode: UnmountMode) -> Result<()> {
        self.record(Call::Unmount {
            target: target.to_path_buf(),
            mode,
        });
        let mut state = self.state.lock();
        if state
            .failing_unmounts
            .get(target)
            .is_some_and(|modes| modes.contains(&mode))
        {
            return Err(JailError::Mount(format!("{} is busy", target.display())));
        }
        match state.mounted.iter().rposition(|m| m == target) {
            Some(index) => {
                state.mounted.remove(index);
                Ok(())
            }
            None => Err(JailError::Mount(format!("{} not mounted", target.display()))),
        }
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        Ok(self.state.lock().mounted.iter().any(|m| m == target))
    }

    fn probe_writable(&self, dir: &Path) -> Result<bool> {
        self.record(Call::Probe(dir.to_path_buf()));
        let state = self.state.lock();
        Ok(state.writable || state.writable_targets.iter().any(|t| t == dir))
    }

    fn loop_devices(&self) -> Result<Vec<LoopDevice>> {
        self.record(Call::ListLoops);
        Ok(self.state.lock().loops.clone())
    }

    fn detach_loop_device(&self, device: &Path) -> Result<()> {
        self.record(Call::DetachLoop(device.to_path_buf()));
        self.state.lock().loops.retain(|l| l.device != device);
        Ok(())
    }

    fn spawn_confined(
        &self,
        spec: &LaunchSpec,
        _sink: &LogSink,
    ) -> Result<Box<dyn ConfinedProcess>> {
        self.record(Call::Spawn(spec.clone()));
        if self.state.lock().fail_spawn {
            return Err(JailError::Launch("mock spawn failure".into()));
        }
        Ok(Box::new(MockProcess {
            pid: SHELL_PID,
            calls: Arc::clone(&self.calls),
        }))
    }

    /// Runs `program` directly on the host.
    fn reentry_command(&self, _target: &ReentryTarget, program: &str, args: &[&str]) -> Command {
        self.record(Call::Reentry {
            program: program.to_owned(),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
        });
        let mut command = Command::new(program);
        command.args(args);
        command
    }
}

#[derive(Debug)]
struct MockProcess {
    pid: i32,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl ConfinedProcess for MockProcess {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn kill(&mut self) -> Result<()> {
        self.calls.lock().push(Call::Kill(self.pid));
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        self.calls.lock().push(Call::Wait(self.pid));
        Ok(())
    }
}

/// Base, template and chroot trees in a temporary directory
pub struct Fixture {
    pub dir: TempDir,
    pub base: PathBuf,
    pub template: PathBuf,
    pub chroot: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        let template = dir.path().join("template");
        let chroot = dir.path().join("jail");
        fs::create_dir_all(base.join("bin")).unwrap();
        fs::create_dir_all(template.join("scripts/install")).unwrap();
        fs::write(template.join("scripts/install/01-hello.sh"), "echo hello\n").unwrap();
        fs::create_dir_all(&chroot).unwrap();
        Self {
            dir,
            base,
            template,
            chroot,
        }
    }

    pub fn config(&self) -> JailConfig {
        JailConfig::builder()
            .chroot_dir(&self.chroot)
            .base_dir(&self.base)
            .unmount_retry_delay_ms(0)
            .build()
    }

    pub fn jail(&self, host: &Arc<MockHost>) -> Jail {
        self.jail_with(self.config(), host)
    }

    pub fn jail_with(&self, config: JailConfig, host: &Arc<MockHost>) -> Jail {
        let jail = Jail::with_host(config, &self.template, Arc::clone(host) as Arc<dyn Host>).unwrap();
        jail.set_log_sink(std::io::sink());
        jail
    }

    pub fn root(&self, relative: &str) -> PathBuf {
        if relative.is_empty() {
            self.chroot.clone()
        } else {
            self.chroot.join(relative)
        }
    }

    /// The mounts every jail creates, in mount order.
    pub fn fixed_mounts(&self) -> Vec<PathBuf> {
        ["", "proc", "sys", "dev", "dev/pts", "template", "scripts"]
            .into_iter()
            .map(|relative| self.root(relative))
            .collect()
    }
}
