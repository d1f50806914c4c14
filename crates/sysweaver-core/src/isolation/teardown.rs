//! Unmounting a jail with escalation, then sweeping loop devices
//!
//! Teardown never fails. Every problem becomes a warning in the returned
//! [`TeardownReport`] and the next resource is released regardless, so a
//! single busy mount cannot keep the rest of the jail mounted.

use crate::host::{Host, UnmountMode};
use crate::isolation::loopdev;
use crate::ledger::MountLedger;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What a teardown did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Targets unmounted, in the order they were released
    pub unmounted: Vec<PathBuf>,
    /// Ledger entries that were no longer mounted
    pub skipped: Vec<PathBuf>,
    /// Targets that needed more than a plain unmount, with the mode that worked
    pub escalated: Vec<(PathBuf, UnmountMode)>,
    /// Targets every strategy failed on
    pub stuck: Vec<PathBuf>,
    /// Loop devices detached by the sweep
    pub loop_devices: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

impl TeardownReport {
    /// True when nothing was left behind.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.stuck.is_empty() && self.warnings.is_empty()
    }

    fn warn(&mut self, message: String) {
        tracing::warn!("{message}");
        self.warnings.push(message);
    }
}

/// Reverses the mount orchestrator
pub struct TeardownEngine<'a> {
    host: &'a dyn Host,
    retry_delay: Duration,
    loop_owners: Vec<PathBuf>,
}

impl<'a> TeardownEngine<'a> {
    pub fn new(host: &'a dyn Host, retry_delay: Duration) -> Self {
        Self {
            host,
            retry_delay,
            loop_owners: Vec::new(),
        }
    }

    /// Loop devices backed by files under `dirs` are swept as orphans.
    #[must_use]
    pub fn sweep_loops_under(mut self, dirs: Vec<PathBuf>) -> Self {
        self.loop_owners = dirs;
        self
    }

    /// Drain `ledger` newest first, then unmount any of `fixed_targets`
    /// still mounted, then sweep loop devices. The ledger is always empty
    /// afterwards.
    pub fn run(&self, ledger: &mut MountLedger, fixed_targets: &[PathBuf]) -> TeardownReport {
        let mut report = TeardownReport::default();
        tracing::debug!(entries = ledger.len(), "tearing down jail mounts");

        while let Some(target) = ledger.pop() {
            let mounted = match self.host.is_mounted(&target) {
                Ok(mounted) => mounted,
                Err(e) => {
                    tracing::debug!(target = %target.display(), error = %e, "mount check failed, unmounting anyway");
                    true
                }
            };
            if mounted {
                self.release(&target, &mut report);
            } else {
                tracing::debug!(target = %target.display(), "already unmounted");
                report.skipped.push(target);
            }
        }

        for target in fixed_targets.iter().rev() {
            if report.stuck.contains(target) {
                continue;
            }
            match self.host.is_mounted(target) {
                Ok(true) => {
                    tracing::debug!(target = %target.display(), "unmounting untracked mount");
                    self.release(target, &mut report);
                }
                Ok(false) => {}
                Err(e) => report.warn(format!(
                    "could not check {} for leftover mounts: {e}",
                    target.display()
                )),
            }
        }

        self.sweep_loop_devices(&mut report);

        ledger.clear();
        tracing::info!(
            unmounted = report.unmounted.len(),
            stuck = report.stuck.len(),
            loops = report.loop_devices.len(),
            "jail teardown finished"
        );
        report
    }

    fn release(&self, target: &Path, report: &mut TeardownReport) {
        match self.escalate(target) {
            Ok(UnmountMode::Plain) => report.unmounted.push(target.to_path_buf()),
            Ok(mode) => {
                report.warn(format!("{} needed a {mode} unmount", target.display()));
                report.unmounted.push(target.to_path_buf());
                report.escalated.push((target.to_path_buf(), mode));
            }
            Err(last_error) => {
                report.warn(format!(
                    "giving up on {}: {last_error}",
                    target.display()
                ));
                report.stuck.push(target.to_path_buf());
            }
        }
    }

    /// Try each unmount mode in turn; the mode that worked, or the last error.
    fn escalate(&self, target: &Path) -> Result<UnmountMode, crate::JailError> {
        let mut last_error = None;
        for (attempt, mode) in UnmountMode::ESCALATION.into_iter().enumerate() {
            if attempt > 0 && !self.retry_delay.is_zero() {
                std::thread::sleep(self.retry_delay);
            }
            match self.host.unmount(target, mode) {
                Ok(()) => {
                    tracing::debug!(target = %target.display(), %mode, "unmounted");
                    return Ok(mode);
                }
                Err(e) => {
                    tracing::debug!(target = %target.display(), %mode, error = %e, "unmount attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| crate::JailError::Mount("no unmount attempted".into())))
    }

    fn sweep_loop_devices(&self, report: &mut TeardownReport) {
        let devices = match self.host.loop_devices() {
            Ok(devices) => devices,
            Err(e) => {
                report.warn(format!("could not list loop devices: {e}"));
                return;
            }
        };

        for device in loopdev::orphans(&devices, &self.loop_owners) {
            match self.host.detach_loop_device(device) {
                Ok(()) => {
                    tracing::info!(device = %device.display(), "detached orphaned loop device");
                    report.loop_devices.push(device.to_path_buf());
                }
                Err(e) => report.warn(format!(
                    "failed to detach loop device {}: {e}",
                    device.display()
                )),
            }
        }
    }
}
