//! Layered jail filesystem: overlay root, pseudo filesystems, template binds

use crate::config::{JailConfig, MountSpec};
use crate::host::{Host, MountRequest};
use crate::ledger::MountLedger;
use crate::{JailError, Result};
use nix::mount::MsFlags;
use std::fs;
use std::path::{Path, PathBuf};

/// Template tree mount point inside the jail
pub const TEMPLATE_MOUNT_POINT: &str = "template";

/// Template scripts mount point inside the jail
pub const SCRIPTS_MOUNT_POINT: &str = "scripts";

/// Scripts directory inside the template tree
pub const TEMPLATE_SCRIPTS_DIR: &str = "scripts";

/// Marker file name used to probe the template binds for writability
pub const WRITE_PROBE_NAME: &str = ".sysweaver-write-probe";

/// A kernel pseudo filesystem mounted into every jail
struct PseudoFs {
    dir: &'static str,
    fs_type: &'static str,
    flags: MsFlags,
    data: Option<&'static str>,
}

/// Mount order matters: `dev/pts` lives on `dev`.
const PSEUDO_FILESYSTEMS: [PseudoFs; 4] = [
    PseudoFs {
        dir: "proc",
        fs_type: "proc",
        flags: MsFlags::MS_NOSUID.union(MsFlags::MS_NODEV).union(MsFlags::MS_NOEXEC),
        data: None,
    },
    PseudoFs {
        dir: "sys",
        fs_type: "sysfs",
        flags: MsFlags::MS_NOSUID
            .union(MsFlags::MS_NODEV)
            .union(MsFlags::MS_NOEXEC)
            .union(MsFlags::MS_RDONLY),
        data: None,
    },
    PseudoFs {
        dir: "dev",
        fs_type: "devtmpfs",
        flags: MsFlags::MS_NOSUID,
        data: Some("mode=0755"),
    },
    PseudoFs {
        dir: "dev/pts",
        fs_type: "devpts",
        flags: MsFlags::MS_NOSUID.union(MsFlags::MS_NOEXEC),
        data: Some("newinstance,ptmxmode=0666,mode=0620"),
    },
];

/// Paths of one jail on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailLayout {
    pub root: PathBuf,
    pub base: PathBuf,
    pub template: PathBuf,
    pub scratch: PathBuf,
}

impl JailLayout {
    #[must_use]
    pub fn new(config: &JailConfig) -> Self {
        Self {
            root: config.chroot_dir.clone(),
            base: config.base_dir.clone(),
            template: config.template_dir.clone(),
            scratch: config.scratch_dir(),
        }
    }

    #[must_use]
    pub fn upper(&self) -> PathBuf {
        self.scratch.join("upper")
    }

    #[must_use]
    pub fn work(&self) -> PathBuf {
        self.scratch.join("work")
    }

    #[must_use]
    pub fn template_target(&self) -> PathBuf {
        self.root.join(TEMPLATE_MOUNT_POINT)
    }

    #[must_use]
    pub fn scripts_target(&self) -> PathBuf {
        self.root.join(SCRIPTS_MOUNT_POINT)
    }

    #[must_use]
    pub fn scripts_source(&self) -> PathBuf {
        self.template.join(TEMPLATE_SCRIPTS_DIR)
    }

    /// Every mount the jail always creates, in mount order.
    #[must_use]
    pub fn fixed_targets(&self) -> Vec<PathBuf> {
        let mut targets = vec![self.root.clone()];
        targets.extend(PSEUDO_FILESYSTEMS.iter().map(|fs| self.root.join(fs.dir)));
        targets.push(self.template_target());
        targets.push(self.scripts_target());
        targets
    }

    /// Directories whose loop devices belong to this jail.
    #[must_use]
    pub fn loop_owners(&self) -> Vec<PathBuf> {
        vec![self.root.clone(), self.scratch.clone()]
    }
}

/// How strictly a read-only bind is checked after remounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verify {
    /// Writable means the template can be corrupted: abort the build
    Critical,
    /// Writable is an ordinary mount failure
    Strict,
}

/// Builds the jail filesystem, recording every successful mount
pub struct MountOrchestrator<'a> {
    host: &'a dyn Host,
    layout: &'a JailLayout,
    ledger: &'a mut MountLedger,
}

impl<'a> MountOrchestrator<'a> {
    pub fn new(host: &'a dyn Host, layout: &'a JailLayout, ledger: &'a mut MountLedger) -> Self {
        Self {
            host,
            layout,
            ledger,
        }
    }

    /// Setup all mounts. Stops at the first failure, leaving whatever
    /// succeeded in the ledger for rollback.
    pub fn build(&mut self, extra: &[MountSpec]) -> Result<()> {
        self.layered_root()?;
        self.pseudo_filesystems()?;
        self.template_binds()?;
        self.extra_mounts(extra)?;
        tracing::info!(
            root = %self.layout.root.display(),
            mounts = self.ledger.len(),
            "jail filesystem ready"
        );
        Ok(())
    }

    fn mount(&mut self, request: &MountRequest) -> Result<()> {
        self.host.mount(request)?;
        if !request.is_remount() {
            self.ledger.record(&request.target);
        }
        Ok(())
    }

    fn layered_root(&mut self) -> Result<()> {
        let layout = self.layout;
        tracing::debug!(
            lower = %layout.base.display(),
            scratch = %layout.scratch.display(),
            "preparing overlay root"
        );

        if layout.scratch.exists() {
            fs::remove_dir_all(&layout.scratch).map_err(|e| {
                JailError::Mount(format!(
                    "failed to clear scratch {}: {e}",
                    layout.scratch.display()
                ))
            })?;
        }
        for dir in [layout.upper(), layout.work()] {
            fs::create_dir_all(&dir).map_err(|e| {
                JailError::Mount(format!("failed to create {}: {e}", dir.display()))
            })?;
        }

        self.mount(&MountRequest::overlay(
            &layout.base,
            &layout.upper(),
            &layout.work(),
            &layout.root,
        ))
    }

    fn pseudo_filesystems(&mut self) -> Result<()> {
        for pseudo in &PSEUDO_FILESYSTEMS {
            let target = self.layout.root.join(pseudo.dir);
            tracing::debug!(fs = pseudo.fs_type, target = %target.display(), "pseudo filesystem");
            create_dir(&target)?;
            self.mount(&MountRequest::filesystem(
                pseudo.fs_type,
                Path::new(pseudo.fs_type),
                &target,
                pseudo.flags,
                pseudo.data.map(str::to_owned),
            ))?;
        }
        Ok(())
    }

    fn template_binds(&mut self) -> Result<()> {
        let layout = self.layout;
        let scripts = layout.scripts_source();
        if !scripts.is_dir() {
            return Err(JailError::PathNotFound {
                what: "template scripts",
                path: scripts,
            });
        }

        self.bind_read_only(&layout.template, &layout.template_target(), true, Verify::Critical)?;
        self.bind_read_only(&scripts, &layout.scripts_target(), true, Verify::Critical)
    }

    /// Bind, remount read-only, then prove it by trying to write.
    fn bind_read_only(
        &mut self,
        source: &Path,
        target: &Path,
        recursive: bool,
        verify: Verify,
    ) -> Result<()> {
        tracing::debug!(source = %source.display(), target = %target.display(), "ro bind mount");

        create_dir(target)?;
        self.mount(&MountRequest::bind(source, target, recursive))?;
        self.mount(&MountRequest::remount_read_only(target))?;

        if self.host.probe_writable(target)? {
            let message = format!(
                "{} is writable inside the jail after read-only remount",
                target.display()
            );
            return Err(match verify {
                Verify::Critical => {
                    tracing::error!(target = %target.display(), "template bind is writable");
                    JailError::CriticalInvariantViolation(message)
                }
                Verify::Strict => JailError::Mount(message),
            });
        }
        Ok(())
    }

    fn extra_mounts(&mut self, extra: &[MountSpec]) -> Result<()> {
        for spec in extra {
            let target = self.layout.root.join(spec.relative_destination()?);
            prepare_target(&spec.source, &target)?;

            if spec.is_bind() {
                let recursive = spec.options.iter().any(|o| o == "rbind");
                if spec.is_read_only() {
                    self.bind_read_only(&spec.source, &target, recursive, Verify::Strict)?;
                } else {
                    tracing::debug!(source = %spec.source.display(), target = %target.display(), "rw bind mount");
                    self.mount(&MountRequest::bind(&spec.source, &target, recursive))?;
                }
            } else {
                let (flags, data) = parse_mount_options(&spec.options);
                tracing::debug!(
                    fs = %spec.fs_type,
                    target = %target.display(),
                    data = data.as_deref().unwrap_or(""),
                    "typed mount"
                );
                self.mount(&MountRequest::filesystem(
                    &spec.fs_type,
                    &spec.source,
                    &target,
                    flags,
                    data,
                ))?;
            }
        }
        Ok(())
    }
}

/// Split mount options into kernel flags and the filesystem data string.
#[must_use]
pub fn parse_mount_options(options: &[String]) -> (MsFlags, Option<String>) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();

    for option in options {
        match option.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "strictatime" => flags |= MsFlags::MS_STRICTATIME,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "dirsync" => flags |= MsFlags::MS_DIRSYNC,
            "rw" | "defaults" | "bind" | "rbind" => {}
            other => data.push(other),
        }
    }

    let data = (!data.is_empty()).then(|| data.join(","));
    (flags, data)
}

/// Whether a mount target should be a placeholder file rather than a directory.
fn looks_file_like(source: &Path, target: &Path) -> bool {
    if source.is_file() {
        return true;
    }
    !source.is_dir() && target.extension().is_some()
}

fn prepare_target(source: &Path, target: &Path) -> Result<()> {
    if target.exists() {
        return Ok(());
    }
    if looks_file_like(source, target) {
        if let Some(parent) = target.parent() {
            create_dir(parent)?;
        }
        fs::File::create(target).map_err(|e| {
            JailError::Mount(format!(
                "failed to create mount point {}: {e}",
                target.display()
            ))
        })?;
        Ok(())
    } else {
        create_dir(target)
    }
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| {
        JailError::Mount(format!("failed to create mount point {}: {e}", path.display()))
    })
}
