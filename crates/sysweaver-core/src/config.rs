//! Jail configuration

use crate::{JailError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Configuration for a build jail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JailConfig {
    /// Confinement root; the overlay is mounted here
    pub chroot_dir: PathBuf,

    /// Read-only base tree (overlay lower layer)
    #[serde(alias = "builder_path")]
    pub base_dir: PathBuf,

    /// Read-only template tree, bound at `/template`
    #[serde(alias = "template_path")]
    pub template_dir: PathBuf,

    /// Where the overlay upper/work layers live (defaults next to `chroot_dir`)
    pub scratch_dir: Option<PathBuf>,

    /// `KEY=VALUE` overrides for the jail environment
    pub environment: Vec<String>,

    /// Extra mounts created after the fixed set
    pub mount_points: Vec<MountSpec>,

    /// File receiving the jail's log output
    pub log_path: Option<PathBuf>,

    /// Give the confined shell its own PID namespace
    pub pid_namespace: bool,

    /// UID mappings; empty means root inside maps to the invoking user
    pub uid_mappings: Vec<IdMapping>,

    /// GID mappings; empty means root inside maps to the invoking group
    pub gid_mappings: Vec<IdMapping>,

    /// Pause between unmount escalation attempts
    pub unmount_retry_delay_ms: u64,

    /// Shell started inside the jail
    pub shell: PathBuf,
}

impl Default for JailConfig {
    fn default() -> Self {
        let workdir = default_workdir();
        Self {
            chroot_dir: workdir.join("jail"),
            base_dir: workdir.join("base"),
            template_dir: PathBuf::new(),
            scratch_dir: None,
            environment: Vec::new(),
            mount_points: Vec::new(),
            log_path: None,
            pid_namespace: true,
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            unmount_retry_delay_ms: 250,
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl JailConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> JailConfigBuilder {
        JailConfigBuilder::default()
    }

    /// Load a jail configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            JailError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| JailError::Config(format!("{}: {e}", path.display())))
    }

    /// Parse a jail configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| JailError::Config(format!("invalid config: {e}")))
    }

    /// Check the static invariants: required paths set and distinct,
    /// well-formed environment, mounts and mappings.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("chroot_dir", &self.chroot_dir),
            ("base_dir", &self.base_dir),
            ("template_dir", &self.template_dir),
        ];
        for (name, path) in required {
            if path.as_os_str().is_empty() {
                return Err(JailError::Config(format!("{name} must be set")));
            }
        }
        if self.chroot_dir == self.base_dir
            || self.chroot_dir == self.template_dir
            || self.base_dir == self.template_dir
        {
            return Err(JailError::Config(
                "chroot_dir, base_dir and template_dir must be distinct".into(),
            ));
        }

        let scratch = self.scratch_dir();
        for (name, path) in required {
            if scratch.starts_with(path) {
                return Err(JailError::Config(format!(
                    "scratch_dir {} must not be inside {name}",
                    scratch.display()
                )));
            }
            if path.starts_with(&scratch) {
                return Err(JailError::Config(format!(
                    "{name} {} must not be inside scratch_dir {}",
                    path.display(),
                    scratch.display()
                )));
            }
        }

        self.env_overrides()?;

        for spec in &self.mount_points {
            if spec.source.as_os_str().is_empty() {
                return Err(JailError::Config(format!(
                    "mount for {} has no source",
                    spec.destination.display()
                )));
            }
            spec.relative_destination()?;
        }

        for mapping in self.uid_mappings.iter().chain(&self.gid_mappings) {
            if mapping.size == 0 {
                return Err(JailError::Config(format!(
                    "id mapping {} -> {} has zero size",
                    mapping.container_id, mapping.host_id
                )));
            }
        }

        if self.shell.as_os_str().is_empty() {
            return Err(JailError::Config("shell must be set".into()));
        }

        Ok(())
    }

    /// Fail with `PathNotFound` unless the chroot, base and template trees exist.
    pub fn check_paths_exist(&self) -> Result<()> {
        let required = [
            ("base tree", &self.base_dir),
            ("template tree", &self.template_dir),
            ("confinement root", &self.chroot_dir),
        ];
        for (what, path) in required {
            if !path.is_dir() {
                return Err(JailError::PathNotFound {
                    what,
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }

    /// Directory holding the overlay upper and work layers.
    #[must_use]
    pub fn scratch_dir(&self) -> PathBuf {
        if let Some(dir) = &self.scratch_dir {
            return dir.clone();
        }
        let name = self
            .chroot_dir
            .file_name()
            .map_or_else(|| "jail".into(), |n| n.to_string_lossy().into_owned());
        self.chroot_dir.with_file_name(format!("{name}.overlay"))
    }

    /// Environment overrides split into key/value pairs.
    pub fn env_overrides(&self) -> Result<Vec<(String, String)>> {
        self.environment
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
                _ => Err(JailError::Config(format!(
                    "environment entry {entry:?} is not KEY=VALUE"
                ))),
            })
            .collect()
    }

    #[must_use]
    pub const fn unmount_retry_delay(&self) -> Duration {
        Duration::from_millis(self.unmount_retry_delay_ms)
    }
}

/// Builder for [`JailConfig`]
#[derive(Debug, Default)]
pub struct JailConfigBuilder {
    config: JailConfig,
}

impl JailConfigBuilder {
    #[must_use]
    pub fn chroot_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.chroot_dir = path.into();
        self
    }

    #[must_use]
    pub fn base_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.base_dir = path.into();
        self
    }

    #[must_use]
    pub fn template_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.template_dir = path.into();
        self
    }

    #[must_use]
    pub fn scratch_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.scratch_dir = Some(path.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.config
            .environment
            .push(format!("{}={}", key.as_ref(), value.as_ref()));
        self
    }

    #[must_use]
    pub fn mount(mut self, spec: MountSpec) -> Self {
        self.config.mount_points.push(spec);
        self
    }

    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.log_path = Some(path.into());
        self
    }

    #[must_use]
    pub const fn pid_namespace(mut self, enabled: bool) -> Self {
        self.config.pid_namespace = enabled;
        self
    }

    #[must_use]
    pub fn uid_mapping(mut self, mapping: IdMapping) -> Self {
        self.config.uid_mappings.push(mapping);
        self
    }

    #[must_use]
    pub fn gid_mapping(mut self, mapping: IdMapping) -> Self {
        self.config.gid_mappings.push(mapping);
        self
    }

    #[must_use]
    pub const fn unmount_retry_delay_ms(mut self, millis: u64) -> Self {
        self.config.unmount_retry_delay_ms = millis;
        self
    }

    #[must_use]
    pub fn shell(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.shell = path.into();
        self
    }

    #[must_use]
    pub fn build(self) -> JailConfig {
        self.config
    }
}

/// An extra mount requested by the build configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: PathBuf,
    /// Target path, relative to the confinement root
    pub destination: PathBuf,
    /// Filesystem type; empty or `bind` for a bind mount
    #[serde(rename = "type", default)]
    pub fs_type: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl MountSpec {
    /// Bind mount of `source` at `destination`
    #[must_use]
    pub fn bind(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            fs_type: "bind".into(),
            options: Vec::new(),
        }
    }

    /// Typed mount such as `tmpfs`
    #[must_use]
    pub fn typed(
        fs_type: impl Into<String>,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            fs_type: fs_type.into(),
            options: Vec::new(),
        }
    }

    #[must_use]
    pub fn option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    #[must_use]
    pub fn is_bind(&self) -> bool {
        self.fs_type.is_empty()
            || self.fs_type == "bind"
            || self.options.iter().any(|o| o == "bind" || o == "rbind")
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }

    /// Destination with any leading `/` removed.
    ///
    /// Rejects empty destinations and `..` components so a mount can never
    /// land outside the confinement root.
    pub fn relative_destination(&self) -> Result<PathBuf> {
        let mut relative = PathBuf::new();
        for component in self.destination.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => relative.push(part),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(JailError::Config(format!(
                        "mount destination {} escapes the jail",
                        self.destination.display()
                    )));
                }
            }
        }
        if relative.as_os_str().is_empty() {
            return Err(JailError::Config(format!(
                "mount destination {} is the jail root",
                self.destination.display()
            )));
        }
        Ok(relative)
    }
}

/// One line of a user-namespace id map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    /// First id as seen inside the jail
    pub container_id: u32,
    /// First id on the host
    pub host_id: u32,
    /// Number of consecutive ids mapped
    pub size: u32,
}

impl IdMapping {
    #[must_use]
    pub const fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    /// Root inside the jail maps to `host_id`.
    #[must_use]
    pub const fn root_to(host_id: u32) -> Self {
        Self::new(0, host_id, 1)
    }

    /// Render mappings in the `/proc/<pid>/uid_map` format.
    #[must_use]
    pub fn render(mappings: &[Self]) -> String {
        let mut out = String::new();
        for m in mappings {
            let _ = writeln!(out, "{} {} {}", m.container_id, m.host_id, m.size);
        }
        out
    }
}

/// Root inside maps to the invoking user.
#[must_use]
pub fn default_uid_mappings() -> Vec<IdMapping> {
    vec![IdMapping::root_to(nix::unistd::getuid().as_raw())]
}

/// Root inside maps to the invoking group.
#[must_use]
pub fn default_gid_mappings() -> Vec<IdMapping> {
    vec![IdMapping::root_to(nix::unistd::getgid().as_raw())]
}

/// Get default work directory from SYSWEAVER_WORKDIR env var or system default
///
/// Returns:
/// - `$SYSWEAVER_WORKDIR` if set (for development)
/// - `/var/lib/sysweaver` otherwise
pub fn default_workdir() -> PathBuf {
    std::env::var("SYSWEAVER_WORKDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/sysweaver"))
}
