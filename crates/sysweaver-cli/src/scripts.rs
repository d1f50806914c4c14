//! Template install scripts and build outputs

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Install scripts inside a template, relative to its root.
pub const INSTALL_DIR: &str = "scripts/install";

/// Where install scripts are visible inside the jail.
pub const JAIL_INSTALL_DIR: &str = "/scripts/install";

/// Directory inside the jail that build artifacts are collected from.
pub const OUTPUT_DIR: &str = "output";

/// Names of the `*.sh` install scripts of `template`, in execution order.
pub fn install_scripts(template: &Path) -> Result<Vec<String>> {
    let dir = template.join(INSTALL_DIR);
    let entries =
        fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))?;

    let mut scripts = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() || path.extension().is_none_or(|ext| ext != "sh") {
            continue;
        }
        scripts.push(entry.file_name().to_string_lossy().into_owned());
    }
    scripts.sort();
    Ok(scripts)
}

/// Path of install script `name` as seen from inside the jail.
#[must_use]
pub fn jail_path(name: &str) -> String {
    format!("{JAIL_INSTALL_DIR}/{name}")
}

/// Copy the regular files in `source` into `destination`.
///
/// Returns the copied destination paths; a missing `source` copies nothing.
pub fn collect_outputs(source: &Path, destination: &Path) -> Result<Vec<PathBuf>> {
    if !source.is_dir() {
        return Ok(Vec::new());
    }
    fs::create_dir_all(destination)
        .with_context(|| format!("failed to create {}", destination.display()))?;

    let mut entries = fs::read_dir(source)
        .with_context(|| format!("failed to read {}", source.display()))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(fs::DirEntry::file_name);

    let mut copied = Vec::new();
    for entry in entries {
        if !entry.file_type()?.is_file() {
            tracing::debug!(path = %entry.path().display(), "skipping non-file output");
            continue;
        }
        let target = destination.join(entry.file_name());
        fs::copy(entry.path(), &target).with_context(|| {
            format!(
                "failed to copy {} to {}",
                entry.path().display(),
                target.display()
            )
        })?;
        copied.push(target);
    }
    Ok(copied)
}
