//! Host preflight checks
//!
//! A jail needs `CAP_SYS_ADMIN` for its mounts plus two util-linux tools:
//! `nsenter` to re-enter the confined shell and `losetup` for the loop
//! device sweep.

use crate::{JailError, Result};
use caps::{CapSet, Capability};
use std::path::PathBuf;

/// External tools a running jail shells out to.
pub const REQUIRED_TOOLS: [&str; 2] = ["nsenter", "losetup"];

/// Results of all preflight checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preflight {
    /// `CAP_SYS_ADMIN` in the effective set
    pub sys_admin: bool,
    /// Each required tool with its resolved path, `None` when missing
    pub tools: Vec<(&'static str, Option<PathBuf>)>,
}

impl Preflight {
    /// Run every check without failing on the first problem.
    #[must_use]
    pub fn probe() -> Self {
        let sys_admin = match caps::has_cap(None, CapSet::Effective, Capability::CAP_SYS_ADMIN) {
            Ok(has) => has,
            Err(e) => {
                tracing::debug!(error = %e, "capability query failed");
                false
            }
        };
        let tools = REQUIRED_TOOLS
            .iter()
            .map(|&tool| (tool, which::which(tool).ok()))
            .collect();
        Self { sys_admin, tools }
    }

    #[must_use]
    pub fn missing_tools(&self) -> Vec<&'static str> {
        self.tools
            .iter()
            .filter(|(_, path)| path.is_none())
            .map(|(tool, _)| *tool)
            .collect()
    }

    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.sys_admin && self.missing_tools().is_empty()
    }

    /// First unmet requirement as an error.
    pub fn ensure(&self) -> Result<()> {
        if self.is_satisfied() {
            return Ok(());
        }
        if !self.sys_admin {
            return Err(JailError::Requirement(
                "CAP_SYS_ADMIN is required (run as root)".into(),
            ));
        }
        let missing = self.missing_tools();
        if !missing.is_empty() {
            return Err(JailError::Requirement(format!(
                "missing tools on PATH: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

/// Check all requirements, failing with the first one not met.
pub fn check_all() -> Result<Preflight> {
    let preflight = Preflight::probe();
    tracing::debug!(
        sys_admin = preflight.sys_admin,
        missing = ?preflight.missing_tools(),
        "preflight"
    );
    preflight.ensure()?;
    Ok(preflight)
}
