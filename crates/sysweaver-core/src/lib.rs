//! # sysweaver-core
//!
//! Disposable build jails for provisioning operating-system images.
//!
//! A [`Jail`] layers a writable overlay over a read-only base tree, binds the
//! template tree read-only inside it, confines a shell with PID and user
//! namespaces, runs provisioning scripts through that shell and tears every
//! mount back down when the build is over:
//! - `isolation::mounts` builds the layered root and records each mount
//! - `isolation::namespace` spawns the confined shell
//! - `exec` runs commands inside the jail, streaming or buffered
//! - `isolation::teardown` unmounts with escalation and sweeps loop devices
//! - `host` is the privileged-operation seam (real Linux or test doubles)

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod exec;
pub mod host;
pub mod isolation;
pub mod jail;
pub mod ledger;
pub mod pipe;
pub mod sink;
pub mod system;

pub use config::{IdMapping, JailConfig, MountSpec};
pub use error::JailError;
pub use exec::{CommandOutput, OutputMode};
pub use host::{Host, LinuxHost};
pub use jail::{Jail, JailState};
pub use sink::LogSink;

/// Crate-level result type
pub type Result<T> = std::result::Result<T, JailError>;
