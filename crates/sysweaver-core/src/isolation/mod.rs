//! Jail isolation primitives
//!
//! This module contains the pieces a jail session is assembled from:
//! - `mounts` - overlay root, pseudo filesystems and template binds
//! - `namespace` - confined shell with PID/user namespaces and id maps
//! - `clone3` - clone3 syscall for spawning into new namespaces
//! - `teardown` - escalating unmount and loop-device sweep
//! - `loopdev` - `losetup` listing parser

pub mod clone3;
pub mod loopdev;
pub mod mounts;
pub mod namespace;
pub mod teardown;

pub use self::mounts::{JailLayout, MountOrchestrator};
pub use self::namespace::{LaunchSpec, NamespaceConfig, ReentryTarget};
pub use self::teardown::{TeardownEngine, TeardownReport};
