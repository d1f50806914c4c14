use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysweaver_core::isolation::{NamespaceConfig, ReentryTarget};
use sysweaver_core::{Host, IdMapping, Jail, JailConfig, LinuxHost};

#[test]
fn proc_is_mounted_and_tempdir_is_not() {
    let host = LinuxHost::new();
    let dir = tempfile::tempdir().unwrap();
    assert!(host.is_mounted(Path::new("/proc")).unwrap());
    assert!(!host.is_mounted(dir.path()).unwrap());
}

#[test]
fn write_probe_leaves_no_marker() {
    let host = LinuxHost::new();
    let dir = tempfile::tempdir().unwrap();
    assert!(host.probe_writable(dir.path()).unwrap());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn reentry_goes_through_nsenter() {
    let target = ReentryTarget {
        pid: 777,
        namespaces: NamespaceConfig {
            pid: true,
            uid_mappings: vec![IdMapping::root_to(1000)],
            gid_mappings: vec![IdMapping::root_to(1000)],
        },
        env: vec![("PATH".into(), "/bin".into())],
    };

    let command = LinuxHost::new().reentry_command(&target, "/bin/sh", &["/scripts/install/01.sh"]);

    assert!(command.get_program().to_string_lossy().ends_with("nsenter"));
    let args: Vec<&OsStr> = command.get_args().collect();
    assert_eq!(
        args,
        [
            "--target",
            "777",
            "--mount",
            "--user",
            "--pid",
            "--root",
            "--wd",
            "--",
            "/bin/sh",
            "/scripts/install/01.sh"
        ]
        .map(OsStr::new)
    );
    let envs: Vec<_> = command.get_envs().collect();
    assert_eq!(envs, [(OsStr::new("PATH"), Some(OsStr::new("/bin")))]);
}

/// Needs root and an unpacked root filesystem in `SYSWEAVER_TEST_ROOTFS`.
#[test]
#[ignore = "requires root and SYSWEAVER_TEST_ROOTFS"]
fn real_jail_runs_a_script() {
    let rootfs = PathBuf::from(std::env::var("SYSWEAVER_TEST_ROOTFS").unwrap());
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("template");
    std::fs::create_dir_all(template.join("scripts/install")).unwrap();
    let chroot = dir.path().join("jail");
    std::fs::create_dir_all(&chroot).unwrap();

    let config = JailConfig::builder()
        .chroot_dir(&chroot)
        .base_dir(&rootfs)
        .build();
    let jail = Jail::with_host(config, &template, Arc::new(LinuxHost::new())).unwrap();
    jail.set_log_sink(std::io::sink());
    jail.start().unwrap();

    let output = jail
        .execute_command_with_output("/bin/sh", &["-c", "id -u; test -w /template || echo ro"])
        .unwrap();
    jail.stop().unwrap();

    assert_eq!(String::from_utf8_lossy(&output), "0\nro\n");
    assert!(jail.last_teardown().unwrap().is_clean());
}
