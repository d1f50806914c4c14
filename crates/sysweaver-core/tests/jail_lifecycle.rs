mod common;

use common::{Call, Fixture, MockHost, SHELL_PID};
use nix::mount::MsFlags;
use std::path::PathBuf;
use sysweaver_core::{IdMapping, JailError, JailState, MountSpec};

#[test]
fn start_mounts_fixed_set_and_runs() {
    let fixture = Fixture::new();
    let host = MockHost::new();
    let jail = fixture.jail(&host);

    jail.start().unwrap();

    assert!(jail.is_running());
    assert_eq!(jail.state(), JailState::Running);
    assert_eq!(jail.pid(), Some(SHELL_PID));
    assert_eq!(jail.mounts(), fixture.fixed_mounts());
    assert_eq!(host.mounted(), fixture.fixed_mounts());
    assert!(fixture.dir.path().join("jail.overlay/upper").is_dir());
    assert!(fixture.dir.path().join("jail.overlay/work").is_dir());
}

#[test]
fn template_binds_are_remounted_read_only_and_probed() {
    let fixture = Fixture::new();
    let host = MockHost::new();
    let jail = fixture.jail(&host);
    jail.start().unwrap();

    let read_only = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
    for target in [fixture.root("template"), fixture.root("scripts")] {
        assert!(host.calls().contains(&Call::Mount {
            target: target.clone(),
            flags: read_only,
        }));
        assert!(host.calls().contains(&Call::Probe(target)));
    }
}

#[test]
fn stop_returns_to_idle_with_nothing_mounted() {
    let fixture = Fixture::new();
    let host = MockHost::new();
    let jail = fixture.jail(&host);
    jail.start().unwrap();
    host.clear_calls();

    jail.stop().unwrap();

    assert!(!jail.is_running());
    assert!(jail.mounts().is_empty());
    assert!(host.mounted().is_empty());
    assert_eq!(jail.pid(), None);

    let calls = host.calls();
    assert_eq!(calls[0], Call::Kill(SHELL_PID));
    assert_eq!(calls[1], Call::Wait(SHELL_PID));

    let report = jail.last_teardown().unwrap();
    assert!(report.is_clean());
    assert_eq!(report.unmounted.len(), fixture.fixed_mounts().len());
}

#[test]
fn unmounts_in_reverse_mount_order() {
    let fixture = Fixture::new();
    let host = MockHost::new();
    let mut config = fixture.config();
    config.mount_points.push(MountSpec::typed("tmpfs", "tmpfs", "/tmp"));
    let jail = fixture.jail_with(config, &host);

    jail.start().unwrap();
    let mounted = host.mount_targets();
    jail.stop().unwrap();

    let unmounted: Vec<PathBuf> = host
        .unmount_attempts()
        .into_iter()
        .map(|(target, _)| target)
        .collect();
    let mut expected = mounted;
    expected.reverse();
    assert_eq!(unmounted, expected);
}

#[test]
fn writable_template_is_critical_and_rolls_back() {
    let fixture = Fixture::new();
    let host = MockHost::new();
    host.writable_binds();
    let jail = fixture.jail(&host);

    let err = jail.start().unwrap_err();

    assert!(matches!(err, JailError::CriticalInvariantViolation(_)));
    assert!(err.is_critical());
    assert!(!jail.is_running());
    assert!(host.mounted().is_empty());
    assert!(!host.calls().iter().any(|c| matches!(c, Call::Spawn(_))));

    let unmounted: Vec<PathBuf> = host
        .unmount_attempts()
        .into_iter()
        .map(|(target, _)| target)
        .collect();
    assert_eq!(unmounted[0], fixture.root("template"));
    assert_eq!(unmounted.last(), Some(&fixture.root("")));
    assert!(jail.last_teardown().unwrap().stuck.is_empty());
}

#[test]
fn mount_failure_rolls_back_prefix() {
    let fixture = Fixture::new();
    let host = MockHost::new();
    host.fail_mount_at(fixture.root("sys"));
    let jail = fixture.jail(&host);

    let err = jail.start().unwrap_err();

    assert!(matches!(err, JailError::Mount(_)));
    assert!(!jail.is_running());
    assert!(host.mounted().is_empty());
    let unmounted: Vec<PathBuf> = host
        .unmount_attempts()
        .into_iter()
        .map(|(target, _)| target)
        .collect();
    assert_eq!(unmounted, [fixture.root("proc"), fixture.root("")]);
}

#[test]
fn spawn_failure_is_launch_error_with_rollback() {
    let fixture = Fixture::new();
    let host = MockHost::new();
    host.fail_spawn();
    let jail = fixture.jail(&host);

    let err = jail.start().unwrap_err();

    assert!(matches!(err, JailError::Launch(_)));
    assert!(!jail.is_running());
    assert!(host.mounted().is_empty());
    assert!(jail.mounts().is_empty());
}

#[test]
fn double_start_leaves_session_untouched() {
    let fixture = Fixture::new();
    let host = MockHost::new();
    let jail = fixture.jail(&host);
    jail.start().unwrap();
    let mounts = jail.mounts();
    host.clear_calls();

    let err = jail.start().unwrap_err();

    assert!(matches!(err, JailError::AlreadyRunning));
    assert!(host.calls().is_empty());
    assert!(jail.is_running());
    assert_eq!(jail.mounts(), mounts);
    assert_eq!(jail.pid(), Some(SHELL_PID));
}

#[test]
fn stop_while_idle_is_not_running() {
    let fixture = Fixture::new();
    let host = MockHost::new();
    let jail = fixture.jail(&host);

    assert!(matches!(jail.stop(), Err(JailError::NotRunning)));
    assert!(host.calls().is_empty());
}

#[test]
fn missing_base_is_path_not_found_without_mounting() {
    let fixture = Fixture::new();
    std::fs::remove_dir_all(&fixture.base).unwrap();
    let host = MockHost::new();
    let jail = fixture.jail(&host);

    let err = jail.start().unwrap_err();

    assert!(matches!(err, JailError::PathNotFound { what: "base tree", .. }));
    assert!(host.calls().is_empty());
    assert!(!fixture.dir.path().join("jail.overlay").exists());
}

#[test]
fn template_without_scripts_is_path_not_found() {
    let fixture = Fixture::new();
    std::fs::remove_dir_all(fixture.template.join("scripts")).unwrap();
    let host = MockHost::new();
    let jail = fixture.jail(&host);

    let err = jail.start().unwrap_err();

    assert!(matches!(err, JailError::PathNotFound { .. }));
    assert!(host.mounted().is_empty());
}

#[test]
fn mapping_changes_ignored_while_running() {
    let fixture = Fixture::new();
    let host = MockHost::new();
    let jail = fixture.jail(&host);
    let before = jail.uid_mappings();
    jail.start().unwrap();

    jail.set_uid_mappings(vec![IdMapping::new(0, 100_000, 65536)])
        .unwrap();
    jail.set_gid_mappings(vec![IdMapping::new(0, 100_000, 65536)])
        .unwrap();
    jail.set_pid_namespace_enabled(false);

    assert_eq!(jail.uid_mappings(), before);
    assert!(jail.pid_namespace_enabled());

    jail.stop().unwrap();
    jail.set_pid_namespace_enabled(false);
    assert!(!jail.pid_namespace_enabled());
}

#[test]
fn invalid_mappings_while_running_are_ignored_without_error() {
    let fixture = Fixture::new();
    let host = MockHost::new();
    let jail = fixture.jail(&host);
    let uids = jail.uid_mappings();
    let gids = jail.gid_mappings();
    jail.start().unwrap();

    assert!(jail.set_uid_mappings(vec![IdMapping::new(0, 1, 0)]).is_ok());
    assert!(jail.set_gid_mappings(vec![IdMapping::new(0, 1, 0)]).is_ok());
    assert_eq!(jail.uid_mappings(), uids);
    assert_eq!(jail.gid_mappings(), gids);

    jail.stop().unwrap();
    assert!(matches!(
        jail.set_uid_mappings(vec![IdMapping::new(0, 1, 0)]),
        Err(JailError::Config(_))
    ));
}

#[test]
fn scratch_is_recreated_empty_on_every_start() {
    let fixture = Fixture::new();
    let host = MockHost::new();
    let upper = fixture.dir.path().join("jail.overlay/upper");
    std::fs::create_dir_all(&upper).unwrap();
    std::fs::write(upper.join("stale"), "left over").unwrap();
    let jail = fixture.jail(&host);

    jail.start().unwrap();
    assert!(upper.is_dir());
    assert!(!upper.join("stale").exists());

    std::fs::write(upper.join("from-first-run"), "built").unwrap();
    jail.stop().unwrap();
    jail.start().unwrap();

    assert_eq!(std::fs::read_dir(&upper).unwrap().count(), 0);
    assert!(fixture.dir.path().join("jail.overlay/work").is_dir());
}

#[test]
fn scratch_enclosing_base_and_template_is_rejected() {
    let fixture = Fixture::new();
    let host = MockHost::new();
    let mut config = fixture.config();
    config.scratch_dir = Some(fixture.dir.path().to_path_buf());
    config.template_dir.clone_from(&fixture.template);

    assert!(matches!(config.validate(), Err(JailError::Config(_))));
    let result = sysweaver_core::Jail::with_host(
        config,
        &fixture.template,
        std::sync::Arc::clone(&host) as std::sync::Arc<dyn sysweaver_core::Host>,
    );

    assert!(matches!(result, Err(JailError::Config(_))));
    assert!(fixture.base.join("bin").is_dir());
    assert!(fixture.template.join("scripts/install/01-hello.sh").is_file());
    assert!(host.calls().is_empty());
}

#[test]
fn namespace_settings_reach_the_launcher() {
    let fixture = Fixture::new();
    let host = MockHost::new();
    let mut config = fixture.config();
    config.environment = vec!["ARCH=aarch64".into(), "HOME=/build".into()];
    let jail = fixture.jail_with(config, &host);
    jail.set_pid_namespace_enabled(false);
    jail.set_uid_mappings(vec![IdMapping::root_to(1234)]).unwrap();

    jail.start().unwrap();

    let spec = host
        .calls()
        .into_iter()
        .find_map(|call| match call {
            Call::Spawn(spec) => Some(spec),
            _ => None,
        })
        .unwrap();
    assert_eq!(spec.root, fixture.chroot);
    assert!(!spec.namespaces.pid);
    assert_eq!(spec.namespaces.uid_mappings, vec![IdMapping::root_to(1234)]);
    assert!(spec.env.contains(&("HOME".into(), "/build".into())));
    assert!(spec.env.contains(&("ARCH".into(), "aarch64".into())));
    assert!(spec.env.iter().any(|(k, _)| k == "PATH"));
}

#[test]
fn jail_restarts_after_stop() {
    let fixture = Fixture::new();
    let host = MockHost::new();
    let jail = fixture.jail(&host);

    for _ in 0..3 {
        jail.start().unwrap();
        assert_eq!(jail.mounts().len(), fixture.fixed_mounts().len());
        jail.stop().unwrap();
        assert!(host.mounted().is_empty());
    }
}

#[test]
fn dropping_running_jail_tears_down() {
    let fixture = Fixture::new();
    let host = MockHost::new();
    {
        let jail = fixture.jail(&host);
        jail.start().unwrap();
    }
    assert!(host.mounted().is_empty());
    assert!(host.calls().contains(&Call::Kill(SHELL_PID)));
}

#[test]
fn extra_mounts_follow_fixed_set() {
    let fixture = Fixture::new();
    let cache = fixture.dir.path().join("cache");
    std::fs::create_dir_all(&cache).unwrap();
    let resolv = fixture.dir.path().join("resolv.conf");
    std::fs::write(&resolv, "nameserver 9.9.9.9\n").unwrap();

    let host = MockHost::new();
    let mut config = fixture.config();
    config.mount_points = vec![
        MountSpec::bind(&cache, "/var/cache/apk").option("ro"),
        MountSpec::bind(&resolv, "etc/resolv.conf"),
        MountSpec::typed("tmpfs", "tmpfs", "/tmp").option("size=64m"),
    ];
    let jail = fixture.jail_with(config, &host);

    jail.start().unwrap();

    let mut expected = fixture.fixed_mounts();
    expected.extend([
        fixture.root("var/cache/apk"),
        fixture.root("etc/resolv.conf"),
        fixture.root("tmp"),
    ]);
    assert_eq!(jail.mounts(), expected);
    assert!(fixture.root("etc/resolv.conf").is_file());
    assert!(fixture.root("var/cache/apk").is_dir());
    assert!(host.calls().contains(&Call::Probe(fixture.root("var/cache/apk"))));
}

#[test]
fn writable_extra_bind_is_mount_error_not_critical() {
    let fixture = Fixture::new();
    let host = MockHost::new();
    host.writable_at(fixture.root("srv"));
    let mut config = fixture.config();
    config.mount_points = vec![MountSpec::bind(&fixture.base, "/srv").option("ro")];
    let jail = fixture.jail_with(config, &host);

    let err = jail.start().unwrap_err();

    assert!(matches!(err, JailError::Mount(_)));
    assert!(!err.is_critical());
    assert!(!jail.is_running());
    assert!(host.mounted().is_empty());
}
