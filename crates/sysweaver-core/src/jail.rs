//! Jail lifecycle controller

use crate::config::{IdMapping, JailConfig};
use crate::exec::{self, CommandOutput, OutputMode};
use crate::host::{ConfinedProcess, Host, LinuxHost};
use crate::isolation::namespace::{self, LaunchSpec, NamespaceConfig, ReentryTarget};
use crate::isolation::{JailLayout, MountOrchestrator, TeardownEngine, TeardownReport};
use crate::ledger::MountLedger;
use crate::{JailError, LogSink, Result};
use parking_lot::Mutex;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Observable lifecycle state of a [`Jail`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JailState {
    /// Nothing mounted, no confined shell
    Idle,
    /// Filesystem mounted and confined shell alive
    Running,
}

/// Resources that only exist while a jail is running
#[derive(Debug)]
struct Session {
    process: Box<dyn ConfinedProcess>,
    ledger: MountLedger,
    reentry: ReentryTarget,
}

#[derive(Debug)]
enum Lifecycle {
    Idle,
    Running(Session),
}

#[derive(Debug)]
struct Inner {
    lifecycle: Lifecycle,
    namespaces: NamespaceConfig,
    sink: LogSink,
    last_teardown: Option<TeardownReport>,
}

impl Inner {
    const fn session(&self) -> Option<&Session> {
        match &self.lifecycle {
            Lifecycle::Running(session) => Some(session),
            Lifecycle::Idle => None,
        }
    }

    const fn is_running(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Running(_))
    }
}

/// Owns the ledger while the jail is being set up.
///
/// Dropped without [`SetupGuard::commit`], it tears down whatever was
/// mounted so far, so both errors and panics during setup roll back.
struct SetupGuard<'a> {
    engine: TeardownEngine<'a>,
    fixed_targets: Vec<PathBuf>,
    ledger: MountLedger,
    armed: bool,
}

impl<'a> SetupGuard<'a> {
    fn new(engine: TeardownEngine<'a>, fixed_targets: Vec<PathBuf>) -> Self {
        Self {
            engine,
            fixed_targets,
            ledger: MountLedger::new(),
            armed: true,
        }
    }

    /// Setup succeeded: hand the ledger over to the session.
    fn commit(mut self) -> MountLedger {
        self.armed = false;
        std::mem::take(&mut self.ledger)
    }

    fn rollback(mut self) -> TeardownReport {
        self.armed = false;
        tracing::warn!(mounts = self.ledger.len(), "rolling back jail setup");
        self.engine.run(&mut self.ledger, &self.fixed_targets)
    }
}

impl Drop for SetupGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(mounts = self.ledger.len(), "jail setup aborted, unmounting");
            self.engine.run(&mut self.ledger, &self.fixed_targets);
        }
    }
}

/// A disposable build jail.
///
/// Every operation holds one exclusive lock for its whole duration, so a
/// `Jail` can be shared between threads but never does two things at once.
pub struct Jail {
    config: JailConfig,
    layout: JailLayout,
    host: Arc<dyn Host>,
    inner: Mutex<Inner>,
}

impl Jail {
    /// Create a jail on the real host, using `template` as the template tree.
    pub fn new(config: JailConfig, template: impl Into<PathBuf>) -> Result<Self> {
        Self::with_host(config, template, Arc::new(LinuxHost::new()))
    }

    /// Create a jail from a TOML config file.
    pub fn from_file(path: impl AsRef<Path>, template: impl Into<PathBuf>) -> Result<Self> {
        Self::new(JailConfig::load(path)?, template)
    }

    /// Create a jail whose privileged operations go through `host`.
    pub fn with_host(
        mut config: JailConfig,
        template: impl Into<PathBuf>,
        host: Arc<dyn Host>,
    ) -> Result<Self> {
        config.template_dir = template.into();
        config.validate()?;

        let namespaces = NamespaceConfig {
            pid: config.pid_namespace,
            uid_mappings: if config.uid_mappings.is_empty() {
                crate::config::default_uid_mappings()
            } else {
                config.uid_mappings.clone()
            },
            gid_mappings: if config.gid_mappings.is_empty() {
                crate::config::default_gid_mappings()
            } else {
                config.gid_mappings.clone()
            },
        };

        let sink = match &config.log_path {
            Some(path) => LogSink::file(path).map_err(|e| {
                JailError::Config(format!("failed to open log {}: {e}", path.display()))
            })?,
            None => LogSink::stdout(),
        };

        tracing::debug!(
            chroot = %config.chroot_dir.display(),
            base = %config.base_dir.display(),
            template = %config.template_dir.display(),
            mounts = config.mount_points.len(),
            "jail configured"
        );

        Ok(Self {
            layout: JailLayout::new(&config),
            config,
            host,
            inner: Mutex::new(Inner {
                lifecycle: Lifecycle::Idle,
                namespaces,
                sink,
                last_teardown: None,
            }),
        })
    }

    /// Mount the jail filesystem and start the confined shell.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.is_running() {
            return Err(JailError::AlreadyRunning);
        }
        self.config.check_paths_exist()?;

        tracing::info!(root = %self.layout.root.display(), "starting jail");

        let mut guard = SetupGuard::new(self.teardown_engine(), self.layout.fixed_targets());
        match self.setup(&mut guard.ledger, &inner) {
            Ok((spec, process)) => {
                let reentry = spec.reentry(process.pid());
                let ledger = guard.commit();
                tracing::info!(pid = process.pid(), mounts = ledger.len(), "jail running");
                inner.lifecycle = Lifecycle::Running(Session {
                    process,
                    ledger,
                    reentry,
                });
                Ok(())
            }
            Err(e) => {
                if e.is_critical() {
                    tracing::error!(error = %e, "template protection failed");
                } else {
                    tracing::error!(error = %e, "jail setup failed");
                }
                inner.last_teardown = Some(guard.rollback());
                Err(e)
            }
        }
    }

    fn setup(
        &self,
        ledger: &mut MountLedger,
        inner: &Inner,
    ) -> Result<(LaunchSpec, Box<dyn ConfinedProcess>)> {
        MountOrchestrator::new(&*self.host, &self.layout, ledger).build(&self.config.mount_points)?;

        let overrides = self.config.env_overrides()?;
        let spec = LaunchSpec {
            root: self.layout.root.clone(),
            shell: self.config.shell.clone(),
            env: namespace::jail_environment(&self.config.shell, &overrides),
            namespaces: inner.namespaces.clone(),
        };
        let process = namespace::launch(&*self.host, &spec, &inner.sink)?;
        Ok((spec, process))
    }

    /// Kill the confined shell and tear the jail down.
    ///
    /// Teardown problems are logged and kept in [`Jail::last_teardown`];
    /// they never make this fail.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let Lifecycle::Running(session) = std::mem::replace(&mut inner.lifecycle, Lifecycle::Idle)
        else {
            return Err(JailError::NotRunning);
        };
        inner.last_teardown = Some(self.end_session(session));
        Ok(())
    }

    fn end_session(&self, mut session: Session) -> TeardownReport {
        let pid = session.process.pid();
        tracing::info!(pid, "stopping jail");

        if let Err(e) = session.process.kill() {
            tracing::warn!(pid, error = %e, "failed to kill confined shell");
        }
        if let Err(e) = session.process.wait() {
            tracing::warn!(pid, error = %e, "failed to reap confined shell");
        }

        let report = self
            .teardown_engine()
            .run(&mut session.ledger, &self.layout.fixed_targets());
        if !report.is_clean() {
            tracing::warn!(
                warnings = report.warnings.len(),
                stuck = report.stuck.len(),
                "jail teardown left problems behind"
            );
        }
        report
    }

    fn teardown_engine(&self) -> TeardownEngine<'_> {
        TeardownEngine::new(&*self.host, self.config.unmount_retry_delay())
            .sweep_loops_under(self.layout.loop_owners())
    }

    /// Run `program` inside the jail, streaming its output to the log sink.
    pub fn execute_command(&self, program: &str, args: &[&str]) -> Result<()> {
        self.execute(program, args, OutputMode::Streaming).map(drop)
    }

    /// Run `program` inside the jail and return its combined output.
    pub fn execute_command_with_output(&self, program: &str, args: &[&str]) -> Result<Vec<u8>> {
        self.execute(program, args, OutputMode::Buffered)
            .map(|output| output.output)
    }

    /// Run `program` inside the jail in the given output mode.
    pub fn execute(&self, program: &str, args: &[&str], mode: OutputMode) -> Result<CommandOutput> {
        let inner = self.inner.lock();
        let session = inner.session().ok_or(JailError::NotRunning)?;

        tracing::info!(program, ?args, ?mode, "executing in jail");
        let command = self.host.reentry_command(&session.reentry, program, args);
        exec::run(command, program, mode, &inner.sink)
    }

    /// Open the configured shell inside the jail on the caller's terminal.
    pub fn interactive_shell(&self) -> Result<()> {
        let inner = self.inner.lock();
        let session = inner.session().ok_or(JailError::NotRunning)?;

        let shell = self.config.shell.to_string_lossy();
        tracing::info!(shell = %shell, "opening interactive shell in jail");
        let command = self.host.reentry_command(&session.reentry, &shell, &[]);
        exec::run_interactive(command, &shell)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.lock().is_running()
    }

    #[must_use]
    pub fn state(&self) -> JailState {
        if self.is_running() {
            JailState::Running
        } else {
            JailState::Idle
        }
    }

    /// Redirect jail output, including that of an already running shell.
    pub fn set_log_sink(&self, writer: impl Write + Send + 'static) {
        self.inner.lock().sink.replace(writer);
    }

    /// Confinement root on the host.
    #[must_use]
    pub fn chroot_dir(&self) -> &Path {
        &self.layout.root
    }

    #[must_use]
    pub const fn config(&self) -> &JailConfig {
        &self.config
    }

    #[must_use]
    pub const fn layout(&self) -> &JailLayout {
        &self.layout
    }

    /// Host pid of the confined shell while running.
    #[must_use]
    pub fn pid(&self) -> Option<i32> {
        self.inner.lock().session().map(|session| session.process.pid())
    }

    /// Mount targets currently owned, oldest first; empty when idle.
    #[must_use]
    pub fn mounts(&self) -> Vec<PathBuf> {
        self.inner
            .lock()
            .session()
            .map(|session| session.ledger.entries().to_vec())
            .unwrap_or_default()
    }

    /// Report of the most recent stop or setup rollback.
    #[must_use]
    pub fn last_teardown(&self) -> Option<TeardownReport> {
        self.inner.lock().last_teardown.clone()
    }

    /// Takes effect on the next start; ignored while running.
    pub fn set_pid_namespace_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock();
        if inner.is_running() {
            tracing::debug!(enabled, "jail is running, pid namespace change ignored");
            return;
        }
        inner.namespaces.pid = enabled;
    }

    /// Takes effect on the next start; ignored while running.
    pub fn set_uid_mappings(&self, mappings: Vec<IdMapping>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.is_running() {
            tracing::debug!(count = mappings.len(), "jail is running, uid mapping change ignored");
            return Ok(());
        }
        check_mappings(&mappings)?;
        inner.namespaces.uid_mappings = mappings;
        Ok(())
    }

    /// Takes effect on the next start; ignored while running.
    pub fn set_gid_mappings(&self, mappings: Vec<IdMapping>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.is_running() {
            tracing::debug!(count = mappings.len(), "jail is running, gid mapping change ignored");
            return Ok(());
        }
        check_mappings(&mappings)?;
        inner.namespaces.gid_mappings = mappings;
        Ok(())
    }

    #[must_use]
    pub fn pid_namespace_enabled(&self) -> bool {
        self.inner.lock().namespaces.pid
    }

    #[must_use]
    pub fn uid_mappings(&self) -> Vec<IdMapping> {
        self.inner.lock().namespaces.uid_mappings.clone()
    }

    #[must_use]
    pub fn gid_mappings(&self) -> Vec<IdMapping> {
        self.inner.lock().namespaces.gid_mappings.clone()
    }
}

fn check_mappings(mappings: &[IdMapping]) -> Result<()> {
    match mappings.iter().find(|m| m.size == 0) {
        Some(m) => Err(JailError::Config(format!(
            "id mapping {} -> {} has zero size",
            m.container_id, m.host_id
        ))),
        None => Ok(()),
    }
}

impl Drop for Jail {
    fn drop(&mut self) {
        let lifecycle = std::mem::replace(&mut self.inner.get_mut().lifecycle, Lifecycle::Idle);
        if let Lifecycle::Running(session) = lifecycle {
            tracing::warn!(root = %self.layout.root.display(), "jail dropped while running, stopping");
            let report = self.end_session(session);
            self.inner.get_mut().last_teardown = Some(report);
        }
    }
}

impl fmt::Debug for Jail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Jail")
            .field("layout", &self.layout)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
