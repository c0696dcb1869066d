//! The target abstraction.
//!
//! A [`Target`] is a machine on which commands run, files land, and
//! hardware state gets read and written. [`LocalTarget`] is the machine
//! this process runs on, [`RemoteTarget`] is reached through `ssh`/`scp`,
//! and [`RawTarget`] stands in for a machine that is not reachable at all
//! (data previously collected from it is being replayed).
//!
//! Identity lookups (architecture, CPU family/model/stepping, vendor)
//! shell out at most once per target and are memoized. Privilege
//! elevation capability is probed lazily and cached as a tri-state so
//! repeated checks never re-prompt or re-run `sudo`.

mod local;
mod raw;
mod remote;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::runner::{CommandResult, CommandSpec, RunnerError};

pub use local::LocalTarget;
pub use raw::{RawTarget, RecordedIdentity};
pub use remote::RemoteTarget;

/// Errors from target operations.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    /// Command execution failed (spawn, i/o, timeout, or non-zero exit).
    #[error(transparent)]
    Runner(#[from] RunnerError),

    /// A command that must produce output produced none.
    #[error("`{command}` produced no output on {target}")]
    EmptyOutput { command: String, target: String },

    /// The operation is not supported by this target flavor.
    #[error("{target} does not support {operation}")]
    Unsupported {
        target: String,
        operation: &'static str,
    },

    /// Elevated privileges are required but unavailable.
    #[error("elevated privileges required on {target}")]
    ElevationDenied { target: String },

    /// Local filesystem operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A machine that commands can be run on.
///
/// Implementations are shared across tasks behind `Arc<dyn Target>`;
/// all mutation is interior and lock scopes never span an `.await`.
#[async_trait]
pub trait Target: Send + Sync {
    /// Human-readable name used in status lines and reports.
    fn name(&self) -> &str;

    /// Whether a connection to the target can be established.
    async fn can_connect(&self) -> bool;

    /// Whether commands can be run with elevated privileges. The answer
    /// is probed once and cached.
    async fn can_elevate_privileges(&self) -> bool;

    /// Whether the effective user on the target is root.
    fn is_super_user(&self) -> bool;

    /// Run a command on the target, capturing output in full.
    ///
    /// A `timeout_secs` of zero means no timeout. `reuse_connection`
    /// only matters for SSH-backed targets.
    ///
    /// # Errors
    ///
    /// Connection failures and non-zero exit codes both surface as
    /// errors; the target never interprets exit codes.
    async fn run_command(
        &self,
        spec: &CommandSpec,
        timeout_secs: u64,
        reuse_connection: bool,
    ) -> Result<CommandResult, TargetError>;

    /// Run a command on the target, streaming output line by line.
    ///
    /// The command actually issued on the local machine (for a remote
    /// target, the full `ssh` invocation) is sent on `issued_tx` before
    /// execution begins. The exit code is sent on `exit_tx` exactly once.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be started or times out.
    #[allow(clippy::too_many_arguments)]
    async fn run_command_stream(
        &self,
        spec: &CommandSpec,
        timeout_secs: u64,
        reuse_connection: bool,
        stdout_tx: mpsc::Sender<String>,
        stderr_tx: mpsc::Sender<String>,
        exit_tx: mpsc::Sender<i32>,
        issued_tx: mpsc::Sender<String>,
    ) -> Result<(), TargetError>;

    /// Machine architecture per `uname -m`, memoized.
    async fn architecture(&self) -> Result<String, TargetError>;

    /// CPU family per `lscpu`, memoized.
    async fn family(&self) -> Result<String, TargetError>;

    /// CPU model per `lscpu`, memoized.
    async fn model(&self) -> Result<String, TargetError>;

    /// CPU stepping per `lscpu`, memoized.
    async fn stepping(&self) -> Result<String, TargetError>;

    /// CPU vendor per `lscpu`, memoized.
    async fn vendor(&self) -> Result<String, TargetError>;

    /// The user's PATH on the target, memoized.
    async fn user_path(&self) -> Result<String, TargetError>;

    /// Create the target's working temp directory, optionally under
    /// `root`. Idempotent: a second call returns the existing directory.
    async fn create_temp_directory(&self, root: Option<&Path>) -> Result<PathBuf, TargetError>;

    /// The temp directory created earlier, if any.
    fn temp_directory(&self) -> Option<PathBuf>;

    /// Remove the temp directory and forget it. A no-op when none exists.
    async fn remove_temp_directory(&self) -> Result<(), TargetError>;

    /// Copy a local file or directory tree to `dst` on the target,
    /// preserving permissions.
    async fn push_file(&self, src: &Path, dst: &Path) -> Result<(), TargetError>;

    /// Copy a file from the target into the local directory `dst_dir`.
    async fn pull_file(&self, src: &Path, dst_dir: &Path) -> Result<(), TargetError>;

    /// Load the named kernel modules, returning the subset that this
    /// call newly loaded. Modules that are already present are skipped.
    async fn install_kernel_modules(&self, modules: &[String])
        -> Result<Vec<String>, TargetError>;

    /// Unload the named kernel modules. Per-module failures are logged
    /// and skipped.
    async fn uninstall_kernel_modules(&self, modules: &[String]) -> Result<(), TargetError>;
}

/// Tri-state answer to "can this target elevate privileges?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ElevationState {
    #[default]
    Unknown,
    Allowed,
    Denied,
}

#[derive(Debug, Default)]
pub(crate) struct ElevationCache(Mutex<ElevationState>);

impl ElevationCache {
    pub(crate) fn get(&self) -> ElevationState {
        *lock_ok(&self.0)
    }

    pub(crate) fn set(&self, state: ElevationState) {
        *lock_ok(&self.0) = state;
    }
}

/// The memoizable identity fields of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdentityKey {
    Architecture,
    Family,
    Model,
    Stepping,
    Vendor,
}

impl IdentityKey {
    fn command(self) -> CommandSpec {
        match self {
            Self::Architecture => CommandSpec::new("uname").arg("-m"),
            Self::Family => lscpu_field("^CPU family:"),
            Self::Model => lscpu_field("model:"),
            Self::Stepping => lscpu_field("stepping:"),
            Self::Vendor => lscpu_field("^Vendor ID:"),
        }
    }
}

fn lscpu_field(label: &str) -> CommandSpec {
    CommandSpec::new("bash")
        .arg("-c")
        .arg(format!("lscpu | grep -i \"{label}\" | awk '{{print $NF}}'"))
}

/// Write-once store for the five identity fields. "Never queried" is a
/// distinct state; an empty value is never cached.
#[derive(Debug, Default)]
pub(crate) struct IdentityCache {
    inner: Mutex<[Option<String>; 5]>,
}

impl IdentityCache {
    fn slot(key: IdentityKey) -> usize {
        match key {
            IdentityKey::Architecture => 0,
            IdentityKey::Family => 1,
            IdentityKey::Model => 2,
            IdentityKey::Stepping => 3,
            IdentityKey::Vendor => 4,
        }
    }

    pub(crate) fn get(&self, key: IdentityKey) -> Option<String> {
        lock_ok(&self.inner)[Self::slot(key)].clone()
    }

    pub(crate) fn set(&self, key: IdentityKey, value: &str) {
        lock_ok(&self.inner)[Self::slot(key)] = Some(value.to_string());
    }
}

// Lock poisoning only happens if a holder panicked; the cached data is
// plain strings, so continuing with it is sound.
pub(crate) fn lock_ok<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Fetch one identity field, consulting the cache first. Two racing
/// callers may both run the command; both cache the same value.
pub(crate) async fn identity_value(
    target: &dyn Target,
    cache: &IdentityCache,
    key: IdentityKey,
) -> Result<String, TargetError> {
    if let Some(value) = cache.get(key) {
        return Ok(value);
    }
    let spec = key.command();
    let result = target.run_command(&spec, 0, true).await?;
    let value = result.stdout.trim().to_string();
    if value.is_empty() {
        return Err(TargetError::EmptyOutput {
            command: spec.display(),
            target: target.name().to_string(),
        });
    }
    cache.set(key, &value);
    Ok(value)
}

/// Wrap a command in `sudo -S` unless the target is already root.
pub(crate) fn elevated(target: &dyn Target, spec: CommandSpec) -> CommandSpec {
    if target.is_super_user() {
        spec
    } else {
        CommandSpec::new("sudo")
            .arg("-S")
            .arg(spec.program())
            .args(spec.arguments().iter().cloned())
    }
}

pub(crate) async fn install_kernel_modules_on(
    target: &dyn Target,
    modules: &[String],
) -> Result<Vec<String>, TargetError> {
    if !target.can_elevate_privileges().await {
        return Err(TargetError::ElevationDenied {
            target: target.name().to_string(),
        });
    }
    let mut installed = Vec::new();
    for module in modules {
        debug!(module, "attempting to load kernel module");
        let spec = elevated(
            target,
            CommandSpec::new("modprobe").arg("--first-time").arg(module),
        );
        match target.run_command(&spec, 10, true).await {
            Ok(_) => {
                debug!(module, "kernel module loaded");
                installed.push(module.clone());
            }
            Err(err) => {
                debug!(module, %err, "kernel module already loaded or load failed");
            }
        }
    }
    Ok(installed)
}

pub(crate) async fn uninstall_kernel_modules_on(
    target: &dyn Target,
    modules: &[String],
) -> Result<(), TargetError> {
    if !target.can_elevate_privileges().await {
        return Err(TargetError::ElevationDenied {
            target: target.name().to_string(),
        });
    }
    for module in modules {
        debug!(module, "attempting to unload kernel module");
        let spec = elevated(target, CommandSpec::new("modprobe").arg("-r").arg(module));
        if let Err(err) = target.run_command(&spec, 10, true).await {
            tracing::error!(module, %err, "error unloading kernel module");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Counts command executions; every command reports `x86_64`.
    #[derive(Default)]
    struct CountingTarget {
        commands: AtomicUsize,
    }

    #[async_trait]
    impl Target for CountingTarget {
        fn name(&self) -> &str {
            "counting"
        }

        async fn can_connect(&self) -> bool {
            true
        }

        async fn can_elevate_privileges(&self) -> bool {
            false
        }

        fn is_super_user(&self) -> bool {
            false
        }

        async fn run_command(
            &self,
            _spec: &CommandSpec,
            _timeout_secs: u64,
            _reuse_connection: bool,
        ) -> Result<CommandResult, TargetError> {
            self.commands.fetch_add(1, Ordering::SeqCst);
            Ok(CommandResult {
                stdout: "x86_64\n".to_string(),
                ..CommandResult::default()
            })
        }

        async fn run_command_stream(
            &self,
            _spec: &CommandSpec,
            _timeout_secs: u64,
            _reuse_connection: bool,
            _stdout_tx: mpsc::Sender<String>,
            _stderr_tx: mpsc::Sender<String>,
            _exit_tx: mpsc::Sender<i32>,
            _issued_tx: mpsc::Sender<String>,
        ) -> Result<(), TargetError> {
            unimplemented!()
        }

        async fn architecture(&self) -> Result<String, TargetError> {
            unimplemented!()
        }

        async fn family(&self) -> Result<String, TargetError> {
            unimplemented!()
        }

        async fn model(&self) -> Result<String, TargetError> {
            unimplemented!()
        }

        async fn stepping(&self) -> Result<String, TargetError> {
            unimplemented!()
        }

        async fn vendor(&self) -> Result<String, TargetError> {
            unimplemented!()
        }

        async fn user_path(&self) -> Result<String, TargetError> {
            unimplemented!()
        }

        async fn create_temp_directory(
            &self,
            _root: Option<&Path>,
        ) -> Result<PathBuf, TargetError> {
            unimplemented!()
        }

        fn temp_directory(&self) -> Option<PathBuf> {
            None
        }

        async fn remove_temp_directory(&self) -> Result<(), TargetError> {
            unimplemented!()
        }

        async fn push_file(&self, _src: &Path, _dst: &Path) -> Result<(), TargetError> {
            unimplemented!()
        }

        async fn pull_file(&self, _src: &Path, _dst_dir: &Path) -> Result<(), TargetError> {
            unimplemented!()
        }

        async fn install_kernel_modules(
            &self,
            _modules: &[String],
        ) -> Result<Vec<String>, TargetError> {
            unimplemented!()
        }

        async fn uninstall_kernel_modules(&self, _modules: &[String]) -> Result<(), TargetError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn identity_value_issues_the_command_once() {
        let target = CountingTarget::default();
        let cache = IdentityCache::default();
        let first = identity_value(&target, &cache, IdentityKey::Architecture)
            .await
            .unwrap();
        let second = identity_value(&target, &cache, IdentityKey::Architecture)
            .await
            .unwrap();
        assert_eq!(first, "x86_64");
        assert_eq!(second, "x86_64");
        // the second lookup was served from the cache
        assert_eq!(target.commands.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn identity_cache_starts_unqueried() {
        let cache = IdentityCache::default();
        assert_eq!(cache.get(IdentityKey::Vendor), None);
    }

    #[test]
    fn identity_cache_is_write_once_per_field() {
        let cache = IdentityCache::default();
        cache.set(IdentityKey::Family, "6");
        assert_eq!(cache.get(IdentityKey::Family), Some("6".to_string()));
        assert_eq!(cache.get(IdentityKey::Model), None);
    }

    #[test]
    fn elevation_cache_defaults_to_unknown() {
        let cache = ElevationCache::default();
        assert_eq!(cache.get(), ElevationState::Unknown);
        cache.set(ElevationState::Denied);
        assert_eq!(cache.get(), ElevationState::Denied);
    }
}
