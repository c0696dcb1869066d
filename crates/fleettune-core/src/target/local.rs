//! The machine this process runs on.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::error;

use super::{
    identity_value, install_kernel_modules_on, lock_ok, uninstall_kernel_modules_on,
    ElevationCache, ElevationState, IdentityCache, IdentityKey, Target, TargetError,
};
use crate::runner::{run_local_command, run_local_command_stream, CommandResult, CommandSpec};

/// The local machine.
#[derive(Debug, Default)]
pub struct LocalTarget {
    name: String,
    sudo: Mutex<Option<String>>,
    identity: IdentityCache,
    elevation: ElevationCache,
    temp_dir: Mutex<Option<PathBuf>>,
    user_path: Mutex<Option<String>>,
}

impl LocalTarget {
    /// Create a target for the local machine, named after its hostname.
    #[must_use]
    pub fn new(sudo: Option<String>) -> Self {
        let name = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            name,
            sudo: Mutex::new(sudo),
            ..Self::default()
        }
    }

    /// Set the sudo password. Invalidates the cached elevation answer.
    pub fn set_sudo(&self, sudo: impl Into<String>) {
        *lock_ok(&self.sudo) = Some(sudo.into());
        self.elevation.set(ElevationState::Unknown);
    }

    /// `sudo -S` reads the password from stdin; pipe the configured
    /// secret only for commands of that shape.
    fn stdin_secret(&self, spec: &CommandSpec) -> Option<String> {
        let sudo = lock_ok(&self.sudo).clone()?;
        let first = spec.arguments().first()?;
        if spec.program() == "sudo"
            && spec.arguments().len() >= 2
            && first.starts_with('-')
            && first.contains('S')
        {
            Some(format!("{sudo}\n"))
        } else {
            None
        }
    }
}

#[async_trait]
impl Target for LocalTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn can_connect(&self) -> bool {
        true
    }

    async fn can_elevate_privileges(&self) -> bool {
        match self.elevation.get() {
            ElevationState::Allowed => return true,
            ElevationState::Denied => return false,
            ElevationState::Unknown => {}
        }
        if self.is_super_user() {
            self.elevation.set(ElevationState::Allowed);
            return true;
        }
        let trial = CommandSpec::new("sudo").arg("-kS").arg("ls");
        // clone out of the guard before awaiting; the guard must not
        // live across a suspension point
        let secret = lock_ok(&self.sudo).clone();
        if let Some(secret) = secret {
            let input = format!("{secret}\n");
            if run_local_command(&trial, Some(&input), 0).await.is_ok() {
                self.elevation.set(ElevationState::Allowed);
                return true;
            }
        }
        // passwordless sudo: -S with closed stdin fails fast when a
        // password is actually required
        if run_local_command(&trial, None, 0).await.is_ok() {
            self.elevation.set(ElevationState::Allowed);
            return true;
        }
        self.elevation.set(ElevationState::Denied);
        false
    }

    fn is_super_user(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    async fn run_command(
        &self,
        spec: &CommandSpec,
        timeout_secs: u64,
        _reuse_connection: bool,
    ) -> Result<CommandResult, TargetError> {
        let input = self.stdin_secret(spec);
        Ok(run_local_command(spec, input.as_deref(), timeout_secs).await?)
    }

    async fn run_command_stream(
        &self,
        spec: &CommandSpec,
        timeout_secs: u64,
        _reuse_connection: bool,
        stdout_tx: mpsc::Sender<String>,
        stderr_tx: mpsc::Sender<String>,
        exit_tx: mpsc::Sender<i32>,
        issued_tx: mpsc::Sender<String>,
    ) -> Result<(), TargetError> {
        let input = self.stdin_secret(spec);
        let _ = issued_tx.send(spec.display()).await;
        run_local_command_stream(
            spec,
            input.as_deref(),
            timeout_secs,
            stdout_tx,
            stderr_tx,
            exit_tx,
        )
        .await
        .map_err(Into::into)
    }

    async fn architecture(&self) -> Result<String, TargetError> {
        identity_value(self, &self.identity, IdentityKey::Architecture).await
    }

    async fn family(&self) -> Result<String, TargetError> {
        identity_value(self, &self.identity, IdentityKey::Family).await
    }

    async fn model(&self) -> Result<String, TargetError> {
        identity_value(self, &self.identity, IdentityKey::Model).await
    }

    async fn stepping(&self) -> Result<String, TargetError> {
        identity_value(self, &self.identity, IdentityKey::Stepping).await
    }

    async fn vendor(&self) -> Result<String, TargetError> {
        identity_value(self, &self.identity, IdentityKey::Vendor).await
    }

    async fn user_path(&self) -> Result<String, TargetError> {
        if let Some(path) = lock_ok(&self.user_path).clone() {
            return Ok(path);
        }
        // keep only components that are real directories
        let path_env = std::env::var("PATH").unwrap_or_default();
        let verified: Vec<&str> = path_env
            .split(':')
            .filter(|p| !p.is_empty() && Path::new(p).is_dir())
            .collect();
        let path = verified.join(":");
        *lock_ok(&self.user_path) = Some(path.clone());
        Ok(path)
    }

    async fn create_temp_directory(&self, root: Option<&Path>) -> Result<PathBuf, TargetError> {
        if let Some(dir) = lock_ok(&self.temp_dir).clone() {
            return Ok(dir);
        }
        let root = root
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let dir = tempfile::Builder::new()
            .prefix("fleettune.tmp.")
            .tempdir_in(root)?
            .into_path();
        *lock_ok(&self.temp_dir) = Some(dir.clone());
        Ok(dir)
    }

    fn temp_directory(&self) -> Option<PathBuf> {
        lock_ok(&self.temp_dir).clone()
    }

    async fn remove_temp_directory(&self) -> Result<(), TargetError> {
        let dir = lock_ok(&self.temp_dir).clone();
        if let Some(dir) = dir {
            tokio::fs::remove_dir_all(&dir).await?;
            *lock_ok(&self.temp_dir) = None;
        }
        Ok(())
    }

    async fn push_file(&self, src: &Path, dst: &Path) -> Result<(), TargetError> {
        let meta = std::fs::metadata(src)?;
        if meta.is_dir() {
            let base = src.file_name().map(PathBuf::from).unwrap_or_default();
            let dst_dir = dst.join(base);
            std::fs::create_dir_all(&dst_dir)?;
            copy_dir_recursive(src, &dst_dir)?;
        } else {
            let dst = if dst.is_dir() {
                dst.join(src.file_name().map(PathBuf::from).unwrap_or_default())
            } else {
                dst.to_path_buf()
            };
            std::fs::copy(src, &dst)?;
        }
        Ok(())
    }

    async fn pull_file(&self, src: &Path, dst_dir: &Path) -> Result<(), TargetError> {
        self.push_file(src, dst_dir).await
    }

    async fn install_kernel_modules(
        &self,
        modules: &[String],
    ) -> Result<Vec<String>, TargetError> {
        install_kernel_modules_on(self, modules).await
    }

    async fn uninstall_kernel_modules(&self, modules: &[String]) -> Result<(), TargetError> {
        uninstall_kernel_modules_on(self, modules).await
    }
}

/// Copy a directory tree, preserving file permissions. `std::fs::copy`
/// carries permissions over on Unix.
fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let dst_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&dst_path)?;
            std::fs::set_permissions(&dst_path, entry.metadata()?.permissions())
                .unwrap_or_else(|e| error!(path = %dst_path.display(), error = %e, "failed to set directory permissions"));
            copy_dir_recursive(&entry.path(), &dst_path)?;
        } else {
            std::fs::copy(entry.path(), &dst_path)?;
        }
    }
    Ok(())
}
