//! A machine reached through `ssh` and `scp`.
//!
//! Every command is wrapped in an `ssh` invocation executed locally.
//! Authentication is by key file or, when only a password is available,
//! by `sshpass -e` with the password passed through the `SSHPASS`
//! environment variable so it never appears on a command line.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    identity_value, install_kernel_modules_on, lock_ok, uninstall_kernel_modules_on,
    ElevationCache, ElevationState, IdentityCache, IdentityKey, Target, TargetError,
};
use crate::runner::{run_local_command, run_local_command_stream, CommandResult, CommandSpec};

/// A machine reached over SSH.
#[derive(Debug)]
pub struct RemoteTarget {
    name: String,
    host: String,
    port: Option<u16>,
    user: Option<String>,
    key: Option<PathBuf>,
    ssh_pass: Mutex<Option<String>>,
    sshpass_path: Mutex<Option<PathBuf>>,
    identity: IdentityCache,
    elevation: ElevationCache,
    temp_dir: Mutex<Option<PathBuf>>,
    user_path: Mutex<Option<String>>,
}

impl RemoteTarget {
    /// Create a target for `host`, displayed as `name`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: Option<u16>,
        user: Option<String>,
        key: Option<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            user,
            key,
            ssh_pass: Mutex::new(None),
            sshpass_path: Mutex::new(None),
            identity: IdentityCache::default(),
            elevation: ElevationCache::default(),
            temp_dir: Mutex::new(None),
            user_path: Mutex::new(None),
        }
    }

    /// Set the SSH password used when no key file is configured.
    pub fn set_ssh_pass(&self, pass: impl Into<String>) {
        *lock_ok(&self.ssh_pass) = Some(pass.into());
    }

    /// Set the path to the `sshpass` binary. Required for password auth.
    pub fn set_sshpass_path(&self, path: impl Into<PathBuf>) {
        *lock_ok(&self.sshpass_path) = Some(path.into());
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    fn ssh_flags(&self, scp: bool, use_control_master: bool, prompt: bool) -> Vec<String> {
        let mut flags: Vec<String> = [
            "-2",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "ConnectTimeout=10",
            "-o",
            "GSSAPIAuthentication=no",
            "-o",
            "ServerAliveInterval=30",
            "-o",
            "ServerAliveCountMax=10", // 30 * 10 = up to 300s of silence before disconnect
            "-o",
            "LogLevel=ERROR",
        ]
        .map(String::from)
        .to_vec();
        // batch mode suppresses password prompts; leave it off when
        // sshpass is going to answer the prompt
        if !prompt {
            flags.push("-o".into());
            flags.push("BatchMode=yes".into());
        }
        if use_control_master {
            let control_path = std::env::temp_dir().join(format!(
                "control-%h-%p-%r-{}",
                std::process::id()
            ));
            flags.push("-o".into());
            flags.push(format!("ControlPath={}", control_path.display()));
            flags.push("-o".into());
            flags.push("ControlMaster=auto".into());
            flags.push("-o".into());
            flags.push("ControlPersist=1m".into());
        }
        if let Some(key) = &self.key {
            flags.push("-o".into());
            flags.push("PreferredAuthentications=publickey".into());
            flags.push("-o".into());
            flags.push("PasswordAuthentication=no".into());
            flags.push("-i".into());
            flags.push(key.display().to_string());
        }
        if let Some(port) = self.port {
            flags.push(if scp { "-P" } else { "-p" }.into());
            flags.push(port.to_string());
        }
        flags
    }

    /// Wrap `spec` into the ssh invocation that actually runs locally,
    /// prefixed with `sshpass -e` when password authentication is in use.
    fn prepare_local_command(&self, spec: &CommandSpec, use_control_master: bool) -> CommandSpec {
        let use_pass = self.key.is_none() && lock_ok(&self.ssh_pass).is_some();
        let mut ssh = CommandSpec::new("ssh")
            .args(self.ssh_flags(false, use_control_master, use_pass))
            .arg(self.destination())
            .arg("--")
            .arg(spec.program())
            .args(spec.arguments().iter().cloned());
        if use_pass {
            ssh = self.wrap_sshpass(ssh);
        }
        ssh
    }

    fn wrap_sshpass(&self, inner: CommandSpec) -> CommandSpec {
        let sshpass = lock_ok(&self.sshpass_path)
            .clone()
            .map_or_else(|| "sshpass".to_string(), |p| p.display().to_string());
        let pass = lock_ok(&self.ssh_pass).clone().unwrap_or_default();
        CommandSpec::new(sshpass)
            .arg("-e")
            .arg("--")
            .arg(inner.program())
            .args(inner.arguments().iter().cloned())
            .env("SSHPASS", pass)
    }

    fn prepare_scp_command(&self, src: &Path, dst_dir: &Path, push: bool) -> CommandSpec {
        let mut scp = CommandSpec::new("scp").args(self.ssh_flags(true, true, false));
        if push {
            if src.is_dir() {
                scp = scp.arg("-r");
            }
            scp = scp.arg(src.display().to_string()).arg(format!(
                "{}:{}",
                self.destination(),
                dst_dir.display()
            ));
        } else {
            scp = scp
                .arg(format!("{}:{}", self.destination(), src.display()))
                .arg(dst_dir.display().to_string());
        }
        if self.key.is_none() && lock_ok(&self.ssh_pass).is_some() {
            scp = self.wrap_sshpass(scp);
        }
        scp
    }

    async fn run_scp(&self, src: &Path, dst_dir: &Path, push: bool) -> Result<(), TargetError> {
        let spec = self.prepare_scp_command(src, dst_dir, push);
        let result = run_local_command(&spec, None, 0).await?;
        debug!(
            src = %src.display(),
            dst = %dst_dir.display(),
            push,
            exit_code = result.exit_code,
            "file transfer"
        );
        Ok(())
    }
}

#[async_trait]
impl Target for RemoteTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn can_connect(&self) -> bool {
        let spec = CommandSpec::new("exit").arg("0");
        self.run_command(&spec, 5, true).await.is_ok()
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
        // interactive sudo is not possible through batch-mode ssh, so
        // only passwordless sudo counts
        let trial = CommandSpec::new("sudo").arg("-kS").arg("ls");
        if self.run_command(&trial, 0, true).await.is_ok() {
            self.elevation.set(ElevationState::Allowed);
            return true;
        }
        self.elevation.set(ElevationState::Denied);
        false
    }

    fn is_super_user(&self) -> bool {
        self.user.as_deref() == Some("root")
    }

    async fn run_command(
        &self,
        spec: &CommandSpec,
        timeout_secs: u64,
        reuse_connection: bool,
    ) -> Result<CommandResult, TargetError> {
        let local = self.prepare_local_command(spec, reuse_connection);
        Ok(run_local_command(&local, None, timeout_secs).await?)
    }

    async fn run_command_stream(
        &self,
        spec: &CommandSpec,
        timeout_secs: u64,
        reuse_connection: bool,
        stdout_tx: mpsc::Sender<String>,
        stderr_tx: mpsc::Sender<String>,
        exit_tx: mpsc::Sender<i32>,
        issued_tx: mpsc::Sender<String>,
    ) -> Result<(), TargetError> {
        let local = self.prepare_local_command(spec, reuse_connection);
        let _ = issued_tx.send(local.display()).await;
        run_local_command_stream(&local, None, timeout_secs, stdout_tx, stderr_tx, exit_tx)
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
        let spec = CommandSpec::new("bash").arg("-l").arg("-c").arg("echo $PATH");
        let result = self.run_command(&spec, 0, true).await?;
        let path = result.stdout.trim().to_string();
        if path.is_empty() {
            return Err(TargetError::EmptyOutput {
                command: spec.display(),
                target: self.name.clone(),
            });
        }
        *lock_ok(&self.user_path) = Some(path.clone());
        Ok(path)
    }

    async fn create_temp_directory(&self, root: Option<&Path>) -> Result<PathBuf, TargetError> {
        if let Some(dir) = lock_ok(&self.temp_dir).clone() {
            return Ok(dir);
        }
        let mut spec = CommandSpec::new("mktemp").arg("-d").arg("-t");
        if let Some(root) = root {
            spec = spec.arg(format!("--tmpdir={}", root.display()));
        }
        // the pipe is interpreted by the remote shell
        spec = spec
            .arg("fleettune.tmp.XXXXXXXXXX")
            .arg("|")
            .arg("xargs")
            .arg("realpath");
        let result = self.run_command(&spec, 0, true).await?;
        let dir = PathBuf::from(result.stdout.trim());
        if dir.as_os_str().is_empty() {
            return Err(TargetError::EmptyOutput {
                command: spec.display(),
                target: self.name.clone(),
            });
        }
        *lock_ok(&self.temp_dir) = Some(dir.clone());
        Ok(dir)
    }

    fn temp_directory(&self) -> Option<PathBuf> {
        lock_ok(&self.temp_dir).clone()
    }

    async fn remove_temp_directory(&self) -> Result<(), TargetError> {
        let dir = lock_ok(&self.temp_dir).clone();
        if let Some(dir) = dir {
            let spec = CommandSpec::new("rm")
                .arg("-rf")
                .arg(dir.display().to_string());
            self.run_command(&spec, 0, true).await?;
            *lock_ok(&self.temp_dir) = None;
        }
        Ok(())
    }

    async fn push_file(&self, src: &Path, dst: &Path) -> Result<(), TargetError> {
        self.run_scp(src, dst, true).await
    }

    async fn pull_file(&self, src: &Path, dst_dir: &Path) -> Result<(), TargetError> {
        self.run_scp(src, dst_dir, false).await
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

#[cfg(test)]
mod tests {
    use super::*;

    fn target_with_key() -> RemoteTarget {
        RemoteTarget::new(
            "db1",
            "db1.example.com",
            Some(2222),
            Some("admin".to_string()),
            Some(PathBuf::from("/home/admin/.ssh/id_ed25519")),
        )
    }

    #[test]
    fn ssh_command_shape_with_key() {
        let target = target_with_key();
        let spec = CommandSpec::new("uname").arg("-m");
        let local = target.prepare_local_command(&spec, true);
        assert_eq!(local.program(), "ssh");
        let rendered = local.display();
        assert!(rendered.contains("BatchMode=yes"));
        assert!(rendered.contains("ControlMaster=auto"));
        assert!(rendered.contains("-i /home/admin/.ssh/id_ed25519"));
        assert!(rendered.contains("-p 2222"));
        assert!(rendered.ends_with("admin@db1.example.com -- uname -m"));
    }

    #[test]
    fn ssh_command_without_control_master() {
        let target = target_with_key();
        let spec = CommandSpec::new("ls");
        let local = target.prepare_local_command(&spec, false);
        assert!(!local.display().contains("ControlMaster"));
    }

    #[test]
    fn password_auth_uses_sshpass_env() {
        let target = RemoteTarget::new("web1", "web1", None, Some("op".to_string()), None);
        target.set_ssh_pass("hunter2");
        target.set_sshpass_path("/usr/bin/sshpass");
        let local = target.prepare_local_command(&CommandSpec::new("ls"), true);
        assert_eq!(local.program(), "/usr/bin/sshpass");
        let rendered = local.display();
        // password travels via SSHPASS env, never on the command line
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("BatchMode"));
        assert!(rendered.starts_with("/usr/bin/sshpass -e -- ssh"));
    }

    #[test]
    fn scp_pull_shape() {
        let target = target_with_key();
        let spec = target.prepare_scp_command(
            Path::new("/tmp/remote/report.txt"),
            Path::new("/tmp/local"),
            false,
        );
        let rendered = spec.display();
        assert!(rendered.starts_with("scp"));
        assert!(rendered.contains("-P 2222"));
        assert!(rendered.ends_with("admin@db1.example.com:/tmp/remote/report.txt /tmp/local"));
    }

    #[test]
    fn super_user_is_root_user_only() {
        let root = RemoteTarget::new("a", "a", None, Some("root".to_string()), None);
        assert!(root.is_super_user());
        let other = RemoteTarget::new("b", "b", None, Some("admin".to_string()), None);
        assert!(!other.is_super_user());
    }
}
