//! A target that is not reachable.
//!
//! Used when previously collected data is being replayed: the name and
//! the recorded identity are available, and every operation that would
//! touch the machine fails with [`TargetError::Unsupported`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Target, TargetError};
use crate::runner::{CommandResult, CommandSpec};

/// Identity fields recorded when the machine was last reachable.
#[derive(Debug, Clone, Default)]
pub struct RecordedIdentity {
    pub architecture: String,
    pub family: String,
    pub model: String,
    pub stepping: String,
    pub vendor: String,
}

/// A named, unreachable target backed by recorded data.
#[derive(Debug)]
pub struct RawTarget {
    name: String,
    identity: RecordedIdentity,
}

impl RawTarget {
    #[must_use]
    pub fn new(name: impl Into<String>, identity: RecordedIdentity) -> Self {
        Self {
            name: name.into(),
            identity,
        }
    }

    fn unsupported(&self, operation: &'static str) -> TargetError {
        TargetError::Unsupported {
            target: self.name.clone(),
            operation,
        }
    }
}

#[async_trait]
impl Target for RawTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn can_connect(&self) -> bool {
        false
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
        Err(self.unsupported("command execution"))
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
        Err(self.unsupported("command execution"))
    }

    async fn architecture(&self) -> Result<String, TargetError> {
        Ok(self.identity.architecture.clone())
    }

    async fn family(&self) -> Result<String, TargetError> {
        Ok(self.identity.family.clone())
    }

    async fn model(&self) -> Result<String, TargetError> {
        Ok(self.identity.model.clone())
    }

    async fn stepping(&self) -> Result<String, TargetError> {
        Ok(self.identity.stepping.clone())
    }

    async fn vendor(&self) -> Result<String, TargetError> {
        Ok(self.identity.vendor.clone())
    }

    async fn user_path(&self) -> Result<String, TargetError> {
        Err(self.unsupported("path lookup"))
    }

    async fn create_temp_directory(&self, _root: Option<&Path>) -> Result<PathBuf, TargetError> {
        Err(self.unsupported("temp directories"))
    }

    fn temp_directory(&self) -> Option<PathBuf> {
        None
    }

    async fn remove_temp_directory(&self) -> Result<(), TargetError> {
        Err(self.unsupported("temp directories"))
    }

    async fn push_file(&self, _src: &Path, _dst: &Path) -> Result<(), TargetError> {
        Err(self.unsupported("file transfer"))
    }

    async fn pull_file(&self, _src: &Path, _dst_dir: &Path) -> Result<(), TargetError> {
        Err(self.unsupported("file transfer"))
    }

    async fn install_kernel_modules(
        &self,
        _modules: &[String],
    ) -> Result<Vec<String>, TargetError> {
        Err(self.unsupported("kernel modules"))
    }

    async fn uninstall_kernel_modules(&self, _modules: &[String]) -> Result<(), TargetError> {
        Err(self.unsupported("kernel modules"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raw_target_serves_recorded_identity() {
        let target = RawTarget::new(
            "replay",
            RecordedIdentity {
                architecture: "x86_64".into(),
                family: "6".into(),
                model: "143".into(),
                stepping: "8".into(),
                vendor: "GenuineIntel".into(),
            },
        );
        assert_eq!(target.name(), "replay");
        assert_eq!(target.vendor().await.unwrap(), "GenuineIntel");
        assert!(!target.can_connect().await);
    }

    #[tokio::test]
    async fn raw_target_refuses_execution() {
        let target = RawTarget::new("replay", RecordedIdentity::default());
        let err = target
            .run_command(&CommandSpec::new("ls"), 0, true)
            .await
            .unwrap_err();
        assert!(matches!(err, TargetError::Unsupported { .. }));
    }
}
