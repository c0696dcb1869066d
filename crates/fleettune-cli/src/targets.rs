//! Target resolution.
//!
//! Targets come from one of three places: nothing (the local machine),
//! `--target` plus its companion flags (one remote machine), or
//! `--targets` (a TOML file listing several remote machines). Targets
//! that fail the connectivity probe are dropped with a report rather
//! than failing the whole run.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use fleettune_core::target::{LocalTarget, RemoteTarget, Target};
use serde::Deserialize;
use tracing::warn;

/// Flags selecting which machines to configure.
#[derive(clap::Args, Debug, Clone)]
pub struct TargetArgs {
    /// Remote host to configure (default: the local machine)
    #[arg(long)]
    pub target: Option<String>,

    /// SSH port for --target
    #[arg(long, requires = "target")]
    pub port: Option<u16>,

    /// SSH user for --target
    #[arg(long, requires = "target")]
    pub user: Option<String>,

    /// SSH private key file for --target
    #[arg(long, requires = "target")]
    pub key: Option<PathBuf>,

    /// TOML file listing remote targets
    #[arg(
        long,
        conflicts_with_all = ["target", "port", "user", "key"]
    )]
    pub targets: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct TargetsFile {
    #[serde(default)]
    targets: Vec<TargetEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetEntry {
    name: Option<String>,
    host: String,
    port: Option<u16>,
    user: Option<String>,
    key: Option<PathBuf>,
    password: Option<String>,
}

impl TargetEntry {
    fn into_target(self) -> RemoteTarget {
        let name = self.name.unwrap_or_else(|| self.host.clone());
        let target = RemoteTarget::new(name, self.host, self.port, self.user, self.key);
        if let Some(password) = self.password {
            target.set_ssh_pass(password);
        }
        target
    }
}

/// Build the target list from the flags, then probe connectivity and
/// privilege elevation. Unreachable targets are reported and dropped;
/// an empty survivor list is an error.
pub async fn resolve(args: &TargetArgs) -> Result<Vec<Arc<dyn Target>>> {
    let candidates: Vec<Arc<dyn Target>> = if let Some(file) = &args.targets {
        let raw = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read targets file {}", file.display()))?;
        let parsed: TargetsFile = toml::from_str(&raw)
            .with_context(|| format!("failed to parse targets file {}", file.display()))?;
        if parsed.targets.is_empty() {
            bail!("targets file {} lists no targets", file.display());
        }
        parsed
            .targets
            .into_iter()
            .map(|entry| Arc::new(entry.into_target()) as Arc<dyn Target>)
            .collect()
    } else if let Some(host) = &args.target {
        vec![Arc::new(RemoteTarget::new(
            host.clone(),
            host.clone(),
            args.port,
            args.user.clone(),
            args.key.clone(),
        ))]
    } else {
        vec![Arc::new(LocalTarget::new(None))]
    };

    let mut reachable = Vec::with_capacity(candidates.len());
    for target in candidates {
        if !target.can_connect().await {
            eprintln!("{}: unreachable, skipping", target.name());
            continue;
        }
        if !target.is_super_user() && !target.can_elevate_privileges().await {
            warn!(
                target = %target.name(),
                "cannot elevate privileges; settings that need root will fail"
            );
        }
        reachable.push(target);
    }
    if reachable.is_empty() {
        bail!("no reachable targets");
    }
    Ok(reachable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_file_round_trips() {
        let raw = r#"
[[targets]]
name = "gnr"
host = "gnr.lab.example.com"
port = 2222
user = "admin"
key = "/home/admin/.ssh/id_ed25519"

[[targets]]
host = "10.0.0.7"
password = "hunter2"
"#;
        let parsed: TargetsFile = toml::from_str(raw).unwrap();
        assert_eq!(parsed.targets.len(), 2);
        assert_eq!(parsed.targets[0].name.as_deref(), Some("gnr"));
        assert_eq!(parsed.targets[0].port, Some(2222));
        assert_eq!(parsed.targets[1].host, "10.0.0.7");
        // unnamed entries fall back to the host as display name
        let target = parsed.targets.last().unwrap();
        assert!(target.name.is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = "[[targets]]\nhost = \"h\"\npasword = \"typo\"\n";
        assert!(toml::from_str::<TargetsFile>(raw).is_err());
    }

    #[tokio::test]
    async fn local_target_is_the_default() {
        let args = TargetArgs {
            target: None,
            port: None,
            user: None,
            key: None,
            targets: None,
        };
        // the local machine is always reachable
        let resolved = resolve(&args).await.unwrap();
        assert_eq!(resolved.len(), 1);
    }
}
