//! Script execution on targets.
//!
//! A [`ScriptDefinition`] bundles a bash script with the constraints
//! under which it may run: CPU vendor/family/model/microarchitecture,
//! machine architecture, binaries it depends on, kernel modules it
//! needs, and whether it requires elevated privileges. [`run_script`]
//! enforces the constraints, stages the script through the target's temp
//! directory, and runs it.

use std::path::Path;

use tracing::debug;

use crate::cpu;
use crate::runner::CommandSpec;
use crate::target::{Target, TargetError};

/// A script and the conditions required to run it.
#[derive(Debug, Clone, Default)]
pub struct ScriptDefinition {
    pub name: String,
    pub script: String,
    /// Machine architectures (`uname -m`) the script runs on. Empty
    /// means any. Same convention for the other constraint lists.
    pub architectures: Vec<String>,
    pub vendors: Vec<String>,
    pub families: Vec<String>,
    pub models: Vec<String>,
    pub microarchitectures: Vec<String>,
    /// Binaries that must resolve on the target before running.
    pub depends: Vec<String>,
    /// Kernel modules the script needs loaded.
    pub lkms: Vec<String>,
    pub superuser: bool,
    /// Must not run concurrently with other sequential scripts.
    pub sequential: bool,
}

/// Captured output of a completed script.
#[derive(Debug, Clone, Default)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Errors from script staging and execution.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// The target does not satisfy the script's constraints.
    #[error("script `{script}` is not applicable to {target}: {reason}")]
    NotApplicable {
        script: String,
        target: String,
        reason: String,
    },

    /// The script requires elevation the target cannot provide.
    #[error("script `{script}` requires elevated privileges on {target}")]
    ElevationDenied { script: String, target: String },

    /// A binary the script depends on is missing from the target.
    #[error("dependency `{dependency}` not found on {target}")]
    MissingDependency { dependency: String, target: String },

    /// Staging or execution failed.
    #[error(transparent)]
    Target(#[from] TargetError),

    /// Local staging I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

fn check_list(kind: &str, allowed: &[String], actual: &str) -> Result<(), String> {
    if allowed.is_empty() || allowed.iter().any(|a| a == actual) {
        Ok(())
    } else {
        Err(format!("{kind} {actual} not supported"))
    }
}

async fn check_applicability(
    target: &dyn Target,
    def: &ScriptDefinition,
) -> Result<(), ScriptError> {
    let not_applicable = |reason: String| ScriptError::NotApplicable {
        script: def.name.clone(),
        target: target.name().to_string(),
        reason,
    };
    if !def.architectures.is_empty() {
        let arch = target.architecture().await?;
        check_list("architecture", &def.architectures, &arch).map_err(not_applicable)?;
    }
    if !def.vendors.is_empty() {
        let vendor = target.vendor().await?;
        check_list("vendor", &def.vendors, &vendor).map_err(not_applicable)?;
    }
    if !def.families.is_empty() {
        let family = target.family().await?;
        check_list("family", &def.families, &family).map_err(not_applicable)?;
    }
    if !def.models.is_empty() {
        let model = target.model().await?;
        check_list("model", &def.models, &model).map_err(not_applicable)?;
    }
    if !def.microarchitectures.is_empty() {
        let family = target.family().await?;
        let model = target.model().await?;
        let stepping = target.stepping().await?;
        let uarch = cpu::resolve_cpu(&family, &model, &stepping)
            .map(|c| c.microarchitecture)
            .unwrap_or("");
        // derivative names (e.g. GNR_D) satisfy a base-name constraint
        if !def
            .microarchitectures
            .iter()
            .any(|u| uarch == u || uarch.starts_with(u.as_str()))
        {
            return Err(not_applicable(format!(
                "microarchitecture {} not supported",
                if uarch.is_empty() { "unknown" } else { uarch }
            )));
        }
    }
    Ok(())
}

async fn check_dependencies(
    target: &dyn Target,
    def: &ScriptDefinition,
    remote_dir: &Path,
) -> Result<(), ScriptError> {
    if def.depends.is_empty() {
        return Ok(());
    }
    // resolve through the user's PATH: non-login shells (and sudo) see a
    // sanitized PATH that hides tools installed under the user's profile
    let user_path = target.user_path().await?;
    for dependency in &def.depends {
        let lookup = CommandSpec::new("bash").arg("-c").arg(format!(
            "PATH=\"{}:{user_path}\" command -v {dependency}",
            remote_dir.display()
        ));
        if target.run_command(&lookup, 0, true).await.is_err() {
            return Err(ScriptError::MissingDependency {
                dependency: dependency.clone(),
                target: target.name().to_string(),
            });
        }
    }
    Ok(())
}

fn script_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{sanitized}.sh")
}

/// Run a script on a target.
///
/// The script body is written under `local_temp_dir`, pushed into the
/// target's temp directory, and executed with `bash` (under `sudo -S
/// bash` when it requires privileges the current user lacks). The
/// target's temp directory is prepended to PATH for the duration of the
/// script. Kernel modules the script needs are loaded first; the ones
/// this call loaded are unloaded afterwards.
///
/// # Errors
///
/// Returns an error if the target fails a constraint, a dependency or
/// privilege is missing, staging fails, or the script exits non-zero.
pub async fn run_script(
    target: &dyn Target,
    def: &ScriptDefinition,
    local_temp_dir: &Path,
) -> Result<ScriptOutput, ScriptError> {
    check_applicability(target, def).await?;

    if def.superuser && !target.is_super_user() && !target.can_elevate_privileges().await {
        return Err(ScriptError::ElevationDenied {
            script: def.name.clone(),
            target: target.name().to_string(),
        });
    }

    let remote_dir = target.create_temp_directory(None).await?;
    check_dependencies(target, def, &remote_dir).await?;

    let installed_lkms = if def.lkms.is_empty() {
        Vec::new()
    } else {
        target.install_kernel_modules(&def.lkms).await?
    };

    // stage the script through the local temp dir
    let file_name = script_file_name(&def.name);
    let local_path = local_temp_dir.join(&file_name);
    let body = format!(
        "#!/usr/bin/env bash\nexport PATH=\"{}:$PATH\"\n{}\n",
        remote_dir.display(),
        def.script
    );
    std::fs::write(&local_path, body)?;
    target.push_file(&local_path, &remote_dir).await?;
    let remote_path = remote_dir.join(&file_name);

    let mut spec = CommandSpec::new("bash").arg(remote_path.display().to_string());
    if def.superuser && !target.is_super_user() {
        spec = CommandSpec::new("sudo")
            .arg("-S")
            .arg("bash")
            .arg(remote_path.display().to_string());
    }
    debug!(script = %def.name, target = %target.name(), "running script");
    let run = target.run_command(&spec, 0, true).await;

    if !installed_lkms.is_empty() {
        if let Err(err) = target.uninstall_kernel_modules(&installed_lkms).await {
            tracing::warn!(target = %target.name(), %err, "failed to unload kernel modules");
        }
    }

    let result = run?;
    Ok(ScriptOutput {
        stdout: result.stdout,
        stderr: result.stderr,
        exit_code: result.exit_code,
    })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::target::LocalTarget;

    fn plain_script(name: &str, body: &str) -> ScriptDefinition {
        ScriptDefinition {
            name: name.to_string(),
            script: body.to_string(),
            ..ScriptDefinition::default()
        }
    }

    #[tokio::test]
    async fn runs_script_and_captures_output() {
        let local = TempDir::new().unwrap();
        let target = LocalTarget::new(None);
        let def = plain_script("say hello", "echo hello");
        let output = run_script(&target, &def, local.path()).await.unwrap();
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.exit_code, 0);
        target.remove_temp_directory().await.unwrap();
    }

    #[tokio::test]
    async fn failing_script_is_an_error() {
        let local = TempDir::new().unwrap();
        let target = LocalTarget::new(None);
        let def = plain_script("fail", "echo broken >&2; exit 2");
        let err = run_script(&target, &def, local.path()).await.unwrap_err();
        assert!(matches!(err, ScriptError::Target(_)));
        target.remove_temp_directory().await.unwrap();
    }

    #[tokio::test]
    async fn temp_dir_is_on_path() {
        let local = TempDir::new().unwrap();
        let target = LocalTarget::new(None);
        // drop a helper into the target temp dir, then resolve it by name
        let remote_dir = target.create_temp_directory(None).await.unwrap();
        let helper = remote_dir.join("fleettune-helper");
        std::fs::write(&helper, "#!/bin/sh\necho from-helper\n").unwrap();
        let mut perms = std::fs::metadata(&helper).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
        std::fs::set_permissions(&helper, perms).unwrap();

        let def = plain_script("use helper", "fleettune-helper");
        let output = run_script(&target, &def, local.path()).await.unwrap();
        assert_eq!(output.stdout.trim(), "from-helper");
        target.remove_temp_directory().await.unwrap();
    }

    #[tokio::test]
    async fn missing_dependency_is_reported() {
        let local = TempDir::new().unwrap();
        let target = LocalTarget::new(None);
        let def = ScriptDefinition {
            name: "needs tool".to_string(),
            script: "true".to_string(),
            depends: vec!["fleettune-no-such-binary".to_string()],
            ..ScriptDefinition::default()
        };
        let err = run_script(&target, &def, local.path()).await.unwrap_err();
        assert!(matches!(err, ScriptError::MissingDependency { .. }));
        target.remove_temp_directory().await.unwrap();
    }

    #[tokio::test]
    async fn dependency_resolves_through_user_path() {
        let local = TempDir::new().unwrap();
        let tools = TempDir::new().unwrap();
        let tool = tools.path().join("fleettune-dep-tool");
        std::fs::write(&tool, "#!/bin/sh\ntrue\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&tool).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&tool, perms).unwrap();

        let original = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{original}", tools.path().display()));
        // the target snapshots the user PATH lazily, after the prepend
        let target = LocalTarget::new(None);
        let def = ScriptDefinition {
            name: "needs user tool".to_string(),
            script: "true".to_string(),
            depends: vec!["fleettune-dep-tool".to_string()],
            ..ScriptDefinition::default()
        };
        let result = run_script(&target, &def, local.path()).await;
        std::env::set_var("PATH", original);
        result.unwrap();
        target.remove_temp_directory().await.unwrap();
    }

    #[tokio::test]
    async fn vendor_constraint_gates_execution() {
        let local = TempDir::new().unwrap();
        let target = LocalTarget::new(None);
        let def = ScriptDefinition {
            name: "vendor gated".to_string(),
            script: "true".to_string(),
            vendors: vec!["NoSuchVendor".to_string()],
            ..ScriptDefinition::default()
        };
        let result = run_script(&target, &def, local.path()).await;
        // on any real machine the vendor string never matches
        assert!(matches!(result, Err(ScriptError::NotApplicable { .. })));
        let _ = target.remove_temp_directory().await;
    }

    #[test]
    fn script_file_names_are_sanitized() {
        assert_eq!(script_file_name("set LLC size"), "set_LLC_size.sh");
    }
}
