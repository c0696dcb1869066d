//! The `config` command.
//!
//! Collects one setting change per supplied flag, resolves the targets,
//! and hands everything to the orchestrator. Each target gets its own
//! temp directory, created up front and removed at the end unless
//! `--debug` asked to keep it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use fleettune_core::orchestrator::{self, SettingChange, TargetUpdateResult};
use fleettune_core::progress::ConsoleStatus;
use fleettune_core::settings::Toggle;
use fleettune_core::target::Target;
use tempfile::TempDir;
use tracing::{info, warn};

use crate::{changes, targets};

#[derive(clap::Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,

    #[command(flatten)]
    target_args: targets::TargetArgs,

    /// Number of on-line physical cores per socket
    #[arg(long)]
    cores: Option<u32>,

    /// Last-level cache size in MB
    #[arg(long)]
    llc: Option<f64>,

    /// Maximum core frequency in GHz
    #[arg(long = "core-max")]
    core_max: Option<f64>,

    /// Package power limit in watts
    #[arg(long)]
    tdp: Option<u32>,

    /// Energy performance bias (0 performance - 15 powersave)
    #[arg(long, value_parser = clap::value_parser!(u8).range(..=15))]
    epb: Option<u8>,

    /// Energy performance preference (0 performance - 255 powersave)
    #[arg(long)]
    epp: Option<u8>,

    /// Frequency scaling governor
    #[arg(long, value_parser = ["performance", "powersave"])]
    gov: Option<String>,

    /// Efficiency latency control mode
    #[arg(long, value_parser = ["latency-optimized", "default"])]
    elc: Option<String>,

    /// Maximum uncore frequency in GHz
    #[arg(long = "uncore-max")]
    uncore_max: Option<f64>,

    /// Minimum uncore frequency in GHz
    #[arg(long = "uncore-min")]
    uncore_min: Option<f64>,

    /// Maximum compute die uncore frequency in GHz
    #[arg(long = "uncore-max-compute")]
    uncore_max_compute: Option<f64>,

    /// Minimum compute die uncore frequency in GHz
    #[arg(long = "uncore-min-compute")]
    uncore_min_compute: Option<f64>,

    /// Maximum IO die uncore frequency in GHz
    #[arg(long = "uncore-max-io")]
    uncore_max_io: Option<f64>,

    /// Minimum IO die uncore frequency in GHz
    #[arg(long = "uncore-min-io")]
    uncore_min_io: Option<f64>,

    /// L2 hardware prefetcher
    #[arg(long = "pref-l2hw")]
    pref_l2hw: Option<Toggle>,

    /// L2 adjacent cache line prefetcher
    #[arg(long = "pref-l2adj")]
    pref_l2adj: Option<Toggle>,

    /// DCU hardware prefetcher
    #[arg(long = "pref-dcuhw")]
    pref_dcuhw: Option<Toggle>,

    /// DCU IP prefetcher
    #[arg(long = "pref-dcuip")]
    pref_dcuip: Option<Toggle>,

    /// DCU next page prefetcher
    #[arg(long = "pref-dcunp")]
    pref_dcunp: Option<Toggle>,

    /// Adaptive multipath probability prefetcher
    #[arg(long = "pref-amp")]
    pref_amp: Option<Toggle>,

    /// LLC page prefetcher
    #[arg(long = "pref-llcpp")]
    pref_llcpp: Option<Toggle>,

    /// Array of pointers prefetcher
    #[arg(long = "pref-aop")]
    pref_aop: Option<Toggle>,

    /// Homeless prefetcher
    #[arg(long = "pref-homeless")]
    pref_homeless: Option<Toggle>,

    /// LLC prefetcher
    #[arg(long = "pref-llc")]
    pref_llc: Option<Toggle>,

    /// C6 C-state
    #[arg(long)]
    c6: Option<Toggle>,

    /// C1 demotion
    #[arg(long = "c1-demotion")]
    c1_demotion: Option<Toggle>,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Re-apply settings from a previously recorded configuration report
    Restore(super::restore::RestoreArgs),
}

impl ConfigArgs {
    /// One change per supplied flag, in flag declaration order.
    fn collect_changes(&self) -> Vec<SettingChange> {
        let mut out = Vec::new();
        if let Some(v) = self.cores {
            out.push(changes::cores(v));
        }
        if let Some(v) = self.llc {
            out.push(changes::llc(v));
        }
        if let Some(v) = self.core_max {
            out.push(changes::core_max(v));
        }
        if let Some(v) = self.tdp {
            out.push(changes::tdp(v));
        }
        if let Some(v) = self.epb {
            out.push(changes::epb(v));
        }
        if let Some(v) = self.epp {
            out.push(changes::epp(v));
        }
        if let Some(v) = &self.gov {
            out.push(changes::governor(v.clone()));
        }
        if let Some(v) = &self.elc {
            out.push(changes::elc(v.clone()));
        }
        if let Some(v) = self.uncore_max {
            out.push(changes::uncore("uncore-max", true, v));
        }
        if let Some(v) = self.uncore_min {
            out.push(changes::uncore("uncore-min", false, v));
        }
        if let Some(v) = self.uncore_max_compute {
            out.push(changes::uncore_die("uncore-max-compute", true, true, v));
        }
        if let Some(v) = self.uncore_min_compute {
            out.push(changes::uncore_die("uncore-min-compute", false, true, v));
        }
        if let Some(v) = self.uncore_max_io {
            out.push(changes::uncore_die("uncore-max-io", true, false, v));
        }
        if let Some(v) = self.uncore_min_io {
            out.push(changes::uncore_die("uncore-min-io", false, false, v));
        }
        let prefetchers = [
            self.pref_l2hw,
            self.pref_l2adj,
            self.pref_dcuhw,
            self.pref_dcuip,
            self.pref_dcunp,
            self.pref_amp,
            self.pref_llcpp,
            self.pref_aop,
            self.pref_homeless,
            self.pref_llc,
        ];
        for ((flag, name), toggle) in changes::PREFETCHER_FLAGS.iter().copied().zip(prefetchers) {
            if let Some(toggle) = toggle {
                out.push(changes::prefetcher(flag, name, toggle));
            }
        }
        if let Some(v) = self.c6 {
            out.push(changes::c6(v));
        }
        if let Some(v) = self.c1_demotion {
            out.push(changes::c1_demotion(v));
        }
        out
    }
}

/// Locally staged script files go either to a caller-supplied directory
/// or to an ephemeral one that lives for the duration of the run.
pub enum Staging {
    Ephemeral(TempDir),
    Fixed(PathBuf),
}

impl Staging {
    pub fn create(temp_dir: Option<PathBuf>) -> Result<Self> {
        match temp_dir {
            Some(dir) => {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
                Ok(Self::Fixed(dir))
            }
            None => Ok(Self::Ephemeral(
                TempDir::new().context("failed to create staging directory")?,
            )),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::Ephemeral(dir) => dir.path(),
            Self::Fixed(path) => path,
        }
    }

    /// Consume, keeping the directory on disk when `keep` is set.
    pub fn finish(self, keep: bool) {
        if let Self::Ephemeral(dir) = self {
            if keep {
                let path = dir.into_path();
                info!(path = %path.display(), "keeping staging directory");
            }
        }
    }
}

pub async fn run(args: ConfigArgs, temp_dir: Option<PathBuf>, debug: bool) -> Result<()> {
    if let Some(ConfigCommand::Restore(restore_args)) = args.command {
        return super::restore::run(restore_args, temp_dir, debug).await;
    }

    let requested = args.collect_changes();
    if requested.is_empty() {
        println!("No changes requested.");
        return Ok(());
    }

    let resolved = targets::resolve(&args.target_args).await?;
    let ready = prepare_targets(resolved).await?;
    let staging = Staging::create(temp_dir)?;

    let results = orchestrator::update_targets(
        ready.clone(),
        requested,
        staging.path(),
        Arc::new(ConsoleStatus),
    )
    .await;

    cleanup_targets(&ready, debug).await;
    staging.finish(debug);
    report_failures(&results)
}

/// Create each target's temp directory up front; targets that cannot get
/// one are reported and dropped.
pub async fn prepare_targets(targets: Vec<Arc<dyn Target>>) -> Result<Vec<Arc<dyn Target>>> {
    let mut ready = Vec::with_capacity(targets.len());
    for target in targets {
        match target.create_temp_directory(None).await {
            Ok(_) => ready.push(target),
            Err(err) => {
                eprintln!("{}: failed to create temp directory: {err}", target.name());
            }
        }
    }
    if ready.is_empty() {
        bail!("no usable targets");
    }
    Ok(ready)
}

pub async fn cleanup_targets(targets: &[Arc<dyn Target>], keep: bool) {
    for target in targets {
        if keep {
            if let Some(dir) = target.temp_directory() {
                info!(
                    target = %target.name(),
                    path = %dir.display(),
                    "keeping target temp directory"
                );
            }
            continue;
        }
        if let Err(err) = target.remove_temp_directory().await {
            warn!(target = %target.name(), %err, "failed to remove temp directory");
        }
    }
}

/// Print every per-setting error and fail the run if there were any.
pub fn report_failures(results: &[TargetUpdateResult]) -> Result<()> {
    let mut failed = 0usize;
    for result in results {
        for outcome in &result.outcomes {
            if let Some(error) = &outcome.error {
                eprintln!("{}: {}: {}", result.target_name, outcome.name, error);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} setting(s) failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct Harness {
        #[command(flatten)]
        args: ConfigArgs,
    }

    fn parse(argv: &[&str]) -> ConfigArgs {
        let mut full = vec!["fleettune"];
        full.extend_from_slice(argv);
        Harness::try_parse_from(full).unwrap().args
    }

    #[test]
    fn changes_follow_flag_declaration_order() {
        let args = parse(&["--tdp", "350", "--cores", "86", "--llc", "336"]);
        let names: Vec<String> = args
            .collect_changes()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, ["cores", "llc", "tdp"]);
    }

    #[test]
    fn no_flags_means_no_changes() {
        assert!(parse(&[]).collect_changes().is_empty());
    }

    #[test]
    fn epb_range_is_enforced() {
        let mut full = vec!["fleettune", "--epb", "16"];
        assert!(Harness::try_parse_from(full.drain(..)).is_err());
    }

    #[test]
    fn toggle_flags_parse() {
        let args = parse(&["--c6", "disable", "--pref-llc", "enable"]);
        let changes = args.collect_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].name, "pref-llc");
        assert_eq!(changes[0].value, "enable");
        assert_eq!(changes[1].name, "c6");
        assert_eq!(changes[1].value, "disable");
    }

    #[test]
    fn port_requires_target() {
        assert!(Harness::try_parse_from(["fleettune", "--port", "22"]).is_err());
    }
}
