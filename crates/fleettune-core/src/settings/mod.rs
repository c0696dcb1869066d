//! Hardware setting writers.
//!
//! One async function per configurable setting. Each reads whatever
//! state it needs from the target, computes the new register or sysfs
//! value, and writes it through the script layer. All writers share the
//! same shape so the orchestrator can treat them uniformly.
//!
//! The uncore frequency registers are shared state across every task in
//! the process: read-modify-write sequences against MSR 0x620 and the
//! TPMI uncore block are serialized by the two module-level mutexes.

use std::path::Path;
use std::str::FromStr;

use regex::Regex;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cpu;
use crate::script::{run_script, ScriptDefinition, ScriptError};
use crate::target::{Target, TargetError};

mod scripts;

use scripts::set_core_count_script;

/// Serializes read-modify-write access to MSR 0x620.
static UNCORE_MSR_LOCK: Mutex<()> = Mutex::const_new(());

/// Serializes per-die writes to the TPMI uncore block.
static UNCORE_TPMI_LOCK: Mutex<()> = Mutex::const_new(());

/// Errors from setting writers.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Target(#[from] TargetError),

    /// The setting cannot be applied to this target's hardware.
    #[error("{setting} not supported on {target}: {reason}")]
    Unsupported {
        setting: &'static str,
        target: String,
        reason: String,
    },

    /// The requested value is out of range or malformed.
    #[error("invalid {setting} value: {reason}")]
    Invalid {
        setting: &'static str,
        reason: String,
    },

    /// The hardware already holds the requested value.
    #[error("{setting} is already set to {value}")]
    AlreadySet { setting: &'static str, value: String },

    /// A register read produced something unparseable.
    #[error("failed to parse {what}: {source}")]
    Parse {
        what: String,
        source: std::num::ParseIntError,
    },
}

/// Whether a feature is being switched on or off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Enable,
    Disable,
}

impl FromStr for Toggle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enable" => Ok(Self::Enable),
            "disable" => Ok(Self::Disable),
            other => Err(format!("expected enable or disable, got {other}")),
        }
    }
}

impl std::fmt::Display for Toggle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Enable => "enable",
            Self::Disable => "disable",
        })
    }
}

async fn run_setting_script(
    target: &dyn Target,
    def: &ScriptDefinition,
    local_temp_dir: &Path,
) -> Result<String, ApplyError> {
    match run_script(target, def, local_temp_dir).await {
        Ok(output) => {
            debug!(
                target = %target.name(),
                script = %def.name,
                stdout = %output.stdout,
                stderr = %output.stderr,
                "ran script on target"
            );
            Ok(output.stdout)
        }
        Err(err) => {
            tracing::error!(target = %target.name(), script = %def.name, %err, "failed to run script on target");
            Err(err.into())
        }
    }
}

/// Read an MSR with `rdmsr`, returning the raw 64-bit value.
async fn read_msr(
    target: &dyn Target,
    local_temp_dir: &Path,
    msr: u64,
) -> Result<u64, ApplyError> {
    let def = ScriptDefinition {
        name: format!("read msr {msr:#x}"),
        script: format!("rdmsr {msr:#x}"),
        vendors: vec![cpu::INTEL_VENDOR.to_string()],
        superuser: true,
        ..ScriptDefinition::default()
    };
    let stdout = run_setting_script(target, &def, local_temp_dir).await?;
    let trimmed = stdout.trim();
    u64::from_str_radix(trimmed, 16).map_err(|source| ApplyError::Parse {
        what: format!("msr {msr:#x} value `{trimmed}`"),
        source,
    })
}

/// Write an MSR on every core with `wrmsr -a`.
async fn write_msr_all(
    target: &dyn Target,
    local_temp_dir: &Path,
    msr: u64,
    value: u64,
) -> Result<(), ApplyError> {
    let def = ScriptDefinition {
        name: format!("write msr {msr:#x}"),
        script: format!("wrmsr -a {msr:#x} {value}"),
        vendors: vec![cpu::INTEL_VENDOR.to_string()],
        superuser: true,
        ..ScriptDefinition::default()
    };
    run_setting_script(target, &def, local_temp_dir).await?;
    Ok(())
}

async fn require_intel(
    target: &dyn Target,
    setting: &'static str,
) -> Result<(), ApplyError> {
    let vendor = target.vendor().await?;
    if vendor != cpu::INTEL_VENDOR {
        return Err(ApplyError::Unsupported {
            setting,
            target: target.name().to_string(),
            reason: format!("vendor {vendor}"),
        });
    }
    Ok(())
}

/// Set the number of online cores per socket by off-lining the highest
/// numbered cores first.
///
/// # Errors
///
/// Fails if the requested count exceeds the physical core count or the
/// off-lining script fails.
pub async fn set_core_count(
    cores: u32,
    target: &dyn Target,
    local_temp_dir: &Path,
) -> Result<(), ApplyError> {
    let def = ScriptDefinition {
        name: "set core count".to_string(),
        script: set_core_count_script(cores),
        superuser: true,
        ..ScriptDefinition::default()
    };
    run_setting_script(target, &def, local_temp_dir).await?;
    Ok(())
}

/// Parse the `L3 cache` line out of `lscpu` output into megabytes per
/// instance.
fn parse_l3_lscpu_mb(lscpu: &str) -> Option<f64> {
    let line = lscpu
        .lines()
        .find(|l| l.trim_start().starts_with("L3 cache:") || l.trim_start().starts_with("L3:"))?;
    let rest = line.split(':').nth(1)?.trim();
    let mut fields = rest.split_whitespace();
    let first = fields.next()?;
    // older lscpu: "36608K"; newer: "105 MiB (2 instances)"
    let (value, unit) = if let Some(stripped) = first.strip_suffix(['K', 'M', 'G']) {
        (stripped.parse::<f64>().ok()?, &first[stripped.len()..])
    } else {
        (first.parse::<f64>().ok()?, fields.next()?)
    };
    let mb = match unit {
        "K" | "KiB" => value / 1024.0,
        "M" | "MiB" => value,
        "G" | "GiB" => value * 1024.0,
        _ => return None,
    };
    let instances = Regex::new(r"\((\d+) instances?\)")
        .ok()?
        .captures(rest)
        .and_then(|c| c[1].parse::<f64>().ok())
        .unwrap_or(1.0);
    Some(mb / instances)
}

/// Number of cache ways needed to provide `desired_mb` out of `max_mb`.
fn llc_ways_for_size(desired_mb: f64, max_mb: f64, way_count: u32) -> Result<u32, String> {
    if desired_mb > max_mb {
        return Err(format!("LLC size is too large, maximum is {max_mb:.2} MB"));
    }
    let per_way = max_mb / f64::from(way_count);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let ways = (desired_mb / per_way).ceil() as u32;
    if ways > way_count {
        return Err(format!("LLC size is too large, maximum is {max_mb:.2} MB"));
    }
    Ok(ways)
}

/// Set the usable LLC size by restricting the cache way mask in MSR
/// 0xC90.
///
/// # Errors
///
/// Fails on non-Intel parts, when the cache way geometry is unknown,
/// when the requested size exceeds the cache, and when the cache is
/// already at the requested size.
pub async fn set_llc_size(
    desired_mb: f64,
    target: &dyn Target,
    local_temp_dir: &Path,
) -> Result<(), ApplyError> {
    const SETTING: &str = "llc size";
    require_intel(target, SETTING).await?;
    let family = target.family().await?;
    let model = target.model().await?;
    let stepping = target.stepping().await?;
    let unsupported = |reason: String| ApplyError::Unsupported {
        setting: SETTING,
        target: target.name().to_string(),
        reason,
    };
    let cpu_model = cpu::resolve_cpu(&family, &model, &stepping)
        .ok_or_else(|| unsupported(format!("unrecognized cpu {family}/{model}/{stepping}")))?;
    if cpu_model.cache_way_count == 0 {
        return Err(unsupported("cache way count is unknown".to_string()));
    }

    let lscpu_def = ScriptDefinition {
        name: "lscpu".to_string(),
        script: "lscpu".to_string(),
        ..ScriptDefinition::default()
    };
    let lscpu = run_setting_script(target, &lscpu_def, local_temp_dir).await?;
    let max_mb = parse_l3_lscpu_mb(&lscpu)
        .ok_or_else(|| unsupported("could not determine maximum LLC size".to_string()))?;

    let way_mask = read_msr(target, local_temp_dir, 0xC90).await?;
    let per_way = max_mb / f64::from(cpu_model.cache_way_count);
    let current_mb = f64::from(way_mask.count_ones()) * per_way;
    if (current_mb - desired_mb).abs() < f64::EPSILON {
        return Err(ApplyError::AlreadySet {
            setting: SETTING,
            value: format!("{desired_mb} MB"),
        });
    }

    let ways = llc_ways_for_size(desired_mb, max_mb, cpu_model.cache_way_count)
        .map_err(unsupported)?;
    let new_mask = (1u64 << ways) - 1;
    write_msr_all(target, local_temp_dir, 0xC90, new_mask).await
}

/// Repeat a frequency value (in 100 MHz units) across `buckets` byte
/// lanes of a frequency-bin MSR.
fn frequency_bins(freq_ghz: f64, buckets: u32) -> u64 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let unit = (freq_ghz * 10.0) as u64;
    (0..buckets).fold(0u64, |acc, i| acc | unit << (i * 8))
}

/// Set the maximum all-core frequency.
///
/// Most parts take eight frequency buckets in MSR 0x1AD. SRF and CWF
/// instead program either MSR 0x774 (intel_pstate) or MSR 0x199,
/// depending on the active scaling driver.
///
/// # Errors
///
/// Fails on non-Intel parts or when the underlying writes fail.
pub async fn set_core_max_frequency(
    freq_ghz: f64,
    target: &dyn Target,
    local_temp_dir: &Path,
) -> Result<(), ApplyError> {
    const SETTING: &str = "core frequency";
    require_intel(target, SETTING).await?;
    let family = target.family().await?;
    let model = target.model().await?;

    if cpu::is_hybrid_frequency_model(&family, &model) {
        let driver_def = ScriptDefinition {
            name: "get pstate driver".to_string(),
            script: "cat /sys/devices/system/cpu/cpu0/cpufreq/scaling_driver".to_string(),
            vendors: vec![cpu::INTEL_VENDOR.to_string()],
            ..ScriptDefinition::default()
        };
        let driver = run_setting_script(target, &driver_def, local_temp_dir).await?;
        if driver.contains("intel_pstate") {
            let value = frequency_bins(freq_ghz, 2);
            let def = ScriptDefinition {
                name: "set frequency bins".to_string(),
                script: format!("wrmsr 0x774 {value}"),
                vendors: vec![cpu::INTEL_VENDOR.to_string()],
                superuser: true,
                ..ScriptDefinition::default()
            };
            run_setting_script(target, &def, local_temp_dir).await?;
        } else {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let value = ((freq_ghz * 10.0) as u64) << 16;
            let def = ScriptDefinition {
                name: "set frequency bins".to_string(),
                script: format!("wrmsr 0x199 {value}"),
                vendors: vec![cpu::INTEL_VENDOR.to_string()],
                superuser: true,
                ..ScriptDefinition::default()
            };
            run_setting_script(target, &def, local_temp_dir).await?;
        }
        return Ok(());
    }

    let value = frequency_bins(freq_ghz, 8);
    let def = ScriptDefinition {
        name: "set frequency bins".to_string(),
        script: format!("wrmsr -a 0x1AD {value}"),
        vendors: vec![cpu::INTEL_VENDOR.to_string()],
        superuser: true,
        ..ScriptDefinition::default()
    };
    run_setting_script(target, &def, local_temp_dir).await?;
    Ok(())
}

/// Set the package uncore maximum or minimum frequency through MSR
/// 0x620. The read-modify-write sequence holds a process-wide lock so
/// concurrent setting tasks cannot interleave on the shared register.
///
/// # Errors
///
/// Fails on parts that program uncore frequency per die, and when the
/// register access fails.
pub async fn set_uncore_frequency(
    max: bool,
    freq_ghz: f64,
    target: &dyn Target,
    local_temp_dir: &Path,
) -> Result<(), ApplyError> {
    const SETTING: &str = "uncore frequency";
    let _guard = UNCORE_MSR_LOCK.lock().await;

    require_intel(target, SETTING).await?;
    let family = target.family().await?;
    let model = target.model().await?;
    if family != "6" || cpu::has_per_die_uncore(&family, &model) {
        return Err(ApplyError::Unsupported {
            setting: SETTING,
            target: target.name().to_string(),
            reason: format!("family/model {family}/{model}"),
        });
    }

    let current = read_msr(target, local_temp_dir, 0x620).await?;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let new_freq = ((freq_ghz * 1000.0) / 100.0) as u64;
    let new_val = if max {
        // max lives in the low 6 bits
        (current & 0xFFFF_FFFF_FFFF_FFC0) | new_freq
    } else {
        // min lives in bits 8:14
        (current & 0xFFFF_FFFF_FFFF_80FF) | new_freq << 8
    };
    write_msr_all(target, local_temp_dir, 0x620, new_val).await
}

/// Parse `pcm-tpmi 2 0x10 -d -b 26:26` output into (instance, entry)
/// pairs for dies of the requested type. Bit 26 is 0 for compute dies
/// and 1 for I/O dies.
fn parse_tpmi_dies(output: &str, compute: bool) -> Vec<(String, String)> {
    let re = Regex::new(
        r"Read bits \d+:\d+ value (\d+) from TPMI ID .* for entry (\d+) in instance (\d+)",
    )
    .expect("die enumeration regex is valid");
    let wanted = if compute { "0" } else { "1" };
    output
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line)?;
            if &caps[1] == wanted {
                Some((caps[3].to_string(), caps[2].to_string()))
            } else {
                None
            }
        })
        .collect()
}

/// Set the uncore maximum or minimum frequency for every compute or I/O
/// die through the TPMI uncore block. Die writes hold a process-wide
/// lock so concurrent setting tasks cannot interleave.
///
/// # Errors
///
/// Fails on parts without per-die uncore control, and when enumeration
/// or any die write fails.
pub async fn set_uncore_die_frequency(
    max: bool,
    compute_die: bool,
    freq_ghz: f64,
    target: &dyn Target,
    local_temp_dir: &Path,
) -> Result<(), ApplyError> {
    const SETTING: &str = "uncore die frequency";
    let _guard = UNCORE_TPMI_LOCK.lock().await;

    require_intel(target, SETTING).await?;
    let family = target.family().await?;
    let model = target.model().await?;
    if !cpu::has_per_die_uncore(&family, &model) {
        return Err(ApplyError::Unsupported {
            setting: SETTING,
            target: target.name().to_string(),
            reason: format!("family/model {family}/{model}"),
        });
    }

    let enumerate = ScriptDefinition {
        name: "uncore die types from tpmi".to_string(),
        script: "pcm-tpmi 2 0x10 -d -b 26:26".to_string(),
        vendors: vec![cpu::INTEL_VENDOR.to_string()],
        depends: vec!["pcm-tpmi".to_string()],
        superuser: true,
        ..ScriptDefinition::default()
    };
    let listing = run_setting_script(target, &enumerate, local_temp_dir).await?;
    let dies = parse_tpmi_dies(&listing, compute_die);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let value = (freq_ghz * 10.0) as u64;
    let (bits, freq_type) = if max { ("8:14", "max") } else { ("15:21", "min") };
    for (instance, entry) in dies {
        let def = ScriptDefinition {
            name: format!("write {freq_type} uncore frequency TPMI {instance} {entry}"),
            script: format!(
                "pcm-tpmi 2 0x18 -d -b {bits} -w {value} -i {instance} -e {entry}"
            ),
            vendors: vec![cpu::INTEL_VENDOR.to_string()],
            depends: vec!["pcm-tpmi".to_string()],
            superuser: true,
            sequential: true,
            ..ScriptDefinition::default()
        };
        run_setting_script(target, &def, local_temp_dir).await?;
    }
    Ok(())
}

/// Set the package power limit (TDP) in watts via MSR 0x610.
///
/// # Errors
///
/// Fails on non-Intel parts or when the register access fails.
pub async fn set_tdp(
    watts: u32,
    target: &dyn Target,
    local_temp_dir: &Path,
) -> Result<(), ApplyError> {
    require_intel(target, "tdp").await?;
    let current = read_msr(target, local_temp_dir, 0x610).await?;
    // power limit is the low 14 bits, in 1/8 watt units
    let new_val = (current & 0xFFFF_FFFF_FFFF_C000) | u64::from(watts) * 8;
    write_msr_all(target, local_temp_dir, 0x610, new_val).await
}

/// Set the energy-performance bias (0 to 15).
///
/// Bit 34 of MSR 0x1FC says whether the BIOS or the OS owns the EPB;
/// that decides both the register and the bit offset to write.
///
/// # Errors
///
/// Fails on non-Intel parts or when the register access fails.
pub async fn set_epb(
    epb: u8,
    target: &dyn Target,
    local_temp_dir: &Path,
) -> Result<(), ApplyError> {
    require_intel(target, "epb").await?;
    let source_def = ScriptDefinition {
        name: "energy performance bias source".to_string(),
        script: "rdmsr -f 34:34 0x1FC".to_string(),
        vendors: vec![cpu::INTEL_VENDOR.to_string()],
        superuser: true,
        ..ScriptDefinition::default()
    };
    let stdout = run_setting_script(target, &source_def, local_temp_dir).await?;
    let trimmed = stdout.trim();
    let source = u64::from_str_radix(trimmed, 16).map_err(|source| ApplyError::Parse {
        what: format!("epb source `{trimmed}`"),
        source,
    })?;
    let (msr, offset) = if source == 0 {
        (0x1B0, 0) // OS-controlled
    } else {
        (0xA01, 3) // BIOS-controlled
    };
    let current = read_msr(target, local_temp_dir, msr).await?;
    let new_val = (current & !(0xF << offset)) | u64::from(epb) << offset;
    write_msr_all(target, local_temp_dir, msr, new_val).await
}

/// Set the energy-performance preference (0 to 255) in both the
/// per-core (0x774) and package (0x772) HWP request registers.
///
/// # Errors
///
/// Fails on non-Intel parts or when the register access fails.
pub async fn set_epp(
    epp: u8,
    target: &dyn Target,
    local_temp_dir: &Path,
) -> Result<(), ApplyError> {
    require_intel(target, "epp").await?;
    for msr in [0x774u64, 0x772] {
        let current = read_msr(target, local_temp_dir, msr).await?;
        // EPP is bits 24:31
        let new_val = (current & 0xFFFF_FFFF_00FF_FFFF) | u64::from(epp) << 24;
        write_msr_all(target, local_temp_dir, msr, new_val).await?;
    }
    Ok(())
}

/// Set the cpufreq scaling governor on every CPU.
///
/// # Errors
///
/// Fails when the sysfs write fails.
pub async fn set_governor(
    governor: &str,
    target: &dyn Target,
    local_temp_dir: &Path,
) -> Result<(), ApplyError> {
    let def = ScriptDefinition {
        name: "set governor".to_string(),
        script: format!(
            "echo {governor} | tee /sys/devices/system/cpu/cpu*/cpufreq/scaling_governor"
        ),
        superuser: true,
        ..ScriptDefinition::default()
    };
    run_setting_script(target, &def, local_temp_dir).await?;
    Ok(())
}

/// Set the efficiency-latency control mode on parts that have it.
///
/// # Errors
///
/// Fails for modes other than `latency-optimized` and `default`, on
/// unsupported microarchitectures, and when the helper script fails.
pub async fn set_elc(
    mode: &str,
    target: &dyn Target,
    local_temp_dir: &Path,
) -> Result<(), ApplyError> {
    let flag = match mode {
        "latency-optimized" => "latency-optimized-mode",
        "default" => "default",
        other => {
            return Err(ApplyError::Invalid {
                setting: "elc",
                reason: format!("unknown mode {other}"),
            });
        }
    };
    let def = ScriptDefinition {
        name: "set elc".to_string(),
        script: format!("bhs-power-mode.sh --{flag}"),
        vendors: vec![cpu::INTEL_VENDOR.to_string()],
        microarchitectures: ["GNR", "GNR_D", "SRF", "CWF"]
            .map(String::from)
            .to_vec(),
        depends: vec!["bhs-power-mode.sh".to_string(), "pcm-tpmi".to_string()],
        superuser: true,
        ..ScriptDefinition::default()
    };
    run_setting_script(target, &def, local_temp_dir).await?;
    Ok(())
}

/// Enable or disable a hardware prefetcher by name.
///
/// The prefetcher's control bit is 0 when enabled. Prefetchers that only
/// exist on certain microarchitectures are gated on the target identity.
///
/// # Errors
///
/// Fails for unknown prefetcher names, unsupported microarchitectures,
/// and register access failures.
pub async fn set_prefetcher(
    toggle: Toggle,
    prefetcher: &str,
    target: &dyn Target,
    local_temp_dir: &Path,
) -> Result<(), ApplyError> {
    const SETTING: &str = "prefetcher";
    let def = cpu::prefetcher_by_name(prefetcher).ok_or_else(|| ApplyError::Invalid {
        setting: SETTING,
        reason: format!("unknown prefetcher {prefetcher}"),
    })?;
    require_intel(target, SETTING).await?;
    if !def.uarchs.is_empty() {
        let family = target.family().await?;
        let model = target.model().await?;
        let stepping = target.stepping().await?;
        let uarch = cpu::resolve_cpu(&family, &model, &stepping)
            .map(|c| c.microarchitecture)
            .unwrap_or("");
        if !def.uarchs.iter().any(|u| uarch.starts_with(u)) {
            return Err(ApplyError::Unsupported {
                setting: SETTING,
                target: target.name().to_string(),
                reason: format!(
                    "prefetcher {prefetcher} does not exist on {}",
                    if uarch.is_empty() { "unknown" } else { uarch }
                ),
            });
        }
    }

    let current = read_msr(target, local_temp_dir, def.msr).await?;
    let bit_val = match toggle {
        Toggle::Enable => 0u64,
        Toggle::Disable => 1,
    };
    let new_val = (current & !(1 << def.bit)) | bit_val << def.bit;
    write_msr_all(target, local_temp_dir, def.msr, new_val).await
}

/// Enable or disable the C6 idle states through cpuidle sysfs.
///
/// # Errors
///
/// Fails when no C6 state exists or the sysfs writes fail.
pub async fn set_c6(
    toggle: Toggle,
    target: &dyn Target,
    local_temp_dir: &Path,
) -> Result<(), ApplyError> {
    let find_def = ScriptDefinition {
        name: "get C6 state folder names".to_string(),
        script: r#"cstate_dir="/sys/devices/system/cpu/cpu0/cpuidle"
if [ -d "$cstate_dir" ]; then
    for state in "$cstate_dir"/state*; do
        name=$(cat "$state/name")
        if [[ $name == *"C6"* ]]; then
            basename "$state"
        fi
    done
fi
"#
        .to_string(),
        superuser: true,
        ..ScriptDefinition::default()
    };
    let stdout = run_setting_script(target, &find_def, local_temp_dir).await?;
    let folders: Vec<&str> = stdout.split_whitespace().collect();
    if folders.is_empty() {
        return Err(ApplyError::Unsupported {
            setting: "c6",
            target: target.name().to_string(),
            reason: "no C6 idle states found".to_string(),
        });
    }
    // the cpuidle knob is "disable": 0 enables the state
    let disable_val = match toggle {
        Toggle::Enable => 0,
        Toggle::Disable => 1,
    };
    let mut body = String::from("for cpu in /sys/devices/system/cpu/cpu[0-9]*; do\n");
    for folder in folders {
        body.push_str(&format!(
            "  echo {disable_val} > $cpu/cpuidle/{folder}/disable\n"
        ));
    }
    body.push_str("done\n");
    let def = ScriptDefinition {
        name: "configure c6".to_string(),
        script: body,
        superuser: true,
        ..ScriptDefinition::default()
    };
    run_setting_script(target, &def, local_temp_dir).await?;
    Ok(())
}

/// Enable or disable C1 demotion (bits 26 and 28 of MSR 0xE2).
///
/// # Errors
///
/// Fails on non-Intel parts or when the register access fails.
pub async fn set_c1_demotion(
    toggle: Toggle,
    target: &dyn Target,
    local_temp_dir: &Path,
) -> Result<(), ApplyError> {
    require_intel(target, "c1 demotion").await?;
    let current = read_msr(target, local_temp_dir, 0xE2).await?;
    let bit_val: u64 = match toggle {
        Toggle::Enable => 1,
        Toggle::Disable => 0,
    };
    let masked = current & !(1 << 26) & !(1 << 28);
    let new_val = masked | bit_val << 26 | bit_val << 28;
    write_msr_all(target, local_temp_dir, 0xE2, new_val).await
}
