//! Mapping from command-line flags to setting changes.
//!
//! Each builder bakes the requested value into an apply closure and
//! names the change after its flag, so the orchestrator's status lines
//! read `set cores to 86` for `--cores 86`. The restore path goes
//! through [`change_from_flag`], which parses the recorded string value
//! with the same rules the flag parsers use.

use anyhow::{Context, Result, bail};
use fleettune_core::orchestrator::SettingChange;
use fleettune_core::settings::{self, Toggle};

pub fn cores(count: u32) -> SettingChange {
    SettingChange::new("cores", count.to_string(), move |target, dir| async move {
        settings::set_core_count(count, target.as_ref(), &dir).await
    })
}

pub fn llc(size_mb: f64) -> SettingChange {
    SettingChange::new("llc", size_mb.to_string(), move |target, dir| async move {
        settings::set_llc_size(size_mb, target.as_ref(), &dir).await
    })
}

pub fn core_max(freq_ghz: f64) -> SettingChange {
    SettingChange::new("core-max", freq_ghz.to_string(), move |target, dir| async move {
        settings::set_core_max_frequency(freq_ghz, target.as_ref(), &dir).await
    })
}

pub fn tdp(watts: u32) -> SettingChange {
    SettingChange::new("tdp", watts.to_string(), move |target, dir| async move {
        settings::set_tdp(watts, target.as_ref(), &dir).await
    })
}

pub fn epb(value: u8) -> SettingChange {
    SettingChange::new("epb", value.to_string(), move |target, dir| async move {
        settings::set_epb(value, target.as_ref(), &dir).await
    })
}

pub fn epp(value: u8) -> SettingChange {
    SettingChange::new("epp", value.to_string(), move |target, dir| async move {
        settings::set_epp(value, target.as_ref(), &dir).await
    })
}

pub fn governor(governor: String) -> SettingChange {
    SettingChange::new("gov", governor.clone(), move |target, dir| {
        let governor = governor.clone();
        async move { settings::set_governor(&governor, target.as_ref(), &dir).await }
    })
}

pub fn elc(mode: String) -> SettingChange {
    SettingChange::new("elc", mode.clone(), move |target, dir| {
        let mode = mode.clone();
        async move { settings::set_elc(&mode, target.as_ref(), &dir).await }
    })
}

/// Package-wide uncore limit via the uncore frequency MSR.
pub fn uncore(flag: &'static str, max: bool, freq_ghz: f64) -> SettingChange {
    SettingChange::new(flag, freq_ghz.to_string(), move |target, dir| async move {
        settings::set_uncore_frequency(max, freq_ghz, target.as_ref(), &dir).await
    })
}

/// Per-die uncore limit via TPMI, for parts with compute and IO dies.
pub fn uncore_die(
    flag: &'static str,
    max: bool,
    compute_die: bool,
    freq_ghz: f64,
) -> SettingChange {
    SettingChange::new(flag, freq_ghz.to_string(), move |target, dir| async move {
        settings::set_uncore_die_frequency(max, compute_die, freq_ghz, target.as_ref(), &dir).await
    })
}

pub fn prefetcher(flag: &'static str, name: &'static str, toggle: Toggle) -> SettingChange {
    SettingChange::new(flag, toggle.to_string(), move |target, dir| async move {
        settings::set_prefetcher(toggle, name, target.as_ref(), &dir).await
    })
}

pub fn c6(toggle: Toggle) -> SettingChange {
    SettingChange::new("c6", toggle.to_string(), move |target, dir| async move {
        settings::set_c6(toggle, target.as_ref(), &dir).await
    })
}

pub fn c1_demotion(toggle: Toggle) -> SettingChange {
    SettingChange::new("c1-demotion", toggle.to_string(), move |target, dir| async move {
        settings::set_c1_demotion(toggle, target.as_ref(), &dir).await
    })
}

/// Prefetcher flag names paired with the control names they toggle.
pub const PREFETCHER_FLAGS: &[(&str, &str)] = &[
    ("pref-l2hw", "l2hw"),
    ("pref-l2adj", "l2adj"),
    ("pref-dcuhw", "dcuhw"),
    ("pref-dcuip", "dcuip"),
    ("pref-dcunp", "dcunp"),
    ("pref-amp", "amp"),
    ("pref-llcpp", "llcpp"),
    ("pref-aop", "aop"),
    ("pref-homeless", "homeless"),
    ("pref-llc", "llc"),
];

fn parse_toggle(flag: &str, value: &str) -> Result<Toggle> {
    value
        .parse()
        .map_err(|err: String| anyhow::anyhow!("--{flag}: {err}"))
}

/// Build the change for a recorded flag name and string value, using the
/// same parsing and validation as the corresponding command-line flag.
pub fn change_from_flag(flag: &str, value: &str) -> Result<SettingChange> {
    let parse_u32 =
        |v: &str| -> Result<u32> { v.parse().with_context(|| format!("--{flag}: bad count {v}")) };
    let parse_f64 = |v: &str| -> Result<f64> {
        v.parse().with_context(|| format!("--{flag}: bad number {v}"))
    };
    Ok(match flag {
        "cores" => cores(parse_u32(value)?),
        "llc" => llc(parse_f64(value)?),
        "core-max" => core_max(parse_f64(value)?),
        "tdp" => tdp(parse_u32(value)?),
        "epb" => {
            let v: u8 = value.parse().with_context(|| format!("--epb: bad value {value}"))?;
            if v > 15 {
                bail!("--epb: value {v} out of range 0-15");
            }
            epb(v)
        }
        "epp" => epp(value.parse().with_context(|| format!("--epp: bad value {value}"))?),
        "gov" => match value {
            "performance" | "powersave" => governor(value.to_string()),
            other => bail!("--gov: expected performance or powersave, got {other}"),
        },
        "elc" => match value {
            "latency-optimized" | "default" => elc(value.to_string()),
            other => bail!("--elc: expected latency-optimized or default, got {other}"),
        },
        "uncore-max" => uncore("uncore-max", true, parse_f64(value)?),
        "uncore-min" => uncore("uncore-min", false, parse_f64(value)?),
        "uncore-max-compute" => uncore_die("uncore-max-compute", true, true, parse_f64(value)?),
        "uncore-min-compute" => uncore_die("uncore-min-compute", false, true, parse_f64(value)?),
        "uncore-max-io" => uncore_die("uncore-max-io", true, false, parse_f64(value)?),
        "uncore-min-io" => uncore_die("uncore-min-io", false, false, parse_f64(value)?),
        "c6" => c6(parse_toggle(flag, value)?),
        "c1-demotion" => c1_demotion(parse_toggle(flag, value)?),
        other => {
            if let Some((flag_name, pref_name)) =
                PREFETCHER_FLAGS.iter().copied().find(|(f, _)| *f == other)
            {
                prefetcher(flag_name, pref_name, parse_toggle(other, value)?)
            } else {
                bail!("unsupported flag --{other}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_named_changes() {
        for (flag, value) in [
            ("cores", "86"),
            ("llc", "336"),
            ("core-max", "3.2"),
            ("tdp", "350"),
            ("epb", "8"),
            ("epp", "128"),
            ("gov", "performance"),
            ("elc", "default"),
            ("uncore-max", "2.5"),
            ("uncore-min-io", "1.2"),
            ("pref-l2hw", "disable"),
            ("c6", "enable"),
            ("c1-demotion", "disable"),
        ] {
            let change = change_from_flag(flag, value).unwrap();
            assert_eq!(change.name, flag);
            assert_eq!(change.value, value);
        }
    }

    #[test]
    fn out_of_range_and_unknown_flags_are_rejected() {
        assert!(change_from_flag("epb", "16").is_err());
        assert!(change_from_flag("gov", "ondemand").is_err());
        assert!(change_from_flag("elc", "turbo").is_err());
        assert!(change_from_flag("c6", "on").is_err());
        assert!(change_from_flag("turbo", "enable").is_err());
    }

    #[test]
    fn float_values_render_without_trailing_zeroes() {
        assert_eq!(llc(336.0).value, "336");
        assert_eq!(core_max(3.2).value, "3.2");
    }
}
