//! CPU identification.
//!
//! Maps the family/model/stepping triple reported by a target onto a
//! microarchitecture name, and carries the per-microarchitecture data the
//! setting writers need (cache way counts, prefetcher control bits).
//! Model and stepping entries are regular expressions; an empty stepping
//! means any stepping.

use regex::Regex;

/// Vendor string reported by `lscpu` on Intel parts.
pub const INTEL_VENDOR: &str = "GenuineIntel";

/// One row of the CPU identification table.
#[derive(Debug, Clone, Copy)]
pub struct CpuModel {
    pub microarchitecture: &'static str,
    pub family: &'static str,
    model: &'static str,
    stepping: &'static str,
    /// Number of LLC cache ways, zero when unknown.
    pub cache_way_count: u32,
}

// Server parts only; client parts never pass the vendor/uarch gates on
// the setting writers.
static CPU_MODELS: &[CpuModel] = &[
    CpuModel { microarchitecture: "HSX", family: "6", model: "63", stepping: "", cache_way_count: 20 },
    CpuModel { microarchitecture: "BDX", family: "6", model: "(79|86)", stepping: "", cache_way_count: 20 },
    CpuModel { microarchitecture: "SKX", family: "6", model: "85", stepping: "(0|1|2|3|4)", cache_way_count: 11 },
    CpuModel { microarchitecture: "CLX", family: "6", model: "85", stepping: "(5|6|7)", cache_way_count: 11 },
    CpuModel { microarchitecture: "CPX", family: "6", model: "85", stepping: "11", cache_way_count: 11 },
    CpuModel { microarchitecture: "ICX", family: "6", model: "(106|108)", stepping: "", cache_way_count: 12 },
    CpuModel { microarchitecture: "SPR", family: "6", model: "143", stepping: "", cache_way_count: 15 },
    CpuModel { microarchitecture: "EMR", family: "6", model: "207", stepping: "", cache_way_count: 20 },
    CpuModel { microarchitecture: "SRF", family: "6", model: "175", stepping: "", cache_way_count: 12 },
    CpuModel { microarchitecture: "GNR", family: "6", model: "173", stepping: "", cache_way_count: 16 },
    CpuModel { microarchitecture: "GNR_D", family: "6", model: "174", stepping: "", cache_way_count: 16 },
    CpuModel { microarchitecture: "CWF", family: "6", model: "221", stepping: "", cache_way_count: 0 },
];

fn matches_anchored(pattern: &str, value: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    Regex::new(&format!("^{pattern}$"))
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

/// Look up the CPU model for a family/model/stepping triple. The first
/// matching table row wins.
#[must_use]
pub fn resolve_cpu(family: &str, model: &str, stepping: &str) -> Option<&'static CpuModel> {
    CPU_MODELS.iter().find(|cpu| {
        cpu.family == family
            && matches_anchored(cpu.model, model)
            && matches_anchored(cpu.stepping, stepping)
    })
}

/// SRF and CWF program per-core frequency limits differently from the
/// rest of the line.
#[must_use]
pub fn is_hybrid_frequency_model(family: &str, model: &str) -> bool {
    family == "6" && (model == "175" || model == "221")
}

/// Models whose uncore frequency is programmed per die through TPMI
/// rather than through MSR 0x620.
#[must_use]
pub fn has_per_die_uncore(family: &str, model: &str) -> bool {
    family == "6" && ["173", "174", "175", "221"].contains(&model)
}

pub const MSR_PREFETCH_CONTROL: u64 = 0x1A4;
pub const MSR_PREFETCHERS: u64 = 0x6D;

/// A hardware prefetcher and the MSR bit that disables it. Prefetchers
/// are enabled when the bit is 0.
#[derive(Debug, Clone, Copy)]
pub struct PrefetcherDef {
    /// Flag-style identifier, e.g. `l2hw`.
    pub name: &'static str,
    pub msr: u64,
    pub bit: u32,
    /// Microarchitectures that have this prefetcher; empty means all.
    pub uarchs: &'static [&'static str],
}

pub static PREFETCHERS: &[PrefetcherDef] = &[
    PrefetcherDef { name: "l2hw", msr: MSR_PREFETCH_CONTROL, bit: 0, uarchs: &[] },
    PrefetcherDef { name: "l2adj", msr: MSR_PREFETCH_CONTROL, bit: 1, uarchs: &[] },
    PrefetcherDef { name: "dcuhw", msr: MSR_PREFETCH_CONTROL, bit: 2, uarchs: &[] },
    PrefetcherDef { name: "dcuip", msr: MSR_PREFETCH_CONTROL, bit: 3, uarchs: &[] },
    PrefetcherDef { name: "dcunp", msr: MSR_PREFETCH_CONTROL, bit: 4, uarchs: &[] },
    PrefetcherDef { name: "amp", msr: MSR_PREFETCH_CONTROL, bit: 5, uarchs: &["SPR", "EMR", "GNR"] },
    PrefetcherDef { name: "llcpp", msr: MSR_PREFETCH_CONTROL, bit: 6, uarchs: &["GNR"] },
    PrefetcherDef { name: "aop", msr: MSR_PREFETCH_CONTROL, bit: 7, uarchs: &["GNR"] },
    PrefetcherDef { name: "homeless", msr: MSR_PREFETCHERS, bit: 14, uarchs: &["SPR", "EMR", "GNR"] },
    PrefetcherDef { name: "llc", msr: MSR_PREFETCHERS, bit: 42, uarchs: &["SPR", "EMR", "GNR"] },
];

/// Find a prefetcher definition by its flag-style name.
#[must_use]
pub fn prefetcher_by_name(name: &str) -> Option<&'static PrefetcherDef> {
    PREFETCHERS.iter().find(|p| p.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stepping_splits_skylake_from_cascadelake() {
        assert_eq!(resolve_cpu("6", "85", "4").unwrap().microarchitecture, "SKX");
        assert_eq!(resolve_cpu("6", "85", "7").unwrap().microarchitecture, "CLX");
        assert_eq!(resolve_cpu("6", "85", "11").unwrap().microarchitecture, "CPX");
    }

    #[test]
    fn model_alternation_matches() {
        assert_eq!(resolve_cpu("6", "106", "6").unwrap().microarchitecture, "ICX");
        assert_eq!(resolve_cpu("6", "108", "0").unwrap().microarchitecture, "ICX");
    }

    #[test]
    fn unknown_cpu_resolves_to_none() {
        assert!(resolve_cpu("25", "17", "1").is_none());
    }

    #[test]
    fn hybrid_frequency_models() {
        assert!(is_hybrid_frequency_model("6", "175"));
        assert!(is_hybrid_frequency_model("6", "221"));
        assert!(!is_hybrid_frequency_model("6", "143"));
        assert!(!is_hybrid_frequency_model("7", "175"));
    }

    #[test]
    fn per_die_uncore_models() {
        assert!(has_per_die_uncore("6", "173"));
        assert!(!has_per_die_uncore("6", "143"));
    }

    #[test]
    fn prefetcher_lookup() {
        let llc = prefetcher_by_name("llc").unwrap();
        assert_eq!(llc.msr, MSR_PREFETCHERS);
        assert_eq!(llc.bit, 42);
        assert!(prefetcher_by_name("bogus").is_none());
    }
}
