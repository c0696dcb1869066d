//! Result correlation.
//!
//! Reconstructs per-setting verdicts from the free-form aggregated
//! status lines the orchestrator publishes. Classification is literal
//! substring containment: a setting failed if the status contains
//! `failed to set <name> to <value>`, succeeded if it contains
//! `set <name> to <value>`, and is unknown otherwise. The failure
//! fragment textually contains the success fragment, so it must be
//! checked first.

/// One setting to look for in the status output, with the exact value
/// rendering that was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValue {
    /// Name as shown to the user in the verdict listing.
    pub field_name: String,
    /// Flag-style name used in status line fragments.
    pub setting_name: String,
    pub value: String,
}

impl FieldValue {
    #[must_use]
    pub fn new(
        field_name: impl Into<String>,
        setting_name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            setting_name: setting_name.into(),
            value: value.into(),
        }
    }
}

/// Verdict for one setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingStatus {
    Succeeded,
    Failed,
    Unknown,
}

/// A setting paired with its verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub field: FieldValue,
    pub status: SettingStatus,
}

/// Classify a single setting against the status output.
#[must_use]
pub fn classify(status: &str, setting_name: &str, value: &str) -> SettingStatus {
    // order matters: the failure fragment contains the success fragment
    if status.contains(&format!("failed to set {setting_name} to {value}")) {
        SettingStatus::Failed
    } else if status.contains(&format!("set {setting_name} to {value}")) {
        SettingStatus::Succeeded
    } else {
        SettingStatus::Unknown
    }
}

/// Classify every field against the status output, preserving the field
/// order. An empty status yields all-unknown verdicts.
#[must_use]
pub fn correlate(status: &str, fields: &[FieldValue]) -> Vec<Correlation> {
    fields
        .iter()
        .map(|field| Correlation {
            field: field.clone(),
            status: classify(status, &field.setting_name, &field.value),
        })
        .collect()
}

/// Render the verdict listing shown after a restore. Returns an empty
/// string when there was no status output to correlate against.
#[must_use]
pub fn present_results(status: &str, fields: &[FieldValue]) -> String {
    if status.is_empty() || fields.is_empty() {
        return String::new();
    }
    let mut out = String::from("\nConfiguration Results:\n");
    for correlation in correlate(status, fields) {
        let field = &correlation.field;
        let line = match correlation.status {
            SettingStatus::Succeeded => {
                format!("  ✓ Set {} to {}\n", field.setting_name, field.value)
            }
            SettingStatus::Failed => {
                format!("  ✗ Failed to set {} to {}\n", field.setting_name, field.value)
            }
            SettingStatus::Unknown => {
                format!("  ? {}: status unknown\n", field.setting_name)
            }
        };
        out.push_str(&line);
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str =
        "gnr ⣽ configuration update complete: set cores to 86, failed to set llc to 336, set tdp to 350";

    fn fields() -> Vec<FieldValue> {
        vec![
            FieldValue::new("Cores per Socket", "cores", "86"),
            FieldValue::new("LLC Size", "llc", "336"),
            FieldValue::new("TDP", "tdp", "350"),
        ]
    }

    #[test]
    fn classifies_mixed_results() {
        let correlations = correlate(STATUS, &fields());
        assert_eq!(correlations[0].status, SettingStatus::Succeeded);
        assert_eq!(correlations[1].status, SettingStatus::Failed);
        assert_eq!(correlations[2].status, SettingStatus::Succeeded);
    }

    #[test]
    fn fragment_order_in_status_is_irrelevant() {
        let reordered =
            "configuration update complete: set tdp to 350, failed to set llc to 336, set cores to 86";
        assert_eq!(correlate(STATUS, &fields()), correlate(reordered, &fields()));
    }

    #[test]
    fn failure_fragment_wins_over_contained_success_fragment() {
        let status = "configuration update complete: failed to set llc to 336";
        assert_eq!(classify(status, "llc", "336"), SettingStatus::Failed);
    }

    #[test]
    fn empty_status_is_all_unknown_and_prints_nothing() {
        for correlation in correlate("", &fields()) {
            assert_eq!(correlation.status, SettingStatus::Unknown);
        }
        assert_eq!(present_results("", &fields()), "");
    }

    #[test]
    fn unrelated_status_is_all_unknown() {
        let correlations = correlate("configuration update complete: set gov to powersave", &fields());
        assert!(correlations
            .iter()
            .all(|c| c.status == SettingStatus::Unknown));
    }

    #[test]
    fn hyphenated_names_match_verbatim() {
        let status = "configuration update complete: set c1-demotion to disable";
        assert_eq!(classify(status, "c1-demotion", "disable"), SettingStatus::Succeeded);
        assert_eq!(classify(status, "c1", "disable"), SettingStatus::Unknown);
    }

    #[test]
    fn value_mismatch_is_unknown() {
        assert_eq!(classify(STATUS, "cores", "64"), SettingStatus::Unknown);
    }

    #[test]
    fn presentation_tags_each_verdict() {
        let rendered = present_results(STATUS, &fields());
        assert!(rendered.contains("✓ Set cores to 86"));
        assert!(rendered.contains("✗ Failed to set llc to 336"));
        let with_unknown = present_results(
            STATUS,
            &[FieldValue::new("Governor", "gov", "powersave")],
        );
        assert!(with_unknown.contains("? gov: status unknown"));
    }

    #[test]
    fn multi_target_output_correlates_per_line() {
        let status = "\
t1: configuration update complete: set cores to 86, set llc to 336
t2: configuration update complete: failed to set llc to 336";
        // a combined transcript still classifies; failure anywhere wins
        assert_eq!(classify(status, "llc", "336"), SettingStatus::Failed);
        assert_eq!(classify(status, "cores", "86"), SettingStatus::Succeeded);
    }
}
