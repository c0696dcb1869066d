//! The `config restore` command.
//!
//! Re-applies settings captured in a previously recorded configuration
//! report. Report lines carry a flag hint, e.g.
//!
//! ```text
//! Cores per Socket:          86             --cores <count>
//! LLC Size:                  336M           --llc <size>
//! ```
//!
//! Recorded display values are converted back to flag values (units
//! stripped, parenthesized numbers extracted, Enabled/Disabled
//! normalized), the changes run through the orchestrator, and the
//! aggregated status line of each target is correlated back against the
//! restored flag list for the ✓/✗/? verdict listing.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use fleettune_core::correlate::{self, FieldValue};
use fleettune_core::orchestrator::{self, SettingChange};
use fleettune_core::progress::MemorySink;
use regex::Regex;
use tracing::warn;

use super::config::{Staging, cleanup_targets, prepare_targets};
use crate::{changes, targets};

#[derive(clap::Args, Debug)]
pub struct RestoreArgs {
    /// Previously recorded configuration report
    file: PathBuf,

    /// Apply without asking for confirmation
    #[arg(long)]
    yes: bool,

    #[command(flatten)]
    target_args: targets::TargetArgs,
}

/// One report line: a display name, a recorded value, and the flag that
/// set it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RecordedField {
    field_name: String,
    display_value: String,
    flag: String,
}

fn parse_report(content: &str) -> Vec<RecordedField> {
    // "Field Name:   value   --flag <hint>"
    let line_re = Regex::new(r"^\s*(.+?):\s+(.+?)\s+--(\S+)\s+<.+>$")
        .expect("report line regex is valid");
    content
        .lines()
        .filter_map(|line| {
            let caps = line_re.captures(line)?;
            Some(RecordedField {
                field_name: caps[1].to_string(),
                display_value: caps[2].to_string(),
                flag: caps[3].to_string(),
            })
        })
        .collect()
}

/// Convert a recorded display value to the flag value that produces it.
/// `None` means the value cannot be restored.
fn convert_value(field: &RecordedField) -> Option<String> {
    let value = field.display_value.trim();
    if value == "inconsistent" {
        warn!(field = %field.field_name, "recorded value is inconsistent, skipping");
        return None;
    }
    let with_unit = Regex::new(r"^(\d+(?:\.\d+)?)\s*(?:MB?|W|GHz)$")
        .expect("unit regex is valid");
    if let Some(caps) = with_unit.captures(value) {
        return Some(caps[1].to_string());
    }
    let parenthesized = Regex::new(r"\((\d+)\)")
        .expect("parenthesized regex is valid");
    if let Some(caps) = parenthesized.captures(value) {
        return Some(caps[1].to_string());
    }
    match value {
        "Enabled" => Some("enable".to_string()),
        "Disabled" => Some("disable".to_string()),
        _ => Some(value.to_string()),
    }
}

/// Convert the parsed report into the flag list to restore and the
/// changes that apply it. Unsupported flags and unrestorable values are
/// reported and skipped.
fn plan_changes(fields: &[RecordedField]) -> (Vec<FieldValue>, Vec<SettingChange>) {
    let mut restored = Vec::new();
    let mut planned = Vec::new();
    for field in fields {
        let Some(value) = convert_value(field) else {
            continue;
        };
        match changes::change_from_flag(&field.flag, &value) {
            Ok(change) => {
                restored.push(FieldValue::new(&field.field_name, &field.flag, &value));
                planned.push(change);
            }
            Err(err) => warn!(flag = %field.flag, %err, "cannot restore, skipping"),
        }
    }
    (restored, planned)
}

fn confirm(planned: &[SettingChange]) -> Result<bool> {
    println!("The following settings will be applied:");
    for change in planned {
        println!("  --{} {}", change.name, change.value);
    }
    print!("Continue? [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    let answer = answer.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}

pub async fn run(args: RestoreArgs, temp_dir: Option<PathBuf>, debug: bool) -> Result<()> {
    let content = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let fields = parse_report(&content);
    if fields.is_empty() {
        bail!("{} contains no restorable settings", args.file.display());
    }
    let (restored, planned) = plan_changes(&fields);
    if planned.is_empty() {
        bail!("none of the recorded settings can be restored");
    }
    if !args.yes && !confirm(&planned)? {
        println!("Aborted.");
        return Ok(());
    }

    let resolved = targets::resolve(&args.target_args).await?;
    let ready = prepare_targets(resolved).await?;
    let staging = Staging::create(temp_dir)?;

    let results = orchestrator::update_targets(
        ready.clone(),
        planned,
        staging.path(),
        Arc::new(MemorySink::new()),
    )
    .await;

    cleanup_targets(&ready, debug).await;
    staging.finish(debug);

    let many = results.len() > 1;
    for result in &results {
        if many {
            println!("\n{}:", result.target_name);
        }
        print!(
            "{}",
            correlate::present_results(&result.status_line, &restored)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "\
Cores per Socket:          86              --cores <count>
LLC Size:                  336M            --llc <size>
Maximum Core Frequency:    3.2GHz          --core-max <freq>
TDP:                       350W            --tdp <watts>
Energy Performance Bias:   Performance (0) --epb <value>
C6:                        Enabled         --c6 <enable|disable>
Governor:                  inconsistent    --gov <governor>
Turbo Ratio:               5x              --turbo-ratio <ratio>

some prose that matches nothing
";

    fn field(name: &str, value: &str, flag: &str) -> RecordedField {
        RecordedField {
            field_name: name.to_string(),
            display_value: value.to_string(),
            flag: flag.to_string(),
        }
    }

    #[test]
    fn report_lines_parse() {
        let fields = parse_report(REPORT);
        assert_eq!(fields.len(), 8);
        assert_eq!(fields[0], field("Cores per Socket", "86", "cores"));
        assert_eq!(fields[1], field("LLC Size", "336M", "llc"));
        assert_eq!(fields[4].display_value, "Performance (0)");
    }

    #[test]
    fn recorded_values_convert_to_flag_values() {
        let cases = [
            ("336M", Some("336")),
            ("36MB", Some("36")),
            ("350W", Some("350")),
            ("3.2GHz", Some("3.2")),
            ("Performance (0)", Some("0")),
            ("Enabled", Some("enable")),
            ("Disabled", Some("disable")),
            ("performance", Some("performance")),
            ("inconsistent", None),
        ];
        for (display, expected) in cases {
            let converted = convert_value(&field("f", display, "x"));
            assert_eq!(converted.as_deref(), expected, "display value {display}");
        }
    }

    #[test]
    fn plan_skips_inconsistent_and_unsupported() {
        let (restored, planned) = plan_changes(&parse_report(REPORT));
        let flags: Vec<&str> = restored.iter().map(|f| f.setting_name.as_str()).collect();
        // gov was inconsistent, turbo-ratio is not a supported flag
        assert_eq!(flags, ["cores", "llc", "core-max", "tdp", "epb", "c6"]);
        assert_eq!(planned.len(), restored.len());
        assert_eq!(restored[1].value, "336");
        assert_eq!(restored[4].value, "0");
        assert_eq!(restored[5].value, "enable");
    }

    #[test]
    fn verdicts_follow_report_order() {
        let (restored, _) = plan_changes(&parse_report(REPORT));
        let status =
            "configuration update complete: set cores to 86, failed to set llc to 336, set tdp to 350";
        let rendered = correlate::present_results(status, &restored);
        let ticks: Vec<usize> = ["✓ Set cores to 86", "✗ Failed to set llc to 336"]
            .iter()
            .map(|needle| rendered.find(needle).unwrap())
            .collect();
        assert!(ticks[0] < ticks[1]);
        assert!(rendered.contains("? epb: status unknown"));
    }
}
