use crate::shared::rules::Severity;
use crate::shared::scoring::{Label, Verdict};
use colored::Colorize;
use std::io::Write;

/// Print a verdict as colored terminal text to stderr.
pub fn print_text(verdict: &Verdict, verbose: bool) {
    write_text(&mut std::io::stderr(), verdict, verbose);
}

/// Write a verdict as colored terminal text to an arbitrary writer.
pub fn write_text(w: &mut dyn Write, verdict: &Verdict, verbose: bool) {
    let label_colored = colored_label(verdict.label);

    let version = verdict
        .version
        .as_deref()
        .map(|v| format!("@{v}"))
        .unwrap_or_default();
    let _ = writeln!(
        w,
        "{} {}{} [{}] (risk: {}/100)",
        "pkgsentry:".bold(),
        verdict.package_name.bold(),
        version,
        verdict.ecosystem,
        verdict.risk_score
    );
    let _ = writeln!(w, "  Verdict: {label_colored}");

    match verdict.ml_label {
        Some(ml) => {
            let _ = writeln!(
                w,
                "  Model: {} (p = {:.4}, confidence {:.2})  Rules: {}",
                colored_label(ml),
                verdict.malicious_probability,
                verdict.confidence,
                colored_label(verdict.rule_label)
            );
        }
        None => {
            let _ = writeln!(w, "  Rules: {}", colored_label(verdict.rule_label));
        }
    }

    for warning in &verdict.warnings {
        let _ = writeln!(w, "  {} {warning}", "!!".yellow().bold());
    }

    if !verdict.rule_matches.is_empty() {
        let _ = writeln!(w, "  Rules matched:");
        for rule in &verdict.rule_matches {
            let prefix = match rule.severity {
                Severity::Critical => "!!".red().bold().to_string(),
                Severity::High => "!!".red().to_string(),
                Severity::Medium => " !".yellow().to_string(),
                Severity::Low => "  ".to_string(),
            };
            let _ = writeln!(
                w,
                "    {prefix} [{:>3}] {}: {}",
                rule.points, rule.id, rule.description
            );
        }
    }

    if !verdict.reasons.is_empty() {
        let _ = writeln!(w, "  Reasons:");
        for reason in &verdict.reasons {
            let _ = writeln!(w, "    - {reason}");
        }
    }

    if verbose && !verdict.suggested_actions.is_empty() {
        let _ = writeln!(w, "  Suggested actions:");
        for action in &verdict.suggested_actions {
            let _ = writeln!(w, "    {} {}", ">".dimmed(), action.dimmed());
        }
    }
}

fn colored_label(label: Label) -> colored::ColoredString {
    match label {
        Label::Safe => label.to_string().green(),
        Label::Suspicious => label.to_string().yellow(),
        Label::Malicious => label.to_string().red().bold(),
    }
}

/// Print verdicts as pretty JSON on stdout: one object, or an array for batches.
pub fn print_json(verdicts: &[Verdict]) -> serde_json::Result<()> {
    let json = match verdicts {
        [single] => serde_json::to_string_pretty(single)?,
        many => serde_json::to_string_pretty(many)?,
    };
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::{Ecosystem, PackageRecord};
    use crate::shared::rules::RuleMatch;
    use crate::shared::scoring::{MlOutcome, Thresholds, compute_verdict};

    fn render(verdict: &Verdict, verbose: bool) -> String {
        colored::control::set_override(false);
        let mut buf = Vec::new();
        write_text(&mut buf, verdict, verbose);
        String::from_utf8(buf).unwrap()
    }

    fn verdict(outcome: MlOutcome) -> Verdict {
        let record = PackageRecord::new("evil-pkg", Ecosystem::Npm).with_version("0.0.1");
        let rules = vec![RuleMatch {
            id: "BACKDOOR_PATTERN",
            points: 40,
            severity: Severity::Critical,
            description: "Backdoor, reverse shell or C2 behavior",
        }];
        compute_verdict(
            &record,
            outcome,
            rules,
            vec!["Contains backdoor code".into()],
            &Thresholds::default(),
        )
    }

    #[test]
    fn text_shows_label_rules_and_reasons() {
        let out = render(&verdict(MlOutcome::Scored(0.8)), false);
        assert!(out.contains("evil-pkg@0.0.1 [npm]"));
        assert!(out.contains("Verdict: MALICIOUS"));
        assert!(out.contains("BACKDOOR_PATTERN"));
        assert!(out.contains("Contains backdoor code"));
        assert!(!out.contains("Suggested actions"));
    }

    #[test]
    fn degraded_verdict_prints_warning() {
        let out = render(&verdict(MlOutcome::Unavailable), true);
        assert!(out.contains("ML scoring unavailable"));
        assert!(!out.contains("Model:"));
        assert!(out.contains("Remove evil-pkg immediately"));
    }
}
