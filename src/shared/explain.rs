use crate::shared::classifier::ModelArtifact;
use crate::shared::schema::{FeatureVector, Polarity, schema};

/// Most severe signals first; metadata concerns last.
pub const PRIORITY_FEATURES: &[&str] = &[
    "has_postinstall_hook",
    "install_script_network",
    "reverse_shell_patterns",
    "backdoor_patterns",
    "c2_server_patterns",
    "exec_calls",
    "eval_calls",
    "shell_commands",
    "subprocess_calls",
    "os_system_calls",
    "sandbox_suspicious_connections",
    "sensitive_paths_accessed",
    "sandbox_sensitive_file_access",
    "keylogger_patterns",
    "suspicious_domains",
    "env_var_access",
    "credential_patterns",
    "base64_decode_calls",
    "obfuscation_score",
    "sandbox_obfuscation_score",
    "typosquatting_score",
    "startup_modification",
    "cron_job_creation",
    "registry_modification",
    "fernet_usage",
    "ip_addresses_hardcoded",
    "minified_code",
    "author_email_disposable",
    "known_vulnerability_count",
];

/// Which strategy produced a reason list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Ranked,
    Priority,
}

/// Pick the reasons for a verdict: importance-ranked when the model offers
/// usable importances, the fixed priority walk otherwise.
pub fn explain(
    vector: &FeatureVector,
    artifact: Option<&ModelArtifact>,
    ranked_top_k: usize,
    priority_top_k: usize,
) -> (Strategy, Vec<String>) {
    match artifact.and_then(|a| a.feature_importances().map(|imp| (a, imp))) {
        Some((artifact, importances)) => {
            let reasons = ranked_reasons(vector, importances, ranked_top_k, |name| {
                artifact.explanation(name)
            });
            (Strategy::Ranked, reasons)
        }
        None => (Strategy::Priority, priority_reasons(vector, priority_top_k)),
    }
}

/// Rank risk columns with a non-zero value by `value * importance`.
///
/// Ties keep schema order.
pub fn ranked_reasons<'a>(
    vector: &FeatureVector,
    importances: &[f64],
    top_k: usize,
    explanation: impl Fn(&str) -> Option<&'a str>,
) -> Vec<String> {
    let columns = schema().columns();
    let mut scored: Vec<(usize, f64)> = vector
        .values()
        .iter()
        .zip(importances)
        .enumerate()
        .filter(|(i, (value, _))| columns[*i].polarity == Polarity::Risk && **value > 0.0)
        .map(|(i, (value, importance))| (i, value * importance))
        .filter(|(_, contribution)| *contribution > 0.0)
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    scored
        .into_iter()
        .take(top_k)
        .map(|(i, _)| {
            let name = columns[i].name;
            explanation(name).unwrap_or(columns[i].explanation).to_string()
        })
        .collect()
}

/// First `top_k` entries of [`PRIORITY_FEATURES`] with a non-zero value.
pub fn priority_reasons(vector: &FeatureVector, top_k: usize) -> Vec<String> {
    let schema = schema();
    PRIORITY_FEATURES
        .iter()
        .filter(|name| vector.get(name) > 0.0)
        .filter_map(|name| schema.column(name))
        .take(top_k)
        .map(|c| c.explanation.to_string())
        .collect()
}
