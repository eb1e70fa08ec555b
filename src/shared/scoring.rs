use crate::shared::error::{Error, Result};
use crate::shared::models::{Ecosystem, PackageRecord, ScanDepth};
use crate::shared::rules::RuleMatch;
use serde::{Deserialize, Serialize};

/// Points the model probability can contribute to the risk score.
const ML_RISK_RANGE: f64 = 35.0;

/// Ceiling on the summed rule points.
const RULE_POINTS_CAP: u32 = 65;

/// Rule totals at or above these pick the rule-only label.
const RULE_MALICIOUS_AT: u32 = 40;
const RULE_SUSPICIOUS_AT: u32 = 20;

/// Probability reported when the model could not score the package.
pub const NEUTRAL_PROBABILITY: f64 = 0.5;

pub const ML_UNAVAILABLE_WARNING: &str =
    "ML scoring unavailable; verdict derived from rule matches only";

/// Three-way verdict label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Label {
    Safe,
    Suspicious,
    Malicious,
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Label::Safe => write!(f, "SAFE"),
            Label::Suspicious => write!(f, "SUSPICIOUS"),
            Label::Malicious => write!(f, "MALICIOUS"),
        }
    }
}

/// Probability cutoffs partitioning [0, 1] into the three labels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    safe_max: f64,
    malicious_min: f64,
}

impl Thresholds {
    pub fn new(safe_max: f64, malicious_min: f64) -> Result<Self> {
        let in_range = |x: f64| (0.0..=1.0).contains(&x);
        if !(in_range(safe_max) && in_range(malicious_min) && safe_max < malicious_min) {
            return Err(Error::InvalidThresholds {
                safe_max,
                malicious_min,
            });
        }
        Ok(Self {
            safe_max,
            malicious_min,
        })
    }

    pub fn safe_max(&self) -> f64 {
        self.safe_max
    }

    pub fn malicious_min(&self) -> f64 {
        self.malicious_min
    }

    /// SAFE `p <= safe_max`, MALICIOUS `p >= malicious_min`, SUSPICIOUS between.
    pub fn classify(&self, p: f64) -> Label {
        if p <= self.safe_max {
            Label::Safe
        } else if p >= self.malicious_min {
            Label::Malicious
        } else {
            Label::Suspicious
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            safe_max: 0.35,
            malicious_min: 0.65,
        }
    }
}

/// What the classifier produced for one package.
#[derive(Debug, Clone, PartialEq)]
pub enum MlOutcome {
    Scored(f64),
    /// No artifact loaded.
    Unavailable,
    /// The classifier refused the input.
    Rejected(String),
}

/// Complete, immutable result of scoring a package.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub package_name: String,
    pub ecosystem: Ecosystem,
    pub version: Option<String>,
    pub scan_depth: ScanDepth,
    pub label: Label,
    /// Threshold label of the model probability; absent in rule-only mode.
    pub ml_label: Option<Label>,
    pub rule_label: Label,
    pub malicious_probability: f64,
    pub confidence: f64,
    pub risk_score: u32,
    pub reasons: Vec<String>,
    pub matched_rules: Vec<String>,
    pub suggested_actions: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub rule_matches: Vec<RuleMatch>,
}

impl Verdict {
    pub fn is_degraded(&self) -> bool {
        self.ml_label.is_none()
    }
}

/// Combine model outcome and rule matches into a verdict.
pub fn compute_verdict(
    record: &PackageRecord,
    outcome: MlOutcome,
    rules: Vec<RuleMatch>,
    reasons: Vec<String>,
    thresholds: &Thresholds,
) -> Verdict {
    let mut warnings = Vec::new();
    let probability = match outcome {
        MlOutcome::Scored(p) => Some(p),
        MlOutcome::Unavailable => {
            warnings.push(ML_UNAVAILABLE_WARNING.to_string());
            None
        }
        MlOutcome::Rejected(reason) => {
            warnings.push(format!("low confidence: classifier rejected input ({reason})"));
            None
        }
    };

    let rule_points = rule_points(&rules);
    let rule_label = rule_label(rule_points);
    let ml_label = probability.map(|p| thresholds.classify(p));
    let label = ml_label.map_or(rule_label, |ml| ml.max(rule_label));

    let p = probability.unwrap_or(NEUTRAL_PROBABILITY);
    Verdict {
        package_name: record.name.clone(),
        ecosystem: record.ecosystem,
        version: record.version.clone(),
        scan_depth: record.scan_depth,
        label,
        ml_label,
        rule_label,
        malicious_probability: round4(p),
        confidence: round4(p.max(1.0 - p)),
        risk_score: risk_score(probability, rule_points),
        reasons,
        matched_rules: rules.iter().map(|r| r.id.to_string()).collect(),
        suggested_actions: suggested_actions(&record.name, &rules),
        warnings,
        rule_matches: rules,
    }
}

/// Summed rule points, capped.
pub fn rule_points(rules: &[RuleMatch]) -> u32 {
    rules.iter().map(|r| r.points).sum::<u32>().min(RULE_POINTS_CAP)
}

fn rule_label(points: u32) -> Label {
    match points {
        p if p >= RULE_MALICIOUS_AT => Label::Malicious,
        p if p >= RULE_SUSPICIOUS_AT => Label::Suspicious,
        _ => Label::Safe,
    }
}

/// 0-100 blend: the probability scaled into 0-35 plus capped rule points.
/// An unscored package contributes nothing from the model side.
pub fn risk_score(probability: Option<f64>, rule_points: u32) -> u32 {
    let ml = probability
        .map(|p| (p.clamp(0.0, 1.0) * ML_RISK_RANGE).floor() as u32)
        .unwrap_or(0);
    (ml + rule_points.min(RULE_POINTS_CAP)).min(100)
}

fn suggested_actions(package: &str, rules: &[RuleMatch]) -> Vec<String> {
    let mut actions = Vec::new();
    let fired = |id: &str| rules.iter().any(|r| r.id == id);

    if fired("BACKDOOR_PATTERN") {
        actions.push(format!("Remove {package} immediately"));
    }
    if fired("TYPOSQUATTING") || fired("NAME_RESEMBLES_POPULAR") {
        actions.push("Verify this is the correct package name".to_string());
    }
    if fired("NEW_PACKAGE_SPIKE") {
        actions.push("Wait for package to be vetted by community".to_string());
    }
    if fired("INSTALL_SCRIPT_NETWORK") {
        actions.push("Review install scripts before installing".to_string());
    }
    if actions.is_empty() {
        actions.push("Pin version to known-good release".to_string());
        actions.push("Monitor package for updates".to_string());
    }
    actions
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}
