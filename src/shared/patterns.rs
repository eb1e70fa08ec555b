use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::collections::HashMap;

/// Ceiling applied to `count` entries that do not declare one.
const DEFAULT_COUNT_CAP: u32 = 50;

/// Category tables in patterns.toml, in evaluation order.
pub const CATEGORIES: &[&str] = &[
    "encoding",
    "crypto",
    "network",
    "filesystem",
    "execution",
    "obfuscation",
    "credentials",
    "malicious_behavior",
    "persistence",
    "vulnerability",
];

/// How the matches of one entry collapse into a feature value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Count,
    Presence,
}

/// A single detector entry loaded from patterns.toml.
#[derive(Debug, Deserialize)]
pub struct PatternEntry {
    pub feature: String,
    pub aggregation: Aggregation,
    #[serde(default)]
    pub cap: Option<u32>,
    #[serde(default)]
    pub literal: bool,
    pub patterns: Vec<String>,
}

/// Collection of detector entries keyed by category.
#[derive(Debug, Deserialize)]
pub struct PatternDatabase {
    #[serde(flatten)]
    pub sections: HashMap<String, Vec<PatternEntry>>,
}

/// A compiled detector ready for matching.
#[derive(Debug)]
pub struct PatternDetector {
    pub category: &'static str,
    pub feature: String,
    pub regexes: Vec<Regex>,
    pub aggregation: Aggregation,
    pub cap: u32,
}

impl PatternDetector {
    /// Feature value for `text`. Never fails; no match yields 0.
    pub fn evaluate(&self, text: &str) -> f64 {
        match self.aggregation {
            Aggregation::Presence => {
                if self.regexes.iter().any(|re| re.is_match(text)) {
                    1.0
                } else {
                    0.0
                }
            }
            Aggregation::Count => {
                let mut total: u32 = 0;
                for re in &self.regexes {
                    total = total.saturating_add(re.find_iter(text).count() as u32);
                    if total >= self.cap {
                        return self.cap as f64;
                    }
                }
                total as f64
            }
        }
    }

    /// Upper bound of [`evaluate`](Self::evaluate).
    pub fn max_value(&self) -> f64 {
        match self.aggregation {
            Aggregation::Presence => 1.0,
            Aggregation::Count => self.cap as f64,
        }
    }
}

/// The catalog shipped with the binary.
pub fn embedded_catalog() -> &'static str {
    include_str!("../../data/patterns.toml")
}

/// Parse and compile a catalog. Unparseable catalogs yield no detectors and
/// patterns that fail to compile are dropped from their entry.
pub fn compile_catalog(toml_str: &str) -> Vec<PatternDetector> {
    let db: PatternDatabase = match toml::from_str(toml_str) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("failed to parse pattern catalog: {e}");
            return Vec::new();
        }
    };

    for section in db.sections.keys() {
        if !CATEGORIES.contains(&section.as_str()) {
            tracing::warn!(section = section.as_str(), "ignoring unknown pattern category");
        }
    }

    let mut detectors = Vec::new();
    for &category in CATEGORIES {
        let Some(entries) = db.sections.get(category) else {
            continue;
        };
        for entry in entries {
            let regexes: Vec<Regex> = entry
                .patterns
                .iter()
                .filter_map(|pattern| {
                    let source = if entry.literal {
                        regex::escape(pattern)
                    } else {
                        pattern.clone()
                    };
                    match RegexBuilder::new(&source).case_insensitive(true).build() {
                        Ok(re) => Some(re),
                        Err(e) => {
                            tracing::warn!(
                                feature = entry.feature.as_str(),
                                pattern = pattern.as_str(),
                                "skipping invalid pattern: {e}"
                            );
                            None
                        }
                    }
                })
                .collect();

            detectors.push(PatternDetector {
                category,
                feature: entry.feature.clone(),
                regexes,
                aggregation: entry.aggregation,
                cap: entry.cap.unwrap_or(DEFAULT_COUNT_CAP),
            });
        }
    }
    detectors
}
