use crate::features::Feature;
use crate::shared::models::{Ecosystem, PackageContext};
use crate::shared::schema::RawFeatures;
use std::collections::HashSet;
use strsim::normalized_levenshtein;

/// Score returned when the name is an exact known typo transform of a popular name.
pub const TRANSFORM_HIT_SCORE: f64 = 0.95;

const CONTAINMENT_WEIGHT: f64 = 0.8;
const CHARSET_WEIGHT: f64 = 0.7;

/// Popular npm packages commonly targeted by typosquatters.
const POPULAR_NPM: &[&str] = &[
    "react", "express", "lodash", "axios", "moment", "vue", "angular", "webpack",
    "typescript", "eslint", "jest", "next", "socket.io", "jquery", "request",
    "commander", "chalk", "debug", "async", "dotenv", "colors", "underscore",
];

/// Popular PyPI packages commonly targeted by typosquatters.
const POPULAR_PYPI: &[&str] = &[
    "requests", "numpy", "pandas", "flask", "django", "scipy", "boto3",
    "tensorflow", "pytest", "sqlalchemy", "celery", "pillow", "selenium",
    "beautifulsoup4", "pyyaml", "cryptography", "aiohttp", "httpx", "urllib3",
    "setuptools",
];

const TYPO_SUFFIXES: &[&str] = &["-js", "-py", "-utils", "-lib", "-dev", "-cli"];

const TYPO_SUBSTITUTIONS: &[(char, char)] = &[('e', '3'), ('a', '4'), ('o', '0'), ('i', '1'), ('l', '1')];

/// Computes `typosquatting_score` and `name_similarity_to_popular`.
pub struct NameAnalysis;

impl Feature for NameAnalysis {
    fn name(&self) -> &str {
        "name_analysis"
    }

    fn extract(&self, ctx: &PackageContext, out: &mut RawFeatures) {
        let name = &ctx.record.name;
        let ecosystem = ctx.record.ecosystem;
        out.set("typosquatting_score", typosquat_score(name, ecosystem));
        out.set(
            "name_similarity_to_popular",
            nearest_popular(name, ecosystem)
                .map(|(_, similarity)| round2(similarity))
                .unwrap_or(0.0),
        );
    }
}

/// Popular names to compare against for an ecosystem.
pub fn popular_names(ecosystem: Ecosystem) -> Vec<&'static str> {
    match ecosystem {
        Ecosystem::Npm => POPULAR_NPM.to_vec(),
        Ecosystem::Pypi => POPULAR_PYPI.to_vec(),
        Ecosystem::Other => POPULAR_NPM.iter().chain(POPULAR_PYPI).copied().collect(),
    }
}

/// Lowercase and drop any npm scope (`@scope/name` -> `name`).
fn normalize(name: &str) -> String {
    let bare = match name.strip_prefix('@') {
        Some(scoped) => scoped.split_once('/').map(|(_, n)| n).unwrap_or(scoped),
        None => name,
    };
    bare.trim().to_lowercase()
}

/// Typosquatting score in [0, 1]. Exact popular names score 0.
pub fn typosquat_score(name: &str, ecosystem: Ecosystem) -> f64 {
    let name = normalize(name);
    if name.is_empty() {
        return 0.0;
    }
    let popular = popular_names(ecosystem);
    if popular.contains(&name.as_str()) {
        return 0.0;
    }

    let mut best: f64 = 0.0;
    for pop in popular {
        if typo_transforms(pop).iter().any(|t| t == &name) {
            return TRANSFORM_HIT_SCORE;
        }
        best = best
            .max(containment(&name, pop))
            .max(charset_jaccard(&name, pop) * CHARSET_WEIGHT);
    }
    round2(best)
}

/// Closest popular name by normalized Levenshtein similarity, excluding exact matches.
pub fn nearest_popular(name: &str, ecosystem: Ecosystem) -> Option<(&'static str, f64)> {
    let name = normalize(name);
    let popular = popular_names(ecosystem);
    if name.is_empty() || popular.contains(&name.as_str()) {
        return None;
    }
    popular
        .into_iter()
        .map(|pop| (pop, normalized_levenshtein(&name, pop)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// Length ratio when one name contains the other.
fn containment(name: &str, pop: &str) -> f64 {
    if name.contains(pop) || pop.contains(name) {
        let longest = name.chars().count().max(pop.chars().count()) as f64;
        pop.chars().count() as f64 / longest * CONTAINMENT_WEIGHT
    } else {
        0.0
    }
}

/// Jaccard similarity of the two character sets.
fn charset_jaccard(name: &str, pop: &str) -> f64 {
    let a: HashSet<char> = name.chars().collect();
    let b: HashSet<char> = pop.chars().collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Deterministic typo variants of a popular name.
fn typo_transforms(pop: &str) -> Vec<String> {
    let mut variants = Vec::new();

    for &(from, to) in TYPO_SUBSTITUTIONS {
        if pop.contains(from) {
            variants.push(pop.replace(from, &to.to_string()));
        }
    }

    for suffix in TYPO_SUFFIXES {
        variants.push(format!("{pop}{suffix}"));
    }

    // Pluralization
    variants.push(format!("{pop}s"));
    if pop.contains('s') {
        variants.push(pop.replace('s', "ss"));
    }

    // Truncation
    let chars: Vec<char> = pop.chars().collect();
    if chars.len() > 3 {
        variants.push(chars[..chars.len() - 1].iter().collect());
    }

    // Adjacent swaps
    for i in 0..chars.len().saturating_sub(1) {
        if chars[i] != chars[i + 1] {
            let mut swapped = chars.clone();
            swapped.swap(i, i + 1);
            variants.push(swapped.into_iter().collect());
        }
    }

    variants.retain(|v| v != pop);
    variants
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
