use crate::features::Feature;
use crate::shared::models::PackageContext;
use crate::shared::schema::RawFeatures;
use regex::Regex;
use std::sync::LazyLock;

/// Lines longer than this are treated as packed or minified output.
pub const MINIFIED_LINE_LENGTH: usize = 600;

/// Upper bound of the obfuscation score; no combination of signals reaches 1.0.
pub const MAX_OBFUSCATION_SCORE: f64 = 0.98;

const ESCAPE_WEIGHT: f64 = 0.25;
const MANY_HEX_WEIGHT: f64 = 0.10;
const MANY_HEX_THRESHOLD: usize = 10;
const DECODE_HELPER_WEIGHT: f64 = 0.20;
const SOME_BASE64_WEIGHT: f64 = 0.20;
const SOME_BASE64_THRESHOLD: usize = 3;
const MANY_BASE64_WEIGHT: f64 = 0.25;
const MANY_BASE64_THRESHOLD: usize = 10;
const MINIFIED_WEIGHT: f64 = 0.15;
const CHARCODE_WEIGHT: f64 = 0.15;
const SINGLE_LETTER_WEIGHT: f64 = 0.10;
const SINGLE_LETTER_THRESHOLD: usize = 200;

static HEX_ESCAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\x[0-9a-fA-F]{2}").unwrap());

static UNICODE_ESCAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\u(?:[0-9a-fA-F]{4}|\{[0-9a-fA-F]+\})").unwrap());

static ANY_ESCAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\x[0-9a-fA-F]{2}|\\u(?:[0-9a-fA-F]{4}|\{[0-9a-fA-F]+\})").unwrap()
});

static DECODE_HELPER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:atob|unescape|decodeURIComponent)\s*\(").unwrap());

static LONG_BASE64_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/]{40,}={0,2}").unwrap());

static CHARCODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"String\.fromCharCode\s*\(|\bchr\s*\(\s*\d").unwrap());

static SINGLE_LETTER_ASSIGN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\w$.])[A-Za-z_$]\s*=[^=>]").unwrap());

/// Computes `obfuscation_score` and `minified_code` from the corpus.
pub struct ObfuscationAnalysis;

impl Feature for ObfuscationAnalysis {
    fn name(&self) -> &str {
        "obfuscation_analysis"
    }

    fn extract(&self, ctx: &PackageContext, out: &mut RawFeatures) {
        let minified = is_minified(&ctx.corpus);
        out.set("minified_code", if minified { 1.0 } else { 0.0 });
        out.set("obfuscation_score", obfuscation_score(&ctx.corpus));
    }
}

/// True when the longest line exceeds [`MINIFIED_LINE_LENGTH`] characters.
pub fn is_minified(text: &str) -> bool {
    text.lines()
        .any(|line| line.chars().count() > MINIFIED_LINE_LENGTH)
}

/// Additive obfuscation score in [0, MAX_OBFUSCATION_SCORE].
///
/// Each term is a presence test or a count tier, so adding matching content
/// can only keep or raise the score.
pub fn obfuscation_score(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }

    let mut score: f64 = 0.0;

    let hex_count = HEX_ESCAPE_RE.find_iter(text).count();
    if hex_count > 0 || UNICODE_ESCAPE_RE.is_match(text) {
        score += ESCAPE_WEIGHT;
    }
    if hex_count > MANY_HEX_THRESHOLD {
        score += MANY_HEX_WEIGHT;
    }

    // Content signals read the text with escapes removed, so an escape
    // dropped into a token cannot split it.
    let unescaped = ANY_ESCAPE_RE.replace_all(text, "");

    if DECODE_HELPER_RE.is_match(&unescaped) {
        score += DECODE_HELPER_WEIGHT;
    }

    let base64_count = LONG_BASE64_RE.find_iter(&unescaped).count();
    if base64_count >= SOME_BASE64_THRESHOLD {
        score += SOME_BASE64_WEIGHT;
    }
    if base64_count >= MANY_BASE64_THRESHOLD {
        score += MANY_BASE64_WEIGHT;
    }

    if is_minified(text) {
        score += MINIFIED_WEIGHT;
    }

    if CHARCODE_RE.is_match(&unescaped) {
        score += CHARCODE_WEIGHT;
    }

    // Packers rename everything to one letter.
    if SINGLE_LETTER_ASSIGN_RE.find_iter(&unescaped).count() >= SINGLE_LETTER_THRESHOLD {
        score += SINGLE_LETTER_WEIGHT;
    }

    score.min(MAX_OBFUSCATION_SCORE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::{Ecosystem, PackageRecord};

    fn analyze(content: &str) -> RawFeatures {
        let ctx = PackageContext::new(PackageRecord::new("test-pkg", Ecosystem::Npm), content);
        let mut out = RawFeatures::new();
        ObfuscationAnalysis.extract(&ctx, &mut out);
        out
    }

    #[test]
    fn plain_code_scores_zero() {
        let raw = analyze("function add(left, right) {\n  return left + right;\n}\n");
        assert_eq!(raw.get("obfuscation_score"), 0.0);
        assert_eq!(raw.get("minified_code"), 0.0);
    }

    #[test]
    fn hex_escapes_add_weight() {
        assert_eq!(obfuscation_score(r#"var s = "\x68\x69";"#), ESCAPE_WEIGHT);
    }

    #[test]
    fn decode_helpers_add_weight() {
        assert_eq!(obfuscation_score("var p = atob(data);"), DECODE_HELPER_WEIGHT);
    }

    #[test]
    fn base64_tiers() {
        let blob = format!("'{}'\n", "Q".repeat(48));
        let some = obfuscation_score(&blob.repeat(3));
        let many = obfuscation_score(&blob.repeat(10));
        assert_eq!(some, SOME_BASE64_WEIGHT);
        assert!((many - (SOME_BASE64_WEIGHT + MANY_BASE64_WEIGHT)).abs() < 1e-9);
    }

    #[test]
    fn charcode_reconstruction() {
        assert_eq!(
            obfuscation_score("var c = String.fromCharCode(104, 105);"),
            CHARCODE_WEIGHT
        );
    }

    #[test]
    fn score_is_clamped_below_one() {
        let mut text = String::new();
        text.push_str(&r"\x41".repeat(50));
        text.push_str("atob(a); String.fromCharCode(1);");
        for _ in 0..20 {
            text.push_str(&format!(" '{}' ", "Z".repeat(50)));
        }
        text.push_str(&"a=1;".repeat(300));
        assert_eq!(obfuscation_score(&text), MAX_OBFUSCATION_SCORE);
    }

    #[test]
    fn minified_line_detected() {
        let raw = analyze(&"x".repeat(MINIFIED_LINE_LENGTH + 1));
        assert_eq!(raw.get("minified_code"), 1.0);
    }

    #[test]
    fn line_at_threshold_is_not_minified() {
        assert!(!is_minified(&"x".repeat(MINIFIED_LINE_LENGTH)));
    }

    #[test]
    fn more_hex_escapes_never_lower_the_score() {
        let base = "var a = 1; var payload = \"";
        let mut previous = obfuscation_score(base);
        for n in 1..40 {
            let text = format!("{base}{}\";", r"\x41".repeat(n));
            let current = obfuscation_score(&text);
            assert!(current >= previous, "score dropped at {n} escapes");
            previous = current;
        }
    }

    #[test]
    fn escapes_inside_base64_runs_keep_the_tier() {
        let literal = "Q".repeat(48);
        let lines: Vec<String> = (0..10).map(|_| format!("var s = '{literal}';")).collect();
        let plain = lines.join("\n");
        let before = obfuscation_score(&plain);
        assert!(before >= SOME_BASE64_WEIGHT + MANY_BASE64_WEIGHT);

        let split: Vec<String> = lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                if i < 8 {
                    line.replacen(&"Q".repeat(24), &format!("{}\\x41", "Q".repeat(24)), 1)
                } else {
                    line.clone()
                }
            })
            .collect();
        let after = obfuscation_score(&split.join("\n"));
        assert!(after >= before, "{after} < {before}");
    }

    #[test]
    fn single_line_bundle_outscores_multiline_source() {
        let statement = "var a=1;";
        let single = statement.repeat(10_000);
        let multi = vec![statement; 10_000].join("\n");
        assert!(is_minified(&single));
        assert!(!is_minified(&multi));
        assert!(obfuscation_score(&single) > obfuscation_score(&multi));
    }
}
