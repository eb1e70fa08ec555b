use crate::features::Feature;
use crate::shared::models::PackageContext;
use crate::shared::schema::RawFeatures;

/// Throwaway-mailbox providers.
const DISPOSABLE_EMAIL_DOMAINS: &[&str] = &[
    "mailinator.com",
    "guerrillamail.com",
    "10minutemail.com",
    "tempmail.com",
    "temp-mail.org",
    "throwawaymail.com",
    "yopmail.com",
    "trashmail.com",
    "sharklasers.com",
    "getnada.com",
    "dispostable.com",
    "maildrop.cc",
];

const PRERELEASE_MARKERS: &[&str] = &["alpha", "beta", "rc", "dev", "pre"];

/// Passes registry metadata through and derives version, documentation and author columns.
pub struct MetadataAnalysis;

impl Feature for MetadataAnalysis {
    fn name(&self) -> &str {
        "metadata_analysis"
    }

    fn extract(&self, ctx: &PackageContext, out: &mut RawFeatures) {
        if let Some(ref version) = ctx.record.version {
            let parsed = parse_version(version);
            out.set("version_major", parsed.major as f64);
            out.set("version_minor", parsed.minor as f64);
            out.set("version_patch", parsed.patch as f64);
            out.set("is_prerelease", flag(parsed.prerelease));
        }

        let Some(ref meta) = ctx.metadata else {
            return;
        };

        // Numbers pass through unclamped.
        out.set("downloads_count", meta.downloads.unwrap_or(0) as f64);
        out.set("age_days", meta.age_days.unwrap_or(0) as f64);
        out.set("maintainers_count", meta.maintainers.unwrap_or(0) as f64);
        out.set("dependencies_count", meta.dependencies.unwrap_or(0) as f64);

        let docs = [meta.has_readme, meta.has_license, meta.has_tests, meta.has_changelog];
        out.set("has_readme", flag(meta.has_readme));
        out.set("has_license", flag(meta.has_license));
        out.set("has_tests", flag(meta.has_tests));
        out.set("has_changelog", flag(meta.has_changelog));
        out.set(
            "documentation_score",
            docs.iter().filter(|&&d| d).count() as f64 / docs.len() as f64,
        );

        out.set(
            "author_account_age_days",
            meta.author_account_age_days.unwrap_or(0) as f64,
        );
        out.set(
            "author_other_packages",
            meta.author_other_packages.unwrap_or(0) as f64,
        );
        out.set("author_verified", flag(meta.author_verified));
        out.set(
            "author_email_disposable",
            flag(meta.author_email.as_deref().is_some_and(is_disposable_email)),
        );

        out.set(
            "known_vulnerability_count",
            meta.known_vulnerabilities.unwrap_or(0) as f64,
        );
    }
}

/// Numeric components of a version string.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: bool,
}

/// Leading numeric dot-separated parts; anything unparseable is 0.
pub fn parse_version(version: &str) -> ParsedVersion {
    let trimmed = version.trim().trim_start_matches(['v', 'V', '=', '^', '~']);
    let lowered = trimmed.to_ascii_lowercase();

    let mut parts = lowered
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u64>().unwrap_or(0)
        });

    ParsedVersion {
        major: parts.next().unwrap_or(0),
        minor: parts.next().unwrap_or(0),
        patch: parts.next().unwrap_or(0),
        prerelease: lowered.contains('-')
            || PRERELEASE_MARKERS.iter().any(|m| lowered.contains(m)),
    }
}

pub fn is_disposable_email(email: &str) -> bool {
    let Some((_, domain)) = email.trim().rsplit_once('@') else {
        return false;
    };
    let domain = domain.to_ascii_lowercase();
    DISPOSABLE_EMAIL_DOMAINS
        .iter()
        .any(|d| domain == *d || domain.ends_with(&format!(".{d}")))
}

fn flag(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::{Ecosystem, PackageMetadata, PackageRecord};

    fn analyze(version: Option<&str>, meta: Option<PackageMetadata>) -> RawFeatures {
        let mut record = PackageRecord::new("test-pkg", Ecosystem::Npm);
        record.version = version.map(String::from);
        let mut ctx = PackageContext::new(record, "");
        ctx.metadata = meta;
        let mut out = RawFeatures::new();
        MetadataAnalysis.extract(&ctx, &mut out);
        out
    }

    #[test]
    fn version_components() {
        assert_eq!(
            parse_version("v2.31.0"),
            ParsedVersion { major: 2, minor: 31, patch: 0, prerelease: false }
        );
    }

    #[test]
    fn prerelease_markers() {
        assert!(parse_version("1.0.0-beta.2").prerelease);
        assert!(parse_version("0.9rc1").prerelease);
        assert!(!parse_version("3.4.5").prerelease);
    }

    #[test]
    fn short_and_garbage_versions() {
        assert_eq!(parse_version("7").minor, 0);
        assert_eq!(parse_version("latest"), ParsedVersion::default());
    }

    #[test]
    fn metadata_passthrough_unclamped() {
        let meta = PackageMetadata {
            downloads: Some(2_000_000),
            age_days: Some(2000),
            has_readme: true,
            has_license: true,
            ..Default::default()
        };
        let raw = analyze(None, Some(meta));
        assert_eq!(raw.get("downloads_count"), 2_000_000.0);
        assert_eq!(raw.get("age_days"), 2000.0);
        assert_eq!(raw.get("documentation_score"), 0.5);
    }

    #[test]
    fn no_metadata_records_nothing() {
        let raw = analyze(None, None);
        assert_eq!(raw.iter().count(), 0);
    }

    #[test]
    fn disposable_author_email() {
        assert!(is_disposable_email("x@mailinator.com"));
        assert!(is_disposable_email("x@eu.YOPMAIL.com"));
        assert!(!is_disposable_email("dev@example.org"));
        assert!(!is_disposable_email("not-an-email"));
    }
}
