use crate::features::Feature;
use crate::features::obfuscation_analysis::MAX_OBFUSCATION_SCORE;
use crate::shared::models::PackageContext;
use crate::shared::schema::RawFeatures;

const CONNECTION_CAP: u32 = 20;
const FILE_ACCESS_CAP: u32 = 20;

/// Merges sandbox telemetry into the feature mapping.
///
/// The sandbox reports obfuscation on a 0-100 scale; the vector stores it on
/// the same [0, 1) scale as the static obfuscation score.
pub struct SandboxAnalysis;

impl Feature for SandboxAnalysis {
    fn name(&self) -> &str {
        "sandbox_analysis"
    }

    fn extract(&self, ctx: &PackageContext, out: &mut RawFeatures) {
        let Some(ref telemetry) = ctx.telemetry else {
            return;
        };

        out.set(
            "sandbox_suspicious_connections",
            telemetry.suspicious_connections.min(CONNECTION_CAP) as f64,
        );
        out.set(
            "sandbox_sensitive_file_access",
            telemetry.sensitive_file_accesses.min(FILE_ACCESS_CAP) as f64,
        );
        out.set(
            "sandbox_obfuscation_score",
            sandbox_score_to_unit(telemetry.obfuscation_score),
        );
    }
}

/// Convert a 0-100 sandbox score into the vector's [0, MAX_OBFUSCATION_SCORE] range.
pub fn sandbox_score_to_unit(score: f64) -> f64 {
    if !score.is_finite() {
        return score;
    }
    (score / 100.0).clamp(0.0, MAX_OBFUSCATION_SCORE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::{Ecosystem, PackageRecord, SandboxTelemetry};

    fn analyze(telemetry: SandboxTelemetry) -> RawFeatures {
        let ctx = PackageContext::new(PackageRecord::new("test-pkg", Ecosystem::Pypi), "")
            .with_telemetry(telemetry);
        let mut out = RawFeatures::new();
        SandboxAnalysis.extract(&ctx, &mut out);
        out
    }

    #[test]
    fn telemetry_merged() {
        let raw = analyze(SandboxTelemetry {
            suspicious_connections: 2,
            sensitive_file_accesses: 1,
            obfuscation_score: 45.0,
        });
        assert_eq!(raw.get("sandbox_suspicious_connections"), 2.0);
        assert_eq!(raw.get("sandbox_sensitive_file_access"), 1.0);
        assert!((raw.get("sandbox_obfuscation_score") - 0.45).abs() < 1e-9);
    }

    #[test]
    fn counts_capped_and_score_clamped() {
        let raw = analyze(SandboxTelemetry {
            suspicious_connections: 900,
            sensitive_file_accesses: 900,
            obfuscation_score: 100.0,
        });
        assert_eq!(raw.get("sandbox_suspicious_connections"), CONNECTION_CAP as f64);
        assert_eq!(raw.get("sandbox_sensitive_file_access"), FILE_ACCESS_CAP as f64);
        assert_eq!(raw.get("sandbox_obfuscation_score"), MAX_OBFUSCATION_SCORE);
    }

    #[test]
    fn non_finite_score_is_kept_for_the_classifier_guard() {
        let raw = analyze(SandboxTelemetry {
            obfuscation_score: f64::NAN,
            ..Default::default()
        });
        assert!(raw.get("sandbox_obfuscation_score").is_nan());
    }

    #[test]
    fn absent_telemetry_records_nothing() {
        let ctx = PackageContext::new(PackageRecord::new("test-pkg", Ecosystem::Pypi), "");
        let mut out = RawFeatures::new();
        SandboxAnalysis.extract(&ctx, &mut out);
        assert_eq!(out.iter().count(), 0);
    }
}
