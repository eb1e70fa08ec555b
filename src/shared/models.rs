use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// All data a feature needs to run its analysis.
#[derive(Debug, Clone)]
pub struct PackageContext {
    pub record: PackageRecord,
    /// Concatenated readable source text, already size-bounded by the collector.
    pub corpus: String,
    pub metadata: Option<PackageMetadata>,
    pub telemetry: Option<SandboxTelemetry>,
}

impl PackageContext {
    pub fn new(record: PackageRecord, corpus: impl Into<String>) -> Self {
        Self {
            record,
            corpus: corpus.into(),
            metadata: None,
            telemetry: None,
        }
    }

    pub fn with_metadata(mut self, metadata: PackageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_telemetry(mut self, telemetry: SandboxTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

/// Package registry a package belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Npm,
    Pypi,
    #[default]
    Other,
}

impl FromStr for Ecosystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "npm" | "node" | "js" => Ok(Ecosystem::Npm),
            "pypi" | "pip" | "python" | "py" => Ok(Ecosystem::Pypi),
            "other" => Ok(Ecosystem::Other),
            other => Err(format!("unknown ecosystem '{other}' (expected npm, pypi or other)")),
        }
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ecosystem::Npm => write!(f, "npm"),
            Ecosystem::Pypi => write!(f, "pypi"),
            Ecosystem::Other => write!(f, "other"),
        }
    }
}

/// How much real material backed a package's feature extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanDepth {
    /// Only a declared dependency name was available.
    Declared,
    /// Files from an installed dependency tree.
    Installed,
    /// A raw source tree.
    #[default]
    Source,
}

impl fmt::Display for ScanDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanDepth::Declared => write!(f, "declared"),
            ScanDepth::Installed => write!(f, "installed"),
            ScanDepth::Source => write!(f, "source"),
        }
    }
}

/// Identity of a package within one scan pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageRecord {
    pub name: String,
    pub ecosystem: Ecosystem,
    pub version: Option<String>,
    pub scan_depth: ScanDepth,
}

impl PackageRecord {
    pub fn new(name: impl Into<String>, ecosystem: Ecosystem) -> Self {
        Self {
            name: name.into(),
            ecosystem,
            version: None,
            scan_depth: ScanDepth::Source,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_depth(mut self, scan_depth: ScanDepth) -> Self {
        self.scan_depth = scan_depth;
        self
    }
}

/// Registry and repository metadata supplied by the fetching collaborator.
/// Every field is optional; absent numbers project to zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageMetadata {
    #[serde(alias = "downloads_count")]
    pub downloads: Option<u64>,
    pub age_days: Option<u64>,
    #[serde(alias = "maintainers_count")]
    pub maintainers: Option<u32>,
    #[serde(alias = "dependencies_count")]
    pub dependencies: Option<u32>,
    #[serde(deserialize_with = "de_flag")]
    pub has_readme: bool,
    #[serde(deserialize_with = "de_flag")]
    pub has_license: bool,
    #[serde(deserialize_with = "de_flag")]
    pub has_tests: bool,
    #[serde(deserialize_with = "de_flag")]
    pub has_changelog: bool,
    pub author_account_age_days: Option<u64>,
    pub author_other_packages: Option<u32>,
    #[serde(deserialize_with = "de_flag")]
    pub author_verified: bool,
    pub author_email: Option<String>,
    #[serde(alias = "known_vulnerability_count")]
    pub known_vulnerabilities: Option<u32>,
    /// npm `scripts` table (lifecycle hook name -> command).
    pub scripts: BTreeMap<String, String>,
}

/// Behavioral telemetry from a sandboxed execution of the package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxTelemetry {
    #[serde(alias = "suspicious_ips")]
    pub suspicious_connections: u32,
    #[serde(alias = "sensitive_files")]
    pub sensitive_file_accesses: u32,
    /// Independently computed obfuscation score on a 0-100 scale.
    pub obfuscation_score: f64,
}

/// Accept `true`/`false` as well as numeric 0/1 flags.
fn de_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Num(f64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Num(n) => n != 0.0,
    })
}
