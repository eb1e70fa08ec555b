//! The canonical feature schema shared by extraction, training and inference.
//!
//! Every vector handed to the classifier is built by [`FeatureSchema::project`],
//! so column order cannot drift between call sites.

use crate::shared::models::Ecosystem;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

/// Whether a non-zero value counts against a package or in its favour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Risk,
    Trust,
}

/// One column of the schema.
#[derive(Debug)]
pub struct Column {
    pub name: &'static str,
    pub polarity: Polarity,
    /// Default human-readable reason; model artifacts may override it.
    pub explanation: &'static str,
}

const fn risk(name: &'static str, explanation: &'static str) -> Column {
    Column {
        name,
        polarity: Polarity::Risk,
        explanation,
    }
}

const fn trust(name: &'static str, explanation: &'static str) -> Column {
    Column {
        name,
        polarity: Polarity::Trust,
        explanation,
    }
}

static COLUMNS: &[Column] = &[
    // Registry metadata
    trust("downloads_count", "Download count"),
    trust("age_days", "Package age in days"),
    trust("maintainers_count", "Number of maintainers"),
    trust("dependencies_count", "Number of declared dependencies"),
    trust("version_major", "Major version"),
    trust("version_minor", "Minor version"),
    trust("version_patch", "Patch version"),
    risk("is_prerelease", "Published as a pre-release version"),
    // Encoding
    risk("base64_imports", "Uses Base64 encoding library imports"),
    risk("base64_decode_calls", "Decodes Base64 strings (hiding payloads)"),
    risk("base64_encoded_strings", "Contains Base64 encoded strings"),
    // Cryptography
    risk("fernet_usage", "Uses Fernet symmetric encryption"),
    risk("aes_usage", "Uses AES encryption"),
    risk("rsa_usage", "Uses RSA encryption"),
    risk("crypto_imports", "Imports cryptography libraries"),
    // Network
    risk("http_requests", "Makes HTTP requests"),
    risk("socket_usage", "Uses raw sockets for network access"),
    risk("dns_lookups", "Performs DNS lookups"),
    risk("external_urls_count", "Contains external URLs"),
    risk("ip_addresses_hardcoded", "Has hardcoded IP addresses"),
    risk("suspicious_domains", "Contains suspicious payload-staging domains"),
    // Filesystem
    risk("file_read_operations", "Reads files from the system"),
    risk("file_write_operations", "Writes files to the system"),
    risk("file_delete_operations", "Deletes files from the system"),
    risk("temp_file_usage", "Uses temporary files"),
    risk("sensitive_paths_accessed", "Accesses sensitive file paths (SSH keys, credentials, .env)"),
    // Execution
    risk("eval_calls", "Uses eval() for dynamic code execution"),
    risk("exec_calls", "Uses exec() for code execution"),
    risk("subprocess_calls", "Spawns subprocess/child processes"),
    risk("os_system_calls", "Makes OS system calls"),
    risk("shell_commands", "Executes shell commands"),
    // Obfuscation
    risk("obfuscation_score", "Code is obfuscated (hiding intent)"),
    risk("minified_code", "Code is minified or packed"),
    risk("hex_encoded_strings", "Contains hex-encoded strings"),
    risk("unicode_obfuscation", "Uses Unicode escape obfuscation"),
    risk("string_concatenation_abuse", "Builds strings from tiny fragments"),
    // Credential access
    risk("env_var_access", "Accesses environment variables"),
    risk("credential_patterns", "Contains credential access patterns"),
    risk("token_patterns", "Contains token access patterns"),
    risk("password_patterns", "Contains password access patterns"),
    risk("api_key_patterns", "Contains API key access patterns"),
    // Malicious behavior
    risk("keylogger_patterns", "Contains keylogger functionality"),
    risk("screenshot_capture", "Can capture screenshots"),
    risk("clipboard_access", "Accesses clipboard data"),
    risk("webcam_access", "Can access the webcam"),
    risk("microphone_access", "Can access the microphone"),
    risk("reverse_shell_patterns", "Creates a reverse shell connection"),
    risk("backdoor_patterns", "Opens a backdoor for remote access"),
    risk("c2_server_patterns", "Talks to a command-and-control server"),
    // Persistence
    risk("startup_modification", "Modifies startup configuration"),
    risk("cron_job_creation", "Creates cron or scheduled jobs"),
    risk("registry_modification", "Modifies the Windows registry"),
    // Package quality
    trust("has_readme", "Ships a README"),
    trust("has_license", "Ships a license file"),
    trust("has_tests", "Ships tests"),
    trust("has_changelog", "Ships a changelog"),
    trust("documentation_score", "Documentation completeness"),
    // Author trust
    trust("author_account_age_days", "Author account age"),
    trust("author_other_packages", "Number of other packages by the author"),
    trust("author_verified", "Author is verified"),
    risk("author_email_disposable", "Author uses a disposable email address"),
    // Name
    risk("typosquatting_score", "Name imitates a popular package (typosquatting)"),
    risk("name_similarity_to_popular", "Name is close to a popular package"),
    // Vulnerabilities
    risk("known_vulnerability_count", "Has known vulnerabilities"),
    risk("cve_references", "References CVE identifiers"),
    // Install hooks
    risk("has_install_scripts", "Declares install lifecycle scripts"),
    risk("has_postinstall_hook", "Runs code automatically on install"),
    risk("install_script_network", "Install script downloads or executes remote code"),
    // Sandbox telemetry
    risk("sandbox_suspicious_connections", "Connected to suspicious hosts during sandboxed execution"),
    risk("sandbox_sensitive_file_access", "Touched sensitive files during sandboxed execution"),
    risk("sandbox_obfuscation_score", "Sandbox analysis found obfuscated code"),
    // Ecosystem indicators
    trust("eco_is_npm", "Published on npm"),
    trust("eco_is_pypi", "Published on PyPI"),
];

/// The single authoritative ordered column list.
pub struct FeatureSchema {
    columns: &'static [Column],
    index: HashMap<&'static str, usize>,
}

static SCHEMA: LazyLock<FeatureSchema> = LazyLock::new(|| FeatureSchema {
    columns: COLUMNS,
    index: COLUMNS
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name, i))
        .collect(),
});

/// The process-wide schema.
pub fn schema() -> &'static FeatureSchema {
    &SCHEMA
}

impl FeatureSchema {
    pub fn columns(&self) -> &'static [Column] {
        self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn column(&self, name: &str) -> Option<&'static Column> {
        self.index_of(name).map(|i| &self.columns[i])
    }

    /// Index of the first position where `stored` diverges from this schema.
    pub fn first_divergence(&self, stored: &[String]) -> Option<usize> {
        let shared = stored.len().min(self.len());
        (0..shared)
            .find(|&i| stored[i] != self.columns[i].name)
            .or_else(|| (stored.len() != self.len()).then_some(shared))
    }

    /// Project an arbitrary feature mapping onto the schema's exact column order.
    ///
    /// Absent keys become 0, unknown keys are dropped, and the ecosystem
    /// indicator columns are taken from `ecosystem` alone.
    pub fn project(&self, raw: &RawFeatures, ecosystem: Ecosystem) -> FeatureVector {
        let mut values: Vec<f64> = self.columns.iter().map(|c| raw.get(c.name)).collect();

        for (name, _) in raw.iter() {
            if self.index_of(name).is_none() {
                tracing::debug!(feature = name, "dropping feature outside schema");
            }
        }

        if let Some(i) = self.index_of("eco_is_npm") {
            values[i] = if ecosystem == Ecosystem::Npm { 1.0 } else { 0.0 };
        }
        if let Some(i) = self.index_of("eco_is_pypi") {
            values[i] = if ecosystem == Ecosystem::Pypi { 1.0 } else { 0.0 };
        }

        FeatureVector { values }
    }
}

/// Unordered feature mapping as produced by individual extractors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFeatures(BTreeMap<String, f64>);

impl RawFeatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: f64) {
        self.0.insert(name.to_string(), value);
    }

    /// Value for `name`, or 0 when nothing recorded it.
    pub fn get(&self, name: &str) -> f64 {
        self.0.get(name).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl FromIterator<(String, f64)> for RawFeatures {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Fixed-width vector in schema order. Only [`FeatureSchema::project`] builds one.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: Vec<f64>,
}

impl FeatureVector {
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value of a named column; 0 for names outside the schema.
    pub fn get(&self, name: &str) -> f64 {
        schema()
            .index_of(name)
            .map(|i| self.values[i])
            .unwrap_or(0.0)
    }

    /// (column name, value) pairs in schema order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        schema().names().zip(self.values.iter().copied())
    }

    /// First column holding NaN or infinity.
    pub fn first_non_finite(&self) -> Option<&'static str> {
        self.iter().find(|(_, v)| !v.is_finite()).map(|(name, _)| name)
    }
}

impl Serialize for FeatureVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, &value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn column_names_are_unique() {
        let names: HashSet<_> = schema().names().collect();
        assert_eq!(names.len(), schema().len());
    }

    #[test]
    fn projection_fills_absent_with_zero() {
        let mut raw = RawFeatures::new();
        raw.set("eval_calls", 3.0);
        let v = schema().project(&raw, Ecosystem::Pypi);
        assert_eq!(v.len(), schema().len());
        assert_eq!(v.get("eval_calls"), 3.0);
        assert_eq!(v.get("exec_calls"), 0.0);
    }

    #[test]
    fn projection_ignores_unknown_keys() {
        let mut raw = RawFeatures::new();
        raw.set("not_a_column", 9.0);
        let v = schema().project(&raw, Ecosystem::Other);
        assert!(v.values().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn ecosystem_indicators_are_exclusive() {
        let mut raw = RawFeatures::new();
        raw.set("eco_is_pypi", 1.0);
        let npm = schema().project(&raw, Ecosystem::Npm);
        assert_eq!(npm.get("eco_is_npm"), 1.0);
        assert_eq!(npm.get("eco_is_pypi"), 0.0);

        let other = schema().project(&raw, Ecosystem::Other);
        assert_eq!(other.get("eco_is_npm") + other.get("eco_is_pypi"), 0.0);
    }

    #[test]
    fn vector_serializes_in_schema_order() {
        let v = schema().project(&RawFeatures::new(), Ecosystem::Npm);
        let json = serde_json::to_string(&v).unwrap();
        let first = json.find("\"downloads_count\"").unwrap();
        let last = json.find("\"eco_is_pypi\"").unwrap();
        assert!(first < last);
    }

    #[test]
    fn divergence_detects_shifted_columns() {
        let mut stored: Vec<String> = schema().names().map(String::from).collect();
        assert_eq!(schema().first_divergence(&stored), None);
        stored.swap(3, 4);
        assert_eq!(schema().first_divergence(&stored), Some(3));
        stored.swap(3, 4);
        stored.pop();
        assert_eq!(schema().first_divergence(&stored), Some(schema().len() - 1));
    }
}
