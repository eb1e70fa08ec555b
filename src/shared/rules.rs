use crate::shared::schema::FeatureVector;
use serde::Serialize;

/// A rule violation detected on a projected vector, independent of the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleMatch {
    pub id: &'static str,
    pub points: u32,
    pub severity: Severity,
    pub description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// What a rule may look at besides the vector.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleContext {
    /// Registry metadata was supplied, so zero downloads/age mean something.
    pub metadata_known: bool,
}

/// A rule definition (metadata plus predicate).
pub struct RuleDef {
    pub id: &'static str,
    pub points: u32,
    pub severity: Severity,
    pub description: &'static str,
    check: fn(&FeatureVector, RuleContext) -> bool,
}

/// Typo-transform hits score 0.95; similarity alone never reaches this.
const TYPO_TRANSFORM_AT: f64 = 0.9;

fn any_positive(v: &FeatureVector, names: &[&str]) -> bool {
    names.iter().any(|n| v.get(n) > 0.0)
}

/// All rules in evaluation order.
pub fn all_rules() -> &'static [RuleDef] {
    use Severity::*;
    static RULES: &[RuleDef] = &[
        RuleDef {
            id: "INSTALL_SCRIPT_NETWORK",
            points: 30,
            severity: High,
            description: "Install script with network or remote execution",
            check: |v, _| {
                v.get("has_install_scripts") > 0.0
                    && (v.get("install_script_network") > 0.0 || v.get("http_requests") > 0.0)
            },
        },
        RuleDef {
            id: "BASE64_ENCODED_PAYLOAD",
            points: 15,
            severity: Medium,
            description: "Base64 encoded payload or decoding",
            check: |v, _| any_positive(v, &["base64_decode_calls", "base64_encoded_strings"]),
        },
        RuleDef {
            id: "FERNET_ENCRYPTION",
            points: 10,
            severity: Medium,
            description: "Fernet encryption (common in Python info-stealers)",
            check: |v, _| v.get("fernet_usage") > 0.0,
        },
        RuleDef {
            id: "EVAL_EXEC_USAGE",
            points: 20,
            severity: High,
            description: "Dynamic code execution via eval/exec",
            check: |v, _| any_positive(v, &["eval_calls", "exec_calls"]),
        },
        RuleDef {
            id: "SENSITIVE_FILE_ACCESS",
            points: 25,
            severity: High,
            description: "Accesses credential-bearing files",
            check: |v, _| v.get("sensitive_paths_accessed") > 0.0,
        },
        RuleDef {
            id: "ENV_VAR_EXFILTRATION",
            points: 15,
            severity: Medium,
            description: "Reads environment variables and talks to the network",
            check: |v, _| {
                v.get("env_var_access") > 0.0
                    && any_positive(v, &["http_requests", "socket_usage"])
            },
        },
        RuleDef {
            id: "SUSPICIOUS_NETWORK",
            points: 20,
            severity: High,
            description: "Contacts payload-staging or exfiltration hosts",
            check: |v, _| v.get("suspicious_domains") > 0.0,
        },
        RuleDef {
            id: "OBFUSCATED_CODE",
            points: 20,
            severity: High,
            description: "Heavily obfuscated code",
            check: |v, _| {
                v.get("obfuscation_score").max(v.get("sandbox_obfuscation_score")) > 0.5
            },
        },
        RuleDef {
            id: "NEW_PACKAGE_SPIKE",
            points: 10,
            severity: Medium,
            description: "Very new package with few downloads",
            check: |v, ctx| {
                ctx.metadata_known && v.get("age_days") < 30.0 && v.get("downloads_count") < 1000.0
            },
        },
        RuleDef {
            id: "TYPOSQUATTING",
            points: 40,
            severity: Critical,
            description: "Name imitates a popular package",
            check: |v, _| v.get("typosquatting_score") >= TYPO_TRANSFORM_AT,
        },
        RuleDef {
            id: "NAME_RESEMBLES_POPULAR",
            points: 20,
            severity: Medium,
            description: "Name shares most of its characters with a popular package",
            check: |v, _| {
                let score = v.get("typosquatting_score");
                score > 0.5 && score < TYPO_TRANSFORM_AT
            },
        },
        RuleDef {
            id: "LOW_DOWNLOADS",
            points: 5,
            severity: Low,
            description: "Almost no downloads",
            check: |v, ctx| ctx.metadata_known && v.get("downloads_count") < 100.0,
        },
        RuleDef {
            id: "CRYPTO_OPERATIONS",
            points: 5,
            severity: Low,
            description: "Cryptographic operations",
            check: |v, _| any_positive(v, &["crypto_imports", "aes_usage"]),
        },
        RuleDef {
            id: "SHELL_EXECUTION",
            points: 15,
            severity: Medium,
            description: "Spawns shells or subprocesses",
            check: |v, _| any_positive(v, &["shell_commands", "subprocess_calls", "os_system_calls"]),
        },
        RuleDef {
            id: "BACKDOOR_PATTERN",
            points: 40,
            severity: Critical,
            description: "Backdoor, reverse shell or C2 behavior",
            check: |v, _| {
                any_positive(v, &["backdoor_patterns", "reverse_shell_patterns", "c2_server_patterns"])
            },
        },
        RuleDef {
            id: "DATA_THEFT",
            points: 30,
            severity: High,
            description: "Captures keystrokes, screen, clipboard, camera or microphone",
            check: |v, _| {
                any_positive(
                    v,
                    &[
                        "keylogger_patterns",
                        "screenshot_capture",
                        "clipboard_access",
                        "webcam_access",
                        "microphone_access",
                    ],
                )
            },
        },
        RuleDef {
            id: "PERSISTENCE",
            points: 20,
            severity: High,
            description: "Installs startup, cron or registry persistence",
            check: |v, _| {
                any_positive(v, &["startup_modification", "cron_job_creation", "registry_modification"])
            },
        },
        RuleDef {
            id: "SANDBOX_SUSPICIOUS_CONNECTION",
            points: 35,
            severity: Critical,
            description: "Connected to suspicious hosts in the sandbox",
            check: |v, _| v.get("sandbox_suspicious_connections") > 0.0,
        },
        RuleDef {
            id: "SANDBOX_SENSITIVE_FILE_ACCESS",
            points: 30,
            severity: High,
            description: "Touched sensitive files in the sandbox",
            check: |v, _| v.get("sandbox_sensitive_file_access") > 0.0,
        },
    ];
    RULES
}

/// Evaluate every rule against a vector.
pub fn evaluate(vector: &FeatureVector, ctx: RuleContext) -> Vec<RuleMatch> {
    all_rules()
        .iter()
        .filter(|rule| (rule.check)(vector, ctx))
        .map(|rule| RuleMatch {
            id: rule.id,
            points: rule.points,
            severity: rule.severity,
            description: rule.description,
        })
        .collect()
}
