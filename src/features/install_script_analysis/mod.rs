use crate::features::Feature;
use crate::shared::models::PackageContext;
use crate::shared::schema::RawFeatures;

/// npm lifecycle hooks that run without user interaction.
pub const LIFECYCLE_SCRIPTS: &[&str] = &["preinstall", "install", "postinstall", "prepare", "postuninstall"];

/// Hooks that execute as part of `npm install` itself.
const AUTO_RUN_SCRIPTS: &[&str] = &["preinstall", "postinstall"];

/// Download-or-execute tokens inside a hook body.
const REMOTE_EXEC_TOKENS: &[&str] = &[
    "curl",
    "wget",
    "powershell",
    "pwsh",
    "invoke-webrequest",
    "iwr ",
    "node -e",
    "bash -c",
    "sh -c",
    "cmd /c",
    "child_process",
    "execsync",
    "spawn",
    "eval(",
    "exec(",
    "http://",
    "https://",
    "payload",
];

/// Flags declared lifecycle scripts and remote execution inside them.
pub struct InstallScriptAnalysis;

impl Feature for InstallScriptAnalysis {
    fn name(&self) -> &str {
        "install_script_analysis"
    }

    fn extract(&self, ctx: &PackageContext, out: &mut RawFeatures) {
        let Some(ref meta) = ctx.metadata else {
            return;
        };

        let hooks: Vec<(&str, &str)> = meta
            .scripts
            .iter()
            .filter(|(name, _)| LIFECYCLE_SCRIPTS.contains(&name.as_str()))
            .map(|(name, body)| (name.as_str(), body.as_str()))
            .collect();

        let auto_run = hooks.iter().any(|(name, _)| AUTO_RUN_SCRIPTS.contains(name));
        let remote = hooks.iter().any(|(_, body)| has_remote_exec_token(body));

        out.set("has_install_scripts", if hooks.is_empty() { 0.0 } else { 1.0 });
        out.set("has_postinstall_hook", if auto_run { 1.0 } else { 0.0 });
        out.set("install_script_network", if remote { 1.0 } else { 0.0 });
    }
}

pub fn has_remote_exec_token(body: &str) -> bool {
    let lowered = body.to_lowercase();
    REMOTE_EXEC_TOKENS.iter().any(|t| lowered.contains(t))
}
