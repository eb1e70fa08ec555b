pub mod install_script_analysis;
pub mod metadata_analysis;
pub mod name_analysis;
pub mod obfuscation_analysis;
pub mod pattern_analysis;
pub mod sandbox_analysis;

use crate::shared::models::PackageContext;
use crate::shared::schema::RawFeatures;

/// Trait implemented by every extraction feature.
/// Each feature reads the PackageContext and records the columns it owns.
pub trait Feature: Send + Sync {
    fn name(&self) -> &str;
    fn extract(&self, ctx: &PackageContext, out: &mut RawFeatures);
}

/// Returns all registered features.
pub fn all_features() -> Vec<Box<dyn Feature>> {
    vec![
        Box::new(pattern_analysis::PatternAnalysis),
        Box::new(obfuscation_analysis::ObfuscationAnalysis),
        Box::new(name_analysis::NameAnalysis),
        Box::new(metadata_analysis::MetadataAnalysis),
        Box::new(install_script_analysis::InstallScriptAnalysis),
        Box::new(sandbox_analysis::SandboxAnalysis),
    ]
}
