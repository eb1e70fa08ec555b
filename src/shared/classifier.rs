//! Tree-ensemble inference over schema-ordered feature vectors.
//!
//! The artifact is JSON, optionally gzip-compressed. It is validated once at
//! load and then only read.

use crate::shared::error::{Error, Result};
use crate::shared::schema::{FeatureVector, schema};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use tracing::info;

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Per-column standardization fitted on the training split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    /// Population standard deviation; zero-variance columns store 1.
    pub scale: Vec<f64>,
}

impl StandardScaler {
    /// Fit on row-major data. Zero-variance columns get a scale of 1.
    pub fn fit(rows: &[Vec<f64>], width: usize) -> Self {
        let n = rows.len().max(1) as f64;
        let mut mean = vec![0.0; width];
        for row in rows {
            for (m, x) in mean.iter_mut().zip(row) {
                *m += x;
            }
        }
        for m in &mut mean {
            *m /= n;
        }

        let mut var = vec![0.0; width];
        for row in rows {
            for ((v, x), m) in var.iter_mut().zip(row).zip(&mean) {
                *v += (x - m).powi(2);
            }
        }
        let scale = var
            .into_iter()
            .map(|v| {
                let sd = (v / n).sqrt();
                if sd > 0.0 && sd.is_finite() { sd } else { 1.0 }
            })
            .collect();

        Self { mean, scale }
    }

    pub fn transform(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (m, s))| {
                let s = if *s == 0.0 { 1.0 } else { *s };
                (x - m) / s
            })
            .collect()
    }
}

/// One node of a flattened binary tree. Children always sit after their parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        /// Fraction of malicious training samples that reached this leaf.
        malicious: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

impl DecisionTree {
    /// Leaf probability for a scaled input. Goes left when `x <= threshold`.
    pub fn predict(&self, x: &[f64]) -> f64 {
        let mut idx = 0;
        // Validated trees point strictly forward, so this walk is bounded by the node count.
        for _ in 0..self.nodes.len() {
            match self.nodes.get(idx) {
                Some(TreeNode::Leaf { malicious }) => return *malicious,
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let value = x.get(*feature).copied().unwrap_or(0.0);
                    idx = if value <= *threshold { *left } else { *right };
                }
                None => break,
            }
        }
        0.5
    }

    fn validate(&self, width: usize, tree: usize) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::CorruptArtifact(format!("tree {tree} has no nodes")));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    if *feature >= width {
                        return Err(Error::CorruptArtifact(format!(
                            "tree {tree} node {i} splits on column {feature} of {width}"
                        )));
                    }
                    if !threshold.is_finite() {
                        return Err(Error::CorruptArtifact(format!(
                            "tree {tree} node {i} has a non-finite threshold"
                        )));
                    }
                    for child in [left, right] {
                        if *child <= i || *child >= self.nodes.len() {
                            return Err(Error::CorruptArtifact(format!(
                                "tree {tree} node {i} points to invalid child {child}"
                            )));
                        }
                    }
                }
                TreeNode::Leaf { malicious } => {
                    if !(0.0..=1.0).contains(malicious) {
                        return Err(Error::CorruptArtifact(format!(
                            "tree {tree} leaf {i} has probability {malicious}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    pub trees: Vec<DecisionTree>,
    /// Normalized impurity decrease per column, schema order.
    pub feature_importances: Vec<f64>,
}

impl RandomForest {
    /// Mean leaf probability across trees.
    pub fn predict_proba(&self, x: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.5;
        }
        let total: f64 = self.trees.iter().map(|t| t.predict(x)).sum();
        total / self.trees.len() as f64
    }
}

/// Held-out evaluation recorded at training time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub roc_auc: f64,
    pub cv_mean: f64,
    pub cv_std: f64,
    pub train_rows: usize,
    pub test_rows: usize,
}

/// Immutable bundle produced by offline training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub feature_columns: Vec<String>,
    pub scaler: StandardScaler,
    pub forest: RandomForest,
    #[serde(default)]
    pub feature_explanations: BTreeMap<String, String>,
    #[serde(default)]
    pub metrics: Option<ModelMetrics>,
}

impl ModelArtifact {
    /// Bundle a fitted scaler and forest against the current schema.
    pub fn new(scaler: StandardScaler, forest: RandomForest) -> Self {
        let schema = schema();
        Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            feature_columns: schema.names().map(String::from).collect(),
            scaler,
            forest,
            feature_explanations: schema
                .columns()
                .iter()
                .map(|c| (c.name.to_string(), c.explanation.to_string()))
                .collect(),
            metrics: None,
        }
    }

    /// Read, decompress if needed, parse and validate an artifact file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let text = if bytes.starts_with(&GZIP_MAGIC) {
            let mut decoded = String::new();
            GzDecoder::new(bytes.as_slice()).read_to_string(&mut decoded)?;
            decoded
        } else {
            String::from_utf8(bytes)
                .map_err(|e| Error::CorruptArtifact(format!("artifact is not UTF-8: {e}")))?
        };
        let artifact = Self::from_json(&text)?;
        info!(
            path = %path.display(),
            trees = artifact.forest.trees.len(),
            "loaded model artifact"
        );
        Ok(artifact)
    }

    /// Parse and validate an artifact from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let artifact: ModelArtifact = serde_json::from_str(text)?;
        artifact.validate()?;
        Ok(artifact)
    }

    /// Write the artifact; paths ending in `.gz` are gzip-compressed.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self)?;
        if path.extension().is_some_and(|ext| ext == "gz") {
            let file = std::fs::File::create(path)?;
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(&json)?;
            encoder.finish()?;
        } else {
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    /// Check the stored columns against the schema, then the model structure.
    pub fn validate(&self) -> Result<()> {
        let schema = schema();
        if self.feature_columns.is_empty() {
            return Err(Error::SchemaMismatch {
                expected: schema.len(),
                found: 0,
                detail: Some("artifact stores no feature columns".into()),
            });
        }
        if let Some(at) = schema.first_divergence(&self.feature_columns) {
            let detail = match (self.feature_columns.get(at), schema.columns().get(at)) {
                (Some(found), Some(expected)) => {
                    format!("column {at} is '{found}', expected '{}'", expected.name)
                }
                _ => format!("column lists diverge at position {at}"),
            };
            return Err(Error::SchemaMismatch {
                expected: schema.len(),
                found: self.feature_columns.len(),
                detail: Some(detail),
            });
        }

        if self.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(Error::CorruptArtifact(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }

        let width = schema.len();
        if self.scaler.mean.len() != width || self.scaler.scale.len() != width {
            return Err(Error::CorruptArtifact(format!(
                "scaler has {}/{} entries for {width} columns",
                self.scaler.mean.len(),
                self.scaler.scale.len()
            )));
        }
        if self
            .scaler
            .mean
            .iter()
            .chain(&self.scaler.scale)
            .any(|v| !v.is_finite())
        {
            return Err(Error::CorruptArtifact("scaler holds non-finite values".into()));
        }
        if self.forest.trees.is_empty() {
            return Err(Error::CorruptArtifact("forest has no trees".into()));
        }
        if self.forest.feature_importances.len() != width {
            return Err(Error::CorruptArtifact(format!(
                "{} feature importances for {width} columns",
                self.forest.feature_importances.len()
            )));
        }
        for (i, tree) in self.forest.trees.iter().enumerate() {
            tree.validate(width, i)?;
        }
        Ok(())
    }

    /// Malicious-class probability for a projected vector.
    pub fn predict(&self, vector: &FeatureVector) -> Result<f64> {
        if let Some(feature) = vector.first_non_finite() {
            return Err(Error::NonFiniteFeature {
                feature: feature.to_string(),
            });
        }
        let scaled = self.scaler.transform(vector.values());
        Ok(self.forest.predict_proba(&scaled).clamp(0.0, 1.0))
    }

    /// Importances in schema order, or None when the model carries no signal in them.
    pub fn feature_importances(&self) -> Option<&[f64]> {
        let importances = self.forest.feature_importances.as_slice();
        let usable = importances.iter().all(|v| v.is_finite() && *v >= 0.0)
            && importances.iter().any(|v| *v > 0.0);
        usable.then_some(importances)
    }

    /// Reason text for a column: artifact mapping first, schema default second.
    pub fn explanation(&self, feature: &str) -> Option<&str> {
        self.feature_explanations
            .get(feature)
            .map(String::as_str)
            .or_else(|| schema().column(feature).map(|c| c.explanation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::Ecosystem;
    use crate::shared::schema::RawFeatures;

    fn width() -> usize {
        schema().len()
    }

    /// One stump on `eval_calls` (raw > 0.5 -> malicious).
    fn eval_stump() -> ModelArtifact {
        let col = schema().index_of("eval_calls").unwrap();
        let mut importances = vec![0.0; width()];
        importances[col] = 1.0;
        let scaler = StandardScaler {
            mean: vec![0.0; width()],
            scale: vec![1.0; width()],
        };
        let forest = RandomForest {
            trees: vec![DecisionTree {
                nodes: vec![
                    TreeNode::Split {
                        feature: col,
                        threshold: 0.5,
                        left: 1,
                        right: 2,
                    },
                    TreeNode::Leaf { malicious: 0.1 },
                    TreeNode::Leaf { malicious: 0.9 },
                ],
            }],
            feature_importances: importances,
        };
        ModelArtifact::new(scaler, forest)
    }

    fn vector(pairs: &[(&str, f64)]) -> FeatureVector {
        let mut raw = RawFeatures::new();
        for (k, v) in pairs {
            raw.set(k, *v);
        }
        schema().project(&raw, Ecosystem::Npm)
    }

    #[test]
    fn stump_routes_on_threshold() {
        let model = eval_stump();
        assert_eq!(model.predict(&vector(&[])).unwrap(), 0.1);
        assert_eq!(model.predict(&vector(&[("eval_calls", 3.0)])).unwrap(), 0.9);
    }

    #[test]
    fn scaler_applied_before_trees() {
        let mut model = eval_stump();
        let col = schema().index_of("eval_calls").unwrap();
        model.scaler.mean[col] = 10.0;
        // (3 - 10) / 1 <= 0.5
        assert_eq!(model.predict(&vector(&[("eval_calls", 3.0)])).unwrap(), 0.1);
    }

    #[test]
    fn forest_averages_trees() {
        let mut model = eval_stump();
        model.forest.trees.push(DecisionTree {
            nodes: vec![TreeNode::Leaf { malicious: 0.5 }],
        });
        assert!((model.predict(&vector(&[("eval_calls", 3.0)])).unwrap() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn non_finite_input_rejected() {
        let err = eval_stump()
            .predict(&vector(&[("obfuscation_score", f64::NAN)]))
            .unwrap_err();
        assert!(matches!(err, Error::NonFiniteFeature { ref feature } if feature == "obfuscation_score"));
    }

    #[test]
    fn shifted_columns_are_a_schema_mismatch() {
        let mut model = eval_stump();
        model.feature_columns.swap(0, 1);
        assert!(matches!(model.validate(), Err(Error::SchemaMismatch { .. })));
    }

    #[test]
    fn empty_columns_are_a_schema_mismatch() {
        let mut model = eval_stump();
        model.feature_columns.clear();
        assert!(matches!(
            model.validate(),
            Err(Error::SchemaMismatch { found: 0, .. })
        ));
    }

    #[test]
    fn backward_child_is_corrupt() {
        let mut model = eval_stump();
        model.forest.trees[0].nodes[0] = TreeNode::Split {
            feature: 0,
            threshold: 0.0,
            left: 0,
            right: 2,
        };
        assert!(matches!(model.validate(), Err(Error::CorruptArtifact(_))));
    }

    #[test]
    fn short_scaler_is_corrupt() {
        let mut model = eval_stump();
        model.scaler.mean.pop();
        assert!(matches!(model.validate(), Err(Error::CorruptArtifact(_))));
    }

    #[test]
    fn zero_importances_are_unusable() {
        let mut model = eval_stump();
        assert!(model.feature_importances().is_some());
        model.forest.feature_importances = vec![0.0; width()];
        assert!(model.feature_importances().is_none());
    }

    #[test]
    fn scaler_fit_handles_constant_columns() {
        let rows = vec![vec![1.0, 2.0], vec![3.0, 2.0]];
        let scaler = StandardScaler::fit(&rows, 2);
        assert_eq!(scaler.mean, vec![2.0, 2.0]);
        assert_eq!(scaler.scale, vec![1.0, 1.0]);
        assert_eq!(scaler.transform(&[3.0, 2.0]), vec![1.0, 0.0]);
    }

    #[test]
    fn save_and_load_plain_and_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let model = eval_stump();
        for file in ["model.json", "model.json.gz"] {
            let path = dir.path().join(file);
            model.save(&path).unwrap();
            assert_eq!(ModelArtifact::load(&path).unwrap(), model);
        }
    }

    #[test]
    fn garbage_file_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(ModelArtifact::load(&path), Err(Error::Json(_))));
    }
}
