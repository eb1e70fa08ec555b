use crate::shared::patterns::{PatternDetector, compile_catalog, embedded_catalog};
use std::sync::OnceLock;

static DETECTORS: OnceLock<Vec<PatternDetector>> = OnceLock::new();

pub fn compiled_detectors() -> &'static [PatternDetector] {
    DETECTORS.get_or_init(|| compile_catalog(embedded_catalog()))
}
