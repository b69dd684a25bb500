//! Reference Data Manager: published biomarker, disease
//! prevalence, and screen-failure-rate tables backing the Population
//! Estimator and the synthetic query adapter when no live EHR is
//! available. Grounded in the original's module-singleton
//! `ReferenceDataManager`; reimplemented as an `Arc`-shared struct loaded
//! once and handed to whichever subsystem needs it, rather than a
//! class-attribute singleton reloaded through `__new__`.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Bundled reference tables shipped alongside the crate (`reference_data/`
/// at the repository root) unless a caller supplies a different directory.
#[derive(Debug, Clone)]
pub struct ReferenceDataManager {
    biomarker_frequencies: Value,
    condition_prevalence: Value,
    screen_fail_rates: Value,
}

impl ReferenceDataManager {
    /// Load the three reference tables from `dir`. A missing file degrades
    /// to an empty object rather than failing the whole pipeline, matching
    /// the source's "warn and continue with defaults" posture.
    pub fn load(dir: &Path) -> Arc<Self> {
        Arc::new(Self {
            biomarker_frequencies: load_json(dir, "biomarker_frequencies.json"),
            condition_prevalence: load_json(dir, "condition_prevalence.json"),
            screen_fail_rates: load_json(dir, "screen_fail_rates.json"),
        })
    }

    /// Load from the reference tables bundled with this crate.
    pub fn bundled() -> Arc<Self> {
        Self::load(&bundled_dir())
    }

    pub fn get_biomarker_frequency(&self, tumor_type: &str, biomarker: &str, default: f64) -> f64 {
        self.biomarker_frequencies
            .get(tumor_type)
            .and_then(|t| t.get("biomarkers"))
            .and_then(|b| b.get(biomarker))
            .and_then(|b| b.get("frequency"))
            .and_then(Value::as_f64)
            .unwrap_or(default)
    }

    pub fn get_condition_prevalence(&self, condition_key: &str, default_per_100k: f64) -> f64 {
        let per_100k = self
            .condition_prevalence
            .get("oncology")
            .and_then(|o| o.get(condition_key))
            .and_then(|c| c.get("prevalence_per_100k"))
            .and_then(Value::as_f64)
            .unwrap_or(default_per_100k);
        per_100k / 100_000.0
    }

    /// Screen-failure elimination rate for a criterion category/subtype,
    /// with the same nested category/subtype defaults as the source
    /// (functional/ecog=0.20, functional/labs=0.25, functional-other=0.20;
    /// safety_exclusion/cns=0.15, safety_exclusion/cardiac=0.05,
    /// safety_exclusion-other=0.10; treatment_history/first_line=0.30,
    /// treatment_history-other=0.25; else=`default`).
    pub fn get_screen_fail_rate(&self, criterion_type: &str, subtype: Option<&str>, default: f64) -> f64 {
        let rates = self
            .screen_fail_rates
            .get("oncology_phase3")
            .and_then(|p| p.get("by_criterion_category"));
        let Some(rates) = rates else { return default };

        match criterion_type {
            "functional" => {
                let func = rates.get("functional");
                match subtype {
                    Some("ecog") => func
                        .and_then(|f| f.get("ecog_status"))
                        .and_then(|e| e.get("ecog_0_1"))
                        .and_then(|e| e.get("typical_elimination"))
                        .and_then(Value::as_f64)
                        .unwrap_or(0.20),
                    Some("labs") => func
                        .and_then(|f| f.get("lab_criteria"))
                        .and_then(|l| l.get("typical_elimination"))
                        .and_then(Value::as_f64)
                        .unwrap_or(0.25),
                    _ => 0.20,
                }
            }
            "safety_exclusion" => {
                let safety = rates.get("safety_exclusion");
                match subtype {
                    Some("cns") => safety
                        .and_then(|s| s.get("cns_metastases"))
                        .and_then(|c| c.get("active_excluded"))
                        .and_then(|c| c.get("typical_elimination"))
                        .and_then(Value::as_f64)
                        .unwrap_or(0.15),
                    Some("cardiac") => safety
                        .and_then(|s| s.get("cardiac"))
                        .and_then(|c| c.get("qtc_prolongation"))
                        .and_then(|c| c.get("typical_elimination"))
                        .and_then(Value::as_f64)
                        .unwrap_or(0.05),
                    _ => 0.10,
                }
            }
            "treatment_history" => {
                let tx = rates.get("treatment_history");
                match subtype {
                    Some("first_line") => tx
                        .and_then(|t| t.get("prior_lines"))
                        .and_then(|p| p.get("first_line"))
                        .and_then(|p| p.get("typical_elimination"))
                        .and_then(Value::as_f64)
                        .unwrap_or(0.30),
                    _ => 0.25,
                }
            }
            _ => default,
        }
    }

    pub fn get_optimization_opportunity(&self, opportunity_key: &str) -> Option<(String, String, String)> {
        let entry = self
            .screen_fail_rates
            .get("optimization_benchmarks")
            .and_then(|b| b.get("opportunities"))
            .and_then(|o| o.get(opportunity_key))?;
        Some((
            entry.get("description")?.as_str()?.to_string(),
            entry.get("affected_stage")?.as_str()?.to_string(),
            entry.get("potential_impact")?.as_str()?.to_string(),
        ))
    }
}

fn bundled_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("reference_data")
}

fn load_json(dir: &Path, filename: &str) -> Value {
    let path = dir.join(filename);
    match std::fs::read_to_string(&path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(?path, error = %e, "reference file failed to parse, using empty table");
            Value::Object(Default::default())
        }),
        Err(_) => {
            warn!(?path, "reference file not found, using empty table");
            Value::Object(Default::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_tables_resolve_known_keys() {
        let manager = ReferenceDataManager::bundled();
        assert_eq!(manager.get_biomarker_frequency("NSCLC", "EGFR_mutation", 0.1), 0.15);
        assert!((manager.get_condition_prevalence("NSCLC", 10.0) - 0.00054).abs() < 1e-9);
    }

    #[test]
    fn unknown_keys_fall_back_to_defaults() {
        let manager = ReferenceDataManager::bundled();
        assert_eq!(manager.get_biomarker_frequency("unknown", "unknown", 0.1), 0.1);
    }

    #[test]
    fn screen_fail_rate_nested_defaults_match_source() {
        let manager = ReferenceDataManager::bundled();
        assert_eq!(manager.get_screen_fail_rate("functional", Some("ecog"), 0.5), 0.20);
        assert_eq!(manager.get_screen_fail_rate("safety_exclusion", Some("cardiac"), 0.5), 0.05);
        assert_eq!(manager.get_screen_fail_rate("treatment_history", None, 0.5), 0.25);
        assert_eq!(manager.get_screen_fail_rate("administrative", None, 0.42), 0.42);
    }

    #[test]
    fn missing_directory_degrades_to_empty_tables_not_panic() {
        let manager = ReferenceDataManager::load(Path::new("/nonexistent/reference/dir"));
        assert_eq!(manager.get_biomarker_frequency("NSCLC", "EGFR_mutation", 0.1), 0.1);
    }
}
