//! Stage Orchestrator & Artifact Bus.
//!
//! Runs the pipeline's stages in fixed dependency order, passes each stage
//! a read-only view of upstream artifacts, persists every stage's output
//! for resumption and audit, and emits structured progress. Stages 2, 4,
//! and 7 are critical: an outright failure there aborts downstream stages.
//! Every other stage degrades to best-effort output with warnings and
//! continues.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::cache::CacheRegistry;
use crate::clinical_reasoner::ClinicalReasoner;
use crate::concept_expansion::ConceptExpansionService;
use crate::config::PipelineConfig;
use crate::domain::expression_tree::ExpressionTree;
use crate::domain::funnel::FunnelResult;
use crate::domain::key_criterion::KeyCriterion;
use crate::domain::mapping::{MappedAtomic, OmopMapping as MappedOmopMapping};
use crate::domain::qeb::QebOutput;
use crate::domain::raw_criterion::{Provenance, RawCriterion};
use crate::domain::sql_atomic::SqlAtomic;
use crate::domain::usdm::UsdmDocument;
use crate::error::{category, Error, Result};
use crate::gateway::LlmGateway;
use crate::population_estimator::PopulationEstimator;
use crate::reference_data::ReferenceDataManager;
use crate::reflection::ReflectionEngine;
use crate::stages::{
    AlternativeResolution, ComplianceResult, CycleExpansion, DecomposedCriterion, Stage11Feasibility,
    Stage12QebBuilder, Stage2Decomposition, Stage4Mapping, Stage6Sql, Stage7Compliance, VocabularySearch,
};

/// Cooperative cancellation signal: every suspension point
/// (LLM call, DB query, cache flush) checks this and stops at its next
/// opportunity rather than mid-operation.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Structured progress emitted after every stage:
/// "(phase, stageIndex, totalStages, stageName)").
#[derive(Debug, Clone, Serialize)]
pub struct StageProgress {
    pub phase: String,
    pub stage_index: u32,
    pub total_stages: u32,
    pub stage_name: String,
}

/// Sink for structured progress. The orchestrator never assumes a UI is
/// attached; callers that only want logs can use [`TracingProgressSink`].
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: StageProgress);
}

pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_progress(&self, progress: StageProgress) {
        info!(
            stage = progress.stage_index,
            total = progress.total_stages,
            name = %progress.stage_name,
            phase = %progress.phase,
            "stage progress"
        );
    }
}

/// Highest stage index named in's dependency order.
pub const TOTAL_STAGES: u32 = 12;

/// Persists and resumes per-stage artifacts under `interpretation_stages/`
///. A stage is skipped and its persisted artifact loaded instead
/// when that artifact exists *and* the hash of its upstream inputs matches
/// the hash recorded alongside it at the last run: "if a
/// stage's persisted artifact is present and upstream artifacts are
/// byte-identical, the stage is skipped").
struct ArtifactBus {
    dir: PathBuf,
}

impl ArtifactBus {
    fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn artifact_path(&self, stage: u32) -> PathBuf {
        self.dir.join(format!("stage{stage:02}_result.json"))
    }

    fn hash_path(&self, stage: u32) -> PathBuf {
        self.dir.join(format!("stage{stage:02}_result.inputs_hash"))
    }

    fn try_resume<T: DeserializeOwned>(&self, stage: u32, inputs_hash: &str) -> Option<T> {
        let stored_hash = std::fs::read_to_string(self.hash_path(stage)).ok()?;
        if stored_hash.trim() != inputs_hash {
            return None;
        }
        let bytes = std::fs::read(self.artifact_path(stage)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Atomic write-temp-then-rename, matching the cache subsystem's own
    /// on-disk discipline.
    fn persist<T: Serialize>(&self, stage: u32, inputs_hash: &str, artifact: &T) -> Result<()> {
        let path = self.artifact_path(stage);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(artifact)?)?;
        std::fs::rename(&tmp, &path)?;
        std::fs::write(self.hash_path(stage), inputs_hash)?;
        Ok(())
    }
}

fn hash_inputs<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

/// Input contract for `eligibility_criteria.json`.
#[derive(Debug, serde::Deserialize)]
struct EligibilityCriteriaFile {
    criteria: Vec<RawCriterionInput>,
}

#[derive(Debug, serde::Deserialize)]
struct RawCriterionInput {
    criterion_id: Option<String>,
    text: String,
    #[serde(default)]
    criterion_type: Option<String>,
    #[serde(default)]
    provenance: Option<ProvenanceInput>,
}

#[derive(Debug, serde::Deserialize)]
struct ProvenanceInput {
    page_number: Option<u32>,
    section_id: Option<String>,
    text_snippet: Option<String>,
}

/// Shape of the optional `omop_mappings.json` companion input:
/// pre-extracted OMOP concepts keyed by `criterion_id`, consulted by Stage 4
/// before it falls back to vocabulary search and LLM semantic matching.
#[derive(Debug, serde::Deserialize)]
struct OmopMappingEntry {
    table_name: String,
    concepts: Vec<OmopConceptInput>,
}

#[derive(Debug, serde::Deserialize)]
struct OmopConceptInput {
    concept_id: i64,
    concept_name: String,
    vocabulary_id: String,
    domain_id: String,
    standard_concept: bool,
}

/// Parse the optional companion `omop_mappings.json`. A missing file is not
/// an error: Stage 4 simply runs its full vocabulary-search/LLM pipeline
/// for every atomic.
fn load_omop_mappings(path: &Path) -> Result<HashMap<String, Vec<MappedOmopMapping>>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(path)?;
    let parsed: HashMap<String, OmopMappingEntry> = serde_json::from_str(&raw)?;
    Ok(parsed
        .into_iter()
        .map(|(criterion_id, entry)| {
            let mappings = entry
                .concepts
                .into_iter()
                .map(|c| MappedOmopMapping {
                    concept_id: c.concept_id,
                    concept_name: c.concept_name,
                    vocabulary_id: c.vocabulary_id,
                    domain_id: c.domain_id,
                    table_name: entry.table_name.clone(),
                    is_standard: c.standard_concept,
                })
                .collect();
            (criterion_id, mappings)
        })
        .collect())
}

/// Parse `eligibility_criteria.json`, auto-generating ids and defaulting
/// unknown criterion types
pub fn load_eligibility_criteria(path: &Path) -> Result<Vec<RawCriterion>> {
    let raw = std::fs::read_to_string(path)?;
    let parsed: EligibilityCriteriaFile = serde_json::from_str(&raw)?;
    Ok(parsed
        .criteria
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            RawCriterion::new_with_fallback_id(
                i,
                c.criterion_id,
                c.criterion_type.as_deref(),
                c.text,
                c.provenance.map(|p| Provenance {
                    page_number: p.page_number,
                    section_id: p.section_id,
                    text_snippet: p.text_snippet,
                }),
            )
        })
        .collect())
}

/// Aggregate result of a full pipeline run, plus the counts surfaced in
/// the pipeline's single user-visible failure summary.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunResult {
    pub success: bool,
    pub protocol_id: String,
    pub artifact_paths: Vec<PathBuf>,
    pub stage_durations_seconds: HashMap<String, f64>,
    pub warning_counts_by_category: HashMap<String, u64>,
    pub funnel_result: Option<FunnelResult>,
    pub key_criteria: Option<Vec<KeyCriterion>>,
    pub qeb_output: Option<QebOutput>,
}

/// Condensed view of a [`FunnelResult`] (`{protocolId}_funnel_summary.json`).
#[derive(Debug, Clone, Serialize)]
struct FunnelSummary {
    protocol_id: String,
    stage_count: usize,
    final_population: u64,
    confidence_low: u64,
    confidence_high: u64,
    overall_elimination_rate: f64,
    killer_criterion_ids: Vec<String>,
}

/// Owns every stage handle plus the shared caches, gateway, and reflection
/// engine they're built from, and runs them in's dependency order.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    caches: Arc<CacheRegistry>,
    #[allow(dead_code)]
    gateway: Arc<LlmGateway>,
    stage2: Stage2Decomposition,
    concept_expansion: ConceptExpansionService,
    stage4: Stage4Mapping,
    stage6: Stage6Sql,
    stage7: Stage7Compliance,
    stage11: Stage11Feasibility,
    stage12: Stage12QebBuilder,
    alternative_resolution: AlternativeResolution,
    cycle_expansion: CycleExpansion,
    artifacts: ArtifactBus,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl PipelineOrchestrator {
    pub fn new(config: PipelineConfig, progress: Arc<dyn ProgressSink>, cancel: CancellationToken) -> Result<Self> {
        let caches = Arc::new(CacheRegistry::open(&config.cache_dir, config.prompt_version.clone())?);
        let gateway = Arc::new(LlmGateway::new(&config, caches.llm_decision.clone()));
        let reflection = Arc::new(ReflectionEngine::new(gateway.clone()));
        let clinical_reasoner = Arc::new(ClinicalReasoner::new(gateway.clone()));
        let vocabulary = Arc::new(VocabularySearch::new(
            config.athena_db_path.clone(),
            caches.omop_query.clone(),
            config.vocabulary_pool_size,
        ));
        let reference_data = ReferenceDataManager::bundled();
        let population_estimator = Arc::new(PopulationEstimator::new(reference_data.clone()));

        let concept_expansion = ConceptExpansionService::new(
            gateway.clone(),
            caches.concept_expansion.clone(),
            config.batch_size_expansion,
            config.max_concurrent_batches,
            config.prompt_version.clone(),
        );

        let artifacts = ArtifactBus::new(config.artifact_dir.clone())?;

        Ok(Self {
            stage2: Stage2Decomposition::new(gateway.clone()),
            concept_expansion,
            stage4: Stage4Mapping::new(gateway.clone(), reflection, clinical_reasoner, vocabulary),
            stage6: Stage6Sql::new(),
            stage7: Stage7Compliance::new(true),
            stage11: Stage11Feasibility::new(gateway.clone(), population_estimator, reference_data),
            stage12: Stage12QebBuilder::new(gateway.clone()),
            alternative_resolution: AlternativeResolution::new(gateway.clone(), caches.llm_decision.clone()),
            cycle_expansion: CycleExpansion::new(gateway.clone(), caches.llm_decision.clone()),
            artifacts,
            gateway,
            caches,
            progress,
            cancel,
            config,
        })
    }

    fn emit(&self, stage_index: u32, stage_name: &str, phase: &str) {
        self.progress.on_progress(StageProgress {
            phase: phase.to_string(),
            stage_index,
            total_stages: TOTAL_STAGES,
            stage_name: stage_name.to_string(),
        });
    }

    /// Run the full eligibility-feasibility path:
    /// `RawCriterion[] -> ExpressionTree[] -> MappedAtomic[] -> SqlAtomic[]
    /// -> FunnelResult -> QebOutput`. Returns as soon as a critical stage
    /// fails outright; non-critical stages degrade and continue.
    #[instrument(skip(self), fields(protocol_id = %protocol_id))]
    pub async fn run(
        &self,
        input_path: &Path,
        omop_mappings_path: Option<&Path>,
        protocol_id: &str,
        base_population: u64,
    ) -> Result<PipelineRunResult> {
        let mut stage_durations = HashMap::new();
        let mut warning_counts: HashMap<String, u64> = HashMap::new();
        let mut artifact_paths = Vec::new();

        let criteria = load_eligibility_criteria(input_path)?;
        if let Err(errors) = crate::validators::validate_input_contract(&criteria) {
            for e in &errors {
                warn!(error = %e, "input contract validation warning");
            }
            *warning_counts.entry(category::REFERENTIAL_INTEGRITY.to_string()).or_insert(0) += errors.len() as u64;
        }
        let criteria_hash = hash_inputs(&criteria);
        let companion_mappings = match omop_mappings_path {
            Some(path) => load_omop_mappings(path)?,
            None => HashMap::new(),
        };

        // Stage 2 - Atomic Decomposition (critical).
        self.cancel.check()?;
        self.emit(2, "stage2_atomic_decomposition", "running");
        let started = Instant::now();
        let decomposed: Vec<DecomposedCriterion> = match self.artifacts.try_resume(2, &criteria_hash) {
            Some(cached) => cached,
            None => match self.stage2.run(&criteria).await {
                Ok(result) => {
                    self.artifacts.persist(2, &criteria_hash, &result)?;
                    result
                }
                Err(err) => return Ok(self.fatal_result(protocol_id, 2, "stage2_atomic_decomposition", err)),
            },
        };
        stage_durations.insert("stage2_atomic_decomposition".to_string(), started.elapsed().as_secs_f64());
        artifact_paths.push(self.artifacts.artifact_path(2));
        for d in &decomposed {
            for w in &d.warnings {
                warn!(criterion_id = %d.criterion_id, %w, "stage2 warning");
                *warning_counts.entry(category::ATOMIC_COUNT_MISMATCH.to_string()).or_insert(0) += 1;
            }
        }

        let trees: HashMap<String, ExpressionTree> =
            decomposed.iter().map(|d| (d.criterion_id.clone(), d.tree.clone())).collect();
        let leaves_by_id: HashMap<String, crate::domain::expression_tree::AtomicLeaf> = trees
            .values()
            .flat_map(|t| t.leaves().into_iter().map(|l| (l.atomic_id.clone(), l.clone())))
            .collect();
        let all_atomics: Vec<crate::domain::atomic::Atomic> =
            decomposed.iter().flat_map(|d| d.atomics.clone()).collect();
        let criterion_text_by_id: HashMap<String, String> =
            criteria.iter().map(|c| (c.criterion_id.clone(), c.text.clone())).collect();

        // Stage 3 - Concept Expansion & Term Normalization (non-critical).
        self.cancel.check()?;
        self.emit(3, "stage3_concept_expansion", "running");
        let started = Instant::now();
        let terms: Vec<String> = all_atomics.iter().map(|a| a.atomic_text.clone()).collect();
        let terms_hash = hash_inputs(&terms);
        let expansions = match self.artifacts.try_resume(3, &terms_hash) {
            Some(cached) => cached,
            None => {
                let result = self.concept_expansion.expand_terms(&terms).await;
                let _ = self.artifacts.persist(3, &terms_hash, &result);
                result
            }
        };
        stage_durations.insert("stage3_concept_expansion".to_string(), started.elapsed().as_secs_f64());
        artifact_paths.push(self.artifacts.artifact_path(3));
        drop(expansions);

        // Stage 4 - OMOP/FHIR Mapping (critical).
        self.cancel.check()?;
        self.emit(4, "stage4_omop_fhir_mapping", "running");
        let started = Instant::now();
        let stage4_inputs_hash = hash_inputs(&(&all_atomics, &companion_mappings));
        let mapped: Vec<MappedAtomic> = match self.artifacts.try_resume(4, &stage4_inputs_hash) {
            Some(cached) => cached,
            None => {
                let lookup = criterion_text_by_id.clone();
                match self
                    .stage4
                    .run(&all_atomics, move |id: &str| lookup.get(id).cloned().unwrap_or_default(), &companion_mappings)
                    .await
                {
                    Ok(result) => {
                        self.artifacts.persist(4, &stage4_inputs_hash, &result)?;
                        result
                    }
                    Err(err) => return Ok(self.fatal_result(protocol_id, 4, "stage4_omop_fhir_mapping", err)),
                }
            }
        };
        stage_durations.insert("stage4_omop_fhir_mapping".to_string(), started.elapsed().as_secs_f64());
        artifact_paths.push(self.artifacts.artifact_path(4));
        let unmapped_count = mapped.iter().filter(|m| !m.has_omop_mapping()).count();
        if unmapped_count > 0 {
            *warning_counts.entry(category::UNMAPPED.to_string()).or_insert(0) += unmapped_count as u64;
        }

        // Stage 6 - SQL Template Generation (non-critical, pure lowering).
        self.cancel.check()?;
        self.emit(6, "stage6_sql_templates", "running");
        let started = Instant::now();
        let stage6_inputs_hash = hash_inputs(&mapped);
        let sql_atomics: Vec<SqlAtomic> = match self.artifacts.try_resume(6, &stage6_inputs_hash) {
            Some(cached) => cached,
            None => {
                let result = self.stage6.run(&mapped, &leaves_by_id);
                self.artifacts.persist(6, &stage6_inputs_hash, &result)?;
                result
            }
        };
        stage_durations.insert("stage6_sql_templates".to_string(), started.elapsed().as_secs_f64());
        artifact_paths.push(self.artifacts.artifact_path(6));
        let schema_violations = sql_atomics.iter().filter(|a| a.validate_schema().is_err()).count();
        if schema_violations > 0 {
            *warning_counts.entry(category::REFERENTIAL_INTEGRITY.to_string()).or_insert(0) += schema_violations as u64;
        }

        // Stage 11 - Feasibility (classification -> key criteria -> funnel).
        self.cancel.check()?;
        self.emit(11, "stage11_feasibility", "running");
        let started = Instant::now();
        let (funnel, stage11_warnings) = self.stage11.run(&criteria, &mapped, base_population).await?;
        stage_durations.insert("stage11_feasibility".to_string(), started.elapsed().as_secs_f64());
        self.artifacts.persist(11, &hash_inputs(&stage4_inputs_hash), &funnel)?;
        artifact_paths.push(self.artifacts.artifact_path(11));
        for w in &stage11_warnings {
            warn!(%w, "stage11 warning");
            *warning_counts.entry(category::LLM_FAILED.to_string()).or_insert(0) += 1;
        }
        if !funnel.is_monotonic() {
            *warning_counts.entry(category::REFERENTIAL_INTEGRITY.to_string()).or_insert(0) += 1;
            warn!("funnel monotonicity invariant violated");
        }

        if let Err(errors) = crate::validators::validate_funnel_result(&funnel) {
            for e in &errors {
                warn!(error = %e, "funnel result validation warning");
            }
            *warning_counts.entry(category::REFERENTIAL_INTEGRITY.to_string()).or_insert(0) += errors.len() as u64;
        }

        let key_criteria: Vec<KeyCriterion> = funnel.stages.iter().flat_map(|s| s.key_criteria.clone()).collect();
        if let Err(errors) = crate::validators::validate_key_criteria(&key_criteria) {
            for e in &errors {
                warn!(error = %e, "key-criteria validation warning");
            }
            *warning_counts.entry(category::REFERENTIAL_INTEGRITY.to_string()).or_insert(0) += errors.len() as u64;
        }

        // Stage 12 - QEB Builder (non-critical, final assembly).
        self.cancel.check()?;
        self.emit(12, "stage12_qeb_builder", "running");
        let started = Instant::now();
        let (qeb_output, stage12_warnings) =
            self.stage12.run(&criteria, &trees, &sql_atomics, &mapped, &funnel).await?;
        stage_durations.insert("stage12_qeb_builder".to_string(), started.elapsed().as_secs_f64());
        self.artifacts.persist(12, &hash_inputs(&stage6_inputs_hash), &qeb_output)?;
        artifact_paths.push(self.artifacts.artifact_path(12));
        for w in &stage12_warnings {
            warn!(%w, "stage12 warning");
            *warning_counts.entry(category::ATOMIC_COUNT_MISMATCH.to_string()).or_insert(0) += 1;
        }

        let final_paths = self.write_final_outputs(protocol_id, &funnel, &key_criteria, &qeb_output)?;
        artifact_paths.extend(final_paths);

        self.caches.checkpoint()?;

        Ok(PipelineRunResult {
            success: true,
            protocol_id: protocol_id.to_string(),
            artifact_paths,
            stage_durations_seconds: stage_durations,
            warning_counts_by_category: warning_counts,
            funnel_result: Some(funnel),
            key_criteria: Some(key_criteria),
            qeb_output: Some(qeb_output),
        })
    }

    fn fatal_result(&self, protocol_id: &str, stage: u32, stage_name: &str, err: Error) -> PipelineRunResult {
        let mut warning_counts = HashMap::new();
        warning_counts.insert("fatal".to_string(), 1);
        warn!(stage, name = stage_name, error = %err, "critical stage failed, aborting run");
        PipelineRunResult {
            success: false,
            protocol_id: protocol_id.to_string(),
            artifact_paths: Vec::new(),
            stage_durations_seconds: HashMap::new(),
            warning_counts_by_category: warning_counts,
            funnel_result: None,
            key_criteria: None,
            qeb_output: None,
        }
    }

    fn write_final_outputs(
        &self,
        protocol_id: &str,
        funnel: &FunnelResult,
        key_criteria: &[KeyCriterion],
        qeb_output: &QebOutput,
    ) -> Result<Vec<PathBuf>> {
        let dir = &self.config.artifact_dir;
        let mut paths = Vec::new();

        let funnel_path = dir.join(format!("{protocol_id}_funnel_result.json"));
        std::fs::write(&funnel_path, serde_json::to_vec_pretty(funnel)?)?;
        paths.push(funnel_path);

        let key_criteria_path = dir.join(format!("{protocol_id}_key_criteria.json"));
        std::fs::write(&key_criteria_path, serde_json::to_vec_pretty(key_criteria)?)?;
        paths.push(key_criteria_path);

        let overall_elimination_rate = funnel
            .stages
            .first()
            .filter(|s| s.patients_entering > 0)
            .map(|s| {
                let initial = s.patients_entering as f64;
                (initial - funnel.population_estimate.count as f64) / initial * 100.0
            })
            .unwrap_or(0.0);
        let summary = FunnelSummary {
            protocol_id: protocol_id.to_string(),
            stage_count: funnel.stages.len(),
            final_population: funnel.population_estimate.count,
            confidence_low: funnel.population_estimate.confidence_low,
            confidence_high: funnel.population_estimate.confidence_high,
            overall_elimination_rate,
            killer_criterion_ids: funnel.killer_criterion_ids.clone(),
        };
        let summary_path = dir.join(format!("{protocol_id}_funnel_summary.json"));
        std::fs::write(&summary_path, serde_json::to_vec_pretty(&summary)?)?;
        paths.push(summary_path);

        let qeb_path = dir.join(format!("{protocol_id}_qeb_output.json"));
        std::fs::write(&qeb_path, serde_json::to_vec_pretty(qeb_output)?)?;
        paths.push(qeb_path);

        Ok(paths)
    }

    /// Run the USDM/SOA path over an already-extracted
    /// schedule-of-activities document: Stage 7 compliance plus the two
    /// reused SOA side modules. The document itself is an external
    /// collaborator's output - this only compiles it into
    /// a compliant, referentially-sound USDM document.
    #[instrument(skip(self, doc, code_pairs, biomedical_concepts))]
    pub async fn run_usdm_path(
        &self,
        doc: &mut UsdmDocument,
        code_pairs: &[(String, crate::domain::usdm::SimpleCodePair)],
        biomedical_concepts: &mut [crate::domain::qeb::CdiscBiomedicalConcept],
    ) -> Result<(ComplianceResult, Vec<String>)> {
        if let Err(errors) = crate::validators::validate_usdm_document(doc) {
            for e in &errors {
                warn!(error = %e, "usdm document pre-check: compliance violation (will attempt auto-fix)");
            }
        }

        let mut review_ids = Vec::new();
        review_ids.extend(self.alternative_resolution.run(doc).await);
        review_ids.extend(self.cycle_expansion.run(doc).await);

        let result = self.stage7.run(doc, code_pairs, biomedical_concepts);
        if !result.is_compliant {
            return Err(Error::fatal(
                "stage7_usdm_compliance",
                format!("USDM compliance failed: {} error(s)", result.errors.len()),
            ));
        }
        Ok((result, review_ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token_reports_cancelled_error() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn hash_inputs_is_stable_for_same_value() {
        let a = vec!["one".to_string(), "two".to_string()];
        let b = vec!["one".to_string(), "two".to_string()];
        assert_eq!(hash_inputs(&a), hash_inputs(&b));
    }

    #[test]
    fn hash_inputs_differs_for_different_values() {
        let a = vec!["one".to_string()];
        let b = vec!["two".to_string()];
        assert_ne!(hash_inputs(&a), hash_inputs(&b));
    }

    #[test]
    fn eligibility_criteria_loader_autogenerates_ids_and_defaults_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eligibility_criteria.json");
        std::fs::write(
            &path,
            r#"{"criteria":[{"text":"Age >= 18 years"},{"criterion_id":"EXC_1","criterion_type":"exclusion","text":"Prior chemo"}]}"#,
        )
        .unwrap();

        let criteria = load_eligibility_criteria(&path).unwrap();
        assert_eq!(criteria[0].criterion_id, "C000");
        assert_eq!(criteria[0].criterion_type, crate::domain::raw_criterion::CriterionType::Inclusion);
        assert_eq!(criteria[1].criterion_id, "EXC_1");
        assert_eq!(criteria[1].criterion_type, crate::domain::raw_criterion::CriterionType::Exclusion);
    }
}
