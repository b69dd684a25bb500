//! Stand-alone validators for the pipeline's external-facing artifacts:
//! the input contract, key-criteria selection, the feasibility funnel, and
//! the USDM document's structural compliance.
//!
//! Every function here returns the crate's single [`ValidationResult`]
//! rather than declaring its own error type - the source this pipeline is
//! distilled from had a `validators.py` that re-declared `ValidationError`,
//! shadowing the schema library's own type of the same name (spec's
//! open-question note); this module is the one place that enforces there is
//! only ever one.

use std::collections::HashSet;

use crate::domain::funnel::FunnelResult;
use crate::domain::key_criterion::KeyCriterion;
use crate::domain::raw_criterion::RawCriterion;
use crate::domain::usdm::UsdmDocument;
use crate::stages::stage7_usdm_compliance::Stage7Compliance;
use crate::validation::ValidationError;

/// Re-exported so callers only need `crate::validators::ValidationResult`.
pub type ValidationResult = crate::validation::ValidationResult;

/// Validate the raw `eligibility_criteria.json` contract after
/// id/type defaulting has already run (`load_eligibility_criteria`):
/// non-empty criterion list, unique ids, non-empty text.
pub fn validate_input_contract(criteria: &[RawCriterion]) -> ValidationResult {
    let mut errors = Vec::new();

    if criteria.is_empty() {
        errors.push(ValidationError::constraint_violated(
            "criteria",
            "input contract must contain at least one criterion",
        ));
        return Err(errors);
    }

    let mut seen_ids = HashSet::new();
    for c in criteria {
        if !seen_ids.insert(c.criterion_id.as_str()) {
            errors.push(
                ValidationError::constraint_violated("criterion_id", "duplicate id in input contract")
                    .with_path(c.criterion_id.clone()),
            );
        }
        if c.text.trim().is_empty() {
            errors.push(
                ValidationError::constraint_violated("text", "criterion text must not be empty")
                    .with_path(c.criterion_id.clone()),
            );
        }
        if let Some(provenance) = &c.provenance {
            if let Some(page) = provenance.page_number {
                if page == 0 {
                    errors.push(
                        ValidationError::constraint_violated("provenance.page_number", "page numbers are 1-based")
                            .with_path(c.criterion_id.clone()),
                    );
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate the selected key-criteria set before it is written to
/// `{protocolId}_key_criteria.json`: unique ids, rates in range, a killer
/// criterion must be queryable (non-queryable criteria cannot drive
/// elimination-rate-based prioritization), and `funnel_priority` must be
/// dense enough to order the funnel (no validation of uniqueness beyond
/// "non-negative", since ties are resolved by score downstream).
pub fn validate_key_criteria(key_criteria: &[KeyCriterion]) -> ValidationResult {
    let mut errors = Vec::new();
    let mut seen_ids = HashSet::new();

    if key_criteria.len() > 15 {
        errors.push(ValidationError::constraint_violated(
            "key_criteria",
            "selection must not exceed the 15-criterion funnel cap",
        ));
    }

    for kc in key_criteria {
        if !seen_ids.insert(kc.key_id.as_str()) {
            errors.push(
                ValidationError::constraint_violated("key_id", "duplicate key-criterion id")
                    .with_path(kc.key_id.clone()),
            );
        }
        if kc.original_criterion_ids.is_empty() {
            errors.push(
                ValidationError::constraint_violated(
                    "original_criterion_ids",
                    "a key criterion must trace back to at least one raw criterion",
                )
                .with_path(kc.key_id.clone()),
            );
        }
        if !(0.0..=100.0).contains(&kc.estimated_elimination_rate) {
            errors.push(
                ValidationError::constraint_violated("estimated_elimination_rate", "must be within [0, 100]")
                    .with_path(kc.key_id.clone()),
            );
        }
        if kc.is_killer_criterion && !kc.is_queryable() {
            errors.push(
                ValidationError::constraint_violated(
                    "is_killer_criterion",
                    "a killer criterion must be queryable; non-queryable criteria cannot be \
                     prioritized by estimated elimination rate alone",
                )
                .with_path(kc.key_id.clone()),
            );
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a completed [`FunnelResult`] before it is written to
/// `{protocolId}_funnel_result.json`. Wraps the domain-level invariant
/// checks already on `FunnelResult`/`FunnelStage` (monotonicity, killer-id
/// referencing) plus the population-estimate bound, into the crate's
/// shared validation-error shape so callers get one error list instead of
/// three separate booleans to interpret.
pub fn validate_funnel_result(result: &FunnelResult) -> ValidationResult {
    let mut errors = Vec::new();

    if !result.is_monotonic() {
        errors.push(ValidationError::constraint_violated(
            "stages",
            "funnel is not monotonically non-increasing across stages",
        ));
    }

    if !result.killer_ids_reference_known_criteria() {
        errors.push(ValidationError::constraint_violated(
            "killer_criterion_ids",
            "a killer criterion id does not reference any selected key criterion",
        ));
    }

    let estimate = &result.population_estimate;
    if estimate.confidence_low > estimate.count || estimate.count > estimate.confidence_high {
        errors.push(ValidationError::constraint_violated(
            "population_estimate",
            "final count must fall within [confidence_low, confidence_high]",
        ));
    }

    for (i, window) in result.stages.windows(2).enumerate() {
        if window[1].order <= window[0].order {
            errors.push(
                ValidationError::constraint_violated("order", "funnel stage order must strictly increase")
                    .with_path(format!("stages[{}]", i + 1)),
            );
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Run Stage 7's structural compliance checks in read-only mode and fold
/// any unfixed violations into the shared validation-error shape. This is
/// the USDM-document half of "Validators & Schema": a caller that only
/// wants to know whether a document is compliant, without mutating it,
/// gets a `ValidationResult` rather than having to construct a
/// `Stage7Compliance` itself.
pub fn validate_usdm_document(doc: &UsdmDocument) -> ValidationResult {
    let mut probe = doc.clone();
    let result = Stage7Compliance::new(false).run(&mut probe, &[], &mut []);
    if result.errors.is_empty() {
        Ok(())
    } else {
        Err(result
            .errors
            .into_iter()
            .map(ValidationError::Custom)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::funnel::{FunnelStage, FunnelStageType, PopulationEstimate, PopulationEstimateMethod};
    use crate::domain::key_criterion::{KeyCriterionCategory, QueryableStatus};
    use crate::domain::raw_criterion::{CriterionType, Provenance};

    fn raw(id: &str, text: &str) -> RawCriterion {
        RawCriterion {
            criterion_id: id.to_string(),
            criterion_type: CriterionType::Inclusion,
            text: text.to_string(),
            provenance: None,
        }
    }

    #[test]
    fn empty_input_contract_is_rejected() {
        assert!(validate_input_contract(&[]).is_err());
    }

    #[test]
    fn duplicate_criterion_ids_are_rejected() {
        let criteria = vec![raw("INC_1", "Age >= 18"), raw("INC_1", "Duplicate")];
        let errors = validate_input_contract(&criteria).unwrap_err();
        assert!(errors.iter().any(|e| e.to_user_message().contains("duplicate")));
    }

    #[test]
    fn zero_page_number_is_rejected() {
        let mut c = raw("INC_1", "Age >= 18");
        c.provenance = Some(Provenance {
            page_number: Some(0),
            section_id: None,
            text_snippet: None,
        });
        assert!(validate_input_contract(&[c]).is_err());
    }

    #[test]
    fn valid_input_contract_passes() {
        let criteria = vec![raw("INC_1", "Age >= 18"), raw("EXC_1", "Prior chemotherapy")];
        assert!(validate_input_contract(&criteria).is_ok());
    }

    fn key_criterion(id: &str, rate: f64, killer: bool, queryable: QueryableStatus) -> KeyCriterion {
        KeyCriterion {
            key_id: id.to_string(),
            original_criterion_ids: vec!["INC_1".to_string()],
            category: KeyCriterionCategory::PrimaryAnchor,
            queryable_status: queryable,
            estimated_elimination_rate: rate,
            requires_manual_assessment: false,
            is_killer_criterion: killer,
            funnel_priority: 0,
            omop_mappings: vec![],
        }
    }

    #[test]
    fn out_of_range_elimination_rate_is_rejected() {
        let kc = key_criterion("K1", 150.0, false, QueryableStatus::FullyQueryable);
        assert!(validate_key_criteria(&[kc]).is_err());
    }

    #[test]
    fn non_queryable_killer_criterion_is_rejected() {
        let kc = key_criterion("K1", 40.0, true, QueryableStatus::NonQueryable);
        assert!(validate_key_criteria(&[kc]).is_err());
    }

    #[test]
    fn valid_key_criteria_pass() {
        let kc = key_criterion("K1", 40.0, true, QueryableStatus::FullyQueryable);
        assert!(validate_key_criteria(&[kc]).is_ok());
    }

    fn stage(order: u32, entering: u64, exiting: u64) -> FunnelStage {
        FunnelStage {
            name: "Demographics".into(),
            stage_type: FunnelStageType::Demographics,
            order,
            key_criteria: vec![key_criterion("K1", 50.0, true, QueryableStatus::FullyQueryable)],
            patients_entering: entering,
            patients_exiting: exiting,
            elimination_rate: 1.0 - (exiting as f64 / entering as f64),
            execution_time_ms: 5,
        }
    }

    #[test]
    fn funnel_with_bad_population_bounds_is_rejected() {
        let mut estimate = PopulationEstimate::new(1_000, PopulationEstimateMethod::Query);
        estimate.confidence_high = 500;
        let result = FunnelResult {
            stages: vec![stage(0, 10_000, 1_000)],
            killer_criterion_ids: vec!["K1".to_string()],
            optimization_opportunities: vec![],
            site_rankings: vec![],
            population_estimate: estimate,
        };
        assert!(validate_funnel_result(&result).is_err());
    }

    #[test]
    fn funnel_with_non_increasing_stage_order_is_rejected() {
        let result = FunnelResult {
            stages: vec![stage(1, 10_000, 1_000), stage(1, 1_000, 500)],
            killer_criterion_ids: vec!["K1".to_string()],
            optimization_opportunities: vec![],
            site_rankings: vec![],
            population_estimate: PopulationEstimate::new(500, PopulationEstimateMethod::Query),
        };
        assert!(validate_funnel_result(&result).is_err());
    }

    #[test]
    fn valid_funnel_result_passes() {
        let result = FunnelResult {
            stages: vec![stage(0, 10_000, 1_000)],
            killer_criterion_ids: vec!["K1".to_string()],
            optimization_opportunities: vec![],
            site_rankings: vec![],
            population_estimate: PopulationEstimate::new(1_000, PopulationEstimateMethod::Query),
        };
        assert!(validate_funnel_result(&result).is_ok());
    }
}
