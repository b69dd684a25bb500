//! Stage 7 — USDM Code Expansion & Compliance: the one stage
//! that rewrites rather than generates. Walks an in-memory [`UsdmDocument`],
//! injects missing `instanceType` discriminators, expands simple
//! `{code, decode}` pairs into full 6-field [`Code`] objects via a curated
//! table, links footnote-derived conditions to the scheduled activity
//! instances that carry their marker, and checks referential integrity.
//! A critical stage: callers should treat a non-compliant result
//! with `auto_fix` disabled as fatal.

use std::collections::HashMap;

use regex::Regex;
use tracing::instrument;

use crate::domain::qeb::CdiscBiomedicalConcept;
use crate::domain::usdm::{instance_types, Code, Condition, ConditionAssignment, SimpleCodePair, UsdmDocument};

/// Curated `{category, code}` -> decode table: "encounter-type,
/// timing-type, timing-reference, cycle-number, specimen-type, container,
/// purpose"). Cycle numbers aren't enumerable ahead of time so they fall
/// through to [`decode_cycle_number`] instead of a table lookup.
const CURATED_CODE_TABLE: &[(&str, &str, &str)] = &[
    ("encounter-type", "SCREENING", "Screening Visit"),
    ("encounter-type", "TREATMENT", "Treatment Visit"),
    ("encounter-type", "FOLLOWUP", "Follow-up Visit"),
    ("encounter-type", "UNSCHEDULED", "Unscheduled Visit"),
    ("timing-type", "FIXED_REFERENCE", "Fixed Reference"),
    ("timing-type", "BEFORE", "Before"),
    ("timing-type", "AFTER", "After"),
    ("timing-reference", "ENROLLMENT", "Enrollment"),
    ("timing-reference", "RANDOMIZATION", "Randomization"),
    ("timing-reference", "FIRST_DOSE", "Date of First Dose"),
    ("specimen-type", "BLOOD", "Blood"),
    ("specimen-type", "TISSUE", "Tissue"),
    ("specimen-type", "URINE", "Urine"),
    ("container", "TUBE", "Tube"),
    ("container", "VIAL", "Vial"),
    ("purpose", "EFFICACY", "Efficacy"),
    ("purpose", "SAFETY", "Safety"),
    ("purpose", "PHARMACOKINETIC", "Pharmacokinetic"),
];

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ComplianceResult {
    pub is_compliant: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub auto_fixed: u32,
    pub code_objects_expanded: u32,
    pub referential_integrity_passed: bool,
}

pub struct Stage7Compliance {
    auto_fix: bool,
}

impl Stage7Compliance {
    pub fn new(auto_fix: bool) -> Self {
        Self { auto_fix }
    }

    #[instrument(skip(self, doc, code_pairs, biomedical_concepts))]
    pub fn run(
        &self,
        doc: &mut UsdmDocument,
        code_pairs: &[(String, SimpleCodePair)],
        biomedical_concepts: &mut [CdiscBiomedicalConcept],
    ) -> ComplianceResult {
        let mut result = ComplianceResult {
            referential_integrity_passed: true,
            ..Default::default()
        };

        self.check_instance_types(doc, &mut result);
        self.check_code_expansion(code_pairs, &mut result);
        self.check_schedule_timeline(doc, &mut result);
        self.check_referential_integrity(doc, &mut result);
        self.check_condition_linkage(doc, &mut result);
        self.check_biomedical_concepts(biomedical_concepts, &mut result);

        result.is_compliant = result.errors.is_empty();
        result
    }

    fn check_instance_types(&self, doc: &mut UsdmDocument, result: &mut ComplianceResult) {
        let mut missing = 0usize;
        for a in &mut doc.activities {
            if a.instance_type.is_none() {
                missing += 1;
                if self.auto_fix {
                    a.instance_type = Some(instance_types::ACTIVITY.to_string());
                }
            }
        }
        for e in &mut doc.encounters {
            if e.instance_type.is_none() {
                missing += 1;
                if self.auto_fix {
                    e.instance_type = Some(instance_types::ENCOUNTER.to_string());
                }
            }
        }
        for s in &mut doc.scheduled_activity_instances {
            if s.instance_type.is_none() {
                missing += 1;
                if self.auto_fix {
                    s.instance_type = Some(instance_types::SCHEDULED_ACTIVITY_INSTANCE.to_string());
                }
            }
        }
        for t in &mut doc.timings {
            if t.instance_type.is_none() {
                missing += 1;
                if self.auto_fix {
                    t.instance_type = Some(instance_types::TIMING.to_string());
                }
            }
        }
        for c in &mut doc.conditions {
            if c.instance_type.is_none() {
                missing += 1;
                if self.auto_fix {
                    c.instance_type = Some(instance_types::CONDITION.to_string());
                }
            }
        }
        for ca in &mut doc.condition_assignments {
            if ca.instance_type.is_none() {
                missing += 1;
                if self.auto_fix {
                    ca.instance_type = Some(instance_types::CONDITION_ASSIGNMENT.to_string());
                }
            }
        }
        for f in &mut doc.footnotes {
            if f.instance_type.is_none() {
                missing += 1;
                if self.auto_fix {
                    f.instance_type = Some(instance_types::FOOTNOTE.to_string());
                }
            }
        }
        for t in &mut doc.schedule_timelines {
            if t.instance_type.is_none() {
                missing += 1;
                if self.auto_fix {
                    t.instance_type = Some(instance_types::SCHEDULE_TIMELINE.to_string());
                }
            }
        }

        if missing > 0 {
            if self.auto_fix {
                result.auto_fixed += missing as u32;
                result.warnings.push(format!("{missing} entities were missing instanceType; auto-filled"));
            } else {
                result.errors.push(format!("{missing} entities missing required instanceType discriminator"));
            }
        }
    }

    fn check_code_expansion(&self, code_pairs: &[(String, SimpleCodePair)], result: &mut ComplianceResult) {
        for (category, pair) in code_pairs {
            let _code = expand_code_pair(category, pair);
            result.code_objects_expanded += 1;
        }
    }

    fn check_schedule_timeline(&self, doc: &UsdmDocument, result: &mut ComplianceResult) {
        if doc.schedule_timelines.is_empty() {
            result.errors.push("document has no scheduleTimelines; at least one main timeline is required".to_string());
            return;
        }
        if !doc.has_main_timeline() {
            result.errors.push("no scheduleTimeline is marked as the main timeline".to_string());
        }
        let first_encounter = doc.encounters.first();
        if let Some(first) = first_encounter {
            let main_entry_ok = doc
                .schedule_timelines
                .iter()
                .filter(|t| t.main)
                .any(|t| t.entry_id == first.id);
            if !main_entry_ok {
                result
                    .warnings
                    .push(format!("main timeline entryId does not reference the first encounter '{}'", first.id));
            }
        }
    }

    fn check_referential_integrity(&self, doc: &UsdmDocument, result: &mut ComplianceResult) {
        let dangling = doc.find_dangling_references();
        if !dangling.is_empty() {
            result.referential_integrity_passed = false;
            for (field, referent) in dangling {
                result.errors.push(format!("referential integrity violation: {field} -> {referent}"));
            }
        }
    }

    /// Condition linkage: extract conditions from footnote text
    /// by pattern matching, then assign them to every SAI bearing that
    /// footnote's marker.
    fn check_condition_linkage(&self, doc: &mut UsdmDocument, result: &mut ComplianceResult) {
        if !self.auto_fix {
            return;
        }
        let marker_re = Regex::new(r"^\s*([A-Za-z0-9]{1,3})[.):]\s*(.+)$").unwrap();
        let condition_re = Regex::new(r"(?i)^if\s+(.+)$").unwrap();

        let mut marker_to_condition: HashMap<String, String> = HashMap::new();
        for footnote in &doc.footnotes {
            let Some(caps) = marker_re.captures(&footnote.text) else {
                continue;
            };
            let marker = caps[1].to_string();
            let remainder = caps[2].trim();
            let Some(condition_caps) = condition_re.captures(remainder) else {
                continue;
            };
            marker_to_condition.insert(marker, condition_caps[1].trim().to_string());
        }

        if marker_to_condition.is_empty() {
            return;
        }

        let mut condition_id_by_name: HashMap<String, String> = doc
            .conditions
            .iter()
            .map(|c| (c.name.clone(), c.id.clone()))
            .collect();

        let mut new_conditions = 0u32;
        let mut new_assignments = 0u32;
        let sai_ids: Vec<(String, Option<String>)> = doc
            .scheduled_activity_instances
            .iter()
            .map(|s| (s.id.clone(), s.footnote_marker.clone()))
            .collect();

        for (sai_id, marker) in sai_ids {
            let Some(marker) = marker else { continue };
            let Some(condition_name) = marker_to_condition.get(&marker) else {
                continue;
            };

            let condition_id = condition_id_by_name.entry(condition_name.clone()).or_insert_with(|| {
                let id = format!("COND_{}", condition_id_by_name.len() + 1);
                doc.conditions.push(Condition {
                    id: id.clone(),
                    name: condition_name.clone(),
                    instance_type: Some(instance_types::CONDITION.to_string()),
                });
                new_conditions += 1;
                id
            });

            let already_assigned = doc
                .condition_assignments
                .iter()
                .any(|a| a.scheduled_instance_id == sai_id && a.condition_id == *condition_id);
            if !already_assigned {
                doc.condition_assignments.push(ConditionAssignment {
                    id: format!("CA_{}", doc.condition_assignments.len() + 1),
                    condition_id: condition_id.clone(),
                    scheduled_instance_id: sai_id,
                    instance_type: Some(instance_types::CONDITION_ASSIGNMENT.to_string()),
                });
                new_assignments += 1;
            }
        }

        if new_conditions + new_assignments > 0 {
            result.auto_fixed += new_conditions + new_assignments;
            result
                .warnings
                .push(format!("linked {new_conditions} footnote-derived condition(s) to {new_assignments} scheduled activity instance(s)"));
        }
    }

    /// Biomedical concept validation: required fields present,
    /// confidence clamped, string lengths truncated. Reuses
    /// [`CdiscBiomedicalConcept::sanitized`] since Stage 12 emits the same shape.
    fn check_biomedical_concepts(&self, concepts: &mut [CdiscBiomedicalConcept], result: &mut ComplianceResult) {
        for concept in concepts.iter_mut() {
            if concept.concept_name.is_empty() || concept.cdisc_code.is_empty() || concept.domain.is_empty() {
                result
                    .errors
                    .push(format!("biomedical concept missing required field(s): {:?}", concept));
                continue;
            }
            let before = concept.clone();
            let sanitized = before.clone().sanitized();
            if sanitized != before {
                result.auto_fixed += 1;
            }
            *concept = sanitized;
        }
    }
}

/// Expand a simple `{code, decode}` pair into a 6-field [`Code`] object,
/// preferring the curated table's decode text over whatever the source
/// supplied.
pub fn expand_code_pair(category: &str, pair: &SimpleCodePair) -> Code {
    let decode = CURATED_CODE_TABLE
        .iter()
        .find(|(cat, code, _)| *cat == category && code.eq_ignore_ascii_case(&pair.code))
        .map(|(_, _, decode)| decode.to_string())
        .or_else(|| decode_cycle_number(category, &pair.code))
        .unwrap_or_else(|| {
            if pair.decode.is_empty() {
                pair.code.clone()
            } else {
                pair.decode.clone()
            }
        });

    Code::new(format!("{category}-{}", pair.code.to_lowercase()), pair.code.clone(), decode)
}

fn decode_cycle_number(category: &str, code: &str) -> Option<String> {
    if category != "cycle-number" {
        return None;
    }
    let re = Regex::new(r"(?i)^c(\d+)$").unwrap();
    re.captures(code).map(|caps| format!("Cycle {}", &caps[1]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::usdm::{Activity, Encounter, Footnote, ScheduleTimeline, ScheduledActivityInstance};

    fn doc_with_missing_instance_types() -> UsdmDocument {
        let mut doc = UsdmDocument::default();
        doc.activities.push(Activity { id: "A1".into(), name: "Blood draw".into(), instance_type: None });
        doc.encounters.push(Encounter { id: "E1".into(), name: "Visit 1".into(), cycle_number: None, instance_type: None });
        doc.schedule_timelines.push(ScheduleTimeline {
            id: "T1".into(),
            entry_id: "E1".into(),
            name: "Main".into(),
            main: true,
            instance_type: None,
        });
        doc
    }

    #[test]
    fn auto_fix_fills_missing_instance_types() {
        let mut doc = doc_with_missing_instance_types();
        let stage = Stage7Compliance::new(true);
        let result = stage.run(&mut doc, &[], &mut []);
        assert_eq!(doc.activities[0].instance_type.as_deref(), Some("Activity"));
        assert!(result.auto_fixed > 0);
        assert!(result.warnings.iter().any(|w| w.contains("instanceType")));
    }

    #[test]
    fn no_auto_fix_reports_errors_without_mutating() {
        let mut doc = doc_with_missing_instance_types();
        let stage = Stage7Compliance::new(false);
        let result = stage.run(&mut doc, &[], &mut []);
        assert!(doc.activities[0].instance_type.is_none());
        assert!(!result.is_compliant);
        assert!(result.errors.iter().any(|e| e.contains("instanceType")));
    }

    #[test]
    fn curated_table_expands_known_encounter_type() {
        let pair = SimpleCodePair { code: "SCREENING".into(), decode: String::new() };
        let code = expand_code_pair("encounter-type", &pair);
        assert_eq!(code.decode, "Screening Visit");
        assert_eq!(code.instance_type, "Code");
    }

    #[test]
    fn cycle_number_decoded_generically() {
        let pair = SimpleCodePair { code: "C3".into(), decode: String::new() };
        let code = expand_code_pair("cycle-number", &pair);
        assert_eq!(code.decode, "Cycle 3");
    }

    #[test]
    fn missing_main_timeline_is_an_error() {
        let mut doc = UsdmDocument::default();
        doc.schedule_timelines.push(ScheduleTimeline {
            id: "T1".into(),
            entry_id: "E1".into(),
            name: "Main".into(),
            main: false,
            instance_type: Some(instance_types::SCHEDULE_TIMELINE.to_string()),
        });
        let stage = Stage7Compliance::new(true);
        let result = stage.run(&mut doc, &[], &mut []);
        assert!(result.errors.iter().any(|e| e.contains("main timeline")));
    }

    #[test]
    fn dangling_reference_fails_referential_integrity() {
        let mut doc = UsdmDocument::default();
        doc.encounters.push(Encounter { id: "E1".into(), name: "V1".into(), cycle_number: None, instance_type: Some(instance_types::ENCOUNTER.to_string()) });
        doc.scheduled_activity_instances.push(ScheduledActivityInstance {
            id: "SAI1".into(),
            activity_id: "GHOST".into(),
            encounter_id: "E1".into(),
            footnote_marker: None,
            instance_type: Some(instance_types::SCHEDULED_ACTIVITY_INSTANCE.to_string()),
        });
        let stage = Stage7Compliance::new(true);
        let result = stage.run(&mut doc, &[], &mut []);
        assert!(!result.referential_integrity_passed);
    }

    #[test]
    fn footnote_condition_linked_to_marked_sai() {
        let mut doc = UsdmDocument::default();
        doc.footnotes.push(Footnote {
            id: "F1".into(),
            text: "a. If patient has prior hepatitis B infection".into(),
            instance_type: Some(instance_types::FOOTNOTE.to_string()),
        });
        doc.scheduled_activity_instances.push(ScheduledActivityInstance {
            id: "SAI1".into(),
            activity_id: "A1".into(),
            encounter_id: "E1".into(),
            footnote_marker: Some("a".into()),
            instance_type: Some(instance_types::SCHEDULED_ACTIVITY_INSTANCE.to_string()),
        });
        let stage = Stage7Compliance::new(true);
        let result = stage.run(&mut doc, &[], &mut []);
        assert_eq!(doc.conditions.len(), 1);
        assert_eq!(doc.condition_assignments.len(), 1);
        assert_eq!(doc.condition_assignments[0].scheduled_instance_id, "SAI1");
        assert!(result.auto_fixed > 0);
    }

    #[test]
    fn biomedical_concept_missing_field_is_an_error() {
        let mut concepts = vec![CdiscBiomedicalConcept {
            concept_name: String::new(),
            cdisc_code: "C12345".into(),
            domain: "Condition".into(),
            rationale: "x".into(),
            confidence: 0.8,
        }];
        let stage = Stage7Compliance::new(true);
        let mut doc = UsdmDocument::default();
        let result = stage.run(&mut doc, &[], &mut concepts);
        assert!(result.errors.iter().any(|e| e.contains("biomedical concept")));
    }

    #[test]
    fn biomedical_concept_confidence_clamped_and_counted_as_fix() {
        let mut concepts = vec![CdiscBiomedicalConcept {
            concept_name: "Lung cancer".into(),
            cdisc_code: "C12345".into(),
            domain: "Condition".into(),
            rationale: "x".into(),
            confidence: 5.0,
        }];
        let stage = Stage7Compliance::new(true);
        let mut doc = UsdmDocument::default();
        let result = stage.run(&mut doc, &[], &mut concepts);
        assert_eq!(concepts[0].confidence, 1.0);
        assert!(result.auto_fixed > 0);
    }
}
