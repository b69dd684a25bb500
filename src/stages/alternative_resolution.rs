//! Alternative Resolution: detects activities
//! whose name actually describes a choice between interchangeable
//! procedures ("CT or MRI of the chest") and splits them into separate
//! `Activity` entries joined by a shared `Condition`/`ConditionAssignment`
//! pair, rather than leaving one activity that silently means "pick one".
//!
//! LLM-first: the regex split is only a cross-check logged when it
//! disagrees with the model, never a substitute decision path. Below the
//! 0.90 confidence floor the activity is left untouched and flagged for
//! manual review instead of guessed at.

use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::cache::LlmDecisionCache;
use crate::domain::usdm::{instance_types, Activity, Condition, ConditionAssignment, UsdmDocument};
use crate::gateway::LlmGateway;

/// Confidence floor above which a detected alternative-activity split is
/// applied automatically.
pub const SPLIT_CONFIDENCE_THRESHOLD: f64 = 0.90;

pub struct AlternativeResolution {
    gateway: Arc<LlmGateway>,
    cache: Arc<LlmDecisionCache>,
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    is_alternative_set: bool,
    #[serde(default)]
    alternatives: Vec<String>,
    #[serde(default)]
    confidence: f64,
}

impl AlternativeResolution {
    pub fn new(gateway: Arc<LlmGateway>, cache: Arc<LlmDecisionCache>) -> Self {
        Self { gateway, cache }
    }

    /// Walk every activity in `doc`, splitting confidently-detected
    /// alternative sets in place. Returns criterion ids (here, activity
    /// ids) that need manual review because confidence fell short.
    #[instrument(skip(self, doc), fields(activity_count = doc.activities.len()))]
    pub async fn run(&self, doc: &mut UsdmDocument) -> Vec<String> {
        let mut needs_review = Vec::new();
        let original_activities = doc.activities.clone();
        let mut next_id = 0u32;

        for activity in &original_activities {
            let normalized = normalize(&activity.name);
            let verdict = self.resolve_one(&normalized).await;

            let pattern_alternatives = pattern_split(&activity.name);
            if let Some(v) = &verdict {
                if v.is_alternative_set != (pattern_alternatives.len() >= 2) {
                    warn!(
                        activity_id = %activity.id,
                        llm_decision = v.is_alternative_set,
                        pattern_hint = pattern_alternatives.len() >= 2,
                        "alternative resolution: LLM verdict disagrees with pattern cross-check"
                    );
                }
            }

            let Some(verdict) = verdict else {
                needs_review.push(activity.id.clone());
                continue;
            };

            if !verdict.is_alternative_set || verdict.confidence < SPLIT_CONFIDENCE_THRESHOLD || verdict.alternatives.len() < 2 {
                if verdict.is_alternative_set {
                    needs_review.push(activity.id.clone());
                }
                continue;
            }

            self.split_activity(doc, activity, &verdict.alternatives, &mut next_id);
        }

        needs_review
    }

    fn split_activity(&self, doc: &mut UsdmDocument, original: &Activity, alternatives: &[String], next_id: &mut u32) {
        doc.activities.retain(|a| a.id != original.id);

        let condition_id = format!("{}.COND", original.id);
        doc.conditions.push(Condition {
            id: condition_id.clone(),
            name: format!("Alternative selection for {}", original.name),
            instance_type: Some(instance_types::CONDITION.to_string()),
        });

        let mut new_activity_ids = Vec::with_capacity(alternatives.len());
        for alternative in alternatives {
            let new_id = format!("{}.ALT{}", original.id, *next_id);
            *next_id += 1;
            doc.activities.push(Activity {
                id: new_id.clone(),
                name: alternative.clone(),
                instance_type: Some(instance_types::ACTIVITY.to_string()),
            });
            new_activity_ids.push(new_id);
        }

        let referencing_sais: Vec<_> = doc
            .scheduled_activity_instances
            .iter()
            .filter(|sai| sai.activity_id == original.id)
            .cloned()
            .collect();
        doc.scheduled_activity_instances.retain(|sai| sai.activity_id != original.id);

        for sai in &referencing_sais {
            for new_activity_id in &new_activity_ids {
                let new_sai_id = format!("{}.{}", sai.id, new_activity_id);
                doc.scheduled_activity_instances.push(crate::domain::usdm::ScheduledActivityInstance {
                    id: new_sai_id.clone(),
                    activity_id: new_activity_id.clone(),
                    encounter_id: sai.encounter_id.clone(),
                    footnote_marker: sai.footnote_marker.clone(),
                    instance_type: Some(instance_types::SCHEDULED_ACTIVITY_INSTANCE.to_string()),
                });
                doc.condition_assignments.push(ConditionAssignment {
                    id: format!("{new_sai_id}.ASSIGN"),
                    condition_id: condition_id.clone(),
                    scheduled_instance_id: new_sai_id,
                    instance_type: Some(instance_types::CONDITION_ASSIGNMENT.to_string()),
                });
            }
        }
    }

    async fn resolve_one(&self, normalized: &str) -> Option<RawVerdict> {
        if let Some(cached) = self.cache.get(normalized, "alternative_resolution") {
            return serde_json::from_str(&cached.raw_response).ok();
        }

        let prompt = format!(
            "Does the following scheduled activity name describe a choice between two or more \
             interchangeable procedures, rather than a single procedure (e.g. \"CT or MRI of the \
             chest\" vs. plain \"CT of the chest\")? If so, list each alternative as a standalone \
             procedure name.\n\nActivity name: {normalized}\n\n\
             Respond as JSON: {{\"is_alternative_set\": boolean, \"alternatives\": [string], \
             \"confidence\": number between 0 and 1}}."
        );

        let raw = match self.gateway.call_llm("alternative_resolution", &prompt, true, 512, 0.0).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, activity = %normalized, "alternative resolution LLM call failed");
                return None;
            }
        };

        self.cache.set(
            normalized,
            "alternative_resolution",
            crate::cache::decision_cache::CachedDecision {
                raw_response: raw.clone(),
                json_mode: true,
                provider: "gateway".to_string(),
                model: "alternative_resolution".to_string(),
            },
        );

        match serde_json::from_str::<RawVerdict>(&raw) {
            Ok(verdict) => Some(verdict),
            Err(err) => {
                warn!(error = %err, activity = %normalized, "alternative resolution response unparsable");
                None
            }
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Sanity-check split on literal " or " occurrences; never drives the
/// actual decision ("pattern cross-check, never pattern-driven").
fn pattern_split(name: &str) -> Vec<String> {
    let re = Regex::new(r"(?i)\s+or\s+").expect("static regex");
    re.split(name).map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}

#[allow(dead_code)]
fn unused_value_guard(_: Value) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_split_detects_or_separated_alternatives() {
        let parts = pattern_split("CT or MRI of the chest");
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn pattern_split_single_activity_has_one_part() {
        let parts = pattern_split("Blood draw");
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn normalize_trims_and_lowercases() {
        assert_eq!(normalize("  CT Scan  "), "ct scan");
    }

    #[tokio::test]
    async fn split_activity_replaces_original_with_alternatives_and_condition() {
        let gateway = Arc::new(LlmGateway::new(
            &crate::config::PipelineConfig::for_tests(),
            Arc::new(LlmDecisionCache::open(&std::env::temp_dir().join("alt_resolution_test_cache.json"), "test").unwrap()),
        ));
        let cache = Arc::new(LlmDecisionCache::open(&std::env::temp_dir().join("alt_resolution_test_cache2.json"), "test").unwrap());
        let resolver = AlternativeResolution::new(gateway, cache);

        let mut doc = UsdmDocument::default();
        doc.activities.push(Activity {
            id: "A1".into(),
            name: "CT or MRI of the chest".into(),
            instance_type: Some(instance_types::ACTIVITY.to_string()),
        });
        doc.scheduled_activity_instances.push(crate::domain::usdm::ScheduledActivityInstance {
            id: "SAI1".into(),
            activity_id: "A1".into(),
            encounter_id: "E1".into(),
            footnote_marker: None,
            instance_type: Some(instance_types::SCHEDULED_ACTIVITY_INSTANCE.to_string()),
        });

        let mut next_id = 0u32;
        let original = doc.activities[0].clone();
        resolver.split_activity(&mut doc, &original, &["CT of the chest".to_string(), "MRI of the chest".to_string()], &mut next_id);

        assert!(!doc.activities.iter().any(|a| a.id == "A1"));
        assert_eq!(doc.activities.len(), 2);
        assert_eq!(doc.conditions.len(), 1);
        assert_eq!(doc.condition_assignments.len(), 2);
        assert_eq!(doc.scheduled_activity_instances.len(), 2);
    }
}
