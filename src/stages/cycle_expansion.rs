//! Cycle Expansion: turns an encounter name that actually
//! describes a repeating treatment cycle ("Cycle 1-6", "Every 3 weeks x
//! 6") into N concrete per-cycle `Encounter` entries, each tagged with a
//! `cycleNumber` `Code` object, rather than leaving one encounter that
//! silently stands for a whole course of treatment.
//!
//! LLM-first, same posture as [`crate::stages::alternative_resolution`]:
//! the regex cross-check only logs disagreement. Open-ended patterns
//! ("Cycle 4+", "until progression") are never auto-expanded — they are
//! always flagged, since a bounded count cannot be inferred safely.

use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tracing::{instrument, warn};

use crate::cache::decision_cache::CachedDecision;
use crate::cache::LlmDecisionCache;
use crate::domain::usdm::{instance_types, Code, Encounter, UsdmDocument};
use crate::gateway::LlmGateway;

pub const EXPANSION_CONFIDENCE_THRESHOLD: f64 = 0.90;

pub struct CycleExpansion {
    gateway: Arc<LlmGateway>,
    cache: Arc<LlmDecisionCache>,
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    is_repeating_cycle: bool,
    #[serde(default)]
    is_open_ended: bool,
    #[serde(default)]
    cycle_count: Option<u32>,
    #[serde(default)]
    confidence: f64,
}

impl CycleExpansion {
    pub fn new(gateway: Arc<LlmGateway>, cache: Arc<LlmDecisionCache>) -> Self {
        Self { gateway, cache }
    }

    /// Walk every encounter in `doc`, replacing confidently-bounded
    /// repeating-cycle encounters with per-cycle encounters in place.
    /// Returns encounter ids that need manual review: open-ended patterns,
    /// low-confidence verdicts, or LLM failures.
    #[instrument(skip(self, doc), fields(encounter_count = doc.encounters.len()))]
    pub async fn run(&self, doc: &mut UsdmDocument) -> Vec<String> {
        let mut needs_review = Vec::new();
        let original_encounters = doc.encounters.clone();

        for encounter in &original_encounters {
            let normalized = normalize(&encounter.name);
            let pattern_hint = pattern_cycle_count(&encounter.name);
            let verdict = self.classify_one(&normalized).await;

            if let Some(v) = &verdict {
                if v.is_repeating_cycle != pattern_hint.is_some() {
                    warn!(
                        encounter_id = %encounter.id,
                        llm_decision = v.is_repeating_cycle,
                        pattern_hint = pattern_hint.is_some(),
                        "cycle expansion: LLM verdict disagrees with pattern cross-check"
                    );
                }
            }

            let Some(verdict) = verdict else {
                needs_review.push(encounter.id.clone());
                continue;
            };

            if !verdict.is_repeating_cycle {
                continue;
            }

            if verdict.is_open_ended {
                needs_review.push(encounter.id.clone());
                continue;
            }

            let Some(count) = verdict.cycle_count else {
                needs_review.push(encounter.id.clone());
                continue;
            };

            if verdict.confidence < EXPANSION_CONFIDENCE_THRESHOLD || count < 2 {
                needs_review.push(encounter.id.clone());
                continue;
            }

            self.expand_encounter(doc, encounter, count);
        }

        needs_review
    }

    fn expand_encounter(&self, doc: &mut UsdmDocument, original: &Encounter, count: u32) {
        doc.encounters.retain(|e| e.id != original.id);

        let base_name = strip_cycle_suffix(&original.name);
        let mut new_ids = Vec::with_capacity(count as usize);

        for cycle in 1..=count {
            let new_id = format!("{}.CYCLE{}", original.id, cycle);
            let cycle_code = Code::new(
                format!("{new_id}.CODE"),
                cycle.to_string(),
                format!("Cycle {cycle}"),
            );
            doc.encounters.push(
                Encounter::new(new_id.clone(), format!("{base_name} — Cycle {cycle}")).with_cycle_number(cycle_code),
            );
            new_ids.push(new_id);
        }

        for sai in &mut doc.scheduled_activity_instances {
            if sai.encounter_id == original.id {
                if let Some(first) = new_ids.first() {
                    sai.encounter_id = first.clone();
                }
            }
        }

        for timeline in &mut doc.schedule_timelines {
            if timeline.entry_id == original.id {
                if let Some(first) = new_ids.first() {
                    timeline.entry_id = first.clone();
                }
            }
        }

        let _ = instance_types::ENCOUNTER;
    }

    async fn classify_one(&self, normalized: &str) -> Option<RawVerdict> {
        if let Some(cached) = self.cache.get(normalized, "cycle_expansion") {
            return serde_json::from_str(&cached.raw_response).ok();
        }

        let prompt = format!(
            "Does the following encounter name describe a bounded, repeating treatment cycle \
             (e.g. \"Cycle 1-6\", \"Every 3 weeks for 6 cycles\"), an open-ended repeating pattern \
             (e.g. \"Cycle 4+\", \"until progression\"), or a single, non-repeating visit?\n\n\
             Encounter name: {normalized}\n\n\
             Respond as JSON: {{\"is_repeating_cycle\": boolean, \"is_open_ended\": boolean, \
             \"cycle_count\": integer or null, \"confidence\": number between 0 and 1}}."
        );

        let raw = match self.gateway.call_llm("cycle_expansion", &prompt, true, 512, 0.0).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, encounter = %normalized, "cycle expansion LLM call failed");
                return None;
            }
        };

        self.cache.set(
            normalized,
            "cycle_expansion",
            CachedDecision {
                raw_response: raw.clone(),
                json_mode: true,
                provider: "gateway".to_string(),
                model: "cycle_expansion".to_string(),
            },
        );

        match serde_json::from_str::<RawVerdict>(&raw) {
            Ok(verdict) => Some(verdict),
            Err(err) => {
                warn!(error = %err, encounter = %normalized, "cycle expansion response unparsable");
                None
            }
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Sanity-check bounded cycle counts from literal "Cycle N-M" / "x N" text;
/// returns `None` for open-ended or non-cycle text. Never drives the
/// decision, only cross-checked against it.
fn pattern_cycle_count(name: &str) -> Option<u32> {
    let range_re = Regex::new(r"(?i)cycle\s*\d+\s*-\s*(\d+)").expect("static regex");
    if let Some(caps) = range_re.captures(name) {
        return caps.get(1)?.as_str().parse().ok();
    }
    let times_re = Regex::new(r"(?i)[x×]\s*(\d+)\b").expect("static regex");
    if let Some(caps) = times_re.captures(name) {
        return caps.get(1)?.as_str().parse().ok();
    }
    None
}

fn strip_cycle_suffix(name: &str) -> String {
    let re = Regex::new(r"(?i)\s*cycle\s*\d+(\s*-\s*\d+)?\s*").expect("static regex");
    let stripped = re.replace_all(name, " ");
    stripped.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_cycle_count_detects_bounded_range() {
        assert_eq!(pattern_cycle_count("Cycle 1-6 Visit"), Some(6));
    }

    #[test]
    fn pattern_cycle_count_detects_multiplier_form() {
        assert_eq!(pattern_cycle_count("Every 3 weeks x 6"), Some(6));
    }

    #[test]
    fn pattern_cycle_count_none_for_open_ended() {
        assert_eq!(pattern_cycle_count("Cycle 4+"), None);
    }

    #[test]
    fn strip_cycle_suffix_removes_cycle_marker() {
        assert_eq!(strip_cycle_suffix("Treatment Cycle 1-6"), "Treatment");
    }

    #[tokio::test]
    async fn expand_encounter_creates_one_per_cycle_with_codes() {
        let gateway = Arc::new(LlmGateway::new(
            &crate::config::PipelineConfig::for_tests(),
            Arc::new(LlmDecisionCache::open(&std::env::temp_dir().join("cycle_expansion_test_cache.json"), "test").unwrap()),
        ));
        let cache = Arc::new(LlmDecisionCache::open(&std::env::temp_dir().join("cycle_expansion_test_cache2.json"), "test").unwrap());
        let expander = CycleExpansion::new(gateway, cache);

        let mut doc = UsdmDocument::default();
        doc.encounters.push(Encounter::new("E1", "Treatment Cycle 1-6"));
        doc.scheduled_activity_instances.push(crate::domain::usdm::ScheduledActivityInstance {
            id: "SAI1".into(),
            activity_id: "A1".into(),
            encounter_id: "E1".into(),
            footnote_marker: None,
            instance_type: Some(instance_types::SCHEDULED_ACTIVITY_INSTANCE.to_string()),
        });

        let original = doc.encounters[0].clone();
        expander.expand_encounter(&mut doc, &original, 6);

        assert_eq!(doc.encounters.len(), 6);
        assert!(doc.encounters.iter().all(|e| e.cycle_number.is_some()));
        assert_eq!(doc.scheduled_activity_instances[0].encounter_id, "E1.CYCLE1");
    }
}
