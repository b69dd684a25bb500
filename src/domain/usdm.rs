//! USDM-4.0 structured study model entities.
//!
//! Every entity carries a required `instance_type` discriminator; every
//! `Code`-typed field is a 6-field object. Compliance enforcement
//! (injecting missing discriminators, expanding simple code pairs, checking
//! referential integrity) lives in [`crate::stages::stage7_usdm_compliance`];
//! this module only defines the shapes.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The 6-field `Code` object: `{id, code, decode, codeSystem,
/// codeSystemVersion, instanceType="Code"}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    pub id: String,
    pub code: String,
    pub decode: String,
    pub code_system: String,
    pub code_system_version: String,
    #[serde(default = "Code::instance_type")]
    pub instance_type: String,
}

impl Code {
    fn instance_type() -> String {
        "Code".to_string()
    }

    pub fn new(id: impl Into<String>, code: impl Into<String>, decode: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
            decode: decode.into(),
            code_system: "CDISC".to_string(),
            code_system_version: "2024-09-27".to_string(),
            instance_type: Self::instance_type(),
        }
    }
}

/// A simple `{code, decode}` pair before Code-table expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleCodePair {
    pub code: String,
    pub decode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub instance_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encounter {
    pub id: String,
    pub name: String,
    /// Populated by cycle expansion for encounters generated
    /// from a repeating-cycle pattern such as "Cycle 1-6".
    #[serde(default)]
    pub cycle_number: Option<Code>,
    #[serde(default)]
    pub instance_type: Option<String>,
}

impl Encounter {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            cycle_number: None,
            instance_type: Some(instance_types::ENCOUNTER.to_string()),
        }
    }

    pub fn with_cycle_number(mut self, cycle_number: Code) -> Self {
        self.cycle_number = Some(cycle_number);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledActivityInstance {
    pub id: String,
    pub activity_id: String,
    pub encounter_id: String,
    /// Set when footnote text carries a condition marker for this SAI.
    pub footnote_marker: Option<String>,
    #[serde(default)]
    pub instance_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub id: String,
    #[serde(default)]
    pub instance_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Footnote {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub instance_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub instance_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionAssignment {
    pub id: String,
    pub condition_id: String,
    pub scheduled_instance_id: String,
    #[serde(default)]
    pub instance_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTimeline {
    pub id: String,
    /// References the first encounter.
    pub entry_id: String,
    pub name: String,
    pub main: bool,
    #[serde(default)]
    pub instance_type: Option<String>,
}

/// The full USDM document: a JSON document with top-level
/// arrays, each entry carrying `instanceType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UsdmDocument {
    #[serde(default)]
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub encounters: Vec<Encounter>,
    #[serde(default)]
    pub scheduled_activity_instances: Vec<ScheduledActivityInstance>,
    #[serde(default)]
    pub timings: Vec<Timing>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub condition_assignments: Vec<ConditionAssignment>,
    #[serde(default)]
    pub footnotes: Vec<Footnote>,
    #[serde(default)]
    pub schedule_timelines: Vec<ScheduleTimeline>,
}

impl UsdmDocument {
    /// Referential integrity: every `activityId`,
    /// `conditionId`, `scheduledInstanceEncounterId`, `conditionTargetId`
    /// must reference an existing entity. Returns the set of dangling
    /// references found.
    pub fn find_dangling_references(&self) -> Vec<(String, String)> {
        let activity_ids: HashSet<&str> = self.activities.iter().map(|a| a.id.as_str()).collect();
        let encounter_ids: HashSet<&str> = self.encounters.iter().map(|e| e.id.as_str()).collect();
        let condition_ids: HashSet<&str> = self.conditions.iter().map(|c| c.id.as_str()).collect();
        let sai_ids: HashSet<&str> = self
            .scheduled_activity_instances
            .iter()
            .map(|s| s.id.as_str())
            .collect();

        let mut dangling = Vec::new();

        for sai in &self.scheduled_activity_instances {
            if !activity_ids.contains(sai.activity_id.as_str()) {
                dangling.push(("activityId".to_string(), sai.activity_id.clone()));
            }
            if !encounter_ids.contains(sai.encounter_id.as_str()) {
                dangling.push(("scheduledInstanceEncounterId".to_string(), sai.encounter_id.clone()));
            }
        }

        for assignment in &self.condition_assignments {
            if !condition_ids.contains(assignment.condition_id.as_str()) {
                dangling.push(("conditionId".to_string(), assignment.condition_id.clone()));
            }
            if !sai_ids.contains(assignment.scheduled_instance_id.as_str()) {
                dangling.push(("conditionTargetId".to_string(), assignment.scheduled_instance_id.clone()));
            }
        }

        for timeline in &self.schedule_timelines {
            if !encounter_ids.contains(timeline.entry_id.as_str()) {
                dangling.push(("entryId".to_string(), timeline.entry_id.clone()));
            }
        }

        dangling
    }

    pub fn has_main_timeline(&self) -> bool {
        self.schedule_timelines.iter().any(|t| t.main)
    }
}

/// Canonical `instanceType` discriminators for each entity-type set.
pub mod instance_types {
    pub const ACTIVITY: &str = "Activity";
    pub const ENCOUNTER: &str = "Encounter";
    pub const SCHEDULED_ACTIVITY_INSTANCE: &str = "ScheduledActivityInstance";
    pub const TIMING: &str = "Timing";
    pub const CONDITION: &str = "Condition";
    pub const CONDITION_ASSIGNMENT: &str = "ConditionAssignment";
    pub const FOOTNOTE: &str = "Footnote";
    pub const SCHEDULE_TIMELINE: &str = "ScheduleTimeline";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_object_has_six_fields_including_instance_type() {
        let code = Code::new("c1", "C12345", "Screening Visit");
        let value = serde_json::to_value(&code).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 6);
        assert_eq!(obj["instanceType"], "Code");
    }

    #[test]
    fn referential_integrity_flags_dangling_activity_reference() {
        let mut doc = UsdmDocument::default();
        doc.encounters.push(Encounter {
            id: "E1".into(),
            name: "Visit 1".into(),
            cycle_number: None,
            instance_type: Some(instance_types::ENCOUNTER.to_string()),
        });
        doc.scheduled_activity_instances.push(ScheduledActivityInstance {
            id: "SAI1".into(),
            activity_id: "GHOST_ACTIVITY".into(),
            encounter_id: "E1".into(),
            footnote_marker: None,
            instance_type: Some(instance_types::SCHEDULED_ACTIVITY_INSTANCE.to_string()),
        });

        let dangling = doc.find_dangling_references();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].0, "activityId");
    }

    #[test]
    fn clean_document_has_no_dangling_references() {
        let mut doc = UsdmDocument::default();
        doc.activities.push(Activity {
            id: "A1".into(),
            name: "Blood draw".into(),
            instance_type: Some(instance_types::ACTIVITY.to_string()),
        });
        doc.encounters.push(Encounter {
            id: "E1".into(),
            name: "Visit 1".into(),
            cycle_number: None,
            instance_type: Some(instance_types::ENCOUNTER.to_string()),
        });
        doc.scheduled_activity_instances.push(ScheduledActivityInstance {
            id: "SAI1".into(),
            activity_id: "A1".into(),
            encounter_id: "E1".into(),
            footnote_marker: None,
            instance_type: Some(instance_types::SCHEDULED_ACTIVITY_INSTANCE.to_string()),
        });
        doc.schedule_timelines.push(ScheduleTimeline {
            id: "T1".into(),
            entry_id: "E1".into(),
            name: "Main".into(),
            main: true,
            instance_type: Some(instance_types::SCHEDULE_TIMELINE.to_string()),
        });

        assert!(doc.find_dangling_references().is_empty());
        assert!(doc.has_main_timeline());
    }
}
