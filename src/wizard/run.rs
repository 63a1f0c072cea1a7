// Cross-request state of one in-progress wizard run
// Owned by a single session; serialized explicitly into run storage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Validated field values of one completed step
pub type StepData = BTreeMap<String, String>;

/// Typed scratch space carried across steps.
/// Replaces the ad hoc nested mapping the flows would otherwise grow:
/// every cross-step value has a named home here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunExtra {
    /// Ephemeral secrets keyed by slot name, hex-encoded.
    /// Never persisted past the run unless `done` commits them.
    pub keys: BTreeMap<String, String>,
    /// Per-step metadata recorded during validation
    pub step_metadata: BTreeMap<String, serde_json::Value>,
    /// Explicitly chosen challenge device for login verification
    pub challenge_device: Option<Uuid>,
}

/// One in-progress flow for one session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WizardRun {
    pub id: Uuid,
    /// Name of the flow this run belongs to
    pub flow: String,
    /// Authenticated owner, set at begin for enrollment flows.
    /// Login runs have no owner until the primary credential validates.
    pub user_id: Option<Uuid>,
    pub current_step: String,
    /// Validated data keyed by step name
    pub validated_step_data: BTreeMap<String, StepData>,
    pub extra: RunExtra,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

impl WizardRun {
    pub fn new(flow: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow: flow.to_string(),
            user_id: None,
            current_step: String::new(),
            validated_step_data: BTreeMap::new(),
            extra: RunExtra::default(),
            completed: false,
            created_at: Utc::now(),
        }
    }

    pub fn step_data(&self, step: &str) -> Option<&StepData> {
        self.validated_step_data.get(step)
    }

    pub fn set_step_data(&mut self, step: &str, data: StepData) {
        self.validated_step_data.insert(step.to_string(), data);
    }

    pub fn clear_step_data(&mut self, step: &str) {
        self.validated_step_data.remove(step);
    }

    /// A single validated field value, if the step completed
    pub fn field(&self, step: &str, field: &str) -> Option<&str> {
        self.step_data(step)
            .and_then(|data| data.get(field))
            .map(|s| s.as_str())
    }
}
