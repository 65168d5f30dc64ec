//! Per-instance execution state.
//!
//! The definition tree is never mutated; everything an instance learns during
//! execution lives in its run-state map keyed by activity id. Cursors for
//! compound activities are the `active_children` entries of those run states,
//! which is what makes execution resumable from a persisted snapshot alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::definition::ProcessDefinition;

/// Variable name that, when set in an activity's scope, records the
/// activity-level pass/fail verdict.
pub const PASS_FAIL_VAR: &str = "passFail";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Waiting => "waiting",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::TimedOut
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassFail {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatePassFail {
    AllPass,
    AnyFail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRunState {
    pub status: RunStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_fail: Option<PassFail>,

    /// Activity-scoped variable values
    #[serde(default)]
    pub variables: HashMap<String, JsonValue>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Cursor: currently active child(ren) of a compound activity
    #[serde(default)]
    pub active_children: Vec<String>,

    /// Completed loop iterations (While)
    #[serde(default)]
    pub iterations: u32,
}

impl ActivityRunState {
    pub fn new() -> Self {
        Self {
            status: RunStatus::Pending,
            pass_fail: None,
            variables: HashMap::new(),
            started_at: None,
            completed_at: None,
            error: None,
            active_children: Vec::new(),
            iterations: 0,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = RunStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn complete(&mut self) {
        self.status = RunStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.sync_pass_fail();
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
        self.sync_pass_fail();
    }

    pub fn cancel(&mut self) {
        self.status = RunStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    pub fn time_out(&mut self, error: impl Into<String>) {
        self.status = RunStatus::TimedOut;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
        self.sync_pass_fail();
    }

    /// Lift a `passFail` variable written into this activity's scope onto the
    /// run state itself.
    pub fn sync_pass_fail(&mut self) {
        if let Some(value) = self.variables.get(PASS_FAIL_VAR) {
            match value.as_str() {
                Some("pass") => self.pass_fail = Some(PassFail::Pass),
                Some("fail") => self.pass_fail = Some(PassFail::Fail),
                _ => {}
            }
        }
    }
}

impl Default for ActivityRunState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub definition_id: String,
    pub definition_version: String,
    pub status: InstanceStatus,

    /// Process-scoped variable values
    #[serde(default)]
    pub variables: HashMap<String, JsonValue>,

    /// Run state per activity id
    #[serde(default)]
    pub activities: HashMap<String, ActivityRunState>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_pass_fail: Option<AggregatePassFail>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,

    pub started_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessInstance {
    pub fn new(definition: &ProcessDefinition) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition_id: definition.id.clone(),
            definition_version: definition.version.clone(),
            status: InstanceStatus::Pending,
            variables: HashMap::new(),
            activities: HashMap::new(),
            aggregate_pass_fail: None,
            termination_reason: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn run_state(&self, activity_id: &str) -> Option<&ActivityRunState> {
        self.activities.get(activity_id)
    }

    pub fn run_state_mut(&mut self, activity_id: &str) -> &mut ActivityRunState {
        self.activities
            .entry(activity_id.to_string())
            .or_default()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Roll up explicitly set pass/fail verdicts across executed activities.
    /// Activities that never ran or never set a verdict contribute nothing;
    /// with no verdicts at all the instance has no aggregate value.
    pub fn recompute_aggregate(&mut self) {
        let mut any_pass = false;
        let mut any_fail = false;
        for state in self.activities.values() {
            match state.pass_fail {
                Some(PassFail::Pass) => any_pass = true,
                Some(PassFail::Fail) => any_fail = true,
                None => {}
            }
        }
        self.aggregate_pass_fail = if any_fail {
            Some(AggregatePassFail::AnyFail)
        } else if any_pass {
            Some(AggregatePassFail::AllPass)
        } else {
            None
        };
    }

    /// Outward snapshot: the shape exchanged with callers, with each
    /// activity's definition-time kind alongside its run state.
    pub fn snapshot(&self, definition: &ProcessDefinition) -> JsonValue {
        let activities: serde_json::Map<String, JsonValue> = self
            .activities
            .iter()
            .map(|(id, state)| {
                let kind = definition
                    .node(id)
                    .map(|node| serde_json::to_value(node.kind).unwrap_or(JsonValue::Null))
                    .unwrap_or(JsonValue::Null);
                let entry = serde_json::json!({
                    "type": kind,
                    "status": state.status,
                    "passFail": state.pass_fail,
                    "variables": state.variables,
                    "completedAt": state.completed_at,
                    "error": state.error,
                });
                (id.clone(), entry)
            })
            .collect();

        serde_json::json!({
            "instanceId": self.id,
            "definitionId": self.definition_id,
            "definitionVersion": self.definition_version,
            "status": self.status,
            "startedAt": self.started_at,
            "completedAt": self.completed_at,
            "aggregatePassFail": self.aggregate_pass_fail,
            "terminationReason": self.termination_reason,
            "variables": self.variables,
            "activities": activities,
        })
    }
}
