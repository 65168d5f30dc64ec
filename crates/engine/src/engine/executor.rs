//! One execution strategy per activity kind.
//!
//! Leaf kinds (HumanTask, Compute, RestAPI, Terminate) run to an outcome in
//! [`ActivityExecutor::execute_leaf`]. Compound kinds (Sequence, Flow, If,
//! Case, While) never execute work themselves; [`decide`] inspects the current
//! run states and tells the engine what to do with the cursor next.

use reqwest::Method;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::definition::{ActivityKind, ActivityNode, FieldSpec};
use crate::engine::instance::{ProcessInstance, RunStatus};
use crate::engine::{resolver, script, validator};
use crate::{Error, Result};

const DEFAULT_REST_TIMEOUT_SECS: u64 = 30;

/// Outcome of executing one leaf activity.
#[derive(Debug)]
pub enum LeafOutcome {
    Completed,
    /// Human task activated and awaiting external submission.
    Waiting,
    Failed {
        error: String,
    },
    /// Terminate activity: the whole instance must end now.
    Terminated {
        reason: String,
    },
}

/// What a compound activity wants done with its cursor.
#[derive(Debug)]
pub enum CompoundDecision {
    /// Activate these children (they get pending run states).
    Activate(Vec<String>),
    /// While only: reset the body subtree and run another iteration.
    Reactivate(String),
    /// Active children still working; nothing to decide yet.
    Busy,
    Completed,
    Failed { error: String },
}

#[derive(Debug)]
pub enum SubmitOutcome {
    Accepted,
    /// Validation failed; run state untouched, errors go back to the caller.
    Rejected { errors: Vec<String> },
}

pub struct ActivityExecutor {
    http: reqwest::Client,
}

impl ActivityExecutor {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Execute one leaf activity and record the result on its run state.
    pub async fn execute_leaf(
        &self,
        activity_id: &str,
        node: &ActivityNode,
        instance: &mut ProcessInstance,
    ) -> Result<LeafOutcome> {
        debug!("Executing {:?} activity '{}'", node.kind, activity_id);

        match node.kind {
            ActivityKind::HumanTask => self.activate_human_task(activity_id, instance),
            ActivityKind::Compute => self.execute_compute(activity_id, node, instance),
            ActivityKind::RestApi => self.execute_rest(activity_id, node, instance).await,
            ActivityKind::Terminate => {
                let state = instance.run_state_mut(activity_id);
                state.mark_running();
                state.complete();
                Ok(LeafOutcome::Terminated {
                    reason: node
                        .reason
                        .clone()
                        .unwrap_or_else(|| "terminated by process definition".to_string()),
                })
            }
            _ => Err(Error::Internal(format!(
                "compound activity '{}' dispatched as leaf",
                activity_id
            ))),
        }
    }

    fn activate_human_task(
        &self,
        activity_id: &str,
        instance: &mut ProcessInstance,
    ) -> Result<LeafOutcome> {
        let state = instance.run_state_mut(activity_id);
        state.mark_running();
        Ok(LeafOutcome::Waiting)
    }

    fn execute_compute(
        &self,
        activity_id: &str,
        node: &ActivityNode,
        instance: &mut ProcessInstance,
    ) -> Result<LeafOutcome> {
        let body = node
            .script
            .as_ref()
            .ok_or_else(|| Error::Validation("Compute activity missing script".to_string()))?
            .clone();

        instance.run_state_mut(activity_id).mark_running();

        match script::run_script(&body, instance) {
            Ok(assigned) => {
                // Script assignments land in the activity's scope and surface
                // into process scope for downstream activities.
                for (name, value) in &assigned {
                    instance.variables.insert(name.clone(), value.clone());
                }
                let state = instance.run_state_mut(activity_id);
                state.variables.extend(assigned);
                state.complete();
                Ok(LeafOutcome::Completed)
            }
            Err(e) => {
                let error = e.to_string();
                instance.run_state_mut(activity_id).fail(error.clone());
                Ok(LeafOutcome::Failed { error })
            }
        }
    }

    async fn execute_rest(
        &self,
        activity_id: &str,
        node: &ActivityNode,
        instance: &mut ProcessInstance,
    ) -> Result<LeafOutcome> {
        let url_template = node
            .url
            .as_ref()
            .ok_or_else(|| Error::Validation("RestAPI activity missing url".to_string()))?;
        let method_name = node.method.as_deref().unwrap_or("GET");

        instance.run_state_mut(activity_id).mark_running();

        let request = match self.build_rest_request(method_name, url_template, node, instance) {
            Ok(request) => request,
            Err(error) => {
                instance.run_state_mut(activity_id).fail(error.clone());
                return Ok(LeafOutcome::Failed { error });
            }
        };

        let timeout = Duration::from_secs(node.timeout_seconds.unwrap_or(DEFAULT_REST_TIMEOUT_SECS));

        match request.timeout(timeout).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                let body = serde_json::from_str::<JsonValue>(&text)
                    .unwrap_or(JsonValue::String(text));

                let state = instance.run_state_mut(activity_id);
                state.variables.insert("status".to_string(), status.into());
                state.variables.insert("body".to_string(), body);
                state.complete();
                Ok(LeafOutcome::Completed)
            }
            Err(e) => {
                let error = format!("request failed: {}", e);
                warn!("RestAPI activity '{}' failed: {}", activity_id, e);
                let state = instance.run_state_mut(activity_id);
                if e.is_timeout() {
                    state.time_out(error.clone());
                } else {
                    state.fail(error.clone());
                }
                Ok(LeafOutcome::Failed { error })
            }
        }
    }

    fn build_rest_request(
        &self,
        method_name: &str,
        url_template: &str,
        node: &ActivityNode,
        instance: &ProcessInstance,
    ) -> std::result::Result<reqwest::RequestBuilder, String> {
        let method = Method::from_bytes(method_name.to_uppercase().as_bytes())
            .map_err(|_| format!("invalid HTTP method '{}'", method_name))?;
        let url = resolver::render(url_template, instance).map_err(|e| e.to_string())?;

        let mut request = self.http.request(method, &url);

        for (name, value_template) in node.headers.iter().flatten() {
            let value = resolver::render(value_template, instance).map_err(|e| e.to_string())?;
            request = request.header(name.as_str(), value);
        }

        if let Some(body) = &node.body {
            let body = match body {
                JsonValue::String(template) => {
                    JsonValue::String(resolver::render(template, instance).map_err(|e| e.to_string())?)
                }
                other => {
                    let rendered =
                        resolver::render(&other.to_string(), instance).map_err(|e| e.to_string())?;
                    serde_json::from_str(&rendered).unwrap_or(JsonValue::String(rendered))
                }
            };
            request = request.json(&body);
        }

        Ok(request)
    }

    /// Field specifications merged with any values already in the activity's
    /// scope, for external presentation. Read-only.
    pub fn present_task(
        &self,
        activity_id: &str,
        node: &ActivityNode,
        instance: &ProcessInstance,
    ) -> Vec<FieldSpec> {
        let current = instance
            .run_state(activity_id)
            .map(|state| &state.variables);
        node.fields
            .iter()
            .flatten()
            .map(|field| {
                let mut field = field.clone();
                if let Some(value) = current.and_then(|vars| vars.get(&field.name)) {
                    field.value = Some(value.clone());
                }
                field
            })
            .collect()
    }

    /// Apply an external submission to a waiting human task. On validation
    /// failure the run state is left unchanged so the task can be re-submitted.
    pub fn submit_human_task(
        &self,
        activity_id: &str,
        node: &ActivityNode,
        instance: &mut ProcessInstance,
        values: &HashMap<String, JsonValue>,
    ) -> Result<SubmitOutcome> {
        let fields = node
            .fields
            .as_deref()
            .ok_or_else(|| Error::Validation("HumanTask activity missing fields".to_string()))?;

        let result = validator::validate_fields(fields, values);
        if !result.is_valid {
            return Ok(SubmitOutcome::Rejected {
                errors: result.errors,
            });
        }

        let state = instance.run_state_mut(activity_id);
        for field in fields {
            if let Some(value) = values.get(&field.name) {
                state.variables.insert(field.name.clone(), value.clone());
            }
        }
        state.complete();
        Ok(SubmitOutcome::Accepted)
    }
}

impl Default for ActivityExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Decide what a compound activity should do next given its children's run
/// states. Pure with respect to the instance; the engine applies the decision.
pub fn decide(
    activity_id: &str,
    node: &ActivityNode,
    instance: &ProcessInstance,
) -> Result<CompoundDecision> {
    match node.kind {
        ActivityKind::Sequence => decide_sequence(node, instance),
        ActivityKind::Flow => decide_flow(node, instance),
        ActivityKind::If => decide_if(node, instance, activity_id),
        ActivityKind::Case => decide_case(node, instance, activity_id),
        ActivityKind::While => decide_while(node, instance, activity_id),
        _ => Err(Error::Internal(format!(
            "leaf activity '{}' dispatched as compound",
            activity_id
        ))),
    }
}

/// Children run strictly in declared order; the first failure stops the
/// Sequence immediately.
fn decide_sequence(node: &ActivityNode, instance: &ProcessInstance) -> Result<CompoundDecision> {
    for child in node.children() {
        match instance.run_state(child).map(|s| s.status) {
            Some(RunStatus::Completed) => continue,
            Some(RunStatus::Failed) | Some(RunStatus::TimedOut) => {
                return Ok(child_failure(child, instance));
            }
            Some(RunStatus::Cancelled) => {
                return Ok(CompoundDecision::Failed {
                    error: format!("child activity '{}' was cancelled", child),
                });
            }
            Some(RunStatus::Running) => return Ok(CompoundDecision::Busy),
            Some(RunStatus::Pending) | None => {
                return Ok(CompoundDecision::Activate(vec![child.to_string()]));
            }
        }
    }
    Ok(CompoundDecision::Completed)
}

/// All children are active concurrently. A failed child dooms the Flow, but
/// siblings already dispatched settle to their own terminal states before the
/// Flow's status is finalized.
fn decide_flow(node: &ActivityNode, instance: &ProcessInstance) -> Result<CompoundDecision> {
    let children = node.children();

    // Every child that has not settled stays activated. Missing run states are
    // included so a cursor reset re-attaches the whole concurrent set.
    let open: Vec<String> = children
        .iter()
        .filter(|child| {
            instance
                .run_state(child)
                .map_or(true, |s| !s.status.is_terminal())
        })
        .map(|child| child.to_string())
        .collect();
    if !open.is_empty() {
        return Ok(CompoundDecision::Activate(open));
    }

    for child in &children {
        let status = instance.run_state(child).map(|s| s.status);
        if matches!(
            status,
            Some(RunStatus::Failed) | Some(RunStatus::TimedOut) | Some(RunStatus::Cancelled)
        ) {
            return Ok(child_failure(child, instance));
        }
    }
    Ok(CompoundDecision::Completed)
}

fn decide_if(
    node: &ActivityNode,
    instance: &ProcessInstance,
    activity_id: &str,
) -> Result<CompoundDecision> {
    if let Some(decision) = selected_child_progress(instance, activity_id) {
        return Ok(decision);
    }

    let condition = node
        .condition
        .as_ref()
        .ok_or_else(|| Error::Validation("If activity missing condition".to_string()))?;

    match script::eval_condition(condition, instance) {
        Ok(true) => {
            let then = node
                .then
                .as_ref()
                .ok_or_else(|| Error::Validation("If activity missing then branch".to_string()))?;
            Ok(CompoundDecision::Activate(vec![then.clone()]))
        }
        // Falsy with no else branch completes the If with no child executed.
        Ok(false) => match &node.otherwise {
            Some(otherwise) => Ok(CompoundDecision::Activate(vec![otherwise.clone()])),
            None => Ok(CompoundDecision::Completed),
        },
        Err(e) => Ok(CompoundDecision::Failed {
            error: e.to_string(),
        }),
    }
}

/// First truthy arm wins; no match completes the Case with no child executed.
fn decide_case(
    node: &ActivityNode,
    instance: &ProcessInstance,
    activity_id: &str,
) -> Result<CompoundDecision> {
    if let Some(decision) = selected_child_progress(instance, activity_id) {
        return Ok(decision);
    }

    let arms = node
        .cases
        .as_deref()
        .ok_or_else(|| Error::Validation("Case activity missing cases".to_string()))?;

    for arm in arms {
        match script::eval_condition(&arm.condition, instance) {
            Ok(true) => return Ok(CompoundDecision::Activate(vec![arm.activity.clone()])),
            Ok(false) => continue,
            Err(e) => {
                return Ok(CompoundDecision::Failed {
                    error: e.to_string(),
                })
            }
        }
    }
    Ok(CompoundDecision::Completed)
}

/// Test-before-iteration loop: the condition is evaluated before the first
/// and after every completed iteration of the body.
fn decide_while(
    node: &ActivityNode,
    instance: &ProcessInstance,
    activity_id: &str,
) -> Result<CompoundDecision> {
    let body = node
        .activity
        .as_ref()
        .ok_or_else(|| Error::Validation("While activity missing loop body".to_string()))?;

    let body_status = instance
        .run_state(activity_id)
        .filter(|state| !state.active_children.is_empty())
        .and_then(|_| instance.run_state(body))
        .map(|s| s.status);

    match body_status {
        Some(RunStatus::Failed) | Some(RunStatus::TimedOut) | Some(RunStatus::Cancelled) => {
            return Ok(child_failure(body, instance));
        }
        Some(status) if !status.is_terminal() => return Ok(CompoundDecision::Busy),
        _ => {}
    }

    let condition = node
        .condition
        .as_ref()
        .ok_or_else(|| Error::Validation("While activity missing condition".to_string()))?;

    match script::eval_condition(condition, instance) {
        Ok(true) => {
            if body_status == Some(RunStatus::Completed) {
                Ok(CompoundDecision::Reactivate(body.clone()))
            } else {
                Ok(CompoundDecision::Activate(vec![body.clone()]))
            }
        }
        Ok(false) => Ok(CompoundDecision::Completed),
        Err(e) => Ok(CompoundDecision::Failed {
            error: e.to_string(),
        }),
    }
}

/// Progress of an If/Case's already-selected branch, if any.
fn selected_child_progress(
    instance: &ProcessInstance,
    activity_id: &str,
) -> Option<CompoundDecision> {
    let state = instance.run_state(activity_id)?;
    let child = state.active_children.first()?;
    match instance.run_state(child).map(|s| s.status) {
        Some(RunStatus::Completed) => Some(CompoundDecision::Completed),
        Some(RunStatus::Failed) | Some(RunStatus::TimedOut) => {
            Some(child_failure(child, instance))
        }
        Some(RunStatus::Cancelled) => Some(CompoundDecision::Failed {
            error: format!("child activity '{}' was cancelled", child),
        }),
        _ => Some(CompoundDecision::Busy),
    }
}

fn child_failure(child: &str, instance: &ProcessInstance) -> CompoundDecision {
    let detail = instance
        .run_state(child)
        .and_then(|s| s.error.clone())
        .unwrap_or_else(|| "activity failed".to_string());
    CompoundDecision::Failed {
        error: format!("child activity '{}' failed: {}", child, detail),
    }
}
