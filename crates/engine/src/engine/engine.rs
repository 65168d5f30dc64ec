//! Checkpointed tree-walking execution.
//!
//! Each `step` call advances one schedulable unit of work: settle compound
//! cursors downward from the start activity, execute the pending leaves on the
//! active frontier, settle completions back upward, then persist. Because the
//! whole cursor lives in the run-state map, an instance can be resumed from
//! its persisted document at any checkpoint.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::definition::{ActivityKind, FieldSpec, ProcessDefinition};
use crate::engine::executor::{
    self, ActivityExecutor, CompoundDecision, LeafOutcome, SubmitOutcome,
};
use crate::engine::instance::{InstanceStatus, ProcessInstance, RunStatus};
use crate::store::Store;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub status: InstanceStatus,
    pub message: String,
}

/// The human task an instance is currently waiting on, shaped for
/// presentation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentTask {
    pub activity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub fields: Vec<FieldSpec>,
}

pub struct ProcessEngine {
    store: Arc<dyn Store>,
    executor: ActivityExecutor,
    /// Per-instance locks serialize step/submit/navigate on the same instance.
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ProcessEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            executor: ActivityExecutor::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn instance_lock(&self, instance_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(instance_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Terminal instances never mutate again, so their lock entry can go.
    /// Late waiters on the old mutex re-load the instance and observe the
    /// terminal status.
    async fn evict_lock_if_terminal(&self, instance: &ProcessInstance) {
        if instance.is_terminal() {
            self.locks.lock().await.remove(&instance.id);
        }
    }

    /// Validate and persist a definition document.
    pub async fn deploy_definition(&self, document: JsonValue) -> Result<ProcessDefinition> {
        let definition: ProcessDefinition = serde_json::from_value(document)?;
        if let Err(errors) = definition.validate() {
            return Err(Error::Validation(errors.join("; ")));
        }
        self.store.save_definition(&definition).await?;
        info!(
            "Deployed definition '{}' version {}",
            definition.id, definition.version
        );
        Ok(definition)
    }

    /// Create a fresh instance of a deployed definition. No activity runs
    /// until the first step.
    pub async fn create_instance(&self, definition_id: &str) -> Result<ProcessInstance> {
        let definition = self
            .store
            .get_definition(definition_id)
            .await?
            .ok_or_else(|| Error::DefinitionNotFound(definition_id.to_string()))?;
        let instance = ProcessInstance::new(&definition);
        self.store.save_instance(&instance).await?;
        info!(
            "Created instance {} of definition '{}'",
            instance.id, definition.id
        );
        Ok(instance)
    }

    /// A new instance of the same definition; the source instance is left
    /// untouched.
    pub async fn rerun(&self, instance_id: Uuid) -> Result<ProcessInstance> {
        let (_, instance) = self.load(instance_id).await?;
        self.create_instance(&instance.definition_id).await
    }

    pub async fn instance_snapshot(&self, instance_id: Uuid) -> Result<JsonValue> {
        let (definition, instance) = self.load(instance_id).await?;
        Ok(instance.snapshot(&definition))
    }

    /// Advance the instance by one unit of work and persist the result.
    pub async fn step(&self, instance_id: Uuid) -> Result<StepOutcome> {
        let _guard = self.instance_lock(instance_id).await;
        let (definition, mut instance) = self.load(instance_id).await?;

        if instance.is_terminal() {
            self.evict_lock_if_terminal(&instance).await;
            return Ok(StepOutcome {
                status: instance.status,
                message: format!("instance is already {}", instance.status),
            });
        }
        if instance.status == InstanceStatus::Pending {
            instance.status = InstanceStatus::Running;
        }

        self.settle(&definition, &mut instance)?;

        let mut frontier = Vec::new();
        collect_frontier(&definition, &instance, &definition.start, &mut frontier)?;

        let mut messages: Vec<String> = Vec::new();
        let mut terminated: Option<String> = None;

        for activity_id in &frontier {
            let node = definition
                .node(activity_id)
                .ok_or_else(|| undeclared(activity_id))?;
            let status = instance
                .run_state(activity_id)
                .map(|s| s.status)
                .unwrap_or(RunStatus::Pending);

            match status {
                RunStatus::Pending => {
                    match self
                        .executor
                        .execute_leaf(activity_id, node, &mut instance)
                        .await?
                    {
                        LeafOutcome::Completed => {
                            messages.push(format!("executed activity '{}'", activity_id))
                        }
                        LeafOutcome::Waiting => {
                            messages.push(format!("waiting on human task '{}'", activity_id))
                        }
                        LeafOutcome::Failed { error } => {
                            messages.push(format!("activity '{}' failed: {}", activity_id, error))
                        }
                        LeafOutcome::Terminated { reason } => {
                            terminated = Some(reason);
                            break;
                        }
                    }
                }
                RunStatus::Running if node.kind == ActivityKind::HumanTask => {
                    if self.expire_overdue_task(activity_id, node, &mut instance) {
                        messages.push(format!("human task '{}' timed out", activity_id));
                    } else {
                        messages.push(format!("waiting on human task '{}'", activity_id));
                    }
                }
                _ => {}
            }
        }

        if let Some(reason) = terminated {
            messages.push(format!("instance terminated: {}", reason));
            terminate(&mut instance, reason);
        } else {
            self.settle(&definition, &mut instance)?;
            refresh_status(&definition, &mut instance)?;
        }
        instance.recompute_aggregate();
        self.store.save_instance(&instance).await?;
        self.evict_lock_if_terminal(&instance).await;

        let message = if messages.is_empty() {
            "no activities eligible to run".to_string()
        } else {
            messages.join("; ")
        };
        debug!("Stepped instance {}: {}", instance.id, message);
        Ok(StepOutcome {
            status: instance.status,
            message,
        })
    }

    /// The human task currently awaiting input, if any. Read-only and
    /// idempotent: repeated calls observe identical state.
    pub async fn get_current_task(&self, instance_id: Uuid) -> Result<Option<CurrentTask>> {
        let (definition, instance) = self.load(instance_id).await?;

        let mut frontier = Vec::new();
        collect_frontier(&definition, &instance, &definition.start, &mut frontier)?;

        for activity_id in frontier {
            let node = definition
                .node(&activity_id)
                .ok_or_else(|| undeclared(&activity_id))?;
            if node.kind != ActivityKind::HumanTask {
                continue;
            }
            let awaiting = instance.run_state(&activity_id).map_or(false, |s| {
                matches!(s.status, RunStatus::Pending | RunStatus::Running)
            });
            if awaiting {
                return Ok(Some(CurrentTask {
                    fields: self.executor.present_task(&activity_id, node, &instance),
                    name: node.name.clone(),
                    activity_id,
                }));
            }
        }
        Ok(None)
    }

    /// Apply an external submission to a waiting human task. On acceptance the
    /// task completes and the instance is eligible to continue on the next
    /// step; on rejection nothing changes.
    pub async fn submit_task(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        values: &HashMap<String, JsonValue>,
    ) -> Result<SubmitOutcome> {
        let _guard = self.instance_lock(instance_id).await;
        let (definition, mut instance) = self.load(instance_id).await?;

        if instance.is_terminal() {
            self.evict_lock_if_terminal(&instance).await;
            return Err(Error::InvalidTransition(format!(
                "instance is already {}",
                instance.status
            )));
        }
        let node = definition
            .node(activity_id)
            .ok_or_else(|| Error::Validation(format!("unknown activity '{}'", activity_id)))?;
        if node.kind != ActivityKind::HumanTask {
            return Err(Error::Validation(format!(
                "activity '{}' is not a human task",
                activity_id
            )));
        }
        let status = instance.run_state(activity_id).map(|s| s.status);
        if !matches!(status, Some(RunStatus::Pending) | Some(RunStatus::Running)) {
            return Err(Error::InvalidTransition(format!(
                "human task '{}' is not awaiting input",
                activity_id
            )));
        }

        match self
            .executor
            .submit_human_task(activity_id, node, &mut instance, values)?
        {
            SubmitOutcome::Accepted => {
                self.store.save_instance(&instance).await?;
                info!(
                    "Accepted submission for task '{}' on instance {}",
                    activity_id, instance.id
                );
                Ok(SubmitOutcome::Accepted)
            }
            rejected => Ok(rejected),
        }
    }

    /// Reset cursors to the start activity without discarding any terminal
    /// run state. The next step re-derives the active path, skipping work
    /// that already completed.
    pub async fn navigate_to_start(&self, instance_id: Uuid) -> Result<StepOutcome> {
        let _guard = self.instance_lock(instance_id).await;
        let (_, mut instance) = self.load(instance_id).await?;

        for state in instance.activities.values_mut() {
            if !state.status.is_terminal() {
                state.status = RunStatus::Pending;
                state.active_children.clear();
            }
        }
        if !instance.is_terminal() {
            instance.status = InstanceStatus::Running;
        }
        self.store.save_instance(&instance).await?;
        self.evict_lock_if_terminal(&instance).await;
        Ok(StepOutcome {
            status: instance.status,
            message: "cursor repositioned at start".to_string(),
        })
    }

    /// Walk the activity tree in canonical order and reposition cursors at
    /// the first activity that has not reached a terminal run state.
    pub async fn navigate_to_next_pending(&self, instance_id: Uuid) -> Result<StepOutcome> {
        let _guard = self.instance_lock(instance_id).await;
        let (definition, mut instance) = self.load(instance_id).await?;

        let mut path = Vec::new();
        let target = find_pending(&definition, &instance, &definition.start, &mut path)?;

        let Some(target) = target else {
            self.evict_lock_if_terminal(&instance).await;
            return Ok(StepOutcome {
                status: instance.status,
                message: "no pending activities remain".to_string(),
            });
        };

        for pair in path.windows(2) {
            let (parent, child) = (&pair[0], &pair[1]);
            let concurrent = definition
                .node(parent)
                .map_or(false, |node| node.kind == ActivityKind::Flow);
            let state = instance.run_state_mut(parent);
            state.mark_running();
            if concurrent {
                if !state.active_children.contains(child) {
                    state.active_children.push(child.clone());
                }
            } else {
                state.active_children = vec![child.clone()];
            }
        }
        instance.run_state_mut(&target);
        if !instance.is_terminal() {
            instance.status = InstanceStatus::Running;
        }
        self.store.save_instance(&instance).await?;
        Ok(StepOutcome {
            status: instance.status,
            message: format!("cursor positioned at '{}'", target),
        })
    }

    async fn load(&self, instance_id: Uuid) -> Result<(ProcessDefinition, ProcessInstance)> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(Error::InstanceNotFound(instance_id))?;
        let definition = self
            .store
            .get_definition(&instance.definition_id)
            .await?
            .ok_or_else(|| Error::DefinitionNotFound(instance.definition_id.clone()))?;
        Ok((definition, instance))
    }

    /// Propagate run-state changes through the compound tree until nothing
    /// moves: activate eligible children downward, roll completions and
    /// failures upward.
    fn settle(&self, definition: &ProcessDefinition, instance: &mut ProcessInstance) -> Result<()> {
        loop {
            let mut changed = false;
            self.settle_visit(definition, instance, &definition.start, &mut changed)?;
            if !changed {
                break;
            }
        }
        Ok(())
    }

    fn settle_visit(
        &self,
        definition: &ProcessDefinition,
        instance: &mut ProcessInstance,
        id: &str,
        changed: &mut bool,
    ) -> Result<()> {
        let node = definition.node(id).ok_or_else(|| undeclared(id))?;

        if instance.run_state(id).is_none() {
            instance.run_state_mut(id);
            *changed = true;
        }
        if !node.is_compound() {
            return Ok(());
        }
        if instance
            .run_state(id)
            .map_or(false, |s| s.status.is_terminal())
        {
            return Ok(());
        }

        match executor::decide(id, node, instance)? {
            CompoundDecision::Activate(children) => {
                // A Flow's cursor spans every child; other compounds point at
                // the single child being activated.
                let cursor: Vec<String> = if node.kind == ActivityKind::Flow {
                    node.children().iter().map(|c| c.to_string()).collect()
                } else {
                    children.clone()
                };
                {
                    let state = instance.run_state_mut(id);
                    if state.status != RunStatus::Running {
                        state.mark_running();
                        *changed = true;
                    }
                    if state.active_children != cursor {
                        state.active_children = cursor;
                        *changed = true;
                    }
                }
                for child in &children {
                    self.settle_visit(definition, instance, child, changed)?;
                }
            }
            CompoundDecision::Reactivate(body) => {
                reset_subtree(definition, instance, &body);
                let state = instance.run_state_mut(id);
                state.iterations += 1;
                state.active_children = vec![body.clone()];
                *changed = true;
                self.settle_visit(definition, instance, &body, changed)?;
            }
            CompoundDecision::Busy => {
                let active = instance
                    .run_state(id)
                    .map(|s| s.active_children.clone())
                    .unwrap_or_default();
                for child in active {
                    self.settle_visit(definition, instance, &child, changed)?;
                }
            }
            CompoundDecision::Completed => {
                instance.run_state_mut(id).complete();
                *changed = true;
            }
            CompoundDecision::Failed { error } => {
                instance.run_state_mut(id).fail(error);
                *changed = true;
            }
        }
        Ok(())
    }

    /// Time out a running human task whose deadline has passed. Returns true
    /// if the task was expired.
    fn expire_overdue_task(
        &self,
        activity_id: &str,
        node: &crate::definition::ActivityNode,
        instance: &mut ProcessInstance,
    ) -> bool {
        let Some(timeout) = node.timeout_seconds else {
            return false;
        };
        let overdue = instance
            .run_state(activity_id)
            .and_then(|s| s.started_at)
            .map_or(false, |started| {
                Utc::now() - started > chrono::Duration::seconds(timeout as i64)
            });
        if overdue {
            instance
                .run_state_mut(activity_id)
                .time_out(format!("human task '{}' timed out", activity_id));
        }
        overdue
    }
}

/// Active leaves in canonical order, following compound cursors.
fn collect_frontier(
    definition: &ProcessDefinition,
    instance: &ProcessInstance,
    id: &str,
    out: &mut Vec<String>,
) -> Result<()> {
    let node = definition.node(id).ok_or_else(|| undeclared(id))?;
    if instance
        .run_state(id)
        .map_or(false, |s| s.status.is_terminal())
    {
        return Ok(());
    }
    if node.is_compound() {
        let active = instance
            .run_state(id)
            .map(|s| s.active_children.clone())
            .unwrap_or_default();
        for child in &active {
            collect_frontier(definition, instance, child, out)?;
        }
    } else {
        out.push(id.to_string());
    }
    Ok(())
}

/// First leaf in canonical order whose run state is not terminal, skipping
/// subtrees that already settled. `path` accumulates root-to-target ids.
fn find_pending(
    definition: &ProcessDefinition,
    instance: &ProcessInstance,
    id: &str,
    path: &mut Vec<String>,
) -> Result<Option<String>> {
    let node = definition.node(id).ok_or_else(|| undeclared(id))?;
    if instance
        .run_state(id)
        .map_or(false, |s| s.status.is_terminal())
    {
        return Ok(None);
    }
    path.push(id.to_string());
    if !node.is_compound() {
        return Ok(Some(id.to_string()));
    }
    for child in node.children() {
        if let Some(found) = find_pending(definition, instance, child, path)? {
            return Ok(Some(found));
        }
    }
    path.pop();
    Ok(None)
}

/// Derive the instance status from the root run state and the frontier.
fn refresh_status(definition: &ProcessDefinition, instance: &mut ProcessInstance) -> Result<()> {
    if instance.status == InstanceStatus::Cancelled {
        return Ok(());
    }
    match instance.run_state(&definition.start).map(|s| s.status) {
        Some(RunStatus::Completed) => {
            instance.status = InstanceStatus::Completed;
            instance.completed_at = Some(Utc::now());
        }
        Some(RunStatus::Failed) | Some(RunStatus::TimedOut) => {
            instance.status = InstanceStatus::Failed;
            instance.completed_at = Some(Utc::now());
        }
        Some(RunStatus::Cancelled) => {
            instance.status = InstanceStatus::Cancelled;
            instance.completed_at = Some(Utc::now());
        }
        _ => {
            let mut frontier = Vec::new();
            collect_frontier(definition, instance, &definition.start, &mut frontier)?;
            let all_waiting = !frontier.is_empty()
                && frontier.iter().all(|id| {
                    definition
                        .node(id)
                        .map_or(false, |n| n.kind == ActivityKind::HumanTask)
                        && instance
                            .run_state(id)
                            .map_or(false, |s| s.status == RunStatus::Running)
                });
            instance.status = if all_waiting {
                InstanceStatus::Waiting
            } else {
                InstanceStatus::Running
            };
        }
    }
    Ok(())
}

/// Terminate: cancel everything still in flight and record the reason.
fn terminate(instance: &mut ProcessInstance, reason: String) {
    for state in instance.activities.values_mut() {
        if !state.status.is_terminal() {
            state.cancel();
        }
    }
    instance.status = InstanceStatus::Cancelled;
    instance.termination_reason = Some(reason);
    instance.completed_at = Some(Utc::now());
}

/// Drop the run states of an activity and its whole subtree, so a While body
/// starts its next iteration from scratch.
fn reset_subtree(definition: &ProcessDefinition, instance: &mut ProcessInstance, root: &str) {
    let mut stack = vec![root.to_string()];
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        instance.activities.remove(&id);
        if let Some(node) = definition.node(&id) {
            for child in node.children() {
                stack.push(child.to_string());
            }
        }
    }
}

fn undeclared(id: &str) -> Error {
    Error::Internal(format!("cursor references undeclared activity '{}'", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_lock_entry_is_dropped_once_terminal() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let engine = ProcessEngine::new(store);
        engine
            .deploy_definition(json!({
                "id": "seq", "name": "Seq", "start": "root",
                "activities": {
                    "root": { "type": "Sequence", "activities": ["a", "b"] },
                    "a": { "type": "Compute", "script": "x = 1" },
                    "b": { "type": "Compute", "script": "y = x + 1" }
                }
            }))
            .await
            .unwrap();
        let instance = engine.create_instance("seq").await.unwrap();

        let outcome = engine.step(instance.id).await.unwrap();
        assert_eq!(outcome.status, InstanceStatus::Running);
        assert_eq!(engine.locks.lock().await.len(), 1);

        let outcome = engine.step(instance.id).await.unwrap();
        assert_eq!(outcome.status, InstanceStatus::Completed);
        assert!(engine.locks.lock().await.is_empty());

        // A late step on the terminal instance does not leave an entry behind.
        engine.step(instance.id).await.unwrap();
        assert!(engine.locks.lock().await.is_empty());
    }
}
