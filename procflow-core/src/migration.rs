//! Instance migration: re-pointing the execution tree of running instances
//! from one process definition's activities to another's, preserving tree
//! shape and variable scopes.
//!
//! A plan maps source activities to target activities. `validate_plan`
//! collects every violation for an instance instead of failing fast; `apply`
//! runs one transaction per instance, so a bad instance is reported and
//! skipped while the rest of the batch proceeds.

use crate::clock::Clock;
use crate::definition::{Activity, Behavior, ListenerEvent, ProcessDefinition};
use crate::error::EngineError;
use crate::ops::Interpreter;
use crate::tree::ExecutionTree;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

// ─── Plan ─────────────────────────────────────────────────────

/// One activity mapping. `explicit` marks caller-supplied instructions,
/// which are allowed to change scope depth; generated ones are not.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrationInstruction {
    pub source_activity_id: ActivityId,
    pub target_activity_id: ActivityId,
    /// Re-create event subscriptions at the target activity's trigger.
    pub update_event_trigger: bool,
    pub explicit: bool,
}

impl MigrationInstruction {
    pub fn new(source: impl Into<ActivityId>, target: impl Into<ActivityId>) -> Self {
        Self {
            source_activity_id: source.into(),
            target_activity_id: target.into(),
            update_event_trigger: false,
            explicit: true,
        }
    }

    pub fn update_event_trigger(mut self, update: bool) -> Self {
        self.update_event_trigger = update;
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub source_definition_id: DefinitionId,
    pub target_definition_id: DefinitionId,
    pub instructions: Vec<MigrationInstruction>,
    /// Skip start/end listeners of scopes created or removed by the switch.
    pub skip_custom_listeners: bool,
    /// Skip input/output mappings of scopes created or removed by the switch.
    pub skip_io_mappings: bool,
}

impl MigrationPlan {
    pub fn new(
        source_definition_id: impl Into<DefinitionId>,
        target_definition_id: impl Into<DefinitionId>,
    ) -> Self {
        Self {
            source_definition_id: source_definition_id.into(),
            target_definition_id: target_definition_id.into(),
            instructions: Vec::new(),
            skip_custom_listeners: false,
            skip_io_mappings: false,
        }
    }

    pub fn instruction(mut self, instruction: MigrationInstruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    pub fn instruction_for(&self, source_activity_id: &str) -> Option<&MigrationInstruction> {
        self.instructions
            .iter()
            .find(|i| i.source_activity_id == source_activity_id)
    }

    /// The reverse plan, for moving instances back.
    pub fn inverse(&self) -> MigrationPlan {
        MigrationPlan {
            source_definition_id: self.target_definition_id.clone(),
            target_definition_id: self.source_definition_id.clone(),
            instructions: self
                .instructions
                .iter()
                .map(|i| MigrationInstruction {
                    source_activity_id: i.target_activity_id.clone(),
                    target_activity_id: i.source_activity_id.clone(),
                    update_event_trigger: i.update_event_trigger,
                    explicit: i.explicit,
                })
                .collect(),
            skip_custom_listeners: self.skip_custom_listeners,
            skip_io_mappings: self.skip_io_mappings,
        }
    }
}

// ─── Generation ───────────────────────────────────────────────

/// Pairing heuristic for automatic plan generation. Deliberately pluggable:
/// the default is conservative, callers with better knowledge override it.
pub trait ActivityMatcher: Send + Sync {
    fn matches(&self, source: &Activity, target: &Activity) -> bool;
}

/// Same id, same behavior kind.
#[derive(Debug, Default)]
pub struct EqualActivityMatcher;

impl ActivityMatcher for EqualActivityMatcher {
    fn matches(&self, source: &Activity, target: &Activity) -> bool {
        source.id == target.id && source.behavior.kind() == target.behavior.kind()
    }
}

/// Heuristically pair activities of two definitions into a plan.
pub fn generate_plan(
    source: &ProcessDefinition,
    target: &ProcessDefinition,
    matcher: &dyn ActivityMatcher,
) -> MigrationPlan {
    let mut plan = MigrationPlan::new(source.id.clone(), target.id.clone());
    for s in source.activities() {
        if let Some(t) = target.activities().find(|t| matcher.matches(s, t)) {
            plan.instructions.push(MigrationInstruction {
                source_activity_id: s.id.clone(),
                target_activity_id: t.id.clone(),
                update_event_trigger: false,
                explicit: false,
            });
        }
    }
    plan
}

// ─── Validation ───────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationViolation {
    InstanceNotFound,
    /// A running execution's current activity has no mapping.
    UnmappedActivity {
        execution_id: ExecutionId,
        activity_id: ActivityId,
    },
    UnknownTargetActivity {
        source_activity_id: ActivityId,
        target_activity_id: ActivityId,
    },
    BehaviorMismatch {
        source_activity_id: ActivityId,
        target_activity_id: ActivityId,
    },
    /// Depth change requested by a generated (non-explicit) instruction.
    ScopeDepthChange {
        source_activity_id: ActivityId,
        target_activity_id: ActivityId,
    },
    /// An in-flight transition has no counterpart in the target definition.
    UnmappedTransition {
        execution_id: ExecutionId,
        transition_id: TransitionId,
    },
}

#[derive(Clone, Debug, Default)]
pub struct MigrationReport {
    pub migrated: Vec<ExecutionId>,
    pub failed: Vec<InstanceMigrationFailure>,
}

#[derive(Clone, Debug)]
pub struct InstanceMigrationFailure {
    pub process_instance_id: ExecutionId,
    pub violations: Vec<MigrationViolation>,
}

/// Collect every violation that would make `apply` unsafe for this instance.
pub fn validate_plan(
    plan: &MigrationPlan,
    source: &ProcessDefinition,
    target: &ProcessDefinition,
    tree: &ExecutionTree,
) -> Vec<MigrationViolation> {
    let mut violations = Vec::new();
    let mut seen_unmapped: HashSet<ActivityId> = HashSet::new();

    for exec in tree.executions() {
        if let Some(transition_id) = &exec.transition_id {
            if target.try_transition(transition_id).is_none() {
                violations.push(MigrationViolation::UnmappedTransition {
                    execution_id: exec.id,
                    transition_id: transition_id.clone(),
                });
            }
            continue;
        }
        let Some(activity_id) = &exec.activity_id else { continue };

        // Scope frames and their placeholders follow their children
        // structurally; only the actual tokens need a mapping.
        let is_structural_frame = source
            .try_activity(activity_id)
            .map(|a| a.scope)
            .unwrap_or(false)
            && !tree.children(exec.id).is_empty();
        let instruction = match plan.instruction_for(activity_id) {
            Some(i) => i,
            None if is_structural_frame => continue,
            None => {
                if seen_unmapped.insert(activity_id.clone()) {
                    violations.push(MigrationViolation::UnmappedActivity {
                        execution_id: exec.id,
                        activity_id: activity_id.clone(),
                    });
                }
                continue;
            }
        };

        let Some(target_act) = target.try_activity(&instruction.target_activity_id) else {
            violations.push(MigrationViolation::UnknownTargetActivity {
                source_activity_id: activity_id.clone(),
                target_activity_id: instruction.target_activity_id.clone(),
            });
            continue;
        };
        if let Some(source_act) = source.try_activity(activity_id) {
            if source_act.behavior.kind() != target_act.behavior.kind() {
                violations.push(MigrationViolation::BehaviorMismatch {
                    source_activity_id: activity_id.clone(),
                    target_activity_id: target_act.id.clone(),
                });
            }
        }
        if source.scope_depth(activity_id) != target.scope_depth(&target_act.id) {
            // Only an explicit caller instruction may change nesting depth,
            // and only for plain tokens: a scope execution is itself a frame
            // and cannot be re-homed.
            if !instruction.explicit || exec.is_scope {
                violations.push(MigrationViolation::ScopeDepthChange {
                    source_activity_id: activity_id.clone(),
                    target_activity_id: target_act.id.clone(),
                });
            }
        }
    }
    violations
}

// ─── Apply ────────────────────────────────────────────────────

/// Rewrite one (validated) instance in place: activity pointers and
/// definition ids on executions and jobs, event subscriptions when
/// requested, and scope frames created or removed where an explicit
/// instruction changed nesting depth.
#[allow(clippy::too_many_arguments)]
pub(crate) fn apply_to_tree(
    plan: &MigrationPlan,
    target: &ProcessDefinition,
    tree: &mut ExecutionTree,
    jobs: &[Job],
    subscriptions: &[EventSubscription],
    interp: &Interpreter<'_>,
    clock: &dyn Clock,
) -> Result<(), EngineError> {
    // 1. Re-point every execution.
    let exec_ids: Vec<ExecutionId> = tree.executions().map(|e| e.id).collect();
    for id in &exec_ids {
        let e = tree.get_mut(*id)?;
        e.process_definition_id = target.id.clone();
        if let Some(activity_id) = e.activity_id.clone() {
            if let Some(instr) = plan.instruction_for(&activity_id) {
                e.activity_id = Some(instr.target_activity_id.clone());
            }
        }
    }

    // 2. Adjust scope frames for depth-changing mappings.
    for id in &exec_ids {
        if !tree.contains(*id) {
            continue;
        }
        let (is_scope, is_leaf, activity) = {
            let e = tree.get(*id)?;
            (e.is_scope, tree.children(*id).is_empty(), e.activity_id.clone())
        };
        let Some(activity) = activity else { continue };
        if is_scope || !is_leaf {
            continue;
        }
        adjust_scopes(plan, target, tree, *id, &activity, interp)?;
    }

    // 3. Re-create event subscriptions where requested.
    for sub in subscriptions {
        let Some(instr) = plan.instruction_for(&sub.activity_id) else { continue };
        if !instr.update_event_trigger {
            continue;
        }
        tree.remove_subscription(sub.id);
        let target_act = target.activity(&instr.target_activity_id)?;
        if let Behavior::ReceiveTask { kind, event_key } = &target_act.behavior {
            tree.subscribe(EventSubscription {
                id: Uuid::now_v7(),
                execution_id: sub.execution_id,
                process_instance_id: sub.process_instance_id,
                kind: *kind,
                event_key: event_key.clone(),
                activity_id: target_act.id.clone(),
                tenant_id: sub.tenant_id.clone(),
                created_at: clock.now(),
            });
        }
    }

    // 4. Re-point pending jobs so continuations resume in the new
    // definition.
    for job in jobs {
        let mut migrated = job.clone();
        migrated.process_definition_id = target.id.clone();
        if let Some(instr) = plan.instruction_for(job.handler.activity_id()) {
            match &mut migrated.handler {
                JobHandler::AsyncContinuation { activity_id, .. }
                | JobHandler::Timer { activity_id, .. } => {
                    *activity_id = instr.target_activity_id.clone();
                }
            }
        }
        tree.update_job(migrated);
    }
    Ok(())
}

/// Bring the scope-execution chain above `exec_id` in line with the target
/// activity's nesting: emerge missing frames, splice out vacated ones.
fn adjust_scopes(
    plan: &MigrationPlan,
    target: &ProcessDefinition,
    tree: &mut ExecutionTree,
    exec_id: ExecutionId,
    activity_id: &str,
    interp: &Interpreter<'_>,
) -> Result<(), EngineError> {
    let required = target.scope_chain(activity_id);
    let mut guard = 0;
    loop {
        guard += 1;
        if guard > 64 {
            return Err(EngineError::structural(format!(
                "scope adjustment for activity '{activity_id}' did not converge"
            )));
        }
        let current = current_scope_chain(tree, exec_id)?;
        if current
            .iter()
            .map(|(_, a)| a.as_str())
            .eq(required.iter().map(String::as_str))
        {
            return Ok(());
        }
        let mismatch = current.len() > required.len()
            || current
                .last()
                .map(|(_, a)| Some(a) != required.last())
                .unwrap_or(false);
        if mismatch && !current.is_empty() {
            let (scope_exec, scope_activity) = current
                .last()
                .cloned()
                .ok_or_else(|| EngineError::structural("scope chain vanished"))?;
            remove_scope(plan, target, tree, scope_exec, &scope_activity, interp)?;
        } else {
            // Emerge the innermost missing required scope directly above the
            // execution.
            let missing = required
                .get(current.len())
                .cloned()
                .ok_or_else(|| {
                    EngineError::structural(format!(
                        "no scope left to emerge for activity '{activity_id}'"
                    ))
                })?;
            emerge_scope(plan, target, tree, exec_id, &missing, interp)?;
        }
    }
}

/// Scope executions above `exec_id`, outermost first, excluding the root.
fn current_scope_chain(
    tree: &ExecutionTree,
    exec_id: ExecutionId,
) -> Result<Vec<(ExecutionId, ActivityId)>, EngineError> {
    let mut chain = Vec::new();
    let mut cur = tree.get(exec_id)?.parent_id;
    while let Some(id) = cur {
        let e = tree.get(id)?;
        if e.is_scope && e.parent_id.is_some() {
            if let Some(a) = &e.activity_id {
                chain.push((id, a.clone()));
            }
        }
        cur = e.parent_id;
    }
    chain.reverse();
    Ok(chain)
}

fn emerge_scope(
    plan: &MigrationPlan,
    target: &ProcessDefinition,
    tree: &mut ExecutionTree,
    exec_id: ExecutionId,
    scope_activity: &str,
    interp: &Interpreter<'_>,
) -> Result<(), EngineError> {
    let act = target.activity(scope_activity)?;
    let parent = tree.get(exec_id)?.parent_id.ok_or_else(|| {
        EngineError::structural(format!("cannot emerge scope above root for {exec_id}"))
    })?;
    let scope = tree.create_child(parent, false, true)?;
    {
        let s = tree.get_mut(scope)?;
        s.activity_id = Some(scope_activity.to_string());
        s.is_active = false;
        s.activity_started = true;
    }
    tree.reparent(exec_id, scope)?;
    tracing::debug!(scope = %scope_activity, execution = %exec_id, "emerging scope");
    if !plan.skip_custom_listeners {
        interp.notify_listeners(tree, scope, &act.listeners, ListenerEvent::Start, &act.id)?;
    }
    if !plan.skip_io_mappings {
        for m in &act.inputs {
            if let Some(v) = tree.get_variable(scope, &m.source).cloned() {
                tree.set_variable_local(scope, m.target.clone(), v)?;
            }
        }
    }
    Ok(())
}

fn remove_scope(
    plan: &MigrationPlan,
    target: &ProcessDefinition,
    tree: &mut ExecutionTree,
    scope_exec: ExecutionId,
    scope_activity: &str,
    interp: &Interpreter<'_>,
) -> Result<(), EngineError> {
    if let Some(act) = target.try_activity(scope_activity) {
        if !plan.skip_custom_listeners {
            interp.notify_listeners(tree, scope_exec, &act.listeners, ListenerEvent::End, &act.id)?;
        }
        if !plan.skip_io_mappings {
            for m in &act.outputs {
                if let Some(v) = tree.get_variable(scope_exec, &m.source).cloned() {
                    tree.set_variable_outer(scope_exec, m.target.clone(), v)?;
                }
            }
        }
    }
    tracing::debug!(scope = %scope_activity, execution = %scope_exec, "removing vacated scope");

    // Splice: children move up to the scope's parent; a placeholder parent
    // left at the same activity is consumed with the frame (or, when the
    // placeholder is itself a surviving scope such as the root, its stale
    // activity pointer is cleared).
    let parent = tree.get(scope_exec)?.parent_id.ok_or_else(|| {
        EngineError::structural("cannot remove the process root scope".to_string())
    })?;
    let (placeholder, stale_pointer) = {
        let p = tree.get(parent)?;
        if p.activity_id.as_deref() == Some(scope_activity) {
            if p.is_scope {
                (None, true)
            } else {
                (Some(parent), false)
            }
        } else {
            (None, false)
        }
    };
    if stale_pointer {
        tree.get_mut(parent)?.activity_id = None;
    }
    let new_parent = match placeholder {
        Some(p) => tree.get(p)?.parent_id.ok_or_else(|| {
            EngineError::structural("scope placeholder has no parent".to_string())
        })?,
        None => parent,
    };
    for child in tree.children(scope_exec) {
        tree.reparent(child, new_parent)?;
    }
    tree.destroy(scope_exec)?;
    if let Some(p) = placeholder {
        tree.destroy(p)?;
    }
    Ok(())
}
