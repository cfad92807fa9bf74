//! Atomic Operation Engine: the interpreter that advances executions through
//! discrete, named operations.
//!
//! One run drains a worklist of `(execution, operation)` entries over the
//! in-memory [`ExecutionTree`], entirely synchronously; the caller commits
//! the resulting delta afterwards, so an error anywhere aborts the whole
//! logical transaction with nothing persisted. A path hitting an
//! asynchronous boundary parks by buffering a continuation job into the tree
//! and producing no successor entry; sibling paths keep running in the same
//! transaction.
//!
//! Async boundary placement is what makes resumption idempotent:
//!
//! - the `async_before` check lives at the end of `TransitionCreateScope`,
//!   and the before-job resumes at `ActivityExecute`, which is past it;
//! - the `async_after` check lives in the take, after the transition has
//!   been recorded on the execution, and the after-job resumes at
//!   `TransitionNotifyListenerTake`, which is past it. Take listeners
//!   therefore fire exactly once per transition, and a resumed job can never
//!   re-create its own boundary.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::definition::{
    Activity, Behavior, Cardinality, Listener, ListenerEvent, ProcessDefinition,
};
use crate::error::EngineError;
use crate::history::{HistoryEvent, HistoryRecorder};
use crate::retry;
use crate::tree::{ExecutionTree, JoinOutcome};
use crate::types::*;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// Multi-instance bookkeeping variables, kept on the body scope so
/// cardinality accounting is always against the body, never the instance
/// root.
pub const NR_OF_INSTANCES: &str = "nrOfInstances";
pub const NR_OF_COMPLETED_INSTANCES: &str = "nrOfCompletedInstances";
pub const LOOP_COUNTER: &str = "loopCounter";

// ─── Operations ───────────────────────────────────────────────

/// External trigger resuming a parked execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventTrigger {
    Message,
    Signal,
    Timer,
}

/// The closed operation set of the interpreter. Each operation either
/// selects its successors synchronously or determines that the execution
/// must suspend.
#[derive(Clone, Debug, PartialEq)]
pub enum AtomicOp {
    /// Enter the execution's current activity, creating a scope frame if the
    /// activity owns one. Ends with the asynchronous-before check.
    TransitionCreateScope,
    /// Fire start listeners and input mappings, then run the activity's
    /// behavior.
    ActivityExecute,
    /// Fire end listeners and output mappings, then leave via the selected
    /// (or only) outgoing flow, or complete the path.
    ActivityEnd { via: Option<TransitionId> },
    /// Fire take listeners of the transition recorded on the execution.
    TransitionNotifyListenerTake,
    /// Pop the scope frame if the transition leaves one, then enter the
    /// target activity.
    TransitionDestroyScope,
    /// Destroy the root: the instance has fully ended.
    ProcessEnd,
    /// Resume a wait state from an external trigger.
    ActivityFireEvent { trigger: EventTrigger },
}

/// Outcome of one interpreter run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunEnd {
    /// The process instance fully ended; the tree is empty.
    Ended,
    /// Executions remain: parked on jobs, subscriptions, or siblings.
    Active,
}

#[derive(Debug)]
struct WorkItem {
    execution: ExecutionId,
    op: AtomicOp,
}

// ─── Delegates ────────────────────────────────────────────────

/// View of the current execution handed to business code (service task
/// delegates and execution listeners).
pub struct DelegateContext<'t> {
    tree: &'t mut ExecutionTree,
    execution_id: ExecutionId,
    activity_id: String,
}

impl DelegateContext<'_> {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn process_instance_id(&self) -> ExecutionId {
        self.tree.process_instance_id()
    }

    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    pub fn business_key(&self) -> Option<String> {
        self.tree
            .get(self.tree.process_instance_id())
            .ok()
            .and_then(|root| root.business_key.clone())
    }

    /// Resolve a variable through the scope chain.
    pub fn variable(&self, name: &str) -> Option<serde_json::Value> {
        self.tree.get_variable(self.execution_id, name).cloned()
    }

    /// Write into the nearest enclosing scope.
    pub fn set_variable(
        &mut self,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> anyhow::Result<()> {
        Ok(self.tree.set_variable(self.execution_id, name, value)?)
    }

    /// Write an execution-local value.
    pub fn set_variable_local(
        &mut self,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> anyhow::Result<()> {
        Ok(self.tree.set_variable_local(self.execution_id, name, value)?)
    }
}

/// User-supplied business logic attached to service tasks and listeners.
/// Failures are the retryable error class: on the async path they consume
/// the job's retry budget and eventually raise an Incident.
pub trait Delegate: Send + Sync {
    fn execute(&self, ctx: &mut DelegateContext<'_>) -> anyhow::Result<()>;
}

impl<F> Delegate for F
where
    F: Fn(&mut DelegateContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, ctx: &mut DelegateContext<'_>) -> anyhow::Result<()> {
        self(ctx)
    }
}

/// Name-indexed delegate lookup, populated at engine construction.
#[derive(Default)]
pub struct DelegateRegistry {
    delegates: HashMap<String, Arc<dyn Delegate>>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        delegate: impl Delegate + 'static,
    ) -> &mut Self {
        self.delegates.insert(name.into(), Arc::new(delegate));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Delegate>> {
        self.delegates.get(name).cloned()
    }
}

// ─── Interpreter ──────────────────────────────────────────────

pub struct Interpreter<'a> {
    pub def: &'a ProcessDefinition,
    pub delegates: &'a DelegateRegistry,
    pub history: &'a dyn HistoryRecorder,
    pub clock: &'a dyn Clock,
    pub config: &'a EngineConfig,
}

impl<'a> Interpreter<'a> {
    /// Run operations until every path has completed, parked, or suspended.
    pub fn run(
        &self,
        tree: &mut ExecutionTree,
        execution: ExecutionId,
        start: AtomicOp,
    ) -> Result<RunEnd, EngineError> {
        let mut work = VecDeque::new();
        work.push_back(WorkItem {
            execution,
            op: start,
        });
        let mut steps = 0usize;
        while let Some(item) = work.pop_front() {
            steps += 1;
            if steps > self.config.max_operations_per_run {
                return Err(EngineError::structural(format!(
                    "operation budget ({}) exceeded in definition '{}': loop without a wait state?",
                    self.config.max_operations_per_run, self.def.id
                )));
            }
            tracing::trace!(execution = %item.execution, op = ?item.op, "atomic operation");
            let next = self.perform(tree, item.execution, item.op)?;
            work.extend(next);
        }
        Ok(if tree.is_ended() {
            RunEnd::Ended
        } else {
            RunEnd::Active
        })
    }

    fn perform(
        &self,
        tree: &mut ExecutionTree,
        exec_id: ExecutionId,
        op: AtomicOp,
    ) -> Result<Vec<WorkItem>, EngineError> {
        match op {
            AtomicOp::TransitionCreateScope => self.transition_create_scope(tree, exec_id),
            AtomicOp::ActivityExecute => self.activity_execute(tree, exec_id),
            AtomicOp::ActivityEnd { via } => self.activity_end(tree, exec_id, via),
            AtomicOp::TransitionNotifyListenerTake => self.transition_notify_take(tree, exec_id),
            AtomicOp::TransitionDestroyScope => self.transition_destroy_scope(tree, exec_id),
            AtomicOp::ProcessEnd => self.process_end(tree, exec_id),
            AtomicOp::ActivityFireEvent { trigger } => self.fire_event(tree, exec_id, trigger),
        }
    }

    // ── TransitionCreateScope ──

    fn transition_create_scope(
        &self,
        tree: &mut ExecutionTree,
        exec_id: ExecutionId,
    ) -> Result<Vec<WorkItem>, EngineError> {
        let exec = tree.get(exec_id)?;
        let activity_id = exec
            .activity_id
            .clone()
            .ok_or_else(|| EngineError::structural(format!("execution {exec_id} entered without an activity")))?;
        let act = self.def.activity(&activity_id)?;

        // A scope activity executes on a dedicated child carrying the frame;
        // the entering execution stays behind as an inactive placeholder.
        let current = if act.scope {
            let child = tree.create_child(exec_id, false, true)?;
            tree.get_mut(child)?.activity_id = Some(act.id.clone());
            tree.get_mut(exec_id)?.is_active = false;
            child
        } else {
            exec_id
        };

        if act.async_before {
            self.create_job_for(tree, current, act, ResumeOp::ActivityExecute)?;
            return Ok(Vec::new());
        }
        Ok(vec![WorkItem {
            execution: current,
            op: AtomicOp::ActivityExecute,
        }])
    }

    // ── ActivityExecute ──

    fn activity_execute(
        &self,
        tree: &mut ExecutionTree,
        exec_id: ExecutionId,
    ) -> Result<Vec<WorkItem>, EngineError> {
        let exec = tree.get(exec_id)?;
        let activity_id = exec
            .activity_id
            .clone()
            .ok_or_else(|| EngineError::structural(format!("execution {exec_id} has no activity to execute")))?;
        let process_instance_id = exec.process_instance_id;
        let act = self.def.activity(&activity_id)?;

        self.notify_listeners(tree, exec_id, &act.listeners, ListenerEvent::Start, &act.id)?;
        tree.get_mut(exec_id)?.activity_started = true;
        for m in &act.inputs {
            if let Some(v) = tree.get_variable(exec_id, &m.source).cloned() {
                tree.set_variable_local(exec_id, m.target.clone(), v)?;
            }
        }
        self.history.record(HistoryEvent::ActivityStarted {
            process_instance_id,
            execution_id: exec_id,
            activity_id: act.id.clone(),
        });

        match &act.behavior {
            Behavior::Task | Behavior::End => Ok(vec![WorkItem {
                execution: exec_id,
                op: AtomicOp::ActivityEnd { via: None },
            }]),

            Behavior::Service { delegate } => {
                self.invoke_delegate(tree, exec_id, &act.id, delegate)?;
                Ok(vec![WorkItem {
                    execution: exec_id,
                    op: AtomicOp::ActivityEnd { via: None },
                }])
            }

            Behavior::ParallelFork => {
                // The gateway completes here; each branch takes its own flow,
                // so async-after yields one job per outgoing path.
                self.notify_listeners(tree, exec_id, &act.listeners, ListenerEvent::End, &act.id)?;
                self.history.record(HistoryEvent::ActivityEnded {
                    process_instance_id,
                    execution_id: exec_id,
                    activity_id: act.id.clone(),
                });
                let outgoing = act.outgoing.clone();
                tracing::debug!(gateway = %act.id, branches = outgoing.len(), "parallel fork");
                {
                    let e = tree.get_mut(exec_id)?;
                    e.activity_id = None;
                    e.activity_started = false;
                }
                let children = tree.fork(exec_id, outgoing.len())?;
                let mut items = Vec::new();
                for (child, t) in children.into_iter().zip(outgoing.iter()) {
                    items.extend(self.take_transition(tree, child, act, t)?);
                }
                Ok(items)
            }

            Behavior::ParallelJoin => self.parallel_join(tree, exec_id, act),

            Behavior::ExclusiveGateway { default_transition } => {
                let vars = tree.visible_variables(exec_id);
                let mut chosen: Option<&TransitionId> = None;
                for t_id in &act.outgoing {
                    if Some(t_id) == default_transition.as_ref() {
                        continue;
                    }
                    let t = self.def.transition(t_id)?;
                    let matched = match &t.condition {
                        None => true,
                        Some(c) => vars.get(&c.variable) == Some(&c.equals),
                    };
                    if matched {
                        chosen = Some(t_id);
                        break;
                    }
                }
                let via = chosen.or(default_transition.as_ref()).ok_or_else(|| {
                    EngineError::structural(format!(
                        "no outgoing flow of exclusive gateway '{}' is satisfied and it has no default",
                        act.id
                    ))
                })?;
                Ok(vec![WorkItem {
                    execution: exec_id,
                    op: AtomicOp::ActivityEnd {
                        via: Some(via.clone()),
                    },
                }])
            }

            Behavior::SubProcess { initial } => {
                let child = tree.create_child(exec_id, false, false)?;
                tree.get_mut(child)?.activity_id = Some(initial.clone());
                tree.get_mut(exec_id)?.is_active = false;
                Ok(vec![WorkItem {
                    execution: child,
                    op: AtomicOp::TransitionCreateScope,
                }])
            }

            Behavior::MultiInstanceBody { cardinality, inner } => {
                let n = match cardinality {
                    Cardinality::Fixed(n) => *n,
                    Cardinality::Variable(name) => tree
                        .get_variable(exec_id, name)
                        .and_then(|v| v.as_u64())
                        .map(|v| v as u32)
                        .ok_or_else(|| {
                            EngineError::structural(format!(
                                "multi-instance cardinality variable '{name}' of '{}' is not a number",
                                act.id
                            ))
                        })?,
                };
                tree.set_variable_local(exec_id, NR_OF_INSTANCES, serde_json::json!(n))?;
                tree.set_variable_local(exec_id, NR_OF_COMPLETED_INSTANCES, serde_json::json!(0))?;
                if n == 0 {
                    return Ok(vec![WorkItem {
                        execution: exec_id,
                        op: AtomicOp::ActivityEnd { via: None },
                    }]);
                }
                tracing::debug!(body = %act.id, instances = n, "multi-instance activation");
                let children = tree.fork(exec_id, n as usize)?;
                let mut items = Vec::new();
                for (i, child) in children.into_iter().enumerate() {
                    tree.get_mut(child)?.activity_id = Some(inner.clone());
                    tree.set_variable_local(child, LOOP_COUNTER, serde_json::json!(i))?;
                    items.push(WorkItem {
                        execution: child,
                        op: AtomicOp::TransitionCreateScope,
                    });
                }
                Ok(items)
            }

            Behavior::ReceiveTask { kind, event_key } => {
                let exec = tree.get(exec_id)?;
                let sub = EventSubscription {
                    id: Uuid::now_v7(),
                    execution_id: exec_id,
                    process_instance_id: exec.process_instance_id,
                    kind: *kind,
                    event_key: event_key.clone(),
                    activity_id: act.id.clone(),
                    tenant_id: exec.tenant_id.clone(),
                    created_at: self.clock.now(),
                };
                tracing::debug!(activity = %act.id, event_key = %event_key, "parked on event subscription");
                tree.subscribe(sub);
                // Wait state, not an async boundary: no job is created. The
                // subscription directory re-enters the engine on correlation.
                Ok(Vec::new())
            }

            Behavior::TimerCatch { duration } => {
                let dur = retry::parse_duration(duration).map_err(|e| {
                    EngineError::structural(format!("timer '{}': {e}", act.id))
                })?;
                let due = self.clock.now() + dur;
                let job = self.build_job(
                    tree,
                    exec_id,
                    act,
                    JobHandler::Timer {
                        activity_id: act.id.clone(),
                        repeat: None,
                    },
                    due,
                    // Independent timers default to non-exclusive.
                    act.exclusive.unwrap_or(false),
                )?;
                tracing::debug!(activity = %act.id, due = %due, "parked on timer");
                tree.create_job(job);
                Ok(Vec::new())
            }
        }
    }

    fn parallel_join(
        &self,
        tree: &mut ExecutionTree,
        exec_id: ExecutionId,
        act: &Activity,
    ) -> Result<Vec<WorkItem>, EngineError> {
        let expected = act.incoming.len() as u16;
        let exec = tree.get(exec_id)?;
        let process_instance_id = exec.process_instance_id;
        let parent = exec.parent_id.ok_or_else(|| {
            EngineError::structural(format!(
                "parallel join '{}' reached by the process root",
                act.id
            ))
        })?;
        tree.get_mut(exec_id)?.is_active = false;

        match tree.join_arrive(parent, &act.id, expected)? {
            JoinOutcome::Waiting => {
                tracing::debug!(gateway = %act.id, "join arrival parked");
                Ok(Vec::new())
            }
            JoinOutcome::Complete => {
                // Destroy the parked siblings; the last arrival merges into
                // the parent scope, which proceeds past the join. Exactly one
                // continuation, N-1 sibling destructions.
                for sibling in tree.children(parent) {
                    if sibling == exec_id {
                        continue;
                    }
                    let parked = {
                        let s = tree.get(sibling)?;
                        s.is_concurrent
                            && !s.is_active
                            && s.activity_id.as_deref() == Some(act.id.as_str())
                    };
                    if parked {
                        tree.destroy(sibling)?;
                    }
                }
                tree.destroy(exec_id)?;
                {
                    let p = tree.get_mut(parent)?;
                    p.activity_id = Some(act.id.clone());
                    p.is_active = true;
                    p.activity_started = true;
                }
                tracing::debug!(gateway = %act.id, "join completed");
                self.history.record(HistoryEvent::ActivityStarted {
                    process_instance_id,
                    execution_id: parent,
                    activity_id: act.id.clone(),
                });
                Ok(vec![WorkItem {
                    execution: parent,
                    op: AtomicOp::ActivityEnd { via: None },
                }])
            }
        }
    }

    // ── ActivityEnd ──

    fn activity_end(
        &self,
        tree: &mut ExecutionTree,
        exec_id: ExecutionId,
        via: Option<TransitionId>,
    ) -> Result<Vec<WorkItem>, EngineError> {
        let exec = tree.get(exec_id)?;
        let activity_id = exec
            .activity_id
            .clone()
            .ok_or_else(|| EngineError::structural(format!("execution {exec_id} ended without an activity")))?;
        let process_instance_id = exec.process_instance_id;
        let act = self.def.activity(&activity_id)?;

        self.notify_listeners(tree, exec_id, &act.listeners, ListenerEvent::End, &act.id)?;
        for m in &act.outputs {
            if let Some(v) = tree.get_variable(exec_id, &m.source).cloned() {
                tree.set_variable_outer(exec_id, m.target.clone(), v)?;
            }
        }
        tree.get_mut(exec_id)?.activity_started = false;
        self.history.record(HistoryEvent::ActivityEnded {
            process_instance_id,
            execution_id: exec_id,
            activity_id: act.id.clone(),
        });

        let via = match via {
            Some(t) => Some(t),
            None => match act.outgoing.len() {
                0 => None,
                1 => Some(act.outgoing[0].clone()),
                n => {
                    return Err(EngineError::structural(format!(
                        "activity '{}' has {n} outgoing flows and no gateway selected one",
                        act.id
                    )))
                }
            },
        };
        match via {
            Some(t) => self.take_transition(tree, exec_id, act, &t),
            None => self.path_completed(tree, exec_id),
        }
    }

    /// Record the transition on the execution, then cross the
    /// asynchronous-after boundary (or continue into the take).
    fn take_transition(
        &self,
        tree: &mut ExecutionTree,
        exec_id: ExecutionId,
        source: &Activity,
        transition_id: &str,
    ) -> Result<Vec<WorkItem>, EngineError> {
        self.def.transition(transition_id)?;
        {
            let e = tree.get_mut(exec_id)?;
            e.activity_id = None;
            e.transition_id = Some(transition_id.to_string());
        }
        if source.async_after {
            self.create_job_for(tree, exec_id, source, ResumeOp::TransitionNotifyListenerTake)?;
            return Ok(Vec::new());
        }
        Ok(vec![WorkItem {
            execution: exec_id,
            op: AtomicOp::TransitionNotifyListenerTake,
        }])
    }

    // ── TransitionNotifyListenerTake ──

    fn transition_notify_take(
        &self,
        tree: &mut ExecutionTree,
        exec_id: ExecutionId,
    ) -> Result<Vec<WorkItem>, EngineError> {
        let transition_id = tree
            .get(exec_id)?
            .transition_id
            .clone()
            .ok_or_else(|| EngineError::structural(format!("execution {exec_id} is not on a transition")))?;
        let t = self.def.transition(&transition_id)?;
        self.notify_listeners(tree, exec_id, &t.listeners, ListenerEvent::Take, &t.source)?;
        Ok(vec![WorkItem {
            execution: exec_id,
            op: AtomicOp::TransitionDestroyScope,
        }])
    }

    // ── TransitionDestroyScope ──

    fn transition_destroy_scope(
        &self,
        tree: &mut ExecutionTree,
        exec_id: ExecutionId,
    ) -> Result<Vec<WorkItem>, EngineError> {
        let exec = tree.get(exec_id)?;
        let transition_id = exec
            .transition_id
            .clone()
            .ok_or_else(|| EngineError::structural(format!("execution {exec_id} is not on a transition")))?;
        let target = self.def.transition(&transition_id)?.target.clone();

        // Leaving a scope activity: the frame execution is consumed and its
        // placeholder parent carries on along the transition.
        let mut current = exec_id;
        if exec.is_scope {
            if let Some(parent) = exec.parent_id {
                tree.destroy(exec_id)?;
                let p = tree.get_mut(parent)?;
                p.transition_id = Some(transition_id.clone());
                p.activity_id = None;
                p.is_active = true;
                current = parent;
            }
        }

        {
            let c = tree.get_mut(current)?;
            c.activity_id = Some(target);
            c.transition_id = None;
        }
        Ok(vec![WorkItem {
            execution: current,
            op: AtomicOp::TransitionCreateScope,
        }])
    }

    // ── ProcessEnd ──

    fn process_end(
        &self,
        tree: &mut ExecutionTree,
        exec_id: ExecutionId,
    ) -> Result<Vec<WorkItem>, EngineError> {
        let process_instance_id = tree.get(exec_id)?.process_instance_id;
        tree.destroy(exec_id)?;
        self.history.record(HistoryEvent::ProcessInstanceEnded {
            process_instance_id,
        });
        tracing::info!(process_instance = %process_instance_id, "process instance ended");
        Ok(Vec::new())
    }

    // ── Path completion ──

    /// An execution finished its path (activity with no outgoing flow).
    /// Destroy it and propagate completion up the tree.
    fn path_completed(
        &self,
        tree: &mut ExecutionTree,
        exec_id: ExecutionId,
    ) -> Result<Vec<WorkItem>, EngineError> {
        let exec = tree.get(exec_id)?.clone();
        let Some(parent) = exec.parent_id else {
            return Ok(vec![WorkItem {
                execution: exec_id,
                op: AtomicOp::ProcessEnd,
            }]);
        };
        tree.destroy(exec_id)?;

        // The completed execution was the scope frame of the parent's own
        // activity (a scope that ended with no outgoing flow): the parent's
        // path is complete as well.
        let parent_exec = tree.get(parent)?;
        if exec.is_scope
            && parent_exec.activity_id.is_some()
            && parent_exec.activity_id == exec.activity_id
        {
            return self.path_completed(tree, parent);
        }

        if let Some(parent_activity) = parent_exec.activity_id.clone() {
            let pact = self.def.activity(&parent_activity)?;
            match &pact.behavior {
                Behavior::MultiInstanceBody { .. } => {
                    let completed = tree
                        .get_variable(parent, NR_OF_COMPLETED_INSTANCES)
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0)
                        + 1;
                    let total = tree
                        .get_variable(parent, NR_OF_INSTANCES)
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    tree.set_variable_local(
                        parent,
                        NR_OF_COMPLETED_INSTANCES,
                        serde_json::json!(completed),
                    )?;
                    tracing::debug!(body = %pact.id, completed, total, "multi-instance progress");
                    if completed >= total {
                        tree.get_mut(parent)?.is_active = true;
                        return Ok(vec![WorkItem {
                            execution: parent,
                            op: AtomicOp::ActivityEnd { via: None },
                        }]);
                    }
                    return Ok(Vec::new());
                }
                Behavior::SubProcess { .. }
                    if tree.get(parent).map(|p| p.is_scope).unwrap_or(false) =>
                {
                    if tree.children(parent).is_empty() {
                        tree.get_mut(parent)?.is_active = true;
                        return Ok(vec![WorkItem {
                            execution: parent,
                            op: AtomicOp::ActivityEnd { via: None },
                        }]);
                    }
                    return Ok(Vec::new());
                }
                _ => {}
            }
        }

        // Plain structural placeholder (e.g. a fork parent): when the last
        // child is gone and the parent is not mid-flight itself, its path is
        // complete too.
        let parent_exec = tree.get(parent)?;
        if tree.children(parent).is_empty() && !parent_exec.is_active {
            return self.path_completed(tree, parent);
        }
        Ok(Vec::new())
    }

    // ── Event resumption ──

    fn fire_event(
        &self,
        tree: &mut ExecutionTree,
        exec_id: ExecutionId,
        trigger: EventTrigger,
    ) -> Result<Vec<WorkItem>, EngineError> {
        let exec = tree.get(exec_id)?;
        let activity_id = exec
            .activity_id
            .clone()
            .ok_or_else(|| EngineError::structural(format!("execution {exec_id} is not at an activity")))?;
        let act = self.def.activity(&activity_id)?;
        let matches = matches!(
            (&act.behavior, trigger),
            (
                Behavior::ReceiveTask {
                    kind: EventKind::Message,
                    ..
                },
                EventTrigger::Message
            ) | (
                Behavior::ReceiveTask {
                    kind: EventKind::Signal,
                    ..
                },
                EventTrigger::Signal
            ) | (Behavior::TimerCatch { .. }, EventTrigger::Timer)
        );
        if !matches {
            return Err(EngineError::structural(format!(
                "activity '{}' is not waiting for a {trigger:?} trigger",
                act.id
            )));
        }
        tracing::debug!(activity = %act.id, trigger = ?trigger, "wait state resumed");
        Ok(vec![WorkItem {
            execution: exec_id,
            op: AtomicOp::ActivityEnd { via: None },
        }])
    }

    // ── Jobs ──

    fn create_job_for(
        &self,
        tree: &mut ExecutionTree,
        exec_id: ExecutionId,
        act: &Activity,
        resume: ResumeOp,
    ) -> Result<JobId, EngineError> {
        let job = self.build_job(
            tree,
            exec_id,
            act,
            JobHandler::AsyncContinuation {
                resume,
                activity_id: act.id.clone(),
            },
            self.clock.now(),
            // Ordinary continuations default to exclusive: one writer per
            // execution tree.
            act.exclusive.unwrap_or(true),
        )?;
        let id = job.id;
        tracing::debug!(job = %id, activity = %act.id, resume = ?resume, "suspended to continuation job");
        tree.create_job(job);
        Ok(id)
    }

    fn build_job(
        &self,
        tree: &ExecutionTree,
        exec_id: ExecutionId,
        act: &Activity,
        handler: JobHandler,
        due_date: chrono::DateTime<chrono::Utc>,
        exclusive: bool,
    ) -> Result<Job, EngineError> {
        let variables = tree.visible_variables(exec_id);
        let retries = act
            .retry_cycle
            .as_deref()
            .and_then(|expr| retry::resolve_cycle(expr, &variables))
            .map(|c| c.repetitions)
            .unwrap_or(self.config.default_retries);
        let exec = tree.get(exec_id)?;
        Ok(Job {
            id: Uuid::now_v7(),
            execution_id: exec_id,
            process_instance_id: exec.process_instance_id,
            process_definition_id: exec.process_definition_id.clone(),
            tenant_id: exec.tenant_id.clone(),
            handler,
            due_date,
            retries,
            exclusive,
            priority: act.job_priority,
            suspended: exec.suspended,
            lock_owner: None,
            lock_expiration: None,
            exception_message: None,
            exception_stacktrace: None,
            version: 0,
        })
    }

    // ── Delegates and listeners ──

    fn invoke_delegate(
        &self,
        tree: &mut ExecutionTree,
        exec_id: ExecutionId,
        activity_id: &str,
        name: &str,
    ) -> Result<(), EngineError> {
        let delegate = self.delegates.get(name).ok_or_else(|| {
            EngineError::structural(format!(
                "no delegate registered under '{name}' (activity '{activity_id}')"
            ))
        })?;
        let mut ctx = DelegateContext {
            tree,
            execution_id: exec_id,
            activity_id: activity_id.to_string(),
        };
        delegate.execute(&mut ctx).map_err(|source| EngineError::Delegate {
            delegate: name.to_string(),
            activity_id: activity_id.to_string(),
            source,
        })
    }

    pub(crate) fn notify_listeners(
        &self,
        tree: &mut ExecutionTree,
        exec_id: ExecutionId,
        listeners: &[Listener],
        event: ListenerEvent,
        context_id: &str,
    ) -> Result<(), EngineError> {
        for l in listeners.iter().filter(|l| l.event == event) {
            self.invoke_delegate(tree, exec_id, context_id, &l.delegate)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::definition::{Activity, Behavior, DefinitionBuilder, Transition};
    use crate::history::CollectingHistory;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Harness {
        def: Arc<ProcessDefinition>,
        delegates: DelegateRegistry,
        history: CollectingHistory,
        clock: ManualClock,
        config: EngineConfig,
    }

    impl Harness {
        fn new(def: Arc<ProcessDefinition>) -> Self {
            Self {
                def,
                delegates: DelegateRegistry::new(),
                history: CollectingHistory::new(),
                clock: ManualClock::new(
                    chrono::Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
                ),
                config: EngineConfig::default(),
            }
        }

        fn interp(&self) -> Interpreter<'_> {
            Interpreter {
                def: &self.def,
                delegates: &self.delegates,
                history: &self.history,
                clock: &self.clock,
                config: &self.config,
            }
        }

        fn start(&self) -> (ExecutionTree, ExecutionId, RunEnd) {
            let mut tree = ExecutionTree::new_root(&self.def, None, None, VariableMap::new());
            let root = tree.process_instance_id();
            let end = self
                .interp()
                .run(&mut tree, root, AtomicOp::TransitionCreateScope)
                .unwrap();
            (tree, root, end)
        }
    }

    fn linear_service(configure: impl FnOnce(Activity) -> Activity) -> Arc<ProcessDefinition> {
        DefinitionBuilder::new("p")
            .activity(Activity::new("start", Behavior::Task))
            .activity(configure(Activity::service("work", "doWork")))
            .activity(Activity::new("done", Behavior::End))
            .transition("f1", "start", "work")
            .transition("f2", "work", "done")
            .initial("start")
            .build(1)
            .unwrap()
    }

    #[test]
    fn linear_flow_completes_synchronously() {
        let mut h = Harness::new(linear_service(|a| a));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        h.delegates.register("doWork", move |_ctx: &mut DelegateContext<'_>| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (tree, _, end) = h.start();
        assert_eq!(end, RunEnd::Ended);
        assert!(tree.is_ended());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tree.created_jobs().is_empty());
    }

    #[test]
    fn async_before_parks_with_continuation_job() {
        let mut h = Harness::new(linear_service(|a| a.async_before()));
        h.delegates
            .register("doWork", |_: &mut DelegateContext<'_>| Ok(()));

        let (tree, root, end) = h.start();
        assert_eq!(end, RunEnd::Active);
        assert_eq!(tree.created_jobs().len(), 1);
        let job = &tree.created_jobs()[0];
        assert!(matches!(
            job.handler,
            JobHandler::AsyncContinuation {
                resume: ResumeOp::ActivityExecute,
                ..
            }
        ));
        assert_eq!(job.handler.activity_id(), "work");
        assert_eq!(job.retries, 3);
        assert!(job.exclusive, "continuations are exclusive by default");
        // The delegate has not run; the execution is positioned before it.
        let exec = tree.get(root).unwrap();
        assert_eq!(exec.activity_id.as_deref(), Some("work"));
        assert!(!exec.activity_started);
    }

    #[test]
    fn resuming_before_job_does_not_recreate_it() {
        let mut h = Harness::new(linear_service(|a| a.async_before()));
        h.delegates
            .register("doWork", |_: &mut DelegateContext<'_>| Ok(()));

        let (mut tree, root, _) = h.start();
        assert_eq!(tree.created_jobs().len(), 1);

        // The before-job resumes at ActivityExecute, past the boundary check.
        let end = h
            .interp()
            .run(&mut tree, root, AtomicOp::ActivityExecute)
            .unwrap();
        assert_eq!(end, RunEnd::Ended);
        assert_eq!(tree.created_jobs().len(), 1, "no duplicate before-job");
    }

    #[test]
    fn async_after_records_transition_then_take_listener_fires_once() {
        let taken = Arc::new(AtomicUsize::new(0));
        let t = taken.clone();
        let def = DefinitionBuilder::new("p")
            .activity(Activity::new("start", Behavior::Task))
            .activity(Activity::service("work", "doWork").async_after())
            .activity(Activity::new("done", Behavior::End))
            .transition("f1", "start", "work")
            .flow(Transition {
                id: "f2".into(),
                source: "work".into(),
                target: "done".into(),
                condition: None,
                listeners: vec![crate::definition::Listener {
                    event: ListenerEvent::Take,
                    delegate: "onTake".into(),
                }],
            })
            .initial("start")
            .build(1)
            .unwrap();
        let mut h = Harness::new(def);
        h.delegates
            .register("doWork", |_: &mut DelegateContext<'_>| Ok(()));
        h.delegates
            .register("onTake", move |_: &mut DelegateContext<'_>| {
                t.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let (mut tree, root, end) = h.start();
        assert_eq!(end, RunEnd::Active);
        assert_eq!(tree.created_jobs().len(), 1);
        let job = &tree.created_jobs()[0];
        assert!(matches!(
            job.handler,
            JobHandler::AsyncContinuation {
                resume: ResumeOp::TransitionNotifyListenerTake,
                ..
            }
        ));
        // Transition already recorded, listener not yet fired: the marked
        // transition is what stops the boundary from re-triggering.
        let exec = tree.get(root).unwrap();
        assert_eq!(exec.transition_id.as_deref(), Some("f2"));
        assert_eq!(taken.load(Ordering::SeqCst), 0);

        let end = h
            .interp()
            .run(&mut tree, root, AtomicOp::TransitionNotifyListenerTake)
            .unwrap();
        assert_eq!(end, RunEnd::Ended);
        assert_eq!(taken.load(Ordering::SeqCst), 1, "take listener fired exactly once");
        assert_eq!(tree.created_jobs().len(), 1, "no job re-created after the take");
    }

    #[test]
    fn async_before_and_after_produce_two_jobs_across_two_resumptions() {
        let mut h = Harness::new(linear_service(|a| a.async_before().async_after()));
        h.delegates
            .register("doWork", |_: &mut DelegateContext<'_>| Ok(()));

        let (mut tree, root, _) = h.start();
        assert_eq!(tree.created_jobs().len(), 1);

        let end = h
            .interp()
            .run(&mut tree, root, AtomicOp::ActivityExecute)
            .unwrap();
        assert_eq!(end, RunEnd::Active);
        assert_eq!(tree.created_jobs().len(), 2, "after-boundary queued the second job");

        let end = h
            .interp()
            .run(&mut tree, root, AtomicOp::TransitionNotifyListenerTake)
            .unwrap();
        assert_eq!(end, RunEnd::Ended);
        assert_eq!(tree.created_jobs().len(), 2);
    }

    fn fork_join_def() -> Arc<ProcessDefinition> {
        DefinitionBuilder::new("p")
            .activity(Activity::new("start", Behavior::Task))
            .activity(Activity::new("fork", Behavior::ParallelFork))
            .activity(Activity::new("a", Behavior::Task))
            .activity(Activity::new("b", Behavior::Task))
            .activity(Activity::new("join", Behavior::ParallelJoin))
            .activity(Activity::new("done", Behavior::End))
            .transition("f1", "start", "fork")
            .transition("f2", "fork", "a")
            .transition("f3", "fork", "b")
            .transition("f4", "a", "join")
            .transition("f5", "b", "join")
            .transition("f6", "join", "done")
            .initial("start")
            .build(1)
            .unwrap()
    }

    #[test]
    fn fork_join_produces_exactly_one_continuation() {
        let h = Harness::new(fork_join_def());
        let (tree, _, end) = h.start();
        assert_eq!(end, RunEnd::Ended);
        assert!(tree.is_ended());

        // The join gateway ends exactly once.
        let join_ends = h
            .history
            .events()
            .iter()
            .filter(|e| {
                matches!(e, HistoryEvent::ActivityEnded { activity_id, .. } if activity_id == "join")
            })
            .count();
        assert_eq!(join_ends, 1);
    }

    #[test]
    fn fork_with_async_branches_parks_both() {
        let def = DefinitionBuilder::new("p")
            .activity(Activity::new("start", Behavior::Task))
            .activity(Activity::new("fork", Behavior::ParallelFork))
            .activity(Activity::service("a", "work").async_before())
            .activity(Activity::service("b", "work").async_before())
            .activity(Activity::new("join", Behavior::ParallelJoin))
            .activity(Activity::new("done", Behavior::End))
            .transition("f1", "start", "fork")
            .transition("f2", "fork", "a")
            .transition("f3", "fork", "b")
            .transition("f4", "a", "join")
            .transition("f5", "b", "join")
            .transition("f6", "join", "done")
            .initial("start")
            .build(1)
            .unwrap();
        let mut h = Harness::new(def);
        h.delegates
            .register("work", |_: &mut DelegateContext<'_>| Ok(()));

        let (mut tree, root, end) = h.start();
        assert_eq!(end, RunEnd::Active);
        assert_eq!(tree.created_jobs().len(), 2, "one job per concurrent branch");

        // Resume both branches in creation order; the second resumption
        // drives the join home.
        let branch_jobs: Vec<(ExecutionId, ResumeOp)> = tree
            .created_jobs()
            .iter()
            .map(|j| match &j.handler {
                JobHandler::AsyncContinuation { resume, .. } => (j.execution_id, *resume),
                other => panic!("unexpected handler {other:?}"),
            })
            .collect();
        for (exec, resume) in branch_jobs {
            assert_eq!(resume, ResumeOp::ActivityExecute);
            h.interp()
                .run(&mut tree, exec, AtomicOp::ActivityExecute)
                .unwrap();
        }
        assert!(tree.is_ended());
        let _ = root;
    }

    #[test]
    fn exclusive_gateway_picks_condition_then_default() {
        let def = DefinitionBuilder::new("p")
            .activity(Activity::new("start", Behavior::Task))
            .activity(Activity::new(
                "choose",
                Behavior::ExclusiveGateway {
                    default_transition: Some("to_b".into()),
                },
            ))
            .activity(Activity::new("a", Behavior::End))
            .activity(Activity::new("b", Behavior::End))
            .transition("f1", "start", "choose")
            .flow(Transition {
                id: "to_a".into(),
                source: "choose".into(),
                target: "a".into(),
                condition: Some(crate::definition::Condition {
                    variable: "approved".into(),
                    equals: serde_json::json!(true),
                }),
                listeners: Vec::new(),
            })
            .transition("to_b", "choose", "b")
            .initial("start")
            .build(1)
            .unwrap();

        // Condition matches: path a.
        let h = Harness::new(def.clone());
        let mut tree = ExecutionTree::new_root(&h.def, None, None, VariableMap::new());
        let root = tree.process_instance_id();
        tree.set_variable(root, "approved", serde_json::json!(true)).unwrap();
        h.interp()
            .run(&mut tree, root, AtomicOp::TransitionCreateScope)
            .unwrap();
        assert!(h
            .history
            .events()
            .iter()
            .any(|e| matches!(e, HistoryEvent::ActivityStarted { activity_id, .. } if activity_id == "a")));

        // No match: default path b.
        let h2 = Harness::new(def);
        let (_, _, end) = h2.start();
        assert_eq!(end, RunEnd::Ended);
        assert!(h2
            .history
            .events()
            .iter()
            .any(|e| matches!(e, HistoryEvent::ActivityStarted { activity_id, .. } if activity_id == "b")));
    }

    #[test]
    fn subprocess_scope_variables_are_dropped_with_the_frame() {
        let inner_saw = Arc::new(Mutex::new(None::<serde_json::Value>));
        let saw = inner_saw.clone();
        let def = DefinitionBuilder::new("p")
            .activity(Activity::new("start", Behavior::Task))
            .activity(
                Activity::new(
                    "sub",
                    Behavior::SubProcess {
                        initial: "inner".into(),
                    },
                )
                .output("result", "subResult"),
            )
            .activity(Activity::service("inner", "innerWork").in_scope("sub"))
            .activity(Activity::service("after", "afterWork"))
            .activity(Activity::new("done", Behavior::End))
            .transition("f1", "start", "sub")
            .transition("f2", "sub", "after")
            .transition("f3", "after", "done")
            .initial("start")
            .build(1)
            .unwrap();
        let mut h = Harness::new(def);
        h.delegates
            .register("innerWork", |ctx: &mut DelegateContext<'_>| {
                // Lands in the subprocess scope frame.
                ctx.set_variable("result", serde_json::json!(42))?;
                Ok(())
            });
        h.delegates.register("afterWork", move |ctx: &mut DelegateContext<'_>| {
            *saw.lock().unwrap() = ctx.variable("result");
            Ok(())
        });

        let (tree, root, end) = h.start();
        assert_eq!(end, RunEnd::Ended);
        assert!(tree.is_ended());
        // The scope-local variable died with the frame; the output mapping
        // survived into the parent scope.
        assert_eq!(*inner_saw.lock().unwrap(), None);
        let _ = root;
    }

    #[test]
    fn multi_instance_runs_cardinality_instances_and_accounts_on_body() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let def = DefinitionBuilder::new("p")
            .activity(Activity::new("start", Behavior::Task))
            .activity(Activity::new(
                "each",
                Behavior::MultiInstanceBody {
                    cardinality: Cardinality::Fixed(3),
                    inner: "item".into(),
                },
            ))
            .activity(Activity::service("item", "handle").in_scope("each"))
            .activity(Activity::new("done", Behavior::End))
            .transition("f1", "start", "each")
            .transition("f2", "each", "done")
            .initial("start")
            .build(1)
            .unwrap();
        let mut h = Harness::new(def);
        h.delegates.register("handle", move |ctx: &mut DelegateContext<'_>| {
            assert!(ctx.variable(LOOP_COUNTER).is_some());
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (tree, _, end) = h.start();
        assert_eq!(end, RunEnd::Ended);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(tree.is_ended());
    }

    #[test]
    fn multi_instance_async_markers() {
        // Async on the body: exactly one job regardless of cardinality.
        let body_async = DefinitionBuilder::new("p")
            .activity(Activity::new("start", Behavior::Task))
            .activity(
                Activity::new(
                    "each",
                    Behavior::MultiInstanceBody {
                        cardinality: Cardinality::Fixed(3),
                        inner: "item".into(),
                    },
                )
                .async_before(),
            )
            .activity(Activity::new("item", Behavior::Task).in_scope("each"))
            .activity(Activity::new("done", Behavior::End))
            .transition("f1", "start", "each")
            .transition("f2", "each", "done")
            .initial("start")
            .build(1)
            .unwrap();
        let h = Harness::new(body_async);
        let (tree, _, end) = h.start();
        assert_eq!(end, RunEnd::Active);
        assert_eq!(tree.created_jobs().len(), 1, "body is async exactly once");

        // Async on the inner activity: one job per concurrent instance.
        let inner_async = DefinitionBuilder::new("p")
            .activity(Activity::new("start", Behavior::Task))
            .activity(Activity::new(
                "each",
                Behavior::MultiInstanceBody {
                    cardinality: Cardinality::Fixed(3),
                    inner: "item".into(),
                },
            ))
            .activity(Activity::new("item", Behavior::Task).in_scope("each").async_before())
            .activity(Activity::new("done", Behavior::End))
            .transition("f1", "start", "each")
            .transition("f2", "each", "done")
            .initial("start")
            .build(1)
            .unwrap();
        let h = Harness::new(inner_async);
        let (tree, _, end) = h.start();
        assert_eq!(end, RunEnd::Active);
        assert_eq!(tree.created_jobs().len(), 3, "one job per instance");
    }

    #[test]
    fn receive_task_parks_on_subscription_without_a_job() {
        let def = DefinitionBuilder::new("p")
            .activity(Activity::new("start", Behavior::Task))
            .activity(Activity::new(
                "wait",
                Behavior::ReceiveTask {
                    kind: EventKind::Message,
                    event_key: "payment-received".into(),
                },
            ))
            .activity(Activity::new("done", Behavior::End))
            .transition("f1", "start", "wait")
            .transition("f2", "wait", "done")
            .initial("start")
            .build(1)
            .unwrap();
        let h = Harness::new(def);
        let (mut tree, root, end) = h.start();
        assert_eq!(end, RunEnd::Active);
        assert!(tree.created_jobs().is_empty(), "wait states create no job");

        // Correlation resumes the execution through the event operation.
        let end = h
            .interp()
            .run(
                &mut tree,
                root,
                AtomicOp::ActivityFireEvent {
                    trigger: EventTrigger::Message,
                },
            )
            .unwrap();
        assert_eq!(end, RunEnd::Ended);

        // A signal against a message catch is a structural fault.
        let h2 = Harness::new(
            DefinitionBuilder::new("p")
                .activity(Activity::new(
                    "wait",
                    Behavior::ReceiveTask {
                        kind: EventKind::Message,
                        event_key: "k".into(),
                    },
                ))
                .initial("wait")
                .build(1)
                .unwrap(),
        );
        let (mut tree2, root2, _) = h2.start();
        let err = h2
            .interp()
            .run(
                &mut tree2,
                root2,
                AtomicOp::ActivityFireEvent {
                    trigger: EventTrigger::Signal,
                },
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Structural(_)));
    }

    #[test]
    fn timer_catch_queues_non_exclusive_timer_job() {
        let def = DefinitionBuilder::new("p")
            .activity(Activity::new("start", Behavior::Task))
            .activity(Activity::new(
                "cool_off",
                Behavior::TimerCatch {
                    duration: "PT15M".into(),
                },
            ))
            .activity(Activity::new("done", Behavior::End))
            .transition("f1", "start", "cool_off")
            .transition("f2", "cool_off", "done")
            .initial("start")
            .build(1)
            .unwrap();
        let h = Harness::new(def);
        let (tree, root, end) = h.start();
        assert_eq!(end, RunEnd::Active);
        assert_eq!(tree.created_jobs().len(), 1);
        let job = &tree.created_jobs()[0];
        assert!(matches!(job.handler, JobHandler::Timer { .. }));
        assert!(!job.exclusive, "independent timers default to non-exclusive");
        assert_eq!(job.due_date, h.clock.now() + chrono::Duration::minutes(15));
        let _ = root;
    }

    #[test]
    fn retry_cycle_seeds_initial_retries() {
        let mut h = Harness::new(linear_service(|a| a.async_before().retry_cycle("R5/PT1M")));
        h.delegates
            .register("doWork", |_: &mut DelegateContext<'_>| Ok(()));
        let (tree, _, _) = h.start();
        assert_eq!(tree.created_jobs()[0].retries, 5);
    }

    #[test]
    fn delegate_failure_is_reported_as_retryable() {
        let mut h = Harness::new(linear_service(|a| a));
        h.delegates
            .register("doWork", |_: &mut DelegateContext<'_>| {
                Err(anyhow::anyhow!("downstream unavailable"))
            });
        let mut tree = ExecutionTree::new_root(&h.def, None, None, VariableMap::new());
        let root = tree.process_instance_id();
        let err = h
            .interp()
            .run(&mut tree, root, AtomicOp::TransitionCreateScope)
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!err.is_transient());
    }

    #[test]
    fn missing_delegate_is_structural() {
        let h = Harness::new(linear_service(|a| a));
        let mut tree = ExecutionTree::new_root(&h.def, None, None, VariableMap::new());
        let root = tree.process_instance_id();
        let err = h
            .interp()
            .run(&mut tree, root, AtomicOp::TransitionCreateScope)
            .unwrap_err();
        assert!(matches!(err, EngineError::Structural(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn operation_budget_guards_against_definition_loops() {
        let def = DefinitionBuilder::new("p")
            .activity(Activity::new("a", Behavior::Task))
            .activity(Activity::new("b", Behavior::Task))
            .transition("f1", "a", "b")
            .transition("f2", "b", "a")
            .initial("a")
            .build(1)
            .unwrap();
        let mut h = Harness::new(def);
        h.config.max_operations_per_run = 64;
        let mut tree = ExecutionTree::new_root(&h.def, None, None, VariableMap::new());
        let root = tree.process_instance_id();
        let err = h
            .interp()
            .run(&mut tree, root, AtomicOp::TransitionCreateScope)
            .unwrap_err();
        assert!(matches!(err, EngineError::Structural(_)));
    }

    #[test]
    fn system_clock_is_usable_as_trait_object() {
        // Interpreter construction with the production clock type.
        let def = linear_service(|a| a);
        let delegates = DelegateRegistry::new();
        let history = CollectingHistory::new();
        let clock = SystemClock;
        let config = EngineConfig::default();
        let _ = Interpreter {
            def: &def,
            delegates: &delegates,
            history: &history,
            clock: &clock,
            config: &config,
        };
    }
}
