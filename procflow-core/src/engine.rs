//! The process engine facade.
//!
//! Caller threads enter here synchronously (start, correlate, delete,
//! migrate); the background scheduler re-enters through [`run_job`].
//! Every entry point runs one logical transaction: load the execution tree,
//! drive the interpreter, commit the delta. A version conflict on commit
//! re-runs the whole operation from its last durable checkpoint, uncapped on
//! the synchronous path; an asynchronous job hitting a conflict is unlocked
//! and re-queued without touching its retry budget.
//!
//! [`run_job`]: ProcessEngine::run_job

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::definition::{DefinitionRepository, ListenerEvent, ProcessDefinition};
use crate::error::{error_chain, EngineError, StoreError};
use crate::history::{HistoryEvent, HistoryRecorder, NullHistory};
use crate::migration::{
    self, InstanceMigrationFailure, MigrationPlan, MigrationReport, MigrationViolation,
};
use crate::ops::{AtomicOp, DelegateRegistry, EventTrigger, Interpreter, RunEnd};
use crate::retry;
use crate::store::EngineStore;
use crate::tree::ExecutionTree;
use crate::types::*;
use std::sync::Arc;
use uuid::Uuid;

/// Result of a synchronous start call.
#[derive(Clone, Copy, Debug)]
pub struct StartedInstance {
    pub process_instance_id: ExecutionId,
    /// The instance ran to completion within the starting transaction.
    pub ended: bool,
}

pub struct ProcessEngine {
    store: Arc<dyn EngineStore>,
    definitions: Arc<dyn DefinitionRepository>,
    delegates: DelegateRegistry,
    history: Arc<dyn HistoryRecorder>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl ProcessEngine {
    pub fn new(store: Arc<dyn EngineStore>, definitions: Arc<dyn DefinitionRepository>) -> Self {
        Self {
            store,
            definitions,
            delegates: DelegateRegistry::new(),
            history: Arc::new(NullHistory),
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    pub fn with_delegates(mut self, delegates: DelegateRegistry) -> Self {
        self.delegates = delegates;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryRecorder>) -> Self {
        self.history = history;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn interpreter<'a>(&'a self, def: &'a ProcessDefinition) -> Interpreter<'a> {
        Interpreter {
            def,
            delegates: &self.delegates,
            history: self.history.as_ref(),
            clock: self.clock.as_ref(),
            config: &self.config,
        }
    }

    fn definition(&self, id: &str) -> Result<Arc<ProcessDefinition>, EngineError> {
        self.definitions
            .find(id)
            .ok_or_else(|| EngineError::structural(format!("process definition '{id}' not found")))
    }

    // ── Starting instances ──

    /// Start an instance of the latest deployed version of `key`.
    pub async fn start_process_by_key(
        &self,
        key: &str,
        business_key: Option<String>,
        tenant_id: Option<String>,
        variables: VariableMap,
    ) -> Result<StartedInstance, EngineError> {
        let def = self.definitions.find_latest(key).ok_or_else(|| {
            EngineError::structural(format!("no process definition deployed for key '{key}'"))
        })?;
        self.start_with(def, business_key, tenant_id, variables).await
    }

    /// Start an instance of a specific definition version.
    pub async fn start_process(
        &self,
        definition_id: &str,
        business_key: Option<String>,
        tenant_id: Option<String>,
        variables: VariableMap,
    ) -> Result<StartedInstance, EngineError> {
        let def = self.definition(definition_id)?;
        self.start_with(def, business_key, tenant_id, variables).await
    }

    async fn start_with(
        &self,
        def: Arc<ProcessDefinition>,
        business_key: Option<String>,
        tenant_id: Option<String>,
        variables: VariableMap,
    ) -> Result<StartedInstance, EngineError> {
        loop {
            let mut tree = ExecutionTree::new_root(
                &def,
                business_key.clone(),
                tenant_id.clone(),
                variables.clone(),
            );
            let process_instance_id = tree.process_instance_id();
            self.history.record(HistoryEvent::ProcessInstanceStarted {
                process_instance_id,
                process_definition_id: def.id.clone(),
                business_key: business_key.clone(),
                tenant_id: tenant_id.clone(),
            });
            let end = self
                .interpreter(&def)
                .run(&mut tree, process_instance_id, AtomicOp::TransitionCreateScope)?;
            match self.store.commit(tree.delta()).await {
                Ok(()) => {
                    tracing::info!(
                        process_instance = %process_instance_id,
                        definition = %def.id,
                        ended = end == RunEnd::Ended,
                        "process instance started"
                    );
                    return Ok(StartedInstance {
                        process_instance_id,
                        ended: end == RunEnd::Ended,
                    });
                }
                Err(StoreError::Conflict { .. }) => {
                    tracing::debug!("conflict while starting instance, re-running");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Any executions left for the instance?
    pub async fn is_instance_active(
        &self,
        process_instance_id: ExecutionId,
    ) -> Result<bool, EngineError> {
        Ok(!self
            .store
            .instance_executions(process_instance_id)
            .await?
            .is_empty())
    }

    // ── Event correlation ──

    /// Deliver a message to every subscriber of `event_key`. Returns the
    /// number of executions resumed.
    pub async fn correlate_message(
        &self,
        event_key: &str,
        tenant_id: Option<&str>,
    ) -> Result<usize, EngineError> {
        self.correlate(EventKind::Message, EventTrigger::Message, event_key, tenant_id)
            .await
    }

    /// Broadcast a signal to every subscriber of `event_key`.
    pub async fn correlate_signal(
        &self,
        event_key: &str,
        tenant_id: Option<&str>,
    ) -> Result<usize, EngineError> {
        self.correlate(EventKind::Signal, EventTrigger::Signal, event_key, tenant_id)
            .await
    }

    async fn correlate(
        &self,
        kind: EventKind,
        trigger: EventTrigger,
        event_key: &str,
        tenant_id: Option<&str>,
    ) -> Result<usize, EngineError> {
        let subscribers = self.store.find_subscribers(kind, event_key, tenant_id).await?;
        let mut resumed = 0;
        for sub in subscribers {
            if self.trigger_subscription(&sub, trigger).await? {
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    async fn trigger_subscription(
        &self,
        sub: &EventSubscription,
        trigger: EventTrigger,
    ) -> Result<bool, EngineError> {
        loop {
            let Some(mut tree) =
                ExecutionTree::load(self.store.as_ref(), sub.process_instance_id).await?
            else {
                tracing::debug!(subscription = %sub.id, "ghost subscription: instance gone");
                return Ok(false);
            };
            if !tree.contains(sub.execution_id) {
                tracing::debug!(subscription = %sub.id, "ghost subscription: execution gone");
                return Ok(false);
            }
            if tree.get(sub.execution_id)?.suspended {
                return Err(EngineError::structural(format!(
                    "process instance {} is suspended",
                    sub.process_instance_id
                )));
            }
            let def = self.definition(&tree.get(sub.execution_id)?.process_definition_id)?;
            tree.remove_subscription(sub.id);
            self.interpreter(&def).run(
                &mut tree,
                sub.execution_id,
                AtomicOp::ActivityFireEvent { trigger },
            )?;
            match self.store.commit(tree.delta()).await {
                Ok(()) => return Ok(true),
                Err(StoreError::Conflict { .. }) => {
                    tracing::debug!(subscription = %sub.id, "conflict on correlation, re-running");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ── Job execution ──

    /// Execute a job now. A missing job id is a no-op (the continuation
    /// already completed and was deleted). On failure the retry bookkeeping
    /// runs before the error is returned.
    pub async fn run_job(&self, job_id: JobId) -> Result<(), EngineError> {
        let Some(job) = self.store.job(job_id).await? else {
            tracing::debug!(job = %job_id, "job vanished before execution (no-op)");
            return Ok(());
        };
        // Suspension is an administrative state, not a failure: reject
        // without touching the retry budget.
        if job.suspended {
            return Err(EngineError::structural(format!("job {} is suspended", job.id)));
        }
        match self.execute_job(&job).await {
            Ok(()) => {
                self.history.record(HistoryEvent::JobExecuted {
                    process_instance_id: job.process_instance_id,
                    job_id: job.id,
                });
                Ok(())
            }
            Err(e) => {
                self.handle_job_failure(&job, &e).await?;
                Err(e)
            }
        }
    }

    async fn execute_job(&self, job: &Job) -> Result<(), EngineError> {
        match &job.handler {
            JobHandler::AsyncContinuation { resume, activity_id } => {
                let Some(mut tree) =
                    ExecutionTree::load(self.store.as_ref(), job.process_instance_id).await?
                else {
                    return Err(EngineError::structural(format!(
                        "job {} references ended instance {}",
                        job.id, job.process_instance_id
                    )));
                };
                if !tree.contains(job.execution_id) {
                    return Err(EngineError::structural(format!(
                        "job {} references destroyed execution {}",
                        job.id, job.execution_id
                    )));
                }
                let exec = tree.get(job.execution_id)?;
                if exec.suspended {
                    return Err(EngineError::structural(format!(
                        "execution {} is suspended",
                        job.execution_id
                    )));
                }
                // The continuation must still match the execution's position;
                // anything else means the tree moved without this job.
                let op = match resume {
                    ResumeOp::ActivityExecute => {
                        if exec.activity_id.as_deref() != Some(activity_id.as_str()) {
                            return Err(EngineError::structural(format!(
                                "job {} resumes activity '{activity_id}' but execution is at {:?}",
                                job.id, exec.activity_id
                            )));
                        }
                        AtomicOp::ActivityExecute
                    }
                    ResumeOp::TransitionNotifyListenerTake => {
                        if exec.transition_id.is_none() {
                            return Err(EngineError::structural(format!(
                                "job {} resumes a transition but execution {} is not on one",
                                job.id, job.execution_id
                            )));
                        }
                        AtomicOp::TransitionNotifyListenerTake
                    }
                };
                let def = self.definition(&job.process_definition_id)?;
                self.interpreter(&def).run(&mut tree, job.execution_id, op)?;
                tree.delete_job(job.id);
                self.store.commit(tree.delta()).await?;
                Ok(())
            }

            JobHandler::Timer { activity_id, repeat } => {
                // A timer whose subject moved on (or whose instance ended) is
                // simply done; reminders do not outlive what they remind.
                let Some(mut tree) =
                    ExecutionTree::load(self.store.as_ref(), job.process_instance_id).await?
                else {
                    self.store.delete_job(job.id).await?;
                    tracing::debug!(job = %job.id, "timer target instance gone, dropping");
                    return Ok(());
                };
                let stale = !tree.contains(job.execution_id)
                    || tree.get(job.execution_id)?.activity_id.as_deref()
                        != Some(activity_id.as_str());
                if stale {
                    self.store.delete_job(job.id).await?;
                    tracing::debug!(job = %job.id, "timer target moved on, dropping");
                    return Ok(());
                }
                if tree.get(job.execution_id)?.suspended {
                    return Err(EngineError::structural(format!(
                        "execution {} is suspended",
                        job.execution_id
                    )));
                }
                // Recurring timers are replaced by their next occurrence in
                // the same transaction that consumes this one.
                if let Some(rep) = repeat {
                    if rep.remaining > 1 {
                        let mut next = job.clone();
                        next.id = Uuid::now_v7();
                        next.version = 0;
                        next.clear_lock();
                        next.due_date =
                            self.clock.now() + chrono::Duration::milliseconds(rep.interval_ms);
                        next.handler = JobHandler::Timer {
                            activity_id: activity_id.clone(),
                            repeat: Some(RepeatSpec {
                                remaining: rep.remaining - 1,
                                interval_ms: rep.interval_ms,
                            }),
                        };
                        tree.create_job(next);
                    }
                }
                let def = self.definition(&job.process_definition_id)?;
                self.interpreter(&def).run(
                    &mut tree,
                    job.execution_id,
                    AtomicOp::ActivityFireEvent {
                        trigger: EventTrigger::Timer,
                    },
                )?;
                tree.delete_job(job.id);
                self.store.commit(tree.delta()).await?;
                Ok(())
            }
        }
    }

    /// Retry bookkeeping after a failed execution attempt, keyed off the
    /// error class:
    ///
    /// - transient (conflict/backend): unlock, due immediately, no decrement;
    /// - business (delegate): decrement, due per the retry cycle (or the
    ///   engine default backoff), Incident when the budget runs out;
    /// - structural: terminal in one step, Incident immediately.
    pub(crate) async fn handle_job_failure(
        &self,
        job: &Job,
        err: &EngineError,
    ) -> Result<(), EngineError> {
        let Some(mut current) = self.store.job(job.id).await? else {
            return Ok(());
        };
        let now = self.clock.now();

        if err.is_transient() {
            current.clear_lock();
            current.due_date = now;
            tracing::debug!(job = %current.id, error = %err, "transient failure, re-queued");
            return self.store_job_update(current).await;
        }

        if err.is_retryable() {
            if current.retries == 0 {
                // Already terminal: record the failure, change nothing else.
                current.exception_message = Some(err.to_string());
                current.exception_stacktrace = Some(error_chain(err));
                current.clear_lock();
                return self.store_job_update(current).await;
            }
            let interval = self
                .retry_interval_for(&current)
                .await
                .unwrap_or(self.config.default_retry_backoff);
            current.retries -= 1;
            current.due_date = now + interval;
            current.exception_message = Some(err.to_string());
            current.exception_stacktrace = Some(error_chain(err));
            current.clear_lock();
            let retries_left = current.retries;
            tracing::warn!(
                job = %current.id,
                retries_left,
                due = %current.due_date,
                error = %err,
                "job failed, will retry"
            );
            self.history.record(HistoryEvent::JobFailed {
                process_instance_id: current.process_instance_id,
                job_id: current.id,
                message: err.to_string(),
                retries_left,
            });
            let exhausted = current.retries == 0;
            let snapshot = current.clone();
            self.store_job_update(current).await?;
            if exhausted {
                self.raise_incident(&snapshot, err).await?;
            }
            return Ok(());
        }

        // Structural: non-retryable. The countdown is bypassed, not spent.
        let first_failure = current.retries > 0;
        current.retries = 0;
        current.exception_message = Some(err.to_string());
        current.exception_stacktrace = Some(error_chain(err));
        current.clear_lock();
        tracing::error!(job = %current.id, error = %err, "non-retryable job failure");
        let snapshot = current.clone();
        self.store_job_update(current).await?;
        if first_failure {
            self.raise_incident(&snapshot, err).await?;
        }
        Ok(())
    }

    async fn store_job_update(&self, job: Job) -> Result<(), EngineError> {
        match self.store.update_job(&job).await {
            Ok(()) => Ok(()),
            Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound { .. }) => {
                // Someone else touched the job meanwhile; their state wins.
                tracing::debug!(job = %job.id, "job changed during failure handling, leaving as-is");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Retry interval from the activity's cycle expression, resolved against
    /// the failing execution's visible variables at failure time.
    async fn retry_interval_for(&self, job: &Job) -> Option<chrono::Duration> {
        let def = self.definitions.find(&job.process_definition_id)?;
        let expr = def
            .try_activity(job.handler.activity_id())?
            .retry_cycle
            .clone()?;
        let variables = match ExecutionTree::load(self.store.as_ref(), job.process_instance_id)
            .await
        {
            Ok(Some(tree)) if tree.contains(job.execution_id) => {
                tree.visible_variables(job.execution_id)
            }
            _ => VariableMap::new(),
        };
        retry::resolve_cycle(&expr, &variables).map(|c| c.interval)
    }

    async fn raise_incident(&self, job: &Job, err: &EngineError) -> Result<(), EngineError> {
        let incident = Incident {
            id: Uuid::now_v7(),
            process_instance_id: job.process_instance_id,
            execution_id: job.execution_id,
            activity_id: Some(job.handler.activity_id().to_string()),
            job_id: Some(job.id),
            message: err.to_string(),
            tenant_id: job.tenant_id.clone(),
            created_at: self.clock.now(),
            resolved_at: None,
        };
        tracing::error!(
            incident = %incident.id,
            job = %job.id,
            process_instance = %job.process_instance_id,
            "retries exhausted, incident raised"
        );
        self.store.save_incident(&incident).await?;
        self.history.record(HistoryEvent::IncidentCreated {
            process_instance_id: job.process_instance_id,
            incident_id: incident.id,
            job_id: Some(job.id),
        });
        Ok(())
    }

    /// Restore a terminal-failed job's retry budget (operator action) and
    /// mark its incidents resolved.
    pub async fn set_job_retries(&self, job_id: JobId, retries: u32) -> Result<(), EngineError> {
        loop {
            let Some(mut job) = self.store.job(job_id).await? else {
                return Err(EngineError::structural(format!("job {job_id} not found")));
            };
            let now = self.clock.now();
            job.retries = retries;
            job.due_date = now;
            match self.store.update_job(&job).await {
                Ok(()) => {
                    self.store.resolve_job_incidents(job_id, now).await?;
                    self.history.record(HistoryEvent::IncidentResolved {
                        process_instance_id: job.process_instance_id,
                        job_id,
                    });
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ── Administrative operations ──

    /// Cascade-delete a process instance: executions children-first, pending
    /// jobs and subscriptions in the same transaction. End listeners fire
    /// only for activities that were synchronously entered; an activity whose
    /// only progress was "job created, not yet executed" stays silent.
    pub async fn delete_process_instance(
        &self,
        process_instance_id: ExecutionId,
        reason: &str,
    ) -> Result<(), EngineError> {
        loop {
            let Some(mut tree) =
                ExecutionTree::load(self.store.as_ref(), process_instance_id).await?
            else {
                return Ok(());
            };
            let root = tree.process_instance_id();
            let def = self.definition(&tree.get(root)?.process_definition_id)?;
            let interp = self.interpreter(&def);

            for exec_id in tree.subtree_postorder(root) {
                let (activity_id, started) = {
                    let e = tree.get(exec_id)?;
                    (e.activity_id.clone(), e.activity_started)
                };
                if let Some(aid) = activity_id {
                    if started {
                        let act = def.activity(&aid)?;
                        interp.notify_listeners(
                            &mut tree,
                            exec_id,
                            &act.listeners,
                            ListenerEvent::End,
                            &aid,
                        )?;
                        self.history.record(HistoryEvent::ActivityEnded {
                            process_instance_id,
                            execution_id: exec_id,
                            activity_id: aid,
                        });
                    }
                }
                tree.destroy(exec_id)?;
            }
            for job in self.store.instance_jobs(process_instance_id).await? {
                tree.delete_job(job.id);
            }
            for sub in self.store.instance_subscriptions(process_instance_id).await? {
                tree.remove_subscription(sub.id);
            }
            self.history.record(HistoryEvent::ProcessInstanceCanceled {
                process_instance_id,
                reason: reason.to_string(),
            });
            match self.store.commit(tree.delta()).await {
                Ok(()) => {
                    tracing::info!(process_instance = %process_instance_id, reason, "instance deleted");
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn suspend_instance(&self, id: ExecutionId) -> Result<(), EngineError> {
        self.set_suspension(id, true).await
    }

    pub async fn activate_instance(&self, id: ExecutionId) -> Result<(), EngineError> {
        self.set_suspension(id, false).await
    }

    async fn set_suspension(
        &self,
        process_instance_id: ExecutionId,
        suspended: bool,
    ) -> Result<(), EngineError> {
        loop {
            let Some(mut tree) =
                ExecutionTree::load(self.store.as_ref(), process_instance_id).await?
            else {
                return Err(EngineError::structural(format!(
                    "process instance {process_instance_id} not found"
                )));
            };
            let ids: Vec<ExecutionId> = tree.executions().map(|e| e.id).collect();
            for id in ids {
                tree.get_mut(id)?.suspended = suspended;
            }
            for mut job in self.store.instance_jobs(process_instance_id).await? {
                job.suspended = suspended;
                tree.update_job(job);
            }
            match self.store.commit(tree.delta()).await {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ── Migration ──

    /// Apply a migration plan instance by instance, one transaction each.
    /// Instances failing validation are reported and skipped; they never
    /// block the rest of the batch.
    pub async fn migrate_instances(
        &self,
        plan: &MigrationPlan,
        instance_ids: &[ExecutionId],
    ) -> Result<MigrationReport, EngineError> {
        let source = self.definition(&plan.source_definition_id)?;
        let target = self.definition(&plan.target_definition_id)?;
        let mut report = MigrationReport::default();
        for &pid in instance_ids {
            loop {
                match self.migrate_one(plan, &source, &target, pid).await {
                    Ok(Ok(())) => {
                        report.migrated.push(pid);
                        break;
                    }
                    Ok(Err(violations)) => {
                        tracing::warn!(
                            process_instance = %pid,
                            violations = violations.len(),
                            "instance excluded from migration"
                        );
                        report
                            .failed
                            .push(InstanceMigrationFailure {
                                process_instance_id: pid,
                                violations,
                            });
                        break;
                    }
                    Err(EngineError::Conflict) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        tracing::info!(
            migrated = report.migrated.len(),
            failed = report.failed.len(),
            from = %plan.source_definition_id,
            to = %plan.target_definition_id,
            "migration batch applied"
        );
        Ok(report)
    }

    async fn migrate_one(
        &self,
        plan: &MigrationPlan,
        source: &ProcessDefinition,
        target: &ProcessDefinition,
        process_instance_id: ExecutionId,
    ) -> Result<Result<(), Vec<MigrationViolation>>, EngineError> {
        let Some(mut tree) =
            ExecutionTree::load(self.store.as_ref(), process_instance_id).await?
        else {
            return Ok(Err(vec![MigrationViolation::InstanceNotFound]));
        };
        let violations = migration::validate_plan(plan, source, target, &tree);
        if !violations.is_empty() {
            return Ok(Err(violations));
        }
        let jobs = self.store.instance_jobs(process_instance_id).await?;
        let subs = self.store.instance_subscriptions(process_instance_id).await?;
        let interp = self.interpreter(target);
        migration::apply_to_tree(
            plan,
            target,
            &mut tree,
            &jobs,
            &subs,
            &interp,
            self.clock.as_ref(),
        )?;
        self.history.record(HistoryEvent::InstanceMigrated {
            process_instance_id,
            from_definition_id: source.id.clone(),
            to_definition_id: target.id.clone(),
        });
        self.store.commit(tree.delta()).await?;
        Ok(Ok(()))
    }
}
