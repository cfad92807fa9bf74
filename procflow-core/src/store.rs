//! Persistence seam for all engine state.
//!
//! The engine and scheduler operate exclusively through this trait, enabling
//! pluggable backends (MemoryStore by default, Postgres behind the
//! `postgres` feature). Backends must provide per-record optimistic
//! versioning for executions and jobs, and an atomic apply of a whole
//! [`TreeDelta`]: every version precondition is checked before anything is
//! written, and any mismatch fails the commit with
//! [`StoreError::Conflict`](crate::error::StoreError) so the caller can
//! re-run the operation.

use crate::error::StoreError;
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// The atomic change set produced by one interpreter run over an
/// [`ExecutionTree`](crate::tree::ExecutionTree). Jobs and subscriptions
/// ride in the same commit as the execution changes that caused them.
#[derive(Debug, Default)]
pub struct TreeDelta {
    pub process_instance_id: ExecutionId,
    /// New executions; stored with version 1.
    pub inserted_executions: Vec<Execution>,
    /// Changed executions carrying the version they were loaded at; the
    /// store compares and bumps.
    pub updated_executions: Vec<Execution>,
    /// Destroyed executions as (id, expected version).
    pub removed_executions: Vec<(ExecutionId, u64)>,
    pub created_jobs: Vec<Job>,
    /// Changed jobs carrying their loaded version (migration re-pointing,
    /// suspension sweeps).
    pub updated_jobs: Vec<Job>,
    /// Deleting an absent job is a no-op, not a conflict: a replayed
    /// continuation may race its own cleanup.
    pub deleted_jobs: Vec<JobId>,
    pub created_subscriptions: Vec<EventSubscription>,
    pub deleted_subscriptions: Vec<SubscriptionId>,
}

impl TreeDelta {
    pub fn is_empty(&self) -> bool {
        self.inserted_executions.is_empty()
            && self.updated_executions.is_empty()
            && self.removed_executions.is_empty()
            && self.created_jobs.is_empty()
            && self.updated_jobs.is_empty()
            && self.deleted_jobs.is_empty()
            && self.created_subscriptions.is_empty()
            && self.deleted_subscriptions.is_empty()
    }
}

#[async_trait]
pub trait EngineStore: Send + Sync {
    // ── Executions ──

    async fn execution(&self, id: ExecutionId) -> Result<Option<Execution>, StoreError>;

    async fn instance_executions(
        &self,
        process_instance_id: ExecutionId,
    ) -> Result<Vec<Execution>, StoreError>;

    /// Apply one logical transaction. All-or-nothing; version preconditions
    /// on every updated/removed record.
    async fn commit(&self, delta: TreeDelta) -> Result<(), StoreError>;

    // ── Jobs ──

    async fn job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    async fn instance_jobs(
        &self,
        process_instance_id: ExecutionId,
    ) -> Result<Vec<Job>, StoreError>;

    /// Select up to `limit` due, unlocked, non-suspended jobs ordered by
    /// priority (descending) then due date, and lock them for `lock_owner`
    /// with a lease expiring `lock_duration` from `now`. Exclusive jobs are
    /// skipped while another exclusive job of the same instance is locked
    /// (or was just taken into this batch): one writer per execution tree.
    async fn acquire_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lock_owner: &str,
        lock_duration: chrono::Duration,
    ) -> Result<Vec<Job>, StoreError>;

    /// Version-checked single-job update (retry bookkeeping, unlock,
    /// manual retries). The stored version becomes `job.version + 1`.
    async fn update_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Returns `false` when the job was already gone (replay no-op).
    async fn delete_job(&self, id: JobId) -> Result<bool, StoreError>;

    // ── Incidents ──

    async fn save_incident(&self, incident: &Incident) -> Result<(), StoreError>;

    async fn instance_incidents(
        &self,
        process_instance_id: ExecutionId,
    ) -> Result<Vec<Incident>, StoreError>;

    /// Mark all open incidents of a job resolved (manual retry restored).
    async fn resolve_job_incidents(
        &self,
        job_id: JobId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // ── Event-subscription directory ──

    async fn find_subscribers(
        &self,
        kind: EventKind,
        event_key: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<EventSubscription>, StoreError>;

    async fn instance_subscriptions(
        &self,
        process_instance_id: ExecutionId,
    ) -> Result<Vec<EventSubscription>, StoreError>;
}
