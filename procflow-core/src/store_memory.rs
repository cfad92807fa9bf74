//! In-memory store: the default backend.
//!
//! A single mutex over the whole state makes every commit trivially atomic;
//! the optimistic version checks still run so the engine's conflict-retry
//! path behaves identically to a real database backend.

use crate::error::StoreError;
use crate::store::{EngineStore, TreeDelta};
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct State {
    executions: HashMap<ExecutionId, Execution>,
    jobs: HashMap<JobId, Job>,
    incidents: Vec<Incident>,
    subscriptions: HashMap<SubscriptionId, EventSubscription>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Total number of persisted jobs (test observability).
    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    /// All persisted incidents (test observability).
    pub fn incidents(&self) -> Vec<Incident> {
        self.lock().incidents.clone()
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn execution(&self, id: ExecutionId) -> Result<Option<Execution>, StoreError> {
        Ok(self.lock().executions.get(&id).cloned())
    }

    async fn instance_executions(
        &self,
        process_instance_id: ExecutionId,
    ) -> Result<Vec<Execution>, StoreError> {
        Ok(self
            .lock()
            .executions
            .values()
            .filter(|e| e.process_instance_id == process_instance_id)
            .cloned()
            .collect())
    }

    async fn commit(&self, delta: TreeDelta) -> Result<(), StoreError> {
        let mut state = self.lock();

        // Phase 1: every precondition, before any write.
        for e in &delta.inserted_executions {
            if state.executions.contains_key(&e.id) {
                return Err(StoreError::Conflict {
                    entity: "execution",
                    id: e.id.to_string(),
                });
            }
        }
        for e in &delta.updated_executions {
            match state.executions.get(&e.id) {
                Some(stored) if stored.version == e.version => {}
                _ => {
                    return Err(StoreError::Conflict {
                        entity: "execution",
                        id: e.id.to_string(),
                    })
                }
            }
        }
        for (id, version) in &delta.removed_executions {
            match state.executions.get(id) {
                Some(stored) if stored.version == *version => {}
                _ => {
                    return Err(StoreError::Conflict {
                        entity: "execution",
                        id: id.to_string(),
                    })
                }
            }
        }
        for j in &delta.updated_jobs {
            match state.jobs.get(&j.id) {
                Some(stored) if stored.version == j.version => {}
                _ => {
                    return Err(StoreError::Conflict {
                        entity: "job",
                        id: j.id.to_string(),
                    })
                }
            }
        }

        // Phase 2: apply.
        for mut e in delta.inserted_executions {
            e.version = 1;
            state.executions.insert(e.id, e);
        }
        for mut e in delta.updated_executions {
            e.version += 1;
            state.executions.insert(e.id, e);
        }
        for (id, _) in delta.removed_executions {
            state.executions.remove(&id);
        }
        for mut j in delta.created_jobs {
            j.version = 1;
            state.jobs.insert(j.id, j);
        }
        for mut j in delta.updated_jobs {
            j.version += 1;
            state.jobs.insert(j.id, j);
        }
        for id in delta.deleted_jobs {
            state.jobs.remove(&id);
        }
        for s in delta.created_subscriptions {
            state.subscriptions.insert(s.id, s);
        }
        for id in delta.deleted_subscriptions {
            state.subscriptions.remove(&id);
        }
        Ok(())
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn instance_jobs(
        &self,
        process_instance_id: ExecutionId,
    ) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .lock()
            .jobs
            .values()
            .filter(|j| j.process_instance_id == process_instance_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn acquire_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lock_owner: &str,
        lock_duration: chrono::Duration,
    ) -> Result<Vec<Job>, StoreError> {
        let mut state = self.lock();

        // Instances that already hold a live exclusive lock are off limits
        // for further exclusive work.
        let mut exclusive_held: HashSet<ExecutionId> = state
            .jobs
            .values()
            .filter(|j| j.exclusive && j.is_locked(now))
            .map(|j| j.process_instance_id)
            .collect();

        let mut candidates: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.is_acquirable(now))
            .map(|j| j.id)
            .collect();
        candidates.sort_by_key(|id| {
            let j = &state.jobs[id];
            (std::cmp::Reverse(j.priority), j.due_date, j.id)
        });

        let mut acquired = Vec::new();
        for id in candidates {
            if acquired.len() >= limit {
                break;
            }
            let job = &state.jobs[&id];
            if job.exclusive && exclusive_held.contains(&job.process_instance_id) {
                continue;
            }
            if job.exclusive {
                exclusive_held.insert(job.process_instance_id);
            }
            let job = state.jobs.get_mut(&id).ok_or_else(|| StoreError::NotFound {
                entity: "job",
                id: id.to_string(),
            })?;
            job.lock_owner = Some(lock_owner.to_string());
            job.lock_expiration = Some(now + lock_duration);
            job.version += 1;
            acquired.push(job.clone());
        }
        Ok(acquired)
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.lock();
        match state.jobs.get(&job.id) {
            Some(stored) if stored.version == job.version => {
                let mut updated = job.clone();
                updated.version += 1;
                state.jobs.insert(job.id, updated);
                Ok(())
            }
            Some(_) => Err(StoreError::Conflict {
                entity: "job",
                id: job.id.to_string(),
            }),
            None => Err(StoreError::NotFound {
                entity: "job",
                id: job.id.to_string(),
            }),
        }
    }

    async fn delete_job(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.lock().jobs.remove(&id).is_some())
    }

    async fn save_incident(&self, incident: &Incident) -> Result<(), StoreError> {
        self.lock().incidents.push(incident.clone());
        Ok(())
    }

    async fn instance_incidents(
        &self,
        process_instance_id: ExecutionId,
    ) -> Result<Vec<Incident>, StoreError> {
        Ok(self
            .lock()
            .incidents
            .iter()
            .filter(|i| i.process_instance_id == process_instance_id)
            .cloned()
            .collect())
    }

    async fn resolve_job_incidents(
        &self,
        job_id: JobId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        for incident in self.lock().incidents.iter_mut() {
            if incident.job_id == Some(job_id) && incident.resolved_at.is_none() {
                incident.resolved_at = Some(at);
            }
        }
        Ok(())
    }

    async fn find_subscribers(
        &self,
        kind: EventKind,
        event_key: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<EventSubscription>, StoreError> {
        let mut subs: Vec<EventSubscription> = self
            .lock()
            .subscriptions
            .values()
            .filter(|s| {
                s.kind == kind
                    && s.event_key == event_key
                    && tenant_id.map(|t| s.tenant_id.as_deref() == Some(t)).unwrap_or(true)
            })
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.id);
        Ok(subs)
    }

    async fn instance_subscriptions(
        &self,
        process_instance_id: ExecutionId,
    ) -> Result<Vec<EventSubscription>, StoreError> {
        let mut subs: Vec<EventSubscription> = self
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.process_instance_id == process_instance_id)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.id);
        Ok(subs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn job(instance: ExecutionId, exclusive: bool, priority: i64) -> Job {
        Job {
            id: Uuid::now_v7(),
            execution_id: Uuid::now_v7(),
            process_instance_id: instance,
            process_definition_id: "p:1".into(),
            tenant_id: None,
            handler: JobHandler::AsyncContinuation {
                resume: ResumeOp::ActivityExecute,
                activity_id: "a".into(),
            },
            due_date: now(),
            retries: 3,
            exclusive,
            priority,
            suspended: false,
            lock_owner: None,
            lock_expiration: None,
            exception_message: None,
            exception_stacktrace: None,
            version: 0,
        }
    }

    fn delta_with_jobs(jobs: Vec<Job>) -> TreeDelta {
        TreeDelta {
            created_jobs: jobs,
            ..TreeDelta::default()
        }
    }

    #[tokio::test]
    async fn commit_rejects_stale_execution_version() {
        let store = MemoryStore::new();
        let exec = Execution {
            id: Uuid::now_v7(),
            parent_id: None,
            process_instance_id: Uuid::now_v7(),
            process_definition_id: "p:1".into(),
            business_key: None,
            tenant_id: None,
            activity_id: Some("a".into()),
            transition_id: None,
            is_scope: true,
            is_concurrent: false,
            is_active: true,
            suspended: false,
            activity_started: false,
            variables: VariableMap::new(),
            join_arrivals: Default::default(),
            version: 0,
        };
        store
            .commit(TreeDelta {
                inserted_executions: vec![exec.clone()],
                ..TreeDelta::default()
            })
            .await
            .unwrap();

        // First writer wins.
        let mut fresh = store.execution(exec.id).await.unwrap().unwrap();
        assert_eq!(fresh.version, 1);
        fresh.is_active = false;
        store
            .commit(TreeDelta {
                updated_executions: vec![fresh.clone()],
                ..TreeDelta::default()
            })
            .await
            .unwrap();

        // Second writer re-submitting the stale version conflicts.
        let res = store
            .commit(TreeDelta {
                updated_executions: vec![fresh],
                ..TreeDelta::default()
            })
            .await;
        assert!(matches!(res, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn acquisition_orders_by_priority_then_due_date() {
        let store = MemoryStore::new();
        let instance_a = Uuid::now_v7();
        let instance_b = Uuid::now_v7();
        let mut low = job(instance_a, false, 0);
        low.due_date = now() - chrono::Duration::minutes(5);
        let high = job(instance_b, false, 10);
        store
            .commit(delta_with_jobs(vec![low.clone(), high.clone()]))
            .await
            .unwrap();

        let batch = store
            .acquire_jobs(now(), 10, "node-1", chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, high.id, "higher priority first");
        assert_eq!(batch[1].id, low.id);
        assert!(batch.iter().all(|j| j.lock_owner.as_deref() == Some("node-1")));
    }

    #[tokio::test]
    async fn exclusive_jobs_of_one_instance_never_locked_twice() {
        let store = MemoryStore::new();
        let instance = Uuid::now_v7();
        let j1 = job(instance, true, 0);
        let j2 = job(instance, true, 0);
        let timer = job(instance, false, 0);
        store
            .commit(delta_with_jobs(vec![j1, j2, timer.clone()]))
            .await
            .unwrap();

        let batch = store
            .acquire_jobs(now(), 10, "node-1", chrono::Duration::minutes(5))
            .await
            .unwrap();
        let exclusive: Vec<_> = batch.iter().filter(|j| j.exclusive).collect();
        assert_eq!(exclusive.len(), 1, "one exclusive writer per instance");
        // The non-exclusive timer rides along with the exclusive job.
        assert!(batch.iter().any(|j| j.id == timer.id));

        // Second node: the remaining exclusive job stays off limits while
        // the lease is live.
        let batch2 = store
            .acquire_jobs(now(), 10, "node-2", chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert!(batch2.iter().all(|j| !j.exclusive));
    }

    #[tokio::test]
    async fn expired_lease_is_reacquirable() {
        let store = MemoryStore::new();
        let j = job(Uuid::now_v7(), true, 0);
        store.commit(delta_with_jobs(vec![j.clone()])).await.unwrap();

        let got = store
            .acquire_jobs(now(), 10, "node-1", chrono::Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);

        // Lease still live: nothing to take.
        let none = store
            .acquire_jobs(now() + chrono::Duration::seconds(10), 10, "node-2", chrono::Duration::seconds(30))
            .await
            .unwrap();
        assert!(none.is_empty());

        // Worker died; lease expired; the job is treated as abandoned.
        let later = now() + chrono::Duration::seconds(31);
        let reacquired = store
            .acquire_jobs(later, 10, "node-2", chrono::Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(reacquired.len(), 1);
        assert_eq!(reacquired[0].lock_owner.as_deref(), Some("node-2"));
    }

    #[tokio::test]
    async fn update_job_is_version_checked() {
        let store = MemoryStore::new();
        let j = job(Uuid::now_v7(), true, 0);
        store.commit(delta_with_jobs(vec![j.clone()])).await.unwrap();

        let mut loaded = store.job(j.id).await.unwrap().unwrap();
        loaded.retries = 2;
        store.update_job(&loaded).await.unwrap();

        // Stale copy loses.
        let res = store.update_job(&loaded).await;
        assert!(matches!(res, Err(StoreError::Conflict { .. })));

        assert_eq!(store.job(j.id).await.unwrap().unwrap().retries, 2);
    }

    #[tokio::test]
    async fn delete_job_is_replay_safe() {
        let store = MemoryStore::new();
        let j = job(Uuid::now_v7(), true, 0);
        store.commit(delta_with_jobs(vec![j.clone()])).await.unwrap();
        assert!(store.delete_job(j.id).await.unwrap());
        assert!(!store.delete_job(j.id).await.unwrap(), "second delete is a no-op");
    }
}
