//! Background job scheduler: the second concurrency domain.
//!
//! One acquisition loop polls the store for due jobs, locks a batch under a
//! time-bounded lease, and dispatches each job to a semaphore-bounded worker
//! pool. Workers never share a job; exclusivity is enforced at acquisition
//! time, so two exclusive jobs of one process instance are never in flight
//! together. The scheduler owns no global state: it is constructed once at
//! startup and torn down through its [`SchedulerHandle`].

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::engine::ProcessEngine;
use crate::store::EngineStore;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

pub struct JobScheduler {
    engine: Arc<ProcessEngine>,
    config: SchedulerConfig,
}

impl JobScheduler {
    pub fn new(engine: Arc<ProcessEngine>, config: SchedulerConfig) -> Self {
        Self { engine, config }
    }

    /// Spawn the acquisition loop and return the handle used to stop it.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(acquisition_loop(self.engine, self.config, shutdown_rx));
        SchedulerHandle { shutdown_tx, task }
    }
}

/// Explicit lifecycle handle for the scheduler. Dropping it without calling
/// [`shutdown`](SchedulerHandle::shutdown) leaves the loop running on the
/// runtime; in-flight jobs always finish on their worker, and anything a
/// crashed worker held is recovered via lease expiry.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop acquiring and wait for the acquisition loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

async fn acquisition_loop(
    engine: Arc<ProcessEngine>,
    config: SchedulerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tracing::info!(
        lock_owner = %config.lock_owner,
        workers = config.worker_count,
        batch = config.batch_size,
        "job scheduler started"
    );
    let workers = Arc::new(Semaphore::new(config.worker_count));

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let now = engine.clock().now();
        match engine
            .store()
            .acquire_jobs(now, config.batch_size, &config.lock_owner, config.lock_duration)
            .await
        {
            Ok(jobs) => {
                if !jobs.is_empty() {
                    tracing::debug!(count = jobs.len(), "acquired job batch");
                }
                for job in jobs {
                    let permit = match workers.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => return,
                    };
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        let job_id = job.id;
                        if let Err(e) = engine.run_job(job_id).await {
                            // Retry bookkeeping already ran inside run_job;
                            // this is operator-facing noise only.
                            tracing::warn!(job = %job_id, error = %e, "job execution failed");
                        }
                        drop(permit);
                    });
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "job acquisition failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = shutdown_rx.changed() => break,
        }
    }
    tracing::info!("job scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Activity, Behavior, DefinitionBuilder, InMemoryDefinitions};
    use crate::ops::{DelegateContext, DelegateRegistry};
    use crate::store_memory::MemoryStore;
    use crate::types::VariableMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn wait_until_inactive(engine: &ProcessEngine, pids: &[crate::types::ExecutionId]) {
        for _ in 0..200 {
            let mut all_done = true;
            for pid in pids {
                if engine.is_instance_active(*pid).await.unwrap() {
                    all_done = false;
                    break;
                }
            }
            if all_done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("instances still active after 2s");
    }

    fn engine_with_async_service(
        calls: Arc<AtomicUsize>,
    ) -> (Arc<ProcessEngine>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let definitions = Arc::new(InMemoryDefinitions::new());
        definitions
            .deploy(
                DefinitionBuilder::new("ship")
                    .activity(Activity::new("start", Behavior::Task))
                    .activity(Activity::service("work", "doWork").async_before())
                    .activity(Activity::new("done", Behavior::End))
                    .transition("f1", "start", "work")
                    .transition("f2", "work", "done")
                    .initial("start"),
            )
            .unwrap();
        let mut delegates = DelegateRegistry::new();
        delegates.register("doWork", move |_: &mut DelegateContext<'_>| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let engine = Arc::new(
            ProcessEngine::new(store.clone(), definitions).with_delegates(delegates),
        );
        (engine, store)
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            lock_owner: "test-node".into(),
            worker_count: 4,
            batch_size: 10,
            poll_interval: Duration::from_millis(10),
            lock_duration: chrono::Duration::seconds(30),
        }
    }

    #[tokio::test]
    async fn scheduler_drives_parked_instances_to_completion() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (engine, store) = engine_with_async_service(calls.clone());

        let mut started = Vec::new();
        for _ in 0..5 {
            let s = engine
                .start_process_by_key("ship", None, None, VariableMap::new())
                .await
                .unwrap();
            assert!(!s.ended, "parked at the async boundary");
            started.push(s.process_instance_id);
        }
        assert_eq!(store.job_count(), 5);

        let handle = JobScheduler::new(engine.clone(), fast_config()).start();
        wait_until_inactive(&engine, &started).await;
        handle.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(store.job_count(), 0, "continuations deleted on success");
    }

    #[tokio::test]
    async fn shutdown_stops_acquisition() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (engine, store) = engine_with_async_service(calls.clone());

        let handle = JobScheduler::new(engine.clone(), fast_config()).start();
        handle.shutdown().await;

        // A job created after shutdown stays untouched.
        engine
            .start_process_by_key("ship", None, None, VariableMap::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.job_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
