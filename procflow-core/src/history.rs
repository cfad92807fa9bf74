//! Fire-and-forget history notifications.
//!
//! The recorder is notified at defined atomic-operation boundaries but can
//! never influence control flow: the trait is infallible, and
//! implementations are expected to swallow (and log) their own errors rather
//! than abort the engine's transaction.

use crate::types::*;
use std::sync::Mutex;

#[derive(Clone, Debug)]
pub enum HistoryEvent {
    ProcessInstanceStarted {
        process_instance_id: ExecutionId,
        process_definition_id: DefinitionId,
        business_key: Option<String>,
        tenant_id: Option<String>,
    },
    ProcessInstanceEnded {
        process_instance_id: ExecutionId,
    },
    ProcessInstanceCanceled {
        process_instance_id: ExecutionId,
        reason: String,
    },
    ActivityStarted {
        process_instance_id: ExecutionId,
        execution_id: ExecutionId,
        activity_id: ActivityId,
    },
    ActivityEnded {
        process_instance_id: ExecutionId,
        execution_id: ExecutionId,
        activity_id: ActivityId,
    },
    JobExecuted {
        process_instance_id: ExecutionId,
        job_id: JobId,
    },
    JobFailed {
        process_instance_id: ExecutionId,
        job_id: JobId,
        message: String,
        retries_left: u32,
    },
    IncidentCreated {
        process_instance_id: ExecutionId,
        incident_id: IncidentId,
        job_id: Option<JobId>,
    },
    IncidentResolved {
        process_instance_id: ExecutionId,
        job_id: JobId,
    },
    InstanceMigrated {
        process_instance_id: ExecutionId,
        from_definition_id: DefinitionId,
        to_definition_id: DefinitionId,
    },
}

pub trait HistoryRecorder: Send + Sync {
    fn record(&self, event: HistoryEvent);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullHistory;

impl HistoryRecorder for NullHistory {
    fn record(&self, _event: HistoryEvent) {}
}

/// Buffers events for assertions in tests.
#[derive(Debug, Default)]
pub struct CollectingHistory {
    events: Mutex<Vec<HistoryEvent>>,
}

impl CollectingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HistoryEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl HistoryRecorder for CollectingHistory {
    fn record(&self, event: HistoryEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}
