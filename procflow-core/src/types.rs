use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Execution identifier. The root execution's id doubles as the
/// process-instance id.
pub type ExecutionId = Uuid;

/// Job identifier.
pub type JobId = Uuid;

/// Incident identifier.
pub type IncidentId = Uuid;

/// Event-subscription identifier.
pub type SubscriptionId = Uuid;

/// Activity identifier within a process definition.
pub type ActivityId = String;

/// Sequence-flow (transition) identifier within a process definition.
pub type TransitionId = String;

/// Process-definition identifier, `{key}:{version}`.
pub type DefinitionId = String;

/// Process variables. Values are opaque JSON; the engine only copies and
/// compares them, it never interprets their shape.
pub type VariableMap = BTreeMap<String, serde_json::Value>;

// ─── Execution ────────────────────────────────────────────────

/// One control-flow token in a process instance's hierarchical tree.
///
/// The tree is persisted as an arena of records with a `parent_id`
/// self-reference; the in-memory working set (`ExecutionTree`) maintains the
/// child index alongside. Scope executions own a variable frame visible to
/// their non-scope descendants until the next scope boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    /// `None` only for the process-instance root.
    pub parent_id: Option<ExecutionId>,
    pub process_instance_id: ExecutionId,
    pub process_definition_id: DefinitionId,
    /// Business key of the owning instance (root execution only).
    pub business_key: Option<String>,
    pub tenant_id: Option<String>,
    /// Current activity, `None` while traversing a transition or parked as a
    /// structural placeholder (e.g. the parent of concurrent children).
    pub activity_id: Option<ActivityId>,
    /// Set while the execution is on a sequence flow, between leaving the
    /// source activity and entering the target.
    pub transition_id: Option<TransitionId>,
    /// True if this execution owns a variable frame and activity stack frame.
    pub is_scope: bool,
    /// True for sibling tokens racing inside a shared parent scope.
    pub is_concurrent: bool,
    pub is_active: bool,
    pub suspended: bool,
    /// Start listeners have fired for the current activity. Gates end-listener
    /// invocation on cancellation: an activity that was never synchronously
    /// entered must not see its end listeners.
    pub activity_started: bool,
    /// Variable frame. Meaningful on scope executions; non-scope executions
    /// may carry execution-local values (loop counters, input-mapping
    /// results) that shadow the enclosing scope.
    pub variables: VariableMap,
    /// Join-barrier arrival counts, keyed by gateway activity id. Lives on
    /// the parent scope record so the version check on that record is the
    /// synchronization point for racing arrivals.
    pub join_arrivals: BTreeMap<ActivityId, u16>,
    /// Optimistic concurrency token. 0 = not yet persisted; the store bumps
    /// it on every successful write.
    pub version: u64,
}

impl Execution {
    /// True for the process-instance root.
    pub fn is_process_instance(&self) -> bool {
        self.parent_id.is_none()
    }
}

// ─── Event subscriptions ──────────────────────────────────────

/// Kind of catching event an execution can park on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Message,
    Signal,
}

/// Durable record that an execution is waiting for an external event.
///
/// Created when an execution parks on a catching event, consumed by
/// correlation, cancellation, or migration with `update_event_trigger`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: SubscriptionId,
    pub execution_id: ExecutionId,
    pub process_instance_id: ExecutionId,
    pub kind: EventKind,
    pub event_key: String,
    pub activity_id: ActivityId,
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ─── Jobs ─────────────────────────────────────────────────────

/// Atomic operation a continuation job resumes at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeOp {
    /// Resume before the activity's behavior runs (asynchronous-before).
    ActivityExecute,
    /// Resume on the outgoing transition, which is already recorded on the
    /// execution (asynchronous-after). Take listeners have not fired yet.
    TransitionNotifyListenerTake,
}

/// Remaining repetitions of a recurring timer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepeatSpec {
    pub remaining: u32,
    pub interval_ms: i64,
}

/// Typed job handler. Persisted as the opaque `handler_type`/`handler_cfg`
/// pair; in memory it is a closed enum so the scheduler dispatch is a single
/// match.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum JobHandler {
    /// Durable continuation of a suspended execution.
    AsyncContinuation {
        resume: ResumeOp,
        activity_id: ActivityId,
    },
    /// Timer firing against a parked execution. `repeat` is replaced by the
    /// next occurrence on each successful fire.
    Timer {
        activity_id: ActivityId,
        repeat: Option<RepeatSpec>,
    },
}

impl JobHandler {
    pub fn handler_type(&self) -> &'static str {
        match self {
            JobHandler::AsyncContinuation { .. } => "async-continuation",
            JobHandler::Timer { .. } => "timer",
        }
    }

    /// Activity the handler is bound to.
    pub fn activity_id(&self) -> &str {
        match self {
            JobHandler::AsyncContinuation { activity_id, .. } => activity_id,
            JobHandler::Timer { activity_id, .. } => activity_id,
        }
    }
}

/// Durable record of a suspended continuation.
///
/// Created in the same transaction that suspended the execution, never
/// orphaned. Deleted on successful execution (or replaced by the next
/// occurrence for recurring timers). `retries == 0` is terminal-failed and
/// keeps the record lockable for manual retry only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub execution_id: ExecutionId,
    pub process_instance_id: ExecutionId,
    pub process_definition_id: DefinitionId,
    pub tenant_id: Option<String>,
    pub handler: JobHandler,
    pub due_date: DateTime<Utc>,
    pub retries: u32,
    /// Must not run concurrently with other exclusive jobs of the same
    /// process instance (single writer per execution tree).
    pub exclusive: bool,
    /// Acquisition ordering, higher first.
    pub priority: i64,
    pub suspended: bool,
    pub lock_owner: Option<String>,
    pub lock_expiration: Option<DateTime<Utc>>,
    pub exception_message: Option<String>,
    /// Full error chain of the last failure, stored out-of-line by backends.
    pub exception_stacktrace: Option<String>,
    pub version: u64,
}

impl Job {
    /// Locked by some node with an unexpired lease.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        match (self.lock_owner.as_ref(), self.lock_expiration) {
            (Some(_), Some(exp)) => exp > now,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date <= now
    }

    /// Eligible for scheduler acquisition. A lock older than its expiration
    /// is treated as abandoned; terminal-failed jobs (retries 0) are left for
    /// manual retry.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        !self.suspended && self.retries > 0 && self.is_due(now) && !self.is_locked(now)
    }

    pub fn clear_lock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration = None;
    }
}

// ─── Incidents ────────────────────────────────────────────────

/// Durable, queryable fact that something went terminally wrong, independent
/// of the job's own lifecycle: it persists even after the job is deleted or
/// resolved, so operators can audit "this instance once failed here".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub process_instance_id: ExecutionId,
    pub execution_id: ExecutionId,
    pub activity_id: Option<ActivityId>,
    pub job_id: Option<JobId>,
    pub message: String,
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}
