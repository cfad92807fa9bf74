//! procflow-core: a business-process execution engine.
//!
//! Runs instances of workflow graphs as persistent, resumable units of work.
//! The core is the execution tree / atomic-operation state machine (the
//! process virtual machine) plus the durable job subsystem it hands
//! continuations to:
//!
//! - [`tree::ExecutionTree`] owns the hierarchical token tree of one
//!   process instance: scopes, concurrent branches, join barriers, variable
//!   frames.
//! - [`ops::Interpreter`] advances executions through discrete atomic
//!   operations until a path completes, parks on a wait state, or suspends
//!   at an asynchronous boundary.
//! - [`engine::ProcessEngine`] is the synchronous facade: start instances,
//!   correlate events, execute jobs, delete, migrate.
//! - [`scheduler::JobScheduler`] is the background domain: acquire due jobs
//!   under a lease, execute them on a worker pool, retry per the configured
//!   cycle, raise incidents when the budget is spent.
//! - [`migration`] re-points running instances between definition versions.
//!
//! State lives behind the [`store::EngineStore`] trait; the in-memory
//! backend is the default, a Postgres backend is available behind the
//! `postgres` feature.

pub mod clock;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod history;
pub mod migration;
pub mod ops;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod tree;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, SchedulerConfig};
pub use definition::{
    Activity, Behavior, BehaviorKind, Cardinality, Condition, DefinitionBuilder,
    DefinitionRepository, InMemoryDefinitions, IoMapping, Listener, ListenerEvent,
    ProcessDefinition, Transition,
};
pub use engine::{ProcessEngine, StartedInstance};
pub use error::{EngineError, StoreError};
pub use history::{CollectingHistory, HistoryEvent, HistoryRecorder, NullHistory};
pub use migration::{
    generate_plan, validate_plan, ActivityMatcher, EqualActivityMatcher,
    InstanceMigrationFailure, MigrationInstruction, MigrationPlan, MigrationReport,
    MigrationViolation,
};
pub use ops::{AtomicOp, Delegate, DelegateContext, DelegateRegistry, EventTrigger, Interpreter, RunEnd};
pub use retry::RetryCycle;
pub use scheduler::{JobScheduler, SchedulerHandle};
pub use store::{EngineStore, TreeDelta};
pub use store_memory::MemoryStore;
pub use tree::{ExecutionTree, JoinOutcome};
pub use types::{
    ActivityId, DefinitionId, EventKind, EventSubscription, Execution, ExecutionId, Incident,
    IncidentId, Job, JobHandler, JobId, RepeatSpec, ResumeOp, SubscriptionId, TransitionId,
    VariableMap,
};

#[cfg(feature = "postgres")]
pub use store_postgres::PostgresStore;
