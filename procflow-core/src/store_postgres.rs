//! Postgres store (behind the `postgres` feature).
//!
//! Optimistic versioning maps to version-guarded UPDATE/DELETE statements:
//! zero affected rows means another transaction won, and the whole commit
//! rolls back with `Conflict`. Job acquisition uses `FOR UPDATE SKIP LOCKED`
//! so competing scheduler nodes never block each other on the same rows;
//! the lease itself is plain data (`lock_owner`/`lock_exp_time`), which is
//! what lets an expired lease from a crashed node be re-acquired.

use crate::error::StoreError;
use crate::store::{EngineStore, TreeDelta};
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::HashSet;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pf_execution (
        id UUID PRIMARY KEY,
        parent_id UUID,
        proc_inst_id UUID NOT NULL,
        proc_def_id TEXT NOT NULL,
        business_key TEXT,
        tenant_id TEXT,
        activity_id TEXT,
        transition_id TEXT,
        is_scope BOOLEAN NOT NULL,
        is_concurrent BOOLEAN NOT NULL,
        is_active BOOLEAN NOT NULL,
        suspended BOOLEAN NOT NULL,
        activity_started BOOLEAN NOT NULL,
        variables JSONB NOT NULL,
        join_arrivals JSONB NOT NULL,
        version BIGINT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_pf_execution_inst ON pf_execution (proc_inst_id)",
    r#"
    CREATE TABLE IF NOT EXISTS pf_job (
        id UUID PRIMARY KEY,
        execution_id UUID NOT NULL,
        proc_inst_id UUID NOT NULL,
        proc_def_id TEXT NOT NULL,
        tenant_id TEXT,
        handler_type TEXT NOT NULL,
        handler_cfg JSONB NOT NULL,
        due_date TIMESTAMPTZ NOT NULL,
        retries INTEGER NOT NULL,
        exclusive BOOLEAN NOT NULL,
        priority BIGINT NOT NULL,
        suspended BOOLEAN NOT NULL,
        lock_owner TEXT,
        lock_exp_time TIMESTAMPTZ,
        exception_msg TEXT,
        exception_stacktrace TEXT,
        version BIGINT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_pf_job_due ON pf_job (due_date, priority)",
    "CREATE INDEX IF NOT EXISTS idx_pf_job_inst ON pf_job (proc_inst_id)",
    r#"
    CREATE TABLE IF NOT EXISTS pf_incident (
        id UUID PRIMARY KEY,
        proc_inst_id UUID NOT NULL,
        execution_id UUID NOT NULL,
        activity_id TEXT,
        job_id UUID,
        message TEXT NOT NULL,
        tenant_id TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        resolved_at TIMESTAMPTZ
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_pf_incident_inst ON pf_incident (proc_inst_id)",
    r#"
    CREATE TABLE IF NOT EXISTS pf_event_subscription (
        id UUID PRIMARY KEY,
        execution_id UUID NOT NULL,
        proc_inst_id UUID NOT NULL,
        kind TEXT NOT NULL,
        event_key TEXT NOT NULL,
        activity_id TEXT NOT NULL,
        tenant_id TEXT,
        created_at TIMESTAMPTZ NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_pf_event_sub_key ON pf_event_subscription (kind, event_key)",
];

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(anyhow::Error::new(e))
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value)
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))
}

fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<Execution, StoreError> {
    Ok(Execution {
        id: row.try_get("id").map_err(backend)?,
        parent_id: row.try_get("parent_id").map_err(backend)?,
        process_instance_id: row.try_get("proc_inst_id").map_err(backend)?,
        process_definition_id: row.try_get("proc_def_id").map_err(backend)?,
        business_key: row.try_get("business_key").map_err(backend)?,
        tenant_id: row.try_get("tenant_id").map_err(backend)?,
        activity_id: row.try_get("activity_id").map_err(backend)?,
        transition_id: row.try_get("transition_id").map_err(backend)?,
        is_scope: row.try_get("is_scope").map_err(backend)?,
        is_concurrent: row.try_get("is_concurrent").map_err(backend)?,
        is_active: row.try_get("is_active").map_err(backend)?,
        suspended: row.try_get("suspended").map_err(backend)?,
        activity_started: row.try_get("activity_started").map_err(backend)?,
        variables: serde_json::from_value(row.try_get("variables").map_err(backend)?)
            .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?,
        join_arrivals: serde_json::from_value(row.try_get("join_arrivals").map_err(backend)?)
            .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?,
        version: row.try_get::<i64, _>("version").map_err(backend)? as u64,
    })
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    Ok(Job {
        id: row.try_get("id").map_err(backend)?,
        execution_id: row.try_get("execution_id").map_err(backend)?,
        process_instance_id: row.try_get("proc_inst_id").map_err(backend)?,
        process_definition_id: row.try_get("proc_def_id").map_err(backend)?,
        tenant_id: row.try_get("tenant_id").map_err(backend)?,
        handler: serde_json::from_value(row.try_get("handler_cfg").map_err(backend)?)
            .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?,
        due_date: row.try_get("due_date").map_err(backend)?,
        retries: row.try_get::<i32, _>("retries").map_err(backend)? as u32,
        exclusive: row.try_get("exclusive").map_err(backend)?,
        priority: row.try_get("priority").map_err(backend)?,
        suspended: row.try_get("suspended").map_err(backend)?,
        lock_owner: row.try_get("lock_owner").map_err(backend)?,
        lock_expiration: row.try_get("lock_exp_time").map_err(backend)?,
        exception_message: row.try_get("exception_msg").map_err(backend)?,
        exception_stacktrace: row.try_get("exception_stacktrace").map_err(backend)?,
        version: row.try_get::<i64, _>("version").map_err(backend)? as u64,
    })
}

fn row_to_subscription(row: &sqlx::postgres::PgRow) -> Result<EventSubscription, StoreError> {
    let kind: String = row.try_get("kind").map_err(backend)?;
    Ok(EventSubscription {
        id: row.try_get("id").map_err(backend)?,
        execution_id: row.try_get("execution_id").map_err(backend)?,
        process_instance_id: row.try_get("proc_inst_id").map_err(backend)?,
        kind: match kind.as_str() {
            "signal" => EventKind::Signal,
            _ => EventKind::Message,
        },
        event_key: row.try_get("event_key").map_err(backend)?,
        activity_id: row.try_get("activity_id").map_err(backend)?,
        tenant_id: row.try_get("tenant_id").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

fn row_to_incident(row: &sqlx::postgres::PgRow) -> Result<Incident, StoreError> {
    Ok(Incident {
        id: row.try_get("id").map_err(backend)?,
        process_instance_id: row.try_get("proc_inst_id").map_err(backend)?,
        execution_id: row.try_get("execution_id").map_err(backend)?,
        activity_id: row.try_get("activity_id").map_err(backend)?,
        job_id: row.try_get("job_id").map_err(backend)?,
        message: row.try_get("message").map_err(backend)?,
        tenant_id: row.try_get("tenant_id").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        resolved_at: row.try_get("resolved_at").map_err(backend)?,
    })
}

fn kind_str(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Message => "message",
        EventKind::Signal => "signal",
    }
}

const INSERT_EXECUTION: &str = r#"
    INSERT INTO pf_execution (
        id, parent_id, proc_inst_id, proc_def_id, business_key, tenant_id,
        activity_id, transition_id, is_scope, is_concurrent, is_active,
        suspended, activity_started, variables, join_arrivals, version
    ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)
    ON CONFLICT (id) DO NOTHING"#;

const UPDATE_EXECUTION: &str = r#"
    UPDATE pf_execution SET
        parent_id = $2, activity_id = $3, transition_id = $4, is_scope = $5,
        is_concurrent = $6, is_active = $7, suspended = $8,
        activity_started = $9, variables = $10, join_arrivals = $11,
        version = version + 1
    WHERE id = $1 AND version = $12"#;

const INSERT_JOB: &str = r#"
    INSERT INTO pf_job (
        id, execution_id, proc_inst_id, proc_def_id, tenant_id, handler_type,
        handler_cfg, due_date, retries, exclusive, priority, suspended,
        lock_owner, lock_exp_time, exception_msg, exception_stacktrace, version
    ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
    ON CONFLICT (id) DO NOTHING"#;

const UPDATE_JOB: &str = r#"
    UPDATE pf_job SET
        proc_def_id = $2, handler_type = $3, handler_cfg = $4, due_date = $5,
        retries = $6, suspended = $7, lock_owner = $8, lock_exp_time = $9,
        exception_msg = $10, exception_stacktrace = $11, version = version + 1
    WHERE id = $1 AND version = $12"#;

async fn insert_execution(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    e: &Execution,
) -> Result<bool, StoreError> {
    let res = sqlx::query(INSERT_EXECUTION)
        .bind(e.id)
        .bind(e.parent_id)
        .bind(e.process_instance_id)
        .bind(&e.process_definition_id)
        .bind(&e.business_key)
        .bind(&e.tenant_id)
        .bind(&e.activity_id)
        .bind(&e.transition_id)
        .bind(e.is_scope)
        .bind(e.is_concurrent)
        .bind(e.is_active)
        .bind(e.suspended)
        .bind(e.activity_started)
        .bind(encode_json(&e.variables)?)
        .bind(encode_json(&e.join_arrivals)?)
        .bind(1i64)
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    Ok(res.rows_affected() == 1)
}

async fn insert_job(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    j: &Job,
) -> Result<bool, StoreError> {
    let res = sqlx::query(INSERT_JOB)
        .bind(j.id)
        .bind(j.execution_id)
        .bind(j.process_instance_id)
        .bind(&j.process_definition_id)
        .bind(&j.tenant_id)
        .bind(j.handler.handler_type())
        .bind(encode_json(&j.handler)?)
        .bind(j.due_date)
        .bind(j.retries as i32)
        .bind(j.exclusive)
        .bind(j.priority)
        .bind(j.suspended)
        .bind(&j.lock_owner)
        .bind(j.lock_expiration)
        .bind(&j.exception_message)
        .bind(&j.exception_stacktrace)
        .bind(1i64)
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    Ok(res.rows_affected() == 1)
}

async fn update_job_in(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    j: &Job,
) -> Result<bool, StoreError> {
    let res = sqlx::query(UPDATE_JOB)
        .bind(j.id)
        .bind(&j.process_definition_id)
        .bind(j.handler.handler_type())
        .bind(encode_json(&j.handler)?)
        .bind(j.due_date)
        .bind(j.retries as i32)
        .bind(j.suspended)
        .bind(&j.lock_owner)
        .bind(j.lock_expiration)
        .bind(&j.exception_message)
        .bind(&j.exception_stacktrace)
        .bind(j.version as i64)
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    Ok(res.rows_affected() == 1)
}

#[async_trait]
impl EngineStore for PostgresStore {
    async fn execution(&self, id: ExecutionId) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query("SELECT * FROM pf_execution WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(row_to_execution).transpose()
    }

    async fn instance_executions(
        &self,
        process_instance_id: ExecutionId,
    ) -> Result<Vec<Execution>, StoreError> {
        let rows = sqlx::query("SELECT * FROM pf_execution WHERE proc_inst_id = $1 ORDER BY id")
            .bind(process_instance_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(row_to_execution).collect()
    }

    async fn commit(&self, delta: TreeDelta) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        for e in &delta.inserted_executions {
            if !insert_execution(&mut tx, e).await? {
                return Err(StoreError::Conflict {
                    entity: "execution",
                    id: e.id.to_string(),
                });
            }
        }
        for e in &delta.updated_executions {
            let res = sqlx::query(UPDATE_EXECUTION)
                .bind(e.id)
                .bind(e.parent_id)
                .bind(&e.activity_id)
                .bind(&e.transition_id)
                .bind(e.is_scope)
                .bind(e.is_concurrent)
                .bind(e.is_active)
                .bind(e.suspended)
                .bind(e.activity_started)
                .bind(encode_json(&e.variables)?)
                .bind(encode_json(&e.join_arrivals)?)
                .bind(e.version as i64)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            if res.rows_affected() == 0 {
                return Err(StoreError::Conflict {
                    entity: "execution",
                    id: e.id.to_string(),
                });
            }
        }
        for (id, version) in &delta.removed_executions {
            let res = sqlx::query("DELETE FROM pf_execution WHERE id = $1 AND version = $2")
                .bind(id)
                .bind(*version as i64)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            if res.rows_affected() == 0 {
                return Err(StoreError::Conflict {
                    entity: "execution",
                    id: id.to_string(),
                });
            }
        }
        for j in &delta.created_jobs {
            if !insert_job(&mut tx, j).await? {
                return Err(StoreError::Conflict {
                    entity: "job",
                    id: j.id.to_string(),
                });
            }
        }
        for j in &delta.updated_jobs {
            if !update_job_in(&mut tx, j).await? {
                return Err(StoreError::Conflict {
                    entity: "job",
                    id: j.id.to_string(),
                });
            }
        }
        for id in &delta.deleted_jobs {
            sqlx::query("DELETE FROM pf_job WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }
        for s in &delta.created_subscriptions {
            sqlx::query(
                r#"INSERT INTO pf_event_subscription
                   (id, execution_id, proc_inst_id, kind, event_key, activity_id, tenant_id, created_at)
                   VALUES ($1,$2,$3,$4,$5,$6,$7,$8)"#,
            )
            .bind(s.id)
            .bind(s.execution_id)
            .bind(s.process_instance_id)
            .bind(kind_str(s.kind))
            .bind(&s.event_key)
            .bind(&s.activity_id)
            .bind(&s.tenant_id)
            .bind(s.created_at)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }
        for id in &delta.deleted_subscriptions {
            sqlx::query("DELETE FROM pf_event_subscription WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM pf_job WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn instance_jobs(
        &self,
        process_instance_id: ExecutionId,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query("SELECT * FROM pf_job WHERE proc_inst_id = $1 ORDER BY id")
            .bind(process_instance_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(row_to_job).collect()
    }

    async fn acquire_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lock_owner: &str,
        lock_duration: chrono::Duration,
    ) -> Result<Vec<Job>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let rows = sqlx::query(
            r#"SELECT * FROM pf_job
               WHERE suspended = FALSE
                 AND retries > 0
                 AND due_date <= $1
                 AND (lock_owner IS NULL OR lock_exp_time <= $1)
                 AND (exclusive = FALSE OR proc_inst_id NOT IN (
                      SELECT proc_inst_id FROM pf_job
                       WHERE exclusive = TRUE
                         AND lock_owner IS NOT NULL
                         AND lock_exp_time > $1))
               ORDER BY priority DESC, due_date ASC, id ASC
               LIMIT $2
               FOR UPDATE SKIP LOCKED"#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(backend)?;

        // Two nodes acquiring simultaneously can both pass the exclusivity
        // subquery on their own snapshots. The execution-tree version check
        // at commit time is the backstop: one of the two jobs conflicts and
        // is re-queued without penalty.
        let expiration = now + lock_duration;
        let mut batch_exclusive: HashSet<ExecutionId> = HashSet::new();
        let mut acquired = Vec::new();
        for row in &rows {
            let mut job = row_to_job(row)?;
            // One exclusive writer per instance also within this batch.
            if job.exclusive && !batch_exclusive.insert(job.process_instance_id) {
                continue;
            }
            let res = sqlx::query(
                "UPDATE pf_job SET lock_owner = $2, lock_exp_time = $3, version = version + 1 \
                 WHERE id = $1",
            )
            .bind(job.id)
            .bind(lock_owner)
            .bind(expiration)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
            if res.rows_affected() == 1 {
                job.lock_owner = Some(lock_owner.to_string());
                job.lock_expiration = Some(expiration);
                job.version += 1;
                acquired.push(job);
            }
        }

        tx.commit().await.map_err(backend)?;
        Ok(acquired)
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let updated = update_job_in(&mut tx, job).await?;
        if !updated {
            return Err(StoreError::Conflict {
                entity: "job",
                id: job.id.to_string(),
            });
        }
        tx.commit().await.map_err(backend)
    }

    async fn delete_job(&self, id: JobId) -> Result<bool, StoreError> {
        let res = sqlx::query("DELETE FROM pf_job WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(res.rows_affected() == 1)
    }

    async fn save_incident(&self, incident: &Incident) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO pf_incident
               (id, proc_inst_id, execution_id, activity_id, job_id, message,
                tenant_id, created_at, resolved_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)"#,
        )
        .bind(incident.id)
        .bind(incident.process_instance_id)
        .bind(incident.execution_id)
        .bind(&incident.activity_id)
        .bind(incident.job_id)
        .bind(&incident.message)
        .bind(&incident.tenant_id)
        .bind(incident.created_at)
        .bind(incident.resolved_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn instance_incidents(
        &self,
        process_instance_id: ExecutionId,
    ) -> Result<Vec<Incident>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM pf_incident WHERE proc_inst_id = $1 ORDER BY created_at")
                .bind(process_instance_id)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
        rows.iter().map(row_to_incident).collect()
    }

    async fn resolve_job_incidents(
        &self,
        job_id: JobId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE pf_incident SET resolved_at = $2 WHERE job_id = $1 AND resolved_at IS NULL",
        )
        .bind(job_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn find_subscribers(
        &self,
        kind: EventKind,
        event_key: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<EventSubscription>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM pf_event_subscription
               WHERE kind = $1 AND event_key = $2
                 AND ($3::TEXT IS NULL OR tenant_id = $3)
               ORDER BY id"#,
        )
        .bind(kind_str(kind))
        .bind(event_key)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_to_subscription).collect()
    }

    async fn instance_subscriptions(
        &self,
        process_instance_id: ExecutionId,
    ) -> Result<Vec<EventSubscription>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM pf_event_subscription WHERE proc_inst_id = $1 ORDER BY id")
                .bind(process_instance_id)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
        rows.iter().map(row_to_subscription).collect()
    }
}
