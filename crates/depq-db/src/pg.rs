//! PostgreSQL job store.
//!
//! A job is spread across one row per concern (`jobs`, `job_body`,
//! `job_status`, `job_time`, `dependency`) plus the append-only
//! `job_errors`, `dependency_edges` and `job_scopes` tables. Every
//! status transition is a single conditional `UPDATE` whose `WHERE` clause
//! carries the precondition, run in the same transaction as the writes it
//! gates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use depq_core::{
    Dependency, DependencyState, Job, JobId, JobStatus, QueueStats, TimeInfo, lease_cutoff,
};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::debug;

use crate::encode::{
    decode_instant, decode_max_time, encode_instant, encode_max_time, zero_instant,
};
use crate::store::{ClaimOutcome, ClaimRequest, JobStore, Lease};
use crate::{DbError, DbResult};

const SELECT_JOB: &str = r#"
    SELECT
        jobs.id, jobs.type AS job_type, jobs.queue_group, jobs.version, jobs.priority, jobs.scopes,
        body.job AS body,
        status.owner, status.completed, status.in_progress, status.mod_ts, status.mod_count,
        status.err_count,
        time_info.created, time_info.started, time_info.ended, time_info.wait_until,
        time_info.dispatch_by, time_info.max_time,
        dependency.dep_type, dependency.dep_version, dependency.dep_state, dependency.dependency
    FROM jobs
        INNER JOIN job_body AS body ON jobs.id = body.id
        INNER JOIN job_status AS status ON jobs.id = status.id
        INNER JOIN job_time AS time_info ON jobs.id = time_info.id
        INNER JOIN dependency ON jobs.id = dependency.id
    WHERE jobs.id = $1
"#;

const NEXT_JOBS_BASIC: &str = r#"
    SELECT jobs.id
    FROM jobs
        INNER JOIN job_status AS status ON jobs.id = status.id
    WHERE status.completed = false
        AND jobs.queue_group = $1
        AND (status.in_progress = false OR status.mod_ts <= $2)
        AND ($4::text IS NULL OR jobs.id COLLATE "C" > $4)
    ORDER BY jobs.id COLLATE "C"
    LIMIT $3
"#;

const NEXT_JOBS_TIMING: &str = r#"
    SELECT jobs.id
    FROM jobs
        INNER JOIN job_status AS status ON jobs.id = status.id
        INNER JOIN job_time AS time_info ON jobs.id = time_info.id
    WHERE status.completed = false
        AND jobs.queue_group = $1
        AND (status.in_progress = false OR status.mod_ts <= $2)
        AND time_info.wait_until <= $4
        AND (time_info.dispatch_by = $5 OR time_info.dispatch_by >= $4)
        AND ($6::text IS NULL OR jobs.id COLLATE "C" > $6)
    ORDER BY jobs.id COLLATE "C"
    LIMIT $3
"#;

/// Take ownership: either a continuation by the current owner at the
/// observed version, or a steal of an expired lease.
const CLAIM: &str = r#"
    UPDATE job_status
    SET owner = $2, in_progress = true, mod_ts = $3, mod_count = mod_count + 1
    WHERE id = $1
        AND completed = false
        AND ((owner = $2 AND mod_count = $4) OR mod_ts <= $5)
    RETURNING mod_count
"#;

const HEARTBEAT: &str = r#"
    UPDATE job_status
    SET mod_ts = $4, mod_count = mod_count + 1
    WHERE id = $1 AND owner = $2 AND mod_count = $3 AND completed = false
"#;

const RELEASE: &str = r#"
    UPDATE job_status
    SET owner = '', in_progress = false, mod_ts = $4, mod_count = mod_count + 1
    WHERE id = $1 AND owner = $2 AND mod_count = $3 AND completed = false
"#;

const RECORD_ERROR: &str = r#"
    UPDATE job_status
    SET err_count = err_count + 1, mod_ts = $4, mod_count = mod_count + 1
    WHERE id = $1 AND owner = $2 AND mod_count = $3 AND completed = false
"#;

const COMPLETE_LEASED: &str = r#"
    UPDATE job_status
    SET completed = true, in_progress = false, mod_ts = $4, mod_count = mod_count + 3
    WHERE id = $1 AND owner = $2 AND mod_count = $3 AND completed = false
"#;

const COMPLETE_PENDING: &str = r#"
    UPDATE job_status
    SET completed = true, in_progress = false, mod_ts = $2, mod_count = mod_count + 3
    WHERE id = ANY($1) AND completed = false
    RETURNING id
"#;

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    job_type: String,
    queue_group: String,
    version: i32,
    priority: i32,
    scopes: Vec<String>,
    body: serde_json::Value,
    owner: String,
    completed: bool,
    in_progress: bool,
    mod_ts: DateTime<Utc>,
    mod_count: i32,
    err_count: i32,
    created: DateTime<Utc>,
    started: DateTime<Utc>,
    ended: DateTime<Utc>,
    wait_until: DateTime<Utc>,
    dispatch_by: DateTime<Utc>,
    max_time: i32,
    dep_type: String,
    dep_version: i32,
    dep_state: String,
    dependency: serde_json::Value,
}

impl JobRow {
    fn into_job(self, errors: Vec<String>, edges: Vec<String>) -> DbResult<Job> {
        let state: DependencyState = self
            .dep_state
            .parse()
            .map_err(|e| DbError::Database(sqlx::Error::Decode(Box::new(e))))?;

        Ok(Job {
            id: JobId::new(self.id),
            job_type: self.job_type,
            group: self.queue_group,
            priority: self.priority,
            version: self.version,
            body: self.body,
            status: JobStatus {
                owner: self.owner,
                completed: self.completed,
                in_progress: self.in_progress,
                mod_ts: decode_instant(self.mod_ts),
                mod_count: self.mod_count,
                err_count: self.err_count,
            },
            time_info: TimeInfo {
                created: self.created,
                started: decode_instant(self.started),
                ended: decode_instant(self.ended),
                wait_until: decode_instant(self.wait_until),
                dispatch_by: decode_instant(self.dispatch_by),
                max_time: decode_max_time(self.max_time),
            },
            dependency: Dependency {
                dep_type: self.dep_type,
                version: self.dep_version,
                descriptor: self.dependency,
                state,
                edges: edges.into_iter().map(JobId::new).collect(),
            },
            scopes: self.scopes,
            errors,
        })
    }
}

/// PostgreSQL implementation of [`JobStore`].
pub struct PgJobStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgJobStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn exists(&self, tx: &mut Transaction<'_, Postgres>, id: &str) -> DbResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM jobs WHERE id = $1)")
            .bind(id)
            .fetch_one(&mut **tx)
            .await?;
        Ok(exists)
    }
}

/// Register scopes for `id`, returning the first one held by another job.
///
/// Relies on the unique index on `job_scopes.scope`. A scope this job
/// already holds is not a conflict.
async fn register_in(
    tx: &mut Transaction<'_, Postgres>,
    id: &str,
    scopes: &[String],
) -> DbResult<Option<String>> {
    for scope in scopes {
        let inserted = sqlx::query_scalar::<_, String>(
            "INSERT INTO job_scopes (id, scope) VALUES ($1, $2) ON CONFLICT (scope) DO NOTHING RETURNING id",
        )
        .bind(id)
        .bind(scope)
        .fetch_optional(&mut **tx)
        .await?;
        if inserted.is_some() {
            continue;
        }

        let holder = sqlx::query_scalar::<_, String>("SELECT id FROM job_scopes WHERE scope = $1")
            .bind(scope)
            .fetch_optional(&mut **tx)
            .await?;
        if holder.as_deref() != Some(id) {
            return Ok(Some(scope.clone()));
        }
    }
    Ok(None)
}

async fn insert_edges(
    tx: &mut Transaction<'_, Postgres>,
    id: &str,
    edges: &[JobId],
) -> DbResult<()> {
    for edge in edges {
        sqlx::query("INSERT INTO dependency_edges (id, edge) VALUES ($1, $2)")
            .bind(id)
            .bind(edge.as_str())
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

#[async_trait]
impl JobStore for PgJobStore {
    fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    async fn insert(&self, job: &Job) -> DbResult<()> {
        let id = job.id.as_str();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO jobs (id, type, queue_group, version, priority, scopes) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(&job.job_type)
        .bind(&job.group)
        .bind(job.version)
        .bind(job.priority)
        .bind(&job.scopes)
        .execute(&mut *tx)
        .await
        .map_err(|e| DbError::on_unique(e, || format!("job {}", job.id)))?;

        sqlx::query("INSERT INTO job_body (id, job) VALUES ($1, $2)")
            .bind(id)
            .bind(&job.body)
            .execute(&mut *tx)
            .await?;

        let status = &job.status;
        sqlx::query(
            r#"
            INSERT INTO job_status (id, owner, completed, in_progress, mod_ts, mod_count, err_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id)
        .bind(&status.owner)
        .bind(status.completed)
        .bind(status.in_progress)
        .bind(encode_instant(status.mod_ts))
        .bind(status.mod_count)
        .bind(status.err_count)
        .execute(&mut *tx)
        .await?;

        let ti = &job.time_info;
        sqlx::query(
            r#"
            INSERT INTO job_time (id, created, started, ended, wait_until, dispatch_by, max_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id)
        .bind(ti.created)
        .bind(encode_instant(ti.started))
        .bind(encode_instant(ti.ended))
        .bind(encode_instant(ti.wait_until))
        .bind(encode_instant(ti.dispatch_by))
        .bind(encode_max_time(ti.max_time))
        .execute(&mut *tx)
        .await?;

        let dep = &job.dependency;
        sqlx::query(
            "INSERT INTO dependency (id, dep_type, dep_version, dep_state, dependency) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(&dep.dep_type)
        .bind(dep.version)
        .bind(dep.state.as_str())
        .bind(&dep.descriptor)
        .execute(&mut *tx)
        .await?;
        insert_edges(&mut tx, id, &dep.edges).await?;

        for error in &job.errors {
            sqlx::query("INSERT INTO job_errors (id, error) VALUES ($1, $2)")
                .bind(id)
                .bind(error)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(job_id = %job.id, group = %job.group, "inserted job");
        Ok(())
    }

    async fn get(&self, id: &str) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(SELECT_JOB)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;

        let errors = sqlx::query_scalar::<_, String>("SELECT error FROM job_errors WHERE id = $1")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        let edges = sqlx::query_scalar::<_, String>("SELECT edge FROM dependency_edges WHERE id = $1")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

        row.into_job(errors, edges)
    }

    async fn delete(&self, id: &str) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn ids(&self) -> DbResult<Vec<JobId>> {
        let ids = sqlx::query_scalar::<_, String>("SELECT id FROM job_status ORDER BY mod_ts DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(JobId::new).collect())
    }

    async fn update_time_info(&self, id: &str, time_info: &TimeInfo) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_time
            SET created = $2, started = $3, ended = $4, wait_until = $5, dispatch_by = $6,
                max_time = $7
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(time_info.created)
        .bind(encode_instant(time_info.started))
        .bind(encode_instant(time_info.ended))
        .bind(encode_instant(time_info.wait_until))
        .bind(encode_instant(time_info.dispatch_by))
        .bind(encode_max_time(time_info.max_time))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {}", id)));
        }
        Ok(())
    }

    async fn update_dependency(&self, id: &str, dependency: &Dependency) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE dependency SET dep_type = $2, dep_version = $3, dep_state = $4, dependency = $5 WHERE id = $1",
        )
        .bind(id)
        .bind(&dependency.dep_type)
        .bind(dependency.version)
        .bind(dependency.state.as_str())
        .bind(&dependency.descriptor)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {}", id)));
        }

        sqlx::query("DELETE FROM dependency_edges WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        insert_edges(&mut tx, id, &dependency.edges).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_job(&self, id: &str, job: &Job) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE jobs SET type = $2, queue_group = $3, version = $4, priority = $5, scopes = $6 WHERE id = $1",
        )
        .bind(id)
        .bind(&job.job_type)
        .bind(&job.group)
        .bind(job.version)
        .bind(job.priority)
        .bind(&job.scopes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {}", id)));
        }
        debug!(job_id = %id, group = %job.group, "updated job metadata");
        Ok(())
    }

    async fn update_body(&self, id: &str, body: &serde_json::Value) -> DbResult<()> {
        let result = sqlx::query("UPDATE job_body SET job = $2 WHERE id = $1")
            .bind(id)
            .bind(body)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {}", id)));
        }
        Ok(())
    }

    async fn next_candidates(
        &self,
        group: &str,
        timing_aware: bool,
        after: Option<&JobId>,
        limit: usize,
    ) -> DbResult<Vec<JobId>> {
        let now = Utc::now();
        let cutoff = lease_cutoff(now, self.lock_timeout);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let after = after.map(JobId::as_str);

        let ids = if timing_aware {
            sqlx::query_scalar::<_, String>(NEXT_JOBS_TIMING)
                .bind(group)
                .bind(cutoff)
                .bind(limit)
                .bind(now)
                .bind(zero_instant())
                .bind(after)
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query_scalar::<_, String>(NEXT_JOBS_BASIC)
                .bind(group)
                .bind(cutoff)
                .bind(limit)
                .bind(after)
                .fetch_all(&self.pool)
                .await?
        };
        Ok(ids.into_iter().map(JobId::new).collect())
    }

    async fn claim(&self, request: &ClaimRequest) -> DbResult<ClaimOutcome> {
        let now = Utc::now();
        let id = request.id.as_str();
        let mut tx = self.pool.begin().await?;

        let mod_count = sqlx::query_scalar::<_, i32>(CLAIM)
            .bind(id)
            .bind(&request.owner)
            .bind(now)
            .bind(request.mod_count)
            .bind(lease_cutoff(now, self.lock_timeout))
            .fetch_optional(&mut *tx)
            .await?;

        let Some(mod_count) = mod_count else {
            if !self.exists(&mut tx, id).await? {
                return Err(DbError::NotFound(format!("job {}", id)));
            }
            debug!(job_id = %id, owner = %request.owner, "claim lost");
            return Ok(ClaimOutcome::Conflict);
        };

        if let Some(held) = register_in(&mut tx, id, &request.scopes).await? {
            // Dropping the transaction rolls the status update back.
            debug!(job_id = %id, scope = %held, "scope held by another job");
            return Ok(ClaimOutcome::ScopeConflict(held));
        }

        sqlx::query("UPDATE job_time SET started = $2 WHERE id = $1 AND started <= $3")
            .bind(id)
            .bind(now)
            .bind(zero_instant())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(job_id = %id, owner = %request.owner, mod_count, "claimed job");
        Ok(ClaimOutcome::Acquired(Lease {
            id: request.id.clone(),
            owner: request.owner.clone(),
            mod_count,
        }))
    }

    async fn heartbeat(&self, lease: &Lease) -> DbResult<Option<Lease>> {
        let result = sqlx::query(HEARTBEAT)
            .bind(lease.id.as_str())
            .bind(&lease.owner)
            .bind(lease.mod_count)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok((result.rows_affected() == 1).then(|| lease.bumped(1)))
    }

    async fn release(&self, lease: &Lease) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(RELEASE)
            .bind(lease.id.as_str())
            .bind(&lease.owner)
            .bind(lease.mod_count)
            .bind(zero_instant())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM job_scopes WHERE id = $1")
            .bind(lease.id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn record_error(&self, lease: &Lease, message: &str) -> DbResult<Option<Lease>> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(RECORD_ERROR)
            .bind(lease.id.as_str())
            .bind(&lease.owner)
            .bind(lease.mod_count)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }

        sqlx::query("INSERT INTO job_errors (id, error) VALUES ($1, $2)")
            .bind(lease.id.as_str())
            .bind(message)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(lease.bumped(1)))
    }

    async fn complete(&self, lease: &Lease) -> DbResult<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(COMPLETE_LEASED)
            .bind(lease.id.as_str())
            .bind(&lease.owner)
            .bind(lease.mod_count)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            debug!(job_id = %lease.id, owner = %lease.owner, "completion rejected, lease lost");
            return Ok(false);
        }

        sqlx::query("UPDATE job_time SET ended = $2 WHERE id = $1")
            .bind(lease.id.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM job_scopes WHERE id = $1")
            .bind(lease.id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn force_complete(&self, id: &str) -> DbResult<bool> {
        let completed = self.complete_many(&[JobId::from(id)]).await?;
        Ok(completed == 1)
    }

    async fn complete_many(&self, ids: &[JobId]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let ids: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        let mut tx = self.pool.begin().await?;

        let completed = sqlx::query_scalar::<_, String>(COMPLETE_PENDING)
            .bind(&ids)
            .bind(now)
            .fetch_all(&mut *tx)
            .await?;

        sqlx::query("UPDATE job_time SET ended = $2 WHERE id = ANY($1)")
            .bind(&completed)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM job_scopes WHERE id = ANY($1)")
            .bind(&completed)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(requested = ids.len(), completed = completed.len(), "force-completed jobs");
        Ok(completed.len() as u64)
    }

    async fn register_scopes(&self, id: &str, scopes: &[String]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        if !self.exists(&mut tx, id).await? {
            return Err(DbError::NotFound(format!("job {}", id)));
        }
        if let Some(held) = register_in(&mut tx, id, scopes).await? {
            return Err(DbError::ScopeConflict(held));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn release_scopes(&self, id: &str) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM job_scopes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self, group: &str) -> DbResult<QueueStats> {
        let (total, pending, in_progress) = sqlx::query_as::<_, (i64, i64, i64)>(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE status.completed = false),
                COUNT(*) FILTER (WHERE status.completed = false AND status.in_progress = true)
            FROM jobs
                INNER JOIN job_status AS status ON jobs.id = status.id
            WHERE jobs.queue_group = $1
            "#,
        )
        .bind(group)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats::from_counts(
            total as usize,
            pending as usize,
            in_progress as usize,
        ))
    }

    async fn active_groups(&self, since: DateTime<Utc>) -> DbResult<Vec<String>> {
        let groups = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT queue_group
            FROM jobs
                INNER JOIN job_status AS status ON jobs.id = status.id
            WHERE status.completed = false
                OR (status.completed = true AND status.mod_ts >= $1)
            ORDER BY queue_group
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(groups)
    }
}
