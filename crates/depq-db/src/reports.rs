//! Read-only monitoring queries over the PostgreSQL store.

use chrono::{DateTime, Utc};
use depq_core::JobId;
use serde::Serialize;
use std::time::Duration;

use crate::{DbResult, PgJobStore};

/// Which jobs a report counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusFilter {
    #[default]
    All,
    Pending,
    InProgress,
    Completed,
}

impl StatusFilter {
    fn clause(self) -> &'static str {
        match self {
            StatusFilter::All => "TRUE",
            StatusFilter::Pending => "status.completed = false",
            StatusFilter::InProgress => "status.completed = false AND status.in_progress = true",
            StatusFilter::Completed => "status.completed = true",
        }
    }
}

/// Interval averaged by [`PgJobStore::recent_timing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMetric {
    /// `ended - started`
    Duration,
    /// `started - created`
    Latency,
}

impl RuntimeMetric {
    fn columns(self) -> (&'static str, &'static str) {
        match self {
            RuntimeMetric::Duration => ("time_info.ended", "time_info.started"),
            RuntimeMetric::Latency => ("time_info.started", "time_info.created"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct TypeCount {
    pub job_type: String,
    pub group: Option<String>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingSummary {
    pub job_type: String,
    pub group: Option<String>,
    pub average: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ErrorSummary {
    pub job_type: String,
    pub group: Option<String>,
    /// Completed jobs that failed at least once.
    pub jobs: i64,
    pub total_errors: i64,
    pub average_errors: f64,
}

#[derive(sqlx::FromRow)]
struct TimingRow {
    job_type: String,
    group: Option<String>,
    nanos: Option<f64>,
}

fn group_column(by_group: bool) -> &'static str {
    if by_group {
        "jobs.queue_group"
    } else {
        "NULL::text"
    }
}

fn group_by(by_group: bool) -> &'static str {
    if by_group {
        "jobs.type, jobs.queue_group"
    } else {
        "jobs.type"
    }
}

impl PgJobStore {
    /// Job counts per type, optionally split by queue group.
    pub async fn job_counts(&self, filter: StatusFilter, by_group: bool) -> DbResult<Vec<TypeCount>> {
        let sql = format!(
            r#"
            SELECT jobs.type AS job_type, {group} AS "group", COUNT(jobs.id) AS count
            FROM jobs
                INNER JOIN job_status AS status ON jobs.id = status.id
            WHERE {filter}
            GROUP BY {group_by}
            ORDER BY {group_by}
            "#,
            group = group_column(by_group),
            filter = filter.clause(),
            group_by = group_by(by_group),
        );
        let rows = sqlx::query_as::<_, TypeCount>(&sql)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    /// Average of `metric` per type over jobs that ended within `window`.
    pub async fn recent_timing(
        &self,
        window: Duration,
        metric: RuntimeMetric,
        by_group: bool,
    ) -> DbResult<Vec<TimingSummary>> {
        let (to, from) = metric.columns();
        let sql = format!(
            r#"
            SELECT
                jobs.type AS job_type,
                {group} AS "group",
                AVG((EXTRACT(epoch FROM {to}) - EXTRACT(epoch FROM {from})) * 1000000000)::float8 AS nanos
            FROM jobs
                INNER JOIN job_status AS status ON jobs.id = status.id
                INNER JOIN job_time AS time_info ON jobs.id = time_info.id
            WHERE status.completed = true
                AND time_info.ended > $1
                AND {from} > $2
            GROUP BY {group_by}
            ORDER BY {group_by}
            "#,
            group = group_column(by_group),
            group_by = group_by(by_group),
        );
        let rows = sqlx::query_as::<_, TimingRow>(&sql)
            .bind(window_start(window))
            .bind(crate::encode::zero_instant())
            .fetch_all(self.pool())
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| TimingSummary {
                job_type: row.job_type,
                group: row.group,
                average: Duration::from_nanos(row.nanos.unwrap_or(0.0).max(0.0) as u64),
            })
            .collect())
    }

    /// Error totals per type over failed jobs that ended within `window`.
    pub async fn recent_errors(&self, window: Duration, by_group: bool) -> DbResult<Vec<ErrorSummary>> {
        let sql = format!(
            r#"
            SELECT
                jobs.type AS job_type,
                {group} AS "group",
                COUNT(jobs.id) AS jobs,
                SUM(status.err_count)::bigint AS total_errors,
                AVG(status.err_count)::float8 AS average_errors
            FROM jobs
                INNER JOIN job_status AS status ON jobs.id = status.id
                INNER JOIN job_time AS time_info ON jobs.id = time_info.id
            WHERE status.completed = true
                AND status.err_count > 0
                AND time_info.ended > $1
            GROUP BY {group_by}
            ORDER BY {group_by}
            "#,
            group = group_column(by_group),
            group_by = group_by(by_group),
        );
        let rows = sqlx::query_as::<_, ErrorSummary>(&sql)
            .bind(window_start(window))
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    /// Ids of jobs of one type matching `filter`.
    pub async fn job_ids_by_state(&self, job_type: &str, filter: StatusFilter) -> DbResult<Vec<JobId>> {
        let sql = format!(
            r#"
            SELECT jobs.id
            FROM jobs
                INNER JOIN job_status AS status ON jobs.id = status.id
            WHERE jobs.type = $1 AND {filter}
            ORDER BY jobs.id
            "#,
            filter = filter.clause(),
        );
        let ids = sqlx::query_scalar::<_, String>(&sql)
            .bind(job_type)
            .fetch_all(self.pool())
            .await?;
        Ok(ids.into_iter().map(JobId::new).collect())
    }
}

fn window_start(window: Duration) -> DateTime<Utc> {
    depq_core::lease_cutoff(Utc::now(), window)
}
