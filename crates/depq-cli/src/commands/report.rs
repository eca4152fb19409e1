//! Monitoring reports.

use anyhow::Result;
use depq_db::{RuntimeMetric, StatusFilter};

use super::{Context, parse_window};

fn group_label(group: &Option<String>) -> &str {
    group.as_deref().unwrap_or("*")
}

pub async fn counts(ctx: &Context, filter: StatusFilter, by_group: bool) -> Result<()> {
    let store = ctx.store().await?;
    let rows = store.job_counts(filter, by_group).await?;

    ctx.emit(&rows, |rows| {
        println!("{:<32} {:<20} {:>10}", "TYPE", "GROUP", "JOBS");
        for row in rows {
            println!(
                "{:<32} {:<20} {:>10}",
                row.job_type,
                group_label(&row.group),
                row.count
            );
        }
    })
}

pub async fn timing(
    ctx: &Context,
    window: &str,
    metric: RuntimeMetric,
    by_group: bool,
) -> Result<()> {
    let window = parse_window("window", window)?;
    let store = ctx.store().await?;
    let rows = store.recent_timing(window, metric, by_group).await?;

    ctx.emit(&rows, |rows| {
        let heading = match metric {
            RuntimeMetric::Duration => "AVG DURATION",
            RuntimeMetric::Latency => "AVG LATENCY",
        };
        println!("{:<32} {:<20} {:>14}", "TYPE", "GROUP", heading);
        for row in rows {
            println!(
                "{:<32} {:<20} {:>14}",
                row.job_type,
                group_label(&row.group),
                format!("{:.3}s", row.average.as_secs_f64())
            );
        }
    })
}

pub async fn errors(ctx: &Context, window: &str, by_group: bool) -> Result<()> {
    let window = parse_window("window", window)?;
    let store = ctx.store().await?;
    let rows = store.recent_errors(window, by_group).await?;

    ctx.emit(&rows, |rows| {
        println!(
            "{:<32} {:<20} {:>8} {:>8} {:>8}",
            "TYPE", "GROUP", "JOBS", "ERRORS", "AVG"
        );
        for row in rows {
            println!(
                "{:<32} {:<20} {:>8} {:>8} {:>8.2}",
                row.job_type,
                group_label(&row.group),
                row.jobs,
                row.total_errors,
                row.average_errors
            );
        }
    })
}
