//! Queue state commands.

use anyhow::{Result, bail};
use chrono::Utc;
use depq_core::JobId;
use depq_db::JobStore;
use tracing::info;

use super::{Context, parse_window};

pub async fn stats(ctx: &Context, group: Option<String>) -> Result<()> {
    let group = group.unwrap_or_else(|| ctx.config().queue.group.clone());
    let store = ctx.store().await?;
    let stats = store.stats(&group).await?;

    ctx.emit(&stats, |stats| {
        println!("Group {:?}", group);
        println!("  total      {}", stats.total);
        println!("  pending    {}", stats.pending);
        println!("  running    {}", stats.running);
        println!("  completed  {}", stats.completed);
    })
}

pub async fn groups(ctx: &Context, since: &str) -> Result<()> {
    let window = parse_window("since", since)?;
    let store = ctx.store().await?;
    let groups = store
        .active_groups(depq_core::lease_cutoff(Utc::now(), window))
        .await?;

    ctx.emit(&groups, |groups| {
        if groups.is_empty() {
            println!("No active groups in the last {}", since);
        }
        for group in groups {
            println!("{:?}", group);
        }
    })
}

/// Mark pending jobs completed without dispatching them.
pub async fn complete(ctx: &Context, ids: Vec<String>) -> Result<()> {
    if ids.is_empty() {
        bail!("No job ids given");
    }
    let ids: Vec<JobId> = ids.into_iter().map(JobId::new).collect();
    let store = ctx.store().await?;
    let completed = store.complete_many(&ids).await?;
    info!(requested = ids.len(), completed, "Force-completed jobs");

    ctx.emit(&completed, |completed| {
        println!("Completed {} of {} jobs", completed, ids.len());
    })
}
