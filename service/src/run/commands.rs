//! Cache-set administration and inspection subcommands.

// CLI commands output directly to stdout for user feedback
#![expect(clippy::print_stdout, reason = "CLI commands require stdout output")]

use super::session::BackfillProgress;
use super::startup::ServiceContext;
use crate::aggregate::MetricKind;
use crate::cache_set::{CacheSet, NewCacheSet};
use crate::cli::{CacheSetArg, CreateSetArgs, LedgerArgs, ListSetsArgs, UpdateSetArgs};
use crate::ledger::RangeStatus;
use crate::sync::backfill::{run_backfill, BackfillReport};
use crate::sync::ProgressReporter;
use eyre::{eyre, Result};
use std::sync::Arc;
use tracing::info;

/// Handle `create-set`: register the set at the current height, then
/// backfill its history unless disabled.
pub async fn handle_create_set(ctx: &ServiceContext, args: &CreateSetArgs) -> Result<CacheSet> {
    if let Some(existing) = ctx.storage.registry.find(args.owner, &args.name) {
        return Err(eyre!(
            "owner {} already has a cache set named {:?} (id {})",
            args.owner,
            args.name,
            existing.id
        ));
    }
    let height = ctx.oracle.current_height().await?;
    let cache_set = ctx.storage.registry.create(
        NewCacheSet {
            owner: args.owner,
            name: args.name.clone(),
            addresses: args.addresses.clone(),
            is_public: args.public,
            is_internal: args.internal,
        },
        height,
    )?;
    println!(
        "Created cache set {} ({:?}) for owner {} with {} member(s) at height {height}.",
        cache_set.id,
        cache_set.name,
        cache_set.owner,
        args.addresses.len()
    );
    if !args.no_backfill {
        let report = backfill_with_progress(ctx, cache_set.id, height).await?;
        print_backfill(&report);
    }
    Ok(cache_set)
}

pub async fn handle_update_set(ctx: &ServiceContext, args: &UpdateSetArgs) -> Result<()> {
    if args.add.is_empty() && args.remove.is_empty() {
        return Err(eyre!("nothing to do: pass --add and/or --remove"));
    }
    let height = ctx.oracle.current_height().await?;
    let change = ctx
        .storage
        .registry
        .update_membership(args.cache_set, &args.add, &args.remove, height)?;
    println!(
        "Cache set {} at height {height}: opened {:?}, closed {:?}.",
        args.cache_set, change.opened, change.closed
    );
    Ok(())
}

pub fn handle_deactivate_set(ctx: &ServiceContext, args: &CacheSetArg) -> Result<()> {
    ctx.storage.registry.deactivate(args.cache_set)?;
    println!("Cache set {} deactivated.", args.cache_set);
    Ok(())
}

pub fn handle_list_sets(ctx: &ServiceContext, args: &ListSetsArgs) -> Result<()> {
    let sets = ctx.storage.registry.list();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&sets)?);
        return Ok(());
    }
    if sets.is_empty() {
        println!("No cache sets.");
        return Ok(());
    }
    println!(
        "{:>4}  {:>6}  {:<24}  {:>7}  {:<6}  {:<8}  {:<8}",
        "id", "owner", "name", "members", "active", "public", "internal"
    );
    for set in sets {
        let members = ctx
            .storage
            .registry
            .memberships(set.id)
            .iter()
            .filter(|member| member.end_height.is_none())
            .count();
        println!(
            "{:>4}  {:>6}  {:<24}  {:>7}  {:<6}  {:<8}  {:<8}",
            set.id, set.owner, set.name, members, set.is_active, set.is_public, set.is_internal
        );
    }
    Ok(())
}

pub async fn handle_backfill(ctx: &ServiceContext, args: &CacheSetArg) -> Result<BackfillReport> {
    let cache_set = ctx
        .storage
        .registry
        .get(args.cache_set)
        .ok_or_else(|| eyre!("unknown cache set {}", args.cache_set))?;
    let height = ctx.oracle.current_height().await?;
    let report = backfill_with_progress(ctx, cache_set.id, height).await?;
    print_backfill(&report);
    Ok(report)
}

/// Handle `ledger`: watermark and recent checkpoints per metric.
pub fn handle_ledger(ctx: &ServiceContext, args: &LedgerArgs) -> Result<()> {
    if ctx.storage.registry.get(args.cache_set).is_none() {
        return Err(eyre!("unknown cache set {}", args.cache_set));
    }
    let metrics = match args.metric {
        Some(metric) => vec![metric],
        None => MetricKind::ALL.to_vec(),
    };
    let ledger = ctx.ledger();
    for metric in metrics {
        let watermark = ledger.max_success_end_height(metric, args.cache_set, ctx.settings.interval)?;
        let entries = ledger.entries(metric, args.cache_set)?;
        let failed = entries
            .iter()
            .filter(|entry| entry.status == RangeStatus::Failed)
            .count();
        let stored = ctx
            .storage
            .results
            .range(metric, args.cache_set, ctx.settings.interval, 0, u64::MAX)
            .len();
        match watermark {
            Some(height) => println!(
                "{metric}: watermark {height}, {} entries ({failed} failed), {stored} stored windows",
                entries.len()
            ),
            None => println!("{metric}: no successful windows, {} entries", entries.len()),
        }
        let skip = entries.len().saturating_sub(args.tail);
        for entry in &entries[skip..] {
            println!(
                "  {} interval={} {:?}",
                entry.window(),
                entry.interval,
                entry.status
            );
        }
    }
    Ok(())
}

async fn backfill_with_progress(
    ctx: &ServiceContext,
    cache_set: u64,
    height: u64,
) -> Result<BackfillReport> {
    let progress = Arc::new(BackfillProgress::new(&format!("backfill cache set {cache_set}")));
    let result = run_backfill(
        &ctx.units,
        ctx.ledger(),
        ctx.settings,
        cache_set,
        height,
        Some(Arc::clone(&progress) as Arc<dyn ProgressReporter>),
    )
    .await;
    progress.finish();
    let report = result?;
    info!(cache_set, windows = report.windows.len(), "backfill complete");
    Ok(report)
}

fn print_backfill(report: &BackfillReport) {
    match (report.windows.first(), report.windows.last()) {
        (Some(first), Some(last)) => println!(
            "Backfilled {} window(s) from {} to {}.",
            report.windows.len(),
            first.start,
            last.end
        ),
        _ => println!("Nothing to backfill."),
    }
    for (metric, tally) in &report.metrics {
        println!(
            "  {metric}: {} succeeded, {} failed",
            tally.succeeded, tally.failed
        );
    }
}
