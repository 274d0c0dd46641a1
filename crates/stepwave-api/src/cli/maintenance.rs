//! `stepwave recover` and `stepwave health`.
//!
//! `recover` assumes no other process is driving the store: it resets every
//! in-flight step of every running instance, stale or not. `health` only
//! touches steps whose heartbeat has gone stale and is safe next to `serve`.

use anyhow::Result;
use console::style;

use crate::state::AppState;

pub async fn handle_recover(state: &AppState, json: bool) -> Result<()> {
    let report = state.engine.recover_running_instances().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        state.engine.graceful_shutdown();
        return Ok(());
    }

    println!();
    println!("  {} Recovery pass complete", style("*").green().bold());
    println!("  Expired leases purged: {}", report.leases_purged);
    println!("  Instances re-adopted:  {}", report.instances);
    println!("  Steps reset:           {}", report.steps_reset);
    println!("  Retries re-queued:     {}", report.retries_requeued);
    println!();

    // Re-adopted instances keep running only while a server owns them.
    if report.instances > 0 {
        println!(
            "  {}",
            style("Run `stepwave serve` to drive re-adopted instances to completion.").dim()
        );
        println!();
    }
    state.engine.graceful_shutdown();
    Ok(())
}

pub async fn handle_health(state: &AppState, json: bool) -> Result<()> {
    let report = state.engine.check_heartbeat_health().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        state.engine.graceful_shutdown();
        return Ok(());
    }

    println!();
    println!("  {} Heartbeat health scan complete", style("*").green().bold());
    println!("  Stale steps reset:   {}", report.steps_reset);
    println!("  Instances revived:   {}", report.instances_revived);
    for id in &report.rescheduled {
        println!("    rescheduled {}", style(id).cyan());
    }
    println!();
    state.engine.graceful_shutdown();
    Ok(())
}
