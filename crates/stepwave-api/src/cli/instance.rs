//! `stepwave instance` subcommands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use futures_util::StreamExt;
use serde_json::{Map, Value};
use uuid::Uuid;

use stepwave_infra::config::load_template;
use stepwave_types::workflow::{InstanceSnapshot, InstanceStatus, StepStatus};

use crate::http::handlers::stream::snapshot_updates;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum InstanceCommand {
    /// Create an instance from a template file and start its first wave.
    Create {
        /// Path to the template (YAML or JSON).
        template: PathBuf,

        /// Caller context as a JSON object; keys override the template's.
        #[arg(long)]
        context: Option<String>,

        /// Block until the instance reaches a terminal status.
        #[arg(long)]
        wait: bool,
    },

    /// Show an instance and its step entries.
    Status {
        /// Instance id.
        id: Uuid,
    },
}

pub async fn handle_instance_command(
    cmd: InstanceCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        InstanceCommand::Create {
            template,
            context,
            wait,
        } => create(&template, context.as_deref(), wait, state, json).await,
        InstanceCommand::Status { id } => status(id, state, json).await,
    }
}

/// Parse `--context`; anything other than a JSON object is rejected.
pub(crate) fn parse_context(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("--context is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--context must be a JSON object, got {other}"),
    }
}

async fn create(
    template_path: &Path,
    context: Option<&str>,
    wait: bool,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let template = load_template(template_path).await?;
    let context = parse_context(context)?;

    let id = state.engine.create_instance(&template, context).await?;

    if !wait {
        if json {
            println!("{}", serde_json::json!({ "instance_id": id }));
        } else {
            println!();
            println!(
                "  {} Created instance {} from '{}'",
                style("*").green().bold(),
                style(id).cyan(),
                template.id
            );
            println!();
        }
        return Ok(());
    }

    if !json {
        println!();
        println!(
            "  {} Running instance {} from '{}'",
            style(">").cyan().bold(),
            style(id).cyan(),
            template.id
        );
    }

    let mut last: Option<InstanceSnapshot> = None;
    let mut updates = std::pin::pin!(snapshot_updates(state.engine.clone(), id));
    while let Some(update) = updates.next().await {
        let snapshot = update?;
        if !json {
            report_progress(last.as_ref(), &snapshot);
        }
        last = Some(snapshot);
    }

    // The engine keeps working on spawned tasks; stop them before exit.
    state.engine.graceful_shutdown();

    let Some(snapshot) = last else {
        bail!("instance {id} produced no status");
    };
    print_snapshot(&snapshot, json)
}

async fn status(id: Uuid, state: &AppState, json: bool) -> Result<()> {
    let snapshot = state.engine.get_instance_status(&id).await?;
    print_snapshot(&snapshot, json)
}

/// Print one line per step whose status changed since the previous snapshot.
fn report_progress(previous: Option<&InstanceSnapshot>, current: &InstanceSnapshot) {
    for step in &current.steps {
        let before = previous
            .and_then(|p| p.steps.iter().find(|s| s.id == step.id))
            .map(|s| s.status);
        if before == Some(step.status) {
            continue;
        }
        println!(
            "    wave {:<3} {:<16} {}",
            step.order,
            step.slot_key,
            styled_step_status(step.status)
        );
    }
}

fn print_snapshot(snapshot: &InstanceSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    let instance = &snapshot.instance;
    println!();
    println!(
        "  {} {}",
        style("Instance").bold(),
        style(instance.id).cyan()
    );
    println!("  Template:  {}", instance.template_id);
    println!("  Status:    {}", styled_instance_status(instance.status));
    if !instance.skipped_orders.is_empty() {
        let skipped: Vec<String> = instance.skipped_orders.iter().map(u32::to_string).collect();
        println!("  Skipped:   waves {}", skipped.join(", "));
    }
    println!(
        "  Created:   {}",
        instance.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!();

    if snapshot.steps.is_empty() {
        println!("  {}", style("No steps materialized.").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Wave").fg(Color::Cyan),
            Cell::new("Slot").fg(Color::Cyan),
            Cell::new("Definition").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Retries").fg(Color::Cyan),
            Cell::new("Output / Error").fg(Color::Cyan),
        ]);

    for step in &snapshot.steps {
        let detail = match (&step.error, &step.output) {
            (Some(err), _) => truncate(err, 60),
            (None, Some(out)) => truncate(&out.to_string(), 60),
            (None, None) => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(step.order),
            Cell::new(&step.slot_key),
            Cell::new(&step.definition_id),
            Cell::new(step.status.as_str()).fg(step_status_color(step.status)),
            Cell::new(step.retry_count),
            Cell::new(detail),
        ]);
    }

    println!("{table}");
    println!();
    Ok(())
}

fn styled_instance_status(status: InstanceStatus) -> console::StyledObject<&'static str> {
    match status {
        InstanceStatus::Running => style(status.as_str()).yellow(),
        InstanceStatus::Completed | InstanceStatus::CompletedWithBreak => {
            style(status.as_str()).green()
        }
        InstanceStatus::Failed => style(status.as_str()).red(),
    }
}

fn styled_step_status(status: StepStatus) -> console::StyledObject<&'static str> {
    match step_status_color(status) {
        Color::Green => style(status.as_str()).green(),
        Color::Red => style(status.as_str()).red(),
        Color::DarkGrey => style(status.as_str()).dim(),
        _ => style(status.as_str()).yellow(),
    }
}

fn step_status_color(status: StepStatus) -> Color {
    match status {
        StepStatus::Completed => Color::Green,
        StepStatus::Failed => Color::Red,
        StepStatus::Skipped => Color::DarkGrey,
        _ => Color::Yellow,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
