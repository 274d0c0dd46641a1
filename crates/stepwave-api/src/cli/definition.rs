//! `stepwave definition` subcommands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use console::style;

use stepwave_infra::config::load_definitions;

use crate::state::AppState;

#[derive(Subcommand)]
pub enum DefinitionCommand {
    /// Register step definitions from a YAML or JSON file (one or a list).
    Register {
        /// Path to the definitions file.
        file: PathBuf,
    },
}

pub async fn handle_definition_command(
    cmd: DefinitionCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        DefinitionCommand::Register { file } => register(&file, state, json).await,
    }
}

async fn register(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let defs = load_definitions(file).await?;

    for def in &defs {
        state
            .engine
            .register_definition(def)
            .await
            .with_context(|| format!("Failed to register definition '{}'", def.id))?;
    }

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "name": d.name,
                    "control": d.is_control(),
                    "run_mode": d.run_mode,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    for def in &defs {
        let kind = if def.is_control() { "control" } else { "function" };
        println!(
            "  {} Registered {} '{}' ({})",
            style("*").green().bold(),
            kind,
            style(&def.id).cyan(),
            def.run_mode.as_str()
        );
    }
    println!();
    Ok(())
}
