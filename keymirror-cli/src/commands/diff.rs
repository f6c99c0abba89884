//! `keymirror diff`: show what the next reconcile would change.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;

use keymirror_core::ValueMap;
use keymirror_daemon::{preview_blocking, Preview};
use keymirror_sync::unified_value_diff;

use super::load_config;

/// Arguments for `keymirror diff`.
#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl DiffArgs {
    pub fn run(self, config_path: &Path) -> Result<()> {
        let config = load_config(config_path)?;
        let preview = preview_blocking(&config).context("failed to preview the mirror")?;

        if self.json {
            return print_json(&preview);
        }
        print_text(&preview);
        Ok(())
    }
}

#[derive(Serialize)]
struct EntryJson<'a> {
    key: &'a str,
    bytes: usize,
}

#[derive(Serialize)]
struct PreviewJson<'a> {
    revision: i64,
    inserts: Vec<EntryJson<'a>>,
    updates: Vec<EntryJson<'a>>,
    deletions: &'a [String],
}

fn entries(map: &ValueMap) -> Vec<EntryJson<'_>> {
    map.iter()
        .map(|(key, value)| EntryJson {
            key,
            bytes: value.len(),
        })
        .collect()
}

fn print_json(preview: &Preview) -> Result<()> {
    let payload = PreviewJson {
        revision: preview.revision,
        inserts: entries(&preview.diff.inserts),
        updates: entries(&preview.diff.updates),
        deletions: &preview.diff.deletions,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to serialize diff JSON")?
    );
    Ok(())
}

fn print_text(preview: &Preview) {
    let diff = &preview.diff;
    if diff.is_empty() {
        println!("Mirror is up to date at revision {}.", preview.revision);
        return;
    }

    for key in diff.inserts.keys() {
        println!("{} {key}", "+".green().bold());
    }
    for (key, value) in &diff.updates {
        println!("{} {key}", "~".yellow().bold());
        let local = preview.local.get(key).map(Vec::as_slice).unwrap_or_default();
        let unified = unified_value_diff(key, local, value);
        print!("{unified}");
        if !unified.ends_with('\n') {
            println!();
        }
    }
    for key in &diff.deletions {
        println!("{} {key}", "-".red().bold());
    }

    println!(
        "\nrevision {}: {} to create, {} to update, {} to delete",
        preview.revision,
        diff.inserts.len(),
        diff.updates.len(),
        diff.deletions.len()
    );
}
