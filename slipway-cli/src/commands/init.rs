//! `slipway init`: write the default dashboard recipe.

use anyhow::{Context, Result};
use colored::Colorize;
use slipway_core::builder::DashboardRecipe;
use slipway_core::Config;
use std::fs;
use std::path::Path;

pub fn init(dir: &Path, force: bool, config: &Config) -> Result<()> {
    let path = dir.join("Dockerfile");
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let recipe = DashboardRecipe::from_config(config);
    let manifest = recipe.manifest.clone();
    let entry = recipe.entry.clone();

    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    fs::write(&path, recipe.into_recipe().render()).with_context(|| format!("Failed to write {}", path.display()))?;

    println!("{} Wrote {}", "✓".green().bold(), path.display());
    for expected in [&manifest, &entry] {
        if !dir.join(expected).exists() {
            println!("  {} {} not found yet", "note:".yellow(), expected);
        }
    }

    Ok(())
}
