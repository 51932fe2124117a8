//! Build command implementation for Slipway CLI.
//!
//! Builds dashboard images with a per-step progress bar and cache report.

use super::{format_duration, format_size};
use anyhow::{Context, Result};
use colored::Colorize;
use slipway_core::builder::{build_image_with, BuildOptions, ChainedBaseSource, ProgressFn, StepOutcome, StepReport};
use slipway_core::config::IsolationMode;
use slipway_core::{Config, ImageReference, StorePaths};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::PathBuf;

pub struct BuildArgs {
    pub context: PathBuf,
    pub tag: Option<String>,
    pub file: Option<String>,
    pub build_args: HashMap<String, String>,
    pub no_cache: bool,
    pub isolation: Option<IsolationMode>,
}

/// Builds an image and tags it.
pub async fn build(args: BuildArgs, config: &Config, paths: &StorePaths) -> Result<()> {
    let context_dir = args
        .context
        .canonicalize()
        .with_context(|| format!("Build context not found: {}", args.context.display()))?;

    let default_name = context_dir.file_name().and_then(|n| n.to_str()).unwrap_or("dashboard");
    let reference = ImageReference::parse(&default_tag(args.tag.as_deref(), default_name))?;

    println!("{} Building image {}", "»".bold().blue(), reference.to_string().green());

    let mut options = BuildOptions::new(&context_dir, reference.clone());
    options.dockerfile = args.file;
    options.build_args = args.build_args;
    options.no_cache = args.no_cache;
    options.isolation = args.isolation;

    if options.no_cache {
        println!("  {}", "Cache disabled".yellow());
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(120));
    pb.set_message("Resolving base runtime");

    let progress_bar = pb.clone();
    let progress: ProgressFn = Box::new(move |report: &StepReport| {
        progress_bar.println(format_step(report));
        progress_bar.set_message(format!("Step {} done", report.index + 1));
    });

    let mut sources = ChainedBaseSource::from_config(config, paths);
    let result = build_image_with(options, config, paths, &mut sources, Some(progress)).await;
    pb.finish_and_clear();
    let report = result?;

    for warning in &report.warnings {
        println!("  {} {}", "warning:".yellow(), warning);
    }

    let stats = &report.output.stats;
    println!();
    println!("{}", "Build completed successfully!".green().bold());
    println!();
    println!("  Image ID:    {}", report.image.short_id().cyan());
    println!("  Name:        {}", reference.to_string().green());
    println!("  Layers:      {} ({} executed, {} cached)", report.image.layers.len(), stats.executed, stats.cached);
    println!("  Total size:  {}", format_size(stats.total_size));
    if let Some(packages) = report.manifest_packages {
        println!("  Packages:    {}", packages);
    }
    println!("  Duration:    {}", format_duration(stats.duration.as_secs_f64()).yellow());
    println!();
    println!("  Run with: {}", format!("slipway run {}", reference).cyan());

    Ok(())
}

fn format_step(report: &StepReport) -> String {
    let outcome = match report.outcome {
        StepOutcome::Cached => "CACHED".green().to_string(),
        StepOutcome::Executed => format!("DONE {}", format_duration(report.duration.as_secs_f64())).blue().to_string(),
        StepOutcome::Metadata => "META".dimmed().to_string(),
    };
    format!("  [{}] {:<8} {} {}", report.index + 1, report.role, report.description, outcome)
}

/// Tag to build when none is given: the context directory name, lowercased.
fn default_tag(tag: Option<&str>, default_name: &str) -> String {
    match tag {
        Some(t) => t.to_string(),
        None => default_name.to_lowercase(),
    }
}
