//! Run command implementation for Slipway CLI.

use anyhow::Result;
use colored::Colorize;
use slipway_core::config::IsolationMode;
use slipway_core::{Config, ImageReference, LaunchOptions, Launcher, StorePaths};
use std::net::IpAddr;

/// Launches an image in the foreground and returns the process exit code.
pub async fn run(
    image: &str,
    port: Option<u16>,
    address: Option<IpAddr>,
    isolation: Option<IsolationMode>,
    config: &Config,
    paths: &StorePaths,
) -> Result<i32> {
    let reference = ImageReference::parse(image)?;
    let launcher = Launcher::new(config, paths)?;
    let options = LaunchOptions { port, address, isolation };

    eprintln!("{} Launching {}", "»".bold().blue(), reference.to_string().green());

    let outcome = launcher.run(&reference, &options).await?;

    if outcome.exit_code != 0 {
        eprintln!(
            "{} {} exited with code {}",
            "»".bold().blue(),
            reference,
            outcome.exit_code.to_string().yellow()
        );
    }

    Ok(outcome.exit_code)
}
