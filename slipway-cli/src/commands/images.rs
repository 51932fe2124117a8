//! Images command implementation for Slipway CLI.
//!
//! Lists and untags images in the local image store.

use super::format_size;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use slipway_core::{ImageReference, ImageStore, StorePaths};
use tabled::{Table, Tabled};

/// Lists all tagged images.
pub fn images(paths: &StorePaths) -> Result<()> {
    let store = ImageStore::open(paths.root()).context("Failed to open image store")?;
    let images = store.list().context("Failed to list images")?;

    if images.is_empty() {
        println!("No images found.");
        println!();
        println!("Build your first image with: {}", "slipway build".cyan());
        return Ok(());
    }

    #[derive(Tabled)]
    struct ImageRow {
        #[tabled(rename = "REPOSITORY")]
        repository: String,
        #[tabled(rename = "TAG")]
        tag: String,
        #[tabled(rename = "IMAGE ID")]
        image_id: String,
        #[tabled(rename = "BASE")]
        base: String,
        #[tabled(rename = "SIZE")]
        size: String,
        #[tabled(rename = "CREATED")]
        created: String,
    }

    let now = Utc::now();
    let rows: Vec<ImageRow> = images
        .iter()
        .map(|img| ImageRow {
            repository: img.reference.name.clone(),
            tag: img.reference.tag.clone(),
            image_id: img.short_id().to_string(),
            base: img.base.reference.clone(),
            size: format_size(img.total_size()),
            created: format_created(img.created, now),
        })
        .collect();

    let table = Table::new(rows).to_string();
    println!("{}", table);

    Ok(())
}

/// Removes image tags. Layers stay cached until `slipway cache gc`.
pub fn rmi(references: &[String], paths: &StorePaths) -> Result<()> {
    let store = ImageStore::open(paths.root()).context("Failed to open image store")?;

    for reference in references {
        let reference = ImageReference::parse(reference)?;
        store.untag(&reference)?;
        println!("Untagged: {}", reference.to_string().green());
    }

    Ok(())
}

/// Formats creation time relative to `now`.
fn format_created(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - created_at).num_seconds().max(0);
    if secs < 60 {
        format!("{} seconds ago", secs)
    } else if secs < 3600 {
        format!("{} minutes ago", secs / 60)
    } else if secs < 86400 {
        format!("{} hours ago", secs / 3600)
    } else if secs < 604800 {
        format!("{} days ago", secs / 86400)
    } else {
        format!("{} weeks ago", secs / 604800)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_format_created() {
        let now = Utc::now();
        assert_eq!(format_created(now - Duration::seconds(30), now), "30 seconds ago");
        assert_eq!(format_created(now - Duration::minutes(5), now), "5 minutes ago");
        assert_eq!(format_created(now - Duration::hours(3), now), "3 hours ago");
        assert_eq!(format_created(now - Duration::days(2), now), "2 days ago");
        assert_eq!(format_created(now - Duration::days(21), now), "3 weeks ago");
    }

    #[test]
    fn test_format_created_clock_skew() {
        let now = Utc::now();
        assert_eq!(format_created(now + Duration::seconds(10), now), "0 seconds ago");
    }
}
