//! `slipway cache` commands for cache inspection and garbage collection.

use super::format_size;
use anyhow::{Context, Result};
use colored::Colorize;
use slipway_core::builder::{CacheManager, CasStore};
use slipway_core::{Config, ImageStore, StorePaths};

fn open(config: &Config, paths: &StorePaths) -> Result<CacheManager> {
    let cas = CasStore::new(&paths.cas_dir()).context("Failed to open blob store")?;
    CacheManager::with_config(paths.cache_dir(), config.cache_size_limit_bytes, cas).context("Failed to open layer cache")
}

/// Print cache usage.
pub fn info(config: &Config, paths: &StorePaths) -> Result<()> {
    let cache = open(config, paths)?;
    let cas = cache.cas();

    println!("{}", "Layer cache".bold());
    println!("  Location:    {}", paths.root().display());
    println!("  Entries:     {}", cache.layer_count()?);
    println!("  Cached size: {}", format_size(cache.total_size()?));
    println!("  Size limit:  {}", format_size(config.cache_size_limit_bytes));
    println!("  Blobs:       {} ({})", cas.blob_count()?, format_size(cas.total_blob_size()?));

    Ok(())
}

/// Drop every cache entry. Blobs still referenced by images survive `gc`.
pub fn prune(config: &Config, paths: &StorePaths) -> Result<()> {
    let cache = open(config, paths)?;
    let removed = cache.clear()?;
    println!("Removed {} cache entr{}", removed, if removed == 1 { "y" } else { "ies" });
    Ok(())
}

/// Remove untagged image records and blobs nothing refers to.
pub fn gc(config: &Config, paths: &StorePaths) -> Result<()> {
    let cache = open(config, paths)?;
    let store = ImageStore::open(paths.root()).context("Failed to open image store")?;

    let images_removed = store.prune_untagged()?;

    let before = cache.cas().total_blob_size()?;
    let mut referenced = store.referenced_layers()?;
    referenced.extend(cache.referenced_layers()?);
    let blobs_removed = cache.cas().gc(&referenced)?;
    let reclaimed = before.saturating_sub(cache.cas().total_blob_size()?);

    println!(
        "Removed {} image record(s) and {} blob(s), reclaimed {}",
        images_removed,
        blobs_removed,
        format_size(reclaimed).green()
    );
    Ok(())
}
