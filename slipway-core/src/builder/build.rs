//! Image build entry point.
//!
//! Used by the CLI (`slipway build`) and the integration tests. A build
//! either ends with the image committed and tagged, or with an error and the
//! tag untouched.

use crate::builder::base::{BaseSource, ChainedBaseSource};
use crate::builder::cache::CacheManager;
use crate::builder::cas::CasStore;
use crate::builder::context::BuildContext;
use crate::builder::executor::{BuildOutput, ImageBuilder, ProgressFn};
use crate::builder::parser::{parse_recipe_file, Recipe};
use crate::builder::plan::{BuildPlan, PlanWarning};
use crate::builder::recipe::DashboardRecipe;
use crate::builder::requirements::DependencyManifest;
use crate::builder::runner::{Isolation, StepRunner};
use crate::config::{Config, IsolationMode};
use crate::error::{Result, SlipwayError};
use crate::image::{host_architecture, ImageRecord, ImageReference, ImageStore};
use crate::paths::StorePaths;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};

/// Options for building an image.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Path to the build context directory
    pub context_path: PathBuf,

    /// Recipe path relative to the context. When unset, `Dockerfile` is used
    /// if present and the default dashboard recipe otherwise.
    pub dockerfile: Option<String>,

    /// Tag to assign on success
    pub reference: ImageReference,

    /// Build arguments (ARG values)
    pub build_args: HashMap<String, String>,

    /// Skip cache lookups
    pub no_cache: bool,

    /// Override `config.isolation`
    pub isolation: Option<IsolationMode>,
}

impl BuildOptions {
    pub fn new(context_path: impl Into<PathBuf>, reference: ImageReference) -> Self {
        Self {
            context_path: context_path.into(),
            dockerfile: None,
            reference,
            build_args: HashMap::new(),
            no_cache: false,
            isolation: None,
        }
    }
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    /// The committed, tagged image
    pub image: ImageRecord,
    pub output: BuildOutput,
    /// Ordering and caching findings
    pub warnings: Vec<PlanWarning>,
    /// Number of requirements in the dependency manifest, if one was found
    pub manifest_packages: Option<usize>,
}

/// Build an image with base sources from `config`.
pub async fn build_image(options: BuildOptions, config: &Config, paths: &StorePaths) -> Result<BuildReport> {
    let mut sources = ChainedBaseSource::from_config(config, paths);
    build_image_with(options, config, paths, &mut sources, None).await
}

/// Build an image resolving the base through `base_source`.
///
/// 1. Loads the recipe (or the default dashboard recipe)
/// 2. Plans and lints the steps
/// 3. Resolves the base runtime
/// 4. Executes the steps on a blocking thread
/// 5. Commits the image and moves the tag
#[instrument(skip_all, fields(image = %options.reference))]
pub async fn build_image_with(
    options: BuildOptions,
    config: &Config,
    paths: &StorePaths,
    base_source: &mut dyn BaseSource,
    progress: Option<ProgressFn>,
) -> Result<BuildReport> {
    info!("Building image {} from {:?}", options.reference, options.context_path);

    let context_path = options.context_path.canonicalize().map_err(|e| SlipwayError::FileReadError {
        path: options.context_path.to_string_lossy().to_string(),
        source: e,
    })?;

    // Phase 1: recipe
    let (recipe, recipe_path) = load_recipe(&options, &context_path, config)?;
    debug!(base = %recipe.base, instructions = recipe.instructions.len(), "Recipe loaded");

    // Phase 2: plan
    let plan = BuildPlan::from_recipe(&recipe, &config.manifest_path)
        .map_err(|e| SlipwayError::InvalidRecipe { path: recipe_path.clone(), reason: e.to_string() })?;

    let warnings = plan.lint();
    for warning in &warnings {
        warn!("{}", warning);
    }

    let manifest_path = context_path.join(&config.manifest_path);
    let mut manifest_packages = None;
    if manifest_path.is_file() {
        let content = std::fs::read_to_string(&manifest_path)
            .map_err(|e| SlipwayError::FileReadError { path: manifest_path.to_string_lossy().to_string(), source: e })?;
        match DependencyManifest::parse(&content) {
            Ok(manifest) => {
                info!(
                    packages = manifest.len(),
                    manifest = %config.manifest_path,
                    digest = %&DependencyManifest::digest(content.as_bytes())[..12],
                    "Dependency manifest parsed"
                );
                for req in manifest.unpinned() {
                    debug!(package = %req.name, "Unpinned requirement");
                }
                manifest_packages = Some(manifest.len());
            }
            // The installer has the final say on what it accepts
            Err(e) => warn!(manifest = %config.manifest_path, error = %e, "Dependency manifest not understood; package count unknown"),
        }
    }

    // Phase 3: storage and base
    let cas = CasStore::new(&paths.cas_dir())
        .map_err(|e| SlipwayError::IoError { path: paths.cas_dir(), source: e })?;
    let cache = CacheManager::with_config(paths.cache_dir(), config.cache_size_limit_bytes, cas.clone())
        .map_err(SlipwayError::internal)?;
    let store = ImageStore::open(paths.root())?;

    let base = base_source.resolve(&recipe.base, host_architecture(), &cas).await?;
    let base_identity = base.identity.clone();
    info!(base = %base_identity.reference, digest = %&base_identity.digest[..12.min(base_identity.digest.len())], "Base runtime resolved");

    // Phase 4: execute
    let isolation = Isolation::resolve(options.isolation.unwrap_or(config.isolation));
    let build_id = uuid::Uuid::new_v4().to_string();
    let mut builder = ImageBuilder::new(StepRunner::new(isolation), paths.build_dir(&build_id));
    if let Some(progress) = progress {
        builder = builder.with_progress(progress);
    }

    let context = BuildContext {
        root: context_path,
        recipe_path: recipe_path.clone(),
        build_args: options.build_args.clone(),
        no_cache: options.no_cache,
    };

    let exec_cache = cache.clone();
    let output = tokio::task::spawn_blocking(move || builder.execute(&plan, &base, &context, &exec_cache))
        .await
        .map_err(|e| SlipwayError::Internal(format!("build task failed: {}", e)))??;

    // Phase 5: commit, tag last
    let record = ImageRecord::new(options.reference.clone(), base_identity, output.layers.clone(), output.config.clone());
    store.commit(&record)?;

    if let Err(e) = cache.evict_if_needed() {
        warn!(error = %e, "Cache eviction failed");
    }

    info!(
        id = %record.short_id(),
        executed = output.stats.executed,
        cached = output.stats.cached,
        duration_secs = output.stats.duration.as_secs_f64(),
        "Successfully built {}",
        options.reference
    );

    Ok(BuildReport { image: record, output, warnings, manifest_packages })
}

fn load_recipe(options: &BuildOptions, context_path: &std::path::Path, config: &Config) -> Result<(Recipe, PathBuf)> {
    let name = options.dockerfile.clone().unwrap_or_else(|| "Dockerfile".to_string());
    let path = context_path.join(&name);

    if path.is_file() {
        let recipe = parse_recipe_file(&path, &options.build_args)
            .map_err(|e| SlipwayError::InvalidRecipe { path: path.clone(), reason: e.to_string() })?;
        return Ok((recipe, PathBuf::from(name)));
    }

    if options.dockerfile.is_some() {
        return Err(SlipwayError::InvalidRecipe { path, reason: "recipe not found".to_string() });
    }

    info!("No Dockerfile in context, using the default dashboard recipe");
    Ok((DashboardRecipe::from_config(config).into_recipe(), PathBuf::from(name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_recipe_falls_back_to_default() {
        let temp = TempDir::new().unwrap();
        let options = BuildOptions::new(temp.path(), ImageReference::parse("dash").unwrap());
        let (recipe, path) = load_recipe(&options, temp.path(), &Config::default()).unwrap();

        assert_eq!(path, PathBuf::from("Dockerfile"));
        assert_eq!(recipe, DashboardRecipe::default().into_recipe());
    }

    #[test]
    fn test_load_recipe_missing_explicit_file() {
        let temp = TempDir::new().unwrap();
        let mut options = BuildOptions::new(temp.path(), ImageReference::parse("dash").unwrap());
        options.dockerfile = Some("Dockerfile.prod".into());

        let err = load_recipe(&options, temp.path(), &Config::default()).unwrap_err();
        assert!(matches!(err, SlipwayError::InvalidRecipe { .. }));
    }

    #[test]
    fn test_load_recipe_rejects_multi_stage() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("Dockerfile"),
            "FROM python:3.11 AS build\nRUN true\nFROM python:3.11-slim\nCOPY --from=build /x /x\n",
        )
        .unwrap();
        let options = BuildOptions::new(temp.path(), ImageReference::parse("dash").unwrap());

        let err = load_recipe(&options, temp.path(), &Config::default()).unwrap_err();
        assert!(matches!(err, SlipwayError::InvalidRecipe { .. }));
    }
}
