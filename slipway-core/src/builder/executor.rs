//! Build executor for Slipway images.
//!
//! Runs a [`BuildPlan`] strictly in order, one step at a time. Every
//! layer-producing step is looked up in the cache first; only misses do any
//! work. The root filesystem is materialized lazily, the first time a RUN
//! step actually has to execute, so a fully cached build never unpacks
//! anything.

use crate::builder::base::ResolvedBase;
use crate::builder::cache::{CacheError, CacheLookupResult, CacheManager};
use crate::builder::cas::CasStore;
use crate::builder::context::{BuildContext, ContextError};
use crate::builder::layer::{
    apply_layer, copy_layer, diff_layer, workdir_layer, LayerWriter, Snapshot, PACKAGE_CACHE_EXCLUDES, RUNTIME_EXCLUDES,
};
use crate::builder::parser::Instruction;
use crate::builder::plan::{BuildPlan, PlanStep, StepKey, StepRole};
use crate::builder::runner::StepRunner;
use crate::error::SlipwayError;
use crate::image::{ImageConfig, LayerRecord};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Result type for build operations.
pub type BuildResult<T> = Result<T, BuildError>;

/// Error type for build operations.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("step {step} failed: {instruction}\n{details}")]
    InstructionFailed { step: usize, instruction: String, details: String },

    #[error("base runtime {image} unreachable: {reason}")]
    BaseUnreachable { image: String, reason: String },

    #[error("step {step}: source {path:?} not found in build context")]
    SourceNotFound { step: usize, path: PathBuf },

    #[error("Build context error: {0}")]
    Context(#[from] ContextError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl From<BuildError> for SlipwayError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Io(source) => SlipwayError::IoError { path: PathBuf::new(), source },
            BuildError::InstructionFailed { step, instruction, details } => {
                SlipwayError::BuildFailed { step, instruction, reason: details }
            }
            BuildError::BaseUnreachable { image, reason } => SlipwayError::BaseUnreachable { image, reason },
            BuildError::SourceNotFound { path, .. } | BuildError::Context(ContextError::NotFound(path)) => {
                SlipwayError::SourceNotFound { path }
            }
            other => SlipwayError::Internal(other.to_string()),
        }
    }
}

/// How a step was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Layer reused from the cache; nothing executed
    Cached,
    /// Layer produced by this build
    Executed,
    /// Configuration-only step
    Metadata,
}

/// Per-step result for reporting.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub index: usize,
    pub role: StepRole,
    pub description: String,
    pub outcome: StepOutcome,
    pub duration: Duration,
}

/// Build statistics.
#[derive(Debug, Clone, Default)]
pub struct BuildStats {
    pub steps: usize,
    /// Layer steps that ran
    pub executed: usize,
    /// Layer steps served from cache
    pub cached: usize,
    /// Total size of all layers (bytes), base included
    pub total_size: u64,
    pub duration: Duration,
}

/// Result of a successful execution.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// Base layers followed by one record per non-FROM step
    pub layers: Vec<LayerRecord>,
    pub config: ImageConfig,
    pub steps: Vec<StepReport>,
    pub stats: BuildStats,
}

impl BuildOutput {
    /// Report for the first step with `role`.
    pub fn step(&self, role: StepRole) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.role == role)
    }
}

pub type ProgressFn = Box<dyn Fn(&StepReport) + Send + Sync>;

/// Executes build plans on the local machine.
pub struct ImageBuilder {
    runner: StepRunner,
    /// Scratch directory for the root filesystem, removed afterwards
    work_dir: PathBuf,
    progress: Option<ProgressFn>,
}

/// Root filesystem materialized on demand.
struct LazyRootfs {
    path: PathBuf,
    /// How many of the image's layer digests are already applied
    applied: usize,
}

impl ImageBuilder {
    pub fn new(runner: StepRunner, work_dir: PathBuf) -> Self {
        Self { runner, work_dir, progress: None }
    }

    /// Called after every step completes.
    pub fn with_progress(mut self, progress: impl Fn(&StepReport) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Execute `plan` on top of `base`.
    pub fn execute(
        &self,
        plan: &BuildPlan,
        base: &ResolvedBase,
        context: &BuildContext,
        cache: &CacheManager,
    ) -> BuildResult<BuildOutput> {
        let start = Instant::now();
        let result = self.execute_steps(plan, base, context, cache);

        if self.work_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.work_dir) {
                debug!(dir = %self.work_dir.display(), error = %e, "Failed to remove build scratch directory");
            }
        }

        let mut output = result?;
        output.stats.duration = start.elapsed();
        info!(
            steps = output.stats.steps,
            executed = output.stats.executed,
            cached = output.stats.cached,
            size = output.stats.total_size,
            "Build steps complete"
        );
        Ok(output)
    }

    fn execute_steps(
        &self,
        plan: &BuildPlan,
        base: &ResolvedBase,
        context: &BuildContext,
        cache: &CacheManager,
    ) -> BuildResult<BuildOutput> {
        let cas = cache.cas();
        let total = plan.steps.len();

        let mut config = ImageConfig {
            workdir: base.workdir.clone().unwrap_or_else(|| "/".to_string()),
            env: base.env.clone(),
            ..Default::default()
        };
        let mut args: Vec<(String, String)> = Vec::new();
        let mut stats = BuildStats { steps: total, ..Default::default() };
        let mut reports = Vec::with_capacity(total);
        let mut rootfs: Option<LazyRootfs> = None;

        let mut parent_key =
            StepKey::base(&base.identity.reference, &base.identity.architecture, &base.identity.digest);
        let mut layers: Vec<LayerRecord> = base
            .layers
            .iter()
            .enumerate()
            .map(|(i, layer)| LayerRecord {
                cache_key: parent_key.clone(),
                digest: Some(layer.digest.clone()),
                size: layer.size,
                created_by: format!("FROM {} (layer {}/{})", base.identity.reference, i + 1, base.layers.len()),
                empty_layer: false,
            })
            .collect();

        for step in &plan.steps {
            let started = Instant::now();
            info!("Step {}/{} : {}", step.index + 1, total, step.description());

            if step.role == StepRole::Base {
                self.report(&mut reports, step, StepOutcome::Cached, started);
                continue;
            }

            let key = StepKey::derive(&parent_key, step, context).map_err(|e| match e {
                ContextError::NotFound(path) => BuildError::SourceNotFound { step: step.index, path },
                other => BuildError::Context(other),
            })?;

            if !step.produces_layer() {
                apply_metadata(&step.instruction, &mut config, &mut args);
                layers.push(LayerRecord {
                    cache_key: key.clone(),
                    digest: None,
                    size: 0,
                    created_by: step.description(),
                    empty_layer: true,
                });
                parent_key = key;
                self.report(&mut reports, step, StepOutcome::Metadata, started);
                continue;
            }

            if let Instruction::Workdir { path } = &step.instruction {
                config.workdir = resolve_workdir(&config.workdir, path);
            }

            let cached = if context.no_cache {
                None
            } else {
                match cache.lookup(&key)? {
                    CacheLookupResult::Hit(metadata) => Some(metadata),
                    CacheLookupResult::Miss => None,
                }
            };

            let (digest, size, outcome) = match cached {
                Some(metadata) => {
                    info!(" ---> Using cache {}", &key[..12]);
                    stats.cached += 1;
                    (metadata.layer_digest, metadata.size_bytes, StepOutcome::Cached)
                }
                None => {
                    let (digest, size) = self.produce_layer(step, context, cas, &config, &args, &layers, &mut rootfs)?;
                    cache.insert(&key, digest.clone(), size, step.description())?;
                    stats.executed += 1;
                    (digest, size, StepOutcome::Executed)
                }
            };

            layers.push(LayerRecord {
                cache_key: key.clone(),
                empty_layer: digest.is_none(),
                digest,
                size,
                created_by: step.description(),
            });
            parent_key = key;
            self.report(&mut reports, step, outcome, started);
        }

        stats.total_size = layers.iter().map(|l| l.size).sum();
        Ok(BuildOutput { layers, config, steps: reports, stats })
    }

    /// Build the layer for a cache miss. Returns its digest (`None` when the
    /// step changed nothing) and size.
    #[allow(clippy::too_many_arguments)]
    fn produce_layer(
        &self,
        step: &PlanStep,
        context: &BuildContext,
        cas: &CasStore,
        config: &ImageConfig,
        args: &[(String, String)],
        layers: &[LayerRecord],
        rootfs: &mut Option<LazyRootfs>,
    ) -> BuildResult<(Option<String>, u64)> {
        let source_err = |e: ContextError| match e {
            ContextError::NotFound(path) => BuildError::SourceNotFound { step: step.index, path },
            other => BuildError::Context(other),
        };

        let layer = match &step.instruction {
            Instruction::Workdir { .. } => workdir_layer(&config.workdir),
            Instruction::Copy { sources, destination, chown } => {
                let layer = copy_layer(context, sources, destination, &config.workdir).map_err(source_err)?;
                match chown {
                    Some(owner) => layer.with_owner_spec(owner).map_err(|details| BuildError::InstructionFailed {
                        step: step.index,
                        instruction: step.instruction.to_string(),
                        details,
                    })?,
                    None => layer,
                }
            }
            Instruction::Run { command } => {
                let root = self.ensure_rootfs(rootfs, layers, cas)?;
                let mut excludes = RUNTIME_EXCLUDES.to_vec();
                if step.role == StepRole::DependencyInstall {
                    excludes.extend_from_slice(PACKAGE_CACHE_EXCLUDES);
                }

                let before = Snapshot::capture(&root, &excludes)?;
                let mut env = config.env.clone();
                for (k, v) in args {
                    if !env.iter().any(|(key, _)| key == k) {
                        env.push((k.clone(), v.clone()));
                    }
                }
                self.runner.run(step.index, command, &root, &config.workdir, &env, step.role)?;
                let after = Snapshot::capture(&root, &excludes)?;

                let layer = diff_layer(&root, &before, &after);
                // The changes are already on disk in the rootfs
                if let Some(lazy) = rootfs.as_mut() {
                    lazy.applied += usize::from(!layer.is_empty());
                }
                layer
            }
            _ => return Ok((None, 0)),
        };

        if layer.is_empty() {
            debug!(step = step.index, "Step produced no changes");
            return Ok((None, 0));
        }

        let (digest, size) = store_layer(&layer, cas)?;
        Ok((Some(digest), size))
    }

    /// Materialize (or catch up) the rootfs with every layer so far.
    fn ensure_rootfs(&self, rootfs: &mut Option<LazyRootfs>, layers: &[LayerRecord], cas: &CasStore) -> BuildResult<PathBuf> {
        let lazy = rootfs.get_or_insert_with(|| LazyRootfs { path: self.work_dir.join("rootfs"), applied: 0 });
        std::fs::create_dir_all(&lazy.path)?;

        let digests: Vec<&String> = layers.iter().filter_map(|l| l.digest.as_ref()).collect();
        if lazy.applied < digests.len() {
            info!(layers = digests.len() - lazy.applied, rootfs = %lazy.path.display(), "Materializing root filesystem");
        }
        for digest in &digests[lazy.applied.min(digests.len())..] {
            apply_layer(cas.open_blob(digest)?, &lazy.path)?;
        }
        lazy.applied = digests.len();

        Ok(lazy.path.clone())
    }

    fn report(&self, reports: &mut Vec<StepReport>, step: &PlanStep, outcome: StepOutcome, started: Instant) {
        let report = StepReport {
            index: step.index,
            role: step.role,
            description: step.description(),
            outcome,
            duration: started.elapsed(),
        };
        if let Some(progress) = &self.progress {
            progress(&report);
        }
        reports.push(report);
    }
}

fn store_layer(layer: &LayerWriter, cas: &CasStore) -> BuildResult<(String, u64)> {
    let mut blob = cas.blob_writer()?;
    layer.write_to(&mut blob)?;
    Ok(blob.finish()?)
}

fn apply_metadata(instruction: &Instruction, config: &mut ImageConfig, args: &mut Vec<(String, String)>) {
    match instruction {
        Instruction::Env { vars } => {
            for (k, v) in vars {
                config.set_env(k, v);
            }
        }
        Instruction::Arg { name, value } => {
            if let Some(value) = value {
                args.retain(|(k, _)| k != name);
                args.push((name.clone(), value.clone()));
            }
        }
        Instruction::Label { labels } => {
            for (k, v) in labels {
                config.set_label(k, v);
            }
        }
        Instruction::Expose { ports } => {
            for spec in ports {
                if !config.exposed_ports.contains(&spec.port) {
                    config.exposed_ports.push(spec.port);
                }
            }
        }
        Instruction::Entrypoint { command } => {
            config.entrypoint = command.to_argv();
            // Docker semantics: a new ENTRYPOINT resets CMD
            config.cmd.clear();
        }
        Instruction::Cmd { command } => config.cmd = command.to_argv(),
        _ => {}
    }
}

fn resolve_workdir(current: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        Path::new(current).join(path).to_string_lossy().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::parser::{parse_recipe, RunCommand};

    #[test]
    fn test_apply_metadata() {
        let recipe = parse_recipe(
            "FROM python:3.11-slim\nENV A=1 B=2\nARG MODE=prod\nLABEL team=data\nEXPOSE 8501\nCMD [\"streamlit\", \"run\", \"app.py\"]\n",
        )
        .unwrap();

        let mut config = ImageConfig::default();
        let mut args = Vec::new();
        for instruction in &recipe.instructions {
            apply_metadata(instruction, &mut config, &mut args);
        }

        assert_eq!(config.get_env("B"), Some("2"));
        assert_eq!(args, vec![("MODE".to_string(), "prod".to_string())]);
        assert_eq!(config.labels, vec![("team".to_string(), "data".to_string())]);
        assert_eq!(config.exposed_ports, vec![8501]);
        assert_eq!(config.cmd, vec!["streamlit", "run", "app.py"]);
    }

    #[test]
    fn test_entrypoint_resets_cmd() {
        let mut config = ImageConfig { cmd: vec!["old".into()], ..Default::default() };
        apply_metadata(
            &Instruction::Entrypoint { command: RunCommand::Exec(vec!["streamlit".into()]) },
            &mut config,
            &mut Vec::new(),
        );
        assert_eq!(config.entrypoint, vec!["streamlit"]);
        assert!(config.cmd.is_empty());
    }

    #[test]
    fn test_resolve_workdir() {
        assert_eq!(resolve_workdir("/", "/app"), "/app");
        assert_eq!(resolve_workdir("/app", "src"), "/app/src");
    }

    #[test]
    fn test_error_conversion() {
        let err: SlipwayError = BuildError::InstructionFailed {
            step: 3,
            instruction: "RUN pip install".into(),
            details: "exit code 1".into(),
        }
        .into();
        assert!(matches!(err, SlipwayError::BuildFailed { step: 3, .. }));

        let err: SlipwayError = BuildError::SourceNotFound { step: 4, path: PathBuf::from("/ctx/app") }.into();
        assert!(matches!(err, SlipwayError::SourceNotFound { .. }));
    }
}
