//! Build plan for Slipway image building.
//!
//! A recipe becomes a strictly ordered list of steps. Each step's cache key
//! chains its parent's key, so invalidating one step invalidates everything
//! after it and nothing before it.

use crate::builder::context::{BuildContext, ContextError};
use crate::builder::parser::{Instruction, Recipe, RunCommand};
use crate::ports::ServeEndpoint;
use sha2::{Digest, Sha256};
use std::fmt;

/// Ordered build steps derived from a recipe.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub steps: Vec<PlanStep>,
    /// Manifest path the plan was classified against
    pub manifest_path: String,
}

/// A single step of the plan.
#[derive(Debug, Clone)]
pub struct PlanStep {
    /// Position in the plan (0 is FROM)
    pub index: usize,
    pub instruction: Instruction,
    pub role: StepRole,
    /// Previous step, `None` only for FROM
    pub parent: Option<usize>,
}

/// What a step contributes to the image, as far as caching is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRole {
    /// (a) base runtime
    Base,
    /// (b) working-directory declaration
    Workdir,
    /// (c) dependency manifest copy
    ManifestCopy,
    /// (d) dependency installation
    DependencyInstall,
    /// (e) application source tree copy
    SourceCopy,
    /// ENV/ARG/LABEL/EXPOSE/CMD/ENTRYPOINT
    Metadata,
    /// Any other COPY or RUN
    Other,
}

impl fmt::Display for StepRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            StepRole::Base => "base",
            StepRole::Workdir => "workdir",
            StepRole::ManifestCopy => "manifest",
            StepRole::DependencyInstall => "install",
            StepRole::SourceCopy => "source",
            StepRole::Metadata => "metadata",
            StepRole::Other => "step",
        };
        f.write_str(name)
    }
}

/// Error type for plan construction.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlanError {
    #[error("recipe has no FROM instruction")]
    MissingBase,

    #[error("FROM must be the first instruction (found at step {index})")]
    MisplacedBase { index: usize },
}

/// Non-fatal findings about step ordering and caching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanWarning {
    /// The source tree is copied before dependencies are installed, so any
    /// app edit reinstalls dependencies.
    SourceBeforeInstall { source_step: usize, install_step: usize },
    /// The install command may persist a package cache into the layer.
    InstallCacheEnabled { step: usize },
    /// No install step was found for the manifest.
    NoInstallStep,
    /// EXPOSE and the runner's bind flag disagree.
    PortMismatch { exposed: u16, bound: u16 },
    /// No EXPOSE for the port the runner binds.
    PortNotExposed { bound: u16 },
}

impl fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PlanWarning::SourceBeforeInstall { source_step, install_step } => write!(
                f,
                "source tree is copied at step {} before dependencies are installed at step {}; every app edit will reinstall dependencies",
                source_step, install_step
            ),
            PlanWarning::InstallCacheEnabled { step } => {
                write!(f, "install at step {} does not pass --no-cache-dir", step)
            }
            PlanWarning::NoInstallStep => write!(f, "no dependency install step follows the manifest copy"),
            PlanWarning::PortMismatch { exposed, bound } => {
                write!(f, "EXPOSE declares port {} but the runner binds port {}", exposed, bound)
            }
            PlanWarning::PortNotExposed { bound } => write!(f, "runner binds port {} but no EXPOSE declares it", bound),
        }
    }
}

impl BuildPlan {
    /// Classifies the recipe's instructions into ordered steps.
    ///
    /// `manifest_path` is the dependency manifest's path in the build
    /// context; the first COPY of exactly that file is the manifest copy and
    /// the first RUN after it is the dependency install.
    pub fn from_recipe(recipe: &Recipe, manifest_path: &str) -> Result<Self, PlanError> {
        match recipe.instructions.iter().position(|i| matches!(i, Instruction::From { .. })) {
            None => return Err(PlanError::MissingBase),
            Some(0) => {}
            Some(index) => return Err(PlanError::MisplacedBase { index }),
        }

        let manifest_norm = normalize(manifest_path);
        let mut steps = Vec::with_capacity(recipe.instructions.len());
        let mut manifest_seen = false;
        let mut install_seen = false;

        for (index, instruction) in recipe.instructions.iter().enumerate() {
            let role = match instruction {
                Instruction::From { .. } => StepRole::Base,
                Instruction::Workdir { .. } => StepRole::Workdir,
                Instruction::Copy { sources, .. } if sources.iter().any(|s| normalize(s).is_empty()) => {
                    StepRole::SourceCopy
                }
                Instruction::Copy { sources, .. }
                    if !manifest_seen && sources.len() == 1 && normalize(&sources[0]) == manifest_norm =>
                {
                    manifest_seen = true;
                    StepRole::ManifestCopy
                }
                Instruction::Run { .. } if manifest_seen && !install_seen => {
                    install_seen = true;
                    StepRole::DependencyInstall
                }
                Instruction::Copy { .. } | Instruction::Run { .. } => StepRole::Other,
                _ => StepRole::Metadata,
            };

            steps.push(PlanStep {
                index,
                instruction: instruction.clone(),
                role,
                parent: index.checked_sub(1),
            });
        }

        Ok(Self { steps, manifest_path: manifest_path.to_string() })
    }

    pub fn step_with_role(&self, role: StepRole) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.role == role)
    }

    /// Steps that produce a filesystem layer.
    pub fn layer_steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| s.produces_layer())
    }

    /// Ordering and caching checks. None of these stop a build.
    pub fn lint(&self) -> Vec<PlanWarning> {
        let mut warnings = Vec::new();

        let install = self.step_with_role(StepRole::DependencyInstall);
        let source = self.step_with_role(StepRole::SourceCopy);

        match (install, source) {
            (Some(install), Some(source)) if source.index < install.index => {
                warnings.push(PlanWarning::SourceBeforeInstall {
                    source_step: source.index,
                    install_step: install.index,
                });
            }
            (None, _) if self.step_with_role(StepRole::ManifestCopy).is_some() => {
                warnings.push(PlanWarning::NoInstallStep);
            }
            _ => {}
        }

        // A pip install after copying the whole tree is still an install
        for step in &self.steps {
            if let Instruction::Run { command } = &step.instruction {
                let text = command.text();
                if text.contains("pip install") && !text.contains("--no-cache-dir") {
                    warnings.push(PlanWarning::InstallCacheEnabled { step: step.index });
                }
            }
        }

        if let Some(bound) = self.launch_endpoint() {
            let exposed: Vec<u16> = self
                .steps
                .iter()
                .filter_map(|s| match &s.instruction {
                    Instruction::Expose { ports } => Some(ports.iter().map(|p| p.port).collect::<Vec<_>>()),
                    _ => None,
                })
                .flatten()
                .collect();

            match exposed.as_slice() {
                [] => warnings.push(PlanWarning::PortNotExposed { bound: bound.port }),
                ports if !ports.contains(&bound.port) => {
                    warnings.push(PlanWarning::PortMismatch { exposed: ports[0], bound: bound.port })
                }
                _ => {}
            }
        }

        warnings
    }

    /// Bind endpoint from the last CMD/ENTRYPOINT flags, if any.
    fn launch_endpoint(&self) -> Option<ServeEndpoint> {
        let mut argv: Vec<String> = Vec::new();
        for step in &self.steps {
            match &step.instruction {
                Instruction::Entrypoint { command } | Instruction::Cmd { command } => {
                    if let RunCommand::Exec(args) = command {
                        argv.extend(args.iter().cloned());
                    } else {
                        argv.extend(command.text().split_whitespace().map(String::from));
                    }
                }
                _ => {}
            }
        }
        ServeEndpoint::from_args(&argv)
    }
}

impl PlanStep {
    pub fn produces_layer(&self) -> bool {
        matches!(
            self.instruction,
            Instruction::Workdir { .. } | Instruction::Copy { .. } | Instruction::Run { .. }
        )
    }

    /// Short description for history and progress output.
    pub fn description(&self) -> String {
        let text = self.instruction.to_string();
        if text.len() > 100 {
            let cut = (0..=97).rev().find(|&i| text.is_char_boundary(i)).unwrap_or(0);
            format!("{}...", &text[..cut])
        } else {
            text
        }
    }
}

/// Cache key derivation.
pub struct StepKey;

impl StepKey {
    /// Key for the base runtime: reference, architecture and the resolved
    /// content digest. A re-pushed tag yields a new key.
    pub fn base(reference: &str, architecture: &str, base_digest: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"base\0");
        hasher.update(reference.as_bytes());
        hasher.update(b"\0");
        hasher.update(architecture.as_bytes());
        hasher.update(b"\0");
        hasher.update(base_digest.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Key for a non-base step: parent key, canonical instruction text and,
    /// for COPY, the digest of the copied context sources.
    pub fn derive(parent_key: &str, step: &PlanStep, context: &BuildContext) -> Result<String, ContextError> {
        let mut hasher = Sha256::new();
        hasher.update(parent_key.as_bytes());
        hasher.update(b"\0");
        hasher.update(step.instruction.to_string().as_bytes());

        if let Instruction::Copy { sources, .. } = &step.instruction {
            hasher.update(b"\0context\0");
            hasher.update(context.digest_sources(sources)?.as_bytes());
        }

        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// `./a/b/` -> `a/b`, `.` -> ``
fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::parser::parse_recipe;
    use crate::builder::recipe::DashboardRecipe;
    use std::fs;
    use tempfile::TempDir;

    fn dashboard_plan() -> BuildPlan {
        BuildPlan::from_recipe(&DashboardRecipe::default().into_recipe(), "requirements.txt").unwrap()
    }

    fn context() -> (TempDir, BuildContext) {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("requirements.txt"), "requests>=2.0\n").unwrap();
        fs::write(temp.path().join("app.py"), "print('ok')\n").unwrap();
        let context = BuildContext::new(temp.path().to_path_buf());
        (temp, context)
    }

    fn keys(plan: &BuildPlan, context: &BuildContext) -> Vec<String> {
        let mut keys = vec![StepKey::base("python:3.11-slim", "amd64", "sha256:base")];
        for step in plan.steps.iter().skip(1) {
            let parent = keys.last().unwrap().clone();
            keys.push(StepKey::derive(&parent, step, context).unwrap());
        }
        keys
    }

    #[test]
    fn test_roles_follow_layer_order() {
        let plan = dashboard_plan();
        let roles: Vec<StepRole> = plan.steps.iter().map(|s| s.role).collect();
        assert_eq!(
            roles,
            vec![
                StepRole::Base,
                StepRole::Workdir,
                StepRole::ManifestCopy,
                StepRole::DependencyInstall,
                StepRole::SourceCopy,
                StepRole::Metadata,
                StepRole::Metadata,
            ]
        );
        assert_eq!(plan.layer_steps().count(), 4);
        assert_eq!(plan.steps[0].parent, None);
        assert_eq!(plan.steps[3].parent, Some(2));
    }

    #[test]
    fn test_dashboard_plan_lints_clean() {
        assert!(dashboard_plan().lint().is_empty());
    }

    #[test]
    fn test_keys_are_deterministic() {
        let plan = dashboard_plan();
        let (_temp, context) = context();
        assert_eq!(keys(&plan, &context), keys(&plan, &context));
    }

    #[test]
    fn test_app_edit_keeps_install_key() {
        let plan = dashboard_plan();
        let (temp, context) = context();
        let before = keys(&plan, &context);

        fs::write(temp.path().join("app.py"), "print('edited')\n").unwrap();
        let after = keys(&plan, &context);

        // base, workdir, manifest, install unchanged; source and later change
        assert_eq!(before[..4], after[..4]);
        assert_ne!(before[4], after[4]);
        assert_ne!(before[6], after[6]);
    }

    #[test]
    fn test_manifest_edit_invalidates_install_and_after() {
        let plan = dashboard_plan();
        let (temp, context) = context();
        let before = keys(&plan, &context);

        fs::write(temp.path().join("requirements.txt"), "requests>=2.31\n").unwrap();
        let after = keys(&plan, &context);

        assert_eq!(before[..2], after[..2]);
        for i in 2..before.len() {
            assert_ne!(before[i], after[i], "step {} should be invalidated", i);
        }
    }

    #[test]
    fn test_base_digest_feeds_every_key() {
        let a = StepKey::base("python:3.11-slim", "amd64", "sha256:one");
        let b = StepKey::base("python:3.11-slim", "amd64", "sha256:two");
        let c = StepKey::base("python:3.11-slim", "arm64", "sha256:one");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_missing_source_surfaces_at_derive() {
        let plan = dashboard_plan();
        let temp = TempDir::new().unwrap();
        let context = BuildContext::new(temp.path().to_path_buf());
        let err = StepKey::derive("parent", &plan.steps[2], &context).unwrap_err();
        assert!(matches!(err, ContextError::NotFound(_)));
    }

    #[test]
    fn test_lint_flags_cache_hostile_order() {
        let recipe = parse_recipe(
            r#"
FROM python:3.11-slim
WORKDIR /app
COPY . .
COPY requirements.txt .
RUN pip install -r requirements.txt
EXPOSE 8000
CMD ["streamlit", "run", "app.py", "--server.port=8501"]
        "#,
        )
        .unwrap();
        let plan = BuildPlan::from_recipe(&recipe, "requirements.txt").unwrap();
        let warnings = plan.lint();

        assert!(warnings.contains(&PlanWarning::SourceBeforeInstall { source_step: 2, install_step: 4 }));
        assert!(warnings.contains(&PlanWarning::InstallCacheEnabled { step: 4 }));
        assert!(warnings.contains(&PlanWarning::PortMismatch { exposed: 8000, bound: 8501 }));
    }

    #[test]
    fn test_manifest_path_is_normalized() {
        let recipe = parse_recipe("FROM python:3.11-slim\nCOPY ./requirements.txt .\nRUN pip install --no-cache-dir -r requirements.txt\n").unwrap();
        let plan = BuildPlan::from_recipe(&recipe, "requirements.txt").unwrap();
        assert_eq!(plan.steps[1].role, StepRole::ManifestCopy);
        assert_eq!(plan.steps[2].role, StepRole::DependencyInstall);
    }
}
