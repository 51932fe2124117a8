//! Image building for Slipway.
//!
//! This module provides recipe parsing, build planning, layer caching and
//! build execution for creating dashboard images.

pub mod base;
pub mod build;
pub mod cache;
pub mod cas;
pub mod context;
pub mod executor;
pub mod layer;
pub mod oci;
pub mod parser;
pub mod plan;
pub mod recipe;
pub mod requirements;
pub mod runner;

pub use base::{BaseSource, ChainedBaseSource, LocalBaseSource, ResolvedBase};
pub use build::{build_image, build_image_with, BuildOptions, BuildReport};
pub use cache::{CacheError, CacheLookupResult, CacheManager, LayerMetadata};
pub use cas::{BlobWriter, CasStore};
pub use context::BuildContext;
pub use executor::{BuildError, BuildOutput, BuildResult, BuildStats, ImageBuilder, ProgressFn, StepOutcome, StepReport};
pub use oci::RegistryBaseSource;
pub use parser::{parse_recipe, Instruction, ParseError, Recipe, RunCommand};
pub use plan::{BuildPlan, PlanError, PlanWarning, StepRole};
pub use recipe::DashboardRecipe;
pub use requirements::DependencyManifest;
pub use runner::{Isolation, StepRunner};
