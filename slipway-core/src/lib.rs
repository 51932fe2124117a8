//! Slipway Core Library
//!
//! Layered, cached image builds and single-process foreground launches for
//! interactive dashboard applications.

pub mod builder;
pub mod config;
pub mod error;
pub mod image;
pub mod launcher;
pub mod observability;
pub mod paths;
pub mod ports;

// Re-export commonly used items
pub use builder::{build_image, BuildOptions, BuildReport};
pub use config::Config;
pub use error::{Result, SlipwayError};
pub use image::{ImageRecord, ImageReference, ImageStore};
pub use launcher::{LaunchOptions, LaunchOutcome, Launcher};
pub use observability::init as init_observability;
pub use paths::StorePaths;
pub use ports::ServeEndpoint;
