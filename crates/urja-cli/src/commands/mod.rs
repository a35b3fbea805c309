//! Subcommand implementations.

pub mod build;
pub mod deps;
pub mod dev;

use miette::{IntoDiagnostic, Result, WrapErr};
use std::path::Path;
use urja_core::BuildConfig;

/// Load an explicit config file, reporting the path on failure.
pub fn load_config(path: &Path) -> Result<BuildConfig> {
    BuildConfig::from_json_file(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to load {}", path.display()))
}
