//! Project configuration lookup and CLI overrides
//!
//! `regen.toml` is searched upwards from the current directory unless a file
//! is named explicitly. Command line flags win over both the file and the
//! `REGEN_*` environment variables.

use anyhow::{Context, Result};
use regen_build::BuildConfig;
use regen_config::{Config, ConfigLoader};
use std::env;
use std::path::{Path, PathBuf};

/// Flags shared by every command that touches a project
#[derive(Debug, Clone, Default)]
pub struct ProjectOverrides {
    /// Explicit configuration file
    pub config: Option<PathBuf>,
    pub source_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub jobs: Option<usize>,
}

/// Load the project configuration
pub fn load(config_file: Option<&Path>) -> Result<Config> {
    let loader = ConfigLoader::new();
    match config_file {
        Some(path) => loader
            .load_from_file(&absolute(path)?)
            .with_context(|| format!("Failed to load {}", path.display())),
        None => {
            let cwd = env::current_dir().context("Failed to read current directory")?;
            loader
                .load_from_directory(&cwd)
                .context("Failed to load project configuration")
        }
    }
}

/// Engine configuration with command line overrides applied
pub fn build_config(overrides: &ProjectOverrides) -> Result<BuildConfig> {
    let config = load(overrides.config.as_deref())?;
    let mut build = BuildConfig::from_config(&config);

    if let Some(dir) = &overrides.source_dir {
        build.source_root = absolute(dir)?;
    }
    if let Some(dir) = &overrides.output_dir {
        build.output_root = absolute(dir)?;
    }
    if let Some(jobs) = overrides.jobs {
        anyhow::ensure!(jobs > 0, "--jobs must be at least 1");
        build.jobs = jobs;
    }

    Ok(build)
}

/// Resolve `path` against the current directory
pub fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = env::current_dir().context("Failed to read current directory")?;
    Ok(cwd.join(path))
}
