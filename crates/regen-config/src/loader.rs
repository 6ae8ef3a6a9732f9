//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::project::{BuildSettings, PathsConfig, ProjectConfig, ToolsConfig, TOOL_NAMES};
use crate::{ConfigError, ConfigResult, CONFIG_FILE_NAME};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

/// Worker pool width used when nothing else is configured
pub const DEFAULT_JOBS: usize = 16;

/// Output root used when nothing else is configured, relative to the project root
pub const DEFAULT_OUTPUT_DIR: &str = "build/regen";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Project config (./regen.toml) - lowest priority
/// 2. Environment variables (REGEN_*) - overrides project
/// 3. CLI flags - highest priority (handled by caller)
#[derive(Debug, Default)]
pub struct ConfigLoader;

/// Merged configuration result
#[derive(Debug, Clone)]
pub struct Config {
    /// Project configuration
    pub project: ProjectConfig,

    /// Directory the configuration was found in, if any
    pub project_root: Option<PathBuf>,

    /// Directory relative paths are anchored to when there is no project root
    pub base_dir: PathBuf,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find regen.toml. A missing file is not
    /// an error: defaults anchored at `start_dir` are used instead.
    pub fn load_from_directory(&self, start_dir: &Path) -> ConfigResult<Config> {
        let (project_root, project_config) = self.find_project_config(start_dir)?;
        let project_config = self.apply_env_overrides(project_config)?;

        Ok(Config {
            project: project_config,
            base_dir: project_root
                .clone()
                .unwrap_or_else(|| start_dir.to_path_buf()),
            project_root,
        })
    }

    /// Load configuration from a specific project config file
    pub fn load_from_file(&self, config_path: &Path) -> ConfigResult<Config> {
        let project_config = ProjectConfig::load_from_file(config_path)?;
        let project_config = self.apply_env_overrides(project_config)?;

        let project_root = config_path.parent().map(|p| p.to_path_buf());

        Ok(Config {
            project: project_config,
            base_dir: project_root.clone().unwrap_or_else(|| PathBuf::from(".")),
            project_root,
        })
    }

    /// Find project configuration by walking up directory tree
    fn find_project_config(
        &self,
        start_dir: &Path,
    ) -> ConfigResult<(Option<PathBuf>, ProjectConfig)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(CONFIG_FILE_NAME);

            if config_path.exists() {
                let project_config = ProjectConfig::load_from_file(&config_path)?;
                return Ok((Some(current), project_config));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, ProjectConfig::default())),
            }
        }
    }

    /// Apply environment variable overrides to project config
    ///
    /// Recognized: REGEN_JOBS, REGEN_SOURCE_DIR, REGEN_OUTPUT_DIR and
    /// REGEN_<TOOL> for every tool identity (e.g. REGEN_GBAGFX).
    fn apply_env_overrides(&self, mut config: ProjectConfig) -> ConfigResult<ProjectConfig> {
        if let Ok(jobs) = env::var("REGEN_JOBS") {
            let jobs: usize = jobs.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: "REGEN_JOBS".to_string(),
                reason: format!("'{}' is not a positive integer", jobs),
            })?;
            if jobs == 0 {
                return Err(ConfigError::InvalidEnv {
                    var: "REGEN_JOBS".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            config
                .build
                .get_or_insert_with(BuildSettings::default)
                .jobs = Some(jobs);
        }

        if let Ok(source) = env::var("REGEN_SOURCE_DIR") {
            config.paths.get_or_insert_with(PathsConfig::default).source =
                Some(PathBuf::from(source));
        }

        if let Ok(output) = env::var("REGEN_OUTPUT_DIR") {
            config.paths.get_or_insert_with(PathsConfig::default).output =
                Some(PathBuf::from(output));
        }

        for name in TOOL_NAMES {
            let var = format!("REGEN_{}", name.to_uppercase());
            if let Ok(path) = env::var(&var) {
                config.tools.set(name, PathBuf::from(path));
            }
        }

        Ok(config)
    }
}

impl Config {
    /// Configuration made only of defaults, anchored at `base_dir`
    pub fn with_defaults(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            project: ProjectConfig::default(),
            project_root: None,
            base_dir: base_dir.into(),
        }
    }

    /// Get the project root directory
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Check if this is a project (has regen.toml)
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }

    /// Effective source root
    pub fn source_root(&self) -> PathBuf {
        match self.project.paths.as_ref().and_then(|p| p.source.as_ref()) {
            Some(source) => self.base_dir.join(source),
            None => self.base_dir.clone(),
        }
    }

    /// Effective output root
    pub fn output_root(&self) -> PathBuf {
        match self.project.paths.as_ref().and_then(|p| p.output.as_ref()) {
            Some(output) => self.base_dir.join(output),
            None => self.base_dir.join(DEFAULT_OUTPUT_DIR),
        }
    }

    /// Effective worker pool width
    pub fn jobs(&self) -> usize {
        self.project
            .build
            .as_ref()
            .and_then(|b| b.jobs)
            .unwrap_or(DEFAULT_JOBS)
    }

    /// Extra ignored target names
    pub fn ignore(&self) -> &[String] {
        self.project
            .build
            .as_ref()
            .map(|b| b.ignore.as_slice())
            .unwrap_or(&[])
    }

    /// Extra description variables
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.project.env
    }

    /// Effective executable path for a tool identity
    ///
    /// Configured paths are relative to the project root; unconfigured tools
    /// default to `tools/<name>/<name>` under the source root.
    pub fn tool_path(&self, name: &str) -> PathBuf {
        match self.project.tools.get(name) {
            Some(path) => self.base_dir.join(path),
            None => self.source_root().join(ToolsConfig::default_path(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn create_config_file(dir: &Path, content: &str) -> PathBuf {
        let config_path = dir.join(CONFIG_FILE_NAME);
        fs::write(&config_path, content).unwrap();
        config_path
    }

    #[test]
    #[serial]
    fn test_load_project_config() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(
            temp_dir.path(),
            r#"
[build]
jobs = 3
"#,
        );

        let config = ConfigLoader::new()
            .load_from_directory(temp_dir.path())
            .unwrap();

        assert!(config.is_project());
        assert_eq!(config.jobs(), 3);
    }

    #[test]
    #[serial]
    fn test_find_config_in_parent() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(temp_dir.path(), "");

        let sub_dir = temp_dir.path().join("subdir");
        fs::create_dir(&sub_dir).unwrap();

        let config = ConfigLoader::new().load_from_directory(&sub_dir).unwrap();

        assert_eq!(config.project_root(), Some(temp_dir.path()));
        assert_eq!(config.source_root(), temp_dir.path());
    }

    #[test]
    #[serial]
    fn test_defaults_without_project() {
        let temp_dir = TempDir::new().unwrap();

        let config = ConfigLoader::new()
            .load_from_directory(temp_dir.path())
            .unwrap();

        assert!(!config.is_project());
        assert_eq!(config.jobs(), DEFAULT_JOBS);
        assert_eq!(
            config.output_root(),
            temp_dir.path().join(DEFAULT_OUTPUT_DIR)
        );
        assert_eq!(
            config.tool_path("gbagfx"),
            temp_dir.path().join("tools/gbagfx/gbagfx")
        );
    }

    #[test]
    #[serial]
    fn test_env_override_jobs() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(temp_dir.path(), "[build]\njobs = 2\n");

        env::set_var("REGEN_JOBS", "7");
        let config = ConfigLoader::new().load_from_directory(temp_dir.path());
        env::remove_var("REGEN_JOBS");

        assert_eq!(config.unwrap().jobs(), 7);
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_jobs() {
        let temp_dir = TempDir::new().unwrap();

        env::set_var("REGEN_JOBS", "many");
        let result = ConfigLoader::new().load_from_directory(temp_dir.path());
        env::remove_var("REGEN_JOBS");

        assert!(matches!(result, Err(ConfigError::InvalidEnv { .. })));
    }

    #[test]
    #[serial]
    fn test_env_override_tool_path() {
        let temp_dir = TempDir::new().unwrap();

        env::set_var("REGEN_RSFONT", "/opt/rsfont");
        let config = ConfigLoader::new().load_from_directory(temp_dir.path());
        env::remove_var("REGEN_RSFONT");

        assert_eq!(
            config.unwrap().tool_path("rsfont"),
            PathBuf::from("/opt/rsfont")
        );
    }
}
