//! Project Configuration (regen.toml)
//!
//! Handles project-level configuration stored in `regen.toml` at the project root.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Identities of the conversion tools a project can configure, in table order
pub const TOOL_NAMES: [&str; 6] = ["gbagfx", "rsfont", "jsonproc", "mapjson", "aif2pcm", "mid2agb"];

/// Project configuration from regen.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Source and output roots
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paths: Option<PathsConfig>,

    /// Conversion tool executables
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Scheduling settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSettings>,

    /// Extra variables injected into the build description
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Root directories
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Read-only source root (default: project root)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,

    /// Writable output root (default: "build/regen")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

/// Paths to the external conversion tools
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gbagfx: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsfont: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonproc: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapjson: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aif2pcm: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid2agb: Option<PathBuf>,
}

impl ToolsConfig {
    /// Get the configured path for a tool by identity
    pub fn get(&self, name: &str) -> Option<&Path> {
        let slot = match name {
            "gbagfx" => &self.gbagfx,
            "rsfont" => &self.rsfont,
            "jsonproc" => &self.jsonproc,
            "mapjson" => &self.mapjson,
            "aif2pcm" => &self.aif2pcm,
            "mid2agb" => &self.mid2agb,
            _ => return None,
        };
        slot.as_deref()
    }

    /// Set the path for a tool by identity. Returns false for unknown tools.
    pub fn set(&mut self, name: &str, path: PathBuf) -> bool {
        let slot = match name {
            "gbagfx" => &mut self.gbagfx,
            "rsfont" => &mut self.rsfont,
            "jsonproc" => &mut self.jsonproc,
            "mapjson" => &mut self.mapjson,
            "aif2pcm" => &mut self.aif2pcm,
            "mid2agb" => &mut self.mid2agb,
            _ => return false,
        };
        *slot = Some(path);
        true
    }

    /// Default location of a tool inside the source tree
    pub fn default_path(name: &str) -> PathBuf {
        PathBuf::from("tools").join(name).join(name)
    }
}

/// Scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct BuildSettings {
    /// Worker pool width (default: 16)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<usize>,

    /// Extra target names that carry no artifact semantics
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,
}

impl ProjectConfig {
    /// Load project configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the project configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(build) = &self.build {
            if build.jobs == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: "build.jobs".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            if build.ignore.iter().any(|name| name.trim().is_empty()) {
                return Err(ConfigError::InvalidValue {
                    field: "build.ignore".to_string(),
                    reason: "target names cannot be empty".to_string(),
                });
            }
        }

        for name in TOOL_NAMES {
            if let Some(path) = self.tools.get(name) {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: format!("tools.{}", name),
                        reason: "path cannot be empty".to_string(),
                    });
                }
            }
        }

        for key in self.env.keys() {
            validate_env_key(key)?;
        }

        Ok(())
    }
}

fn validate_env_key(key: &str) -> ConfigResult<()> {
    if key.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "env".to_string(),
            reason: "variable name cannot be empty".to_string(),
        });
    }
    if key.contains('=') || key.chars().any(char::is_whitespace) {
        return Err(ConfigError::InvalidValue {
            field: format!("env.{}", key),
            reason: "variable name cannot contain '=' or whitespace".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_project_config() {
        let config: ProjectConfig = toml::from_str("").unwrap();
        assert!(config.paths.is_none());
        assert!(config.tools.gbagfx.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_project_config() {
        let toml = r#"
[paths]
source = "."
output = "build/assets"

[tools]
gbagfx = "tools/gbagfx/gbagfx"
mid2agb = "/usr/local/bin/mid2agb"

[build]
jobs = 8
ignore = ["all", "compare"]

[env]
DATA_SRC_SUBDIR = "src/data"
"#;

        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.paths.as_ref().unwrap().output,
            Some(PathBuf::from("build/assets"))
        );
        assert_eq!(
            config.tools.get("mid2agb"),
            Some(Path::new("/usr/local/bin/mid2agb"))
        );
        assert_eq!(config.build.as_ref().unwrap().jobs, Some(8));
        assert_eq!(
            config.env.get("DATA_SRC_SUBDIR").map(String::as_str),
            Some("src/data")
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let toml = r#"
[tools]
gbagfx = "a"
pngcrush = "b"
"#;
        assert!(toml::from_str::<ProjectConfig>(toml).is_err());
    }

    #[test]
    fn test_zero_jobs_rejected() {
        let config = ProjectConfig {
            build: Some(BuildSettings {
                jobs: Some(0),
                ignore: Vec::new(),
            }),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "build.jobs"
        ));
    }

    #[test]
    fn test_bad_env_key_rejected() {
        let mut config = ProjectConfig::default();
        config.env.insert("A=B".to_string(), "x".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tools_get_set() {
        let mut tools = ToolsConfig::default();
        assert!(tools.set("rsfont", PathBuf::from("bin/rsfont")));
        assert!(!tools.set("pngcrush", PathBuf::from("bin/pngcrush")));
        assert_eq!(tools.get("rsfont"), Some(Path::new("bin/rsfont")));
        assert_eq!(tools.get("pngcrush"), None);
    }

    #[test]
    fn test_default_tool_path() {
        assert_eq!(
            ToolsConfig::default_path("gbagfx"),
            PathBuf::from("tools/gbagfx/gbagfx")
        );
    }
}
