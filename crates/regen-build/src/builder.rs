//! Build orchestration: graph, waves, then direct includes
use crate::asset::{AudioRules, IgnoreList};
use crate::command::ToolKind;
use crate::dispatch::Dispatcher;
use crate::env::{Environment, MAKE_VAR};
use crate::error::{BuildError, BuildResult};
use crate::exec::{ProcessRunner, Toolchain};
use crate::graph::{TargetGraph, TargetGraphProvider};
use crate::include::{read_include_list, IncludeMaterializer, IncludeStats};
use crate::makefile::MakefileProvider;
use crate::resolve::PathResolver;
use crate::scheduler::{FixedTargets, WaveScheduler, WaveStats};
use rayon::ThreadPoolBuilder;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Immutable configuration record for one run
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Read-only root holding original sources
    pub source_root: PathBuf,
    /// Writable root receiving every produced artifact
    pub output_root: PathBuf,
    /// Executables of the conversion tools
    pub toolchain: Toolchain,
    /// Worker pool width
    pub jobs: usize,
    /// Extra target names to ignore
    pub ignore: Vec<String>,
    /// Extra variables for the description and the tools
    pub env: BTreeMap<String, String>,
}

impl BuildConfig {
    /// Configuration with default jobs and tools looked up on `PATH`
    pub fn new(source_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            output_root: output_root.into(),
            toolchain: Toolchain::new(),
            jobs: regen_config::loader::DEFAULT_JOBS,
            ignore: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Build the record from loaded project configuration
    pub fn from_config(config: &regen_config::Config) -> Self {
        let toolchain = ToolKind::ALL.into_iter().fold(Toolchain::new(), |toolchain, tool| {
            toolchain.with_tool(tool, config.tool_path(tool.identity()))
        });
        Self {
            source_root: config.source_root(),
            output_root: config.output_root(),
            toolchain,
            jobs: config.jobs(),
            ignore: config.ignore().to_vec(),
            env: config.env().clone(),
        }
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_toolchain(mut self, toolchain: Toolchain) -> Self {
        self.toolchain = toolchain;
        self
    }

    pub fn with_ignore(mut self, ignore: Vec<String>) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn with_env_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Build statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildStats {
    /// Wave scheduler counters
    pub waves: WaveStats,
    /// Direct-include counters
    pub includes: IncludeStats,
    /// Time spent reading the description
    #[serde(serialize_with = "as_secs")]
    pub parse_time: Duration,
    #[serde(serialize_with = "as_secs")]
    pub wave_time: Duration,
    #[serde(serialize_with = "as_secs")]
    pub include_time: Duration,
    #[serde(serialize_with = "as_secs")]
    pub total_time: Duration,
}

/// Result of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub stats: BuildStats,
    /// Names produced or found as sources by the waves, sorted
    pub fixed: Vec<String>,
}

/// Main builder for orchestrating a run
pub struct Builder<P = MakefileProvider> {
    config: BuildConfig,
    provider: P,
}

impl Builder<MakefileProvider> {
    /// Create a builder reading Makefiles relative to the source root
    pub fn new(config: BuildConfig) -> Self {
        let provider = MakefileProvider::new(config.source_root.clone());
        Self { config, provider }
    }
}

impl<P: TargetGraphProvider> Builder<P> {
    /// Replace the target graph provider
    pub fn with_provider<Q: TargetGraphProvider>(self, provider: Q) -> Builder<Q> {
        Builder {
            config: self.config,
            provider,
        }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Environment snapshot for the description and the tools
    ///
    /// Process variables, overlaid with configured ones, with `MAKE` bound to
    /// itself so recursive make invocations stay recognizable.
    pub fn environment(&self) -> Environment {
        let configured = &self.config.env;
        Environment::from_process()
            .with_vars(configured.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .with_var(MAKE_VAR, MAKE_VAR)
    }

    /// Load and validate the target graph and compute its layering
    pub fn load_graph(&self, description: &Path) -> BuildResult<(TargetGraph, Vec<Vec<String>>)> {
        self.load_graph_with(description, &self.environment())
    }

    fn load_graph_with(
        &self,
        description: &Path,
        env: &Environment,
    ) -> BuildResult<(TargetGraph, Vec<Vec<String>>)> {
        let graph = self.provider.load(description, env)?;
        graph.validate()?;
        let layers = graph.layers()?;
        Ok((graph, layers))
    }

    /// Execute the build
    ///
    /// Runs the layers of `description` in waves, then materializes the names
    /// listed in the `includes` file, if any. Stops at the first failing layer.
    pub fn build(&self, description: &Path, includes: Option<&Path>) -> BuildResult<BuildReport> {
        let build_start = Instant::now();
        if self.config.jobs == 0 {
            return Err(BuildError::InvalidConfig(
                "jobs must be at least 1".to_string(),
            ));
        }

        let env = Arc::new(self.environment());
        debug!("Environment snapshot holds {} variables", env.len());
        let (graph, layers) = self.load_graph_with(description, &env)?;
        let parse_time = build_start.elapsed();
        info!(
            "Parsed {} targets in {} layers ({:.2}s)",
            graph.len(),
            layers.len(),
            parse_time.as_secs_f64()
        );

        let source_root = absolute(&self.config.source_root)?;
        let output_root = absolute(&self.config.output_root)?;
        fs::create_dir_all(&output_root).map_err(|e| BuildError::io(&output_root, e))?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.jobs)
            .thread_name(|index| format!("regen-worker-{}", index))
            .build()
            .map_err(|e| BuildError::InvalidConfig(format!("worker pool: {}", e)))?;
        let ignore = IgnoreList::new(&self.config.ignore)?;
        let dispatcher = Dispatcher::new(
            PathResolver::new(source_root, output_root),
            self.config.toolchain.clone(),
            ProcessRunner::new(env),
        );

        let fixed = FixedTargets::new();
        let wave_start = Instant::now();
        let waves = WaveScheduler::new(&dispatcher, &pool, &ignore).run(&graph, &layers, &fixed)?;
        let wave_time = wave_start.elapsed();

        let include_start = Instant::now();
        let includes = match includes {
            Some(path) => {
                let names = read_include_list(path)?;
                let audio = AudioRules::standard()?;
                IncludeMaterializer::new(&dispatcher, &pool, &audio).run(&names, &fixed)?
            }
            None => IncludeStats::default(),
        };
        let include_time = include_start.elapsed();

        let total_time = build_start.elapsed();
        info!("Build completed in {:.2}s", total_time.as_secs_f64());

        Ok(BuildReport {
            stats: BuildStats {
                waves,
                includes,
                parse_time,
                wave_time,
                include_time,
                total_time,
            },
            fixed: fixed.snapshot(),
        })
    }
}

fn absolute(path: &Path) -> BuildResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Target;

    #[test]
    fn test_build_config_defaults() {
        let config = BuildConfig::new("src", "out");
        assert_eq!(config.jobs, 16);
        assert!(config.ignore.is_empty());
        assert_eq!(
            config.toolchain.executable(ToolKind::MidiConvert),
            PathBuf::from("mid2agb")
        );
    }

    #[test]
    fn test_build_config_from_config() {
        let config = regen_config::Config::with_defaults("/project");
        let build = BuildConfig::from_config(&config);
        assert_eq!(build.source_root, PathBuf::from("/project"));
        assert_eq!(build.output_root, PathBuf::from("/project/build/regen"));
        assert_eq!(
            build.toolchain.executable(ToolKind::GraphicsConvert),
            PathBuf::from("/project/tools/gbagfx/gbagfx")
        );
    }

    #[test]
    fn test_environment_binds_make() {
        let builder = Builder::new(
            BuildConfig::new(".", "out").with_env_var("DATA_SRC_SUBDIR", "src/data"),
        );
        let env = builder.environment();
        assert_eq!(env.get(MAKE_VAR), Some("MAKE"));
        assert_eq!(env.get("DATA_SRC_SUBDIR"), Some("src/data"));
    }

    #[test]
    fn test_zero_jobs_is_rejected() {
        let builder = Builder::new(BuildConfig::new(".", "out").with_jobs(0))
            .with_provider(|_: &Path, _: &Environment| Ok(TargetGraph::new()));
        let result = builder.build(Path::new("Makefile"), None);
        assert!(matches!(result, Err(BuildError::InvalidConfig(_))));
    }

    #[test]
    fn test_custom_provider_graph_is_validated() {
        let builder = Builder::new(BuildConfig::new(".", "out")).with_provider(
            |_: &Path, _: &Environment| {
                let mut graph = TargetGraph::new();
                graph.add_target(Target::new("a").with_dependencies(["ghost"]));
                Ok(graph)
            },
        );
        let result = builder.load_graph(Path::new("Makefile"));
        assert!(matches!(result, Err(BuildError::UnknownTarget { .. })));
    }
}
