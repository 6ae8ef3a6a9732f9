//! regen build engine
//!
//! Rebuilds the binary assets of a cartridge project from their sources:
//! - Build description reading (Makefile subset) into a target graph
//! - Level-wise layering of the graph
//! - Wave scheduling of each layer on a bounded worker pool
//! - Dispatch of recipe commands to built-in handlers and external tools
//! - Two-root path resolution: read-only sources, writable outputs
//! - Recursive derivation of graphics inputs and direct-include materialization

pub mod asset;
pub mod builder;
pub mod command;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod exec;
pub mod graph;
pub mod include;
pub mod makefile;
pub mod resolve;
pub mod scheduler;
pub mod stale;

// Re-export main types
pub use asset::{AssetKind, AudioRules, IgnoreList};
pub use builder::{BuildConfig, BuildReport, BuildStats, Builder};
pub use command::{Command, CommandKind, ToolKind};
pub use dispatch::{Dispatcher, Outcome, ResolveChain};
pub use env::{Environment, MAKE_VAR};
pub use error::{BuildError, BuildResult};
pub use exec::{ProcessRunner, ToolOutput, Toolchain};
pub use graph::{Rule, Target, TargetGraph, TargetGraphProvider};
pub use include::{read_include_list, IncludeMaterializer, IncludeStats};
pub use makefile::MakefileProvider;
pub use resolve::{PathResolver, Resolved};
pub use scheduler::{FixedTargets, WaveScheduler, WaveStats};
pub use stale::is_stale;
