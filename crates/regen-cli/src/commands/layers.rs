//! Layers command - print the build order of a description

use crate::config::{self, ProjectOverrides};
use anyhow::{Context, Result};
use regen_build::Builder;
use std::path::PathBuf;

/// Layers command arguments
#[derive(Debug, Default)]
pub struct LayersArgs {
    pub makefile: PathBuf,
    pub overrides: ProjectOverrides,
    /// JSON output
    pub json: bool,
}

/// Print one line per layer, names separated by spaces
pub fn run(args: LayersArgs) -> Result<()> {
    let build_config = config::build_config(&args.overrides)?;
    let makefile = config::absolute(&args.makefile)?;

    let builder = Builder::new(build_config);
    let (_, layers) = builder
        .load_graph(&makefile)
        .with_context(|| format!("Failed to read {}", makefile.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&layers)?);
    } else {
        for layer in &layers {
            println!("{}", layer.join(" "));
        }
    }

    Ok(())
}
