//! Build command - rebuild assets from a build description

use crate::config::{self, ProjectOverrides};
use anyhow::{Context, Result};
use regen_build::{BuildReport, Builder};
use std::path::PathBuf;

/// Build command arguments
#[derive(Debug, Default)]
pub struct BuildArgs {
    /// Build description (Makefile)
    pub makefile: PathBuf,
    /// Direct-include list to materialize after the waves
    pub includes: Option<PathBuf>,
    pub overrides: ProjectOverrides,
    /// Quiet output (errors only)
    pub quiet: bool,
    /// JSON output
    pub json: bool,
}

/// Run the build command
pub fn run(args: BuildArgs) -> Result<()> {
    let build_config = config::build_config(&args.overrides)?;
    let makefile = config::absolute(&args.makefile)?;
    let includes = args
        .includes
        .as_deref()
        .map(config::absolute)
        .transpose()?;

    let builder = Builder::new(build_config);
    let report = builder
        .build(&makefile, includes.as_deref())
        .context("Build failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !args.quiet {
        print_summary(&report);
    }

    Ok(())
}

fn print_summary(report: &BuildReport) {
    let stats = &report.stats;
    let waves = &stats.waves;
    let includes = &stats.includes;

    println!("\n{}", "=".repeat(60));
    println!("Build succeeded in {:.2}s", stats.total_time.as_secs_f64());
    println!("{}", "=".repeat(60));
    println!("  Layers: {} ({} targets)", waves.layers, waves.targets);
    println!(
        "  Built: {}, up to date: {}, from source: {}",
        waves.built, waves.up_to_date, waves.fixed_from_source
    );
    println!(
        "  Delegated: {}, ignored: {}, skipped: {}",
        waves.delegated, waves.ignored, waves.skipped
    );
    println!(
        "  Includes: {} copied, {} built, {} up to date, {} missing",
        includes.copied,
        includes.built,
        includes.up_to_date,
        includes.missing_binaries + includes.unresolved
    );
    println!("{}", "=".repeat(60));
}
