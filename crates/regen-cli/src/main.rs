use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

/// Rebuild the binary assets of a cartridge project from their sources.
///
/// regen reads the project's Makefile, layers its targets by dependency and
/// runs every layer in parallel, writing all outputs under a separate output
/// root so the source tree is never modified.
///
/// EXAMPLES:
///     regen build Makefile                       Rebuild all assets
///     regen build Makefile --includes incbins    Also produce direct includes
///     regen layers Makefile                      Show the build order
///
/// ENVIRONMENT VARIABLES:
///     RUST_LOG          Log filter (default: info)
///     REGEN_JOBS        Worker pool width
///     REGEN_SOURCE_DIR  Source root
///     REGEN_OUTPUT_DIR  Output root
///     REGEN_JSON        Set to '1' for JSON output by default
#[derive(Parser)]
#[command(name = "regen")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output (debug logs)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
    /// Quiet output (warnings and errors only)
    #[arg(long, short = 'q', global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the assets described by a Makefile
    ///
    /// Every target is produced under the output root. Inputs are looked up
    /// in the source root first, then in the output root. The build stops
    /// after the first layer in which a command fails.
    ///
    /// EXAMPLES:
    ///     regen build Makefile -j 8
    ///     regen build Makefile --output-dir /tmp/assets --json
    #[command(visible_alias = "b")]
    Build {
        /// Path to the build description
        makefile: PathBuf,
        /// File listing directly included artifacts, one per line
        #[arg(long, short = 'i')]
        includes: Option<PathBuf>,
        #[command(flatten)]
        project: ProjectArgs,
        /// JSON output
        #[arg(long, env = "REGEN_JSON")]
        json: bool,
    },

    /// Print the dependency layers of a Makefile
    ///
    /// One line per layer; every target only depends on targets of earlier
    /// lines.
    #[command(visible_alias = "l")]
    Layers {
        /// Path to the build description
        makefile: PathBuf,
        #[command(flatten)]
        project: ProjectArgs,
        /// JSON output
        #[arg(long, env = "REGEN_JSON")]
        json: bool,
    },

    /// Generate shell completions
    ///
    /// EXAMPLES:
    ///     regen completions bash > ~/.local/share/bash-completion/completions/regen
    ///     regen completions zsh > ~/.zfunc/_regen
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(clap::Args, Debug, Default)]
struct ProjectArgs {
    /// Project configuration file (default: regen.toml, searched upwards)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
    /// Source root (read-only)
    #[arg(long)]
    source_dir: Option<PathBuf>,
    /// Output root
    #[arg(long, short = 'o')]
    output_dir: Option<PathBuf>,
    /// Number of parallel jobs
    #[arg(long, short = 'j')]
    jobs: Option<usize>,
}

impl From<ProjectArgs> for config::ProjectOverrides {
    fn from(args: ProjectArgs) -> Self {
        Self {
            config: args.config,
            source_dir: args.source_dir,
            output_dir: args.output_dir,
            jobs: args.jobs,
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Build {
            makefile,
            includes,
            project,
            json,
        } => {
            let args = commands::build::BuildArgs {
                makefile,
                includes,
                overrides: project.into(),
                quiet: cli.quiet,
                json,
            };
            commands::build::run(args)?;
        }
        Commands::Layers {
            makefile,
            project,
            json,
        } => {
            let args = commands::layers::LayersArgs {
                makefile,
                overrides: project.into(),
                json,
            };
            commands::layers::run(args)?;
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_structure_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_build_flags() {
        let cli = Cli::parse_from([
            "regen",
            "build",
            "Makefile",
            "-j",
            "4",
            "--includes",
            "incbins.txt",
            "--output-dir",
            "out",
        ]);
        match cli.command {
            Commands::Build {
                makefile,
                includes,
                project,
                json,
            } => {
                assert_eq!(makefile, PathBuf::from("Makefile"));
                assert_eq!(includes, Some(PathBuf::from("incbins.txt")));
                assert_eq!(project.jobs, Some(4));
                assert_eq!(project.output_dir, Some(PathBuf::from("out")));
                assert!(!json);
            }
            _ => panic!("Expected Build command"),
        }
    }

    #[test]
    fn test_global_verbosity_after_subcommand() {
        let cli = Cli::parse_from(["regen", "layers", "Makefile", "-v"]);
        assert!(cli.verbose);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        let result = Cli::try_parse_from(["regen", "-v", "-q", "layers", "Makefile"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_alias_b_for_build() {
        let cli = Cli::parse_from(["regen", "b", "Makefile"]);
        assert!(matches!(cli.command, Commands::Build { .. }));
    }

    #[test]
    fn test_completions_zsh() {
        let cli = Cli::parse_from(["regen", "completions", "zsh"]);
        match cli.command {
            Commands::Completions { shell } => assert_eq!(shell, Shell::Zsh),
            _ => panic!("Expected Completions command"),
        }
    }
}
