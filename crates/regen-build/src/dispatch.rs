//! Command dispatch and recursive source materialization
//!
//! A [`Dispatcher`] turns one target's command line into work: it rewrites the
//! tool's arguments into absolute resolved paths, consults the staleness check
//! and, if the output is out of date, runs the configured tool. Inputs that do
//! not exist yet but can be derived by the graphics converter are produced
//! first, recursively, through [`Dispatcher::materialize`].

use crate::asset::{is_derivable, AssetKind};
use crate::command::{Command, CommandKind, ToolKind};
use crate::error::{BuildError, BuildResult};
use crate::exec::{ProcessRunner, Toolchain};
use crate::graph::Target;
use crate::resolve::PathResolver;
use crate::stale::is_stale;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Target-scoped variable holding extra graphics converter options
pub const GFX_OPTS_VAR: &str = "GFX_OPTS";

/// What a single dispatch did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// The output was (re)built
    Built,
    /// The output was already newer than its inputs
    UpToDate,
    /// A recursive make invocation was left to the caller
    Delegated,
    /// The target has a dependency-only rule
    NoCommand,
}

/// The names currently being resolved on one materialization path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveChain {
    names: Vec<String>,
}

impl ResolveChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the chain with `name`, failing if it is already being resolved
    pub fn enter(&self, name: &str) -> BuildResult<Self> {
        if self.contains(name) {
            let mut cycle = self.names.clone();
            cycle.push(name.to_string());
            return Err(BuildError::CyclicDependency(cycle.join(" -> ")));
        }
        let mut names = self.names.clone();
        names.push(name.to_string());
        Ok(Self { names })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

/// One lock per output name
///
/// Sibling tasks may need the same missing intermediate; the lock makes the
/// second one wait and then observe the output as up to date.
#[derive(Debug, Default)]
pub struct OutputLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl OutputLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding writes to `name`
    pub fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(name.to_string()).or_default().clone()
    }
}

/// Routes commands to their handlers
#[derive(Debug)]
pub struct Dispatcher {
    resolver: PathResolver,
    toolchain: Toolchain,
    runner: ProcessRunner,
    locks: OutputLocks,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(resolver: PathResolver, toolchain: Toolchain, runner: ProcessRunner) -> Self {
        Self {
            resolver,
            toolchain,
            runner,
            locks: OutputLocks::new(),
        }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Dispatch the single command of `target`, from the source root
    pub fn dispatch_target(&self, target: &Target) -> BuildResult<Outcome> {
        let Some(line) = target.command_line()? else {
            debug!("{}: dependency-only rule", target.name);
            return Ok(Outcome::NoCommand);
        };
        let command = Command::parse(&target.name, line)?;
        let chain = ResolveChain::new().enter(&target.name)?;
        self.dispatch(
            &target.name,
            command.argv,
            self.resolver.source_root(),
            &chain,
        )
    }

    /// Dispatch an argument vector on behalf of `target`, in `cwd`
    pub fn dispatch(
        &self,
        target: &str,
        argv: Vec<String>,
        cwd: &Path,
        chain: &ResolveChain,
    ) -> BuildResult<Outcome> {
        let command = Command::from_argv(target, argv)?;
        let args = command.args();

        match command.kind {
            CommandKind::Concat => self.concat(target, args, chain),
            CommandKind::Tool(tool) => match tool {
                ToolKind::GraphicsConvert | ToolKind::FontRasterize => {
                    self.convert(target, tool, args, cwd, chain)
                }
                ToolKind::JsonProcess => self.json_process(target, args, cwd, chain),
                ToolKind::MapJsonProcess => self.map_json(target, args, cwd, chain),
                ToolKind::AudioConvert => self.audio_convert(target, args, cwd, chain),
                ToolKind::MidiConvert => self.midi_convert(target, args, cwd),
            },
            CommandKind::ChangeDir => self.change_dir(target, args, cwd, chain),
            CommandKind::Delegate => {
                info!("Skipping make target {}", target);
                Ok(Outcome::Delegated)
            }
        }
    }

    /// Resolve an input `target` cannot be built without, deriving it first if needed
    pub fn require_input(
        &self,
        target: &str,
        name: &str,
        chain: &ResolveChain,
    ) -> BuildResult<PathBuf> {
        if let Some(path) = self.resolve_settled(name) {
            return Ok(path);
        }
        if !is_derivable(name) {
            return Err(BuildError::missing_source(target, name));
        }
        self.materialize(name, &BTreeMap::new(), chain)?;
        self.resolver.require(target, name)
    }

    /// Produce a derivable asset with the graphics converter, without a rule
    ///
    /// The source is the first candidate for the asset kind that resolves at
    /// either root. When none does, the first derivable candidate is built
    /// recursively with empty variables. `GFX_OPTS` from `variables` is split
    /// on whitespace and appended to the converter arguments.
    pub fn materialize(
        &self,
        name: &str,
        variables: &BTreeMap<String, String>,
        chain: &ResolveChain,
    ) -> BuildResult<Outcome> {
        let chain = chain.enter(name)?;
        let (base, kind) = AssetKind::of(name)
            .ok_or_else(|| BuildError::malformed(name, "not a derivable asset"))?;
        let candidates = kind.source_candidates(base);
        let source = self.select_source(name, &candidates, &chain)?;

        let options: Vec<&str> = variables
            .get(GFX_OPTS_VAR)
            .map(|opts| opts.split_whitespace().collect())
            .unwrap_or_default();

        let tool = ToolKind::GraphicsConvert;
        let cwd = self.resolver.source_root();
        self.produce(name, std::slice::from_ref(&source), |dst| {
            let mut args = vec![source.clone().into_os_string(), dst.into()];
            args.extend(options.iter().map(OsString::from));
            self.run_tool(tool, args, cwd)
        })
    }

    fn select_source(
        &self,
        name: &str,
        candidates: &[String],
        chain: &ResolveChain,
    ) -> BuildResult<PathBuf> {
        for candidate in candidates {
            if let Some(path) = self.resolve_settled(candidate) {
                return Ok(path);
            }
        }

        let derivable = candidates.iter().find(|candidate| is_derivable(candidate));
        match derivable {
            Some(candidate) => {
                debug!("{}: deriving missing source {}", name, candidate);
                self.materialize(candidate, &BTreeMap::new(), chain)?;
                self.resolver.require(name, candidate)
            }
            None => Err(BuildError::missing_source(
                name,
                candidates.first().map(String::as_str).unwrap_or(name),
            )),
        }
    }

    /// Produce a sound blob from the `.aif` sample next to it
    pub fn build_audio(&self, name: &str, source: &Path, compress: bool) -> BuildResult<Outcome> {
        let cwd = self.resolver.source_root();
        self.produce(name, &[source.to_path_buf()], |dst| {
            let mut args = vec![source.as_os_str().to_owned(), dst.into()];
            if compress {
                args.push("--compress".into());
            }
            self.run_tool(ToolKind::AudioConvert, args, cwd)
        })
    }

    /// Copy a source-root file verbatim into the output root
    pub fn copy_source(&self, name: &str) -> BuildResult<Outcome> {
        let source = self.resolver.source_root().join(name);
        self.produce(name, &[source.clone()], |dst| {
            fs::copy(&source, dst).map_err(|e| BuildError::io(&source, e))?;
            Ok(())
        })
    }

    /// Resolve `name` once no producer holds its output lock
    fn resolve_settled(&self, name: &str) -> Option<PathBuf> {
        let lock = self.locks.lock_for(name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.resolver.resolve(name).into_path()
    }

    /// Stale-check `output` against `inputs` and run `build` under its lock
    fn produce<F>(&self, output: &str, inputs: &[PathBuf], build: F) -> BuildResult<Outcome>
    where
        F: FnOnce(&Path) -> BuildResult<()>,
    {
        let lock = self.locks.lock_for(output);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let dst = self.resolver.output_path(output)?;
        if !is_stale(&dst, inputs) {
            debug!("{} is up to date", output);
            return Ok(Outcome::UpToDate);
        }

        build(&dst)?;
        info!("Built {}", output);
        Ok(Outcome::Built)
    }

    fn run_tool(&self, tool: ToolKind, args: Vec<OsString>, cwd: &Path) -> BuildResult<()> {
        let program = self.toolchain.executable(tool);
        let output = self.runner.run(tool.identity(), &program, args, cwd)?;
        if !output.stdout.is_empty() {
            info!(tool = %output.tool, "{}", output.stdout);
        }
        debug!(
            tool = %output.tool,
            "finished in {:.3}s",
            output.duration.as_secs_f64()
        );
        Ok(())
    }

    /// `cat a b … > out`
    fn concat(&self, target: &str, args: &[String], chain: &ResolveChain) -> BuildResult<Outcome> {
        let (names, output) = parse_redirect(target, args)?;
        let sources = names
            .iter()
            .map(|name| self.require_input(target, name, chain))
            .collect::<BuildResult<Vec<_>>>()?;

        self.produce(output, &sources, |dst| {
            let mut out = File::create(dst).map_err(|e| BuildError::io(dst, e))?;
            for source in &sources {
                let mut input = File::open(source).map_err(|e| BuildError::io(source, e))?;
                io::copy(&mut input, &mut out).map_err(|e| BuildError::io(source, e))?;
            }
            out.flush().map_err(|e| BuildError::io(dst, e))
        })
    }

    /// `<tool> <src> <dst> [opts…]`
    fn convert(
        &self,
        target: &str,
        tool: ToolKind,
        args: &[String],
        cwd: &Path,
        chain: &ResolveChain,
    ) -> BuildResult<Outcome> {
        let [src, dst, options @ ..] = args else {
            return Err(arity(target, tool, "<src> <dst> [options...]"));
        };
        let source = self.require_input(target, src, chain)?;

        self.produce(dst, std::slice::from_ref(&source), |out| {
            let mut argv = vec![source.clone().into_os_string(), out.into()];
            argv.extend(options.iter().map(OsString::from));
            self.run_tool(tool, argv, cwd)
        })
    }

    /// `<tool> <a> <b> <dst>`
    fn json_process(
        &self,
        target: &str,
        args: &[String],
        cwd: &Path,
        chain: &ResolveChain,
    ) -> BuildResult<Outcome> {
        let tool = ToolKind::JsonProcess;
        let [first, second, dst, rest @ ..] = args else {
            return Err(arity(target, tool, "<json> <template> <dst>"));
        };
        let inputs = vec![
            self.require_input(target, first, chain)?,
            self.require_input(target, second, chain)?,
        ];

        self.produce(dst, &inputs, |out| {
            let mut argv: Vec<OsString> =
                inputs.iter().map(|p| p.clone().into_os_string()).collect();
            argv.push(out.into());
            argv.extend(rest.iter().map(OsString::from));
            self.run_tool(tool, argv, cwd)
        })
    }

    /// `<tool> <mode> <game> <src> …`, always run
    fn map_json(
        &self,
        target: &str,
        args: &[String],
        cwd: &Path,
        chain: &ResolveChain,
    ) -> BuildResult<Outcome> {
        let tool = ToolKind::MapJsonProcess;
        let [mode, game, src, rest @ ..] = args else {
            return Err(arity(target, tool, "<mode> <game> <src> ..."));
        };
        let source = self.require_input(target, src, chain)?;

        let mut argv = vec![OsString::from(mode), OsString::from(game), source.into()];
        argv.extend(rest.iter().map(OsString::from));
        self.run_tool(tool, argv, cwd)?;
        info!("Built {}", target);
        Ok(Outcome::Built)
    }

    /// `<tool> <src> <dst> [--compress]`
    fn audio_convert(
        &self,
        target: &str,
        args: &[String],
        cwd: &Path,
        chain: &ResolveChain,
    ) -> BuildResult<Outcome> {
        let tool = ToolKind::AudioConvert;
        let [src, dst, flags @ ..] = args else {
            return Err(arity(target, tool, "<src> <dst> [--compress]"));
        };
        let source = self.require_input(target, src, chain)?;

        self.produce(dst, std::slice::from_ref(&source), |out| {
            let mut argv = vec![source.clone().into_os_string(), out.into()];
            argv.extend(flags.iter().map(OsString::from));
            self.run_tool(tool, argv, cwd)
        })
    }

    /// `<tool> <src> [opts…]`, with `src` relative to the working directory
    ///
    /// The converter picks its own output location, so the target is checked
    /// for freshness at the output root but never locked or created here.
    fn midi_convert(&self, target: &str, args: &[String], cwd: &Path) -> BuildResult<Outcome> {
        let tool = ToolKind::MidiConvert;
        let [src, ..] = args else {
            return Err(arity(target, tool, "<src> [options...]"));
        };

        let source = cwd.join(src);
        if !source.exists() {
            if self.resolver.resolve(target).is_found() {
                debug!("{}: {} absent, output already present", target, src);
                return Ok(Outcome::UpToDate);
            }
            return Err(BuildError::missing_source(target, src));
        }

        let output = self.resolver.output_location(target);
        if !is_stale(&output, &[source]) {
            debug!("{} is up to date", target);
            return Ok(Outcome::UpToDate);
        }

        self.run_tool(tool, args.iter().map(OsString::from).collect(), cwd)?;
        info!("Built {}", target);
        Ok(Outcome::Built)
    }

    /// `cd <dir> && <command…>`
    fn change_dir(
        &self,
        target: &str,
        args: &[String],
        cwd: &Path,
        chain: &ResolveChain,
    ) -> BuildResult<Outcome> {
        let [dir, rest @ ..] = args else {
            return Err(BuildError::malformed(
                target,
                "expected cd <dir> && <command>",
            ));
        };

        let new_cwd = cwd.join(dir);
        if !new_cwd.is_dir() {
            return Err(BuildError::missing_source(target, dir));
        }

        match rest {
            [and, command @ ..] if and == "&&" && !command.is_empty() => {
                self.dispatch(target, command.to_vec(), &new_cwd, chain)
            }
            _ => Err(BuildError::malformed(
                target,
                "expected '&&' and a command after cd <dir>",
            )),
        }
    }
}

fn arity(target: &str, tool: ToolKind, usage: &str) -> BuildError {
    BuildError::malformed(target, format!("expected {} {}", tool, usage))
}

const REDIRECT_USAGE: &str = "expected cat <file>+ > <dest>";

/// Split `cat` arguments into source names and the redirect output name
///
/// Accepts `a b > out` and `a b >out`.
fn parse_redirect<'a>(target: &str, args: &'a [String]) -> BuildResult<(&'a [String], &'a str)> {
    let (sources, output) = match args {
        [sources @ .., redirect, output] if redirect == ">" => (sources, output.as_str()),
        [sources @ .., last] if last.len() > 1 && last.starts_with('>') => {
            (sources, last[1..].trim())
        }
        _ => return Err(BuildError::malformed(target, REDIRECT_USAGE)),
    };

    if output.is_empty() || output.starts_with('>') {
        return Err(BuildError::malformed(target, REDIRECT_USAGE));
    }
    if sources.is_empty() {
        return Err(BuildError::malformed(target, "cat without input files"));
    }
    Ok((sources, output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Environment;
    use tempfile::TempDir;

    fn dispatcher() -> (TempDir, Dispatcher) {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        let output = dir.path().join("out");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&output).unwrap();
        let dispatcher = Dispatcher::new(
            PathResolver::new(source, output),
            Toolchain::new(),
            ProcessRunner::new(Arc::new(Environment::new())),
        );
        (dir, dispatcher)
    }

    fn argv(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    /// Dispatch `line` for `target` from the source root
    fn run(d: &Dispatcher, target: &str, line: &str) -> BuildResult<Outcome> {
        d.dispatch(
            target,
            argv(line),
            d.resolver().source_root(),
            &ResolveChain::new(),
        )
    }

    #[test]
    fn test_resolve_chain_detects_reentry() {
        let chain = ResolveChain::new().enter("a.4bpp.lz").unwrap();
        let chain = chain.enter("a.4bpp").unwrap();
        assert!(chain.contains("a.4bpp.lz"));
        assert!(!chain.contains("a.png"));

        match chain.enter("a.4bpp.lz") {
            Err(BuildError::CyclicDependency(msg)) => {
                assert_eq!(msg, "a.4bpp.lz -> a.4bpp -> a.4bpp.lz");
            }
            other => panic!("Expected CyclicDependency, got {:?}", other),
        }
    }

    #[test]
    fn test_output_locks_are_shared_per_name() {
        let locks = OutputLocks::new();
        assert!(Arc::ptr_eq(&locks.lock_for("a"), &locks.lock_for("a")));
        assert!(!Arc::ptr_eq(&locks.lock_for("a"), &locks.lock_for("b")));
    }

    #[test]
    fn test_parse_redirect_forms() {
        let args = argv("a b > out");
        let (sources, output) = parse_redirect("t", &args).unwrap();
        assert_eq!(sources, ["a", "b"]);
        assert_eq!(output, "out");

        let args = argv("a >out");
        assert_eq!(parse_redirect("t", &args).unwrap().1, "out");

        for bad in ["a b out", "> out", "a >", "a >> out"] {
            assert!(
                matches!(
                    parse_redirect("t", &argv(bad)),
                    Err(BuildError::MalformedRule { .. })
                ),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn test_concat_across_roots() {
        let (_dir, d) = dispatcher();
        fs::write(d.resolver().source_root().join("a.bin"), b"AB").unwrap();
        fs::write(d.resolver().output_root().join("b.bin"), b"CD").unwrap();

        let outcome = run(&d, "out.bin", "cat a.bin b.bin > out.bin").unwrap();
        assert_eq!(outcome, Outcome::Built);
        assert_eq!(
            fs::read(d.resolver().output_root().join("out.bin")).unwrap(),
            b"ABCD"
        );

        let again = run(&d, "out.bin", "cat a.bin b.bin > out.bin").unwrap();
        assert_eq!(again, Outcome::UpToDate);
    }

    #[test]
    fn test_concat_missing_input() {
        let (_dir, d) = dispatcher();
        let result = run(&d, "out.bin", "cat ghost.bin > out.bin");
        assert!(matches!(result, Err(BuildError::MissingSource { .. })));
    }

    #[test]
    fn test_unrecognized_command() {
        let (_dir, d) = dispatcher();
        let result = run(&d, "x", "python3 x.py");
        assert!(matches!(
            result,
            Err(BuildError::UnrecognizedCommand { .. })
        ));
    }

    #[test]
    fn test_delegate_is_skipped() {
        let (_dir, d) = dispatcher();
        let outcome = run(&d, "sub", "MAKE -C sub").unwrap();
        assert_eq!(outcome, Outcome::Delegated);
    }

    #[test]
    fn test_change_dir_requires_and() {
        let (_dir, d) = dispatcher();
        fs::create_dir_all(d.resolver().source_root().join("sound")).unwrap();

        let result = run(&d, "x", "cd sound ; MAKE");
        assert!(matches!(result, Err(BuildError::MalformedRule { .. })));

        let outcome = run(&d, "x", "cd sound && MAKE").unwrap();
        assert_eq!(outcome, Outcome::Delegated);
    }

    #[test]
    fn test_change_dir_missing_directory() {
        let (_dir, d) = dispatcher();
        let result = run(&d, "x", "cd nowhere && MAKE");
        assert!(matches!(result, Err(BuildError::MissingSource { .. })));
    }

    #[test]
    fn test_midi_without_source_but_existing_output() {
        let (_dir, d) = dispatcher();
        fs::create_dir_all(d.resolver().output_root().join("sound/songs")).unwrap();
        fs::write(d.resolver().output_root().join("sound/songs/x.s"), b"").unwrap();

        let outcome = run(&d, "sound/songs/x.s", "mid2agb sound/songs/x.mid").unwrap();
        assert_eq!(outcome, Outcome::UpToDate);

        let result = run(&d, "sound/songs/y.s", "mid2agb sound/songs/y.mid");
        assert!(matches!(result, Err(BuildError::MissingSource { .. })));
    }

    #[test]
    fn test_tool_arity_is_malformed() {
        let (_dir, d) = dispatcher();
        let result = run(&d, "x.4bpp", "gbagfx x.png");
        assert!(matches!(result, Err(BuildError::MalformedRule { .. })));
    }

    #[test]
    fn test_self_referencing_rule_is_cyclic() {
        let (_dir, d) = dispatcher();
        let target = Target::new("a.4bpp").with_command("gbagfx a.4bpp a.4bpp");
        match d.dispatch_target(&target) {
            Err(BuildError::CyclicDependency(msg)) => assert_eq!(msg, "a.4bpp -> a.4bpp"),
            other => panic!("Expected CyclicDependency, got {:?}", other),
        }
    }

    #[test]
    fn test_materialize_without_any_source() {
        let (_dir, d) = dispatcher();
        match d.materialize("gfx/a.gbapal", &BTreeMap::new(), &ResolveChain::new()) {
            Err(BuildError::MissingSource { target, name }) => {
                assert_eq!(target, "gfx/a.gbapal");
                assert_eq!(name, "gfx/a.pal");
            }
            other => panic!("Expected MissingSource, got {:?}", other),
        }
    }

    #[test]
    fn test_copy_source_is_stale_checked() {
        let (_dir, d) = dispatcher();
        fs::create_dir_all(d.resolver().source_root().join("data")).unwrap();
        fs::write(d.resolver().source_root().join("data/raw.bin"), b"raw").unwrap();

        assert_eq!(d.copy_source("data/raw.bin").unwrap(), Outcome::Built);
        assert_eq!(
            fs::read(d.resolver().output_root().join("data/raw.bin")).unwrap(),
            b"raw"
        );
        assert_eq!(d.copy_source("data/raw.bin").unwrap(), Outcome::UpToDate);
    }

    #[test]
    fn test_dependency_only_rule() {
        let (_dir, d) = dispatcher();
        let target = Target::new("all").with_rule(crate::graph::Rule::default());
        assert_eq!(d.dispatch_target(&target).unwrap(), Outcome::NoCommand);
    }
}
