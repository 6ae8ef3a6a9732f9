//! External tool execution
//!
//! Every conversion tool is spawned directly (no shell) with captured output.
//! A tool succeeds only when it exits with status 0 *and* writes nothing to
//! stderr; anything else is reported as a `CommandExecution` error carrying
//! the captured stderr. Captured stdout is handed back in a [`ToolOutput`].

use crate::command::ToolKind;
use crate::env::Environment;
use crate::error::{BuildError, BuildResult};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Configured executable for each conversion tool
#[derive(Debug, Clone, Default)]
pub struct Toolchain {
    tools: HashMap<ToolKind, PathBuf>,
}

impl Toolchain {
    /// Create an empty toolchain; unset tools fall back to their identity on `PATH`
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the executable for a tool
    pub fn with_tool(mut self, tool: ToolKind, path: impl Into<PathBuf>) -> Self {
        self.tools.insert(tool, path.into());
        self
    }

    /// Executable to spawn for `tool`
    pub fn executable(&self, tool: ToolKind) -> PathBuf {
        self.tools
            .get(&tool)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(tool.identity()))
    }
}

/// Captured result of a successful tool run
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Tool identity
    pub tool: String,
    /// Captured standard output
    pub stdout: String,
    /// Wall-clock execution time
    pub duration: Duration,
}

/// Spawns tools with the shared, immutable environment snapshot
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    env: Arc<Environment>,
}

impl ProcessRunner {
    /// Create a runner over an environment snapshot
    pub fn new(env: Arc<Environment>) -> Self {
        Self { env }
    }

    /// Run `program args…` in `cwd` and enforce the exit contract
    ///
    /// `tool` names the tool in errors and logs. The snapshot variables are
    /// overlaid on the inherited process environment.
    pub fn run<I, S>(
        &self,
        tool: &str,
        program: &Path,
        args: I,
        cwd: &Path,
    ) -> BuildResult<ToolOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let start = Instant::now();
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .envs(self.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(tool, command = ?command, "spawning");

        let output = command
            .spawn()
            .and_then(|child| child.wait_with_output())
            .map_err(|error| BuildError::ToolSpawn {
                tool: tool.to_string(),
                error,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() || !stderr.is_empty() {
            return Err(BuildError::CommandExecution {
                tool: tool.to_string(),
                exit_code: output.status.code(),
                stderr,
            });
        }

        Ok(ToolOutput {
            tool: tool.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout)
                .trim_end()
                .to_string(),
            duration: start.elapsed(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn runner() -> ProcessRunner {
        let env = Environment::new().with_var("REGEN_TEST_VAR", "42");
        ProcessRunner::new(Arc::new(env))
    }

    #[test]
    fn test_run_success_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let tool = script(dir.path(), "ok", "echo converted \"$1\"");
        let output = runner().run("ok", &tool, ["a.png"], dir.path()).unwrap();
        assert_eq!(output.tool, "ok");
        assert_eq!(output.stdout, "converted a.png");
    }

    #[test]
    fn test_run_passes_environment_and_cwd() {
        let dir = TempDir::new().unwrap();
        let tool = script(dir.path(), "envtool", "echo \"$REGEN_TEST_VAR\" > seen.txt");
        runner()
            .run("envtool", &tool, Vec::<String>::new(), dir.path())
            .unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("seen.txt")).unwrap(),
            "42\n"
        );
    }

    #[test]
    fn test_nonzero_exit_is_error() {
        let dir = TempDir::new().unwrap();
        let tool = script(dir.path(), "fail", "exit 3");
        match runner().run("fail", &tool, Vec::<String>::new(), dir.path()) {
            Err(BuildError::CommandExecution {
                tool,
                exit_code,
                ..
            }) => {
                assert_eq!(tool, "fail");
                assert_eq!(exit_code, Some(3));
            }
            other => panic!("Expected CommandExecution, got {:?}", other),
        }
    }

    #[test]
    fn test_stderr_output_is_error_even_on_success() {
        let dir = TempDir::new().unwrap();
        let tool = script(dir.path(), "noisy", "echo warning >&2");
        match runner().run("noisy", &tool, Vec::<String>::new(), dir.path()) {
            Err(BuildError::CommandExecution {
                exit_code,
                stderr,
                ..
            }) => {
                assert_eq!(exit_code, Some(0));
                assert_eq!(stderr, "warning\n");
            }
            other => panic!("Expected CommandExecution, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let result = runner().run(
            "ghost",
            &dir.path().join("does-not-exist"),
            Vec::<String>::new(),
            dir.path(),
        );
        assert!(matches!(result, Err(BuildError::ToolSpawn { .. })));
    }

    #[test]
    fn test_toolchain_fallback() {
        let toolchain = Toolchain::new().with_tool(ToolKind::GraphicsConvert, "/opt/gbagfx");
        assert_eq!(
            toolchain.executable(ToolKind::GraphicsConvert),
            PathBuf::from("/opt/gbagfx")
        );
        assert_eq!(
            toolchain.executable(ToolKind::FontRasterize),
            PathBuf::from("rsfont")
        );
    }
}
