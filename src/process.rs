//! External command execution.
//!
//! Every archiver, mount and controller invocation is described by a [`Cmd`]
//! value and executed through a [`Runner`]. The pipeline holds one runner for
//! the whole build so tests can substitute a recording double.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::ToolError;

/// A fully described external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    envs: BTreeMap<String, String>,
    id: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            current_dir: None,
            envs: BTreeMap::new(),
            id: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Overlay environment variables on top of the inherited environment.
    pub fn envs(mut self, envs: &BTreeMap<String, String>) -> Self {
        for (key, value) in envs {
            self.envs.insert(key.clone(), value.clone());
        }
        self
    }

    /// Short identifier used in diagnostics (e.g. `TAR`, `MOUNT`).
    pub fn id(mut self, id: impl AsRef<str>) -> Self {
        self.id = Some(id.as_ref().to_string());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_envs(&self) -> &BTreeMap<String, String> {
        &self.envs
    }

    pub fn get_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    fn label(&self) -> String {
        self.id.clone().unwrap_or_else(|| self.program.clone())
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(&self.envs);
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv().join(" "))
    }
}

/// Captured output of a command run through [`Runner::capture`].
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, or -1 if terminated by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Executes commands. Blocking; no timeout.
pub trait Runner: Send + Sync {
    /// Run with inherited stdio and return the exit code (-1 on signal).
    fn status(&self, cmd: &Cmd) -> std::io::Result<i32>;

    /// Run with stdout/stderr captured.
    fn capture(&self, cmd: &Cmd) -> std::io::Result<CommandOutput>;
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn status(&self, cmd: &Cmd) -> std::io::Result<i32> {
        let status = cmd
            .to_command()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()?;
        Ok(status.code().unwrap_or(-1))
    }

    fn capture(&self, cmd: &Cmd) -> std::io::Result<CommandOutput> {
        let output = cmd.to_command().stdin(Stdio::null()).output()?;
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run `cmd` and map its exit status onto the `fatal` contract.
///
/// * exit 0 → `Ok(true)`
/// * nonzero exit or spawn failure with `fatal` → `Err(ToolError)`
/// * nonzero exit or spawn failure without `fatal` → `Ok(false)`
pub fn run_tool(runner: &dyn Runner, cmd: &Cmd, fatal: bool) -> Result<bool, ToolError> {
    tracing::debug!(command = %cmd, "running");
    match runner.status(cmd) {
        Ok(0) => Ok(true),
        Ok(code) => {
            if fatal {
                return Err(ToolError::Failed {
                    id: cmd.label(),
                    command: cmd.to_string(),
                    code,
                });
            }
            tracing::warn!("{}: '{}' exited with status {}", cmd.label(), cmd, code);
            Ok(false)
        }
        Err(source) => {
            if fatal {
                return Err(ToolError::Spawn {
                    id: cmd.label(),
                    command: cmd.to_string(),
                    source,
                });
            }
            tracing::warn!("{}: failed to execute '{}': {}", cmd.label(), cmd, source);
            Ok(false)
        }
    }
}

/// Run `cmd` and fail on anything but exit 0.
pub fn run_checked(runner: &dyn Runner, cmd: &Cmd) -> Result<(), ToolError> {
    run_tool(runner, cmd, true).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_tool_success() {
        let cmd = Cmd::new("true");
        assert!(run_tool(&SystemRunner, &cmd, true).unwrap());
    }

    #[test]
    fn test_run_tool_nonfatal_failure_returns_false() {
        let cmd = Cmd::new("false");
        assert!(!run_tool(&SystemRunner, &cmd, false).unwrap());
    }

    #[test]
    fn test_run_tool_fatal_failure_reports_command() {
        let cmd = Cmd::new("false").id("FALSE");
        let err = run_tool(&SystemRunner, &cmd, true).unwrap_err();
        match err {
            ToolError::Failed { id, command, code } => {
                assert_eq!(id, "FALSE");
                assert_eq!(command, "false");
                assert_eq!(code, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let cmd = Cmd::new("definitely_not_a_real_command_12345");
        assert!(matches!(
            run_tool(&SystemRunner, &cmd, true),
            Err(ToolError::Spawn { .. })
        ));
        assert!(!run_tool(&SystemRunner, &cmd, false).unwrap());
    }

    #[test]
    fn test_capture_with_env_overlay() {
        let mut env = BTreeMap::new();
        env.insert("CLST_TEST_VALUE".to_string(), "hello".to_string());
        let cmd = Cmd::new("sh")
            .args(["-c", "echo $CLST_TEST_VALUE"])
            .envs(&env);
        let out = SystemRunner.capture(&cmd).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_display_joins_argv() {
        let cmd = Cmd::new("tar")
            .args(["-cpf", "/out/repo.tar"])
            .arg_path(Path::new("/tmp/stage"));
        assert_eq!(cmd.to_string(), "tar -cpf /out/repo.tar /tmp/stage");
    }
}
