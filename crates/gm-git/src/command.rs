use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::GitError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Outcome of a git invocation whose non-zero exit is meaningful to the
/// caller (merges, conflict probes) rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitStatusOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitStatusOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCli {
    pub binary: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
        }
    }
}

impl GitCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn run<I, S>(&self, cwd: &Path, args: I) -> Result<GitOutput, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run_with_env(cwd, args, &[])
    }

    /// Run with extra environment variables (e.g. `GIT_INDEX_FILE` for
    /// temp-index diffs).
    pub fn run_with_env<I, S>(
        &self,
        cwd: &Path,
        args: I,
        env: &[(&str, &OsStr)],
    ) -> Result<GitOutput, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (rendered, output) = self.spawn(cwd, args, env)?;

        let stdout = String::from_utf8(output.stdout).map_err(|source| GitError::NonUtf8Output {
            command: rendered.clone(),
            stream: "stdout",
            source,
        })?;
        let stderr = String::from_utf8(output.stderr).map_err(|source| GitError::NonUtf8Output {
            command: rendered.clone(),
            stream: "stderr",
            source,
        })?;

        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: rendered,
                status: output.status.code(),
                stdout,
                stderr,
            });
        }

        Ok(GitOutput { stdout, stderr })
    }

    /// Run a command whose exit code the caller inspects itself. Only spawn
    /// and encoding problems are errors here.
    pub fn run_status<I, S>(&self, cwd: &Path, args: I) -> Result<GitStatusOutput, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (_rendered, output) = self.spawn(cwd, args, &[])?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        Ok(GitStatusOutput {
            status: output.status.code(),
            stdout,
            stderr,
        })
    }

    fn spawn<I, S>(
        &self,
        cwd: &Path,
        args: I,
        env: &[(&str, &OsStr)],
    ) -> Result<(String, std::process::Output), GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let owned_args: Vec<OsString> = args
            .into_iter()
            .map(|arg| arg.as_ref().to_os_string())
            .collect();

        let mut command = Command::new(&self.binary);
        command.current_dir(cwd);
        for arg in &owned_args {
            command.arg(arg);
        }
        for (key, value) in env {
            command.env(key, value);
        }

        let rendered = render_command(&self.binary, &owned_args);
        let output = command.output().map_err(|source| GitError::Io {
            command: rendered.clone(),
            source,
        })?;

        Ok((rendered, output))
    }
}

fn render_command(binary: &Path, args: &[OsString]) -> String {
    let mut rendered = binary.to_string_lossy().into_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}
