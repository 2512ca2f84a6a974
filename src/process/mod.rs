//! Thin wrapper around external process execution.
//!
//! Spawns the dump/restore executables with stdout wired to a file (or
//! drained) and stdin fed from a file (or closed), capturing stderr as text.
//! A non-zero exit code is reported to the caller, not raised; callers decide
//! fatality from the exit code and stderr contents.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use which::which;

use crate::errors::Result;

/// Outcome of one external process run.
#[derive(Debug)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// File wiring for a process run.
#[derive(Debug, Default)]
pub struct CommandIo<'a> {
    /// Pipe the child's stdout into this file; drained when `None`.
    pub stdout_file: Option<&'a Path>,
    /// Feed the child's stdin from this file; closed immediately when `None`.
    pub stdin_file: Option<&'a Path>,
}

/// Finds an executable in the system PATH.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|_| {
        crate::errors::AppError::Config(format!(
            "{} executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH.",
            name
        ))
    })
}

/// Runs `program` with the given arguments and environment overrides.
pub async fn run_command(
    program: &Path,
    args: &[String],
    envs: &[(&str, String)],
    io: CommandIo<'_>,
) -> Result<CommandOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    for (key, value) in envs {
        cmd.env(key, value);
    }

    cmd.stdout(match io.stdout_file {
        Some(path) => Stdio::from(std::fs::File::create(path)?),
        None => Stdio::null(),
    });
    cmd.stdin(match io.stdin_file {
        Some(path) => Stdio::from(std::fs::File::open(path)?),
        None => Stdio::null(),
    });
    cmd.stderr(Stdio::piped());

    let child = cmd.spawn()?;
    let output = child.wait_with_output().await?;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}
