//! Subprocess execution for the GPU agent
//!
//! Handles every external command the agent runs:
//! - Bounded-time execution with captured stdout/stderr
//! - Preflight validation of the hardware query tool
//! - Bearer token minting through an external command

use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

use crate::error::{CommandError, PreflightError, ReportError};
use crate::reporting::TokenSource;

/// Run `program` with `args`, returning stdout when it exits with status zero.
///
/// The child is killed if it outlives `timeout`.
pub async fn run_command<S: AsRef<OsStr>>(
    program: &Path,
    args: &[S],
    timeout: Duration,
) -> Result<String, CommandError> {
    let name = program.display().to_string();
    let start_time = Instant::now();

    let output = tokio::time::timeout(
        timeout,
        AsyncCommand::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| CommandError::Timeout {
        program: name.clone(),
        timeout,
    })?
    .map_err(|source| CommandError::Spawn {
        program: name.clone(),
        source,
    })?;

    debug!(
        "{} finished in {}ms with {:?}",
        name,
        start_time.elapsed().as_millis(),
        output.status.code()
    );

    if !output.status.success() {
        return Err(CommandError::NonZeroExit {
            program: name,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Default location of the NVIDIA System Management Interface binary
pub fn default_tool_path() -> PathBuf {
    if cfg!(target_os = "windows") {
        PathBuf::from(r"C:\Program Files\NVIDIA Corporation\NVSMI\nvidia-smi.exe")
    } else {
        PathBuf::from("nvidia-smi")
    }
}

/// Resolve the tool to an executable on disk.
///
/// Bare names go through the search path, anything with a directory part must
/// exist as given.
pub fn resolve_tool(tool: &Path) -> Result<PathBuf, PreflightError> {
    if tool.is_absolute() || tool.components().count() > 1 {
        return if tool.is_file() {
            Ok(tool.to_path_buf())
        } else {
            Err(PreflightError::ToolNotFound(tool.to_path_buf()))
        };
    }

    which::which(tool).map_err(|_| PreflightError::ToolNotFound(tool.to_path_buf()))
}

/// Confirm the query tool is installed, runs cleanly and sees at least one GPU.
///
/// Returns the resolved executable path used for every later invocation.
pub async fn check_tool(tool: &Path, timeout: Duration) -> Result<PathBuf, PreflightError> {
    let resolved = resolve_tool(tool)?;
    debug!("Validating {} with a device listing", resolved.display());

    let listing = run_command(&resolved, &["-L"], timeout)
        .await
        .map_err(|source| match source {
            CommandError::Spawn { source: io, .. } if io.kind() == std::io::ErrorKind::NotFound => {
                PreflightError::ToolNotFound(resolved.clone())
            }
            source => PreflightError::ToolFailed {
                tool: resolved.clone(),
                source,
            },
        })?;

    let devices = listing.lines().filter(|line| !line.trim().is_empty()).count();
    if devices == 0 {
        return Err(PreflightError::NoDevices(resolved));
    }

    info!("{} reports {} GPU(s)", resolved.display(), devices);
    Ok(resolved)
}

/// Mints bearer tokens by running an external command and reading its stdout
pub struct CommandTokenSource {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandTokenSource {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }
}

#[async_trait]
impl TokenSource for CommandTokenSource {
    async fn acquire(&self) -> Result<String, ReportError> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| ReportError::Token("token command is empty".to_string()))?;

        info!("Acquiring access token via {}", program);
        let stdout = run_command(Path::new(program), args, self.timeout)
            .await
            .map_err(|e| ReportError::Token(e.to_string()))?;

        let token = stdout.trim();
        if token.is_empty() {
            return Err(ReportError::Token(format!("{} printed no token", program)));
        }

        Ok(token.to_string())
    }
}
