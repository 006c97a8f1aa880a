//! Error taxonomy for the GPU agent
//!
//! Two fatal classes stop the process at startup (tool validation, metadata
//! resolution). Everything raised inside a polling cycle is transient and only
//! ends that cycle.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure while reading device metrics during one cycle
#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("line {line}: expected {expected} fields, got {found}")]
    FieldCount {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: value {value:?} for {field} is not a finite number")]
    InvalidValue {
        line: usize,
        field: &'static str,
        value: String,
    },
}

/// Failure of a bounded subprocess invocation
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} exited with {code:?}: {stderr}")]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Startup tool validation failure
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("couldn't find {0}; make sure it is installed and on the search path")]
    ToolNotFound(PathBuf),

    #[error("{tool} is not functional: {source}")]
    ToolFailed {
        tool: PathBuf,
        #[source]
        source: CommandError,
    },

    #[error("{0} didn't detect any GPUs attached to the system")]
    NoDevices(PathBuf),
}

/// Host identity resolution failure
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata request for {attribute} failed: {source}")]
    Request {
        attribute: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("metadata server answered {status} for {attribute}")]
    Status {
        attribute: &'static str,
        status: reqwest::StatusCode,
    },

    #[error("malformed zone path {0:?}")]
    MalformedZone(String),

    #[error("instance id {0:?} is not numeric")]
    MalformedInstanceId(String),
}

/// Failure of one batch report
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to serialize batch: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("request to monitoring API failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("monitoring API rejected batch with {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("token acquisition failed: {0}")]
    Token(String),
}

impl ReportError {
    /// True when the backend refused the credential rather than the payload
    pub fn is_auth_rejection(&self) -> bool {
        matches!(
            self,
            ReportError::Rejected { status, .. }
                if *status == reqwest::StatusCode::UNAUTHORIZED
                    || *status == reqwest::StatusCode::FORBIDDEN
        )
    }
}

/// Invalid configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("interval must be at least {min} seconds, got {got}")]
    IntervalTooShort { min: u64, got: u64 },

    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("invalid token command: {0}")]
    TokenCommand(String),
}

/// Fatal startup conditions, each mapped to a process exit status
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("preflight failed: {0}")]
    Preflight(#[from] PreflightError),

    #[error("not running on a Compute Engine instance, or metadata server unreachable: {0}")]
    Metadata(#[from] MetadataError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(reqwest::Error),

    #[error("invalid arguments: {0}")]
    Usage(#[from] clap::Error),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_)
            | StartupError::Preflight(_)
            | StartupError::HttpClient(_)
            | StartupError::Usage(_) => 1,
            StartupError::Metadata(_) => 2,
        }
    }
}
