//! Launch configuration consumed by the transports.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the session reaches the debugger backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionKind {
    /// Spawn the debugger and talk over its stdio.
    #[default]
    LocalProcess,
    /// Spawn a proxy (ssh, docker exec, a launcher) whose stdio reaches the debugger.
    PipedProxy,
    /// Replay a recorded transcript.
    PlaybackFile,
}

/// One environment variable for the spawned process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentEntry {
    pub name: String,
    pub value: String,
}

/// Program arguments, either as an argv array or as one shell-style string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arguments {
    List(Vec<String>),
    Line(String),
}

impl Default for Arguments {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl Arguments {
    /// The arguments as argv entries.
    ///
    /// # Errors
    /// Returns error if a single-string form has unbalanced quotes.
    pub fn to_vec(&self) -> Result<Vec<String>, ConfigError> {
        match self {
            Self::List(args) => Ok(args.clone()),
            Self::Line(line) => {
                shlex::split(line).ok_or_else(|| ConfigError::InvalidArguments(line.clone()))
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::List(args) => args.is_empty(),
            Self::Line(line) => line.trim().is_empty(),
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid launch configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unbalanced quotes in arguments: {0}")]
    InvalidArguments(String),
    #[error("Missing field for {kind:?} connection: {field}")]
    MissingField {
        kind: ConnectionKind,
        field: &'static str,
    },
}

/// Everything needed to open a connection to a debugger backend.
///
/// Deserialized from camelCase JSON:
///
/// ```json
/// {
///   "executablePath": "/usr/bin/gdb",
///   "arguments": "--interpreter=mi --nx",
///   "workingDirectory": "/src/app",
///   "environment": [{ "name": "LANG", "value": "C" }],
///   "connectionKind": "localProcess"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchConfig {
    /// Debugger (local process) or proxy program (piped proxy).
    #[serde(default)]
    pub executable_path: Option<PathBuf>,
    #[serde(default)]
    pub arguments: Arguments,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: Vec<EnvironmentEntry>,
    #[serde(default)]
    pub connection_kind: ConnectionKind,
    /// Record every sent and received line to this file.
    #[serde(default)]
    pub transcript_path: Option<PathBuf>,
    /// Transcript replayed by a playback connection.
    #[serde(default)]
    pub playback_file: Option<PathBuf>,
}

impl LaunchConfig {
    /// Configuration for a local debugger process.
    #[must_use]
    pub fn local(executable_path: impl Into<PathBuf>) -> Self {
        Self {
            executable_path: Some(executable_path.into()),
            ..Self::default()
        }
    }

    /// Configuration for a proxy program reaching a remote debugger.
    #[must_use]
    pub fn piped(executable_path: impl Into<PathBuf>) -> Self {
        Self {
            executable_path: Some(executable_path.into()),
            connection_kind: ConnectionKind::PipedProxy,
            ..Self::default()
        }
    }

    /// Configuration replaying a transcript file.
    #[must_use]
    pub fn playback(playback_file: impl Into<PathBuf>) -> Self {
        Self {
            playback_file: Some(playback_file.into()),
            connection_kind: ConnectionKind::PlaybackFile,
            ..Self::default()
        }
    }

    /// Parse a JSON configuration.
    ///
    /// # Errors
    /// Returns error if the JSON does not describe a launch configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    #[must_use]
    pub fn with_arguments<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = Arguments::List(args.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push(EnvironmentEntry {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_transcript(mut self, path: impl Into<PathBuf>) -> Self {
        self.transcript_path = Some(path.into());
        self
    }

    /// The executable path, required by process-based connections.
    ///
    /// # Errors
    /// Returns error if no executable is configured.
    pub fn require_executable(&self) -> Result<&Path, ConfigError> {
        self.executable_path
            .as_deref()
            .ok_or(ConfigError::MissingField {
                kind: self.connection_kind,
                field: "executablePath",
            })
    }

    /// The playback transcript path.
    ///
    /// # Errors
    /// Returns error if no playback file is configured.
    pub fn require_playback_file(&self) -> Result<&Path, ConfigError> {
        self.playback_file
            .as_deref()
            .ok_or(ConfigError::MissingField {
                kind: self.connection_kind,
                field: "playbackFile",
            })
    }
}
