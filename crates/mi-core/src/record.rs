//! Classified MI output lines.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::value::Tuple;

/// Class of a result record.
///
/// ```text
/// result-class ==> "done" | "running" | "connected" | "error" | "exit"
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

impl ResultClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Running => "running",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Exit => "exit",
        }
    }
}

impl fmt::Display for ResultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a result class is not one of the five MI classes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown result class: {0}")]
pub struct UnknownResultClass(pub String);

impl FromStr for ResultClass {
    type Err = UnknownResultClass;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "done" => Ok(Self::Done),
            "running" => Ok(Self::Running),
            "connected" => Ok(Self::Connected),
            "error" => Ok(Self::Error),
            "exit" => Ok(Self::Exit),
            other => Err(UnknownResultClass(other.to_string())),
        }
    }
}

/// `[token]^class,results`: the outcome of a previously sent command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub token: Option<u32>,
    pub class: ResultClass,
    pub results: Tuple,
}

impl ResultRecord {
    /// The backend's `msg` text for an `^error` record.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        if self.class == ResultClass::Error {
            self.results.find("msg").and_then(crate::Value::as_const)
        } else {
            None
        }
    }
}

/// `[token]*class,results`, `[token]+class,results` or `[token]=class,results`.
///
/// The async class is kept as text: backends add their own (`stopped`,
/// `thread-created`, `library-loaded`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncRecord {
    pub token: Option<u32>,
    pub class: String,
    pub results: Tuple,
}

/// One classified line of MI output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Result(ResultRecord),
    /// `*`: execution state changes (`running`, `stopped`).
    ExecAsync(AsyncRecord),
    /// `+`: progress of long operations.
    StatusAsync(AsyncRecord),
    /// `=`: notifications (`thread-created`, `breakpoint-modified`, ...).
    NotifyAsync(AsyncRecord),
    /// `~`: console output, decoded.
    ConsoleStream(String),
    /// `@`: output of the debuggee when it shares the backend's channel.
    TargetStream(String),
    /// `&`: the backend's internal log output.
    LogStream(String),
    /// The `(gdb)` prompt terminating an output group.
    Prompt,
    /// A backend echo of a command it received (`[token]-command`).
    Echo { token: Option<u32>, command: String },
    /// A line without any MI prefix.
    Raw(String),
}

impl Record {
    /// Token of a result or async record.
    #[must_use]
    pub const fn token(&self) -> Option<u32> {
        match self {
            Self::Result(r) => r.token,
            Self::ExecAsync(a) | Self::StatusAsync(a) | Self::NotifyAsync(a) => a.token,
            Self::Echo { token, .. } => *token,
            _ => None,
        }
    }

    /// True for exec, status and notify records.
    #[must_use]
    pub const fn is_async(&self) -> bool {
        matches!(
            self,
            Self::ExecAsync(_) | Self::StatusAsync(_) | Self::NotifyAsync(_)
        )
    }

    /// True for console, target and log stream records.
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(
            self,
            Self::ConsoleStream(_) | Self::TargetStream(_) | Self::LogStream(_)
        )
    }
}
