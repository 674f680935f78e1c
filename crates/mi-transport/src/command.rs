//! Building and spawning the debugger or proxy process.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use mi_core::{LaunchConfig, TransportError};
use tokio::process::Command;

use crate::resolve::{expand_tilde, merge_paths, resolve_executable_path};

/// Argument passed to a debugger launched without explicit arguments.
pub const DEFAULT_DEBUGGER_ARG: &str = "--interpreter=mi";

/// Resolved program plus arguments.
#[derive(Debug, Clone)]
pub struct CommandParts {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Directory holding the program.
    #[must_use]
    pub fn program_dir(&self) -> Option<&Path> {
        self.program.parent().filter(|p| !p.as_os_str().is_empty())
    }
}

/// Builder for the spawned backend command.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Program as configured, before resolution.
    pub base: PathBuf,
    /// Arguments to pass.
    pub params: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Put the program's directory first on PATH and use it as default cwd.
    pub debugger_layout: bool,
}

impl CommandBuilder {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        Self {
            base: base.into(),
            params: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            debugger_layout: false,
        }
    }

    /// Builder for a local debugger: `--interpreter=mi` unless arguments are given.
    ///
    /// # Errors
    /// Returns error if the executable or arguments are missing or malformed.
    pub fn for_debugger(config: &LaunchConfig) -> Result<Self, TransportError> {
        let mut builder = Self::for_proxy(config)?;
        if builder.params.is_empty() {
            builder.params.push(DEFAULT_DEBUGGER_ARG.to_string());
        }
        builder.debugger_layout = true;
        Ok(builder)
    }

    /// Builder for a proxy program, arguments taken as configured.
    ///
    /// # Errors
    /// Returns error if the executable or arguments are missing or malformed.
    pub fn for_proxy(config: &LaunchConfig) -> Result<Self, TransportError> {
        let mut builder = Self::new(config.require_executable()?).params(config.arguments.to_vec()?);
        builder.working_dir.clone_from(&config.working_directory);
        builder.env = config
            .environment
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect();
        Ok(builder)
    }

    /// Add parameters.
    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn resolve(&self) -> Result<CommandParts, TransportError> {
        let program = resolve_executable_path(&self.base).await.ok_or_else(|| {
            TransportError::ExecutableNotFound(self.base.display().to_string())
        })?;
        Ok(CommandParts {
            program,
            args: self.params.clone(),
        })
    }

    /// Resolve and spawn with piped stdio, in its own process group.
    ///
    /// # Errors
    /// Returns error if the executable cannot be found or started.
    pub async fn spawn(&self) -> Result<AsyncGroupChild, TransportError> {
        let parts = self.resolve().await?;
        let mut command = Command::new(&parts.program);
        command
            .args(&parts.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let program_dir = parts.program_dir().filter(|_| self.debugger_layout);
        if let Some(dir) = program_dir {
            let path = std::env::var_os("PATH").unwrap_or_default();
            command.env("PATH", merge_paths(OsString::from(dir), path));
        }
        match (&self.working_dir, program_dir) {
            (Some(dir), _) => {
                command.current_dir(expand_tilde(dir));
            }
            (None, Some(dir)) => {
                command.current_dir(dir);
            }
            (None, None) => {}
        }
        for (name, value) in &self.env {
            command.env(name, value);
        }

        tracing::debug!(
            program = %parts.program.display(),
            args = ?parts.args,
            "Spawning backend process"
        );
        command
            .group_spawn()
            .map_err(|e| TransportError::SpawnFailed(format!("{}: {e}", parts.program.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debugger_gets_default_interpreter_arg() {
        let builder = CommandBuilder::for_debugger(&LaunchConfig::local("gdb")).unwrap();
        assert_eq!(builder.params, vec![DEFAULT_DEBUGGER_ARG]);
        assert!(builder.debugger_layout);

        let config = LaunchConfig::local("gdb").with_arguments(["--interpreter=mi2", "-nx"]);
        let builder = CommandBuilder::for_debugger(&config).unwrap();
        assert_eq!(builder.params, vec!["--interpreter=mi2", "-nx"]);
    }

    #[test]
    fn test_proxy_keeps_arguments_and_env() {
        let config = LaunchConfig::piped("ssh")
            .with_arguments(["host", "gdb", "--interpreter=mi"])
            .with_env("TERM", "dumb");
        let builder = CommandBuilder::for_proxy(&config).unwrap();
        assert_eq!(builder.params, vec!["host", "gdb", "--interpreter=mi"]);
        assert_eq!(builder.env, vec![("TERM".to_string(), "dumb".to_string())]);
        assert!(!builder.debugger_layout);
    }

    #[test]
    fn test_missing_executable() {
        assert!(matches!(
            CommandBuilder::for_proxy(&LaunchConfig::default()),
            Err(TransportError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_program_is_not_found() {
        let err = CommandBuilder::new("definitely-not-a-debugger-xyz")
            .spawn()
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ExecutableNotFound(_)));
    }
}
