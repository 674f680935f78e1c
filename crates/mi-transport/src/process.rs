//! Process-backed transports: a local debugger or a proxy reaching a remote one.

use mi_core::{Connection, LaunchConfig, TransportError};

use crate::{
    command::CommandBuilder,
    stream::{StreamParts, StreamTransport},
};

/// Written to a proxy before it is closed so a remote login shell exits.
pub const PROXY_FAREWELL: &str = "logout";

/// Spawn the debugger described by `config` and talk MI over its stdio.
///
/// # Errors
/// Returns error if the debugger cannot be found or started.
pub async fn spawn_local(config: &LaunchConfig) -> Result<Connection, TransportError> {
    let child = CommandBuilder::for_debugger(config)?.spawn().await?;
    Ok(StreamTransport::start(StreamParts::from_child(child)?))
}

/// Spawn a proxy program (ssh, docker exec, a remote launcher) whose stdio
/// is connected to the debugger.
///
/// # Errors
/// Returns error if the proxy cannot be found or started.
pub async fn spawn_proxy(config: &LaunchConfig) -> Result<Connection, TransportError> {
    let child = CommandBuilder::for_proxy(config)?.spawn().await?;
    let parts = StreamParts::from_child(child)?.with_farewell(PROXY_FAREWELL);
    Ok(StreamTransport::start(parts))
}
