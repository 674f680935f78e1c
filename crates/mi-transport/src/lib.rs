//! Transports connecting an MI session to its debugger backend.
//!
//! Provides:
//! - Local process and piped proxy transports over child stdio
//! - `StreamTransport` over any `AsyncRead`/`AsyncWrite` pair
//! - `PlaybackTransport` replaying recorded transcripts
//! - `Recorder` writing transcripts of live sessions
//! - Executable resolution utilities

pub mod command;
pub mod line_buffer;
pub mod playback;
pub mod process;
pub mod resolve;
pub mod stream;
pub mod transcript;

use mi_core::{Connection, ConnectionKind, LaunchConfig, TransportError};

pub use command::{CommandBuilder, CommandParts};
pub use line_buffer::LineBuffer;
pub use playback::PlaybackTransport;
pub use process::{spawn_local, spawn_proxy};
pub use resolve::{merge_paths, resolve_executable_path};
pub use stream::{StreamParts, StreamTransport};
pub use transcript::Recorder;

/// Open the connection described by `config`, recording it if a
/// transcript path is set.
///
/// # Errors
/// Returns error if the connection cannot be established.
pub async fn connect(config: &LaunchConfig) -> Result<Connection, TransportError> {
    let connection = match config.connection_kind {
        ConnectionKind::LocalProcess => spawn_local(config).await?,
        ConnectionKind::PipedProxy => spawn_proxy(config).await?,
        ConnectionKind::PlaybackFile => {
            PlaybackTransport::open(config.require_playback_file()?).await?
        }
    };
    match &config.transcript_path {
        Some(path) => {
            let recorder = Recorder::create(path).await?;
            tracing::debug!(path = %path.display(), "Recording transcript");
            Ok(recorder.wrap(connection))
        }
        None => Ok(connection),
    }
}
