use crate::session::{SessionKey, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to launch engine process: {0}")]
    Launch(String),

    #[error("session I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] kalix_protocol::ProtocolError),

    #[error("session {key} cannot accept commands in state {state}")]
    NotReady { key: SessionKey, state: SessionState },

    #[error("no session with key {0}")]
    NotFound(SessionKey),

    #[error("session {0} is still active; terminate it before removing")]
    StillActive(SessionKey),

    #[error("session {0} already has an active program")]
    ProgramActive(SessionKey),

    #[error("program cannot start in state {0}")]
    ProgramNotReady(String),

    /// The engine reported an error. The message is opaque display text.
    #[error("engine error: {message}")]
    Remote {
        command: Option<String>,
        message: String,
    },

    #[error("session {0} terminated before the request completed")]
    Terminated(SessionKey),

    #[error("response channel closed before a reply arrived")]
    ChannelClosed,

    #[error("process {0} is not an unmanaged engine process")]
    NotForeign(u32),
}
