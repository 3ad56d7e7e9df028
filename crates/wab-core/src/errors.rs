/// Core error type for the bot.
///
/// Adapter crates map their specific errors into this type so the supervisor
/// can sort failures into recoverable, fatal and session-corrupt classes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("session was logged out")]
    LoggedOut,

    #[error("session corrupt: {0}")]
    SessionCorrupt(String),

    #[error("outbound queue is shut down")]
    QueueClosed,

    #[error("duplicate command name or alias: {0}")]
    DuplicateCommand(String),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Authentication/integrity failures that require wiping the session credential.
    pub fn is_session_corrupt(&self) -> bool {
        matches!(self, Error::SessionCorrupt(_))
    }

    /// Conditions that end the connection lifecycle for this process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::LoggedOut)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_taxonomy() {
        assert!(Error::SessionCorrupt("bad mac".into()).is_session_corrupt());
        assert!(!Error::Transport("reset".into()).is_session_corrupt());
        assert!(Error::LoggedOut.is_fatal());
        assert!(!Error::NotConnected.is_fatal());
    }
}
