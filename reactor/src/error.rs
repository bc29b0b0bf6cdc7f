use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("readiness wait failed: {0}")]
    Wait(#[source] std::io::Error),

    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),

    #[error("bind failed for {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("filesystem socket path is not usable: {0}")]
    SocketPath(String),

    #[error("privilege drop failed: {0}")]
    Privilege(#[source] nix::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReactorError>;
