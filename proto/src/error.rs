use thiserror::Error;

use crate::frame::FrameError;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("both peers identified as the same role")]
    RoleMismatch,

    #[error("HELLO received on the socket-server side")]
    HelloOnServerSide,

    #[error("CONNECT received on the socket-client side")]
    ConnectOnClientSide,

    #[error("peer reused an already-occupied client slot {0}")]
    DuplicateSlot(u16),

    #[error("IDENT handshake timed out")]
    IdentTimeout,

    #[error("tunnel unresponsive past the liveness deadline")]
    Unresponsive,

    #[error("outbound queue is full")]
    QueueFull,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
