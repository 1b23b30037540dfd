use crate::message::Command;
use std::io::{self, ErrorKind};

/// Errors that can surface from an ADB connection, stream, SYNC session or
/// pairing attempt. Kinds follow the propagation policy: `Transport`,
/// `Protocol` and `Auth` always tear the connection down; `StreamRejected`,
/// `StreamClosed` and `Sync` surface to the caller but leave the connection
/// usable.
#[derive(Debug, thiserror::Error)]
pub enum AdbError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unexpected command {0:?}")]
    UnexpectedCommand(Command),

    #[error("unknown command 0x{0:x}")]
    UnknownCommand(u32),

    #[error("authentication failed: keys exhausted or device rejected public key")]
    Auth,

    #[error("peer rejected stream open")]
    StreamRejected,

    #[error("operation on closed stream")]
    StreamClosed,

    #[error("sync error: {0}")]
    Sync(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("pairing error: {0}")]
    Pairing(String),

    #[error("connection closed")]
    Disconnected,
}

pub type AdbResult<T> = Result<T, AdbError>;

impl AdbError {
    /// Reclassifies a `Transport` error whose underlying I/O error is a
    /// timeout/would-block kind as `Timeout`, so a configured deadline
    /// expiring surfaces as its own kind instead of merging into
    /// `Transport`. Anything else passes through unchanged.
    pub(crate) fn reclassify_timeout(self, what: &'static str) -> Self {
        match self {
            AdbError::Transport(e) if is_timeout(&e) => AdbError::Timeout(what),
            other => other,
        }
    }

    /// Reclassifies a connection-closed error as `Auth`. The one place a
    /// disconnect means something specific rather than a dead transport is
    /// right after we've sent AUTH-3 and are waiting for the device to
    /// confirm or reject our public key.
    pub(crate) fn reclassify_disconnect_as_auth(self) -> Self {
        match &self {
            AdbError::Transport(e) if is_disconnect(e) => AdbError::Auth,
            AdbError::Disconnected => AdbError::Auth,
            _ => self,
        }
    }
}

/// Classifies a raw I/O error the same way `reclassify_timeout` does, for
/// call sites (like `TcpStream::connect_timeout`) that hand back an
/// `io::Error` directly instead of an already-built `AdbError`.
pub(crate) fn io_timeout_or_transport(e: io::Error, what: &'static str) -> AdbError {
    if is_timeout(&e) {
        AdbError::Timeout(what)
    } else {
        AdbError::Transport(e)
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe
    )
}
