use std::io;
use std::sync::Arc;

use thiserror::Error as ThisError;

/// Every failure surfaced by the crate.
///
/// The type is `Clone` because a closed [`Args`](crate::args::Args) hands back the same error on
/// every call to `close`, so I/O errors are kept behind an `Arc`.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
    #[error("{0}")]
    Io(Arc<io::Error>),
    #[error("protocol error; {0}")]
    Protocol(String),
    /// An error reply sent by the peer, e.g. `-ERR unknown command`.
    #[error("{0}")]
    Resp(String),
    #[error("invalid {expected} argument: {value:?}")]
    Parse { expected: &'static str, value: String },
    #[error("unsupported {kind} value for argument of type {dest}")]
    Unsupported {
        kind: &'static str,
        dest: &'static str,
    },
    #[error("response contract violated; {0}")]
    ResponseContract(String),
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("server closed")]
    ServerClosed,
}

impl Error {
    /// Reports whether the error ended a context rather than a failing operation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Canceled | Error::DeadlineExceeded)
    }

    /// Reports whether an accept loop should keep going after this error.
    pub fn is_temporary(&self) -> bool {
        match self {
            Error::Io(err) => is_temporary(err),
            Error::Timeout(_) => true,
            _ => false,
        }
    }
}

/// Classifies accept errors the way listeners commonly recover from them: aborted handshakes and
/// transient descriptor or buffer exhaustion are retried, everything else stops the loop.
pub fn is_temporary(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        // EMFILE, ENFILE, ENOBUFS, ENOMEM
        _ => matches!(err.raw_os_error(), Some(24 | 23 | 105 | 12)),
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_src: std::str::Utf8Error) -> Error {
        Error::Protocol("invalid UTF-8 string".to_string())
    }
}
