use std::io;
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tokio::io::AsyncWrite;

/// FTP reply code for "requested action not taken" (not a directory, no access).
const REPLY_REJECTED: u16 = 550;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("server replied {code}: {message}")]
    Reply { code: u16, message: String },
    #[error("malformed server reply: {0}")]
    Malformed(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed by server")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorClass {
    /// The server refused the request for this path (not a directory, permission).
    Rejected,
    Transient,
    Permanent,
    Connection,
}

impl SessionError {
    pub fn classification(&self) -> SessionErrorClass {
        match self {
            SessionError::Reply { code, .. } => classify_reply_code(*code),
            SessionError::Malformed(_) | SessionError::InvalidArgument(_) => {
                SessionErrorClass::Permanent
            }
            SessionError::Io(_) | SessionError::Timeout(_) | SessionError::Closed => {
                SessionErrorClass::Connection
            }
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.classification() == SessionErrorClass::Rejected
    }
}

fn classify_reply_code(code: u16) -> SessionErrorClass {
    match code {
        REPLY_REJECTED => SessionErrorClass::Rejected,
        400..=499 => SessionErrorClass::Transient,
        _ => SessionErrorClass::Permanent,
    }
}

/// A stateful file-transfer session with a server-side current directory.
///
/// Listing returns bare names only, so callers classify entries by probing
/// with [`RemoteSession::change_directory`]. Every probe moves the cursor,
/// which makes the session inherently sequential.
#[allow(async_fn_in_trait)]
pub trait RemoteSession {
    async fn change_directory(&mut self, path: &str) -> Result<(), SessionError>;

    /// Absolute path of the server-side cursor.
    async fn current_directory(&mut self) -> Result<String, SessionError>;

    /// Bare entry names of `path`, in server order.
    async fn list_names(&mut self, path: &str) -> Result<Vec<String>, SessionError>;

    /// Streams the file at `path` into `sink` and returns the number of bytes written.
    async fn retrieve<W>(&mut self, path: &str, sink: &mut W) -> Result<u64, SessionError>
    where
        W: AsyncWrite + Unpin + ?Sized;

    async fn file_size(&mut self, path: &str) -> Result<u64, SessionError>;

    async fn modified_time(&mut self, path: &str) -> Result<OffsetDateTime, SessionError>;

    async fn close(self) -> Result<(), SessionError>
    where
        Self: Sized;
}

/// Opens authenticated sessions.
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Session: RemoteSession;

    async fn connect(&self) -> Result<Self::Session, SessionError>;
}
