//! Blocking client for the playback daemon's line protocol.
//!
//! `Connector` opens connections and `Connection` runs one request at a time on
//! one of them. The command transport and the change detector each own their
//! connection exclusively; nothing here is shared between threads.

pub mod codec;
pub mod socket;

use thiserror::Error;

use crate::protocol::{Reply, Request};

/// Failure talking to the daemon.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("daemon i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("daemon closed the connection")]
    Closed,
    #[error("connection is not open")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("daemon rejected `{command}`: {message} (ack {code}@{index})")]
    Server {
        code: u32,
        index: u32,
        command: String,
        message: String,
    },
    #[error("unexpected daemon greeting: {0:?}")]
    Greeting(String),
    #[error("malformed daemon reply: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// Whether the failure means the socket is unusable and a reconnect may
    /// help. Socket timeouts land here through `Io`.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Closed | Self::NotConnected | Self::Greeting(_)
        )
    }

    /// A socket read or write deadline expired.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Io(err) if matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            )
        )
    }

    /// The benign race where a connect is issued on a live connection.
    pub fn is_already_connected(&self) -> bool {
        matches!(self, Self::AlreadyConnected)
    }
}

/// One open daemon connection. Used by a single thread at a time.
pub trait Connection: Send {
    /// Cheap liveness probe.
    fn ping(&mut self) -> Result<(), ProtocolError>;
    /// Runs one request and decodes its reply.
    fn execute(&mut self, request: &Request) -> Result<Reply, ProtocolError>;
    /// Politely ends the session. May fail on an already-broken socket.
    fn close(&mut self) -> Result<(), ProtocolError>;
}

/// Opens connections with stored parameters.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Connection>, ProtocolError>;
    /// Human-readable endpoint for logs.
    fn describe(&self) -> String;
}
