//! Single-owner daemon connection with probe-and-reconnect.
//!
//! A transport is driven by exactly one thread. Before every call it pings the
//! daemon; a dead connection is dropped and reopened with the stored
//! connector. Failures are returned to the caller, never panicked.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::daemon::{Connection, Connector, ProtocolError};
use crate::protocol::{Reply, Request};

/// Lifecycle of the owned connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct CommandTransport {
    name: &'static str,
    connector: Arc<dyn Connector>,
    connection: Option<Box<dyn Connection>>,
    state: ConnectionState,
    reconnects: u64,
}

impl CommandTransport {
    /// Creates a disconnected transport; the first call connects.
    pub fn new(name: &'static str, connector: Arc<dyn Connector>) -> Self {
        Self {
            name,
            connector,
            connection: None,
            state: ConnectionState::Disconnected,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of times a live connection had to be replaced.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects
    }

    /// Opens the connection if there is none. Connecting an already-open
    /// transport is a no-op.
    pub fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.connection.is_some() {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;
        match self.connector.connect() {
            Ok(connection) => {
                self.connection = Some(connection);
                self.state = ConnectionState::Connected;
                debug!(
                    "{} transport connected to {}",
                    self.name,
                    self.connector.describe()
                );
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    /// Drops the connection. Errors from a socket that is already broken are
    /// expected here and ignored.
    pub fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(err) = connection.close() {
                debug!("{} transport: ignoring close error: {}", self.name, err);
            }
        }
        self.state = ConnectionState::Disconnected;
    }

    fn reconnect(&mut self) -> Result<(), ProtocolError> {
        self.disconnect();
        self.reconnects += 1;
        info!(
            "{} transport reconnecting to {} (attempt #{})",
            self.name,
            self.connector.describe(),
            self.reconnects
        );
        match self.connect() {
            Err(err) if err.is_already_connected() => Ok(()),
            other => other,
        }
    }

    fn ensure_live(&mut self) -> Result<(), ProtocolError> {
        let Some(connection) = self.connection.as_mut() else {
            return self.connect();
        };
        match connection.ping() {
            Ok(()) => Ok(()),
            Err(err) if err.is_already_connected() => Ok(()),
            Err(err) if err.is_connection_error() => {
                warn!("{} transport: liveness probe failed: {}", self.name, err);
                self.reconnect()
            }
            Err(err) => Err(err),
        }
    }

    fn call(&mut self, request: &Request) -> Result<Reply, ProtocolError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(ProtocolError::NotConnected)?;
        match connection.execute(request) {
            Err(err) if err.is_already_connected() => Ok(Reply::Ok),
            other => other,
        }
    }

    /// Probes, reconnects if needed, and runs `request`. A connection error
    /// from the call itself triggers one reconnect and one retry.
    pub fn execute(&mut self, request: &Request) -> Result<Reply, ProtocolError> {
        self.ensure_live()?;
        match self.call(request) {
            Err(err) if err.is_connection_error() => {
                warn!(
                    "{} transport: `{}` lost the connection ({}), retrying once",
                    self.name,
                    request.name(),
                    err
                );
                self.reconnect()?;
                self.call(request)
            }
            other => other,
        }
    }

    /// Like `execute` but without the post-failure retry. Used for the
    /// long-poll, whose owner has its own retry loop.
    pub fn execute_once(&mut self, request: &Request) -> Result<Reply, ProtocolError> {
        self.ensure_live()?;
        let result = self.call(request);
        if let Err(err) = &result {
            if err.is_connection_error() {
                self.disconnect();
            }
        }
        result
    }
}

impl Drop for CommandTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
