//! TCP / Unix-socket connections to the daemon.

use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(unix)]
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, info};

use super::codec::{self, Response};
use super::{Connection, Connector, ProtocolError};
use crate::protocol::{Picture, Reply, Request, ServerVersion};

/// Where the daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix(PathBuf),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn open(endpoint: &Endpoint, timeout: Option<Duration>) -> io::Result<Self> {
        let stream = match endpoint {
            Endpoint::Tcp { host, port } => {
                let mut last_error = None;
                let mut connected = None;
                for address in (host.as_str(), *port).to_socket_addrs()? {
                    let attempt = match timeout {
                        Some(timeout) => TcpStream::connect_timeout(&address, timeout),
                        None => TcpStream::connect(address),
                    };
                    match attempt {
                        Ok(stream) => {
                            connected = Some(stream);
                            break;
                        }
                        Err(err) => last_error = Some(err),
                    }
                }
                let stream = match connected {
                    Some(stream) => stream,
                    None => {
                        return Err(last_error.unwrap_or_else(|| {
                            io::Error::new(
                                io::ErrorKind::NotFound,
                                format!("no address found for {host}:{port}"),
                            )
                        }))
                    }
                };
                stream.set_nodelay(true)?;
                Self::Tcp(stream)
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Self::Unix(UnixStream::connect(path)?),
        };
        stream.set_timeouts(timeout)?;
        Ok(stream)
    }

    fn set_timeouts(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => {
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(timeout)
            }
            #[cfg(unix)]
            Self::Unix(stream) => {
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(timeout)
            }
        }
    }

    fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Tcp(stream) => stream.try_clone().map(Self::Tcp),
            #[cfg(unix)]
            Self::Unix(stream) => stream.try_clone().map(Self::Unix),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Self::Unix(stream) => stream.shutdown(Shutdown::Both),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Self::Unix(stream) => stream.flush(),
        }
    }
}

/// Opens socket connections with a fixed endpoint and timeout.
#[derive(Debug, Clone)]
pub struct SocketConnector {
    endpoint: Endpoint,
    timeout: Option<Duration>,
}

impl SocketConnector {
    pub fn new(endpoint: Endpoint, timeout: Option<Duration>) -> Self {
        Self { endpoint, timeout }
    }
}

impl Connector for SocketConnector {
    fn connect(&self) -> Result<Box<dyn Connection>, ProtocolError> {
        let connection = SocketConnection::open(&self.endpoint, self.timeout)?;
        info!(
            "Connected to daemon at {} (protocol {}.{}.{})",
            self.endpoint, connection.version.0, connection.version.1, connection.version.2
        );
        Ok(Box::new(connection))
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}

/// A single daemon session. Any failure other than an `ACK` poisons it: the
/// stream may be mid-reply, so later calls fail with `NotConnected` until the
/// owner reconnects.
pub struct SocketConnection {
    reader: BufReader<Stream>,
    writer: Stream,
    version: ServerVersion,
    broken: bool,
}

impl SocketConnection {
    fn open(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<Self, ProtocolError> {
        let stream = Stream::open(endpoint, timeout)?;
        let writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);
        let version = codec::read_greeting(&mut reader)?;
        Ok(Self {
            reader,
            writer,
            version,
            broken: false,
        })
    }

    pub fn version(&self) -> ServerVersion {
        self.version
    }

    fn round_trip(&mut self, name: &str, arguments: &[String]) -> Result<Response, ProtocolError> {
        if self.broken {
            return Err(ProtocolError::NotConnected);
        }
        let result = codec::write_command(&mut self.writer, name, arguments)
            .and_then(|()| codec::read_response(&mut self.reader));
        // An ACK terminates its reply; anything else may leave unread lines.
        if let Err(err) = &result {
            if !matches!(err, ProtocolError::Server { .. }) {
                self.broken = true;
            }
        }
        result
    }

    fn read_picture(&mut self, uri: &str) -> Result<Option<Picture>, ProtocolError> {
        let mut data = Vec::new();
        let mut mime_type = None;
        loop {
            let offset = data.len().to_string();
            let chunk = self.round_trip("readpicture", &[uri.to_string(), offset])?;
            let Some(size) = chunk.get("size") else {
                // No embedded picture.
                return Ok(None);
            };
            let size: usize = size
                .parse()
                .map_err(|_| ProtocolError::Malformed(format!("picture size {size:?}")))?;
            if mime_type.is_none() {
                mime_type = chunk.get("type").map(str::to_string);
            }
            let bytes = chunk.binary.unwrap_or_default();
            if bytes.is_empty() && data.len() < size {
                return Err(ProtocolError::Malformed(
                    "picture chunk carried no data".to_string(),
                ));
            }
            data.extend_from_slice(&bytes);
            if data.len() >= size {
                data.truncate(size);
                return Ok(Some(Picture { mime_type, data }));
            }
        }
    }
}

impl Connection for SocketConnection {
    fn ping(&mut self) -> Result<(), ProtocolError> {
        self.round_trip("ping", &[]).map(|_| ())
    }

    fn execute(&mut self, request: &Request) -> Result<Reply, ProtocolError> {
        debug!("daemon <- {}", request.name());
        if let Request::ReadPicture(uri) = request {
            return self.read_picture(uri).map(Reply::Picture);
        }
        let response = self.round_trip(request.name(), &request.arguments())?;
        codec::decode_reply(request, &response)
    }

    fn close(&mut self) -> Result<(), ProtocolError> {
        if self.broken {
            return Ok(());
        }
        self.broken = true;
        // `close` has no reply; the daemon just hangs up.
        codec::write_command(&mut self.writer, "close", &[])?;
        self.writer.shutdown()?;
        Ok(())
    }
}
