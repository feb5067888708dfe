use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd};
use std::str::FromStr;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, SockaddrStorage, connect, socket};

use crate::wire::codec::{CodecError, CommandType, Decoded, Magic, Packet, WireCodec};

pub const DEFAULT_PORT: u16 = 4730;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK_SIZE_BYTES: usize = 4096;

/// Identifies one connection instance; a reconnect to the same address gets a new id.
pub type ConnectionId = u64;

/// Milliseconds for `poll(2)`, rounded up and clamped to what the syscall accepts.
pub(crate) fn poll_timeout_millis(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_micros().div_ceil(1_000)).unwrap_or(i32::MAX)
}

pub(crate) fn poll_timeout_for(timeout: Duration) -> PollTimeout {
    PollTimeout::try_from(poll_timeout_millis(timeout)).unwrap_or(PollTimeout::MAX)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectProgress {
    Connected,
    InProgress,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn resolve(&self) -> Result<VecDeque<SocketAddr>, ConnectionError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map(|endpoints| endpoints.collect())
            .map_err(|source| ConnectionError::Resolve {
                address: self.clone(),
                source,
            })
    }
}

impl FromStr for ServerAddress {
    type Err = ConnectionError;

    /// Accepts `host`, `host:port` and `[v6]:port`; the port defaults to 4730.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let invalid = || ConnectionError::InvalidAddress {
            address: value.to_owned(),
        };

        let (host, port) = if let Some(rest) = value.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(invalid()),
            }
        } else {
            match value.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => (host, Some(port)),
                Some(_) => return Err(invalid()),
                None => (value, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug)]
pub enum ConnectionError {
    InvalidAddress {
        address: String,
    },
    Resolve {
        address: ServerAddress,
        source: io::Error,
    },
    Connect {
        address: ServerAddress,
        source: io::Error,
    },
    Configure {
        address: ServerAddress,
        source: io::Error,
    },
    NotConnected {
        address: ServerAddress,
    },
    ClosedByPeer {
        address: ServerAddress,
    },
    Read {
        address: ServerAddress,
        source: io::Error,
    },
    Write {
        address: ServerAddress,
        source: io::Error,
    },
    Codec {
        address: ServerAddress,
        source: CodecError,
    },
    Timeout {
        address: ServerAddress,
    },
    UnexpectedReply {
        address: ServerAddress,
        expected: CommandType,
        actual: CommandType,
    },
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAddress { address } => {
                write!(f, "invalid job server address '{address}'")
            }
            Self::Resolve { address, source } => {
                write!(f, "failed to resolve job server {address}: {source}")
            }
            Self::Connect { address, source } => {
                write!(f, "failed to connect to job server {address}: {source}")
            }
            Self::Configure { address, source } => {
                write!(f, "failed to configure TCP stream to {address}: {source}")
            }
            Self::NotConnected { address } => write!(f, "connection to {address} is not open"),
            Self::ClosedByPeer { address } => write!(f, "job server {address} closed the connection"),
            Self::Read { address, source } => write!(f, "read from {address} failed: {source}"),
            Self::Write { address, source } => write!(f, "write to {address} failed: {source}"),
            Self::Codec { address, source } => write!(f, "framing error on {address}: {source}"),
            Self::Timeout { address } => write!(f, "timed out waiting for {address}"),
            Self::UnexpectedReply {
                address,
                expected,
                actual,
            } => write!(
                f,
                "expected {expected} from {address}, received {actual}"
            ),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Resolve { source, .. }
            | Self::Connect { source, .. }
            | Self::Configure { source, .. }
            | Self::Read { source, .. }
            | Self::Write { source, .. } => Some(source),
            Self::Codec { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// One TCP peer speaking the request side of the protocol.
///
/// Multiplexed use goes through [`Connection::enqueue_command`],
/// [`Connection::drain_and_decode`] and [`Connection::flush_pending`], none of
/// which block. [`Connection::send_blocking`] and [`Connection::recv_blocking`]
/// are reserved for isolated round trips such as [`Connection::echo`].
pub struct Connection {
    id: ConnectionId,
    address: ServerAddress,
    codec: WireCodec,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    pending: Option<PendingConnect>,
    read_buffer: Vec<u8>,
    outgoing: Vec<u8>,
}

/// A non-blocking connect still waiting for the handshake, plus the
/// endpoints to fall back to if it fails.
struct PendingConnect {
    stream: TcpStream,
    started_at: Instant,
    fallbacks: VecDeque<SocketAddr>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        address: ServerAddress,
        codec: WireCodec,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            id,
            address,
            codec,
            connect_timeout,
            stream: None,
            pending: None,
            read_buffer: Vec::new(),
            outgoing: Vec::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_connecting(&self) -> bool {
        self.pending.is_some()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outgoing.is_empty()
    }

    pub(crate) fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Socket of the connect in flight; it turns writable once the handshake
    /// has finished, successfully or not.
    pub(crate) fn connecting_stream(&self) -> Option<&TcpStream> {
        self.pending.as_ref().map(|pending| &pending.stream)
    }

    /// Time left before the connect in flight gives up.
    pub fn connect_time_left(&self) -> Option<Duration> {
        self.pending.as_ref().map(|pending| {
            self.connect_timeout
                .saturating_sub(pending.started_at.elapsed())
        })
    }

    /// Opens the connection, waiting at most the connect timeout. Only for
    /// callers that own the thread; the poll loop uses
    /// [`Connection::start_connect`] and [`Connection::finish_connect`].
    pub fn connect(&mut self) -> Result<(), ConnectionError> {
        let mut progress = self.start_connect()?;
        while progress == ConnectProgress::InProgress {
            self.check_connect_timeout()?;
            self.wait_for_connect(self.connect_time_left().unwrap_or_default())?;
            progress = self.finish_connect()?;
        }
        Ok(())
    }

    /// Starts a non-blocking connect. Loopback peers may accept on the spot;
    /// otherwise the socket joins the poll set until it turns writable.
    pub fn start_connect(&mut self) -> Result<ConnectProgress, ConnectionError> {
        if self.stream.is_some() {
            return Ok(ConnectProgress::Connected);
        }
        if self.pending.is_some() {
            return Ok(ConnectProgress::InProgress);
        }

        let endpoints = self.address.resolve()?;
        self.read_buffer.clear();
        self.outgoing.clear();
        self.try_endpoints(endpoints, None)
    }

    /// Checks a connect in flight after its socket reported readiness. A
    /// refused endpoint moves on to the next resolved one.
    pub fn finish_connect(&mut self) -> Result<ConnectProgress, ConnectionError> {
        let Some(pending) = self.pending.take() else {
            return match self.stream {
                Some(_) => Ok(ConnectProgress::Connected),
                None => Err(self.not_connected()),
            };
        };

        let failure = match pending.stream.take_error() {
            Ok(None) => match pending.stream.peer_addr() {
                Ok(_) => {
                    self.configure(&pending.stream)?;
                    self.stream = Some(pending.stream);
                    return Ok(ConnectProgress::Connected);
                }
                Err(error) if error.kind() == io::ErrorKind::NotConnected => {
                    self.pending = Some(pending);
                    return Ok(ConnectProgress::InProgress);
                }
                Err(error) => error,
            },
            Ok(Some(error)) | Err(error) => error,
        };

        self.try_endpoints(pending.fallbacks, Some(failure))
    }

    /// Abandons a connect in flight once the connect timeout has passed.
    pub fn check_connect_timeout(&mut self) -> Result<(), ConnectionError> {
        if self.connect_time_left() != Some(Duration::ZERO) {
            return Ok(());
        }

        self.pending = None;
        Err(ConnectionError::Timeout {
            address: self.address.clone(),
        })
    }

    fn try_endpoints(
        &mut self,
        mut endpoints: VecDeque<SocketAddr>,
        mut last_error: Option<io::Error>,
    ) -> Result<ConnectProgress, ConnectionError> {
        while let Some(endpoint) = endpoints.pop_front() {
            match begin_connect(endpoint) {
                Ok((stream, true)) => {
                    self.configure(&stream)?;
                    self.stream = Some(stream);
                    return Ok(ConnectProgress::Connected);
                }
                Ok((stream, false)) => {
                    self.pending = Some(PendingConnect {
                        stream,
                        started_at: Instant::now(),
                        fallbacks: endpoints,
                    });
                    return Ok(ConnectProgress::InProgress);
                }
                Err(source) => last_error = Some(source),
            }
        }

        Err(ConnectionError::Connect {
            address: self.address.clone(),
            source: last_error.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "address resolved to no endpoints")
            }),
        })
    }

    fn wait_for_connect(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let Some(stream) = self.connecting_stream() else {
            return Ok(());
        };

        let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLOUT)];
        match poll(&mut fds, poll_timeout_for(timeout)) {
            Ok(_) | Err(Errno::EINTR) => Ok(()),
            Err(errno) => Err(ConnectionError::Connect {
                address: self.address.clone(),
                source: errno.into(),
            }),
        }
    }

    fn configure(&self, stream: &TcpStream) -> Result<(), ConnectionError> {
        stream
            .set_nodelay(true)
            .and_then(|()| stream.set_nonblocking(true))
            .map_err(|source| ConnectionError::Configure {
                address: self.address.clone(),
                source,
            })
    }

    pub fn enqueue_command(
        &mut self,
        command: CommandType,
        fields: &[&[u8]],
    ) -> Result<(), ConnectionError> {
        if self.stream.is_none() {
            return Err(self.not_connected());
        }

        let frame = self.encode(command, fields)?;
        self.outgoing.extend_from_slice(&frame);
        Ok(())
    }

    /// Reads everything the socket has buffered and returns every complete
    /// frame in arrival order. A partial trailing frame stays buffered.
    pub fn drain_and_decode(&mut self) -> Result<Vec<Packet>, ConnectionError> {
        let address = self.address.clone();
        let stream = self.stream.as_mut().ok_or_else(|| ConnectionError::NotConnected {
            address: address.clone(),
        })?;

        let mut chunk = [0_u8; READ_CHUNK_SIZE_BYTES];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return Err(ConnectionError::ClosedByPeer { address }),
                Ok(size) => self.read_buffer.extend_from_slice(&chunk[..size]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => return Err(ConnectionError::Read { address, source }),
            }
        }

        let mut packets = Vec::new();
        while let Some(packet) = self.decode_buffered()? {
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Writes as much queued output as the socket accepts; returns the number
    /// of bytes written.
    pub fn flush_pending(&mut self) -> Result<usize, ConnectionError> {
        let address = self.address.clone();
        let stream = self.stream.as_mut().ok_or_else(|| ConnectionError::NotConnected {
            address: address.clone(),
        })?;

        let mut written = 0;
        while written < self.outgoing.len() {
            match stream.write(&self.outgoing[written..]) {
                Ok(0) => {
                    return Err(ConnectionError::Write {
                        address,
                        source: io::ErrorKind::WriteZero.into(),
                    });
                }
                Ok(size) => written += size,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => return Err(ConnectionError::Write { address, source }),
            }
        }

        self.outgoing.drain(..written);
        Ok(written)
    }

    /// Writes one command and any queued output before it, blocking until done.
    pub fn send_blocking(
        &mut self,
        command: CommandType,
        fields: &[&[u8]],
    ) -> Result<(), ConnectionError> {
        let frame = self.encode(command, fields)?;
        self.outgoing.extend_from_slice(&frame);

        let address = self.address.clone();
        let outgoing = std::mem::take(&mut self.outgoing);
        self.with_blocking_stream(None, |stream| {
            stream
                .write_all(&outgoing)
                .and_then(|()| stream.flush())
                .map_err(|source| ConnectionError::Write { address, source })
        })
    }

    /// Blocks until one complete frame arrives or `timeout` elapses.
    pub fn recv_blocking(&mut self, timeout: Duration) -> Result<Packet, ConnectionError> {
        if let Some(packet) = self.decode_buffered()? {
            return Ok(packet);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ConnectionError::Timeout {
                    address: self.address.clone(),
                });
            }

            let address = self.address.clone();
            let mut chunk = [0_u8; READ_CHUNK_SIZE_BYTES];
            let size = self.with_blocking_stream(Some(remaining), |stream| {
                match stream.read(&mut chunk) {
                    Ok(0) => Err(ConnectionError::ClosedByPeer { address }),
                    Ok(size) => Ok(size),
                    Err(error)
                        if matches!(
                            error.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) =>
                    {
                        Err(ConnectionError::Timeout { address })
                    }
                    Err(error) if error.kind() == io::ErrorKind::Interrupted => Ok(0),
                    Err(source) => Err(ConnectionError::Read { address, source }),
                }
            })?;

            self.read_buffer.extend_from_slice(&chunk[..size]);
            if let Some(packet) = self.decode_buffered()? {
                return Ok(packet);
            }
        }
    }

    /// Liveness round trip: ECHO_REQ with `payload`, expecting ECHO_RES back.
    pub fn echo(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>, ConnectionError> {
        self.send_blocking(CommandType::EchoReq, &[payload])?;
        let packet = self.recv_blocking(timeout)?;
        if packet.command != CommandType::EchoRes {
            return Err(ConnectionError::UnexpectedReply {
                address: self.address.clone(),
                expected: CommandType::EchoRes,
                actual: packet.command,
            });
        }

        Ok(packet.into_fields().pop().unwrap_or_default())
    }

    pub fn close(&mut self) {
        self.pending = None;
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.read_buffer.clear();
        self.outgoing.clear();
    }

    fn encode(&self, command: CommandType, fields: &[&[u8]]) -> Result<Vec<u8>, ConnectionError> {
        self.codec
            .encode(Magic::Request, command, fields)
            .map_err(|source| ConnectionError::Codec {
                address: self.address.clone(),
                source,
            })
    }

    fn decode_buffered(&mut self) -> Result<Option<Packet>, ConnectionError> {
        let decoded = self
            .codec
            .decode(&self.read_buffer, Magic::Response)
            .map_err(|source| ConnectionError::Codec {
                address: self.address.clone(),
                source,
            })?;

        match decoded {
            Decoded::Complete { packet, consumed } => {
                self.read_buffer.drain(..consumed);
                Ok(Some(packet))
            }
            Decoded::Incomplete => Ok(None),
        }
    }

    fn not_connected(&self) -> ConnectionError {
        ConnectionError::NotConnected {
            address: self.address.clone(),
        }
    }

    /// Runs `op` with the stream switched to blocking mode, restoring
    /// non-blocking mode afterwards whatever `op` returned.
    fn with_blocking_stream<T>(
        &mut self,
        read_timeout: Option<Duration>,
        op: impl FnOnce(&mut TcpStream) -> Result<T, ConnectionError>,
    ) -> Result<T, ConnectionError> {
        let address = self.address.clone();
        let configure_error = |source| ConnectionError::Configure {
            address: address.clone(),
            source,
        };
        let stream = self.stream.as_mut().ok_or_else(|| ConnectionError::NotConnected {
            address: address.clone(),
        })?;

        stream.set_nonblocking(false).map_err(configure_error)?;
        stream.set_read_timeout(read_timeout).map_err(configure_error)?;
        let result = op(&mut *stream);
        let restored = stream
            .set_read_timeout(None)
            .and_then(|()| stream.set_nonblocking(true))
            .map_err(configure_error);

        let value = result?;
        restored?;
        Ok(value)
    }
}

/// Returns the socket and whether the handshake already completed.
fn begin_connect(endpoint: SocketAddr) -> io::Result<(TcpStream, bool)> {
    let family = match endpoint {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let stream = TcpStream::from(socket(family, SockType::Stream, SockFlag::empty(), None)?);
    stream.set_nonblocking(true)?;

    match connect(stream.as_raw_fd(), &SockaddrStorage::from(endpoint)) {
        Ok(()) => Ok((stream, true)),
        Err(Errno::EINPROGRESS | Errno::EINTR) => Ok((stream, false)),
        Err(errno) => Err(errno.into()),
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .field("connecting", &self.is_connecting())
            .field("buffered_bytes", &self.read_buffer.len())
            .field("pending_output_bytes", &self.outgoing.len())
            .finish()
    }
}
