use std::collections::HashMap;
use std::fmt;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use rand::seq::SliceRandom;
use serde_json::json;

use crate::connection::{
    ConnectProgress, Connection, ConnectionError, ConnectionId, DEFAULT_CONNECT_TIMEOUT,
    ServerAddress, poll_timeout_for,
};
use crate::logging::{LogLevel, Logger};
use crate::wire::codec::{CommandType, Packet, WireCodec};

const LOG_CONTEXT: &str = "manager";

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum HandlerError {
    Connection(ConnectionError),
    UnexpectedCommand {
        command: CommandType,
        state: &'static str,
    },
    ServerError {
        code: String,
        text: String,
    },
    /// Programming-error class: the process-wide bookkeeping is inconsistent.
    InvariantViolation {
        message: String,
    },
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(source) => write!(f, "{source}"),
            Self::UnexpectedCommand { command, state } => {
                write!(f, "unexpected command {command} while {state}")
            }
            Self::ServerError { code, text } => {
                write!(f, "job server reported error {code}: {text}")
            }
            Self::InvariantViolation { message } => write!(f, "invariant violation: {message}"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<ConnectionError> for HandlerError {
    fn from(value: ConnectionError) -> Self {
        Self::Connection(value)
    }
}

/// Per-connection protocol state machine driven by the [`ConnectionManager`].
///
/// Every call receives the connection it is paired with and the shared
/// context owned by the manager's caller.
pub trait CommandHandler: Sized {
    type Context;

    fn create(connection_id: ConnectionId, context: &Self::Context) -> Self;

    fn on_connected(
        &mut self,
        connection: &mut Connection,
        context: &mut Self::Context,
    ) -> Result<(), HandlerError>;

    fn handle_command(
        &mut self,
        packet: Packet,
        connection: &mut Connection,
        context: &mut Self::Context,
    ) -> Result<(), HandlerError>;

    /// Gives the handler a chance to make progress outside of a received
    /// command. Returns whether anything happened.
    fn resume(
        &mut self,
        _connection: &mut Connection,
        _context: &mut Self::Context,
    ) -> Result<bool, HandlerError> {
        Ok(false)
    }

    /// Runs after the paired connection has been closed, for any reason.
    fn on_teardown(&mut self, connection_id: ConnectionId, context: &mut Self::Context);
}

/// A live connection and the handler paired with it.
pub struct Session<H> {
    pub connection: Connection,
    pub handler: H,
}

#[derive(Debug)]
pub enum ManagerError {
    Poll(Errno),
    InvariantViolation {
        address: ServerAddress,
        message: String,
    },
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Poll(errno) => write!(f, "readiness poll failed: {errno}"),
            Self::InvariantViolation { address, message } => {
                write!(f, "invariant violation on {address}: {message}")
            }
        }
    }
}

impl std::error::Error for ManagerError {}

#[derive(Clone, Copy, Debug)]
pub struct ManagerSettings {
    pub codec: WireCodec,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            codec: WireCodec::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PollTarget {
    Session,
    Connect,
}

pub struct ConnectionManager<H: CommandHandler> {
    addresses: Vec<ServerAddress>,
    sessions: HashMap<ServerAddress, Session<H>>,
    connecting: HashMap<ServerAddress, Connection>,
    failed_attempts: HashMap<ServerAddress, Instant>,
    settings: ManagerSettings,
    next_connection_id: ConnectionId,
    logger: Arc<Logger>,
}

impl<H: CommandHandler> ConnectionManager<H> {
    pub fn new(addresses: Vec<ServerAddress>, settings: ManagerSettings, logger: Arc<Logger>) -> Self {
        let mut unique = Vec::with_capacity(addresses.len());
        for address in addresses {
            if !unique.contains(&address) {
                unique.push(address);
            }
        }

        Self {
            addresses: unique,
            sessions: HashMap::new(),
            connecting: HashMap::new(),
            failed_attempts: HashMap::new(),
            settings,
            next_connection_id: 1,
            logger,
        }
    }

    pub fn addresses(&self) -> &[ServerAddress] {
        &self.addresses
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn is_connected(&self, address: &ServerAddress) -> bool {
        self.sessions.contains_key(address)
    }

    pub fn is_connecting(&self, address: &ServerAddress) -> bool {
        self.connecting.contains_key(address)
    }

    pub fn has_pending_connects(&self) -> bool {
        !self.connecting.is_empty()
    }

    pub fn session(&self, address: &ServerAddress) -> Option<&Session<H>> {
        self.sessions.get(address)
    }

    pub fn session_by_id_mut(&mut self, connection_id: ConnectionId) -> Option<&mut Session<H>> {
        self.sessions
            .values_mut()
            .find(|session| session.connection.id() == connection_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session<H>> {
        self.sessions.values()
    }

    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut Session<H>> {
        self.sessions.values_mut()
    }

    /// Starts opening `address` unless it is already live or on its way.
    /// Returns true only for a live session; a connect that cannot finish
    /// right away completes in a later [`ConnectionManager::poll_once`]. A
    /// failed attempt is not retried before the reconnect interval.
    pub fn attempt_connect(&mut self, address: &ServerAddress, context: &mut H::Context) -> bool {
        if self.sessions.contains_key(address) {
            return true;
        }
        if self.connecting.contains_key(address) {
            return false;
        }
        if let Some(failed_at) = self.failed_attempts.get(address) {
            if failed_at.elapsed() < self.settings.reconnect_interval {
                return false;
            }
        }

        let connection_id = self.next_connection_id;
        self.next_connection_id += 1;

        let mut connection = Connection::new(
            connection_id,
            address.clone(),
            self.settings.codec,
            self.settings.connect_timeout,
        );
        match connection.start_connect() {
            Ok(ConnectProgress::Connected) => self.establish(connection, context),
            Ok(ConnectProgress::InProgress) => {
                self.connecting.insert(address.clone(), connection);
                false
            }
            Err(error) => {
                self.record_connect_failure(address, &error);
                false
            }
        }
    }

    fn establish(&mut self, mut connection: Connection, context: &mut H::Context) -> bool {
        let address = connection.address().clone();
        let connection_id = connection.id();
        let mut handler = H::create(connection_id, context);
        let handshake = handler
            .on_connected(&mut connection, context)
            .and_then(|()| {
                connection.flush_pending()?;
                Ok(())
            });
        if let Err(error) = handshake {
            self.logger.warn(
                Some(LOG_CONTEXT),
                &format!("initial handshake with {address} failed: {error}"),
            );
            connection.close();
            handler.on_teardown(connection_id, context);
            self.failed_attempts.insert(address, Instant::now());
            return false;
        }

        self.failed_attempts.remove(&address);
        self.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Connected to job server",
            Some(json!({
                "address": address.to_string(),
                "connection_id": connection_id,
            })),
        );
        self.sessions.insert(address, Session { connection, handler });
        true
    }

    fn record_connect_failure(&mut self, address: &ServerAddress, error: &ConnectionError) {
        self.logger.warn(Some(LOG_CONTEXT), &error.to_string());
        self.failed_attempts.insert(address.clone(), Instant::now());
    }

    /// Finishes a connect whose socket reported readiness. Returns whether a
    /// session was established.
    fn complete_connect(&mut self, address: &ServerAddress, context: &mut H::Context) -> bool {
        let Some(mut connection) = self.connecting.remove(address) else {
            return false;
        };

        match connection.finish_connect() {
            Ok(ConnectProgress::Connected) => self.establish(connection, context),
            Ok(ConnectProgress::InProgress) => {
                self.connecting.insert(address.clone(), connection);
                false
            }
            Err(error) => {
                self.record_connect_failure(address, &error);
                false
            }
        }
    }

    fn expire_connect_attempts(&mut self) {
        let mut expired = Vec::new();
        for (address, connection) in &mut self.connecting {
            if let Err(error) = connection.check_connect_timeout() {
                expired.push((address.clone(), error));
            }
        }

        for (address, error) in expired {
            self.connecting.remove(&address);
            self.record_connect_failure(&address, &error);
        }
    }

    /// Attempts every configured address and returns the live ones in a
    /// freshly shuffled order.
    pub fn live_connections(&mut self, context: &mut H::Context) -> Vec<ServerAddress> {
        let mut candidates = self.addresses.clone();
        candidates.shuffle(&mut rand::thread_rng());

        candidates
            .into_iter()
            .filter(|address| self.attempt_connect(address, context))
            .collect()
    }

    /// One readiness pass over `addresses` and every connect in flight,
    /// blocking at most `timeout`. Returns whether any read, write, new
    /// session or handler progress happened.
    pub fn poll_once(
        &mut self,
        addresses: &[ServerAddress],
        timeout: Duration,
        context: &mut H::Context,
    ) -> Result<bool, ManagerError> {
        self.expire_connect_attempts();

        let mut any_activity = false;
        for (address, target, revents) in self.wait_for_readiness(addresses, timeout)? {
            match target {
                PollTarget::Connect => any_activity |= self.complete_connect(&address, context),
                PollTarget::Session => match self.service(&address, revents, context) {
                    Ok(activity) => any_activity |= activity,
                    Err(error) => {
                        self.fail_session(&address, error, context)?;
                        any_activity = true;
                    }
                },
            }
        }

        any_activity |= self.resume_handlers(addresses, context)?;
        Ok(any_activity)
    }

    fn wait_for_readiness(
        &self,
        addresses: &[ServerAddress],
        timeout: Duration,
    ) -> Result<Vec<(ServerAddress, PollTarget, PollFlags)>, ManagerError> {
        let mut polled = Vec::with_capacity(addresses.len() + self.connecting.len());
        let mut fds = Vec::with_capacity(polled.capacity());
        for address in addresses {
            let Some(session) = self.sessions.get(address) else {
                continue;
            };
            let Some(stream) = session.connection.stream() else {
                continue;
            };

            let mut events = PollFlags::POLLIN;
            if session.connection.has_pending_output() {
                events |= PollFlags::POLLOUT;
            }
            polled.push((address.clone(), PollTarget::Session));
            fds.push(PollFd::new(stream.as_fd(), events));
        }

        let mut timeout = timeout;
        for (address, connection) in &self.connecting {
            let Some(stream) = connection.connecting_stream() else {
                continue;
            };
            if let Some(left) = connection.connect_time_left() {
                timeout = timeout.min(left);
            }
            polled.push((address.clone(), PollTarget::Connect));
            fds.push(PollFd::new(stream.as_fd(), PollFlags::POLLOUT));
        }

        if fds.is_empty() {
            return Ok(Vec::new());
        }

        match poll(&mut fds, poll_timeout_for(timeout)) {
            Ok(0) | Err(Errno::EINTR) => return Ok(Vec::new()),
            Ok(_) => {}
            Err(errno) => return Err(ManagerError::Poll(errno)),
        }

        let ready = fds
            .iter()
            .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
            .zip(polled)
            .filter(|(revents, _)| !revents.is_empty())
            .map(|(revents, (address, target))| (address, target, revents))
            .collect();
        Ok(ready)
    }

    fn service(
        &mut self,
        address: &ServerAddress,
        revents: PollFlags,
        context: &mut H::Context,
    ) -> Result<bool, HandlerError> {
        let Some(Session {
            connection,
            handler,
        }) = self.sessions.get_mut(address)
        else {
            return Ok(false);
        };

        let mut activity = false;
        if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
            for packet in connection.drain_and_decode()? {
                if self.logger.enabled(LogLevel::Verbose) {
                    self.logger.log(
                        LogLevel::Verbose,
                        Some(LOG_CONTEXT),
                        "Received command",
                        Some(json!({
                            "address": address.to_string(),
                            "command": packet.command.name(),
                        })),
                    );
                }
                handler.handle_command(packet, connection, context)?;
                activity = true;
            }
        }

        if connection.has_pending_output() {
            activity |= connection.flush_pending()? > 0;
        }

        Ok(activity)
    }

    fn resume_handlers(
        &mut self,
        addresses: &[ServerAddress],
        context: &mut H::Context,
    ) -> Result<bool, ManagerError> {
        let mut any_activity = false;
        for address in addresses {
            let Some(Session {
                connection,
                handler,
            }) = self.sessions.get_mut(address)
            else {
                continue;
            };

            let outcome = handler.resume(connection, context).and_then(|resumed| {
                if connection.has_pending_output() {
                    connection.flush_pending()?;
                }
                Ok(resumed)
            });
            match outcome {
                Ok(resumed) => any_activity |= resumed,
                Err(error) => {
                    self.fail_session(address, error, context)?;
                    any_activity = true;
                }
            }
        }

        Ok(any_activity)
    }

    fn fail_session(
        &mut self,
        address: &ServerAddress,
        error: HandlerError,
        context: &mut H::Context,
    ) -> Result<(), ManagerError> {
        self.logger.warn(
            Some(LOG_CONTEXT),
            &format!("closing connection to {address}: {error}"),
        );
        self.close_connection(address, context);
        self.failed_attempts.insert(address.clone(), Instant::now());

        match error {
            HandlerError::InvariantViolation { message } => Err(ManagerError::InvariantViolation {
                address: address.clone(),
                message,
            }),
            _ => Ok(()),
        }
    }

    /// Closes one session and runs its handler's teardown hook. A connect
    /// still in flight to `address` is abandoned.
    pub fn close_connection(&mut self, address: &ServerAddress, context: &mut H::Context) -> bool {
        if let Some(mut pending) = self.connecting.remove(address) {
            pending.close();
        }
        let Some(mut session) = self.sessions.remove(address) else {
            return false;
        };

        let connection_id = session.connection.id();
        session.connection.close();
        session.handler.on_teardown(connection_id, context);
        true
    }

    /// Closes every session that is live right now.
    pub fn close_all(&mut self, context: &mut H::Context) {
        for (_, mut pending) in self.connecting.drain() {
            pending.close();
        }
        let live = self.sessions.keys().cloned().collect::<Vec<_>>();
        for address in &live {
            self.close_connection(address, context);
        }
        if !live.is_empty() {
            self.logger.info(
                Some(LOG_CONTEXT),
                &format!("closed {} job server connection(s)", live.len()),
            );
        }
    }
}
