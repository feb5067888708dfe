pub mod ability;
pub mod handler;
pub mod job;
pub mod lock;

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;

use crate::config::AppConfig;
use crate::connection::{Connection, ConnectionError, ConnectionId, ServerAddress};
use crate::logging::{LogLevel, Logger};
use crate::manager::{ConnectionManager, ManagerError, ManagerSettings};
use crate::wire::codec::{CodecError, CommandType, WireCodec};

pub use ability::{AbilityTable, Advertisement};
pub use handler::{HandlerState, WorkerContext, WorkerHandler};
pub use job::{Job, JobContext, JobFailure, JobResult, TaskCallback};
pub use lock::{JobLock, LockError};

const LOG_CONTEXT: &str = "worker";

#[derive(Debug)]
pub enum WorkerError {
    Config(ConnectionError),
    Codec(CodecError),
    Manager(ManagerError),
    Connection(ConnectionError),
    /// The job's connection is gone; nothing was sent.
    StaleJob {
        handle: String,
        connection_id: ConnectionId,
    },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(source) => write!(f, "invalid worker configuration: {source}"),
            Self::Codec(source) => write!(f, "invalid wire configuration: {source}"),
            Self::Manager(source) => write!(f, "{source}"),
            Self::Connection(source) => write!(f, "{source}"),
            Self::StaleJob {
                handle,
                connection_id,
            } => write!(
                f,
                "job {handle} belongs to connection {connection_id}, which is no longer live"
            ),
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(source) | Self::Connection(source) => Some(source),
            Self::Codec(source) => Some(source),
            Self::Manager(source) => Some(source),
            Self::StaleJob { .. } => None,
        }
    }
}

impl From<ManagerError> for WorkerError {
    fn from(value: ManagerError) -> Self {
        Self::Manager(value)
    }
}

/// Pulls jobs from a set of job servers and runs the registered task
/// callbacks, one job at a time across all servers.
pub struct Worker {
    manager: ConnectionManager<WorkerHandler>,
    context: WorkerContext,
}

impl Worker {
    pub fn new(servers: Vec<ServerAddress>, settings: ManagerSettings, logger: Arc<Logger>) -> Self {
        Self {
            manager: ConnectionManager::new(servers, settings, Arc::clone(&logger)),
            context: WorkerContext::new(logger),
        }
    }

    pub fn from_app_config(app_config: &AppConfig, logger: Arc<Logger>) -> Result<Self, WorkerError> {
        let servers = app_config
            .worker
            .servers
            .iter()
            .map(|server| server.parse::<ServerAddress>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(WorkerError::Config)?;
        let settings = ManagerSettings {
            codec: WireCodec::from_app_config(app_config).map_err(WorkerError::Codec)?,
            connect_timeout: app_config.worker.connect_timeout(),
            reconnect_interval: app_config.worker.reconnect_interval(),
        };

        let mut worker = Self::new(servers, settings, logger);
        if let Some(client_id) = app_config.worker.client_id() {
            worker.set_client_id(client_id);
        }
        Ok(worker)
    }

    pub fn servers(&self) -> &[ServerAddress] {
        self.manager.addresses()
    }

    pub fn abilities(&self) -> &AbilityTable {
        &self.context.abilities
    }

    pub fn client_id(&self) -> Option<&str> {
        self.context.client_id()
    }

    pub fn job_lock_holder(&self) -> Option<ConnectionId> {
        self.context.job_lock.holder()
    }

    pub fn handler_state(&self, server: &ServerAddress) -> Option<HandlerState> {
        self.manager
            .session(server)
            .map(|session| session.handler.state())
    }

    pub fn connection_id(&self, server: &ServerAddress) -> Option<ConnectionId> {
        self.manager
            .session(server)
            .map(|session| session.connection.id())
    }

    /// Registers `callback` for `task`, replacing any previous one, and
    /// re-advertises the ability set on every live connection.
    pub fn register_task<F>(&mut self, task: impl Into<String>, callback: F) -> String
    where
        F: Fn(&mut JobContext<'_>) -> JobResult + Send + Sync + 'static,
    {
        self.register(task.into(), Arc::new(callback), None)
    }

    /// Like [`Worker::register_task`], advertised with CAN_DO_TIMEOUT so the
    /// server gives up on a job after `timeout_seconds`.
    pub fn register_task_with_timeout<F>(
        &mut self,
        task: impl Into<String>,
        callback: F,
        timeout_seconds: u32,
    ) -> String
    where
        F: Fn(&mut JobContext<'_>) -> JobResult + Send + Sync + 'static,
    {
        self.register(task.into(), Arc::new(callback), Some(timeout_seconds))
    }

    fn register(&mut self, task: String, callback: TaskCallback, timeout: Option<u32>) -> String {
        self.context.abilities.insert(task.clone(), callback, timeout);
        self.broadcast_abilities();
        task
    }

    pub fn unregister_task(&mut self, task: &str) -> String {
        if self.context.abilities.remove(task) {
            self.broadcast_abilities();
        }
        task.to_owned()
    }

    pub fn set_client_id(&mut self, client_id: impl Into<String>) {
        let client_id = client_id.into();
        self.context.client_id = Some(client_id.clone());
        self.broadcast(|handler, connection| {
            handler.set_client_id(connection, Some(client_id.clone()))
        });
    }

    fn broadcast_abilities(&mut self) {
        let advertised = self.context.abilities.advertisements();
        self.broadcast(|handler, connection| handler.set_abilities(connection, advertised.clone()));
    }

    /// Applies `update` to every live session and flushes what it enqueued.
    /// Sessions that fail are torn down.
    fn broadcast<F>(&mut self, mut update: F)
    where
        F: FnMut(&mut WorkerHandler, &mut Connection) -> Result<(), ConnectionError>,
    {
        let mut failed = Vec::new();
        for session in self.manager.sessions_mut() {
            let outcome = update(&mut session.handler, &mut session.connection)
                .and_then(|()| session.connection.flush_pending());
            if let Err(error) = outcome {
                failed.push((session.connection.address().clone(), error));
            }
        }

        for (address, error) in failed {
            self.context.logger.warn(
                Some(LOG_CONTEXT),
                &format!("closing connection to {address}: {error}"),
            );
            self.manager.close_connection(&address, &mut self.context);
        }
    }

    /// Starts connecting whatever is not live yet and runs one readiness pass
    /// over the live servers and the connects in flight. When there is
    /// nothing to poll it backs off instead.
    pub fn poll_once(&mut self, poll_timeout: Duration) -> Result<bool, WorkerError> {
        let live = self.manager.live_connections(&mut self.context);
        if live.is_empty() && !self.manager.has_pending_connects() {
            let backoff = self.manager.settings().reconnect_interval.min(poll_timeout);
            self.context.logger.debug(
                Some(LOG_CONTEXT),
                &format!("no job server reachable, retrying in {} ms", backoff.as_millis()),
            );
            thread::sleep(backoff);
            return Ok(false);
        }

        Ok(self
            .manager
            .poll_once(&live, poll_timeout, &mut self.context)?)
    }

    /// Runs poll passes until `keep_working` returns `false`. The predicate
    /// receives whether the last pass saw any activity. Every connection
    /// still open when the loop ends is closed.
    pub fn work<P>(&mut self, poll_timeout: Duration, mut keep_working: P) -> Result<(), WorkerError>
    where
        P: FnMut(bool) -> bool,
    {
        self.context.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Worker loop started",
            Some(json!({
                "servers": self.manager.addresses().iter().map(ToString::to_string).collect::<Vec<_>>(),
                "tasks": self.context.abilities.task_names(),
                "poll_timeout_ms": poll_timeout.as_millis() as u64,
            })),
        );

        let outcome = loop {
            let activity = match self.poll_once(poll_timeout) {
                Ok(activity) => activity,
                Err(error) => break Err(error),
            };
            if !keep_working(activity) {
                break Ok(());
            }
        };

        self.shutdown();
        match &outcome {
            Ok(()) => self.context.logger.info(Some(LOG_CONTEXT), "Worker loop stopped"),
            Err(error) => self
                .context
                .logger
                .error(Some(LOG_CONTEXT), &format!("Worker loop aborted: {error}")),
        }
        outcome
    }

    pub fn close_connection(&mut self, server: &ServerAddress) -> bool {
        self.manager.close_connection(server, &mut self.context)
    }

    pub fn shutdown(&mut self) {
        self.manager.close_all(&mut self.context);
    }

    pub fn send_job_status(&mut self, job: &Job, numerator: u64, denominator: u64) -> Result<(), WorkerError> {
        let numerator = numerator.to_string();
        let denominator = denominator.to_string();
        self.send_for_job(job, |connection| {
            connection.enqueue_command(
                CommandType::WorkStatus,
                &[job.handle_bytes(), numerator.as_bytes(), denominator.as_bytes()],
            )
        })
    }

    pub fn send_job_complete(&mut self, job: &Job, data: &[u8]) -> Result<(), WorkerError> {
        self.send_for_job(job, |connection| {
            connection.enqueue_command(CommandType::WorkComplete, &[job.handle_bytes(), data])
        })
    }

    pub fn send_job_failure(&mut self, job: &Job) -> Result<(), WorkerError> {
        self.send_for_job(job, |connection| {
            connection.enqueue_command(CommandType::WorkFail, &[job.handle_bytes()])
        })
    }

    /// WORK_EXCEPTION carrying `data`, followed by WORK_FAIL.
    pub fn send_job_exception(&mut self, job: &Job, data: &[u8]) -> Result<(), WorkerError> {
        self.send_for_job(job, |connection| {
            connection.enqueue_command(CommandType::WorkException, &[job.handle_bytes(), data])?;
            connection.enqueue_command(CommandType::WorkFail, &[job.handle_bytes()])
        })
    }

    pub fn send_job_data(&mut self, job: &Job, data: &[u8]) -> Result<(), WorkerError> {
        self.send_for_job(job, |connection| {
            connection.enqueue_command(CommandType::WorkData, &[job.handle_bytes(), data])
        })
    }

    pub fn send_job_warning(&mut self, job: &Job, data: &[u8]) -> Result<(), WorkerError> {
        self.send_for_job(job, |connection| {
            connection.enqueue_command(CommandType::WorkWarning, &[job.handle_bytes(), data])
        })
    }

    fn send_for_job<F>(&mut self, job: &Job, enqueue: F) -> Result<(), WorkerError>
    where
        F: FnOnce(&mut Connection) -> Result<(), ConnectionError>,
    {
        let Some(session) = self.manager.session_by_id_mut(job.connection_id()) else {
            let error = WorkerError::StaleJob {
                handle: job.handle().into_owned(),
                connection_id: job.connection_id(),
            };
            self.context.logger.warn(Some(LOG_CONTEXT), &error.to_string());
            return Err(error);
        };

        let connection = &mut session.connection;
        let outcome = enqueue(&mut *connection).and_then(|()| connection.flush_pending());
        if let Err(error) = outcome {
            let address = connection.address().clone();
            self.context.logger.warn(
                Some(LOG_CONTEXT),
                &format!("closing connection to {address}: {error}"),
            );
            self.manager.close_connection(&address, &mut self.context);
            return Err(WorkerError::Connection(error));
        }
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use crate::config::AppConfig;
    use crate::logging::testing::{MemorySink, memory_logger};
    use crate::logging::LogLevel;
    use crate::manager::ManagerSettings;
    use crate::wire::codec::CommandType;
    use crate::wire::fake_server::{FakeJobServer, FakePeer, StalledListener};

    use super::{HandlerState, Job, JobFailure, Worker, WorkerError};

    const PASS: Duration = Duration::from_millis(200);

    fn worker_for(servers: &[&FakeJobServer]) -> (Worker, Arc<MemorySink>) {
        let (logger, sink) = memory_logger(LogLevel::Debug);
        let settings = ManagerSettings {
            reconnect_interval: Duration::from_millis(50),
            ..ManagerSettings::default()
        };
        let worker = Worker::new(
            servers.iter().map(|server| server.address()).collect(),
            settings,
            logger,
        );
        (worker, sink)
    }

    fn pump(worker: &mut Worker) {
        for _ in 0..3 {
            worker.poll_once(PASS).expect("poll pass should succeed");
        }
    }

    fn connect(worker: &mut Worker, server: &FakeJobServer) -> FakePeer {
        worker.poll_once(PASS).expect("poll pass should succeed");
        let mut peer = server.accept();
        pump(worker);
        peer.recv_until(CommandType::GrabJobUniq);
        peer
    }

    #[test]
    fn builds_from_app_config() {
        let mut config = AppConfig::load_defaults_with_args(Vec::new()).expect("defaults load");
        config.worker.servers = vec!["jobs-a".to_owned(), "jobs-b:4731".to_owned()];
        config.worker.client_id = "indexer".to_owned();
        let (logger, _sink) = memory_logger(LogLevel::Error);

        let worker = Worker::from_app_config(&config, logger).expect("worker should build");
        let servers = worker.servers().iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(servers, vec!["jobs-a:4730".to_owned(), "jobs-b:4731".to_owned()]);
        assert_eq!(worker.client_id(), Some("indexer"));
    }

    #[test]
    fn invalid_server_address_is_a_config_error() {
        let mut config = AppConfig::load_defaults_with_args(Vec::new()).expect("defaults load");
        config.worker.servers = vec!["jobs:notaport".to_owned()];
        let (logger, _sink) = memory_logger(LogLevel::Error);

        assert!(matches!(
            Worker::from_app_config(&config, logger),
            Err(WorkerError::Config(_))
        ));
    }

    #[test]
    fn registering_after_connect_rebroadcasts_abilities() {
        let server = FakeJobServer::bind();
        let (mut worker, _sink) = worker_for(&[&server]);
        worker.register_task("echo", |job| Ok(job.data().to_vec()));
        let mut peer = connect(&mut worker, &server);

        worker.register_task_with_timeout("resize", |_job| Ok(Vec::new()), 45);
        let sent = peer.recv_until(CommandType::CanDoTimeout);
        let commands = sent.iter().map(|packet| packet.command).collect::<Vec<_>>();
        assert_eq!(
            commands,
            vec![
                CommandType::ResetAbilities,
                CommandType::CanDo,
                CommandType::CanDoTimeout
            ]
        );
        assert_eq!(sent[2].fields, vec![b"resize".to_vec(), b"45".to_vec()]);

        assert_eq!(worker.unregister_task("echo"), "echo");
        let sent = peer.recv_until(CommandType::CanDoTimeout);
        assert_eq!(sent.len(), 2);
        assert_eq!(
            worker.handler_state(&server.address()),
            Some(HandlerState::AwaitingAssignment)
        );
    }

    #[test]
    fn echo_task_round_trip_through_the_work_loop() {
        let server = FakeJobServer::bind();
        let (mut worker, _sink) = worker_for(&[&server]);
        worker.register_task("echo", |job| Ok(job.data().to_vec()));
        worker.register_task("fail", |_job| Err(JobFailure::failed("requested")));
        let mut peer = connect(&mut worker, &server);

        peer.send(CommandType::JobAssignUniq, &[b"H:1", b"echo", b"", b"tea"]);
        pump(&mut worker);
        let sent = peer.recv_until(CommandType::GrabJobUniq);
        assert_eq!(sent[0].command, CommandType::WorkComplete);
        assert_eq!(sent[0].fields, vec![b"H:1".to_vec(), b"tea".to_vec()]);

        peer.send(CommandType::JobAssign, &[b"H:2", b"fail", b"bar"]);
        pump(&mut worker);
        let sent = peer.recv_until(CommandType::GrabJobUniq);
        assert!(sent.iter().all(|packet| packet.command != CommandType::WorkComplete));
        assert_eq!(sent[0].command, CommandType::WorkFail);
        assert_eq!(worker.job_lock_holder(), None);
    }

    #[test]
    fn jobs_from_several_servers_never_overlap() {
        let first = FakeJobServer::bind();
        let second = FakeJobServer::bind();
        let (mut worker, _sink) = worker_for(&[&first, &second]);

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (task_running, task_peak) = (Arc::clone(&running), Arc::clone(&peak));
        worker.register_task("count", move |_job| {
            let now = task_running.fetch_add(1, Ordering::SeqCst) + 1;
            task_peak.fetch_max(now, Ordering::SeqCst);
            task_running.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        });

        worker.poll_once(PASS).expect("poll pass should succeed");
        let mut peers = vec![first.accept(), second.accept()];
        pump(&mut worker);
        for peer in &mut peers {
            peer.recv_until(CommandType::GrabJobUniq);
            peer.send(CommandType::JobAssign, &[b"H:x", b"count", b""]);
        }
        pump(&mut worker);

        for peer in &mut peers {
            let sent = peer.recv_until(CommandType::GrabJobUniq);
            assert_eq!(sent[0].command, CommandType::WorkComplete);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(worker.job_lock_holder(), None);
    }

    #[test]
    fn losing_the_lock_holder_lets_a_parked_job_run() {
        let first = FakeJobServer::bind();
        let second = FakeJobServer::bind();
        let (mut worker, sink) = worker_for(&[&first, &second]);
        worker.register_task("echo", |job| Ok(job.data().to_vec()));

        worker.poll_once(PASS).expect("poll pass should succeed");
        let mut first_peer = first.accept();
        let mut second_peer = second.accept();
        pump(&mut worker);
        first_peer.recv_until(CommandType::GrabJobUniq);
        second_peer.recv_until(CommandType::GrabJobUniq);

        let first_id = worker
            .connection_id(&first.address())
            .expect("first server should be live");
        assert!(worker.context.job_lock.try_acquire(first_id));

        second_peer.send(CommandType::JobAssign, &[b"H:2", b"echo", b"queued"]);
        pump(&mut worker);
        assert_eq!(worker.job_lock_holder(), Some(first_id));

        drop(first_peer);
        pump(&mut worker);

        let sent = second_peer.recv_until(CommandType::GrabJobUniq);
        assert_eq!(sent[0].command, CommandType::WorkComplete);
        assert_eq!(sent[0].field(1), b"queued");
        assert_eq!(worker.job_lock_holder(), None);
        assert!(sink.contains("released job lock held by closed connection"));
    }

    #[test]
    fn reports_against_closed_connection_are_stale() {
        let server = FakeJobServer::bind();
        let (mut worker, sink) = worker_for(&[&server]);
        let mut peer = connect(&mut worker, &server);

        let connection_id = worker
            .connection_id(&server.address())
            .expect("server should be live");
        let job = Job::new(connection_id, "H:live", "echo", "", Vec::new());
        worker.send_job_status(&job, 3, 10).expect("live job report");
        worker.send_job_exception(&job, b"trace").expect("live job report");

        let sent = peer.recv_until(CommandType::WorkFail);
        assert_eq!(sent[0].fields, vec![b"H:live".to_vec(), b"3".to_vec(), b"10".to_vec()]);
        assert_eq!(sent[1].command, CommandType::WorkException);

        assert!(worker.close_connection(&server.address()));
        let error = worker
            .send_job_complete(&job, b"late")
            .expect_err("connection is gone");
        assert!(matches!(error, WorkerError::StaleJob { .. }));
        assert!(sink.contains("no longer live"));
    }

    #[test]
    fn reports_echo_the_raw_job_handle() {
        let server = FakeJobServer::bind();
        let (mut worker, _sink) = worker_for(&[&server]);
        let mut peer = connect(&mut worker, &server);

        let connection_id = worker
            .connection_id(&server.address())
            .expect("server should be live");
        let job = Job::new(connection_id, b"H:\xff\x01".to_vec(), "echo", "", Vec::new());
        worker.send_job_data(&job, b"chunk").expect("live job report");
        worker.send_job_failure(&job).expect("live job report");

        let sent = peer.recv_until(CommandType::WorkFail);
        assert_eq!(sent[0].fields, vec![b"H:\xff\x01".to_vec(), b"chunk".to_vec()]);
        assert_eq!(sent[1].field(0), b"H:\xff\x01");
    }

    #[test]
    fn server_dropping_syns_does_not_stall_poll_passes() {
        let healthy = FakeJobServer::bind();
        let stalled = StalledListener::bind();
        let (logger, _sink) = memory_logger(LogLevel::Debug);
        let mut worker = Worker::new(
            vec![healthy.address(), stalled.address()],
            ManagerSettings {
                connect_timeout: Duration::from_secs(2),
                reconnect_interval: Duration::from_millis(100),
                ..ManagerSettings::default()
            },
            logger,
        );
        worker.register_task("echo", |job| Ok(job.data().to_vec()));

        for _ in 0..5 {
            let started = Instant::now();
            worker
                .poll_once(Duration::from_millis(10))
                .expect("poll pass should succeed");
            assert!(
                started.elapsed() < Duration::from_millis(500),
                "poll pass blocked for {:?}",
                started.elapsed()
            );
        }

        let mut peer = healthy.accept();
        assert_eq!(peer.recv_until(CommandType::GrabJobUniq).len(), 3);
        assert_eq!(
            worker.handler_state(&healthy.address()),
            Some(HandlerState::AwaitingAssignment)
        );
        assert_eq!(worker.handler_state(&stalled.address()), None);
    }

    #[test]
    fn work_loop_stops_on_predicate_and_closes_everything() {
        let server = FakeJobServer::bind();
        let (mut worker, sink) = worker_for(&[&server]);
        worker.register_task("echo", |job| Ok(job.data().to_vec()));

        let mut passes = 0;
        worker
            .work(Duration::from_millis(20), |_activity| {
                passes += 1;
                passes < 3
            })
            .expect("loop should stop cleanly");

        let mut peer = server.accept();
        assert_eq!(passes, 3);
        assert_eq!(worker.handler_state(&server.address()), None);
        assert!(peer.is_closed_by_worker());
        assert!(sink.contains("Worker loop stopped"));
    }
}
