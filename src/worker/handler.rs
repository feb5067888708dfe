use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::json;

use crate::connection::{Connection, ConnectionError, ConnectionId};
use crate::logging::{LogLevel, Logger};
use crate::manager::{CommandHandler, HandlerError};
use crate::utils::timing::measure_job;
use crate::wire::codec::{CommandType, Packet};

use super::ability::{AbilityTable, Advertisement};
use super::job::{Job, JobContext, JobFailure, JobResult};
use super::lock::JobLock;

const LOG_CONTEXT: &str = "worker::handler";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    Sleeping,
    AwaitingAssignment,
    Executing,
}

impl HandlerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Sleeping => "sleeping",
            Self::AwaitingAssignment => "awaiting assignment",
            Self::Executing => "executing",
        }
    }
}

/// State shared by every handler of one worker: the registered abilities,
/// the client id, and the job lock.
pub struct WorkerContext {
    pub(crate) abilities: AbilityTable,
    pub(crate) client_id: Option<String>,
    pub(crate) job_lock: JobLock,
    pub(crate) logger: Arc<Logger>,
}

impl WorkerContext {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self {
            abilities: AbilityTable::new(),
            client_id: None,
            job_lock: JobLock::new(),
            logger,
        }
    }

    pub fn abilities(&self) -> &AbilityTable {
        &self.abilities
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn job_lock(&self) -> &JobLock {
        &self.job_lock
    }
}

/// Worker side of the protocol for one job server connection.
///
/// After connecting it advertises its abilities and asks for work. A NO_JOB
/// answer puts it to sleep until the server sends NOOP. An assignment runs
/// only while the handler holds the worker's [`JobLock`]; when the lock is
/// busy the assignment is parked and retried from [`CommandHandler::resume`].
#[derive(Debug)]
pub struct WorkerHandler {
    connection_id: ConnectionId,
    state: HandlerState,
    abilities: Vec<Advertisement>,
    client_id: Option<String>,
    pending_job: Option<Job>,
}

impl WorkerHandler {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn abilities(&self) -> &[Advertisement] {
        &self.abilities
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn pending_job(&self) -> Option<&Job> {
        self.pending_job.as_ref()
    }

    /// Replaces the advertised set with a full reset followed by one CAN_DO
    /// per ability. The protocol state is left untouched.
    pub fn set_abilities(
        &mut self,
        connection: &mut Connection,
        abilities: Vec<Advertisement>,
    ) -> Result<(), ConnectionError> {
        self.abilities = abilities;
        connection.enqueue_command(CommandType::ResetAbilities, &[])?;
        for ability in &self.abilities {
            match ability.timeout {
                Some(timeout) => connection.enqueue_command(
                    CommandType::CanDoTimeout,
                    &[ability.task.as_bytes(), timeout.to_string().as_bytes()],
                )?,
                None => connection.enqueue_command(CommandType::CanDo, &[ability.task.as_bytes()])?,
            }
        }
        Ok(())
    }

    pub fn set_client_id(
        &mut self,
        connection: &mut Connection,
        client_id: Option<String>,
    ) -> Result<(), ConnectionError> {
        self.client_id = client_id;
        if let Some(client_id) = &self.client_id {
            connection.enqueue_command(CommandType::SetClientId, &[client_id.as_bytes()])?;
        }
        Ok(())
    }

    fn request_job(&mut self, connection: &mut Connection) -> Result<(), HandlerError> {
        connection.enqueue_command(CommandType::GrabJobUniq, &[])?;
        self.state = HandlerState::AwaitingAssignment;
        Ok(())
    }

    fn sleep(&mut self, connection: &mut Connection) -> Result<(), HandlerError> {
        connection.enqueue_command(CommandType::PreSleep, &[])?;
        self.state = HandlerState::Sleeping;
        Ok(())
    }

    fn unexpected(&self, command: CommandType) -> HandlerError {
        HandlerError::UnexpectedCommand {
            command,
            state: self.state.as_str(),
        }
    }

    fn recv_noop(&mut self, connection: &mut Connection) -> Result<(), HandlerError> {
        match self.state {
            HandlerState::Idle | HandlerState::Sleeping => self.request_job(connection),
            // a wake-up racing our own GRAB_JOB; the answer is already on its way
            HandlerState::AwaitingAssignment | HandlerState::Executing => Ok(()),
        }
    }

    fn recv_no_job(&mut self, connection: &mut Connection) -> Result<(), HandlerError> {
        if self.state != HandlerState::AwaitingAssignment || self.pending_job.is_some() {
            return Err(self.unexpected(CommandType::NoJob));
        }
        self.sleep(connection)
    }

    fn recv_job_assign(
        &mut self,
        packet: Packet,
        connection: &mut Connection,
        context: &mut WorkerContext,
    ) -> Result<(), HandlerError> {
        let command = packet.command;
        if self.state != HandlerState::AwaitingAssignment || self.pending_job.is_some() {
            return Err(self.unexpected(command));
        }
        let job = Job::from_assignment(self.connection_id, packet)
            .ok_or_else(|| self.unexpected(command))?;

        context.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Job assigned",
            Some(json!({
                "server": connection.address().to_string(),
                "handle": job.handle(),
                "task": job.task(),
                "unique": job.unique(),
                "data_bytes": job.data().len(),
            })),
        );

        if !context.job_lock.try_acquire(self.connection_id) {
            context.logger.debug(
                Some(LOG_CONTEXT),
                &format!(
                    "job lock busy, parking job {} until it frees up",
                    job.handle()
                ),
            );
            self.pending_job = Some(job);
            return Ok(());
        }

        self.run_job(job, connection, context)
    }

    fn run_job(
        &mut self,
        job: Job,
        connection: &mut Connection,
        context: &mut WorkerContext,
    ) -> Result<(), HandlerError> {
        if !context.job_lock.is_held_by(self.connection_id) {
            return Err(HandlerError::InvariantViolation {
                message: format!(
                    "connection {} tried to execute {} without the job lock",
                    self.connection_id,
                    job.handle()
                ),
            });
        }

        self.state = HandlerState::Executing;
        let outcome = execute(&job, connection, context);
        let reported = report_outcome(&job, outcome, connection, &context.logger);

        let released = context.job_lock.release(self.connection_id);
        self.state = HandlerState::Idle;
        released.map_err(|error| HandlerError::InvariantViolation {
            message: error.to_string(),
        })?;
        reported?;

        self.request_job(connection)
    }
}

/// The single point where a callback's result, error or panic becomes a
/// [`JobResult`].
fn execute(job: &Job, connection: &mut Connection, context: &WorkerContext) -> JobResult {
    let Some(callback) = context.abilities.callback(job.task()) else {
        return Err(JobFailure::UnregisteredTask(job.task().to_owned()));
    };

    let mut job_context = JobContext::new(job, connection);
    measure_job(job, Some(LOG_CONTEXT), &context.logger, || {
        catch_unwind(AssertUnwindSafe(|| callback(&mut job_context)))
            .unwrap_or_else(|payload| Err(JobFailure::Panicked(panic_message(payload.as_ref()))))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

fn report_outcome(
    job: &Job,
    outcome: JobResult,
    connection: &mut Connection,
    logger: &Logger,
) -> Result<(), ConnectionError> {
    let handle = job.handle_bytes();
    match outcome {
        Ok(data) => match connection
            .enqueue_command(CommandType::WorkComplete, &[handle, data.as_slice()])
        {
            Err(ConnectionError::Codec { source, .. }) => {
                logger.error(
                    Some(LOG_CONTEXT),
                    &format!(
                        "result of job {} cannot be framed ({source}), reporting failure instead",
                        job.handle()
                    ),
                );
                connection.enqueue_command(CommandType::WorkFail, &[handle])
            }
            reported => {
                logger.log(
                    LogLevel::Info,
                    Some(LOG_CONTEXT),
                    "Job completed",
                    Some(json!({
                        "handle": job.handle(),
                        "task": job.task(),
                        "result_bytes": data.len(),
                    })),
                );
                reported
            }
        },
        Err(failure) => {
            logger.log(
                LogLevel::Warn,
                Some(LOG_CONTEXT),
                "Job failed",
                Some(json!({
                    "handle": job.handle(),
                    "task": job.task(),
                    "reason": failure.to_string(),
                })),
            );
            if let Some(data) = failure.exception_data() {
                connection.enqueue_command(CommandType::WorkException, &[handle, data])?;
            }
            connection.enqueue_command(CommandType::WorkFail, &[handle])
        }
    }
}

impl CommandHandler for WorkerHandler {
    type Context = WorkerContext;

    fn create(connection_id: ConnectionId, context: &WorkerContext) -> Self {
        Self {
            connection_id,
            state: HandlerState::Idle,
            abilities: context.abilities.advertisements(),
            client_id: context.client_id.clone(),
            pending_job: None,
        }
    }

    fn on_connected(
        &mut self,
        connection: &mut Connection,
        _context: &mut WorkerContext,
    ) -> Result<(), HandlerError> {
        let client_id = self.client_id.take();
        self.set_client_id(connection, client_id)?;
        let abilities = std::mem::take(&mut self.abilities);
        self.set_abilities(connection, abilities)?;
        self.request_job(connection)
    }

    fn handle_command(
        &mut self,
        packet: Packet,
        connection: &mut Connection,
        context: &mut WorkerContext,
    ) -> Result<(), HandlerError> {
        match packet.command {
            CommandType::Noop => self.recv_noop(connection),
            CommandType::NoJob => self.recv_no_job(connection),
            CommandType::JobAssign | CommandType::JobAssignUniq => {
                self.recv_job_assign(packet, connection, context)
            }
            CommandType::EchoRes | CommandType::OptionRes => {
                context.logger.debug(
                    Some(LOG_CONTEXT),
                    &format!(
                        "{} from {}: {}",
                        packet.command,
                        connection.address(),
                        packet.field_str(0)
                    ),
                );
                Ok(())
            }
            CommandType::Error => Err(HandlerError::ServerError {
                code: packet.field_str(0).into_owned(),
                text: packet.field_str(1).into_owned(),
            }),
            command => Err(self.unexpected(command)),
        }
    }

    fn resume(
        &mut self,
        connection: &mut Connection,
        context: &mut WorkerContext,
    ) -> Result<bool, HandlerError> {
        let Some(job) = self.pending_job.take() else {
            return Ok(false);
        };
        if !context.job_lock.try_acquire(self.connection_id) {
            self.pending_job = Some(job);
            return Ok(false);
        }

        self.run_job(job, connection, context)?;
        Ok(true)
    }

    fn on_teardown(&mut self, connection_id: ConnectionId, context: &mut WorkerContext) {
        if context.job_lock.force_release(connection_id) {
            context.logger.warn(
                Some(LOG_CONTEXT),
                &format!("released job lock held by closed connection {connection_id}"),
            );
        }
        if let Some(job) = self.pending_job.take() {
            context.logger.warn(
                Some(LOG_CONTEXT),
                &format!(
                    "dropping parked job {} from closed connection {connection_id}",
                    job.handle()
                ),
            );
        }
        self.state = HandlerState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::connection::Connection;
    use crate::logging::LogLevel;
    use crate::logging::testing::{MemorySink, memory_logger};
    use crate::manager::{CommandHandler, HandlerError};
    use crate::wire::codec::{CommandType, Magic, Packet, WireCodec};
    use crate::wire::fake_server::{FakeJobServer, FakePeer};
    use crate::worker::job::{JobContext, JobFailure, JobResult, TaskCallback};

    use super::{HandlerState, WorkerContext, WorkerHandler};

    const CONNECTION_ID: u64 = 1;

    struct Harness {
        _server: FakeJobServer,
        peer: FakePeer,
        connection: Connection,
        context: WorkerContext,
        handler: WorkerHandler,
        sink: Arc<MemorySink>,
    }

    impl Harness {
        fn new(tasks: &[(&str, TaskCallback, Option<u32>)], client_id: Option<&str>) -> Self {
            let server = FakeJobServer::bind();
            let mut connection = Connection::new(
                CONNECTION_ID,
                server.address(),
                WireCodec::default(),
                Duration::from_secs(1),
            );
            connection.connect().expect("connection should open");
            let peer = server.accept();

            let (logger, sink) = memory_logger(LogLevel::Debug);
            let mut context = WorkerContext::new(logger);
            for (task, callback, timeout) in tasks {
                context.abilities.insert(*task, Arc::clone(callback), *timeout);
            }
            context.client_id = client_id.map(str::to_owned);

            let mut handler = WorkerHandler::create(CONNECTION_ID, &context);
            handler
                .on_connected(&mut connection, &mut context)
                .expect("handshake should enqueue");

            let mut harness = Self {
                _server: server,
                peer,
                connection,
                context,
                handler,
                sink,
            };
            harness.flush();
            harness
        }

        fn flush(&mut self) {
            while self.connection.has_pending_output() {
                self.connection.flush_pending().expect("flush should succeed");
            }
        }

        fn deliver(&mut self, command: CommandType, fields: &[&[u8]]) -> Result<(), HandlerError> {
            let packet = Packet {
                magic: Magic::Response,
                command,
                fields: fields.iter().map(|field| field.to_vec()).collect(),
            };
            let outcome = self
                .handler
                .handle_command(packet, &mut self.connection, &mut self.context);
            self.flush();
            outcome
        }

        fn sent_until(&mut self, command: CommandType) -> Vec<Packet> {
            self.peer.recv_until(command)
        }
    }

    fn callback(
        run: impl Fn(&mut JobContext<'_>) -> JobResult + Send + Sync + 'static,
    ) -> TaskCallback {
        Arc::new(run)
    }

    fn echo() -> TaskCallback {
        callback(|job| Ok(job.data().to_vec()))
    }

    fn commands(packets: &[Packet]) -> Vec<CommandType> {
        packets.iter().map(|packet| packet.command).collect()
    }

    #[test]
    fn handshake_announces_client_id_abilities_and_grabs() {
        let mut harness = Harness::new(
            &[("echo", echo(), None), ("sleep", echo(), Some(30))],
            Some("indexer-1"),
        );

        let sent = harness.sent_until(CommandType::GrabJobUniq);
        assert_eq!(
            commands(&sent),
            vec![
                CommandType::SetClientId,
                CommandType::ResetAbilities,
                CommandType::CanDo,
                CommandType::CanDoTimeout,
                CommandType::GrabJobUniq,
            ]
        );
        assert_eq!(sent[0].field(0), b"indexer-1");
        assert_eq!(sent[2].field(0), b"echo");
        assert_eq!(sent[3].fields, vec![b"sleep".to_vec(), b"30".to_vec()]);
        assert_eq!(harness.handler.state(), HandlerState::AwaitingAssignment);
    }

    #[test]
    fn no_job_sleeps_and_noop_wakes() {
        let mut harness = Harness::new(&[("echo", echo(), None)], None);
        harness.sent_until(CommandType::GrabJobUniq);

        harness.deliver(CommandType::NoJob, &[]).expect("no_job is valid");
        assert_eq!(harness.handler.state(), HandlerState::Sleeping);
        assert_eq!(harness.peer.recv().command, CommandType::PreSleep);

        harness.deliver(CommandType::Noop, &[]).expect("noop is valid");
        assert_eq!(harness.handler.state(), HandlerState::AwaitingAssignment);
        assert_eq!(harness.peer.recv().command, CommandType::GrabJobUniq);
    }

    #[test]
    fn echo_job_reports_completion_with_result() {
        let mut harness = Harness::new(&[("echo", echo(), None)], None);
        harness.sent_until(CommandType::GrabJobUniq);

        harness
            .deliver(CommandType::JobAssignUniq, &[b"H:lap:1", b"echo", b"u-1", b"tea"])
            .expect("assignment should run");

        let sent = harness.sent_until(CommandType::GrabJobUniq);
        assert_eq!(
            commands(&sent),
            vec![CommandType::WorkComplete, CommandType::GrabJobUniq]
        );
        assert_eq!(sent[0].fields, vec![b"H:lap:1".to_vec(), b"tea".to_vec()]);
        assert_eq!(harness.context.job_lock.holder(), None);
        assert_eq!(harness.handler.state(), HandlerState::AwaitingAssignment);
        assert!(harness.sink.contains("Job completed"));
    }

    #[test]
    fn reports_echo_a_non_utf8_handle_unchanged() {
        let mut harness = Harness::new(
            &[
                ("echo", echo(), None),
                ("fail", callback(|_job| Err(JobFailure::failed("boom"))), None),
            ],
            None,
        );
        harness.sent_until(CommandType::GrabJobUniq);

        harness
            .deliver(CommandType::JobAssign, &[b"H:\xff\x01", b"echo", b"tea"])
            .expect("assignment should run");
        let sent = harness.sent_until(CommandType::GrabJobUniq);
        assert_eq!(sent[0].command, CommandType::WorkComplete);
        assert_eq!(sent[0].field(0), b"H:\xff\x01");

        harness
            .deliver(CommandType::JobAssign, &[b"H:\xfe", b"fail", b""])
            .expect("failure is reported, not raised");
        let sent = harness.sent_until(CommandType::GrabJobUniq);
        assert_eq!(sent[0].command, CommandType::WorkFail);
        assert_eq!(sent[0].field(0), b"H:\xfe");
    }

    #[test]
    fn failing_job_reports_failure_only_and_frees_lock() {
        let mut harness = Harness::new(
            &[("fail", callback(|_job| Err(JobFailure::failed("boom"))), None)],
            None,
        );
        harness.sent_until(CommandType::GrabJobUniq);

        harness
            .deliver(CommandType::JobAssign, &[b"H:lap:2", b"fail", b"bar"])
            .expect("failure is reported, not raised");

        let sent = harness.sent_until(CommandType::GrabJobUniq);
        assert_eq!(commands(&sent), vec![CommandType::WorkFail, CommandType::GrabJobUniq]);
        assert_eq!(sent[0].field(0), b"H:lap:2");
        assert!(harness.context.job_lock.try_acquire(2));
    }

    #[test]
    fn exception_is_reported_before_failure() {
        let mut harness = Harness::new(
            &[(
                "raise",
                callback(|_job| Err(JobFailure::Exception(b"ValueError".to_vec()))),
                None,
            )],
            None,
        );
        harness.sent_until(CommandType::GrabJobUniq);

        harness
            .deliver(CommandType::JobAssign, &[b"H:3", b"raise", b""])
            .expect("exception is reported, not raised");

        let sent = harness.sent_until(CommandType::GrabJobUniq);
        assert_eq!(
            commands(&sent),
            vec![
                CommandType::WorkException,
                CommandType::WorkFail,
                CommandType::GrabJobUniq
            ]
        );
        assert_eq!(sent[0].field(1), b"ValueError");
    }

    #[test]
    fn panicking_callback_becomes_failure_report() {
        let mut harness = Harness::new(
            &[("explode", callback(|_job| panic!("callback exploded")), None)],
            None,
        );
        harness.sent_until(CommandType::GrabJobUniq);

        harness
            .deliver(CommandType::JobAssign, &[b"H:4", b"explode", b""])
            .expect("panic must not escape the handler");

        let sent = harness.sent_until(CommandType::GrabJobUniq);
        assert_eq!(commands(&sent), vec![CommandType::WorkFail, CommandType::GrabJobUniq]);
        assert_eq!(harness.context.job_lock.holder(), None);
        assert!(harness.sink.contains("callback exploded"));
    }

    #[test]
    fn unregistered_task_fails_explicitly() {
        let mut harness = Harness::new(&[("echo", echo(), None)], None);
        harness.sent_until(CommandType::GrabJobUniq);

        harness
            .deliver(CommandType::JobAssign, &[b"H:5", b"resize", b""])
            .expect("unknown task is reported as failure");

        let sent = harness.sent_until(CommandType::GrabJobUniq);
        assert_eq!(commands(&sent), vec![CommandType::WorkFail, CommandType::GrabJobUniq]);
        assert!(harness.sink.contains("no callback registered for task 'resize'"));
    }

    #[test]
    fn progress_reports_precede_completion() {
        let mut harness = Harness::new(
            &[(
                "report",
                callback(|job| {
                    job.send_status(1, 2).expect("status should enqueue");
                    job.send_data(b"partial").expect("data should enqueue");
                    job.send_warning(b"slow disk").expect("warning should enqueue");
                    Ok(b"done".to_vec())
                }),
                None,
            )],
            None,
        );
        harness.sent_until(CommandType::GrabJobUniq);

        harness
            .deliver(CommandType::JobAssign, &[b"H:6", b"report", b""])
            .expect("assignment should run");

        let sent = harness.sent_until(CommandType::GrabJobUniq);
        assert_eq!(
            commands(&sent),
            vec![
                CommandType::WorkStatus,
                CommandType::WorkData,
                CommandType::WorkWarning,
                CommandType::WorkComplete,
                CommandType::GrabJobUniq,
            ]
        );
        assert_eq!(
            sent[0].fields,
            vec![b"H:6".to_vec(), b"1".to_vec(), b"2".to_vec()]
        );
    }

    #[test]
    fn busy_lock_parks_assignment_until_resume() {
        let mut harness = Harness::new(&[("echo", echo(), None)], None);
        harness.sent_until(CommandType::GrabJobUniq);
        assert!(harness.context.job_lock.try_acquire(99));

        harness
            .deliver(CommandType::JobAssign, &[b"H:7", b"echo", b"tea"])
            .expect("contention is not an error");
        assert_eq!(
            harness.handler.pending_job().map(|job| job.handle_bytes()),
            Some(&b"H:7"[..])
        );
        assert_eq!(harness.handler.state(), HandlerState::AwaitingAssignment);

        let resumed = harness
            .handler
            .resume(&mut harness.connection, &mut harness.context)
            .expect("resume should not fail");
        assert!(!resumed);

        harness.context.job_lock.release(99).expect("test holder releases");
        let resumed = harness
            .handler
            .resume(&mut harness.connection, &mut harness.context)
            .expect("resume should run the parked job");
        harness.flush();

        assert!(resumed);
        let sent = harness.sent_until(CommandType::GrabJobUniq);
        assert_eq!(sent[0].command, CommandType::WorkComplete);
        assert_eq!(sent[0].field(1), b"tea");
        assert!(harness.handler.pending_job().is_none());
    }

    #[test]
    fn assignment_while_sleeping_is_unexpected() {
        let mut harness = Harness::new(&[("echo", echo(), None)], None);
        harness.deliver(CommandType::NoJob, &[]).expect("no_job is valid");

        let error = harness
            .deliver(CommandType::JobAssign, &[b"H:8", b"echo", b""])
            .expect_err("sleeping handlers do not take jobs");
        assert!(matches!(
            error,
            HandlerError::UnexpectedCommand {
                command: CommandType::JobAssign,
                state: "sleeping"
            }
        ));

        let error = harness
            .deliver(CommandType::NoJob, &[])
            .expect_err("no_job while sleeping is unexpected");
        assert!(matches!(error, HandlerError::UnexpectedCommand { .. }));
    }

    #[test]
    fn server_error_and_client_side_replies_are_fatal() {
        let mut harness = Harness::new(&[], None);

        let error = harness
            .deliver(CommandType::Error, &[b"ERR_QUEUE", b"queue full"])
            .expect_err("server errors close the connection");
        assert!(matches!(error, HandlerError::ServerError { ref code, .. } if code == "ERR_QUEUE"));

        let error = harness
            .deliver(CommandType::JobCreated, &[b"H:9"])
            .expect_err("job_created is not for workers");
        assert!(matches!(error, HandlerError::UnexpectedCommand { .. }));

        harness
            .deliver(CommandType::EchoRes, &[b"ping"])
            .expect("echo replies are ignored");
    }

    #[test]
    fn teardown_releases_lock_held_by_this_connection() {
        let mut harness = Harness::new(&[("echo", echo(), None)], None);
        assert!(harness.context.job_lock.try_acquire(CONNECTION_ID));

        harness
            .handler
            .on_teardown(CONNECTION_ID, &mut harness.context);

        assert_eq!(harness.context.job_lock.holder(), None);
        assert!(harness.sink.contains("released job lock held by closed connection 1"));
    }

    #[test]
    fn ability_rebroadcast_keeps_protocol_state() {
        let mut harness = Harness::new(&[("echo", echo(), None)], None);
        harness.sent_until(CommandType::GrabJobUniq);
        harness.deliver(CommandType::NoJob, &[]).expect("no_job is valid");
        harness.peer.recv();

        harness.context.abilities.insert("resize", echo(), None);
        let advertised = harness.context.abilities.advertisements();
        harness
            .handler
            .set_abilities(&mut harness.connection, advertised)
            .expect("rebroadcast should enqueue");
        harness.flush();

        let sent = harness.sent_until(CommandType::CanDo);
        assert_eq!(sent[0].command, CommandType::ResetAbilities);
        assert_eq!(sent[1].field(0), b"echo");
        assert_eq!(harness.peer.recv().field(0), b"resize");
        assert_eq!(harness.handler.state(), HandlerState::Sleeping);
    }
}
