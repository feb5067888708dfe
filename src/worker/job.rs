use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::connection::{Connection, ConnectionError, ConnectionId};
use crate::wire::codec::{CommandType, Packet};

/// Outcome of one task callback invocation.
pub type JobResult = Result<Vec<u8>, JobFailure>;

pub type TaskCallback = Arc<dyn Fn(&mut JobContext<'_>) -> JobResult + Send + Sync>;

/// One unit of work assigned by a job server, bound to the connection that
/// delivered it.
#[derive(Clone, Debug)]
pub struct Job {
    connection_id: ConnectionId,
    handle: Vec<u8>,
    task: String,
    unique: String,
    data: Vec<u8>,
    assigned_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        connection_id: ConnectionId,
        handle: impl Into<Vec<u8>>,
        task: impl Into<String>,
        unique: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            connection_id,
            handle: handle.into(),
            task: task.into(),
            unique: unique.into(),
            data,
            assigned_at: Utc::now(),
        }
    }

    /// Builds a job from JOB_ASSIGN or JOB_ASSIGN_UNIQ; any other packet yields `None`.
    pub fn from_assignment(connection_id: ConnectionId, packet: Packet) -> Option<Self> {
        let mut fields = match packet.command {
            CommandType::JobAssign | CommandType::JobAssignUniq => packet.into_fields(),
            _ => return None,
        }
        .into_iter();

        let handle = fields.next()?;
        let task = String::from_utf8_lossy(&fields.next()?).into_owned();
        let (unique, data) = match (fields.next(), fields.next()) {
            (Some(unique), Some(data)) => (String::from_utf8_lossy(&unique).into_owned(), data),
            (Some(data), None) => (String::new(), data),
            _ => return None,
        };

        Some(Self::new(connection_id, handle, task, unique, data))
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// The handle exactly as the server sent it; reports must echo these bytes.
    pub fn handle_bytes(&self) -> &[u8] {
        &self.handle
    }

    /// Printable form of the handle, for logs and messages.
    pub fn handle(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.handle)
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn unique(&self) -> &str {
        &self.unique
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn assigned_at(&self) -> DateTime<Utc> {
        self.assigned_at
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobFailure {
    /// Reported as WORK_FAIL.
    Failed(String),
    /// Reported as WORK_EXCEPTION carrying the data, followed by WORK_FAIL.
    Exception(Vec<u8>),
    UnregisteredTask(String),
    Panicked(String),
}

impl JobFailure {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    pub fn exception_data(&self) -> Option<&[u8]> {
        match self {
            Self::Exception(data) => Some(data),
            _ => None,
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "task failed: {reason}"),
            Self::Exception(data) => {
                write!(f, "task raised: {}", String::from_utf8_lossy(data))
            }
            Self::UnregisteredTask(task) => write!(f, "no callback registered for task '{task}'"),
            Self::Panicked(message) => write!(f, "task panicked: {message}"),
        }
    }
}

impl std::error::Error for JobFailure {}

/// Handed to a task callback while its job executes. Progress reports go out
/// on the connection that assigned the job.
pub struct JobContext<'a> {
    job: &'a Job,
    connection: &'a mut Connection,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(job: &'a Job, connection: &'a mut Connection) -> Self {
        Self { job, connection }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    pub fn data(&self) -> &[u8] {
        self.job.data()
    }

    pub fn send_status(&mut self, numerator: u64, denominator: u64) -> Result<(), ConnectionError> {
        let numerator = numerator.to_string();
        let denominator = denominator.to_string();
        self.connection.enqueue_command(
            CommandType::WorkStatus,
            &[
                self.job.handle_bytes(),
                numerator.as_bytes(),
                denominator.as_bytes(),
            ],
        )
    }

    pub fn send_data(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.connection
            .enqueue_command(CommandType::WorkData, &[self.job.handle_bytes(), data])
    }

    pub fn send_warning(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.connection
            .enqueue_command(CommandType::WorkWarning, &[self.job.handle_bytes(), data])
    }
}
