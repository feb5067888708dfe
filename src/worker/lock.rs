use std::fmt;

use crate::connection::ConnectionId;

#[derive(Debug, PartialEq, Eq)]
pub enum LockError {
    NotHolder {
        requester: ConnectionId,
        holder: Option<ConnectionId>,
    },
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotHolder { requester, holder } => match holder {
                Some(holder) => write!(
                    f,
                    "connection {requester} released the job lock held by connection {holder}"
                ),
                None => write!(
                    f,
                    "connection {requester} released the job lock while nobody held it"
                ),
            },
        }
    }
}

impl std::error::Error for LockError {}

/// Process-wide permission to execute a job. At most one connection holds it.
#[derive(Debug, Default)]
pub struct JobLock {
    holder: Option<ConnectionId>,
}

impl JobLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self) -> Option<ConnectionId> {
        self.holder
    }

    pub fn is_held_by(&self, connection_id: ConnectionId) -> bool {
        self.holder == Some(connection_id)
    }

    /// Contention is a normal outcome and reported as `false`.
    pub fn try_acquire(&mut self, connection_id: ConnectionId) -> bool {
        if self.holder.is_some() {
            return false;
        }

        self.holder = Some(connection_id);
        true
    }

    pub fn release(&mut self, connection_id: ConnectionId) -> Result<(), LockError> {
        if self.holder != Some(connection_id) {
            return Err(LockError::NotHolder {
                requester: connection_id,
                holder: self.holder,
            });
        }

        self.holder = None;
        Ok(())
    }

    /// Used when the holder's connection is torn down. Returns whether the
    /// lock was actually held by `connection_id`.
    pub fn force_release(&mut self, connection_id: ConnectionId) -> bool {
        if self.holder != Some(connection_id) {
            return false;
        }

        self.holder = None;
        true
    }
}
