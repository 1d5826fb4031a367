//! Explicitly owned session storage for session-style capabilities.
//!
//! A [`SessionStore`] hands out opaque [`SessionHandle`]s. Each session keeps
//! an ordered list of text entries until it is closed. Stores are plain values:
//! callers create one, share it (typically behind an `Arc`) with the
//! capabilities that need it, and drop it when done. Handles from one store
//! mean nothing to another.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Opaque identifier for an open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "session-{}", self.0)
    }
}

impl FromStr for SessionHandle {
    type Err = SessionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        trimmed
            .strip_prefix("session-")
            .unwrap_or(trimmed)
            .parse::<u64>()
            .map(SessionHandle)
            .map_err(|_| SessionError::InvalidHandle(value.to_string()))
    }
}

/// Errors raised by [`SessionStore`] operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("{0} is not open")]
    NotFound(SessionHandle),
    #[error("'{0}' is not a session handle")]
    InvalidHandle(String),
    #[error("session store lock poisoned")]
    Poisoned,
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub handle: SessionHandle,
    pub label: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub entries: Vec<String>,
}

#[derive(Debug)]
struct SessionEntry {
    label: Option<String>,
    opened_at: DateTime<Utc>,
    entries: Vec<String>,
}

#[derive(Debug, Default)]
struct SessionTable {
    next_id: u64,
    sessions: BTreeMap<SessionHandle, SessionEntry>,
}

/// Table of open sessions keyed by handle.
#[derive(Debug, Default)]
pub struct SessionStore {
    table: Mutex<SessionTable>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new, empty session.
    pub fn open(&self, label: Option<String>) -> Result<SessionHandle, SessionError> {
        let mut table = self.table.lock().map_err(|_| SessionError::Poisoned)?;
        table.next_id += 1;
        let handle = SessionHandle(table.next_id);
        table.sessions.insert(
            handle,
            SessionEntry {
                label,
                opened_at: Utc::now(),
                entries: Vec::new(),
            },
        );
        debug!(session = %handle, "session opened");
        Ok(handle)
    }

    /// Appends one entry and returns the new entry count.
    pub fn append(&self, handle: SessionHandle, entry: impl Into<String>) -> Result<usize, SessionError> {
        let mut table = self.table.lock().map_err(|_| SessionError::Poisoned)?;
        let session = table.sessions.get_mut(&handle).ok_or(SessionError::NotFound(handle))?;
        session.entries.push(entry.into());
        Ok(session.entries.len())
    }

    /// Returns a snapshot of an open session.
    pub fn read(&self, handle: SessionHandle) -> Result<SessionSnapshot, SessionError> {
        let table = self.table.lock().map_err(|_| SessionError::Poisoned)?;
        let session = table.sessions.get(&handle).ok_or(SessionError::NotFound(handle))?;
        Ok(SessionSnapshot {
            handle,
            label: session.label.clone(),
            opened_at: session.opened_at,
            entries: session.entries.clone(),
        })
    }

    /// Closes a session and returns its final entries.
    pub fn close(&self, handle: SessionHandle) -> Result<Vec<String>, SessionError> {
        let mut table = self.table.lock().map_err(|_| SessionError::Poisoned)?;
        let session = table.sessions.remove(&handle).ok_or(SessionError::NotFound(handle))?;
        debug!(session = %handle, entries = session.entries.len(), "session closed");
        Ok(session.entries)
    }

    pub fn is_open(&self, handle: SessionHandle) -> bool {
        self.table
            .lock()
            .map(|table| table.sessions.contains_key(&handle))
            .unwrap_or(false)
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.table.lock().map(|table| table.sessions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
