//! Registry of running and finished scan sessions, keyed by id.
//!
//! Many sessions may run at once. Each has exactly one writer: the
//! [`SessionWriter`] handed out by [`SessionRegistry::register`]. Readers only
//! ever see snapshots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatch::{PhaseEnd, ProgressSink, ResultSink};
use crate::types::ProbeOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Completed,
    Cancelled,
    TimedOut,
    Failed,
}

impl From<PhaseEnd> for SessionState {
    fn from(end: PhaseEnd) -> Self {
        match end {
            PhaseEnd::Completed => SessionState::Completed,
            PhaseEnd::Cancelled => SessionState::Cancelled,
            PhaseEnd::TimedOut => SessionState::TimedOut,
            PhaseEnd::Aborted => SessionState::Failed,
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: Uuid,
    pub description: String,
    pub state: SessionState,
    pub completed: usize,
    pub total: usize,
    pub recorded: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
struct Progress {
    state: SessionState,
    completed: usize,
    total: usize,
    error: Option<String>,
    results: Vec<ProbeOutcome>,
}

#[derive(Debug)]
struct Entry {
    id: Uuid,
    description: String,
    cancel: CancellationToken,
    progress: Mutex<Progress>,
}

impl Entry {
    fn lock(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> SessionStatus {
        let p = self.lock();
        SessionStatus {
            id: self.id,
            description: self.description.clone(),
            state: p.state,
            completed: p.completed,
            total: p.total,
            recorded: p.results.len(),
            error: p.error.clone(),
        }
    }
}

/// The only handle allowed to mutate a registered session.
#[derive(Debug)]
pub struct SessionWriter {
    entry: Arc<Entry>,
}

impl SessionWriter {
    pub fn id(&self) -> Uuid {
        self.entry.id
    }

    /// Cancellation token shared with the registry's `cancel`.
    pub fn cancel_token(&self) -> CancellationToken {
        self.entry.cancel.clone()
    }

    /// Record how the session ended. Later calls overwrite earlier ones.
    pub fn finish(&self, end: PhaseEnd, error: Option<String>) {
        let mut p = self.entry.lock();
        p.state = end.into();
        p.error = error;
    }

    pub fn fail(&self, error: impl Into<String>) {
        self.finish(PhaseEnd::Aborted, Some(error.into()));
    }
}

impl ResultSink for SessionWriter {
    fn accept(&self, outcome: &ProbeOutcome) {
        self.entry.lock().results.push(outcome.clone());
    }
}

impl ProgressSink for SessionWriter {
    fn progress(&self, completed: usize, total: usize, _description: &str) {
        let mut p = self.entry.lock();
        p.completed = completed;
        p.total = total;
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Entry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a running session under a fresh id and return its single writer.
    pub fn register(&self, description: impl Into<String>, cancel: CancellationToken) -> SessionWriter {
        let entry = Arc::new(Entry {
            id: Uuid::new_v4(),
            description: description.into(),
            cancel,
            progress: Mutex::new(Progress {
                state: SessionState::Running,
                completed: 0,
                total: 0,
                error: None,
                results: Vec::new(),
            }),
        });
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.id, Arc::clone(&entry));
        SessionWriter { entry }
    }

    fn get(&self, id: &Uuid) -> Option<Arc<Entry>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn status(&self, id: &Uuid) -> Option<SessionStatus> {
        self.get(id).map(|e| e.status())
    }

    /// Outcomes recorded so far, ordered by unit.
    pub fn results(&self, id: &Uuid) -> Option<Vec<ProbeOutcome>> {
        self.get(id).map(|e| {
            let mut results = e.lock().results.clone();
            results.sort_by_key(|o| o.unit);
            results
        })
    }

    /// Request cancellation. Returns `false` for an unknown id.
    pub fn cancel(&self, id: &Uuid) -> bool {
        match self.get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<SessionStatus> {
        let entries: Vec<Arc<Entry>> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut statuses: Vec<SessionStatus> = entries.iter().map(|e| e.status()).collect();
        statuses.sort_by_key(|s| s.id);
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PortState, Protocol, ScanUnit};
    use std::net::{IpAddr, Ipv4Addr};

    fn outcome(port: u16) -> ProbeOutcome {
        ProbeOutcome::new(
            ScanUnit::service(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            Protocol::Tcp,
            PortState::Open,
        )
    }

    #[test]
    fn writer_updates_are_visible_to_readers() {
        let registry = SessionRegistry::new();
        let writer = registry.register("scan 127.0.0.1", CancellationToken::new());
        let id = writer.id();

        writer.progress(1, 2, "port scan 127.0.0.1:443");
        writer.accept(&outcome(443));
        writer.accept(&outcome(22));

        let status = registry.status(&id).unwrap();
        assert_eq!(status.state, SessionState::Running);
        assert_eq!((status.completed, status.total, status.recorded), (1, 2, 2));
        let ports: Vec<_> = registry.results(&id).unwrap().iter().filter_map(|o| o.unit.port()).collect();
        assert_eq!(ports, vec![22, 443]);

        writer.finish(PhaseEnd::Completed, None);
        assert_eq!(registry.status(&id).unwrap().state, SessionState::Completed);
    }

    #[test]
    fn cancel_reaches_the_sessions_token() {
        let registry = SessionRegistry::new();
        let token = CancellationToken::new();
        let writer = registry.register("a", token.clone());
        let other = registry.register("b", CancellationToken::new());
        assert!(registry.cancel(&writer.id()));
        assert!(token.is_cancelled());
        assert!(!other.cancel_token().is_cancelled());
        assert!(!registry.cancel(&Uuid::new_v4()));
    }

    #[test]
    fn concurrent_sessions_are_listed() {
        let registry = SessionRegistry::new();
        let a = registry.register("a", CancellationToken::new());
        let b = registry.register("b", CancellationToken::new());
        b.fail("permission denied");
        let list = registry.list();
        assert_eq!(list.len(), 2);
        let failed = list.iter().find(|s| s.id == b.id()).unwrap();
        assert_eq!(failed.state, SessionState::Failed);
        assert_eq!(failed.error.as_deref(), Some("permission denied"));
        assert!(list.iter().any(|s| s.id == a.id() && s.state == SessionState::Running));
        assert!(registry.status(&Uuid::new_v4()).is_none());
    }
}
