//! Session Orchestrator (C7).
//!
//! Owns one session's lifecycle end to end: the state machine transitions
//! validated by [`SessionState::can_transition_to`], the cancellation flag
//! the executor polls, the human-in-the-loop rendezvous when the executor
//! escalates, file snapshotting ahead of destructive tool calls, and
//! rollback when a snapshot needs to be restored. Mirrors `client.rs`'s
//! `interrupted: Arc<AtomicBool>` pattern for cancellation, generalized to
//! a full multi-state session instead of a single in-flight stream.

use crate::config::RuntimeConfig;
use crate::error::{Result, SessionError};
use crate::executor::{CancelSignal, RvrbExecutor, SessionRunOutcome, TerminationReason};
use crate::types::{Conversation, Message, SessionId, SessionState, Snapshot};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

/// A question the executor escalated to a human, and the channel its
/// answer arrives on.
pub struct HitlRequest {
    pub question: String,
    pub reply: oneshot::Sender<HitlResponse>,
}

#[derive(Debug, Clone)]
pub enum HitlResponse {
    Approved(String),
    Denied,
}

/// Background task handle the session keeps alive for its own lifetime
/// (e.g. a periodic memory extraction pass). Held only so its `JoinHandle`
/// gets aborted when the session drops; the orchestrator never inspects
/// its output.
struct BackgroundTask {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One session's state machine, cancellation flag, snapshot stack, and
/// background work — the unit the transport layer (C8) drives turns
/// through and the RVR-B executor (C6) runs inside of.
pub struct Session {
    id: SessionId,
    state: Mutex<SessionState>,
    conversation: Mutex<Conversation>,
    cancel: CancelSignal,
    snapshots: Mutex<Vec<Snapshot>>,
    background_tasks: Mutex<Vec<BackgroundTask>>,
    config: Arc<RuntimeConfig>,
}

impl Session {
    pub fn new(id: SessionId, config: Arc<RuntimeConfig>) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState::Idle),
            conversation: Mutex::new(Conversation::new()),
            cancel: CancelSignal::new(),
            snapshots: Mutex::new(Vec::new()),
            background_tasks: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// Attempt a state transition, validating it against the state
    /// machine rather than assigning directly, so a bad caller can never
    /// put the session in an illegal state.
    async fn transition(&self, next: SessionState) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.can_transition_to(next) {
            return Err(SessionError::StateInvalid(format!("cannot transition from {state:?} to {next:?}")).into());
        }
        *state = next;
        Ok(())
    }

    pub async fn push_message(&self, message: Message) {
        self.conversation.lock().await.push(message);
    }

    pub async fn history_snapshot(&self) -> Vec<Message> {
        self.conversation.lock().await.messages.clone()
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Capture a snapshot before a destructive tool call, pushing it onto
    /// the rollback stack. The caller supplies already-read file contents;
    /// this type stays free of I/O (see [`Snapshot::restore_plan`]).
    pub async fn push_snapshot(&self, snapshot: Snapshot) {
        self.snapshots.lock().await.push(snapshot);
    }

    /// Pop the most recent snapshot and return its restore plan, or
    /// `None` if nothing has been captured this session.
    pub async fn pop_snapshot_for_rollback(&self) -> Option<Vec<(std::path::PathBuf, Vec<u8>)>> {
        let mut snapshots = self.snapshots.lock().await;
        snapshots.pop().map(|snapshot| {
            snapshot
                .restore_plan()
                .into_iter()
                .map(|(path, content)| (path.to_path_buf(), content.to_vec()))
                .collect()
        })
    }

    /// Register a background task whose lifetime is tied to the session
    /// (aborted on drop). Used for things like periodic playbook
    /// extraction that shouldn't block a turn's critical path.
    pub async fn spawn_background<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.background_tasks.lock().await.push(BackgroundTask { handle });
    }

    /// Run the executor for one session-level interaction: transitions to
    /// `Running`, drives the RVR-B loop, and settles into a terminal state
    /// (or `WaitingHitl`) based on the executor's outcome.
    pub async fn run_turn(&self, executor: &RvrbExecutor, allowed_tools: Option<&HashSet<String>>) -> Result<SessionRunOutcome> {
        self.transition(SessionState::Running).await?;

        let mut history = self.history_snapshot().await;
        let agent_id = self.id.to_string();
        let outcome = executor.run(&agent_id, &mut history, &self.cancel, allowed_tools).await;
        self.conversation.lock().await.messages = history;

        self.transition(outcome.state).await?;
        Ok(outcome)
    }

    /// Wait for a human's answer to an escalated question, bounded by
    /// `RuntimeConfig`'s `hitl_timeout`. Times out to `HitlResponse::Denied`
    /// rather than blocking the session forever on an absent operator.
    pub async fn await_hitl(&self, request_tx: &tokio::sync::mpsc::Sender<HitlRequest>, question: impl Into<String>) -> HitlResponse {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = HitlRequest { question: question.into(), reply: reply_tx };

        if request_tx.send(request).await.is_err() {
            return HitlResponse::Denied;
        }

        match tokio::time::timeout(self.config.thresholds.hitl_timeout, reply_rx).await {
            Ok(Ok(response)) => response,
            _ => HitlResponse::Denied,
        }
    }
}

/// Interprets a finished run's [`TerminationReason`] for the orchestrator
/// layer above sessions (e.g. the transport), separating "this session is
/// done" from "this session needs another turn after a HITL answer".
pub fn needs_further_turns(reason: TerminationReason) -> bool {
    matches!(reason, TerminationReason::Escalated)
}

/// Process-wide table of live sessions, keyed by [`SessionId`] — the third
/// process-wide mutable handle alongside the capability registry and the
/// provider router's health table. The transport layer and background
/// tasks look a session up here rather than the session holding a
/// back-reference to its transport connection, breaking what would
/// otherwise be a session/transport reference cycle.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.clone())
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Shared handle to a [`SessionRegistry`], passed explicitly to whatever
/// needs to address sessions by id rather than reached for implicitly.
pub type SharedSessionRegistry = Arc<SessionRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn test_session() -> Session {
        Session::new(SessionId::new(), Arc::new(RuntimeConfig::default()))
    }

    #[tokio::test]
    async fn new_session_starts_idle() {
        let session = test_session();
        assert_eq!(session.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn transition_to_running_succeeds_from_idle() {
        let session = test_session();
        session.transition(SessionState::Running).await.unwrap();
        assert_eq!(session.state().await, SessionState::Running);
    }

    #[tokio::test]
    async fn transition_directly_to_completed_from_idle_is_rejected() {
        let session = test_session();
        let result = session.transition(SessionState::Completed).await;
        assert!(result.is_err());
        assert_eq!(session.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn cancel_signal_is_observed_across_clones() {
        let session = test_session();
        let signal = session.cancel_signal();
        session.request_stop();
        assert!(signal.is_set());
    }

    #[tokio::test]
    async fn snapshot_push_and_pop_round_trips_restore_plan() {
        let session = test_session();
        let mut snapshot = Snapshot::new();
        snapshot.capture("/tmp/a.txt", b"hello".to_vec());
        session.push_snapshot(snapshot).await;

        let restore = session.pop_snapshot_for_rollback().await.unwrap();
        assert_eq!(restore.len(), 1);
        assert_eq!(restore[0].1, b"hello".to_vec());

        assert!(session.pop_snapshot_for_rollback().await.is_none());
    }

    #[tokio::test]
    async fn hitl_request_without_responder_times_out_to_denied() {
        let session = test_session();
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);

        let session_ref = &session;
        let wait = session_ref.await_hitl(&tx, "proceed with deploy?");
        let drain = async {
            let _ = rx.recv().await;
        };

        let (response, _) = tokio::join!(wait, drain);
        assert!(matches!(response, HitlResponse::Denied));
    }

    #[test]
    fn escalated_outcome_needs_further_turns() {
        assert!(needs_further_turns(TerminationReason::Escalated));
        assert!(!needs_further_turns(TerminationReason::EndTurn));
    }

    #[test]
    fn registry_inserts_looks_up_and_removes_by_id() {
        let registry = SessionRegistry::new();
        let session = Arc::new(test_session());
        let id = session.id();
        registry.insert(session);

        assert_eq!(registry.len(), 1);
        assert!(registry.get(id).is_some());
        assert!(registry.get(SessionId::new()).is_none());

        let removed = registry.remove(id);
        assert!(removed.is_some());
        assert!(registry.is_empty());
    }
}
