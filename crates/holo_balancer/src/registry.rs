//! Request bookkeeping: the worker-owned registry, its shared read-only view,
//! and the caller-facing deferred response.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::command::{CommandInfo, RemoteReply};
use crate::error::SchedulerError;
use crate::types::RequestId;

/// Lifecycle of one request. `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Pending,
    LockAcquiring,
    Submitted,
    Completed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Cancelled)
    }
}

pub(crate) type RequestOutcome = Result<RemoteReply, SchedulerError>;
pub(crate) type Completion = oneshot::Sender<RequestOutcome>;

pub(crate) struct RequestEntry {
    pub command: CommandInfo,
    /// Exactly the document that was persisted; this is what gets sent.
    pub remote_command: Value,
    pub state: RequestState,
    /// `None` for requests replayed from the command log: nobody is waiting.
    pub completion: Option<Completion>,
}

impl RequestEntry {
    pub fn recovered(&self) -> bool {
        self.completion.is_none()
    }
}

/// Shared, read-only projection of live request states.
///
/// Entries disappear once the request reaches a terminal state.
#[derive(Clone, Default)]
pub struct RegistryView {
    states: Arc<RwLock<HashMap<RequestId, RequestState>>>,
}

impl RegistryView {
    pub fn state(&self, request_id: RequestId) -> Option<RequestState> {
        self.states.read().unwrap().get(&request_id).copied()
    }

    pub fn len(&self) -> usize {
        self.states.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn set(&self, request_id: RequestId, state: RequestState) {
        let mut states = self.states.write().unwrap();
        if state.is_terminal() {
            states.remove(&request_id);
        } else {
            states.insert(request_id, state);
        }
    }

    pub(crate) fn clear(&self) {
        self.states.write().unwrap().clear();
    }
}

/// Live requests, owned and mutated by the dispatch worker only.
pub(crate) struct RequestRegistry {
    entries: HashMap<RequestId, RequestEntry>,
    view: RegistryView,
}

impl RequestRegistry {
    pub fn new(view: RegistryView) -> Self {
        Self {
            entries: HashMap::new(),
            view,
        }
    }

    pub fn admit(
        &mut self,
        request_id: RequestId,
        command: CommandInfo,
        remote_command: Value,
        completion: Option<Completion>,
    ) {
        self.entries.insert(
            request_id,
            RequestEntry {
                command,
                remote_command,
                state: RequestState::Pending,
                completion,
            },
        );
        self.view.set(request_id, RequestState::Pending);
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.entries.contains_key(&request_id)
    }

    pub fn get(&self, request_id: RequestId) -> Option<&RequestEntry> {
        self.entries.get(&request_id)
    }

    pub fn set_state(&mut self, request_id: RequestId, state: RequestState) {
        if let Some(entry) = self.entries.get_mut(&request_id) {
            entry.state = state;
            self.view.set(request_id, state);
        }
    }

    /// Remove the request and deliver its outcome. Returns the removed entry's
    /// command, or `None` if the request was already resolved.
    pub fn resolve(
        &mut self,
        request_id: RequestId,
        state: RequestState,
        outcome: RequestOutcome,
    ) -> Option<CommandInfo> {
        debug_assert!(state.is_terminal());
        let entry = self.entries.remove(&request_id)?;
        self.view.set(request_id, state);
        if let Some(completion) = entry.completion {
            // The caller may have dropped its handle.
            let _ = completion.send(outcome);
        }
        Some(entry.command)
    }

    pub fn ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Handle to the eventual result of one scheduler request.
///
/// Resolves exactly once. If the scheduler goes away without answering, the
/// request is reported as cancelled.
#[must_use = "a deferred response does nothing unless awaited"]
pub struct DeferredResponse<T> {
    request_id: RequestId,
    rx: oneshot::Receiver<RequestOutcome>,
    parse: fn(RemoteReply) -> Result<T, SchedulerError>,
}

impl<T> DeferredResponse<T> {
    pub(crate) fn new(
        request_id: RequestId,
        rx: oneshot::Receiver<RequestOutcome>,
        parse: fn(RemoteReply) -> Result<T, SchedulerError>,
    ) -> Self {
        Self {
            request_id,
            rx,
            parse,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

impl<T> Future for DeferredResponse<T> {
    type Output = Result<T, SchedulerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome.and_then(this.parse)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SchedulerError::Cancelled)),
        }
    }
}

impl<T> std::fmt::Debug for DeferredResponse<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredResponse")
            .field("request_id", &self.request_id)
            .finish()
    }
}
