// Manages in-flight generations and their cancellation by session id

use dashmap::DashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

const ACTIVE: u8 = 0;
const CANCELLED: u8 = 1;
const COMPLETED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Active,
    Cancelled,
    Completed,
}

struct HandleInner {
    token: CancellationToken,
    state: AtomicU8,
}

/// Owns the lifecycle of one backend call.
///
/// Clones share the same generation. Two handles are equal only if they were
/// cloned from the same original, so a stale handle never matches a newer
/// registration under the same session id.
#[derive(Clone)]
pub struct CancellationHandle {
    inner: Arc<HandleInner>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                token: CancellationToken::new(),
                state: AtomicU8::new(ACTIVE),
            }),
        }
    }

    pub fn state(&self) -> GenerationState {
        match self.inner.state.load(Ordering::Acquire) {
            ACTIVE => GenerationState::Active,
            CANCELLED => GenerationState::Cancelled,
            _ => GenerationState::Completed,
        }
    }

    /// Requests cancellation. Returns `true` only for the call that moved the
    /// handle out of `Active`.
    pub fn cancel(&self) -> bool {
        let moved = self
            .inner
            .state
            .compare_exchange(ACTIVE, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            self.inner.token.cancel();
        }
        moved
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Resolves once cancellation is requested; not tied to `self`'s lifetime.
    pub fn cancelled_owned(&self) -> WaitForCancellationFutureOwned {
        self.inner.token.clone().cancelled_owned()
    }

    /// Enters the terminal state. Returns `true` exactly once per generation.
    pub fn complete(&self) -> bool {
        self.inner.state.swap(COMPLETED, Ordering::AcqRel) != COMPLETED
    }

    pub fn same_as(&self, other: &CancellationHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for CancellationHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for CancellationHandle {}

impl std::fmt::Debug for CancellationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Process-wide table of the active generation per session id.
///
/// Every operation locks only the shard holding the key, which makes `put`,
/// `cancel` and `remove_if_current` atomic with respect to each other per key.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, CancellationHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle`, overwriting any entry for `session_id`. The
    /// replaced handle is returned; it keeps running but is no longer
    /// reachable by id.
    pub fn put(&self, session_id: &str, handle: CancellationHandle) -> Option<CancellationHandle> {
        self.sessions.insert(session_id.to_string(), handle)
    }

    pub fn get(&self, session_id: &str) -> Option<CancellationHandle> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    /// Compare-and-delete: removes the entry only while it still points at
    /// `handle`.
    pub fn remove_if_current(&self, session_id: &str, handle: &CancellationHandle) -> bool {
        self.sessions
            .remove_if(session_id, |_, current| current.same_as(handle))
            .is_some()
    }

    /// Cancels the generation registered under `session_id`, if any.
    ///
    /// Returns `true` when a handle was found and this call cancelled it. A
    /// generation that already completed yields `false`.
    pub fn cancel(&self, session_id: &str) -> bool {
        // Clone out first so the shard lock is not held while cancelling.
        let Some(handle) = self.get(session_id) else {
            return false;
        };
        let cancelled = handle.cancel();
        self.remove_if_current(session_id, &handle);
        cancelled
    }

    /// Cancels every registered generation; used on shutdown.
    pub fn cancel_all(&self) -> usize {
        let session_ids: Vec<String> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        session_ids
            .iter()
            .filter(|session_id| self.cancel(session_id))
            .count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
