//! Correlation of in-flight requests with their eventual responses.
//!
//! A [`CorrelationRegistry`] maps an identifier to the continuation of the
//! caller waiting on it. Responses may arrive in any order; each one completes
//! exactly the caller that registered its id, exactly once.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::RpcError;

type Completion<T> = Result<T, RpcError>;

/// Acquire a mutex guard, ignoring poisoning.
///
/// Every mutex in Conduit guards state with no invariants spanning entries; a
/// panic elsewhere can at worst leave one continuation unresolved.
pub fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A request waiting for its response.
struct PendingRequest<T> {
    sender: oneshot::Sender<Completion<T>>,
    created_at: Instant,
}

struct State<K, T> {
    pending: HashMap<K, PendingRequest<T>>,
    closed: bool,
}

/// The caller's side of a registered request.
///
/// Pass it to [`CorrelationRegistry::wait`] to suspend until the request is
/// resolved, rejected, or times out.
pub struct PendingHandle<T> {
    receiver: oneshot::Receiver<Completion<T>>,
}

/// Removes a pending request when dropped, unless disarmed.
///
/// Hold one from [`CorrelationRegistry::register`] until
/// [`CorrelationRegistry::wait`] returns: if the caller's future is dropped at
/// any suspension point in between, its entry leaves the registry with it.
pub struct PendingGuard<'a, K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    registry: &'a CorrelationRegistry<K, T>,
    id: Option<K>,
}

impl<K, T> PendingGuard<'_, K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    /// Keep the entry; the request has completed or is owned elsewhere.
    pub fn disarm(mut self) {
        self.id = None;
    }
}

impl<K, T> Drop for PendingGuard<'_, K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if self.registry.cancel(&id) {
                tracing::debug!("request {id} abandoned by its caller");
            }
        }
    }
}

/// Maps correlation ids to pending continuations.
///
/// One registry is owned per transport instance; it is never global.
pub struct CorrelationRegistry<K, T> {
    state: Mutex<State<K, T>>,
}

impl<K, T> Default for CorrelationRegistry<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> CorrelationRegistry<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pending: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Register a new pending request.
    ///
    /// Fails with [`RpcError::DuplicateRequestId`] if `id` is still pending,
    /// and with [`RpcError::TransportClosed`] once the registry is closed.
    pub fn register(&self, id: K) -> Result<PendingHandle<T>, RpcError> {
        let mut state = lock_ignore_poison(&self.state);
        if state.closed {
            return Err(RpcError::TransportClosed);
        }
        if state.pending.contains_key(&id) {
            return Err(RpcError::DuplicateRequestId(id.to_string()));
        }
        let (sender, receiver) = oneshot::channel();
        state.pending.insert(
            id,
            PendingRequest {
                sender,
                created_at: Instant::now(),
            },
        );
        Ok(PendingHandle { receiver })
    }

    /// A guard that cancels `id` when dropped. See [`PendingGuard`].
    pub fn guard(&self, id: K) -> PendingGuard<'_, K, T> {
        PendingGuard {
            registry: self,
            id: Some(id),
        }
    }

    /// Complete a pending request successfully.
    ///
    /// Returns `false` (and drops `value`) if no request is pending under `id`.
    pub fn resolve(&self, id: &K, value: T) -> bool {
        self.complete(id, Ok(value))
    }

    /// Complete a pending request with an error.
    ///
    /// Returns `false` if no request is pending under `id`.
    pub fn reject(&self, id: &K, error: RpcError) -> bool {
        self.complete(id, Err(error))
    }

    fn complete(&self, id: &K, outcome: Completion<T>) -> bool {
        let entry = lock_ignore_poison(&self.state).pending.remove(id);
        match entry {
            Some(pending) => {
                tracing::trace!(
                    "request {id} completed after {:?}",
                    pending.created_at.elapsed()
                );
                // The receiver may already be gone if the caller was dropped.
                let _ = pending.sender.send(outcome);
                true
            }
            None => {
                tracing::debug!("dropping completion for unknown request id {id}");
                false
            }
        }
    }

    /// Remove a pending request without completing it.
    pub fn cancel(&self, id: &K) -> bool {
        lock_ignore_poison(&self.state).pending.remove(id).is_some()
    }

    /// Reject every pending request and refuse new registrations.
    ///
    /// Returns how many requests were rejected.
    pub fn close<F>(&self, mut reason: F) -> usize
    where
        F: FnMut() -> RpcError,
    {
        let drained: Vec<_> = {
            let mut state = lock_ignore_poison(&self.state);
            state.closed = true;
            state.pending.drain().collect()
        };
        let count = drained.len();
        for (_, pending) in drained {
            let _ = pending.sender.send(Err(reason()));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        lock_ignore_poison(&self.state).closed
    }

    pub fn contains(&self, id: &K) -> bool {
        lock_ignore_poison(&self.state).pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.state).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Suspend until the request registered under `id` completes.
    ///
    /// On timeout the request is removed from the registry and the caller
    /// gets [`RpcError::Timeout`]; a late response is then silently dropped.
    pub async fn wait(
        &self,
        id: &K,
        handle: PendingHandle<T>,
        timeout: Option<Duration>,
    ) -> Result<T, RpcError> {
        let outcome = match timeout {
            Some(duration) => match tokio::time::timeout(duration, handle.receiver).await {
                Ok(received) => received,
                Err(_) => {
                    self.cancel(id);
                    return Err(RpcError::Timeout {
                        timeout_ms: duration.as_millis() as u64,
                    });
                }
            },
            None => handle.receiver.await,
        };
        // A dropped sender means the entry vanished without completion.
        outcome.unwrap_or(Err(RpcError::TransportClosed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Registry = CorrelationRegistry<u64, String>;

    #[tokio::test]
    async fn register_and_resolve() {
        let registry = Registry::new();
        let handle = registry.register(1).unwrap();
        assert_eq!(registry.len(), 1);

        assert!(registry.resolve(&1, "done".into()));
        assert!(registry.is_empty());

        let value = registry.wait(&1, handle, None).await.unwrap();
        assert_eq!(value, "done");
    }

    #[tokio::test]
    async fn out_of_order_resolution_reaches_the_right_caller() {
        let registry = Registry::new();
        let a = registry.register(1).unwrap();
        let b = registry.register(2).unwrap();

        registry.resolve(&2, "B".into());
        registry.resolve(&1, "A".into());

        assert_eq!(registry.wait(&1, a, None).await.unwrap(), "A");
        assert_eq!(registry.wait(&2, b, None).await.unwrap(), "B");
    }

    #[test]
    fn duplicate_id_fails_fast() {
        let registry = Registry::new();
        let _first = registry.register(7).unwrap();
        match registry.register(7) {
            Err(RpcError::DuplicateRequestId(id)) => assert_eq!(id, "7"),
            Err(other) => panic!("Expected DuplicateRequestId, got: {other:?}"),
            Ok(_) => panic!("Expected error, got Ok"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn id_is_reusable_after_completion() {
        let registry = Registry::new();
        let _first = registry.register(3).unwrap();
        registry.resolve(&3, "x".into());
        assert!(registry.register(3).is_ok());
    }

    #[test]
    fn unknown_id_is_a_no_op() {
        let registry = Registry::new();
        let _pending = registry.register(1).unwrap();
        assert!(!registry.resolve(&99, "late".into()));
        assert!(!registry.reject(&99, RpcError::TransportClosed));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn reject_delivers_error() {
        let registry = Registry::new();
        let handle = registry.register(1).unwrap();
        registry.reject(
            &1,
            RpcError::RemoteTool {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            },
        );
        match registry.wait(&1, handle, None).await {
            Err(RpcError::RemoteTool { message, .. }) => assert_eq!(message, "Method not found"),
            other => panic!("Expected RemoteTool, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_rejects_all_pending() {
        let registry = Registry::new();
        let a = registry.register(1).unwrap();
        let b = registry.register(2).unwrap();

        assert_eq!(registry.close(|| RpcError::TransportClosed), 2);
        assert!(registry.is_closed());

        assert!(matches!(
            registry.wait(&1, a, None).await,
            Err(RpcError::TransportClosed)
        ));
        assert!(matches!(
            registry.wait(&2, b, None).await,
            Err(RpcError::TransportClosed)
        ));
        assert!(matches!(registry.register(3), Err(RpcError::TransportClosed)));
    }

    #[tokio::test]
    async fn timeout_removes_pending_entry() {
        let registry = Registry::new();
        let handle = registry.register(1).unwrap();

        let result = registry
            .wait(&1, handle, Some(Duration::from_millis(20)))
            .await;
        match result {
            Err(RpcError::Timeout { timeout_ms }) => assert_eq!(timeout_ms, 20),
            other => panic!("Expected Timeout, got: {other:?}"),
        }
        assert!(!registry.contains(&1));
        // A late reply is dropped.
        assert!(!registry.resolve(&1, "late".into()));
    }

    #[test]
    fn guard_cancels_on_drop_unless_disarmed() {
        let registry = Registry::new();
        let _a = registry.register(1).unwrap();
        let _b = registry.register(2).unwrap();

        drop(registry.guard(1));
        registry.guard(2).disarm();

        assert!(!registry.contains(&1));
        assert!(registry.contains(&2));
    }

    #[tokio::test]
    async fn abandoned_wait_leaves_no_entry() {
        let registry = Registry::new();
        let handle = registry.register(1).unwrap();
        let call = async {
            let guard = registry.guard(1);
            let result = registry.wait(&1, handle, None).await;
            guard.disarm();
            result
        };

        let outer = tokio::time::timeout(Duration::from_millis(10), call).await;
        assert!(outer.is_err());
        assert!(registry.is_empty());
    }
}
