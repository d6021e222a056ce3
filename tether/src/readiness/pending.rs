// Pending operation protocol
//
// INTENTION:
// A PendingOperation is a single-shot promise for the outcome of one
// asynchronous operation. It completes exactly once, with success or a typed
// error; completion callbacks fire once each, in subscription order, and a
// callback subscribed after completion fires immediately. Multiple callers
// awaiting the same in-flight work share one operation.
//
// Completing an operation twice is a defect in the producer, not a runtime
// condition, and panics.

use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::errors::ProxyError;
use crate::readiness::feature::Features;

type CompletionCallback = Box<dyn FnOnce(&Result<(), ProxyError>) + Send>;

enum Outcome {
    Pending,
    Succeeded,
    Failed(ProxyError),
}

struct Shared {
    outcome: Outcome,
    callbacks: Vec<CompletionCallback>,
    waiters: Vec<oneshot::Sender<Result<(), ProxyError>>>,
}

impl Shared {
    fn result(&self) -> Option<Result<(), ProxyError>> {
        match &self.outcome {
            Outcome::Pending => None,
            Outcome::Succeeded => Some(Ok(())),
            Outcome::Failed(error) => Some(Err(error.clone())),
        }
    }
}

/// A single-shot promise for the outcome of one asynchronous operation
#[derive(Clone)]
pub struct PendingOperation {
    shared: Arc<Mutex<Shared>>,
}

impl PendingOperation {
    /// Create a still-pending operation
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                outcome: Outcome::Pending,
                callbacks: Vec::new(),
                waiters: Vec::new(),
            })),
        }
    }

    /// Create an operation that has already succeeded
    pub fn finished() -> Self {
        let op = Self::new();
        op.finish();
        op
    }

    /// Create an operation that has already failed
    pub fn failed(error: ProxyError) -> Self {
        let op = Self::new();
        op.finish_with_error(error);
        op
    }

    /// Complete the operation successfully.
    ///
    /// Panics if the operation was already completed.
    pub fn finish(&self) {
        self.resolve(Ok(()));
    }

    /// Complete the operation with an error.
    ///
    /// Panics if the operation was already completed.
    pub fn finish_with_error(&self, error: ProxyError) {
        self.resolve(Err(error));
    }

    fn resolve(&self, result: Result<(), ProxyError>) {
        let (callbacks, waiters) = {
            let mut shared = self.shared.lock().expect("pending operation lock poisoned");
            if !matches!(shared.outcome, Outcome::Pending) {
                panic!("PendingOperation completed twice");
            }
            shared.outcome = match &result {
                Ok(()) => Outcome::Succeeded,
                Err(error) => Outcome::Failed(error.clone()),
            };
            (
                std::mem::take(&mut shared.callbacks),
                std::mem::take(&mut shared.waiters),
            )
        };

        // Callbacks run outside the lock, in subscription order, so they may
        // re-enter the operation (or the engine that owns it).
        for callback in callbacks {
            callback(&result);
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// Whether the operation has completed (successfully or not)
    pub fn is_finished(&self) -> bool {
        self.shared
            .lock()
            .expect("pending operation lock poisoned")
            .result()
            .is_some()
    }

    /// Whether the operation completed successfully
    pub fn is_valid(&self) -> bool {
        matches!(
            self.shared
                .lock()
                .expect("pending operation lock poisoned")
                .result(),
            Some(Ok(()))
        )
    }

    /// The error the operation failed with, if it failed
    pub fn error(&self) -> Option<ProxyError> {
        match self
            .shared
            .lock()
            .expect("pending operation lock poisoned")
            .result()
        {
            Some(Err(error)) => Some(error),
            _ => None,
        }
    }

    /// Register a completion callback.
    ///
    /// Fires at most once. If the operation already completed, the callback
    /// fires immediately on the calling task.
    pub fn on_finished(&self, callback: impl FnOnce(&Result<(), ProxyError>) + Send + 'static) {
        let immediate = {
            let mut shared = self.shared.lock().expect("pending operation lock poisoned");
            match shared.result() {
                Some(result) => Some((callback, result)),
                None => {
                    shared.callbacks.push(Box::new(callback));
                    None
                }
            }
        };
        if let Some((callback, result)) = immediate {
            callback(&result);
        }
    }

    /// Await completion of the operation
    pub async fn wait(&self) -> Result<(), ProxyError> {
        let receiver = {
            let mut shared = self.shared.lock().expect("pending operation lock poisoned");
            match shared.result() {
                Some(result) => return result,
                None => {
                    let (tx, rx) = oneshot::channel();
                    shared.waiters.push(tx);
                    rx
                }
            }
        };
        receiver
            .await
            .expect("pending operation dropped without completing")
    }
}

impl Default for PendingOperation {
    fn default() -> Self {
        Self::new()
    }
}

/// A pending `become_ready` request: the operation plus the feature set the
/// caller asked for.
#[derive(Clone)]
pub struct PendingReady {
    operation: PendingOperation,
    requested: Features,
}

impl PendingReady {
    pub(crate) fn new(requested: Features) -> Self {
        Self {
            operation: PendingOperation::new(),
            requested,
        }
    }

    pub(crate) fn finished(requested: Features) -> Self {
        Self {
            operation: PendingOperation::finished(),
            requested,
        }
    }

    pub(crate) fn failed(requested: Features, error: ProxyError) -> Self {
        Self {
            operation: PendingOperation::failed(error),
            requested,
        }
    }

    pub(crate) fn finish(&self) {
        self.operation.finish();
    }

    pub(crate) fn finish_with_error(&self, error: ProxyError) {
        self.operation.finish_with_error(error);
    }

    /// The features this caller asked for
    pub fn requested_features(&self) -> &Features {
        &self.requested
    }

    pub fn is_finished(&self) -> bool {
        self.operation.is_finished()
    }

    pub fn is_valid(&self) -> bool {
        self.operation.is_valid()
    }

    pub fn error(&self) -> Option<ProxyError> {
        self.operation.error()
    }

    pub fn on_finished(&self, callback: impl FnOnce(&Result<(), ProxyError>) + Send + 'static) {
        self.operation.on_finished(callback);
    }

    /// Await readiness of the requested features
    pub async fn wait(&self) -> Result<(), ProxyError> {
        self.operation.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ERROR_NOT_AVAILABLE;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callbacks_fire_once_in_subscription_order() {
        let op = PendingOperation::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        op.on_finished(move |result| {
            assert!(result.is_ok());
            o1.lock().unwrap().push(1);
        });
        let o2 = order.clone();
        op.on_finished(move |_| o2.lock().unwrap().push(2));

        op.finish();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn late_subscriber_fires_immediately() {
        let op = PendingOperation::failed(ProxyError::unsupported("no such interface"));
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        op.on_finished(move |result| {
            let error = result.as_ref().unwrap_err();
            assert_eq!(error.name(), ERROR_NOT_AVAILABLE);
            assert_eq!(error.message(), "no such interface");
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn double_completion_panics() {
        let op = PendingOperation::new();
        op.finish();
        op.finish();
    }

    #[test]
    fn wait_resolves_for_already_finished_operation() {
        let op = PendingOperation::finished();
        let result = tokio_test::block_on(op.wait());
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn wait_resolves_when_finished_later() {
        let op = PendingOperation::new();
        let waiter = {
            let op = op.clone();
            tokio::spawn(async move { op.wait().await })
        };
        // Let the waiter register before resolving.
        tokio::task::yield_now().await;
        op.finish_with_error(ProxyError::transport("org.tether.Error.Disconnected", "gone"));

        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap_err().message(), "gone");
    }
}
