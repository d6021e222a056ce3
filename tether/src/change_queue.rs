// Ordered replay of change notifications under lookup latency
//
// INTENTION:
// Remote change notifications reference opaque identifiers (contact handles)
// that need an asynchronous lookup before they can be applied. This queue
// guarantees that descriptors apply to proxy state strictly in arrival order:
// while one descriptor's lookup is in flight, later descriptors only queue
// up, and a descriptor whose lookup fails is logged and discarded so one bad
// identifier can never stall the queue.
//
// The drain hook runs every time the queue empties; CallStream uses the
// drain that applied the initial membership snapshot to declare its core
// introspection complete.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tether_common::logging::Logger;

use crate::errors::ProxyError;

/// Resolves and applies one change descriptor.
///
/// The function owns the whole resolve-then-apply step for a descriptor;
/// partial failures (some identifiers invalid) are its business to apply
/// partially and report. An `Err` return is logged by the queue and the
/// queue advances regardless.
pub type ResolveFunc<D> = Arc<
    dyn Fn(D) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send>> + Send + Sync,
>;

/// Hook invoked each time the queue drains to empty
pub type DrainedFunc = Arc<dyn Fn() + Send + Sync>;

struct State<D> {
    queue: VecDeque<D>,
    resolving: bool,
}

/// FIFO buffer serializing change descriptors against in-flight lookups
pub struct ChangeQueue<D> {
    state: Arc<Mutex<State<D>>>,
    resolve: ResolveFunc<D>,
    drained: DrainedFunc,
    logger: Arc<Logger>,
}

impl<D> Clone for ChangeQueue<D> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            resolve: self.resolve.clone(),
            drained: self.drained.clone(),
            logger: self.logger.clone(),
        }
    }
}

impl<D: Send + 'static> ChangeQueue<D> {
    pub fn new(logger: Arc<Logger>, resolve: ResolveFunc<D>, drained: DrainedFunc) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                queue: VecDeque::new(),
                resolving: false,
            })),
            resolve,
            drained,
            logger,
        }
    }

    /// Append a descriptor; starts the resolution worker if none is running.
    ///
    /// Only one resolution is ever in flight per queue; enqueueing during an
    /// in-flight resolution only appends.
    pub fn enqueue(&self, descriptor: D) {
        {
            let mut state = self.lock();
            state.queue.push_back(descriptor);
            if state.resolving {
                return;
            }
            state.resolving = true;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            queue.process().await;
        });
    }

    /// Number of descriptors waiting (not counting one being resolved)
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Whether no resolution is currently in flight
    pub fn is_idle(&self) -> bool {
        !self.lock().resolving
    }

    async fn process(&self) {
        loop {
            let descriptor = {
                let mut state = self.lock();
                match state.queue.pop_front() {
                    Some(descriptor) => descriptor,
                    None => {
                        state.resolving = false;
                        drop(state);
                        (self.drained)();
                        return;
                    }
                }
            };

            if let Err(error) = (self.resolve)(descriptor).await {
                self.logger.warn(format!(
                    "dropping change descriptor whose lookup failed: {error}"
                ));
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<D>> {
        self.state.lock().expect("change queue lock poisoned")
    }
}
