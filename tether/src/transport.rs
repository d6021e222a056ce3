// Bus transport contract
//
// INTENTION:
// The bus transport (connection management, message dispatch, marshaling) is
// an external collaborator. The binding layer only needs three primitives
// from it: a method call, a bulk property fetch, and signal subscription.
// Everything above this trait is transport-agnostic, which is also what makes
// the readiness engine testable with a scripted mock.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::ProxyError;

/// Value type carried over the bus
pub type Value = serde_json::Value;

/// A bulk property fetch result: property name to value
pub type PropertyMap = HashMap<String, Value>;

/// Handler invoked on each signal emission with the decoded arguments.
///
/// Handlers must not block; they run on the runtime the transport delivers
/// signals on and typically just update proxy state or enqueue a descriptor.
pub type SignalHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// The primitives a bus transport exposes to proxy objects.
///
/// All operations address a remote object by its object path. Failures carry
/// the remote error name and message verbatim in `ProxyError::Transport`.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Invoke a method on a remote object and wait for its return values
    async fn call_method(
        &self,
        object_path: &str,
        interface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, ProxyError>;

    /// Fetch all properties of one interface of a remote object
    async fn get_all_properties(
        &self,
        object_path: &str,
        interface: &str,
    ) -> Result<PropertyMap, ProxyError>;

    /// Subscribe to a signal emitted by a remote object
    ///
    /// The handler is invoked once per emission until the transport itself
    /// goes away; the binding layer never unsubscribes (proxies are
    /// invalidated instead, and their handlers check validity first).
    async fn subscribe_signal(
        &self,
        object_path: &str,
        interface: &str,
        signal: &str,
        handler: SignalHandler,
    ) -> Result<(), ProxyError>;
}
