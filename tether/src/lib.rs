// Tether - client/service binding layer for a message-bus IM/VoIP stack
//
// INTENTION:
// Provide proxy objects that mirror remote bus objects and adaptor base
// classes that expose local objects over the bus. Every proxy runs the same
// asynchronous readiness/introspection state machine: features are requested
// incrementally, introspected in dependency order, and change notifications
// arriving mid-introspection are buffered and replayed in order.

// Public modules
pub mod change_queue;
pub mod client;
pub mod errors;
pub mod proxy;
pub mod readiness;
pub mod service;
pub mod signal;
pub mod transport;

// Re-export the main types from the readiness module
pub use readiness::feature::{Feature, Features};
pub use readiness::pending::{PendingOperation, PendingReady};
pub use readiness::{Introspectable, Introspectables, ReadinessHelper};

// Re-export the change queue
pub use change_queue::ChangeQueue;

// Re-export proxy and client types
pub use client::call_stream::{CallStream, SendingState};
pub use client::connection::{Connection, ConnectionStatus};
pub use client::contact::{Contact, ContactResolver, ResolvedContacts};
pub use proxy::ProxyBase;

// Re-export service-side types
pub use service::{BaseConnection, MethodContext, MethodHandler, ServiceObject};

// Re-export the transport contract and error taxonomy
pub use errors::{MethodError, ProxyError};
pub use transport::{BusTransport, PropertyMap, SignalHandler, Value};

// Re-export common logging for convenience
pub use tether_common::logging::{Component, Logger};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
