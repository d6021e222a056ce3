// Error taxonomy for the binding layer
//
// INTENTION:
// Keep the remote error name and message verbatim through every layer, so a
// caller that sees a failed operation gets the transport's original
// diagnostic text, not a re-wrapped version of it. Runtime conditions are
// values of `ProxyError`; programming errors (double completion, unregistered
// features, dependency cycles) panic at the defect site instead.

use thiserror::Error;

/// Error name used when a remote interface or feature is absent
pub const ERROR_NOT_AVAILABLE: &str = "org.tether.Error.NotAvailable";
/// Error name used when a pending operation is aborted
pub const ERROR_CANCELLED: &str = "org.tether.Error.Cancelled";
/// Error name used for malformed requests
pub const ERROR_INVALID_ARGUMENT: &str = "org.tether.Error.InvalidArgument";
/// Error name used when a service method is not implemented
pub const ERROR_NOT_IMPLEMENTED: &str = "org.tether.Error.NotImplemented";
/// Error name used when the remote end disconnected
pub const ERROR_DISCONNECTED: &str = "org.tether.Error.Disconnected";

/// Errors surfaced by proxy objects and the readiness engine.
///
/// The three variants match the three distinguishable runtime conditions:
/// a transport-level failure ("failed this time"), a feature whose remote
/// interface is absent ("will never work here"), and an invalidated proxy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// A remote call failed; carries the bus error name and message verbatim.
    #[error("{name}: {message}")]
    Transport { name: String, message: String },

    /// The feature is permanently unavailable on this remote object.
    #[error("unsupported ({name}): {message}")]
    Unsupported { name: String, message: String },

    /// The owning proxy was invalidated while the operation was pending.
    #[error("proxy invalidated ({name}): {message}")]
    Invalidated { name: String, message: String },
}

impl ProxyError {
    pub fn transport(name: impl Into<String>, message: impl Into<String>) -> Self {
        ProxyError::Transport {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        ProxyError::Unsupported {
            name: ERROR_NOT_AVAILABLE.to_string(),
            message: message.into(),
        }
    }

    pub fn invalidated(name: impl Into<String>, message: impl Into<String>) -> Self {
        ProxyError::Invalidated {
            name: name.into(),
            message: message.into(),
        }
    }

    /// The bus error name, preserved verbatim from the source of the error
    pub fn name(&self) -> &str {
        match self {
            ProxyError::Transport { name, .. } => name,
            ProxyError::Unsupported { name, .. } => name,
            ProxyError::Invalidated { name, .. } => name,
        }
    }

    /// The human-readable message, preserved verbatim
    pub fn message(&self) -> &str {
        match self {
            ProxyError::Transport { message, .. } => message,
            ProxyError::Unsupported { message, .. } => message,
            ProxyError::Invalidated { message, .. } => message,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, ProxyError::Unsupported { .. })
    }

    pub fn is_invalidated(&self) -> bool {
        matches!(self, ProxyError::Invalidated { .. })
    }
}

/// Error returned by service-side method implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct MethodError {
    pub name: String,
    pub message: String,
}

impl MethodError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn not_implemented(method: &str) -> Self {
        Self::new(ERROR_NOT_IMPLEMENTED, format!("method {method} is not implemented"))
    }
}
