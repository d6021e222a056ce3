// Contact handles and their resolution
//
// INTENTION:
// Remote members are referenced on the wire by numeric handles; a Contact is
// the resolved, user-facing form. Resolution is asynchronous and can fail
// per-handle (stale handles after a member left) or wholesale (lookup service
// down), so the resolver reports both outcomes distinctly.

use async_trait::async_trait;

use crate::errors::ProxyError;

/// A resolved remote participant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Contact {
    handle: u32,
    id: String,
}

impl Contact {
    pub fn new(handle: u32, id: impl Into<String>) -> Self {
        Self {
            handle,
            id: id.into(),
        }
    }

    /// The wire-level numeric handle
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// The stable string identifier (address, URI, ...)
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Outcome of resolving a batch of handles
#[derive(Debug, Clone, Default)]
pub struct ResolvedContacts {
    /// Contacts for the handles that resolved
    pub contacts: Vec<Contact>,
    /// Handles the service no longer knows about
    pub invalid_handles: Vec<u32>,
}

/// Asynchronous handle-to-contact lookup.
///
/// An `Err` means the whole batch failed; individually unknown handles come
/// back in `invalid_handles` with the rest of the batch still resolved.
#[async_trait]
pub trait ContactResolver: Send + Sync {
    async fn contacts_for_handles(&self, handles: Vec<u32>) -> Result<ResolvedContacts, ProxyError>;
}
