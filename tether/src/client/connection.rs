// Connection proxy
//
// INTENTION:
// The account-level connection object. Its core feature subscribes to status
// change notifications, then bulk-fetches status and the interface list; the
// capabilities feature rides on top of core, only makes sense while
// connected, and is reported missing (not failed) when the remote side does
// not expose the capabilities interface.
//
// Status transitions that arrive while introspection is in flight go through
// the readiness helper's deferred status handling, so callers never observe
// state from two different statuses mixed together.
//
// Introspection functions and signal handlers are stored inside long-lived
// collaborators (the readiness helper the proxy owns, the transport), so
// they capture the proxy through `Weak` handles; dropping the last user
// handle destroys the proxy, and destruction invalidates it so pending
// readiness callers fail instead of hanging.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tether_common::logging::{Component, Logger};

use crate::errors::{ProxyError, ERROR_CANCELLED};
use crate::features;
use crate::proxy::ProxyBase;
use crate::readiness::{Feature, Features, Introspectable, Introspectables, PendingReady};
use crate::signal::{SignalEmitter, SignalToken};
use crate::transport::{BusTransport, SignalHandler, Value};

/// Interface carrying the connection's core properties and lifecycle signals
pub const CONNECTION_INTERFACE: &str = "org.tether.Connection";
/// Optional interface advertising per-connection capabilities
pub const CONNECTION_INTERFACE_CAPABILITIES: &str = "org.tether.Connection.Interface.Capabilities";

/// Lifecycle status of a connection, as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ConnectionStatus {
    Connected = 0,
    Connecting = 1,
    Disconnected = 2,
}

impl ConnectionStatus {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Connected,
            1 => Self::Connecting,
            _ => Self::Disconnected,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

struct ConnectionState {
    status: ConnectionStatus,
    interfaces: Vec<String>,
    capabilities: HashMap<String, Value>,
    signals_connected: bool,
}

struct ConnectionInner {
    base: ProxyBase,
    state: Mutex<ConnectionState>,
    status_changed: SignalEmitter<ConnectionStatus>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        // Fails any still-pending readiness callers; a no-op if the proxy
        // was already invalidated explicitly.
        self.base.invalidate(ERROR_CANCELLED, "the proxy was dropped");
    }
}

/// Proxy for a remote connection object.
///
/// Cheap to clone; clones share the same underlying proxy.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Core feature: status, interface list, status change tracking
    pub const FEATURE_CORE: Feature = Feature::new("Connection", 0);
    /// Capabilities of the remote side; requires the capabilities interface
    pub const FEATURE_CAPABILITIES: Feature = Feature::new("Connection", 1);

    pub fn new(
        transport: Arc<dyn BusTransport>,
        object_path: impl Into<String>,
        logger: &Logger,
    ) -> Self {
        let inner = Arc::new(ConnectionInner {
            base: ProxyBase::new(
                transport,
                object_path,
                ConnectionStatus::Disconnected.as_u32(),
                logger.with_component(Component::Connection),
            ),
            state: Mutex::new(ConnectionState {
                status: ConnectionStatus::Disconnected,
                interfaces: Vec::new(),
                capabilities: HashMap::new(),
                signals_connected: false,
            }),
            status_changed: SignalEmitter::new(),
        });
        let connection = Self { inner };

        let mut introspectables = Introspectables::new();

        let core = {
            let weak = connection.downgrade();
            Introspectable::new(move || {
                let weak = weak.clone();
                async move { introspect_core(weak).await }
            })
            .for_statuses([
                ConnectionStatus::Connected.as_u32(),
                ConnectionStatus::Connecting.as_u32(),
                ConnectionStatus::Disconnected.as_u32(),
            ])
        };
        introspectables.insert(Self::FEATURE_CORE, core);

        let capabilities = {
            let weak = connection.downgrade();
            Introspectable::new(move || {
                let weak = weak.clone();
                async move { introspect_capabilities(weak).await }
            })
            .for_statuses([ConnectionStatus::Connected.as_u32()])
            .depending_on_features(features![Self::FEATURE_CORE])
            .depending_on_interfaces([CONNECTION_INTERFACE_CAPABILITIES])
        };
        introspectables.insert(Self::FEATURE_CAPABILITIES, capabilities);

        connection
            .inner
            .base
            .readiness()
            .add_introspectables(introspectables);
        connection
    }

    fn downgrade(&self) -> Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn object_path(&self) -> &str {
        self.inner.base.object_path()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.base.is_valid()
    }

    pub fn invalidation_error(&self) -> Option<ProxyError> {
        self.inner.base.invalidation_error()
    }

    /// Invalidate the proxy, failing all pending readiness requests
    pub fn invalidate(&self, name: impl Into<String>, message: impl Into<String>) {
        self.inner.base.invalidate(name, message);
    }

    pub fn become_ready(&self, features: Features) -> PendingReady {
        self.inner.base.become_ready(features)
    }

    pub fn is_ready(&self, features: &Features) -> bool {
        self.inner.base.is_ready(features)
    }

    /// Last observed lifecycle status
    pub fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    /// Interfaces the remote object advertised (meaningful once core is ready)
    pub fn interfaces(&self) -> Vec<String> {
        self.lock().interfaces.clone()
    }

    pub fn has_interface(&self, interface: &str) -> bool {
        self.lock().interfaces.iter().any(|i| i == interface)
    }

    /// Capability properties (meaningful once the capabilities feature is
    /// ready)
    pub fn capabilities(&self) -> HashMap<String, Value> {
        self.lock().capabilities.clone()
    }

    /// Observe status transitions.
    ///
    /// Only emitted once the core feature is ready, and only for actual
    /// changes; the initial status discovered by introspection is read via
    /// [`Connection::status`], not signalled.
    pub fn connect_status_changed(
        &self,
        callback: impl Fn(&ConnectionStatus) + Send + Sync + 'static,
    ) -> SignalToken {
        self.inner.status_changed.connect(callback)
    }

    fn on_status_changed(&self, wire_status: u32) {
        let new_status = ConnectionStatus::from_u32(wire_status);
        let old_status = {
            let mut state = self.lock();
            let old_status = state.status;
            state.status = new_status;
            old_status
        };
        let core_ready = self.inner.base.is_ready(&features![Self::FEATURE_CORE]);

        self.inner
            .base
            .logger()
            .debug(format!("status change {old_status:?} -> {new_status:?}"));
        self.inner
            .base
            .readiness()
            .set_current_status(new_status.as_u32());

        if core_ready && old_status != new_status {
            self.inner.status_changed.emit(&new_status);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.inner
            .state
            .lock()
            .expect("connection state lock poisoned")
    }
}

// Upgraded handles are transient: holding one across a transport call would
// keep a dropped proxy alive for the call's duration, so the weak handle is
// re-upgraded around each state interaction instead.
async fn introspect_core(weak: Weak<ConnectionInner>) {
    let (transport, object_path, helper, logger, need_subscribe) = {
        let Some(inner) = weak.upgrade() else { return };
        let need_subscribe = {
            let mut state = inner.state.lock().expect("connection state lock poisoned");
            if state.signals_connected {
                false
            } else {
                state.signals_connected = true;
                true
            }
        };
        (
            inner.base.transport(),
            inner.base.object_path().to_string(),
            inner.base.readiness().clone(),
            inner.base.logger().clone(),
            need_subscribe,
        )
    };

    if need_subscribe {
        let handler: SignalHandler = {
            let weak = weak.clone();
            Arc::new(move |args: Vec<Value>| {
                let Some(inner) = weak.upgrade() else { return };
                if let Some(status) = args.first().and_then(Value::as_u64) {
                    Connection { inner }.on_status_changed(status as u32);
                }
            })
        };
        let subscribed = transport
            .subscribe_signal(&object_path, CONNECTION_INTERFACE, "StatusChanged", handler)
            .await;
        if let Err(error) = subscribed {
            logger.warn(format!("subscribing to StatusChanged failed: {error}"));
            helper.set_introspect_completed(Connection::FEATURE_CORE, Err(error));
            return;
        }
    }

    match transport
        .get_all_properties(&object_path, CONNECTION_INTERFACE)
        .await
    {
        Ok(properties) => {
            let Some(inner) = weak.upgrade() else { return };
            let status = properties
                .get("Status")
                .and_then(Value::as_u64)
                .map(|v| ConnectionStatus::from_u32(v as u32))
                .unwrap_or(ConnectionStatus::Disconnected);
            let interfaces: Vec<String> = properties
                .get("Interfaces")
                .and_then(Value::as_array)
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();

            {
                let mut state = inner.state.lock().expect("connection state lock poisoned");
                state.status = status;
                state.interfaces = interfaces.clone();
            }
            helper.set_interfaces(interfaces);
            helper.force_current_status(status.as_u32());
            helper.set_introspect_completed(Connection::FEATURE_CORE, Ok(()));
        }
        Err(error) => {
            logger.warn(format!("fetching core properties failed: {error}"));
            helper.set_introspect_completed(Connection::FEATURE_CORE, Err(error));
        }
    }
}

async fn introspect_capabilities(weak: Weak<ConnectionInner>) {
    let (transport, object_path, helper, logger) = {
        let Some(inner) = weak.upgrade() else { return };
        (
            inner.base.transport(),
            inner.base.object_path().to_string(),
            inner.base.readiness().clone(),
            inner.base.logger().clone(),
        )
    };

    match transport
        .get_all_properties(&object_path, CONNECTION_INTERFACE_CAPABILITIES)
        .await
    {
        Ok(properties) => {
            let Some(inner) = weak.upgrade() else { return };
            inner
                .state
                .lock()
                .expect("connection state lock poisoned")
                .capabilities = properties;
            helper.set_introspect_completed(Connection::FEATURE_CAPABILITIES, Ok(()));
        }
        Err(error) => {
            logger.warn(format!("fetching capabilities failed: {error}"));
            helper.set_introspect_completed(Connection::FEATURE_CAPABILITIES, Err(error));
        }
    }
}
