// Connection adaptor
//
// INTENTION:
// The service-side counterpart of the Connection proxy. Its Connect method
// is the canonical deferred-completion case: the handler parks the
// MethodContext and the reply goes out only when the implementation later
// moves the connection to Connected (or fails it). Disconnect and
// GetInterfaces reply inline.
//
// Handlers live in the ServiceObject's dispatch table, which the adaptor
// owns, so they capture the adaptor through `Weak` handles; a call
// dispatched after the adaptor is gone gets an error reply. A Connect call
// still parked when the adaptor drops is answered through the context's
// dropped-handle path.

use std::sync::{Arc, Mutex, Weak};

use tether_common::logging::{Component, Logger};

use crate::client::connection::{ConnectionStatus, CONNECTION_INTERFACE};
use crate::errors::{ERROR_DISCONNECTED, ERROR_NOT_AVAILABLE};
use crate::service::{MethodContext, ServiceObject};
use crate::signal::{SignalEmitter, SignalToken};
use crate::transport::Value;

struct BaseConnectionState {
    status: ConnectionStatus,
    interfaces: Vec<String>,
    pending_connect: Option<MethodContext>,
}

struct BaseConnectionInner {
    object: ServiceObject,
    state: Mutex<BaseConnectionState>,
    status_changed: SignalEmitter<ConnectionStatus>,
    logger: Arc<Logger>,
}

/// A published connection object with deferred Connect semantics.
///
/// Cheap to clone; clones share the same underlying object.
#[derive(Clone)]
pub struct BaseConnection {
    inner: Arc<BaseConnectionInner>,
}

impl BaseConnection {
    pub fn new(
        object_path: impl Into<String>,
        interfaces: Vec<String>,
        logger: &Logger,
    ) -> Self {
        let logger = logger.with_component(Component::Adaptor);
        let object = ServiceObject::new(object_path, &logger);
        let connection = Self {
            inner: Arc::new(BaseConnectionInner {
                logger: Arc::new(logger),
                object,
                state: Mutex::new(BaseConnectionState {
                    status: ConnectionStatus::Disconnected,
                    interfaces,
                    pending_connect: None,
                }),
                status_changed: SignalEmitter::new(),
            }),
        };
        connection.register_handlers();
        connection
    }

    fn register_handlers(&self) {
        {
            let weak = self.downgrade();
            self.inner.object.register_method(
                CONNECTION_INTERFACE,
                "Connect",
                Arc::new(move |_args, context| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        match BaseConnection::from_weak(&weak) {
                            Some(connection) => connection.on_connect(context),
                            None => fail_gone(context),
                        }
                    })
                }),
            );
        }
        {
            let weak = self.downgrade();
            self.inner.object.register_method(
                CONNECTION_INTERFACE,
                "Disconnect",
                Arc::new(move |_args, context| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        match BaseConnection::from_weak(&weak) {
                            Some(connection) => connection.on_disconnect(context),
                            None => fail_gone(context),
                        }
                    })
                }),
            );
        }
        {
            let weak = self.downgrade();
            self.inner.object.register_method(
                CONNECTION_INTERFACE,
                "GetInterfaces",
                Arc::new(move |_args, context| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        match BaseConnection::from_weak(&weak) {
                            Some(connection) => {
                                let interfaces = connection.lock().interfaces.clone();
                                context.complete(Value::from(interfaces));
                            }
                            None => fail_gone(context),
                        }
                    })
                }),
            );
        }
    }

    fn downgrade(&self) -> Weak<BaseConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    fn from_weak(weak: &Weak<BaseConnectionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// The dispatchable bus object
    pub fn object(&self) -> &ServiceObject {
        &self.inner.object
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    pub fn connect_status_changed(
        &self,
        callback: impl Fn(&ConnectionStatus) + Send + Sync + 'static,
    ) -> SignalToken {
        self.inner.status_changed.connect(callback)
    }

    /// Drive the connection lifecycle.
    ///
    /// Reaching Connected answers a parked Connect call; dropping to
    /// Disconnected while a Connect is parked fails it.
    pub fn set_status(&self, status: ConnectionStatus) {
        let (changed, parked) = {
            let mut state = self.lock();
            if state.status == status {
                (false, None)
            } else {
                state.status = status;
                let parked = match status {
                    ConnectionStatus::Connecting => None,
                    _ => state.pending_connect.take(),
                };
                (true, parked)
            }
        };
        if !changed {
            return;
        }

        self.inner.logger.debug(format!("status now {status:?}"));
        if let Some(context) = parked {
            match status {
                ConnectionStatus::Connected => context.complete(Value::Null),
                _ => context.complete_with_error(
                    ERROR_DISCONNECTED,
                    "the connection was disconnected before it connected",
                ),
            }
        }
        self.inner.status_changed.emit(&status);
    }

    fn on_connect(&self, context: MethodContext) {
        let mut state = self.lock();
        match state.status {
            ConnectionStatus::Connected => {
                drop(state);
                context.complete(Value::Null);
            }
            _ => {
                if state.pending_connect.is_some() {
                    drop(state);
                    context.complete_with_error(
                        ERROR_NOT_AVAILABLE,
                        "a connection attempt is already in progress",
                    );
                    return;
                }
                state.pending_connect = Some(context);
                // set_status re-locks the state, release it first.
                drop(state);
                self.inner
                    .logger
                    .debug("Connect parked until the connection is established");
                self.set_status(ConnectionStatus::Connecting);
            }
        }
    }

    fn on_disconnect(&self, context: MethodContext) {
        self.set_status(ConnectionStatus::Disconnected);
        context.complete(Value::Null);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BaseConnectionState> {
        self.inner.state.lock().expect("base connection lock poisoned")
    }
}

fn fail_gone(context: MethodContext) {
    context.complete_with_error(ERROR_NOT_AVAILABLE, "the connection object is gone");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection() -> BaseConnection {
        let logger = Logger::new_root(Component::Adaptor, "test-bus");
        BaseConnection::new(
            "/test/connection",
            vec![CONNECTION_INTERFACE.to_string()],
            &logger,
        )
    }

    #[tokio::test]
    async fn connect_replies_only_once_connected() {
        let connection = test_connection();

        let call = {
            let object = connection.object().clone();
            tokio::spawn(async move { object.dispatch(CONNECTION_INTERFACE, "Connect", vec![]).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(connection.status(), ConnectionStatus::Connecting);
        assert!(!call.is_finished());

        connection.set_status(ConnectionStatus::Connected);
        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn connect_fails_when_disconnected_first() {
        let connection = test_connection();

        let call = {
            let object = connection.object().clone();
            tokio::spawn(async move { object.dispatch(CONNECTION_INTERFACE, "Connect", vec![]).await })
        };
        tokio::task::yield_now().await;

        connection.set_status(ConnectionStatus::Disconnected);
        let error = call.await.unwrap().unwrap_err();
        assert_eq!(error.name, ERROR_DISCONNECTED);
    }

    #[tokio::test]
    async fn get_interfaces_replies_inline() {
        let connection = test_connection();
        let reply = connection
            .object()
            .dispatch(CONNECTION_INTERFACE, "GetInterfaces", vec![])
            .await
            .unwrap();
        assert_eq!(reply, Value::from(vec![CONNECTION_INTERFACE.to_string()]));
    }

    #[tokio::test]
    async fn status_observers_see_transitions() {
        let connection = test_connection();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        connection.connect_status_changed(move |status| {
            sink.lock().unwrap().push(*status);
        });

        connection.set_status(ConnectionStatus::Connecting);
        connection.set_status(ConnectionStatus::Connected);
        connection.set_status(ConnectionStatus::Connected);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
    }

    #[tokio::test]
    async fn dropping_the_adaptor_releases_it() {
        let connection = test_connection();
        let object = connection.object().clone();
        let weak = Arc::downgrade(&connection.inner);

        drop(connection);
        assert!(weak.upgrade().is_none());

        // The dispatch table outlives the adaptor; calls now get an error
        // reply instead of resurrecting it.
        let error = object
            .dispatch(CONNECTION_INTERFACE, "Connect", vec![])
            .await
            .unwrap_err();
        assert_eq!(error.name, ERROR_NOT_AVAILABLE);
    }
}
