// Service-side adaptors
//
// INTENTION:
// The service side of the binding: objects published on the bus. An incoming
// method call hands its handler a MethodContext, a move-only completion
// capability; the handler may complete it inline or stash it and complete it
// much later from unrelated code (a Connect call answered only once the
// connection actually reaches Connected). Exactly one reply per call, by
// construction.

pub mod base_connection;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use tether_common::logging::Logger;

use crate::errors::MethodError;
use crate::transport::Value;

pub use base_connection::BaseConnection;

/// Completion capability for one incoming method call.
///
/// Completing consumes the context, so a handler cannot reply twice. If the
/// context is dropped without completing, the caller receives an internal
/// error instead of hanging.
pub struct MethodContext {
    reply: oneshot::Sender<Result<Value, MethodError>>,
}

impl MethodContext {
    fn channel() -> (Self, oneshot::Receiver<Result<Value, MethodError>>) {
        let (reply, rx) = oneshot::channel();
        (Self { reply }, rx)
    }

    /// Reply successfully with a return value
    pub fn complete(self, value: Value) {
        let _ = self.reply.send(Ok(value));
    }

    /// Reply with a named error
    pub fn complete_with_error(self, name: impl Into<String>, message: impl Into<String>) {
        let _ = self.reply.send(Err(MethodError::new(name, message)));
    }
}

/// Handler for one (interface, method) pair
pub type MethodHandler =
    Arc<dyn Fn(Vec<Value>, MethodContext) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A local object published on the bus, dispatching incoming method calls to
/// registered handlers.
#[derive(Clone)]
pub struct ServiceObject {
    object_path: String,
    handlers: Arc<Mutex<HashMap<(String, String), MethodHandler>>>,
    logger: Arc<Logger>,
}

impl ServiceObject {
    pub fn new(object_path: impl Into<String>, logger: &Logger) -> Self {
        let object_path = object_path.into();
        Self {
            logger: Arc::new(logger.with_object_path(&object_path)),
            object_path,
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    /// Register the handler for one method.
    ///
    /// Registering the same (interface, method) twice is a wiring defect and
    /// panics.
    pub fn register_method(
        &self,
        interface: impl Into<String>,
        method: impl Into<String>,
        handler: MethodHandler,
    ) {
        let key = (interface.into(), method.into());
        let mut handlers = self.handlers.lock().expect("service handlers lock poisoned");
        if handlers.contains_key(&key) {
            panic!("handler already registered for {}.{}", key.0, key.1);
        }
        handlers.insert(key, handler);
    }

    /// Dispatch one incoming call and wait for its reply.
    ///
    /// Unknown methods get `org.tether.Error.NotImplemented`; a handler that
    /// drops its context without replying gets mapped to a NotAvailable
    /// error so the remote caller never hangs.
    pub async fn dispatch(
        &self,
        interface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, MethodError> {
        let handler = {
            let handlers = self.handlers.lock().expect("service handlers lock poisoned");
            handlers
                .get(&(interface.to_string(), method.to_string()))
                .cloned()
        };
        let handler = match handler {
            Some(handler) => handler,
            None => {
                self.logger
                    .debug(format!("no handler for {interface}.{method}"));
                return Err(MethodError::not_implemented(&format!(
                    "{interface}.{method}"
                )));
            }
        };

        let (context, reply) = MethodContext::channel();
        handler(args, context).await;

        match reply.await {
            Ok(result) => result,
            Err(_) => {
                self.logger.warn(format!(
                    "handler for {interface}.{method} dropped its context without replying"
                ));
                Err(MethodError::new(
                    crate::errors::ERROR_NOT_AVAILABLE,
                    "the service did not reply to the call",
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_common::logging::Component;

    fn test_object() -> ServiceObject {
        let logger = Logger::new_root(Component::Adaptor, "test-bus");
        ServiceObject::new("/test/object", &logger)
    }

    #[tokio::test]
    async fn immediate_completion_replies_once() {
        let object = test_object();
        object.register_method(
            "org.tether.Test",
            "Echo",
            Arc::new(|args, context: MethodContext| {
                Box::pin(async move {
                    context.complete(args.into_iter().next().unwrap_or(Value::Null));
                })
            }),
        );

        let reply = object
            .dispatch("org.tether.Test", "Echo", vec![Value::from("hello")])
            .await;
        assert_eq!(reply.unwrap(), Value::from("hello"));
    }

    #[tokio::test]
    async fn deferred_completion_resolves_the_original_call() {
        let object = test_object();
        let parked: Arc<Mutex<Option<MethodContext>>> = Arc::new(Mutex::new(None));

        let slot = parked.clone();
        object.register_method(
            "org.tether.Test",
            "Defer",
            Arc::new(move |_args, context| {
                let slot = slot.clone();
                Box::pin(async move {
                    *slot.lock().unwrap() = Some(context);
                })
            }),
        );

        let call = {
            let object = object.clone();
            tokio::spawn(async move { object.dispatch("org.tether.Test", "Defer", vec![]).await })
        };
        tokio::task::yield_now().await;

        let context = parked.lock().unwrap().take().expect("context parked");
        context.complete(Value::from(42));

        assert_eq!(call.await.unwrap().unwrap(), Value::from(42));
    }

    #[tokio::test]
    async fn unknown_method_is_not_implemented() {
        let object = test_object();
        let error = object
            .dispatch("org.tether.Test", "Missing", vec![])
            .await
            .unwrap_err();
        assert_eq!(error.name, crate::errors::ERROR_NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn dropped_context_becomes_an_error_reply() {
        let object = test_object();
        object.register_method(
            "org.tether.Test",
            "Forget",
            Arc::new(|_args, context| {
                Box::pin(async move {
                    drop(context);
                })
            }),
        );

        let error = object
            .dispatch("org.tether.Test", "Forget", vec![])
            .await
            .unwrap_err();
        assert_eq!(error.name, crate::errors::ERROR_NOT_AVAILABLE);
    }
}
