// Proxy base object
//
// INTENTION:
// Hold what every client-side proxy needs: the shared transport handle, the
// remote object path, the readiness helper, a contextual logger, and the
// validity flag. A proxy is valid until explicitly invalidated; invalidation
// fails every pending readiness caller and is permanent - a new proxy
// instance is created instead of resetting one.

use std::sync::{Arc, Mutex};

use tether_common::logging::Logger;

use crate::errors::ProxyError;
use crate::readiness::{Features, PendingReady, ReadinessHelper};
use crate::transport::BusTransport;

/// Shared plumbing for proxy objects
#[derive(Clone)]
pub struct ProxyBase {
    transport: Arc<dyn BusTransport>,
    object_path: String,
    helper: ReadinessHelper,
    logger: Arc<Logger>,
    invalidation: Arc<Mutex<Option<ProxyError>>>,
}

impl ProxyBase {
    pub fn new(
        transport: Arc<dyn BusTransport>,
        object_path: impl Into<String>,
        initial_status: u32,
        logger: Logger,
    ) -> Self {
        let object_path = object_path.into();
        let logger = Arc::new(logger.with_object_path(&object_path));
        let helper = ReadinessHelper::new(initial_status, logger.clone());
        Self {
            transport,
            object_path,
            helper,
            logger,
            invalidation: Arc::new(Mutex::new(None)),
        }
    }

    pub fn transport(&self) -> Arc<dyn BusTransport> {
        self.transport.clone()
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    pub fn readiness(&self) -> &ReadinessHelper {
        &self.helper
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    /// Whether the proxy has not been invalidated
    pub fn is_valid(&self) -> bool {
        self.invalidation
            .lock()
            .expect("proxy invalidation lock poisoned")
            .is_none()
    }

    /// The error the proxy was invalidated with, if any
    pub fn invalidation_error(&self) -> Option<ProxyError> {
        self.invalidation
            .lock()
            .expect("proxy invalidation lock poisoned")
            .clone()
    }

    /// Invalidate the proxy.
    ///
    /// Fails every pending readiness caller with the given error; in-flight
    /// transport calls complete but their results are discarded. Only the
    /// first invalidation takes effect.
    pub fn invalidate(&self, name: impl Into<String>, message: impl Into<String>) {
        let error = ProxyError::invalidated(name, message);
        {
            let mut invalidation = self
                .invalidation
                .lock()
                .expect("proxy invalidation lock poisoned");
            if invalidation.is_some() {
                return;
            }
            *invalidation = Some(error.clone());
        }
        self.logger
            .info(format!("proxy invalidated: {}", error.message()));
        self.helper.invalidate(error);
    }

    pub fn become_ready(&self, features: Features) -> PendingReady {
        self.helper.become_ready(features)
    }

    pub fn is_ready(&self, features: &Features) -> bool {
        self.helper.is_ready(features)
    }
}
