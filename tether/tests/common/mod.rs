// Shared mocks for the integration tests: a scripted bus transport and a
// scripted contact resolver. Both record what was asked of them and let the
// test fire signals or delay lookups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tether::{
    BusTransport, Contact, ContactResolver, PropertyMap, ProxyError, ResolvedContacts,
    SignalHandler, Value,
};

/// Route test-run logging through env_logger (RUST_LOG opt-in); safe to call
/// from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

type PropertyScript = HashMap<String, Result<PropertyMap, ProxyError>>;

#[derive(Default)]
struct MockBusState {
    // interface -> scripted GetAll outcome
    properties: PropertyScript,
    // interface -> GetAll latency before the scripted outcome is returned
    property_delays: HashMap<String, Duration>,
    // (interface, signal) -> subscribed handlers
    handlers: HashMap<(String, String), Vec<SignalHandler>>,
    // (interface, method) log of invocations
    calls: Vec<(String, String, Vec<Value>)>,
    get_all_counts: HashMap<String, usize>,
}

/// Scripted transport: tests preload property maps per interface, then fire
/// signals at the handlers proxies subscribed.
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<MockBusState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_properties(&self, interface: &str, properties: PropertyMap) {
        self.lock()
            .properties
            .insert(interface.to_string(), Ok(properties));
    }

    pub fn script_properties_error(&self, interface: &str, error: ProxyError) {
        self.lock()
            .properties
            .insert(interface.to_string(), Err(error));
    }

    /// Keep GetAll for this interface in flight for `delay` before returning
    /// its scripted outcome, leaving room for signals to interleave.
    pub fn script_properties_delay(&self, interface: &str, delay: Duration) {
        self.lock()
            .property_delays
            .insert(interface.to_string(), delay);
    }

    /// Fire a signal at every handler subscribed to it
    pub fn emit_signal(&self, interface: &str, signal: &str, args: Vec<Value>) {
        let handlers = {
            let state = self.lock();
            state
                .handlers
                .get(&(interface.to_string(), signal.to_string()))
                .cloned()
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(args.clone());
        }
    }

    pub fn subscription_count(&self, interface: &str, signal: &str) -> usize {
        self.lock()
            .handlers
            .get(&(interface.to_string(), signal.to_string()))
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn get_all_count(&self, interface: &str) -> usize {
        self.lock()
            .get_all_counts
            .get(interface)
            .copied()
            .unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<(String, String, Vec<Value>)> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockBusState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl BusTransport for MockBus {
    async fn call_method(
        &self,
        _object_path: &str,
        interface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, ProxyError> {
        self.lock()
            .calls
            .push((interface.to_string(), method.to_string(), args));
        Ok(vec![])
    }

    async fn get_all_properties(
        &self,
        _object_path: &str,
        interface: &str,
    ) -> Result<PropertyMap, ProxyError> {
        let (delay, result) = {
            let mut state = self.lock();
            *state
                .get_all_counts
                .entry(interface.to_string())
                .or_insert(0) += 1;
            let result = match state.properties.get(interface) {
                Some(result) => result.clone(),
                None => Err(ProxyError::transport(
                    "org.tether.Error.NotAvailable",
                    format!("no such interface {interface}"),
                )),
            };
            (state.property_delays.get(interface).copied(), result)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn subscribe_signal(
        &self,
        _object_path: &str,
        interface: &str,
        signal: &str,
        handler: SignalHandler,
    ) -> Result<(), ProxyError> {
        self.lock()
            .handlers
            .entry((interface.to_string(), signal.to_string()))
            .or_default()
            .push(handler);
        Ok(())
    }
}

/// Scripted resolver: handles resolve to "contact-<handle>" ids after a
/// per-handle delay, and scripted handles come back invalid.
#[derive(Clone, Default)]
pub struct MockContactResolver {
    invalid: Arc<Mutex<Vec<u32>>>,
    // handle -> extra lookup latency
    delays: Arc<Mutex<HashMap<u32, Duration>>>,
    batches: Arc<Mutex<Vec<Vec<u32>>>>,
}

impl MockContactResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_invalid(&self, handle: u32) {
        self.invalid.lock().unwrap().push(handle);
    }

    pub fn delay_handle(&self, handle: u32, delay: Duration) {
        self.delays.lock().unwrap().insert(handle, delay);
    }

    /// The handle batches that were looked up, in order
    pub fn batches(&self) -> Vec<Vec<u32>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn contact(handle: u32) -> Contact {
        Contact::new(handle, format!("contact-{handle}"))
    }
}

#[async_trait]
impl ContactResolver for MockContactResolver {
    async fn contacts_for_handles(&self, handles: Vec<u32>) -> Result<ResolvedContacts, ProxyError> {
        let mut sorted = handles.clone();
        sorted.sort_unstable();
        self.batches.lock().unwrap().push(sorted);

        let delay = {
            let delays = self.delays.lock().unwrap();
            handles
                .iter()
                .filter_map(|handle| delays.get(handle))
                .max()
                .copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let invalid = self.invalid.lock().unwrap().clone();
        let mut resolved = ResolvedContacts::default();
        for handle in handles {
            if invalid.contains(&handle) {
                resolved.invalid_handles.push(handle);
            } else {
                resolved.contacts.push(Self::contact(handle));
            }
        }
        Ok(resolved)
    }
}
