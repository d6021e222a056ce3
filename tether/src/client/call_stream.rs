// Call stream proxy
//
// INTENTION:
// One media stream within a call. Remote membership updates arrive as
// (handle -> sending state) deltas whose handles need asynchronous contact
// resolution, so every delta goes through a ChangeQueue: deltas apply in
// arrival order no matter how lookup latencies interleave, and the core
// feature only reports ready once the initial membership snapshot has fully
// resolved (the queue drain after the snapshot was enqueued).
//
// A handle that fails to resolve is pruned from its delta; the rest of the
// delta still applies.
//
// Queue closures, introspection functions and signal handlers capture the
// stream through `Weak` handles, so dropping the last user handle destroys
// the proxy; destruction invalidates it, failing pending readiness callers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tether_common::logging::{Component, Logger};

use crate::change_queue::{ChangeQueue, DrainedFunc, ResolveFunc};
use crate::client::contact::{Contact, ContactResolver, ResolvedContacts};
use crate::errors::{ProxyError, ERROR_CANCELLED};
use crate::features;
use crate::proxy::ProxyBase;
use crate::readiness::{Feature, Features, Introspectable, Introspectables, PendingReady};
use crate::readiness::PendingOperation;
use crate::signal::{SignalEmitter, SignalToken};
use crate::transport::{BusTransport, SignalHandler, Value};

/// Interface carrying stream membership and sending state
pub const CALL_STREAM_INTERFACE: &str = "org.tether.Call.Stream";

/// Whether a participant is sending media on a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SendingState {
    None = 0,
    PendingSend = 1,
    PendingStopSending = 2,
    Sending = 3,
}

impl SendingState {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::PendingSend,
            2 => Self::PendingStopSending,
            3 => Self::Sending,
            _ => Self::None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// One membership delta as received from the remote object
#[derive(Debug, Clone, Default)]
struct RemoteMembersChangedInfo {
    updates: HashMap<u32, u32>,
    removed: Vec<u32>,
}

struct StreamState {
    local_sending_state: u32,
    remote_members: HashMap<u32, u32>,
    member_contacts: HashMap<u32, Contact>,
    signals_connected: bool,
    // Set once core introspection has enqueued the initial membership
    // snapshot; a queue drain before that is a delta drain, not readiness.
    initial_members_enqueued: bool,
}

struct StreamInner {
    base: ProxyBase,
    resolver: Arc<dyn ContactResolver>,
    state: Mutex<StreamState>,
    // Set right after construction; the queue closures need a Weak to this
    // struct, so the queue cannot be a plain field at construction time.
    queue: OnceLock<ChangeQueue<RemoteMembersChangedInfo>>,
    local_sending_state_changed: SignalEmitter<SendingState>,
    remote_sending_state_changed: SignalEmitter<Vec<(Contact, SendingState)>>,
    remote_members_removed: SignalEmitter<Vec<Contact>>,
}

impl StreamInner {
    fn queue(&self) -> &ChangeQueue<RemoteMembersChangedInfo> {
        self.queue.get().expect("change queue set in the constructor")
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        // Fails any still-pending readiness callers; a no-op if the proxy
        // was already invalidated explicitly.
        self.base.invalidate(ERROR_CANCELLED, "the proxy was dropped");
    }
}

/// Proxy for a remote call stream object.
///
/// Cheap to clone; clones share the same underlying proxy.
#[derive(Clone)]
pub struct CallStream {
    inner: Arc<StreamInner>,
}

impl CallStream {
    /// Core feature: sending states plus the resolved remote member list
    pub const FEATURE_CORE: Feature = Feature::new("CallStream", 0);

    pub fn new(
        transport: Arc<dyn BusTransport>,
        object_path: impl Into<String>,
        resolver: Arc<dyn ContactResolver>,
        logger: &Logger,
    ) -> Self {
        let inner = Arc::new(StreamInner {
            base: ProxyBase::new(
                transport,
                object_path,
                0,
                logger.with_component(Component::CallStream),
            ),
            resolver,
            state: Mutex::new(StreamState {
                local_sending_state: SendingState::None.as_u32(),
                remote_members: HashMap::new(),
                member_contacts: HashMap::new(),
                signals_connected: false,
                initial_members_enqueued: false,
            }),
            queue: OnceLock::new(),
            local_sending_state_changed: SignalEmitter::new(),
            remote_sending_state_changed: SignalEmitter::new(),
            remote_members_removed: SignalEmitter::new(),
        });

        let resolve: ResolveFunc<RemoteMembersChangedInfo> = {
            let weak = Arc::downgrade(&inner);
            Arc::new(move |info| {
                let weak = weak.clone();
                Box::pin(async move { apply_remote_members_change(weak, info).await })
            })
        };
        let drained: DrainedFunc = {
            let weak = Arc::downgrade(&inner);
            Arc::new(move || {
                let Some(inner) = weak.upgrade() else { return };
                // Only the drain that applied the initial snapshot makes
                // core ready. Flag and emptiness are read under the state
                // lock; the snapshot is flagged and enqueued under that same
                // lock, so a drain can never observe the flag without the
                // snapshot either queued or applied.
                let snapshot_applied = {
                    let state = inner.state.lock().expect("stream state lock poisoned");
                    state.initial_members_enqueued && inner.queue().is_empty()
                };
                if snapshot_applied
                    && inner.base.readiness().is_pending(&CallStream::FEATURE_CORE)
                {
                    inner
                        .base
                        .readiness()
                        .set_introspect_completed(CallStream::FEATURE_CORE, Ok(()));
                }
            })
        };
        let queue = ChangeQueue::new(inner.base.logger().clone(), resolve, drained);
        assert!(inner.queue.set(queue).is_ok(), "change queue set twice");

        let stream = Self { inner };

        let mut introspectables = Introspectables::new();
        let core = {
            let weak = stream.downgrade();
            Introspectable::new(move || {
                let weak = weak.clone();
                async move { introspect_main_properties(weak).await }
            })
        };
        introspectables.insert(Self::FEATURE_CORE, core);
        stream.inner.base.readiness().add_introspectables(introspectables);

        stream
    }

    fn downgrade(&self) -> Weak<StreamInner> {
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

    pub fn invalidate(&self, name: impl Into<String>, message: impl Into<String>) {
        self.inner.base.invalidate(name, message);
    }

    pub fn become_ready(&self, features: Features) -> PendingReady {
        self.inner.base.become_ready(features)
    }

    pub fn is_ready(&self, features: &Features) -> bool {
        self.inner.base.is_ready(features)
    }

    /// Local sending state as last reported by the remote object
    pub fn local_sending_state(&self) -> SendingState {
        SendingState::from_u32(self.lock().local_sending_state)
    }

    /// Resolved remote members (meaningful once core is ready)
    pub fn members(&self) -> Vec<Contact> {
        let state = self.lock();
        state.member_contacts.values().cloned().collect()
    }

    /// Sending state of one remote member; `None` if the contact is not a
    /// member of this stream.
    pub fn remote_sending_state(&self, contact: &Contact) -> SendingState {
        let state = self.lock();
        state
            .remote_members
            .get(&contact.handle())
            .copied()
            .map(SendingState::from_u32)
            .unwrap_or(SendingState::None)
    }

    /// Ask the service to start or stop sending on this stream
    pub fn request_sending(&self, send: bool) -> PendingOperation {
        let operation = PendingOperation::new();
        let transport = self.inner.base.transport();
        let object_path = self.inner.base.object_path().to_string();
        let completion = operation.clone();
        tokio::spawn(async move {
            let result = transport
                .call_method(
                    &object_path,
                    CALL_STREAM_INTERFACE,
                    "SetSending",
                    vec![Value::Bool(send)],
                )
                .await;
            match result {
                Ok(_) => completion.finish(),
                Err(error) => completion.finish_with_error(error),
            }
        });
        operation
    }

    pub fn connect_local_sending_state_changed(
        &self,
        callback: impl Fn(&SendingState) + Send + Sync + 'static,
    ) -> SignalToken {
        self.inner.local_sending_state_changed.connect(callback)
    }

    /// Observe aggregated remote sending state changes.
    ///
    /// Emitted per applied membership delta, after contact resolution, and
    /// only once core is ready.
    pub fn connect_remote_sending_state_changed(
        &self,
        callback: impl Fn(&Vec<(Contact, SendingState)>) + Send + Sync + 'static,
    ) -> SignalToken {
        self.inner.remote_sending_state_changed.connect(callback)
    }

    pub fn connect_remote_members_removed(
        &self,
        callback: impl Fn(&Vec<Contact>) + Send + Sync + 'static,
    ) -> SignalToken {
        self.inner.remote_members_removed.connect(callback)
    }

    fn on_local_sending_state_changed(&self, wire_state: u32) {
        self.lock().local_sending_state = wire_state;
        self.inner
            .local_sending_state_changed
            .emit(&SendingState::from_u32(wire_state));
    }

    fn on_remote_members_changed(&self, updates: HashMap<u32, u32>, removed: Vec<u32>) {
        if updates.is_empty() && removed.is_empty() {
            self.inner
                .base
                .logger()
                .debug("ignoring empty remote members change");
            return;
        }
        self.inner.base.logger().debug(format!(
            "queueing remote members change: {} updated, {} removed",
            updates.len(),
            removed.len()
        ));
        self.inner
            .queue()
            .enqueue(RemoteMembersChangedInfo { updates, removed });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamState> {
        self.inner.state.lock().expect("stream state lock poisoned")
    }
}

// Upgraded handles are transient: holding one across a transport call would
// keep a dropped proxy alive for the call's duration, so the weak handle is
// re-upgraded around each state interaction instead.
async fn introspect_main_properties(weak: Weak<StreamInner>) {
    let (transport, object_path, helper, logger, need_subscribe) = {
        let Some(inner) = weak.upgrade() else { return };
        let need_subscribe = {
            let mut state = inner.state.lock().expect("stream state lock poisoned");
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
        let local_handler: SignalHandler = {
            let weak = weak.clone();
            Arc::new(move |args: Vec<Value>| {
                let Some(inner) = weak.upgrade() else { return };
                if let Some(sending_state) = args.first().and_then(Value::as_u64) {
                    CallStream { inner }.on_local_sending_state_changed(sending_state as u32);
                }
            })
        };
        let members_handler: SignalHandler = {
            let weak = weak.clone();
            Arc::new(move |args: Vec<Value>| {
                let Some(inner) = weak.upgrade() else { return };
                let updates = parse_member_map(args.first());
                let removed = parse_handle_list(args.get(1));
                CallStream { inner }.on_remote_members_changed(updates, removed);
            })
        };

        let subscribed = async {
            transport
                .subscribe_signal(
                    &object_path,
                    CALL_STREAM_INTERFACE,
                    "LocalSendingStateChanged",
                    local_handler,
                )
                .await?;
            transport
                .subscribe_signal(
                    &object_path,
                    CALL_STREAM_INTERFACE,
                    "RemoteMembersChanged",
                    members_handler,
                )
                .await
        }
        .await;
        if let Err(error) = subscribed {
            logger.warn(format!("subscribing to stream signals failed: {error}"));
            helper.set_introspect_completed(CallStream::FEATURE_CORE, Err(error));
            return;
        }
    }

    match transport
        .get_all_properties(&object_path, CALL_STREAM_INTERFACE)
        .await
    {
        Ok(properties) => {
            let Some(inner) = weak.upgrade() else { return };
            let local = properties
                .get("LocalSendingState")
                .and_then(Value::as_u64)
                .map(|v| v as u32)
                .unwrap_or(SendingState::None.as_u32());
            let updates = parse_member_map(properties.get("RemoteMembers"));

            // Flag and enqueue under one state lock so the drain hook never
            // sees the flag ahead of the snapshot. Completion is deferred to
            // the drain hook: the member list must resolve before core
            // reports ready.
            let mut state = inner.state.lock().expect("stream state lock poisoned");
            state.local_sending_state = local;
            state.initial_members_enqueued = true;
            inner.queue().enqueue(RemoteMembersChangedInfo {
                updates,
                removed: Vec::new(),
            });
        }
        Err(error) => {
            logger.warn(format!("fetching stream properties failed: {error}"));
            helper.set_introspect_completed(CallStream::FEATURE_CORE, Err(error));
        }
    }
}

/// Resolve one membership delta and fold it into the stream state.
///
/// An `Err` return means the whole batch lookup failed and the delta is
/// dropped by the queue. Individually invalid handles only prune their own
/// entries.
async fn apply_remote_members_change(
    weak: Weak<StreamInner>,
    mut info: RemoteMembersChangedInfo,
) -> Result<(), ProxyError> {
    let handles: Vec<u32> = info.updates.keys().copied().collect();
    let resolved = if handles.is_empty() {
        ResolvedContacts::default()
    } else {
        let resolver = match weak.upgrade() {
            Some(inner) => inner.resolver.clone(),
            None => return Ok(()),
        };
        resolver.contacts_for_handles(handles).await?
    };
    let Some(inner) = weak.upgrade() else { return Ok(()) };

    if !resolved.invalid_handles.is_empty() {
        inner.base.logger().warn(format!(
            "ignoring invalid handles in members change: {:?}",
            resolved.invalid_handles
        ));
    }

    let core_ready = inner
        .base
        .readiness()
        .is_ready(&features![CallStream::FEATURE_CORE]);
    let mut removed_contacts: Vec<Contact> = Vec::new();
    let mut changed: Vec<(Contact, SendingState)> = Vec::new();
    {
        let mut state = inner.state.lock().expect("stream state lock poisoned");

        for (&handle, &sending) in &info.updates {
            state.remote_members.insert(handle, sending);
        }
        for contact in &resolved.contacts {
            state.member_contacts.insert(contact.handle(), contact.clone());
        }

        // A handle removed (or invalid) in the same delta that updated it
        // nets out to a removal.
        for handle in info
            .removed
            .iter()
            .chain(resolved.invalid_handles.iter())
            .copied()
            .collect::<Vec<u32>>()
        {
            state.remote_members.remove(&handle);
            info.updates.remove(&handle);
            if let Some(contact) = state.member_contacts.remove(&handle) {
                if core_ready {
                    removed_contacts.push(contact);
                }
            }
        }

        if core_ready {
            for (handle, sending) in &info.updates {
                if let Some(contact) = state.member_contacts.get(handle) {
                    changed.push((contact.clone(), SendingState::from_u32(*sending)));
                }
            }
        }
    }

    if !changed.is_empty() {
        inner.remote_sending_state_changed.emit(&changed);
    }
    if !removed_contacts.is_empty() {
        inner.remote_members_removed.emit(&removed_contacts);
    }
    Ok(())
}

fn parse_member_map(value: Option<&Value>) -> HashMap<u32, u32> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(handle, sending)| {
                    Some((handle.parse().ok()?, sending.as_u64()? as u32))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_handle_list(value: Option<&Value>) -> Vec<u32> {
    value
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_u64().map(|h| h as u32))
                .collect()
        })
        .unwrap_or_default()
}
