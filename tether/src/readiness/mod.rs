// Readiness engine
//
// INTENTION:
// Drive the asynchronous introspection every proxy object runs before it is
// usable. Callers request feature sets with `become_ready`; the engine
// resolves feature dependencies, invokes each feature's introspection
// function at most once, short-circuits features whose required remote
// interfaces are absent, and completes every pending caller exactly once when
// its requested set is fully resolved.
//
// ARCHITECTURAL PRINCIPLES:
// 1. One In-Flight Run - concurrent become_ready calls multiplex onto the
//    introspection already running; no feature is introspected twice
// 2. Typed Failure - a feature is satisfied, missing (will never work here),
//    or failed (did not work this time); callers can tell these apart
// 3. Isolation Across Callers - a missing or failed feature only fails the
//    callers whose requested set contains it
// 4. No Cancellation - in-flight transport calls are never cancelled; late
//    completions after invalidation or a status change are discarded

pub mod feature;
pub mod pending;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tether_common::logging::Logger;

use crate::errors::ProxyError;
use crate::signal::{SignalEmitter, SignalToken};

pub use feature::{Feature, Features};
pub use pending::{PendingOperation, PendingReady};

/// An introspection function bound to its owning proxy instance.
///
/// Invoking it starts the transport calls for one feature; the function
/// reports the outcome later through
/// [`ReadinessHelper::set_introspect_completed`].
pub type IntrospectFunc =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Registry entry describing how one feature is introspected
pub struct Introspectable {
    makes_sense_for_statuses: HashSet<u32>,
    depends_on_features: Features,
    depends_on_interfaces: Vec<String>,
    introspect: IntrospectFunc,
}

impl Introspectable {
    /// Create an entry for a feature that makes sense in status 0 only
    /// (the convention for stateless proxies) with no prerequisites.
    pub fn new<F, Fut>(introspect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            makes_sense_for_statuses: HashSet::from([0]),
            depends_on_features: Features::new(),
            depends_on_interfaces: Vec::new(),
            introspect: Arc::new(move || Box::pin(introspect())),
        }
    }

    /// Restrict the feature to the given lifecycle statuses.
    ///
    /// In any other status the feature is no-op satisfied without invoking
    /// its introspection function.
    pub fn for_statuses(mut self, statuses: impl IntoIterator<Item = u32>) -> Self {
        self.makes_sense_for_statuses = statuses.into_iter().collect();
        self
    }

    /// Features that must be satisfied before this one is introspected
    pub fn depending_on_features(mut self, features: Features) -> Self {
        self.depends_on_features = features;
        self
    }

    /// Remote interfaces that must be present, or the feature is missing
    pub fn depending_on_interfaces<S: Into<String>>(
        mut self,
        interfaces: impl IntoIterator<Item = S>,
    ) -> Self {
        self.depends_on_interfaces = interfaces.into_iter().map(Into::into).collect();
        self
    }
}

/// The per-proxy table of introspectable features
pub type Introspectables = HashMap<Feature, Introspectable>;

struct Inner {
    introspectables: Introspectables,
    supported_statuses: HashSet<u32>,
    supported_features: Features,
    current_status: u32,
    interfaces: Vec<String>,
    satisfied: Features,
    missing: Features,
    failed: Features,
    feature_errors: HashMap<Feature, ProxyError>,
    requested: Features,
    pending: Features,
    in_flight: Features,
    pending_ops: Vec<PendingReady>,
    pending_status_change: Option<u32>,
    invalidated: Option<ProxyError>,
}

/// The readiness state machine owned by every proxy instance.
///
/// Cheap to clone; clones share the same state. A running introspection task
/// holds a clone so it can report completion back into the engine; the
/// registered functions themselves must not own one, since the engine owns
/// them (proxies capture their state weakly instead).
#[derive(Clone)]
pub struct ReadinessHelper {
    inner: Arc<Mutex<Inner>>,
    status_ready: Arc<SignalEmitter<u32>>,
    logger: Arc<Logger>,
}

impl ReadinessHelper {
    pub fn new(current_status: u32, logger: Arc<Logger>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                introspectables: Introspectables::new(),
                supported_statuses: HashSet::new(),
                supported_features: Features::new(),
                current_status,
                interfaces: Vec::new(),
                satisfied: Features::new(),
                missing: Features::new(),
                failed: Features::new(),
                feature_errors: HashMap::new(),
                requested: Features::new(),
                pending: Features::new(),
                in_flight: Features::new(),
                pending_ops: Vec::new(),
                pending_status_change: None,
                invalidated: None,
            })),
            status_ready: Arc::new(SignalEmitter::new()),
            logger,
        }
    }

    /// Register the introspectable features of the owning proxy.
    ///
    /// Called once from the proxy constructor. Registering a feature twice,
    /// or a feature that depends on itself, is a programming error and
    /// panics.
    pub fn add_introspectables(&self, introspectables: Introspectables) {
        let mut inner = self.lock();
        for (feature, introspectable) in introspectables {
            if inner.introspectables.contains_key(&feature) {
                panic!("introspectable for feature {feature} registered twice");
            }
            if introspectable.depends_on_features.contains(&feature) {
                panic!("feature {feature} depends on itself");
            }
            inner
                .supported_statuses
                .extend(introspectable.makes_sense_for_statuses.iter().copied());
            inner.supported_features.insert(feature);
            inner.introspectables.insert(feature, introspectable);
        }
        self.logger.debug(format!(
            "supported features now {:?}",
            inner
                .supported_features
                .iter()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
        ));
    }

    pub fn current_status(&self) -> u32 {
        self.lock().current_status
    }

    /// Force the current status without restarting introspection.
    ///
    /// Used when the status is unknown initially but discovered during the
    /// first introspection run, so there is nothing to re-run.
    pub fn force_current_status(&self, status: u32) {
        self.lock().current_status = status;
    }

    /// The remote interfaces discovered by the always-first introspection step
    pub fn interfaces(&self) -> Vec<String> {
        self.lock().interfaces.clone()
    }

    pub fn set_interfaces(&self, interfaces: Vec<String>) {
        self.lock().interfaces = interfaces;
    }

    /// Features introspected successfully so far
    pub fn actual_features(&self) -> Features {
        self.lock().satisfied.clone()
    }

    /// Features that are permanently unavailable on this instance
    pub fn missing_features(&self) -> Features {
        self.lock().missing.clone()
    }

    /// Union of all feature sets requested by any caller so far
    pub fn requested_features(&self) -> Features {
        self.lock().requested.clone()
    }

    /// Pure query: are all the given features introspected successfully?
    pub fn is_ready(&self, features: &Features) -> bool {
        let inner = self.lock();
        inner.invalidated.is_none() && features.is_subset(&inner.satisfied)
    }

    /// Whether a feature is requested but not yet resolved
    pub fn is_pending(&self, feature: &Feature) -> bool {
        self.lock().pending.contains(feature)
    }

    /// Observe `status_ready(status)`: emitted whenever every requested
    /// feature is resolved for the given status.
    pub fn connect_status_ready(
        &self,
        callback: impl Fn(&u32) + Send + Sync + 'static,
    ) -> SignalToken {
        self.status_ready.connect(callback)
    }

    /// Request that the given features become ready.
    ///
    /// Already-satisfied requests complete synchronously without I/O. A
    /// request containing a feature that is already known missing or failed
    /// fails as a whole, immediately, with that feature's recorded error.
    /// Requesting a feature that was never registered is a programming error
    /// and panics.
    pub fn become_ready(&self, features: Features) -> PendingReady {
        assert!(!features.is_empty(), "become_ready called with no features");

        let operation = {
            let mut inner = self.lock();

            if let Some(error) = &inner.invalidated {
                return PendingReady::failed(features, error.clone());
            }

            for feature in &features {
                if !inner.introspectables.contains_key(feature) {
                    panic!("become_ready: feature {feature} is not registered for this proxy");
                }
            }

            if features.is_subset(&inner.satisfied) {
                return PendingReady::finished(features);
            }

            // A single terminal feature fails the whole batch up front; other
            // callers that did not ask for it are unaffected.
            if let Some(feature) = features
                .iter()
                .find(|f| inner.missing.contains(*f) || inner.failed.contains(*f))
            {
                let error = inner
                    .feature_errors
                    .get(feature)
                    .cloned()
                    .unwrap_or_else(|| {
                        ProxyError::unsupported(format!("feature {feature} is not available"))
                    });
                return PendingReady::failed(features, error);
            }

            if let Some(existing) = inner
                .pending_ops
                .iter()
                .find(|op| op.requested_features() == &features)
            {
                return existing.clone();
            }

            assert_acyclic(&inner.introspectables, &features);

            let mut with_deps = features.clone();
            for feature in &features {
                with_deps.extend(deps_for(&inner.introspectables, *feature));
            }
            inner.requested.extend(with_deps.iter().copied());
            // Trimmed back down against completed features on iteration.
            inner.pending.extend(with_deps);

            let operation = PendingReady::new(features);
            inner.pending_ops.push(operation.clone());
            operation
        };

        self.iterate();
        operation
    }

    /// Report the outcome of one feature's introspection.
    ///
    /// `Ok` satisfies the feature; an [`ProxyError::Unsupported`] error marks
    /// it missing; any other error marks it failed. Completions arriving
    /// after invalidation are ignored; completions arriving while a status
    /// change is queued are discarded and the status change applied once the
    /// in-flight set drains.
    pub fn set_introspect_completed(&self, feature: Feature, result: Result<(), ProxyError>) {
        let deferred_status = {
            let mut inner = self.lock();

            if inner.invalidated.is_some() {
                self.logger
                    .debug(format!("ignoring completion of {feature}: proxy invalidated"));
                return;
            }

            if let Some(new_status) = inner.pending_status_change {
                self.logger.debug(format!(
                    "completion of {feature} arrived with a status change pending - discarding"
                ));
                inner.in_flight.remove(&feature);
                if !inner.in_flight.is_empty() {
                    return;
                }
                inner.pending_status_change = None;
                Some(new_status)
            } else {
                assert!(
                    inner.pending.contains(&feature),
                    "introspection completed for feature {feature} which is not pending"
                );
                assert!(
                    inner.in_flight.contains(&feature),
                    "introspection completed for feature {feature} which is not in flight"
                );

                self.logger.debug(format!(
                    "introspection of {feature} completed: success = {}",
                    result.is_ok()
                ));

                match result {
                    Ok(()) => {
                        inner.satisfied.insert(feature);
                    }
                    Err(error) => {
                        if error.is_unsupported() {
                            inner.missing.insert(feature);
                        } else {
                            inner.failed.insert(feature);
                        }
                        inner.feature_errors.insert(feature, error);
                    }
                }
                inner.pending.remove(&feature);
                inner.in_flight.remove(&feature);
                None
            }
        };

        match deferred_status {
            Some(status) => self.apply_status(status),
            None => self.iterate(),
        }
    }

    /// Externally-driven lifecycle status change.
    ///
    /// Restarts introspection of every requested feature for the new status;
    /// if an introspection run is in flight, the change is queued and applied
    /// once the in-flight calls drain (their completions are discarded).
    pub fn set_current_status(&self, new_status: u32) {
        {
            let mut inner = self.lock();
            if inner.current_status == new_status {
                return;
            }
            if !inner.in_flight.is_empty() {
                self.logger
                    .debug("status changed while introspection was running");
                inner.pending_status_change = Some(new_status);
                return;
            }
        }
        self.apply_status(new_status);
    }

    fn apply_status(&self, new_status: u32) {
        let supported = {
            let mut inner = self.lock();
            inner.current_status = new_status;
            inner.satisfied.clear();
            inner.missing.clear();
            inner.failed.clear();
            inner.feature_errors.clear();

            // Every feature requested so far becomes pending again for the
            // new status; become_ready already folded in the recursive
            // dependencies, so nothing needs re-adding here.
            inner.pending = inner.requested.clone();
            inner.supported_statuses.contains(&new_status)
        };

        if supported {
            self.iterate();
        } else {
            self.status_ready.emit(&new_status);
        }
    }

    /// Invalidate the owning proxy.
    ///
    /// Every still-pending caller fails with `error`; later `become_ready`
    /// calls fail immediately; late introspection completions are ignored.
    pub fn invalidate(&self, error: ProxyError) {
        let operations = {
            let mut inner = self.lock();
            if inner.invalidated.is_some() {
                return;
            }
            inner.invalidated = Some(error.clone());
            inner.satisfied.clear();
            inner.missing.clear();
            inner.failed.clear();
            inner.pending.clear();
            inner.in_flight.clear();
            inner.requested.clear();
            std::mem::take(&mut inner.pending_ops)
        };

        for operation in operations {
            operation.finish_with_error(error.clone());
        }
    }

    /// One pass of dependency resolution.
    ///
    /// Loops until no synchronous progress is possible (no-op satisfactions
    /// and missing-interface markings are synchronous); introspection
    /// functions themselves run as spawned tasks and re-enter through
    /// `set_introspect_completed`.
    fn iterate(&self) {
        loop {
            let mut to_finish: Vec<(PendingReady, Result<(), ProxyError>)> = Vec::new();
            let mut to_spawn: Vec<IntrospectFunc> = Vec::new();
            let mut emit_ready: Option<u32> = None;
            let mut progressed = false;

            {
                let mut inner = self.lock();

                if inner.invalidated.is_some() || inner.pending_status_change.is_some() {
                    // Nothing to finish and nothing to start: a queued status
                    // change restarts introspection itself, and invalidation
                    // already failed every caller.
                    return;
                }

                // Pending reverse dependencies of unavailable features can
                // never be satisfied either.
                let unavailable: Features =
                    inner.missing.union(&inner.failed).copied().collect();
                if !unavailable.is_empty() {
                    let newly_missing: Vec<Feature> = inner
                        .pending
                        .iter()
                        .filter(|f| {
                            !inner.missing.contains(*f)
                                && !inner.failed.contains(*f)
                                && deps_for(&inner.introspectables, **f)
                                    .intersection(&unavailable)
                                    .next()
                                    .is_some()
                        })
                        .copied()
                        .collect();
                    for feature in newly_missing {
                        inner.missing.insert(feature);
                        inner.feature_errors.insert(
                            feature,
                            ProxyError::unsupported(
                                "feature depends on other features that are not available",
                            ),
                        );
                    }
                }

                let mut completed: Features =
                    inner.satisfied.union(&inner.missing).copied().collect();
                completed.extend(inner.failed.iter().copied());

                // Finish every caller whose requested set is fully resolved.
                let satisfied = inner.satisfied.clone();
                let failed = inner.failed.clone();
                let feature_errors = inner.feature_errors.clone();
                inner.pending_ops.retain(|op| {
                    let requested = op.requested_features();
                    if !requested.is_subset(&completed) {
                        return true;
                    }
                    let result = if requested.is_subset(&satisfied) {
                        Ok(())
                    } else {
                        // Prefer reporting a transport failure over a
                        // missing-interface condition.
                        let culprit = requested
                            .iter()
                            .find(|f| failed.contains(*f))
                            .or_else(|| requested.iter().find(|f| !satisfied.contains(*f)))
                            .copied()
                            .expect("unresolved feature in a completed request");
                        Err(feature_errors
                            .get(&culprit)
                            .cloned()
                            .unwrap_or_else(|| {
                                ProxyError::unsupported(format!(
                                    "feature {culprit} is not available"
                                ))
                            }))
                    };
                    to_finish.push((op.clone(), result));
                    false
                });

                if inner.requested.is_subset(&completed) {
                    emit_ready = Some(inner.current_status);
                } else {
                    inner.pending = inner.pending.difference(&completed).copied().collect();

                    let ready_to_introspect: Vec<Feature> = inner
                        .pending
                        .iter()
                        .filter(|f| {
                            !inner.in_flight.contains(*f)
                                && inner.introspectables[*f]
                                    .depends_on_features
                                    .is_subset(&inner.satisfied)
                        })
                        .copied()
                        .collect();

                    for feature in ready_to_introspect {
                        let (valid_for_status, absent_interface, introspect) = {
                            let info = &inner.introspectables[&feature];
                            (
                                info.makes_sense_for_statuses.contains(&inner.current_status),
                                info.depends_on_interfaces
                                    .iter()
                                    .find(|i| !inner.interfaces.contains(*i))
                                    .cloned(),
                                info.introspect.clone(),
                            )
                        };

                        if !valid_for_status {
                            // Nothing to do for this feature in the current
                            // status: no-op satisfy it.
                            inner.satisfied.insert(feature);
                            inner.pending.remove(&feature);
                            progressed = true;
                            continue;
                        }

                        if let Some(absent) = absent_interface {
                            self.logger.debug(format!(
                                "feature {feature} depends on interface {absent} which is not present"
                            ));
                            let error = ProxyError::unsupported(format!(
                                "feature depends on interface {absent} which is not present"
                            ));
                            inner.missing.insert(feature);
                            inner.feature_errors.insert(feature, error);
                            inner.pending.remove(&feature);
                            progressed = true;
                            continue;
                        }

                        inner.in_flight.insert(feature);
                        to_spawn.push(introspect);
                    }
                }
            }

            for (operation, result) in to_finish {
                match result {
                    Ok(()) => operation.finish(),
                    Err(error) => operation.finish_with_error(error),
                }
            }

            if let Some(status) = emit_ready {
                self.status_ready.emit(&status);
                return;
            }

            for introspect in to_spawn {
                tokio::spawn(introspect());
            }

            if !progressed {
                return;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("readiness helper lock poisoned")
    }
}

/// Recursive feature dependencies of `feature`.
///
/// Depending on an unregistered feature is a programming error and panics.
fn deps_for(introspectables: &Introspectables, feature: Feature) -> Features {
    let mut deps = Features::new();
    let mut stack: Vec<Feature> = introspectables[&feature]
        .depends_on_features
        .iter()
        .copied()
        .collect();
    while let Some(dep) = stack.pop() {
        if deps.insert(dep) {
            match introspectables.get(&dep) {
                Some(info) => stack.extend(info.depends_on_features.iter().copied()),
                None => panic!("feature {feature} depends on unregistered feature {dep}"),
            }
        }
    }
    deps
}

/// Panic if the dependency graph reachable from `roots` contains a cycle.
fn assert_acyclic(introspectables: &Introspectables, roots: &Features) {
    #[derive(PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    fn visit(
        introspectables: &Introspectables,
        feature: Feature,
        marks: &mut HashMap<Feature, Mark>,
    ) {
        match marks.get(&feature) {
            Some(Mark::Done) => return,
            Some(Mark::InProgress) => {
                panic!("feature dependency cycle involving {feature}")
            }
            None => {}
        }
        marks.insert(feature, Mark::InProgress);
        if let Some(info) = introspectables.get(&feature) {
            for dep in &info.depends_on_features {
                visit(introspectables, *dep, marks);
            }
        }
        marks.insert(feature, Mark::Done);
    }

    let mut marks = HashMap::new();
    for feature in roots {
        visit(introspectables, *feature, &mut marks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_common::logging::{Component, Logger};

    const CORE: Feature = Feature::new("TestProxy", 0);
    const CAPS: Feature = Feature::new("TestProxy", 1);
    const ROSTER: Feature = Feature::new("TestProxy", 2);

    fn test_logger() -> Arc<Logger> {
        Arc::new(Logger::new_root(Component::Readiness, "test-bus"))
    }

    /// An introspectable that counts invocations and completes only when the
    /// test drives `set_introspect_completed`.
    fn counted(counter: Arc<AtomicUsize>) -> Introspectable {
        Introspectable::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}
        })
    }

    #[tokio::test]
    async fn become_ready_is_idempotent_once_satisfied() {
        let helper = ReadinessHelper::new(0, test_logger());
        let calls = Arc::new(AtomicUsize::new(0));
        helper.add_introspectables(Introspectables::from([(CORE, counted(calls.clone()))]));

        let op = helper.become_ready(features![CORE]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        helper.set_introspect_completed(CORE, Ok(()));
        assert!(op.is_valid());

        // Second request: no new introspection, synchronous success.
        let op2 = helper.become_ready(features![CORE]);
        assert!(op2.is_finished());
        assert!(op2.is_valid());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_introspection() {
        let helper = ReadinessHelper::new(0, test_logger());
        let calls = Arc::new(AtomicUsize::new(0));
        helper.add_introspectables(Introspectables::from([(CORE, counted(calls.clone()))]));

        let op1 = helper.become_ready(features![CORE]);
        let op2 = helper.become_ready(features![CORE]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        helper.set_introspect_completed(CORE, Ok(()));
        assert!(op1.is_valid());
        assert!(op2.is_valid());
    }

    #[tokio::test]
    async fn dependencies_are_introspected_in_order() {
        let helper = ReadinessHelper::new(0, test_logger());
        let core_calls = Arc::new(AtomicUsize::new(0));
        let caps_calls = Arc::new(AtomicUsize::new(0));
        helper.add_introspectables(Introspectables::from([
            (CORE, counted(core_calls.clone())),
            (
                CAPS,
                Introspectable::new({
                    let caps_calls = caps_calls.clone();
                    move || {
                        caps_calls.fetch_add(1, Ordering::SeqCst);
                        async {}
                    }
                })
                .depending_on_features(features![CORE]),
            ),
        ]));

        let op = helper.become_ready(features![CAPS]);
        // Core starts first; Caps must wait for it.
        assert_eq!(core_calls.load(Ordering::SeqCst), 1);
        assert_eq!(caps_calls.load(Ordering::SeqCst), 0);

        helper.set_introspect_completed(CORE, Ok(()));
        assert_eq!(caps_calls.load(Ordering::SeqCst), 1);

        helper.set_introspect_completed(CAPS, Ok(()));
        assert!(op.is_valid());
        assert!(helper.is_ready(&features![CORE, CAPS]));
    }

    #[tokio::test]
    async fn missing_interface_marks_feature_missing_without_invoking() {
        let helper = ReadinessHelper::new(0, test_logger());
        let caps_calls = Arc::new(AtomicUsize::new(0));
        helper.add_introspectables(Introspectables::from([(
            CAPS,
            Introspectable::new({
                let caps_calls = caps_calls.clone();
                move || {
                    caps_calls.fetch_add(1, Ordering::SeqCst);
                    async {}
                }
            })
            .depending_on_interfaces(["org.tether.Missing"]),
        )]));

        let op = helper.become_ready(features![CAPS]);
        assert_eq!(caps_calls.load(Ordering::SeqCst), 0);
        assert!(op.is_finished());
        assert!(op.error().unwrap().is_unsupported());
        assert!(helper.missing_features().contains(&CAPS));

        // Terminal: a later request fails immediately with the same kind.
        let op2 = helper.become_ready(features![CAPS]);
        assert!(op2.error().unwrap().is_unsupported());
    }

    #[tokio::test]
    async fn reverse_dependency_of_missing_feature_is_missing() {
        let helper = ReadinessHelper::new(0, test_logger());
        let roster_calls = Arc::new(AtomicUsize::new(0));
        helper.add_introspectables(Introspectables::from([
            (
                CAPS,
                Introspectable::new(|| async {})
                    .depending_on_interfaces(["org.tether.Missing"]),
            ),
            (
                ROSTER,
                counted(roster_calls.clone()).depending_on_features(features![CAPS]),
            ),
        ]));

        let op = helper.become_ready(features![ROSTER]);
        assert!(op.is_finished());
        assert!(op.error().unwrap().is_unsupported());
        assert_eq!(roster_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transport_failure_is_distinguishable_from_missing() {
        let helper = ReadinessHelper::new(0, test_logger());
        helper.add_introspectables(Introspectables::from([(
            CORE,
            Introspectable::new(|| async {}),
        )]));

        let op = helper.become_ready(features![CORE]);
        helper.set_introspect_completed(
            CORE,
            Err(ProxyError::transport("org.tether.Error.Disconnected", "peer vanished")),
        );

        let error = op.error().unwrap();
        assert!(!error.is_unsupported());
        assert_eq!(error.name(), "org.tether.Error.Disconnected");
        assert_eq!(error.message(), "peer vanished");
    }

    #[tokio::test]
    async fn callers_are_isolated_per_feature() {
        let helper = ReadinessHelper::new(0, test_logger());
        helper.add_introspectables(Introspectables::from([
            (CORE, Introspectable::new(|| async {})),
            (
                CAPS,
                Introspectable::new(|| async {})
                    .depending_on_interfaces(["org.tether.Missing"]),
            ),
        ]));

        let core_only = helper.become_ready(features![CORE]);
        let both = helper.become_ready(features![CORE, CAPS]);

        helper.set_introspect_completed(CORE, Ok(()));

        assert!(core_only.is_valid());
        assert!(both.error().unwrap().is_unsupported());
    }

    #[tokio::test]
    async fn invalidation_fails_every_pending_caller() {
        let helper = ReadinessHelper::new(0, test_logger());
        helper.add_introspectables(Introspectables::from([
            (CORE, Introspectable::new(|| async {})),
            (CAPS, Introspectable::new(|| async {}).depending_on_features(features![CORE])),
        ]));

        let op1 = helper.become_ready(features![CORE]);
        let op2 = helper.become_ready(features![CORE, CAPS]);

        helper.invalidate(ProxyError::invalidated(
            "org.tether.Error.Cancelled",
            "proxy destroyed",
        ));

        assert!(op1.error().unwrap().is_invalidated());
        assert!(op2.error().unwrap().is_invalidated());

        // Later requests fail immediately with the invalidation error.
        let op3 = helper.become_ready(features![CORE]);
        assert_eq!(op3.error().unwrap().message(), "proxy destroyed");

        // A late completion from an in-flight call is discarded.
        helper.set_introspect_completed(CORE, Ok(()));
        assert!(!helper.is_ready(&features![CORE]));
    }

    #[tokio::test]
    async fn status_change_restarts_introspection() {
        let helper = ReadinessHelper::new(5, test_logger());
        let calls = Arc::new(AtomicUsize::new(0));
        helper.add_introspectables(Introspectables::from([(
            CORE,
            Introspectable::new({
                let calls = calls.clone();
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {}
                }
            })
            .for_statuses([5, 6]),
        )]));

        let op = helper.become_ready(features![CORE]);
        helper.set_introspect_completed(CORE, Ok(()));
        assert!(op.is_valid());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        helper.set_current_status(6);
        // Satisfied was cleared and Core re-introspected for the new status.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!helper.is_ready(&features![CORE]));
        helper.set_introspect_completed(CORE, Ok(()));
        assert!(helper.is_ready(&features![CORE]));
    }

    #[tokio::test]
    async fn status_change_during_flight_discards_completion() {
        let helper = ReadinessHelper::new(5, test_logger());
        let calls = Arc::new(AtomicUsize::new(0));
        helper.add_introspectables(Introspectables::from([(
            CORE,
            Introspectable::new({
                let calls = calls.clone();
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {}
                }
            })
            .for_statuses([5, 6]),
        )]));

        let op = helper.become_ready(features![CORE]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        helper.set_current_status(6);
        // The in-flight completion is for the old status; it gets discarded
        // and Core is introspected again for status 6.
        helper.set_introspect_completed(CORE, Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!op.is_finished());

        helper.set_introspect_completed(CORE, Ok(()));
        assert!(op.is_valid());
        assert_eq!(helper.current_status(), 6);
    }

    #[tokio::test]
    async fn feature_outside_valid_statuses_is_noop_satisfied() {
        let helper = ReadinessHelper::new(9, test_logger());
        let calls = Arc::new(AtomicUsize::new(0));
        helper.add_introspectables(Introspectables::from([(
            CORE,
            counted(calls.clone()).for_statuses([0]),
        )]));

        let op = helper.become_ready(features![CORE]);
        assert!(op.is_valid());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    #[should_panic(expected = "not registered")]
    async fn requesting_an_unregistered_feature_panics() {
        let helper = ReadinessHelper::new(0, test_logger());
        helper.become_ready(features![CORE]);
    }

    #[tokio::test]
    #[should_panic(expected = "registered twice")]
    async fn duplicate_registration_panics() {
        let helper = ReadinessHelper::new(0, test_logger());
        helper.add_introspectables(Introspectables::from([(
            CORE,
            Introspectable::new(|| async {}),
        )]));
        helper.add_introspectables(Introspectables::from([(
            CORE,
            Introspectable::new(|| async {}),
        )]));
    }

    #[tokio::test]
    #[should_panic(expected = "dependency cycle")]
    async fn dependency_cycle_panics() {
        let helper = ReadinessHelper::new(0, test_logger());
        helper.add_introspectables(Introspectables::from([
            (
                CAPS,
                Introspectable::new(|| async {}).depending_on_features(features![ROSTER]),
            ),
            (
                ROSTER,
                Introspectable::new(|| async {}).depending_on_features(features![CAPS]),
            ),
        ]));
        helper.become_ready(features![CAPS]);
    }

    #[tokio::test]
    async fn status_ready_fires_when_requested_set_resolves() {
        let helper = ReadinessHelper::new(0, test_logger());
        helper.add_introspectables(Introspectables::from([(
            CORE,
            Introspectable::new(|| async {}),
        )]));
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        helper.connect_status_ready(move |status| {
            assert_eq!(*status, 0);
            f.fetch_add(1, Ordering::SeqCst);
        });

        helper.become_ready(features![CORE]);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        helper.set_introspect_completed(CORE, Ok(()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
