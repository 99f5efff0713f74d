//! Turning raw watch events into registration work items.
//!
//! Watched kinds are decided here once. Everything past this boundary deals in
//! [`WatchEvent`]s carrying the key of the registration to reconcile.

use std::collections::{HashMap, HashSet};

use futures::{Stream, StreamExt, stream};
use kube::api::Api;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, warn};

use crate::correlation::{REGISTERED_CLUSTER_NAME_LABEL, registration_ref};
use crate::crds::{CLUSTER_ID_LABEL, CONDITION_APPLIED, ManagedCluster, ManifestWork, RegisteredCluster};
use crate::status::condition_status;

/// Why a registration needs another look.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    RegistrationChanged(ObjectRef<RegisteredCluster>),
    MembershipChanged(ObjectRef<RegisteredCluster>),
    DistributionChanged(ObjectRef<RegisteredCluster>),
}

impl WatchEvent {
    pub fn registration(&self) -> &ObjectRef<RegisteredCluster> {
        match self {
            Self::RegistrationChanged(key) | Self::MembershipChanged(key) | Self::DistributionChanged(key) => key,
        }
    }

    pub fn into_registration(self) -> ObjectRef<RegisteredCluster> {
        match self {
            Self::RegistrationChanged(key) | Self::MembershipChanged(key) | Self::DistributionChanged(key) => key,
        }
    }
}

/// Decides whether the transition from `old` (none on first sight) to `new`
/// is worth a reconcile.
pub type Predicate<K> = fn(Option<&K>, &K) -> bool;

/// Registrations pass when something other than our own status write moved.
///
/// Status is compared too so that a status edit made by someone else is
/// reverted to the projected state.
pub fn registration_changed(old: Option<&RegisteredCluster>, new: &RegisteredCluster) -> bool {
    let Some(old) = old else {
        return true;
    };
    old.status != new.status
        || old.metadata.generation != new.metadata.generation
        || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
        || old.finalizers() != new.finalizers()
}

/// Memberships pass when correlated and their join state, client configs or
/// cluster identifier moved.
pub fn membership_changed(old: Option<&ManagedCluster>, new: &ManagedCluster) -> bool {
    if registration_ref(new.labels()).is_none() {
        return false;
    }
    let Some(old) = old else {
        return true;
    };
    old.status != new.status
        || old.spec.managed_cluster_client_configs != new.spec.managed_cluster_client_configs
        || old.labels().get(CLUSTER_ID_LABEL) != new.labels().get(CLUSTER_ID_LABEL)
}

/// Distribution objects pass on updates flipping their `Applied` condition.
/// Creation is driven by the controller itself and ignored.
pub fn distribution_changed(old: Option<&ManifestWork>, new: &ManifestWork) -> bool {
    if registration_ref(new.labels()).is_none() {
        return false;
    }
    let Some(old) = old else {
        return false;
    };
    applied_status(old) != applied_status(new)
}

fn applied_status(work: &ManifestWork) -> Option<&str> {
    condition_status(&work.status.as_ref()?.conditions, CONDITION_APPLIED)
}

type Key = (Option<String>, String);

/// Remembers the last object seen per key so update predicates have an old
/// side to compare against.
///
/// A re-list replaces the remembered set: objects it does not return were
/// deleted while the watch was down.
pub struct ChangeFilter<K> {
    predicate: Predicate<K>,
    seen: HashMap<Key, K>,
    relisted: Option<HashSet<Key>>,
}

impl<K: Resource + Clone> ChangeFilter<K> {
    pub fn new(predicate: Predicate<K>) -> Self {
        Self {
            predicate,
            seen: HashMap::new(),
            relisted: None,
        }
    }

    fn key(obj: &K) -> Key {
        (obj.namespace(), obj.name_any())
    }

    /// Record `obj` and report whether it passes the predicate.
    pub fn admit(&mut self, obj: &K) -> bool {
        let previous = self.seen.insert(Self::key(obj), obj.clone());
        (self.predicate)(previous.as_ref(), obj)
    }

    pub fn forget(&mut self, obj: &K) {
        self.seen.remove(&Self::key(obj));
    }

    /// Objects from `event` that should be acted upon. Deletions always pass.
    pub fn observe(&mut self, event: watcher::Event<K>) -> Option<K> {
        match event {
            watcher::Event::Apply(obj) => self.admit(&obj).then_some(obj),
            watcher::Event::InitApply(obj) => {
                if let Some(relisted) = &mut self.relisted {
                    relisted.insert(Self::key(&obj));
                }
                self.admit(&obj).then_some(obj)
            }
            watcher::Event::Delete(obj) => {
                self.forget(&obj);
                Some(obj)
            }
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                None
            }
            watcher::Event::InitDone => {
                if let Some(relisted) = self.relisted.take() {
                    self.seen.retain(|key, _| relisted.contains(key));
                }
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Filter a watch event stream through a [`ChangeFilter`].
pub fn changed_objects<K, S>(events: S, predicate: Predicate<K>) -> impl Stream<Item = Result<K, watcher::Error>>
where
    K: Resource + Clone,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
{
    let mut filter = ChangeFilter::new(predicate);
    events.filter_map(move |event| {
        let passed = match event {
            Ok(event) => filter.observe(event).map(Ok),
            Err(e) => Some(Err(e)),
        };
        futures::future::ready(passed)
    })
}

/// Correlated membership and distribution events from one hub.
pub fn hub_events(client: Client, hub: String) -> impl Stream<Item = WatchEvent> + Send + 'static {
    let correlated = watcher::Config::default().labels(REGISTERED_CLUSTER_NAME_LABEL);

    let memberships = changed_objects(
        watcher(Api::<ManagedCluster>::all(client.clone()), correlated.clone()).default_backoff(),
        membership_changed,
    )
    .filter_map(correlate(hub.clone(), WatchEvent::MembershipChanged));

    let works = changed_objects(
        watcher(Api::<ManifestWork>::all(client), correlated).default_backoff(),
        distribution_changed,
    )
    .filter_map(correlate(hub, WatchEvent::DistributionChanged));

    stream::select(memberships, works)
}

fn correlate<K: Resource>(
    hub: String,
    tag: fn(ObjectRef<RegisteredCluster>) -> WatchEvent,
) -> impl FnMut(Result<K, watcher::Error>) -> futures::future::Ready<Option<WatchEvent>> {
    move |item| {
        let event = match item {
            Ok(obj) => registration_ref(obj.labels()).map(tag),
            Err(e) => {
                warn!(hub = %hub, error = %e, "hub watch failed");
                None
            }
        };
        if let Some(event) = &event {
            debug!(hub = %hub, registration = %event.registration(), "hub object changed");
        }
        futures::future::ready(event)
    }
}
