//! An in-memory object store, status writer and recorder.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::channel::mpsc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube_core::DynamicObject;
use parking_lot::Mutex;

use crate::{
    addon::{
        AddonKey, ConfigReference, ManagedClusterAddOn, ManagedClusterAddOnSpec,
        ManagedClusterAddOnStatus,
    },
    recorder::{Reason, Recorder},
    subscriber::{
        ConfigObjectSpec, Event, Lister, ObjectStore, QualifiedName, StatusWriter, Subscription,
    },
    Error, Result,
};

type Sender = mpsc::UnboundedSender<Result<Event>>;

#[derive(Default)]
struct State {
    addons: HashMap<QualifiedName, Arc<ManagedClusterAddOn>>,
    /// Keyed by `group/version/resource`.
    configs: HashMap<String, HashMap<QualifiedName, Arc<DynamicObject>>>,
    addon_watches: Vec<Sender>,
    config_watches: Vec<(ConfigObjectSpec, Sender)>,
    writes: Vec<(AddonKey, i64)>,
    conflicts: u32,
    missing_on_write: bool,
    fail_opens: bool,
    opens: usize,
}

fn type_key(group: &str, version: &str, resource: &str) -> String {
    format!("{group}/{version}/{resource}")
}

fn broadcast(senders: &mut Vec<Sender>, event: Event) {
    senders.retain(|sender| sender.unbounded_send(Ok(event.clone())).is_ok());
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn put_addon(&self, addon: ManagedClusterAddOn) {
        let mut state = self.state.lock();
        let key = QualifiedName::from_resource(&addon);
        state.addons.insert(key.clone(), Arc::new(addon));
        broadcast(&mut state.addon_watches, Event { key, exists: true });
    }

    pub fn delete_addon(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock();
        let key = QualifiedName {
            namespace: Some(namespace.into()),
            name: name.into(),
        };
        state.addons.remove(&key);
        broadcast(&mut state.addon_watches, Event { key, exists: false });
    }

    pub fn addon(&self, namespace: &str, name: &str) -> Option<ManagedClusterAddOn> {
        let key = QualifiedName {
            namespace: Some(namespace.into()),
            name: name.into(),
        };
        self.state.lock().addons.get(&key).map(|addon| ManagedClusterAddOn::clone(addon))
    }

    /// Creates or updates the config object `reference` points at.
    pub fn put_config(&self, reference: &ConfigReference, generation: Option<i64>) {
        let mut state = self.state.lock();
        let object = config_object(&reference.namespace, &reference.name, generation);
        let key = QualifiedName::from_resource(&object);
        state
            .configs
            .entry(type_key(&reference.group, &reference.version, &reference.resource))
            .or_default()
            .insert(key.clone(), Arc::new(object));

        let spec = ConfigObjectSpec::from(reference);
        state.config_watches.retain(|(watched, sender)| {
            let event = Event {
                key: key.clone(),
                exists: true,
            };
            *watched != spec || sender.unbounded_send(Ok(event)).is_ok()
        });
    }

    /// Ends every config event stream from the store side.
    pub fn end_config_watches(&self) {
        self.state.lock().config_watches.clear();
    }

    /// Names of the config objects with an open subscription.
    pub fn live_config_watches(&self) -> Vec<String> {
        self.state
            .lock()
            .config_watches
            .iter()
            .filter(|(_, sender)| !sender.is_closed())
            .map(|(spec, _)| spec.name.clone())
            .collect()
    }

    pub fn writes(&self) -> Vec<(AddonKey, i64)> {
        self.state.lock().writes.clone()
    }

    pub fn generations_written(&self) -> Vec<i64> {
        self.writes().into_iter().map(|(_, generation)| generation).collect()
    }

    pub fn fail_next_writes(&self, conflicts: u32) {
        self.state.lock().conflicts = conflicts;
    }

    pub fn set_missing_on_write(&self, missing: bool) {
        self.state.lock().missing_on_write = missing;
    }

    pub fn set_fail_opens(&self, fail: bool) {
        self.state.lock().fail_opens = fail;
    }

    /// Config subscriptions requested so far, failed ones included.
    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }
}

impl ObjectStore for FakeCluster {
    async fn addons(&self) -> Result<Subscription<ManagedClusterAddOn>> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state.lock();
        for key in state.addons.keys() {
            let _ = tx.unbounded_send(Ok(Event {
                key: key.clone(),
                exists: true,
            }));
        }
        state.addon_watches.push(tx);

        Ok(Subscription {
            lister: Arc::new(AddonLister {
                state: Arc::clone(&self.state),
            }),
            events: Box::pin(rx),
        })
    }

    async fn config_object(&self, spec: &ConfigObjectSpec) -> Result<Subscription<DynamicObject>> {
        let mut state = self.state.lock();
        state.opens += 1;
        if state.fail_opens {
            return Err(Error::UnknownResource(spec.to_string()));
        }

        let (tx, rx) = mpsc::unbounded();
        let lister = ConfigLister {
            state: Arc::clone(&self.state),
            spec: spec.clone(),
        };
        if let Some(object) = lister.find(&state, &spec.qualified_name()) {
            let _ = tx.unbounded_send(Ok(Event {
                key: QualifiedName::from_resource(object.as_ref()),
                exists: true,
            }));
        }
        state.config_watches.push((spec.clone(), tx));

        Ok(Subscription {
            lister: Arc::new(lister),
            events: Box::pin(rx),
        })
    }
}

impl StatusWriter for FakeCluster {
    async fn update_status(&self, addon: &ManagedClusterAddOn) -> Result<()> {
        let mut state = self.state.lock();
        let key = QualifiedName::from_resource(addon);
        if state.conflicts > 0 {
            state.conflicts -= 1;
            return Err(Error::Conflict(addon.key()));
        }
        if state.missing_on_write || !state.addons.contains_key(&key) {
            return Err(Error::NotFound(addon.key()));
        }

        let generation = addon
            .config_reference()
            .map_or(0, |reference| reference.last_observed_generation);
        state.writes.push((addon.key(), generation));
        state.addons.insert(key.clone(), Arc::new(addon.clone()));
        broadcast(&mut state.addon_watches, Event { key, exists: true });
        Ok(())
    }
}

struct AddonLister {
    state: Arc<Mutex<State>>,
}

impl Lister<ManagedClusterAddOn> for AddonLister {
    fn get(&self, key: &QualifiedName) -> Option<Arc<ManagedClusterAddOn>> {
        self.state.lock().addons.get(key).cloned()
    }

    fn keys(&self) -> Vec<QualifiedName> {
        self.state.lock().addons.keys().cloned().collect()
    }
}

/// Sees only the object its subscription was opened for.
struct ConfigLister {
    state: Arc<Mutex<State>>,
    spec: ConfigObjectSpec,
}

impl ConfigLister {
    fn find(&self, state: &State, key: &QualifiedName) -> Option<Arc<DynamicObject>> {
        if *key != self.spec.qualified_name() {
            return None;
        }
        state
            .configs
            .get(&type_key(&self.spec.group, &self.spec.version, &self.spec.resource))?
            .get(key)
            .cloned()
    }
}

impl Lister<DynamicObject> for ConfigLister {
    fn get(&self, key: &QualifiedName) -> Option<Arc<DynamicObject>> {
        let state = self.state.lock();
        self.find(&state, key)
    }

    fn keys(&self) -> Vec<QualifiedName> {
        let state = self.state.lock();
        let key = self.spec.qualified_name();
        self.find(&state, &key).map(|_| key).into_iter().collect()
    }
}

#[derive(Clone, Default)]
pub struct FakeRecorder {
    events: Arc<Mutex<Vec<(AddonKey, Reason)>>>,
}

impl FakeRecorder {
    pub fn reasons(&self) -> Vec<Reason> {
        self.events.lock().iter().map(|(_, reason)| *reason).collect()
    }
}

impl Recorder for FakeRecorder {
    fn record(&self, addon: &AddonKey, reason: Reason, _note: String) {
        self.events.lock().push((addon.clone(), reason));
    }
}

pub fn reference(name: &str) -> ConfigReference {
    ConfigReference {
        group: "cfg.test".into(),
        version: "v1".into(),
        resource: "tests".into(),
        namespace: "ns1".into(),
        name: name.into(),
        last_observed_generation: 0,
    }
}

pub fn addon(
    namespace: &str,
    name: &str,
    reference: Option<ConfigReference>,
) -> ManagedClusterAddOn {
    let mut addon = ManagedClusterAddOn::new(name, ManagedClusterAddOnSpec::default());
    addon.metadata.namespace = Some(namespace.into());
    addon.status = Some(ManagedClusterAddOnStatus {
        config_reference: reference,
    });
    addon
}

pub fn config_object(namespace: &str, name: &str, generation: Option<i64>) -> DynamicObject {
    DynamicObject {
        types: None,
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()).filter(|ns: &String| !ns.is_empty()),
            generation,
            ..Default::default()
        },
        data: serde_json::Value::Null,
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
