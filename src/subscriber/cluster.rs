use std::{fmt::Debug, hash::Hash, sync::Arc};

use futures::{stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::ObjectReference;
use kube_client::{api::PostParams, discovery, Api, Client};
use kube_core::{gvk::GroupVersion, ApiResource, DynamicObject, Resource};
use kube_runtime::{
    events::{self, Reporter},
    reflector, watcher, WatchStreamExt,
};
use serde::de::DeserializeOwned;

use super::{
    ConfigObjectSpec, Event, Lister, ObjectStore, QualifiedName, StatusWriter, Subscription,
};
use crate::{
    addon::{AddonKey, ManagedClusterAddOn},
    recorder::{Reason, Recorder},
    Error, Result,
};

/// Object store and write API backed by a Kubernetes apiserver.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    watcher_config: watcher::Config,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            watcher_config: watcher::Config::default(),
        }
    }

    /// Base watcher configuration for every subscription, e.g. a label selector for addons.
    pub fn with_watcher_config(mut self, watcher_config: watcher::Config) -> Self {
        self.watcher_config = watcher_config;
        self
    }

    /// Resolves the runtime-typed coordinates to a served [`ApiResource`].
    async fn resolve(&self, spec: &ConfigObjectSpec) -> Result<ApiResource> {
        let group_version = GroupVersion::gv(&spec.group, &spec.version);
        let group = discovery::pinned_group(&self.client, &group_version).await?;
        group
            .recommended_resources()
            .into_iter()
            .map(|(resource, _capabilities)| resource)
            .find(|resource| resource.plural == spec.resource)
            .ok_or_else(|| {
                Error::UnknownResource(format!("{}/{}", group_version.api_version(), spec.resource))
            })
    }
}

impl ObjectStore for KubeStore {
    async fn addons(&self) -> Result<Subscription<ManagedClusterAddOn>> {
        let api = Api::<ManagedClusterAddOn>::all(self.client.clone());
        Ok(subscribe(api, self.watcher_config.clone(), ()))
    }

    async fn config_object(&self, spec: &ConfigObjectSpec) -> Result<Subscription<DynamicObject>> {
        let resource = self.resolve(spec).await?;
        let api = match &spec.namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };
        // the server filters on name, so the local store holds at most one object
        let watcher_config = self
            .watcher_config
            .clone()
            .fields(&format!("metadata.name={}", spec.name));
        Ok(subscribe(api, watcher_config, resource))
    }
}

impl StatusWriter for KubeStore {
    async fn update_status(&self, addon: &ManagedClusterAddOn) -> Result<()> {
        let key = addon.key();
        let api = Api::<ManagedClusterAddOn>::namespaced(self.client.clone(), &key.namespace);
        let data = serde_json::to_vec(addon)?;

        match api.replace_status(&key.name, &PostParams::default(), data).await {
            Ok(_) => Ok(()),
            Err(kube_client::Error::Api(response)) if response.code == 409 => {
                Err(Error::Conflict(key))
            }
            Err(kube_client::Error::Api(response)) if response.code == 404 => {
                Err(Error::NotFound(key))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Reflects the objects of `api` into a store and reports every touched object as an [`Event`].
///
/// A watcher restart re-delivers every listed object.
fn subscribe<K>(
    api: Api<K>,
    watcher_config: watcher::Config,
    dyntype: K::DynamicType,
) -> Subscription<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Clone + Eq + Hash + Send + Sync,
{
    let writer = reflector::store::Writer::new(dyntype.clone());
    let store = writer.as_reader();

    let events = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .map_ok(|event| stream::iter(touched(event)).map(Ok))
        .try_flatten()
        .map_err(Error::Watch)
        .boxed();

    Subscription {
        lister: Arc::new(StoreLister { store, dyntype }),
        events,
    }
}

fn touched<K: Resource>(event: watcher::Event<K>) -> Vec<Event> {
    match event {
        watcher::Event::Applied(object) => vec![Event {
            key: QualifiedName::from_resource(&object),
            exists: true,
        }],
        watcher::Event::Deleted(object) => vec![Event {
            key: QualifiedName::from_resource(&object),
            exists: false,
        }],
        watcher::Event::Restarted(objects) => objects
            .iter()
            .map(|object| Event {
                key: QualifiedName::from_resource(object),
                exists: true,
            })
            .collect(),
    }
}

/// [`Lister`] over a reflector store.
pub struct StoreLister<K>
where
    K: Resource + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    store: reflector::Store<K>,
    dyntype: K::DynamicType,
}

impl<K> Lister<K> for StoreLister<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Clone + Eq + Hash + Send + Sync,
{
    fn get(&self, key: &QualifiedName) -> Option<Arc<K>> {
        let mut object_ref = reflector::ObjectRef::new_with(&key.name, self.dyntype.clone());
        if let Some(namespace) = &key.namespace {
            object_ref = object_ref.within(namespace);
        }
        self.store.get(&object_ref)
    }

    fn keys(&self) -> Vec<QualifiedName> {
        self.store
            .state()
            .iter()
            .map(|object| QualifiedName::from_resource(object.as_ref()))
            .collect()
    }
}

/// Publishes supervisor events as Kubernetes `Event` objects attached to the addon.
#[derive(Clone)]
pub struct KubeRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeRecorder {
    pub fn new(client: Client, controller: impl Into<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.into(),
                instance: None,
            },
        }
    }
}

impl Recorder for KubeRecorder {
    fn record(&self, addon: &AddonKey, reason: Reason, note: String) {
        let reference = ObjectReference {
            api_version: Some(ManagedClusterAddOn::api_version(&()).into_owned()),
            kind: Some(ManagedClusterAddOn::kind(&()).into_owned()),
            namespace: Some(addon.namespace.clone()),
            name: Some(addon.name.clone()),
            ..Default::default()
        };
        let publisher =
            events::Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        let addon = addon.clone();

        tokio::spawn(async move {
            let event = events::Event {
                type_: events::EventType::Normal,
                reason: reason.to_string(),
                note: Some(note),
                action: reason.action().to_owned(),
                secondary: None,
            };
            if let Err(err) = publisher.publish(event).await {
                log::warn!("Cannot publish {reason} event for addon {addon}: {err}");
            }
        });
    }
}
