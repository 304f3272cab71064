//! Event subscriptions and snapshot reads the supervisor and its config watchers run on.
//!
//! A [`Subscription`] pairs a stream of change events with a [`Lister`]
//! reading the last-known state maintained by the same subscription.
//! The [`cluster`] submodule implements the capabilities against a Kubernetes cluster.

use std::{collections::BTreeSet, fmt, future::Future, sync::Arc};

use futures::{future, stream::BoxStream, Stream, TryStreamExt};
use kube_core::{DynamicObject, Resource};

use crate::{
    addon::{ConfigReference, ManagedClusterAddOn},
    Result,
};

/// Uniquely identifies an object of a known type by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    /// The object namespace, if any
    pub namespace: Option<String>,
    /// The object name
    pub name: String,
}

impl QualifiedName {
    pub fn from_resource<K: Resource>(resource: &K) -> Self {
        Self {
            namespace: resource.meta().namespace.clone(),
            name: resource.meta().name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// An object was added, updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub key: QualifiedName,
    /// False when the event reports a deletion.
    pub exists: bool,
}

/// Read access to the last-known state of the objects a subscription tracks.
pub trait Lister<K>: Send + Sync {
    fn get(&self, key: &QualifiedName) -> Option<Arc<K>>;

    fn keys(&self) -> Vec<QualifiedName>;
}

pub type EventStream = BoxStream<'static, Result<Event>>;

/// A live event feed over one kind of object.
///
/// Dropping [`events`](Self::events) closes the underlying watch.
pub struct Subscription<K> {
    pub lister: Arc<dyn Lister<K>>,
    pub events: EventStream,
}

/// Coordinates of the single configuration object a config watcher follows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigObjectSpec {
    pub group: String,
    pub version: String,
    pub resource: String,
    /// `None` for cluster scoped objects.
    pub namespace: Option<String>,
    pub name: String,
}

impl ConfigObjectSpec {
    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

impl From<&ConfigReference> for ConfigObjectSpec {
    fn from(reference: &ConfigReference) -> Self {
        Self {
            group: reference.group.clone(),
            version: reference.version.clone(),
            resource: reference.resource.clone(),
            namespace: Some(reference.namespace.clone()).filter(|ns| !ns.is_empty()),
            name: reference.name.clone(),
        }
    }
}

impl fmt::Display for ConfigObjectSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.version, self.resource)?;
        match &self.namespace {
            Some(namespace) => write!(f, " {namespace}/{}", self.name),
            None => write!(f, " {}", self.name),
        }
    }
}

/// The object store capability: opens subscriptions.
pub trait ObjectStore: Send + Sync + 'static {
    /// Subscribes to all addon objects.
    fn addons(&self) -> impl Future<Output = Result<Subscription<ManagedClusterAddOn>>> + Send;

    /// Subscribes to the single object named by `spec`.
    ///
    /// When the subscription is (re)established, every matching object is delivered as an event.
    fn config_object(
        &self,
        spec: &ConfigObjectSpec,
    ) -> impl Future<Output = Result<Subscription<DynamicObject>>> + Send;
}

/// The write API capability: updates addon status with optimistic concurrency.
pub trait StatusWriter: Send + Sync + 'static {
    /// Fails with [`Error::Conflict`](crate::Error::Conflict) on a stale write
    /// and [`Error::NotFound`](crate::Error::NotFound) if the addon is gone.
    fn update_status(&self, addon: &ManagedClusterAddOn) -> impl Future<Output = Result<()>> + Send;
}

/// Drops events for addons outside the recognised set.
pub fn only_named(
    events: impl Stream<Item = Result<Event>> + Send + 'static,
    names: Arc<BTreeSet<String>>,
) -> EventStream {
    Box::pin(events.try_filter(move |event| future::ready(names.contains(&event.key.name))))
}

pub mod cluster;
pub use cluster::{KubeRecorder, KubeStore};

#[cfg(test)]
mod tests {
    use futures::{stream, StreamExt};

    use super::*;

    fn event(namespace: &str, name: &str) -> Result<Event> {
        Ok(Event {
            key: QualifiedName {
                namespace: Some(namespace.into()),
                name: name.into(),
            },
            exists: true,
        })
    }

    #[tokio::test]
    async fn unknown_addon_names_are_dropped() {
        let names = Arc::new(BTreeSet::from(["a1".to_string(), "a2".to_string()]));
        let events = stream::iter(vec![
            event("ns1", "a1"),
            event("ns1", "unknown"),
            event("ns2", "a2"),
        ]);

        let keys: Vec<_> = only_named(events, names)
            .map(|event| event.unwrap().key.to_string())
            .collect()
            .await;
        assert_eq!(keys, ["ns1/a1", "ns2/a2"]);
    }

    #[test]
    fn cluster_scoped_reference_has_no_namespace() {
        let reference = ConfigReference {
            group: "cfg.test".into(),
            version: "v1".into(),
            resource: "tests".into(),
            namespace: String::new(),
            name: "t".into(),
            last_observed_generation: 0,
        };
        let spec = ConfigObjectSpec::from(&reference);
        assert_eq!(spec.namespace, None);
        assert_eq!(spec.qualified_name().to_string(), "t");
    }
}
