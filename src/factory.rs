use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    addon::ManagedClusterAddOn,
    config::Options,
    error::with_timeout,
    registry::ChildHandle,
    subscriber::{ConfigObjectSpec, Lister, ObjectStore, StatusWriter},
    watcher::ConfigWatcher,
    Error, Result,
};

/// Builds config watchers for the runtime-typed references of addons.
pub struct WatcherFactory<S, W> {
    store: Arc<S>,
    writer: Arc<W>,
    addons: Arc<dyn Lister<ManagedClusterAddOn>>,
    options: Options,
    /// Receives the addon key of a watcher that stopped without being cancelled.
    exits: Option<mpsc::UnboundedSender<String>>,
}

impl<S: ObjectStore, W: StatusWriter> WatcherFactory<S, W> {
    pub fn new(
        store: Arc<S>,
        writer: Arc<W>,
        addons: Arc<dyn Lister<ManagedClusterAddOn>>,
        options: Options,
    ) -> Self {
        Self {
            store,
            writer,
            addons,
            options,
            exits: None,
        }
    }

    pub fn notify_exits(mut self, exits: mpsc::UnboundedSender<String>) -> Self {
        self.exits = Some(exits);
        self
    }

    /// Subscribes to the object `addon` references and starts a watcher for it
    /// under a child scope of `parent`.
    ///
    /// Nothing is left running if the subscription cannot be opened.
    pub async fn build(
        &self,
        parent: &CancellationToken,
        addon: &ManagedClusterAddOn,
    ) -> Result<ChildHandle> {
        let key = addon.key();
        let Some(reference) = addon.desired_reference() else {
            return Err(Error::NoReference(key));
        };
        let fingerprint = reference.fingerprint();
        let spec = ConfigObjectSpec::from(reference);

        let subscription = with_timeout(self.options.call_timeout, self.store.config_object(&spec))
            .await
            .map_err(|err| Error::Build {
                fingerprint: fingerprint.clone(),
                source: Box::new(err),
            })?;

        let watcher = ConfigWatcher::new(
            key.clone(),
            fingerprint.clone(),
            spec.namespace,
            subscription.lister,
            Arc::clone(&self.addons),
            Arc::clone(&self.writer),
            self.options.call_timeout,
            self.options.retry,
        );

        let token = parent.child_token();
        let join_handle = tokio::spawn({
            let token = token.clone();
            let exits = self.exits.clone();
            let events = subscription.events;
            async move {
                let result = AssertUnwindSafe(watcher.run(token.clone(), events))
                    .catch_unwind()
                    .await;
                if result.is_err() {
                    log::error!("Config watcher of addon {key} panicked");
                }
                if !token.is_cancelled() {
                    log::warn!("Config watcher of addon {key} stopped unexpectedly");
                    // marks the handle stale before the supervisor hears about it
                    token.cancel();
                    if let Some(exits) = exits {
                        let _ = exits.send(key.to_string());
                    }
                }
            }
        });

        Ok(ChildHandle::new(fingerprint, token, join_handle))
    }
}
