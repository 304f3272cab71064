//! Decides, per addon, whether a config watcher should run and which one.
//!
//! ```text
//!  NO_CHILD ── reference discovered ──▶ CHILD_RUNNING
//!     ▲                                    │     │
//!     └── deleted / cleared / addon gone ──┘     │ fingerprint changed:
//!                                                │ cancel, then build anew
//!                                                ▼
//!                                          CHILD_RUNNING
//! ```

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    addon::{AddonKey, ManagedClusterAddOn},
    factory::WatcherFactory,
    recorder::{Reason, Recorder},
    registry::Registry,
    subscriber::{Lister, ObjectStore, StatusWriter},
    Result,
};

pub struct AddonReconciler<S, W, R> {
    factory: WatcherFactory<S, W>,
    addons: Arc<dyn Lister<ManagedClusterAddOn>>,
    recorder: Arc<R>,
    cancel_grace_period: Duration,
    /// Parent scope of every config watcher.
    token: CancellationToken,
}

impl<S, W, R> AddonReconciler<S, W, R>
where
    S: ObjectStore,
    W: StatusWriter,
    R: Recorder,
{
    pub fn new(
        factory: WatcherFactory<S, W>,
        addons: Arc<dyn Lister<ManagedClusterAddOn>>,
        recorder: Arc<R>,
        cancel_grace_period: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            factory,
            addons,
            recorder,
            cancel_grace_period,
            token,
        }
    }

    /// Reconciles the watcher of the addon `key` (`namespace/name`) in `registry`.
    ///
    /// The caller guarantees `sync` is never entered concurrently for the same key.
    pub async fn sync(&self, registry: &mut Registry, key: &str) -> Result<()> {
        let key: AddonKey = key.parse()?;
        let addon = self.addons.get(&(&key).into());

        let Some((addon, reference)) = addon
            .as_deref()
            .and_then(|addon| Some((addon, addon.desired_reference()?)))
        else {
            if let Some(handle) = registry.remove(&key) {
                log::info!("Stopping config watcher of addon {key} on {}", handle.fingerprint());
                self.recorder.record(
                    &key,
                    Reason::ConfigWatcherStopped,
                    format!("stopped watching {}", handle.fingerprint()),
                );
                handle.cancel(self.cancel_grace_period).await;
            }
            return Ok(());
        };

        let fingerprint = reference.fingerprint();
        if let Some(handle) = registry.get(&key) {
            if handle.is_current(&fingerprint) {
                return Ok(());
            }
        }
        if let Some(handle) = registry.remove(&key) {
            if handle.fingerprint() == &fingerprint {
                log::warn!("Config watcher of addon {key} exited, restarting on {fingerprint}");
            } else {
                log::info!(
                    "Config reference of addon {key} changed from {} to {fingerprint}",
                    handle.fingerprint()
                );
                self.recorder.record(
                    &key,
                    Reason::ConfigReferenceChanged,
                    format!(
                        "config reference changed from {} to {fingerprint}",
                        handle.fingerprint()
                    ),
                );
            }
            // the old watcher must be gone before the new one can write
            handle.cancel(self.cancel_grace_period).await;
        }

        let handle = self.factory.build(&self.token, addon).await?;
        log::info!("Starting config watcher of addon {key} on {fingerprint}");
        self.recorder.record(
            &key,
            Reason::ConfigWatcherStarted,
            format!("watching {fingerprint}"),
        );
        if let Some(displaced) = registry.insert(key, handle) {
            displaced.cancel(self.cancel_grace_period).await;
        }
        Ok(())
    }
}
