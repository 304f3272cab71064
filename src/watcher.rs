//! The per-addon config watcher.
//!
//! A [`ConfigWatcher`] follows one configuration object and mirrors its generation
//! into the owning addon's `status.configReference.lastObservedGeneration`.

use std::{sync::Arc, time::Duration};

use backoff::backoff::Backoff;
use futures::StreamExt;
use kube_core::DynamicObject;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    addon::{AddonKey, Fingerprint, ManagedClusterAddOn},
    config::RetryPolicy,
    error::with_timeout,
    subscriber::{EventStream, Lister, QualifiedName, StatusWriter},
    Error, Result,
};

/// The generation to record after observing a config object at `generation`.
///
/// Objects that do not populate their generation bump the previous value instead.
pub fn next_observed_generation(previous: i64, generation: i64) -> i64 {
    if generation > 0 {
        generation
    } else {
        previous.saturating_add(1)
    }
}

pub struct ConfigWatcher<W> {
    addon: AddonKey,
    fingerprint: Fingerprint,
    config_namespace: Option<String>,
    configs: Arc<dyn Lister<DynamicObject>>,
    addons: Arc<dyn Lister<ManagedClusterAddOn>>,
    writer: Arc<W>,
    call_timeout: Duration,
    retry: RetryPolicy,
}

impl<W: StatusWriter> ConfigWatcher<W> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addon: AddonKey,
        fingerprint: Fingerprint,
        config_namespace: Option<String>,
        configs: Arc<dyn Lister<DynamicObject>>,
        addons: Arc<dyn Lister<ManagedClusterAddOn>>,
        writer: Arc<W>,
        call_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            addon,
            fingerprint,
            config_namespace,
            configs,
            addons,
            writer,
            call_timeout,
            retry,
        }
    }

    /// Refreshes the addon's observed generation from the config object named `name`.
    pub async fn sync(&self, name: &str) -> Result<()> {
        let config_key = QualifiedName {
            namespace: self.config_namespace.clone(),
            name: name.to_owned(),
        };
        let Some(config) = self.configs.get(&config_key) else {
            log::debug!("Config object {config_key} of addon {} not found", self.addon);
            return Ok(());
        };
        let Some(addon) = self.addons.get(&(&self.addon).into()) else {
            log::debug!("Addon {} not found", self.addon);
            return Ok(());
        };
        let Some(reference) = addon.config_reference() else {
            return Ok(());
        };
        if reference.fingerprint() != self.fingerprint {
            // the supervisor replaces this watcher; do not race the new one
            log::debug!(
                "Addon {} now references {}, skipping update from {}",
                self.addon,
                reference.fingerprint(),
                self.fingerprint
            );
            return Ok(());
        }

        let generation = config.metadata.generation.unwrap_or(0);
        let observed = next_observed_generation(reference.last_observed_generation, generation);
        if observed == reference.last_observed_generation {
            return Ok(());
        }

        let mut updated = ManagedClusterAddOn::clone(&addon);
        if let Some(reference) = updated
            .status
            .as_mut()
            .and_then(|status| status.config_reference.as_mut())
        {
            reference.last_observed_generation = observed;
        }

        match with_timeout(self.call_timeout, self.writer.update_status(&updated)).await {
            Ok(()) => {
                log::debug!(
                    "Addon {} observed generation {observed} of {}",
                    self.addon,
                    self.fingerprint
                );
                Ok(())
            }
            Err(Error::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Syncs once per delivered event until `token` is cancelled or the event stream ends.
    ///
    /// A failed sync is retried with backoff. Events arriving meanwhile queue up behind it, so each
    /// delivered event is applied exactly once.
    pub async fn run(self, token: CancellationToken, mut events: EventStream) {
        let mut backoff = self.retry.backoff();
        let mut name = String::new();
        let mut unapplied = 0u32;
        let mut retry_at: Option<Instant> = None;

        loop {
            let deadline = retry_at.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;
                () = token.cancelled() => return,
                () = sleep_until(deadline), if retry_at.is_some() => retry_at = None,
                event = events.next() => match event {
                    Some(Ok(event)) => {
                        name = event.key.name;
                        unapplied = unapplied.saturating_add(1);
                    }
                    Some(Err(err)) => {
                        log::warn!("Config watch of addon {} failed: {err}", self.addon);
                        continue;
                    }
                    None => {
                        log::warn!("Config watch of addon {} ended", self.addon);
                        return;
                    }
                },
            }
            if retry_at.is_some() {
                continue;
            }

            while unapplied > 0 {
                let result = tokio::select! {
                    biased;
                    () = token.cancelled() => return,
                    result = self.sync(&name) => result,
                };
                match result {
                    Ok(()) => {
                        unapplied -= 1;
                        backoff.reset();
                    }
                    Err(err) => {
                        let delay = self.retry.next_delay(&mut backoff);
                        log::warn!(
                            "Cannot update addon {} from {name}, retrying in {delay:?}: {err}",
                            self.addon
                        );
                        retry_at = Some(Instant::now() + delay);
                        break;
                    }
                }
            }
        }
    }
}
