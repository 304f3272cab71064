use std::{
    collections::{hash_map, HashMap},
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::addon::{AddonKey, Fingerprint};

/// A running config watcher, owned by the supervisor.
pub struct ChildHandle {
    fingerprint: Fingerprint,
    token: CancellationToken,
    join_handle: JoinHandle<()>,
}

impl ChildHandle {
    pub fn new(
        fingerprint: Fingerprint,
        token: CancellationToken,
        join_handle: JoinHandle<()>,
    ) -> Self {
        Self {
            fingerprint,
            token,
            join_handle,
        }
    }

    /// The fingerprint of the reference this watcher was built for.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Whether the watcher loop has returned, cancelled or not.
    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Whether the watcher runs and has not been told, or decided, to stop.
    pub fn is_live(&self) -> bool {
        !self.token.is_cancelled() && !self.is_finished()
    }

    /// Whether this watcher is live and following `fingerprint`.
    pub fn is_current(&self, fingerprint: &Fingerprint) -> bool {
        &self.fingerprint == fingerprint && self.is_live()
    }

    /// Fires the cancel trigger without waiting. Firing twice is a no-op.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Fires the cancel trigger and waits up to `grace` for the watcher to return.
    ///
    /// A watcher still running after `grace` is aborted. Returns whether it exited in time.
    pub async fn cancel(mut self, grace: Duration) -> bool {
        self.token.cancel();
        match tokio::time::timeout(grace, &mut self.join_handle).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                if err.is_panic() {
                    log::error!("Config watcher for {} panicked", self.fingerprint);
                }
                true
            }
            Err(_) => {
                log::warn!(
                    "Config watcher for {} did not stop within {grace:?}, aborting",
                    self.fingerprint
                );
                self.join_handle.abort();
                false
            }
        }
    }
}

/// Live config watchers by addon.
///
/// Only the supervisor worker owning a key touches its entry, so the registry is plain data.
#[derive(Default)]
pub struct Registry {
    children: HashMap<AddonKey, ChildHandle>,
}

impl Registry {
    pub fn get(&self, key: &AddonKey) -> Option<&ChildHandle> {
        self.children.get(key)
    }

    /// Registers `handle` for `key`, returning the displaced handle if any.
    ///
    /// The supervisor always removes before inserting, so a displaced handle indicates a bug;
    /// it is still returned so the caller can cancel it.
    pub fn insert(&mut self, key: AddonKey, handle: ChildHandle) -> Option<ChildHandle> {
        match self.children.entry(key) {
            hash_map::Entry::Vacant(entry) => {
                entry.insert(handle);
                None
            }
            hash_map::Entry::Occupied(mut entry) => Some(entry.insert(handle)),
        }
    }

    pub fn remove(&mut self, key: &AddonKey) -> Option<ChildHandle> {
        self.children.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &AddonKey> {
        self.children.keys()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Cancels every watcher and waits for all of them, each bounded by `grace`.
    pub async fn shutdown(&mut self, grace: Duration) {
        let cancels = self.children.drain().map(|(key, handle)| async move {
            if !handle.cancel(grace).await {
                log::warn!("Abandoned config watcher of addon {key} during shutdown");
            }
        });
        futures::future::join_all(cancels).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use super::*;
    use crate::addon::ConfigReference;

    fn fingerprint(name: &str) -> Fingerprint {
        ConfigReference {
            group: "cfg.test".into(),
            version: "v1".into(),
            resource: "tests".into(),
            namespace: "ns1".into(),
            name: name.into(),
            last_observed_generation: 0,
        }
        .fingerprint()
    }

    fn spawn_child(name: &str, stopped: Arc<AtomicBool>) -> ChildHandle {
        let token = CancellationToken::new();
        let join_handle = tokio::spawn({
            let token = token.clone();
            async move {
                token.cancelled().await;
                stopped.store(true, Ordering::SeqCst);
            }
        });
        ChildHandle::new(fingerprint(name), token, join_handle)
    }

    #[tokio::test]
    async fn cancel_waits_for_the_child() {
        let stopped = Arc::new(AtomicBool::new(false));
        let handle = spawn_child("t", stopped.clone());
        assert!(handle.is_current(&fingerprint("t")));
        assert!(!handle.is_current(&fingerprint("u")));

        handle.trigger();
        handle.trigger();
        assert!(!handle.is_live());
        assert!(handle.cancel(Duration::from_secs(5)).await);
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_after_grace_period() {
        let token = CancellationToken::new();
        let join_handle = tokio::spawn(std::future::pending::<()>());
        let handle = ChildHandle::new(fingerprint("t"), token, join_handle);

        assert!(!handle.cancel(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn finished_child_is_not_current() {
        let token = CancellationToken::new();
        let join_handle = tokio::spawn(async {});
        let handle = ChildHandle::new(fingerprint("t"), token, join_handle);
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        assert!(!handle.is_current(&fingerprint("t")));
    }

    #[tokio::test]
    async fn shutdown_stops_every_child() {
        let mut registry = Registry::default();
        let flags: Vec<_> = (0..5).map(|_| Arc::new(AtomicBool::new(false))).collect();
        for (i, stopped) in flags.iter().enumerate() {
            let key = AddonKey::new("ns1", format!("a{i}"));
            assert!(registry.insert(key, spawn_child("t", stopped.clone())).is_none());
        }
        assert_eq!(registry.len(), 5);

        registry.shutdown(Duration::from_secs(5)).await;
        assert!(registry.is_empty());
        assert!(flags.iter().all(|stopped| stopped.load(Ordering::SeqCst)));
    }
}
