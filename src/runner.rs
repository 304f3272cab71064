use std::{
    collections::{hash_map::DefaultHasher, BTreeSet, HashMap},
    hash::{Hash, Hasher},
    sync::Arc,
};

use backoff::ExponentialBackoff;
use futures::StreamExt;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::{
    sync::CancellationToken,
    time::{delay_queue, DelayQueue},
};

use crate::{
    addon::ManagedClusterAddOn,
    config::Options,
    error::with_timeout,
    factory::WatcherFactory,
    recorder::Recorder,
    registry::Registry,
    subscriber::{self, Lister, ObjectStore, StatusWriter, Subscription},
    supervisor::AddonReconciler,
    Result,
};

/// Runs one config watcher per recognised addon. Built with [`supervise`](crate::supervise).
pub struct Supervisor<S, W, R> {
    store: Arc<S>,
    writer: Arc<W>,
    recorder: Arc<R>,
    addons: Arc<BTreeSet<String>>,
    options: Options,
}

enum Work {
    Sync(String),
    /// Reconcile every key the partition holds a watcher for.
    Resync,
}

impl<S, W, R> Supervisor<S, W, R>
where
    S: ObjectStore,
    W: StatusWriter,
    R: Recorder,
{
    pub(crate) fn new(
        store: Arc<S>,
        writer: Arc<W>,
        recorder: Arc<R>,
        addons: Arc<BTreeSet<String>>,
        options: Options,
    ) -> Self {
        Self {
            store,
            writer,
            recorder,
            addons,
            options,
        }
    }

    /// Reconciles addons until `shutdown` is cancelled, then stops every config watcher.
    ///
    /// Fails only if the addon subscription cannot be opened.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let token = shutdown.child_token();
        let Subscription {
            lister: addons,
            events,
        } = with_timeout(self.options.call_timeout, self.store.addons()).await?;
        let mut events = subscriber::only_named(events, Arc::clone(&self.addons));

        let (exits_tx, mut exits_rx) = mpsc::unbounded_channel();
        let factory = WatcherFactory::new(
            Arc::clone(&self.store),
            Arc::clone(&self.writer),
            Arc::clone(&addons),
            self.options.clone(),
        )
        .notify_exits(exits_tx);
        let reconciler = Arc::new(AddonReconciler::new(
            factory,
            Arc::clone(&addons),
            Arc::clone(&self.recorder),
            self.options.cancel_grace_period,
            token.clone(),
        ));

        let (partitions, workers): (Vec<_>, Vec<_>) = (0..self.options.workers.max(1))
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                let worker = Worker {
                    reconciler: Arc::clone(&reconciler),
                    options: self.options.clone(),
                    token: token.clone(),
                };
                (tx, tokio::spawn(worker.run(rx)))
            })
            .unzip();
        let dispatcher = Dispatcher {
            partitions,
            addons,
            names: Arc::clone(&self.addons),
        };

        log::info!("Supervising config watchers for addons {:?}", self.addons);
        let start = Instant::now() + self.options.resync_interval;
        let mut resync = interval_at(start, self.options.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                Some(key) = exits_rx.recv() => dispatcher.route(key),
                event = events.next(), if events_open => match event {
                    Some(Ok(event)) => dispatcher.route(event.key.to_string()),
                    Some(Err(err)) => {
                        log::warn!("Addon subscription interrupted, resyncing: {err}");
                        dispatcher.resync();
                    }
                    None => {
                        log::warn!("Addon subscription ended");
                        events_open = false;
                    }
                },
                _ = resync.tick() => dispatcher.resync(),
            }
        }

        log::info!("Stopping config watchers");
        drop(dispatcher);
        drop(events);
        join_workers(workers).await;
        Ok(())
    }
}

struct Dispatcher {
    partitions: Vec<mpsc::UnboundedSender<Work>>,
    addons: Arc<dyn Lister<ManagedClusterAddOn>>,
    names: Arc<BTreeSet<String>>,
}

impl Dispatcher {
    /// Sends `key` to its partition, so the same key never reconciles concurrently.
    fn route(&self, key: String) {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let partition = (hasher.finish() % self.partitions.len() as u64) as usize;
        if self.partitions[partition].send(Work::Sync(key)).is_err() {
            log::debug!("Partition {partition} closed, dropping work");
        }
    }

    fn resync(&self) {
        for key in self.addons.keys() {
            if self.names.contains(&key.name) {
                self.route(key.to_string());
            }
        }
        // covers watchers of addons that have disappeared from the lister
        for partition in &self.partitions {
            let _ = partition.send(Work::Resync);
        }
    }
}

struct Worker<S, W, R> {
    reconciler: Arc<AddonReconciler<S, W, R>>,
    options: Options,
    token: CancellationToken,
}

/// The single pending retry of a failing key.
struct Retry {
    backoff: ExponentialBackoff,
    entry: Option<delay_queue::Key>,
}

impl<S, W, R> Worker<S, W, R>
where
    S: ObjectStore,
    W: StatusWriter,
    R: Recorder,
{
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Work>) {
        let mut registry = Registry::default();
        let mut retries = HashMap::<String, Retry>::new();
        let mut queue = DelayQueue::<String>::new();

        loop {
            let keys = tokio::select! {
                biased;
                () = self.token.cancelled() => break,
                Some(expired) = queue.next() => {
                    let key = expired.into_inner();
                    if let Some(retry) = retries.get_mut(&key) {
                        retry.entry = None;
                    }
                    vec![key]
                }
                work = rx.recv() => match work {
                    Some(Work::Sync(key)) => vec![key],
                    Some(Work::Resync) => registry.keys().map(ToString::to_string).collect(),
                    None => break,
                },
            };

            for key in keys {
                let result = tokio::select! {
                    biased;
                    () = self.token.cancelled() => break,
                    result = self.reconciler.sync(&mut registry, &key) => result,
                };
                match result {
                    Ok(()) => forget(&mut retries, &mut queue, &key),
                    Err(err) if !err.is_retryable() => {
                        log::error!("Dropping addon key {key:?}: {err}");
                        forget(&mut retries, &mut queue, &key);
                    }
                    Err(err) => {
                        let retry = retries.entry(key.clone()).or_insert_with(|| Retry {
                            backoff: self.options.retry.backoff(),
                            entry: None,
                        });
                        let delay = self.options.retry.next_delay(&mut retry.backoff);
                        log::warn!("Reconcile of addon {key} failed, retrying in {delay:?}: {err}");
                        let entry = match retry.entry.take() {
                            Some(entry) => {
                                queue.reset(&entry, delay);
                                entry
                            }
                            None => queue.insert(key, delay),
                        };
                        retry.entry = Some(entry);
                    }
                }
            }
        }

        registry.shutdown(self.options.cancel_grace_period).await;
    }
}

/// Drops the retry state of `key`, cancelling its pending retry.
fn forget(retries: &mut HashMap<String, Retry>, queue: &mut DelayQueue<String>, key: &str) {
    if let Some(Retry {
        entry: Some(entry), ..
    }) = retries.remove(key)
    {
        queue.remove(&entry);
    }
}

async fn join_workers(workers: Vec<JoinHandle<()>>) {
    for result in futures::future::join_all(workers).await {
        if let Err(err) = result {
            log::error!("Supervisor worker failed: {err}");
        }
    }
}
