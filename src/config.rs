use std::{collections::BTreeSet, sync::Arc, time::Duration};

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};

use crate::{
    recorder::{LogRecorder, Recorder},
    runner::Supervisor,
    subscriber::{ObjectStore, StatusWriter},
};

/// Tunables of the supervisor and its config watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Interval at which every known addon key is enqueued again.
    pub resync_interval: Duration,
    /// Retry delays after a failed reconcile or status write.
    pub retry: RetryPolicy,
    /// How long to wait for a cancelled config watcher before abandoning it.
    pub cancel_grace_period: Duration,
    /// Deadline for each external call (subscription open, status write).
    pub call_timeout: Duration,
    /// Number of partitions addon keys are hashed into.
    /// Keys in different partitions reconcile in parallel.
    pub workers: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(10 * 60),
            retry: RetryPolicy::default(),
            cancel_grace_period: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            workers: 4,
        }
    }
}

/// Exponential retry delays, doubling from `initial` up to `max` and never giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5 * 60),
        }
    }
}

impl RetryPolicy {
    /// A fresh backoff following this policy.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial)
            .with_max_interval(self.max)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }

    /// The next delay of `backoff`, falling back to the ceiling.
    pub fn next_delay(&self, backoff: &mut ExponentialBackoff) -> Duration {
        backoff.next_backoff().unwrap_or(self.max)
    }
}

/// Collects the parameters of a [`Supervisor`].
pub struct Builder<Store, Writer, Rec> {
    store: Store,
    writer: Writer,
    recorder: Rec,
    addons: BTreeSet<String>,
    options: Options,
}

impl<Store, Writer, Rec> Builder<Store, Writer, Rec>
where
    Store: ObjectStore,
    Writer: StatusWriter,
    Rec: Recorder,
{
    /// Recognises addons with this name. Events for other addons are dropped.
    pub fn addon(mut self, name: impl Into<String>) -> Self {
        self.addons.insert(name.into());
        self
    }

    pub fn addons<I>(mut self, names: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.addons.extend(names.into_iter().map(Into::into));
        self
    }

    /// Replaces the default [`LogRecorder`].
    pub fn recorder<R: Recorder>(self, recorder: R) -> Builder<Store, Writer, R> {
        Builder {
            store: self.store,
            writer: self.writer,
            recorder,
            addons: self.addons,
            options: self.options,
        }
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Supervisor<Store, Writer, Rec> {
        Supervisor::new(
            Arc::new(self.store),
            Arc::new(self.writer),
            Arc::new(self.recorder),
            Arc::new(self.addons),
            self.options,
        )
    }
}

/// Starts building a [`Supervisor`] over an object store and a status writer.
pub fn supervise<Store, Writer>(store: Store, writer: Writer) -> Builder<Store, Writer, LogRecorder>
where
    Store: ObjectStore,
    Writer: StatusWriter,
{
    Builder {
        store,
        writer,
        recorder: LogRecorder,
        addons: BTreeSet::new(),
        options: Options::default(),
    }
}
