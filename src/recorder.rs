use std::fmt;

use crate::addon::AddonKey;

/// Why the supervisor changed the config watcher of an addon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    ConfigWatcherStarted,
    ConfigWatcherStopped,
    ConfigReferenceChanged,
}

impl Reason {
    pub fn action(self) -> &'static str {
        match self {
            Reason::ConfigWatcherStarted => "StartConfigWatcher",
            Reason::ConfigWatcherStopped => "StopConfigWatcher",
            Reason::ConfigReferenceChanged => "ReplaceConfigWatcher",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Fire-and-forget sink for supervisor events.
pub trait Recorder: Send + Sync + 'static {
    fn record(&self, addon: &AddonKey, reason: Reason, note: String);
}

/// Writes events to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRecorder;

impl Recorder for LogRecorder {
    fn record(&self, addon: &AddonKey, reason: Reason, note: String) {
        log::info!("{reason} for addon {addon}: {note}");
    }
}
