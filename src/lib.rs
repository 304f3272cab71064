//! addon-config-supervisor runs one narrowly scoped config watcher per addon
//! on a cluster-management hub.
//!
//! Each `ManagedClusterAddOn` may reference a single configuration object of any type
//! through `status.configReference`. The [`Supervisor`] subscribes to addon events and,
//! for every recognised addon, starts, keeps, replaces or stops a
//! [`ConfigWatcher`](watcher::ConfigWatcher) so that exactly the referenced object is watched.
//! The watcher copies the object's generation into the addon's `lastObservedGeneration`.
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use addon_config_supervisor::{supervise, KubeRecorder, KubeStore};
//! use tokio_util::sync::CancellationToken;
//!
//! let client = kube::Client::try_default().await?;
//! let store = KubeStore::new(client.clone());
//! let supervisor = supervise(store.clone(), store)
//!     .addons(["application-manager", "config-policy-controller"])
//!     .recorder(KubeRecorder::new(client, "addon-config-supervisor"))
//!     .build();
//! supervisor.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod addon;
pub mod config;
pub use config::{supervise, Options, RetryPolicy};
mod error;
pub use error::{Error, Result};
pub mod factory;
pub mod recorder;
pub mod registry;
mod runner;
pub use runner::Supervisor;
pub mod subscriber;
pub use subscriber::{KubeRecorder, KubeStore};
pub mod supervisor;
pub mod watcher;
