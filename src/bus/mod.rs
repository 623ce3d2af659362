//! The event broker core: publish pipeline, watcher registry, per-watcher
//! rings, coalesced wakeups and the delivery drain.

use std::time::Duration;

pub(crate) mod broker;
pub(crate) mod coalesce;
pub(crate) mod delivery;
pub(crate) mod publish;
pub(crate) mod spec;
pub(crate) mod wakeup;
pub(crate) mod watcher;

pub use broker::{BusDiagnostics, FsEventBus, WatcherDiagnostics, MAX_WATCHERS};
pub use delivery::MIN_READ_BUFFER;
pub use spec::{EventSpec, Target};
pub use watcher::{Watcher, WatcherFlag};

/// Tunables of a bus instance. Production deployments keep the
/// defaults; tests shrink the time-based ones.
#[derive(Debug, Clone)]
pub struct BusConfig {
  /// Fixed capacity of the event pool. The pool never grows.
  pub pool_capacity: usize,
  /// How long a low-watermark arrival may sit before its watcher is
  /// woken.
  pub delivery_delay: Duration,
  /// Window within which identical back-to-back events are suppressed.
  pub dedup_window: Duration,
  /// Sleep quantum of the unmount barrier.
  pub unmount_tick: Duration,
  /// How many ticks the barrier waits before giving up.
  pub unmount_retries: u32,
}

impl Default for BusConfig {
  fn default() -> BusConfig {
    BusConfig {
      pool_capacity: 4096,
      delivery_delay: Duration::from_millis(10),
      dedup_window: Duration::from_secs(1),
      unmount_tick: Duration::from_secs(1),
      unmount_retries: 10,
    }
  }
}
