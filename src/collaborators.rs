//! Contracts for the services the bus depends on but does not implement:
//! filesystem attribute and path lookup, hardlink sibling enumeration,
//! capability checks and the monotonic clock. Embedders supply real
//! implementations; the provided defaults are enough for tests and for
//! producers that pre-resolve everything themselves.

use std::{
  sync::Arc,
  time::Instant,
};

use crate::structure::{
  intern::{NameTable, PathInterner},
  types::{Capability, Dev, FileInfo, Handle, Pid},
};

/// A resolved path plus a truncation marker. A truncated resolution is
/// still delivered, but the event is tagged as containing dropped data.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
  pub path: Vec<u8>,
  pub truncated: bool,
}

impl ResolvedPath {
  pub fn complete(path: impl Into<Vec<u8>>) -> ResolvedPath {
    ResolvedPath {
      path: path.into(),
      truncated: false,
    }
  }
}

/// One step of hardlink sibling enumeration. `path` is `None` when the
/// link id advanced but its path could not be resolved (broken link);
/// such siblings consume replication budget without producing an event.
#[derive(Debug, Clone)]
pub struct NextLink {
  pub linkid: u64,
  pub path: Option<Vec<u8>>,
}

/// Filesystem oracle: attributes, paths and hardlink siblings for open
/// handles. All lookups may block.
pub trait FsResolver: Send + Sync {
  /// `None` means the handle could not be examined; the publish fails.
  fn attributes(&self, handle: Handle) -> Option<FileInfo>;

  /// `None` means no path could be produced at all; the publish fails
  /// with `NotFound`.
  fn path_of(&self, handle: Handle) -> Option<ResolvedPath>;

  /// Advance hardlink enumeration on `dev` past `linkid`. `None` ends
  /// the walk.
  fn next_link(&self, dev: Dev, linkid: u64) -> Option<NextLink>;
}

/// Capability check for watcher owners and device openers.
pub trait TaskCapabilities: Send + Sync {
  fn task_has(&self, pid: Pid, cap: Capability) -> bool;
}

/// Monotonic tick source. Ticks are nanoseconds from an arbitrary origin
/// and must never decrease.
pub trait MonotonicClock: Send + Sync {
  fn now(&self) -> u64;
}

/// A resolver for producers that always supply pre-resolved file info
/// (e.g. the write protocol). Every lookup fails.
#[derive(Debug, Default)]
pub struct NullResolver;

impl FsResolver for NullResolver {
  fn attributes(&self, _handle: Handle) -> Option<FileInfo> {
    None
  }

  fn path_of(&self, _handle: Handle) -> Option<ResolvedPath> {
    None
  }

  fn next_link(&self, _dev: Dev, _linkid: u64) -> Option<NextLink> {
    None
  }
}

/// Grants every capability to every task.
#[derive(Debug, Default)]
pub struct GrantAll;

impl TaskCapabilities for GrantAll {
  fn task_has(&self, _pid: Pid, _cap: Capability) -> bool {
    true
  }
}

/// Grants nothing to anyone.
#[derive(Debug, Default)]
pub struct GrantNone;

impl TaskCapabilities for GrantNone {
  fn task_has(&self, _pid: Pid, _cap: Capability) -> bool {
    false
  }
}

/// Monotonic clock backed by `std::time::Instant`.
#[derive(Debug)]
pub struct SystemClock {
  origin: Instant,
}

impl Default for SystemClock {
  fn default() -> SystemClock {
    SystemClock {
      origin: Instant::now(),
    }
  }
}

impl MonotonicClock for SystemClock {
  fn now(&self) -> u64 {
    self.origin.elapsed().as_nanos() as u64
  }
}

/// The pluggable services a bus instance is built from.
#[derive(Clone)]
pub struct Collaborators {
  pub resolver: Arc<dyn FsResolver>,
  pub interner: Arc<dyn PathInterner>,
  pub capabilities: Arc<dyn TaskCapabilities>,
  pub clock: Arc<dyn MonotonicClock>,
}

impl Default for Collaborators {
  fn default() -> Collaborators {
    Collaborators {
      resolver: Arc::new(NullResolver),
      interner: Arc::new(NameTable::new()),
      capabilities: Arc::new(GrantNone),
      clock: Arc::new(SystemClock::default()),
    }
  }
}
