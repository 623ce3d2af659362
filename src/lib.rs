//! # fsebus
//!
//! An in-process re-implementation of a kernel filesystem-event broker:
//! producers report that something happened at a path, and a small set of
//! privileged consumers ("watchers") read a framed binary stream of those
//! events.
//!
//! The moving parts:
//!
//! * a fixed-capacity event pool — exhaustion is a first-class signal,
//!   surfaced to every watcher as a synthetic loss record;
//! * a global list of reference-counted events, fanned out into up to
//!   eight per-watcher ring buffers;
//! * a short-window duplicate filter for repeated events from the same
//!   producer;
//! * per-watcher backpressure that sheds the queue of a consumer that
//!   falls too far behind;
//! * timer-coalesced consumer wakeups;
//! * a cross-watcher unmount barrier;
//! * a compact tagged (TLV) wire encoding, framed so that consumers only
//!   ever observe whole records.
//!
//! Filesystem attribute lookup, path resolution, capability checks and
//! the path-intern table are pluggable [`collaborators`]; the bus itself
//! owns only the brokering.
//!
//! ```
//! use fsebus::{
//!   BusConfig, Collaborators, EventKind, EventSpec, FileInfo, FsEventBus, Target,
//! };
//!
//! let bus = FsEventBus::new(BusConfig::default(), Collaborators::default());
//! let info = FileInfo { ino: 100, dev: 1, mode: 0o100644, uid: 501, document_id: 0, nlink: 1 };
//! // With no watcher registered this is a no-op, but it is the whole
//! // producer API:
//! bus
//!   .publish(
//!     &EventSpec::regular(EventKind::ContentModified, Target::info(*b"/tmp/a", info)),
//!     1234,
//!   )
//!   .unwrap();
//! ```

mod bus;
pub mod collaborators;
pub mod device;
pub mod error;
mod messages;
mod poll_source;
mod structure;

pub use crate::{
  bus::{
    BusConfig, BusDiagnostics, EventSpec, FsEventBus, Target, WatcherDiagnostics, WatcherFlag,
    MAX_WATCHERS, MIN_READ_BUFFER,
  },
  collaborators::{
    Collaborators, FsResolver, MonotonicClock, NextLink, ResolvedPath, TaskCapabilities,
  },
  device::{CloneArgs, FsEventsDevice, WatcherHandle, MAX_DEVICE_FILTERS},
  messages::encode_record,
  poll_source::PollEventSource,
  structure::{
    intern::{InternedPath, NameTable, PathInterner},
    types::{
      AuditToken, Capability, Dev, EventKind, FileInfo, Handle, Inode, Interest, Owner, Pid,
      Uid, EVENTS_DROPPED_CODE, KIND_SPACE, MODE_HLINK, MODE_LAST_HLINK, MODE_REMOTE_DIR,
      MODE_TRUNCATED_PATH,
    },
  },
};

/// The TLV tag constants of the delivery stream, for consumers that
/// parse it.
pub mod wire {
  pub use crate::messages::wire::{
    ARG_AUDIT_TOKEN, ARG_DEV, ARG_DONE, ARG_FINFO, ARG_GID, ARG_INO, ARG_INT32, ARG_INT64,
    ARG_MODE, ARG_PATH, ARG_RAW, ARG_STRING, ARG_UID, ARG_VNODE, KIND_CODE_MASK,
    KIND_FLAG_COMBINED, KIND_FLAG_CONTAINS_DROPPED, KIND_FLAG_SHIFT,
  };
}
