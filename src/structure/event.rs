// The event record itself. Events are shared by reference between the
// global list and up to eight watcher queues, so everything here is
// frozen once creation completes; the only mutable parts are the atomic
// refcount and the atomic flag word.

use std::sync::{
  atomic::{AtomicI32, AtomicU16, Ordering},
  Arc, OnceLock,
};

use enumflags2::{bitflags, BitFlags};

use super::{
  intern::InternedPath,
  types::{AuditToken, Dev, EventKind, Inode, Pid, Uid},
};

/// Per-event state bits.
#[bitflags]
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFlag {
  /// Several identical events were folded into this one.
  CombinedEvents = 0x0001,
  /// Part of the payload could not be gathered (bad path, bad token).
  ContainsDroppedData = 0x0002,
  /// The event is spliced onto the global list.
  OnList = 0x0004,
  /// Payload fill is still in progress; delivery must skip the event.
  BeingCreated = 0x0008,
}

#[derive(Debug, Clone)]
pub struct RegularPayload {
  pub dev: Dev,
  pub ino: Inode,
  pub mode: i32,
  pub uid: Uid,
  pub document_id: u32,
  pub path: Option<InternedPath>,
}

#[derive(Debug, Clone, Copy)]
pub struct DocIdPayload {
  pub dev: Dev,
  pub src_ino: Inode,
  pub dst_ino: Inode,
  pub doc_id: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ActivityPayload {
  pub version: u32,
  pub dev: Dev,
  pub ino: Inode,
  pub origin_id: u64,
  pub age: u64,
  pub use_state: u32,
  pub urgency: u32,
  pub size: u64,
}

#[derive(Debug, Clone)]
pub struct AccessGrantedPayload {
  pub audit_token: AuditToken,
  pub path: Option<InternedPath>,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
  Regular(RegularPayload),
  DocId(DocIdPayload),
  Activity(ActivityPayload),
  AccessGranted(AccessGrantedPayload),
  UnmountPending { dev: Dev },
}

/// One filesystem-change notification.
///
/// Allocated from the bounded pool, spliced onto the global event list and
/// then referenced from the queues of every interested watcher. `refcount`
/// tracks those holders; when it reaches zero the pool slot and the
/// interned path are returned.
#[derive(Debug)]
pub struct Event {
  pub(crate) kind: EventKind,
  /// Monotonic tick captured at allocation; doubles as the ordering key
  /// and as the watcher-visible event id.
  pub(crate) timestamp: u64,
  pub(crate) pid: Pid,
  pub(crate) refcount: AtomicI32,
  flags: AtomicU16,
  /// Linked destination of a Rename/Exchange/Clone pair. The destination
  /// is on the global list for accounting but is never fanned out on its
  /// own; delivering the source consumes it.
  pub(crate) dest: Option<Arc<Event>>,
  payload: OnceLock<EventPayload>,
}

impl Event {
  pub(crate) fn new(kind: EventKind, timestamp: u64, pid: Pid, dest: Option<Arc<Event>>) -> Event {
    Event {
      kind,
      timestamp,
      pid,
      refcount: AtomicI32::new(1),
      flags: AtomicU16::new(EventFlag::BeingCreated as u16),
      dest,
      payload: OnceLock::new(),
    }
  }

  pub fn kind(&self) -> EventKind {
    self.kind
  }

  pub fn timestamp(&self) -> u64 {
    self.timestamp
  }

  pub fn pid(&self) -> Pid {
    self.pid
  }

  pub(crate) fn set_flag(&self, flag: EventFlag) {
    self.flags.fetch_or(flag as u16, Ordering::SeqCst);
  }

  pub(crate) fn clear_flag(&self, flag: EventFlag) {
    self.flags.fetch_and(!(flag as u16), Ordering::SeqCst);
  }

  pub(crate) fn has_flag(&self, flag: EventFlag) -> bool {
    self.flags.load(Ordering::SeqCst) & (flag as u16) != 0
  }

  pub(crate) fn flag_bits(&self) -> BitFlags<EventFlag> {
    BitFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
  }

  /// Publish the payload. May be called exactly once, before the
  /// `BeingCreated` flag is cleared.
  pub(crate) fn set_payload(&self, payload: EventPayload) {
    if self.payload.set(payload).is_err() {
      panic!("event payload initialized twice (kind {:?})", self.kind);
    }
  }

  pub(crate) fn payload(&self) -> Option<&EventPayload> {
    self.payload.get()
  }

  pub(crate) fn regular(&self) -> Option<&RegularPayload> {
    match self.payload.get() {
      Some(EventPayload::Regular(r)) => Some(r),
      _ => None,
    }
  }

  /// Device used for denylist filtering during fan-out. Only regular
  /// payloads are filtered: unmount-pending must reach every subscriber
  /// for the ack barrier to drain, and docid/activity/access events carry
  /// no per-volume path activity.
  pub(crate) fn fanout_dev(&self) -> Option<Dev> {
    self.regular().map(|r| r.dev)
  }

  /// The interned path of regular and access-granted payloads.
  pub(crate) fn path(&self) -> Option<&InternedPath> {
    match self.payload.get() {
      Some(EventPayload::Regular(r)) => r.path.as_ref(),
      Some(EventPayload::AccessGranted(a)) => a.path.as_ref(),
      _ => None,
    }
  }
}
