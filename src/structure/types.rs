// Basic vocabulary of the event bus: event kinds, interest values,
// file metadata records and producer-side identifiers.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use static_assertions::const_assert_eq;

/// Device (volume) identifier, as reported by the filesystem.
pub type Dev = i32;
/// 64-bit inode number.
pub type Inode = u64;
/// Owner uid of a file.
pub type Uid = u32;
/// Process id of a producer or a watcher owner.
pub type Pid = i32;

/// Number of assignable event kind codes. Kind codes on the wire are
/// `0..KIND_SPACE`, except for the synthetic [`EVENTS_DROPPED_CODE`].
pub const KIND_SPACE: usize = 17;

/// Wire code of the synthetic "events were dropped" record. Never a queued
/// event kind; it is fabricated at delivery time.
pub const EVENTS_DROPPED_CODE: i32 = 999;

/// What happened at a path. The numeric codes are stable and appear on the
/// wire as the leading `i32` of each delivered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(i32)]
pub enum EventKind {
  CreateFile = 0,
  Delete = 1,
  StatChanged = 2,
  Rename = 3,
  ContentModified = 4,
  Exchange = 5,
  FinderInfoChanged = 6,
  CreateDir = 7,
  Chown = 8,
  XattrModified = 9,
  XattrRemoved = 10,
  DocIdCreated = 11,
  DocIdChanged = 12,
  UnmountPending = 13,
  Clone = 14,
  Activity = 15,
  AccessGranted = 16,
}

const_assert_eq!(EventKind::AccessGranted as usize + 1, KIND_SPACE);

impl EventKind {
  pub fn code(self) -> i32 {
    self as i32
  }

  pub fn from_code(code: i32) -> Option<EventKind> {
    EventKind::from_i32(code)
  }

  /// Two-target operations carry a linked destination event.
  pub fn takes_dest(self) -> bool {
    matches!(self, EventKind::Rename | EventKind::Exchange | EventKind::Clone)
  }

  /// Kinds whose payload is the regular (dev/ino/mode/uid/path) record.
  pub fn is_regular(self) -> bool {
    !matches!(
      self,
      EventKind::DocIdCreated
        | EventKind::DocIdChanged
        | EventKind::Activity
        | EventKind::AccessGranted
        | EventKind::UnmountPending
    )
  }

  /// Whether back-to-back duplicates of this kind may be suppressed.
  /// Creation, deletion, two-target ops and ownership changes are never
  /// superfluous, and access grants may target different processes.
  pub fn dedup_eligible(self) -> bool {
    !matches!(
      self,
      EventKind::CreateFile
        | EventKind::Delete
        | EventKind::Rename
        | EventKind::Exchange
        | EventKind::Chown
        | EventKind::DocIdChanged
        | EventKind::DocIdCreated
        | EventKind::Clone
        | EventKind::Activity
        | EventKind::AccessGranted
    )
  }

  /// Content/metadata kinds that are replicated across hardlink siblings.
  pub fn replicates_hardlinks(self) -> bool {
    matches!(
      self,
      EventKind::StatChanged
        | EventKind::ContentModified
        | EventKind::FinderInfoChanged
        | EventKind::XattrModified
    )
  }
}

/// Per-kind subscription state in a watcher's interest vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum Interest {
  Report = 0,
  Ignore = 1,
}

// Hints packed into the high bits of `FileInfo::mode`, above the
// file-type and permission bits.
pub const MODE_HLINK: i32 = 1 << 31;
pub const MODE_LAST_HLINK: i32 = 1 << 30;
pub const MODE_REMOTE_DIR: i32 = 1 << 29;
pub const MODE_TRUNCATED_PATH: i32 = 1 << 28;

/// File metadata as supplied by producers (or the attribute oracle).
///
/// The wire layout of the producer write protocol fixes this record at
/// [`FileInfo::WIRE_SIZE`] bytes in field order; the compact delivery
/// encoding reuses the leading [`FileInfo::COPY_SIZE`] bytes (everything
/// up to `nlink`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileInfo {
  pub ino: Inode,
  pub dev: Dev,
  pub mode: i32,
  pub uid: Uid,
  pub document_id: u32,
  pub nlink: u64,
}

impl FileInfo {
  pub const WIRE_SIZE: usize = 32;
  pub const COPY_SIZE: usize = 24; // ino + dev + mode + uid + document_id
}

const_assert_eq!(FileInfo::COPY_SIZE + std::mem::size_of::<u64>(), FileInfo::WIRE_SIZE);

/// Identity of an open file as seen by a producer: a handle id plus a
/// generation counter, so that a recycled id does not alias its
/// predecessor (used by the duplicate filter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
  pub id: u64,
  pub gen: u32,
}

/// Opaque audit token of the process granted access, forwarded verbatim
/// in `AccessGranted` events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditToken(pub [u32; 8]);

impl AuditToken {
  pub const WIRE_SIZE: usize = 32;
}

/// Capabilities a watcher owner may hold; checked through the
/// [`TaskCapabilities`](crate::collaborators::TaskCapabilities) collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
  /// May open the control device at all.
  Superuser,
  /// Privileged watcher service: exempt from backpressure shedding and
  /// ignored-directory suppression.
  WatchEvents,
  /// May subscribe to `Activity` events.
  WatchActivity,
  /// May subscribe to `AccessGranted` events (they leak audit tokens).
  WatchAccessGranted,
}

/// Identification of the process owning a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
  pub pid: Pid,
  pub name: String,
}
