// The producer-facing description of an event: one constructor shape per
// kind, with the target either an open handle (resolved through the
// filesystem oracle) or pre-resolved path + file info.

use crate::structure::types::{AuditToken, Dev, EventKind, FileInfo, Handle, Inode};

/// What a regular event is about. Producers inside the filesystem pass a
/// [`Handle`] and let the bus fetch attributes and the path; producers on
/// the write protocol pass everything pre-resolved.
#[derive(Debug, Clone)]
pub enum Target {
  Handle(Handle),
  Info { path: Vec<u8>, info: FileInfo },
}

impl Target {
  pub fn info(path: impl Into<Vec<u8>>, info: FileInfo) -> Target {
    Target::Info {
      path: path.into(),
      info,
    }
  }
}

/// A fully described event, ready to publish.
#[derive(Debug, Clone)]
pub enum EventSpec {
  /// Path-shaped events (create/delete/modify/rename/...). `dest` is
  /// only meaningful for the two-target kinds and may still be `None`
  /// for a rename whose destination did not previously exist.
  Regular {
    kind: EventKind,
    source: Target,
    dest: Option<Target>,
    /// Explicit uid override (ownership changes).
    uid_override: Option<u32>,
  },
  DocId {
    kind: EventKind, // DocIdCreated or DocIdChanged
    dev: Dev,
    src_ino: Inode,
    dst_ino: Inode,
    doc_id: u64,
  },
  Activity {
    version: u32,
    dev: Dev,
    ino: Inode,
    origin_id: u64,
    age: u64,
    use_state: u32,
    urgency: u32,
    size: u64,
  },
  AccessGranted {
    target: Target,
    /// Token of the process that was granted access; absent tokens mark
    /// the event as containing dropped data.
    audit_token: Option<AuditToken>,
  },
  UnmountPending {
    dev: Dev,
  },
}

impl EventSpec {
  /// Convenience constructor for single-target regular events.
  pub fn regular(kind: EventKind, source: Target) -> EventSpec {
    EventSpec::Regular {
      kind,
      source,
      dest: None,
      uid_override: None,
    }
  }

  /// Convenience constructor for the two-target kinds.
  pub fn two_target(kind: EventKind, source: Target, dest: Target) -> EventSpec {
    EventSpec::Regular {
      kind,
      source,
      dest: Some(dest),
      uid_override: None,
    }
  }

  pub fn kind(&self) -> EventKind {
    match self {
      EventSpec::Regular { kind, .. } | EventSpec::DocId { kind, .. } => *kind,
      EventSpec::Activity { .. } => EventKind::Activity,
      EventSpec::AccessGranted { .. } => EventKind::AccessGranted,
      EventSpec::UnmountPending { .. } => EventKind::UnmountPending,
    }
  }
}
