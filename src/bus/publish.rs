// The publish pipeline: duplicate suppression, pool allocation, payload
// fill through the collaborators, fan-out and hardlink replication.

use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  bus::{
    broker::BusCore,
    coalesce::DedupIdent,
    spec::{EventSpec, Target},
  },
  error::{PublishError, PublishResult},
  structure::{
    event::{
      AccessGrantedPayload, ActivityPayload, DocIdPayload, Event, EventFlag, EventPayload,
      RegularPayload,
    },
    types::{
      AuditToken, Dev, EventKind, Pid, MODE_HLINK, MODE_LAST_HLINK, MODE_TRUNCATED_PATH,
    },
  },
};

/// Upper bound on events replicated across hardlink siblings.
pub(crate) const MAX_HARDLINK_NOTIFICATIONS: u64 = 128;

/// Hardlink replication parameters gathered while filling the source
/// payload.
struct HardlinkSeed {
  dev: Dev,
  linkid: u64,
  budget: u64,
}

impl BusCore {
  pub(crate) fn publish_internal(
    &self,
    spec: &EventSpec,
    pid: Pid,
    path_override: Option<&[u8]>,
  ) -> PublishResult<()> {
    let kind = spec.kind();
    validate(spec)?;

    // If no one cares about this kind of event, bail out early.
    {
      let registry = self.registry.lock().unwrap();
      if registry.interest_counts[kind.code() as usize] == 0 {
        return Ok(());
      }
    }

    let slots = if kind.takes_dest() { 2 } else { 1 };

    let event = {
      let mut list = self.list.lock().unwrap();
      // Under the list lock, so timestamps are non-decreasing in
      // allocation order.
      let now = self.clock.now();

      // Replicated sibling events carry an override path and are never
      // duplicates of each other.
      if path_override.is_none()
        && list
          .dedup
          .should_suppress(kind, dedup_ident(spec), pid, now, self.dedup_window_ns)
      {
        return Ok(());
      }

      if !self.pool.try_reserve(slots) {
        drop(list);
        self.note_exhaustion();
        return Err(PublishError::NoSpace);
      }

      let dest = kind
        .takes_dest()
        .then(|| Arc::new(Event::new(kind, now, pid, None)));
      let event = Arc::new(Event::new(kind, now, pid, dest.clone()));

      for ev in std::iter::once(&event).chain(dest.as_ref()) {
        ev.set_flag(EventFlag::OnList);
        list.events.insert(Arc::as_ptr(ev) as usize, Arc::clone(ev));
      }
      if kind == EventKind::Rename {
        list.num_pending_rename += 1;
      }
      list.dedup.remember(&event);
      event
    };

    // Payload fill happens outside the list lock; attribute and path
    // lookups may block.
    if let Err(e) = self.fill_payloads(&event, spec, path_override) {
      self.release_event_ref(&event);
      return Err(e);
    }
    let seed = self.hardlink_seed(&event, spec, path_override);

    if let Some(dest) = &event.dest {
      dest.clear_flag(EventFlag::BeingCreated);
    }
    event.clear_flag(EventFlag::BeingCreated);

    self.fan_out(&event);

    let mut result = Ok(());
    if let Some(seed) = seed {
      let mut budget = seed.budget;
      let mut cursor = seed.linkid;
      while budget > 0 {
        let Some(next) = self.resolver.next_link(seed.dev, cursor) else {
          break;
        };
        cursor = next.linkid;
        budget -= 1;
        // A sibling whose path cannot be resolved costs budget but is
        // otherwise skipped.
        if let Some(path) = next.path {
          if let Err(e) = self.publish_internal(spec, pid, Some(&path)) {
            result = Err(e);
            break;
          }
        }
      }
    }

    self.release_event_ref(&event);
    result
  }

  fn fill_payloads(
    &self,
    event: &Arc<Event>,
    spec: &EventSpec,
    path_override: Option<&[u8]>,
  ) -> PublishResult<()> {
    match spec {
      EventSpec::Regular {
        source,
        dest,
        uid_override,
        ..
      } => {
        let payload =
          self.regular_payload(event, Some(source), path_override, *uid_override)?;
        event.set_payload(EventPayload::Regular(payload));
        if let Some(dest_event) = &event.dest {
          let payload = self.regular_payload(dest_event, dest.as_ref(), None, None)?;
          dest_event.set_payload(EventPayload::Regular(payload));
        }
        Ok(())
      },
      EventSpec::DocId {
        dev,
        src_ino,
        dst_ino,
        doc_id,
        ..
      } => {
        event.set_payload(EventPayload::DocId(DocIdPayload {
          dev: *dev,
          src_ino: *src_ino,
          dst_ino: *dst_ino,
          doc_id: *doc_id,
        }));
        Ok(())
      },
      EventSpec::Activity {
        version,
        dev,
        ino,
        origin_id,
        age,
        use_state,
        urgency,
        size,
      } => {
        event.set_payload(EventPayload::Activity(ActivityPayload {
          version: *version,
          dev: *dev,
          ino: *ino,
          origin_id: *origin_id,
          age: *age,
          use_state: *use_state,
          urgency: *urgency,
          size: *size,
        }));
        Ok(())
      },
      EventSpec::AccessGranted {
        target,
        audit_token,
      } => {
        let payload = self.access_granted_payload(event, target, audit_token);
        event.set_payload(EventPayload::AccessGranted(payload));
        Ok(())
      },
      EventSpec::UnmountPending { dev } => {
        event.set_payload(EventPayload::UnmountPending { dev: *dev });
        Ok(())
      },
    }
  }

  /// Gather the regular payload for one target. A missing target (the
  /// never-existed destination of a rename) yields an empty record that
  /// encodes as a bare path.
  fn regular_payload(
    &self,
    event: &Arc<Event>,
    target: Option<&Target>,
    path_override: Option<&[u8]>,
    uid_override: Option<u32>,
  ) -> PublishResult<RegularPayload> {
    let mut payload = match target {
      None => RegularPayload {
        dev: 0,
        ino: 0,
        mode: 0,
        uid: 0,
        document_id: 0,
        path: None,
      },
      Some(Target::Info { path, info }) => {
        let mut info = *info;
        fixup_hardlink_mode(&mut info);
        if info.mode & MODE_TRUNCATED_PATH != 0 {
          event.set_flag(EventFlag::ContainsDroppedData);
          info.mode &= !MODE_TRUNCATED_PATH;
        }
        let path_bytes = path_override.unwrap_or(path.as_slice());
        RegularPayload {
          dev: info.dev,
          ino: info.ino,
          mode: info.mode,
          uid: info.uid,
          document_id: info.document_id,
          path: Some(self.interner.intern(path_bytes)),
        }
      },
      Some(Target::Handle(handle)) => {
        let Some(mut info) = self.resolver.attributes(*handle) else {
          return Err(PublishError::InvalidArgs);
        };
        fixup_hardlink_mode(&mut info);
        let path = match path_override {
          Some(p) => self.interner.intern(p),
          None => match self.resolver.path_of(*handle) {
            Some(resolved) => {
              if resolved.truncated {
                event.set_flag(EventFlag::ContainsDroppedData);
              }
              self.interner.intern(&resolved.path)
            },
            None => {
              event.set_flag(EventFlag::ContainsDroppedData);
              return Err(PublishError::NotFound);
            },
          },
        };
        RegularPayload {
          dev: info.dev,
          ino: info.ino,
          mode: info.mode,
          uid: info.uid,
          document_id: info.document_id,
          path: Some(path),
        }
      },
    };
    if let Some(uid) = uid_override {
      payload.uid = uid;
    }
    Ok(payload)
  }

  fn access_granted_payload(
    &self,
    event: &Arc<Event>,
    target: &Target,
    audit_token: &Option<AuditToken>,
  ) -> AccessGrantedPayload {
    let Some(token) = audit_token else {
      // Without a token the event is delivered, but bodyless.
      event.set_flag(EventFlag::ContainsDroppedData);
      return AccessGrantedPayload {
        audit_token: AuditToken::default(),
        path: None,
      };
    };
    let path = match target {
      Target::Info { path, .. } => Some(self.interner.intern(path)),
      Target::Handle(handle) => self
        .resolver
        .path_of(*handle)
        .map(|resolved| self.interner.intern(&resolved.path)),
    };
    if path.is_none() {
      event.set_flag(EventFlag::ContainsDroppedData);
    }
    AccessGrantedPayload {
      audit_token: *token,
      path,
    }
  }

  /// Decide whether this publish seeds hardlink replication.
  fn hardlink_seed(
    &self,
    event: &Arc<Event>,
    spec: &EventSpec,
    path_override: Option<&[u8]>,
  ) -> Option<HardlinkSeed> {
    if path_override.is_some() || !event.kind().replicates_hardlinks() {
      return None;
    }
    let nlink = match spec {
      EventSpec::Regular { source, .. } => match source {
        Target::Info { info, .. } => info.nlink,
        Target::Handle(handle) => self.resolver.attributes(*handle).map(|i| i.nlink)?,
      },
      _ => return None,
    };
    let regular = event.regular()?;
    if regular.mode & MODE_HLINK == 0 || regular.mode & MODE_LAST_HLINK != 0 {
      return None;
    }
    Some(HardlinkSeed {
      dev: regular.dev,
      linkid: regular.ino,
      budget: nlink.min(MAX_HARDLINK_NOTIFICATIONS),
    })
  }
}

/// A hardlinked file whose link count dropped to zero is on its last
/// name; mark it so replication and consumers can tell.
fn fixup_hardlink_mode(info: &mut crate::structure::types::FileInfo) {
  if info.mode & MODE_HLINK != 0 && info.nlink == 0 {
    info.mode |= MODE_LAST_HLINK;
  }
}

fn validate(spec: &EventSpec) -> PublishResult<()> {
  match spec {
    EventSpec::Regular { kind, dest, .. } => {
      if !kind.is_regular() {
        return Err(PublishError::InvalidArgs);
      }
      if dest.is_some() && !kind.takes_dest() {
        return Err(PublishError::InvalidArgs);
      }
      Ok(())
    },
    EventSpec::DocId { kind, .. } => {
      if matches!(kind, EventKind::DocIdCreated | EventKind::DocIdChanged) {
        Ok(())
      } else {
        Err(PublishError::InvalidArgs)
      }
    },
    _ => Ok(()),
  }
}

fn dedup_ident(spec: &EventSpec) -> DedupIdent<'_> {
  match spec {
    EventSpec::Regular { source, .. } | EventSpec::AccessGranted { target: source, .. } => {
      match source {
        Target::Handle(handle) => DedupIdent::Handle(*handle),
        Target::Info { path, .. } => DedupIdent::Path(path),
      }
    },
    _ => DedupIdent::None,
  }
}
