// The delivery wire format. Each event is two untagged leading words
// (kind, producer pid) followed by tagged fields and an ARG_DONE
// terminator. Tags are u16 kind + u16 length; field bytes are native
// endian, frozen per build. Records are atomic: either a whole event
// reaches the caller's buffer or none of it does.

use crate::structure::{
  event::{Event, EventFlag},
  types::{AuditToken, EventKind, FileInfo, EVENTS_DROPPED_CODE},
};

pub const ARG_VNODE: u16 = 0x0001;
pub const ARG_STRING: u16 = 0x0002;
pub const ARG_PATH: u16 = 0x0003;
pub const ARG_INT32: u16 = 0x0004;
pub const ARG_INT64: u16 = 0x0005;
pub const ARG_RAW: u16 = 0x0006;
pub const ARG_INO: u16 = 0x0007;
pub const ARG_UID: u16 = 0x0008;
pub const ARG_DEV: u16 = 0x0009;
pub const ARG_MODE: u16 = 0x000a;
pub const ARG_GID: u16 = 0x000b;
pub const ARG_FINFO: u16 = 0x000c;
pub const ARG_AUDIT_TOKEN: u16 = 0x000d;
pub const ARG_DONE: u16 = 0xb33f;

/// In extended-info mode the kind word carries per-event flag bits above
/// the kind code.
pub const KIND_CODE_MASK: i32 = 0xfff;
pub const KIND_FLAG_SHIFT: u32 = 25;
pub const KIND_FLAG_COMBINED: i32 = 0x0001;
pub const KIND_FLAG_CONTAINS_DROPPED: i32 = 0x0002;

const SCRATCH_SIZE: usize = 512;
const TAG_HEADER: usize = 2 * std::mem::size_of::<u16>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EncodeError {
  /// The caller's buffer cannot take the rest of the record.
  NoSpace,
}

pub(crate) type EncodeResult<T> = Result<T, EncodeError>;

/// The caller-provided read buffer, with a cursor and rewind support so
/// a half-encoded event can be backed out.
#[derive(Debug)]
pub(crate) struct UserBuffer<'a> {
  data: &'a mut [u8],
  pos: usize,
}

impl<'a> UserBuffer<'a> {
  pub fn new(data: &'a mut [u8]) -> UserBuffer<'a> {
    UserBuffer { data, pos: 0 }
  }

  pub fn resid(&self) -> usize {
    self.data.len() - self.pos
  }

  pub fn pos(&self) -> usize {
    self.pos
  }

  pub fn rewind_to(&mut self, pos: usize) {
    debug_assert!(pos <= self.pos);
    self.pos = pos;
  }

  pub fn write(&mut self, bytes: &[u8]) -> EncodeResult<()> {
    if bytes.len() > self.resid() {
      return Err(EncodeError::NoSpace);
    }
    self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
    self.pos += bytes.len();
    Ok(())
  }
}

/// Per-event encoder: a small scratch that spills into the user buffer
/// whenever it risks overflowing.
struct EventEncoder {
  scratch: [u8; SCRATCH_SIZE],
  idx: usize,
}

impl EventEncoder {
  fn new() -> EventEncoder {
    EventEncoder {
      scratch: [0; SCRATCH_SIZE],
      idx: 0,
    }
  }

  fn flush(&mut self, out: &mut UserBuffer<'_>) -> EncodeResult<()> {
    out.write(&self.scratch[..self.idx])?;
    self.idx = 0;
    Ok(())
  }

  /// Append raw bytes that always fit in an empty scratch (the untagged
  /// leading words).
  fn raw(&mut self, bytes: &[u8], out: &mut UserBuffer<'_>) -> EncodeResult<()> {
    if bytes.len() > SCRATCH_SIZE - self.idx {
      self.flush(out)?;
    }
    self.scratch[self.idx..self.idx + bytes.len()].copy_from_slice(bytes);
    self.idx += bytes.len();
    Ok(())
  }

  /// Append one tagged field, flushing along the way if the scratch
  /// fills up.
  fn fill(&mut self, tag: u16, mut data: &[u8], out: &mut UserBuffer<'_>) -> EncodeResult<()> {
    // the +1 guarantees the body loop below always copies at least one
    // byte per round
    if SCRATCH_SIZE - self.idx <= TAG_HEADER + 1 {
      self.flush(out)?;
    }

    self.scratch[self.idx..self.idx + 2].copy_from_slice(&tag.to_ne_bytes());
    self.idx += 2;
    let len = (data.len() & 0xffff) as u16;
    self.scratch[self.idx..self.idx + 2].copy_from_slice(&len.to_ne_bytes());
    self.idx += 2;

    while !data.is_empty() {
      let amt = data.len().min(SCRATCH_SIZE - self.idx);
      self.scratch[self.idx..self.idx + amt].copy_from_slice(&data[..amt]);
      self.idx += amt;
      data = &data[amt..];
      if data.len() > SCRATCH_SIZE - self.idx {
        self.flush(out)?;
      }
    }
    Ok(())
  }

  /// The ARG_DONE terminator is a bare tag with no length word.
  fn done(&mut self, out: &mut UserBuffer<'_>) -> EncodeResult<()> {
    if SCRATCH_SIZE - self.idx < 2 {
      self.flush(out)?;
    }
    self.scratch[self.idx..self.idx + 2].copy_from_slice(&ARG_DONE.to_ne_bytes());
    self.idx += 2;
    self.flush(out)
  }
}

/// Encode one event (and its linked destination) into `out`. Returns
/// `Ok` having written nothing for events the caller should silently
/// consume (still in creation, orphaned destination halves).
pub(crate) fn copy_out_event(
  event: &Event,
  compact: bool,
  extended: bool,
  out: &mut UserBuffer<'_>,
) -> EncodeResult<()> {
  if event.has_flag(EventFlag::BeingCreated) {
    return Ok(());
  }

  // The destination half of a rename/clone pair is consumed when its
  // source is delivered; one showing up on its own has lost its source.
  if matches!(event.kind(), EventKind::Rename | EventKind::Clone) && event.dest.is_none() {
    return Ok(());
  }

  let Some(payload) = event.payload() else {
    return Ok(());
  };

  let mut enc = EventEncoder::new();

  let kind_word = if extended {
    let mut word = event.kind().code() & KIND_CODE_MASK;
    if event.has_flag(EventFlag::ContainsDroppedData) {
      word |= KIND_FLAG_CONTAINS_DROPPED << KIND_FLAG_SHIFT;
    } else if event.has_flag(EventFlag::CombinedEvents) {
      word |= KIND_FLAG_COMBINED << KIND_FLAG_SHIFT;
    }
    word
  } else {
    event.kind().code()
  };
  enc.raw(&kind_word.to_ne_bytes(), out)?;
  enc.raw(&event.pid().to_ne_bytes(), out)?;

  use crate::structure::event::EventPayload::*;
  match payload {
    DocId(p) => {
      enc.fill(ARG_DEV, &p.dev.to_ne_bytes(), out)?;
      enc.fill(ARG_INO, &p.src_ino.to_ne_bytes(), out)?;
      enc.fill(ARG_INO, &p.dst_ino.to_ne_bytes(), out)?;
      enc.fill(ARG_INT64, &p.doc_id.to_ne_bytes(), out)?;
    },
    UnmountPending { dev } => {
      enc.fill(ARG_DEV, &dev.to_ne_bytes(), out)?;
    },
    Activity(p) => {
      enc.fill(ARG_INT32, &p.version.to_ne_bytes(), out)?;
      enc.fill(ARG_DEV, &p.dev.to_ne_bytes(), out)?;
      enc.fill(ARG_INO, &p.ino.to_ne_bytes(), out)?;
      enc.fill(ARG_INT64, &p.origin_id.to_ne_bytes(), out)?;
      enc.fill(ARG_INT64, &p.age.to_ne_bytes(), out)?;
      enc.fill(ARG_INT32, &p.use_state.to_ne_bytes(), out)?;
      enc.fill(ARG_INT32, &p.urgency.to_ne_bytes(), out)?;
      enc.fill(ARG_INT64, &p.size.to_ne_bytes(), out)?;
    },
    AccessGranted(p) => {
      // A bogus path or token leaves the record bodyless.
      if !event.has_flag(EventFlag::ContainsDroppedData) {
        encode_path(&mut enc, p.path.as_ref().map(|p| p.as_bytes()), out)?;
        enc.fill(ARG_AUDIT_TOKEN, &token_bytes(&p.audit_token), out)?;
      }
    },
    Regular(_) => {
      let mut cur = event;
      loop {
        let Some(regular) = cur.regular() else { break };
        encode_path(&mut enc, regular.path.as_ref().map(|p| p.as_bytes()), out)?;

        // A rename destination that did not previously exist has no
        // file info to report.
        if regular.dev == 0 && regular.ino == 0 {
          break;
        }

        if compact {
          let mut blob = [0u8; FileInfo::COPY_SIZE];
          blob[0..8].copy_from_slice(&regular.ino.to_ne_bytes());
          blob[8..12].copy_from_slice(&regular.dev.to_ne_bytes());
          blob[12..16].copy_from_slice(&regular.mode.to_ne_bytes());
          blob[16..20].copy_from_slice(&regular.uid.to_ne_bytes());
          blob[20..24].copy_from_slice(&regular.document_id.to_ne_bytes());
          enc.fill(ARG_FINFO, &blob, out)?;
        } else {
          enc.fill(ARG_DEV, &regular.dev.to_ne_bytes(), out)?;
          enc.fill(ARG_INO, &regular.ino.to_ne_bytes(), out)?;
          enc.fill(ARG_MODE, &regular.mode.to_ne_bytes(), out)?;
          enc.fill(ARG_UID, &regular.uid.to_ne_bytes(), out)?;
          // By convention the GID slot carries the document id.
          enc.fill(ARG_GID, &regular.document_id.to_ne_bytes(), out)?;
        }

        match &cur.dest {
          Some(dest) => cur = dest.as_ref(),
          None => break,
        }
      }
    },
  }

  // very last thing: the time stamp
  enc.fill(ARG_INT64, &event.timestamp().to_ne_bytes(), out)?;
  enc.done(out)
}

/// The synthetic events-dropped record: kind word, a zero pid and the
/// terminator, with no body.
pub(crate) fn copy_out_dropped_marker(out: &mut UserBuffer<'_>) -> EncodeResult<()> {
  let mut record = [0u8; 10];
  record[0..4].copy_from_slice(&EVENTS_DROPPED_CODE.to_ne_bytes());
  record[4..8].copy_from_slice(&0i32.to_ne_bytes());
  record[8..10].copy_from_slice(&ARG_DONE.to_ne_bytes());
  out.write(&record)
}

fn encode_path(
  enc: &mut EventEncoder,
  path: Option<&[u8]>,
  out: &mut UserBuffer<'_>,
) -> EncodeResult<()> {
  match path {
    Some(p) if !p.is_empty() => {
      // Paths travel with their terminating NUL.
      let mut bytes = Vec::with_capacity(p.len() + 1);
      bytes.extend_from_slice(p);
      bytes.push(0);
      enc.fill(ARG_STRING, &bytes, out)
    },
    _ => enc.fill(ARG_STRING, b"/\0", out),
  }
}

fn token_bytes(token: &AuditToken) -> [u8; AuditToken::WIRE_SIZE] {
  let mut bytes = [0u8; AuditToken::WIRE_SIZE];
  for (i, word) in token.0.iter().enumerate() {
    bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_ne_bytes());
  }
  bytes
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::structure::event::{DocIdPayload, EventPayload};

  fn docid_event() -> Event {
    let ev = Event::new(EventKind::DocIdCreated, 0x1122334455667788, 321, None);
    ev.set_payload(EventPayload::DocId(DocIdPayload {
      dev: 7,
      src_ino: 100,
      dst_ino: 200,
      doc_id: 42,
    }));
    ev.clear_flag(EventFlag::BeingCreated);
    ev
  }

  #[test]
  fn docid_record_layout() {
    let ev = docid_event();
    let mut buf = [0u8; 256];
    let mut out = UserBuffer::new(&mut buf);
    copy_out_event(&ev, false, false, &mut out).unwrap();
    let n = out.pos();

    let mut expect: Vec<u8> = Vec::new();
    expect.extend_from_slice(&EventKind::DocIdCreated.code().to_ne_bytes());
    expect.extend_from_slice(&321i32.to_ne_bytes());
    for (tag, body) in [
      (ARG_DEV, 7i32.to_ne_bytes().to_vec()),
      (ARG_INO, 100u64.to_ne_bytes().to_vec()),
      (ARG_INO, 200u64.to_ne_bytes().to_vec()),
      (ARG_INT64, 42u64.to_ne_bytes().to_vec()),
      (ARG_INT64, 0x1122334455667788u64.to_ne_bytes().to_vec()),
    ] {
      expect.extend_from_slice(&tag.to_ne_bytes());
      expect.extend_from_slice(&(body.len() as u16).to_ne_bytes());
      expect.extend_from_slice(&body);
    }
    expect.extend_from_slice(&ARG_DONE.to_ne_bytes());

    assert_eq!(&buf[..n], &expect[..]);
  }

  #[test]
  fn record_is_all_or_nothing() {
    let ev = docid_event();
    let mut small = [0u8; 32]; // too small for the whole record
    let mut out = UserBuffer::new(&mut small);
    assert_eq!(copy_out_event(&ev, false, false, &mut out), Err(EncodeError::NoSpace));
  }

  #[test]
  fn extended_kind_word_carries_flag_bits() {
    let ev = docid_event();
    ev.set_flag(EventFlag::ContainsDroppedData);
    let mut buf = [0u8; 256];
    let mut out = UserBuffer::new(&mut buf);
    copy_out_event(&ev, false, true, &mut out).unwrap();

    let word = i32::from_ne_bytes(buf[0..4].try_into().unwrap());
    assert_eq!(word & KIND_CODE_MASK, EventKind::DocIdCreated.code());
    assert_eq!(word >> KIND_FLAG_SHIFT, KIND_FLAG_CONTAINS_DROPPED);
  }

  #[test]
  fn orphan_rename_destination_is_skipped() {
    let ev = Event::new(EventKind::Rename, 5, 1, None);
    ev.clear_flag(EventFlag::BeingCreated);
    let mut buf = [0u8; 256];
    let mut out = UserBuffer::new(&mut buf);
    copy_out_event(&ev, false, false, &mut out).unwrap();
    assert_eq!(out.pos(), 0);
  }

  #[test]
  fn being_created_is_skipped() {
    let ev = Event::new(EventKind::ContentModified, 5, 1, None);
    let mut buf = [0u8; 256];
    let mut out = UserBuffer::new(&mut buf);
    copy_out_event(&ev, false, false, &mut out).unwrap();
    assert_eq!(out.pos(), 0);
  }

  #[test]
  fn dropped_marker_is_ten_bytes() {
    let mut buf = [0u8; 16];
    let mut out = UserBuffer::new(&mut buf);
    copy_out_dropped_marker(&mut out).unwrap();
    assert_eq!(out.pos(), 10);
    assert_eq!(
      i32::from_ne_bytes(buf[0..4].try_into().unwrap()),
      EVENTS_DROPPED_CODE
    );
    assert_eq!(
      u16::from_ne_bytes(buf[8..10].try_into().unwrap()),
      ARG_DONE
    );
  }

  #[test]
  fn long_paths_flush_through_the_scratch() {
    let interner = crate::structure::intern::NameTable::new();
    use crate::structure::intern::PathInterner;
    let long_path = vec![b'a'; 1500];
    let ev = Event::new(EventKind::ContentModified, 9, 2, None);
    ev.set_payload(EventPayload::Regular(crate::structure::event::RegularPayload {
      dev: 3,
      ino: 77,
      mode: 0o100644,
      uid: 500,
      document_id: 0,
      path: Some(interner.intern(&long_path)),
    }));
    ev.clear_flag(EventFlag::BeingCreated);

    let mut buf = [0u8; 4096];
    let mut out = UserBuffer::new(&mut buf);
    copy_out_event(&ev, false, false, &mut out).unwrap();

    // tag + len + path + NUL somewhere up front
    let len = u16::from_ne_bytes(buf[10..12].try_into().unwrap());
    assert_eq!(len as usize, long_path.len() + 1);
  }
}
