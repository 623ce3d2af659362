// The producer write protocol: a byte stream of packed records
//   { i32 kind; FileInfo; NUL-terminated path;
//     [FileInfo dest; NUL-terminated path dest] }
// where the destination pair is present exactly for the two-target
// kinds. Records may straddle write() calls; the partial tail is kept in
// a scratch buffer and finished by the next write.

use byteorder::{ByteOrder, NativeEndian};
use bytes::{Buf, BytesMut};

use crate::{
  bus::spec::{EventSpec, Target},
  error::{WriteError, WriteResult},
  structure::types::{EventKind, FileInfo, KIND_SPACE},
};

/// The reassembly scratch never grows beyond one chunk of this size plus
/// a maximal record; matches the original device's write buffer.
pub(crate) const WRITE_BUFFER_SIZE: usize = 4096;

const KIND_BYTES: usize = std::mem::size_of::<i32>();

#[derive(Debug, Default)]
pub(crate) struct RecordParser {
  carry: BytesMut,
}

impl RecordParser {
  /// Feed one write's worth of bytes, invoking `publish` for each whole
  /// record. Incomplete trailing bytes are carried to the next call.
  pub fn ingest(
    &mut self,
    data: &[u8],
    mut publish: impl FnMut(EventSpec) -> WriteResult<()>,
  ) -> WriteResult<()> {
    // Chunked like the device write path: parse after each refill so the
    // carry buffer stays near its nominal size.
    for chunk in data.chunks(WRITE_BUFFER_SIZE) {
      self.carry.extend_from_slice(chunk);
      self.drain_records(&mut publish)?;
    }
    Ok(())
  }

  fn drain_records(&mut self, publish: &mut impl FnMut(EventSpec) -> WriteResult<()>) -> WriteResult<()> {
    loop {
      match parse_record(&self.carry)? {
        None => return Ok(()),
        Some((spec, consumed)) => {
          self.carry.advance(consumed);
          publish(spec)?;
        },
      }
    }
  }

  #[cfg(test)]
  fn pending_bytes(&self) -> usize {
    self.carry.len()
  }
}

/// Parse one record off the front of `buf`. `Ok(None)` means the bytes
/// so far are a valid prefix; wait for more.
fn parse_record(buf: &[u8]) -> WriteResult<Option<(EventSpec, usize)>> {
  if buf.len() < KIND_BYTES + FileInfo::WIRE_SIZE + 1 {
    return Ok(None);
  }

  let raw_kind = NativeEndian::read_i32(&buf[0..KIND_BYTES]);
  let kind = match EventKind::from_code(raw_kind) {
    Some(kind) if allowed_over_write(kind) => kind,
    _ => return Err(WriteError::InvalidRecord { kind: raw_kind }),
  };
  debug_assert!((raw_kind as usize) < KIND_SPACE);

  let mut at = KIND_BYTES;
  let info = parse_file_info(&buf[at..at + FileInfo::WIRE_SIZE]);
  at += FileInfo::WIRE_SIZE;

  let Some((path, path_end)) = take_path(buf, at) else {
    return Ok(None);
  };
  at = path_end;

  if !kind.takes_dest() {
    let spec = EventSpec::regular(kind, Target::info(path, info));
    return Ok(Some((spec, at)));
  }

  // Two-target records carry a second info + path.
  if buf.len() < at + FileInfo::WIRE_SIZE + 1 {
    return Ok(None);
  }
  let dest_info = parse_file_info(&buf[at..at + FileInfo::WIRE_SIZE]);
  at += FileInfo::WIRE_SIZE;
  let Some((dest_path, dest_end)) = take_path(buf, at) else {
    return Ok(None);
  };
  at = dest_end;

  // A destination inode of zero means the destination did not exist
  // before the operation; its file info is not real.
  let dest = if dest_info.ino != 0 {
    Target::info(dest_path, dest_info)
  } else {
    Target::info(
      dest_path,
      FileInfo {
        ino: 0,
        dev: 0,
        mode: 0,
        uid: 0,
        document_id: 0,
        nlink: 0,
      },
    )
  };
  Ok(Some((EventSpec::two_target(kind, Target::info(path, info), dest), at)))
}

/// Activity and access-granted events cannot be injected from userspace,
/// and unknown codes are rejected outright.
fn allowed_over_write(kind: EventKind) -> bool {
  !matches!(kind, EventKind::AccessGranted | EventKind::Activity)
}

fn parse_file_info(bytes: &[u8]) -> FileInfo {
  FileInfo {
    ino: NativeEndian::read_u64(&bytes[0..8]),
    dev: NativeEndian::read_i32(&bytes[8..12]),
    mode: NativeEndian::read_i32(&bytes[12..16]),
    uid: NativeEndian::read_u32(&bytes[16..20]),
    document_id: NativeEndian::read_u32(&bytes[20..24]),
    nlink: NativeEndian::read_u64(&bytes[24..32]),
  }
}

fn take_path(buf: &[u8], start: usize) -> Option<(Vec<u8>, usize)> {
  let nul = buf[start..].iter().position(|b| *b == 0)?;
  Some((buf[start..start + nul].to_vec(), start + nul + 1))
}

/// Serialize a record in the producer wire layout (used by tests and by
/// in-process producers that want to exercise the device path).
pub fn encode_record(
  kind: EventKind,
  info: &FileInfo,
  path: &[u8],
  dest: Option<(&FileInfo, &[u8])>,
) -> Vec<u8> {
  let mut out = Vec::with_capacity(KIND_BYTES + FileInfo::WIRE_SIZE + path.len() + 1);
  let mut kind_bytes = [0u8; 4];
  NativeEndian::write_i32(&mut kind_bytes, kind.code());
  out.extend_from_slice(&kind_bytes);
  push_file_info(&mut out, info);
  out.extend_from_slice(path);
  out.push(0);
  if let Some((dest_info, dest_path)) = dest {
    push_file_info(&mut out, dest_info);
    out.extend_from_slice(dest_path);
    out.push(0);
  }
  out
}

fn push_file_info(out: &mut Vec<u8>, info: &FileInfo) {
  let mut bytes = [0u8; FileInfo::WIRE_SIZE];
  NativeEndian::write_u64(&mut bytes[0..8], info.ino);
  NativeEndian::write_i32(&mut bytes[8..12], info.dev);
  NativeEndian::write_i32(&mut bytes[12..16], info.mode);
  NativeEndian::write_u32(&mut bytes[16..20], info.uid);
  NativeEndian::write_u32(&mut bytes[20..24], info.document_id);
  NativeEndian::write_u64(&mut bytes[24..32], info.nlink);
  out.extend_from_slice(&bytes);
}
