// Path strings live in a shared intern table so that an event replicated
// into many watcher queues carries one copy of its path bytes. The broker
// only ever calls `intern` and `release`; the table itself is a pluggable
// collaborator.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
};

/// A reference to an interned path string. Cheap to clone; the bytes stay
/// alive for as long as any reference exists, but the owning table entry
/// is retired by [`PathInterner::release`].
#[derive(Debug, Clone)]
pub struct InternedPath(Arc<[u8]>);

impl InternedPath {
  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl PartialEq for InternedPath {
  fn eq(&self, other: &Self) -> bool {
    self.0 == other.0
  }
}
impl Eq for InternedPath {}

/// The string-intern table contract. The table is the sole owner of path
/// bytes; the bus releases its reference when the last event reference to
/// a path is dropped.
pub trait PathInterner: Send + Sync {
  fn intern(&self, bytes: &[u8]) -> InternedPath;
  fn release(&self, path: &InternedPath);
}

/// Default in-process intern table: a refcounted name map.
#[derive(Debug, Default)]
pub struct NameTable {
  entries: Mutex<HashMap<Box<[u8]>, NameEntry>>,
}

#[derive(Debug)]
struct NameEntry {
  shared: Arc<[u8]>,
  refs: usize,
}

impl NameTable {
  pub fn new() -> NameTable {
    NameTable::default()
  }

  /// Number of distinct names currently interned. Used by leak checks.
  pub fn outstanding(&self) -> usize {
    self.entries.lock().unwrap().len()
  }
}

impl PathInterner for NameTable {
  fn intern(&self, bytes: &[u8]) -> InternedPath {
    let mut entries = self.entries.lock().unwrap();
    if let Some(entry) = entries.get_mut(bytes) {
      entry.refs += 1;
      return InternedPath(Arc::clone(&entry.shared));
    }
    let shared: Arc<[u8]> = Arc::from(bytes);
    entries.insert(
      bytes.into(),
      NameEntry {
        shared: Arc::clone(&shared),
        refs: 1,
      },
    );
    InternedPath(shared)
  }

  fn release(&self, path: &InternedPath) {
    let mut entries = self.entries.lock().unwrap();
    match entries.get_mut(path.as_bytes()) {
      Some(entry) if entry.refs > 1 => entry.refs -= 1,
      Some(_) => {
        entries.remove(path.as_bytes());
      },
      None => panic!("release of a path that was never interned"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn intern_is_refcounted() {
    let table = NameTable::new();
    let a = table.intern(b"/tmp/a");
    let b = table.intern(b"/tmp/a");
    assert_eq!(a, b);
    assert_eq!(table.outstanding(), 1);

    table.release(&a);
    assert_eq!(table.outstanding(), 1);
    table.release(&b);
    assert_eq!(table.outstanding(), 0);
  }

  #[test]
  fn distinct_names_are_distinct_entries() {
    let table = NameTable::new();
    let a = table.intern(b"/tmp/a");
    let b = table.intern(b"/tmp/b");
    assert_ne!(a, b);
    assert_eq!(table.outstanding(), 2);
    table.release(&b);
    table.release(&a);
    assert_eq!(table.outstanding(), 0);
  }

  #[test]
  #[should_panic]
  fn release_of_unknown_name_panics() {
    let table = NameTable::new();
    let a = table.intern(b"/x");
    table.release(&a);
    table.release(&a);
  }
}
