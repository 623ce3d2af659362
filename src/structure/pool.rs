// Bounded allocation budget for event records. The pool never grows and
// reservation never blocks: running dry is an expected condition that the
// publish path turns into a DroppedEvents signal for every watcher.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug)]
pub(crate) struct EventPool {
  capacity: usize,
  available: AtomicUsize,
  num_dropped: AtomicU64,
}

impl EventPool {
  pub fn new(capacity: usize) -> EventPool {
    EventPool {
      capacity,
      available: AtomicUsize::new(capacity),
      num_dropped: AtomicU64::new(0),
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Reserve `n` event slots, all or nothing. Never blocks.
  pub fn try_reserve(&self, n: usize) -> bool {
    let mut avail = self.available.load(Ordering::SeqCst);
    loop {
      if avail < n {
        return false;
      }
      match self.available.compare_exchange_weak(
        avail,
        avail - n,
        Ordering::SeqCst,
        Ordering::SeqCst,
      ) {
        Ok(_) => return true,
        Err(seen) => avail = seen,
      }
    }
  }

  /// Return `n` slots to the pool.
  pub fn free(&self, n: usize) {
    let prev = self.available.fetch_add(n, Ordering::SeqCst);
    if prev + n > self.capacity {
      panic!(
        "event pool over-freed: {} slots returned to a pool of {}",
        prev + n,
        self.capacity
      );
    }
  }

  pub fn in_use(&self) -> usize {
    self.capacity - self.available.load(Ordering::SeqCst)
  }

  pub fn note_dropped(&self) -> u64 {
    self.num_dropped.fetch_add(1, Ordering::SeqCst) + 1
  }

  pub fn num_dropped(&self) -> u64 {
    self.num_dropped.load(Ordering::SeqCst)
  }
}
