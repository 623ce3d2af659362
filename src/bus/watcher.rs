// A watcher: one registered consumer with an interest vector, a device
// denylist and a ring of event references.

use std::sync::{
  atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering},
  Arc, Condvar, Mutex,
};

use enumflags2::bitflags;

use crate::{
  poll_source::PollEventSender,
  structure::{
    event::Event,
    types::{Dev, EventKind, Interest, Pid},
  },
};

/// Per-watcher state bits.
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherFlag {
  /// Events were lost for this watcher; the next read leads with a
  /// synthetic disclosure record.
  DroppedEvents = 0x0001,
  /// The watcher is being torn down; producers stop enqueueing and
  /// readers return empty.
  Closing = 0x0002,
  WantsCompactEvents = 0x0004,
  WantsExtendedInfo = 0x0008,
  /// Owner holds a watcher entitlement: exempt from backpressure
  /// shedding and ignored-directory suppression.
  PrivilegedService = 0x0010,
}

/// Fixed-capacity ring of event references. One slot is always left
/// empty: `rd == wr` is empty, `(wr + 1) % cap == rd` is full.
#[derive(Debug)]
pub(crate) struct EventRing {
  slots: Box<[Option<Arc<Event>>]>,
  rd: usize,
  wr: usize,
}

impl EventRing {
  pub fn new(capacity: usize) -> EventRing {
    assert!(capacity >= 1, "event ring needs at least one slot");
    EventRing {
      slots: (0..capacity).map(|_| None).collect(),
      rd: 0,
      wr: 0,
    }
  }

  pub fn capacity(&self) -> usize {
    self.slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rd == self.wr
  }

  pub fn is_full(&self) -> bool {
    (self.wr + 1) % self.slots.len() == self.rd
  }

  pub fn pending(&self) -> usize {
    (self.wr + self.slots.len() - self.rd) % self.slots.len()
  }

  /// Store a reference at the write index. The caller has already ruled
  /// out a full ring.
  pub fn push(&mut self, event: Arc<Event>) {
    if self.is_full() {
      panic!("push into a full event ring");
    }
    self.slots[self.wr] = Some(event);
    self.wr = (self.wr + 1) % self.slots.len();
  }

  pub fn peek(&self) -> Option<&Arc<Event>> {
    if self.is_empty() {
      None
    } else {
      self.slots[self.rd].as_ref()
    }
  }

  /// Clear the read slot and advance. Returns the reference that was
  /// there, if any.
  pub fn pop(&mut self) -> Option<Arc<Event>> {
    if self.is_empty() {
      return None;
    }
    let taken = self.slots[self.rd].take();
    self.rd = (self.rd + 1) % self.slots.len();
    taken
  }

  /// Empty the whole ring, handing back every reference for release.
  pub fn drain_all(&mut self) -> Vec<Arc<Event>> {
    let mut drained = Vec::with_capacity(self.pending());
    while let Some(ev) = self.pop() {
      drained.push(ev);
    }
    drained
  }

  pub fn indices(&self) -> (usize, usize) {
    (self.rd, self.wr)
  }
}

#[derive(Debug)]
pub struct Watcher {
  pub(crate) slot: usize,
  pub(crate) interest: Box<[Interest]>,
  /// Report events from devices *not* in this list; `None` watches all.
  pub(crate) devices_not_to_watch: Mutex<Option<Vec<Dev>>>,
  pub(crate) ring: Mutex<EventRing>,
  flags: AtomicU32,
  pub(crate) blockers: AtomicI32,
  pub(crate) num_readers: AtomicI32,
  pub(crate) max_event_id: AtomicU64,
  pub(crate) num_dropped: AtomicU64,
  pub(crate) pid: Pid,
  pub(crate) name: String,
  // Sleep/wake for blocked readers; the readiness pipe carries the same
  // edge to poll observers.
  sleep_lock: Mutex<()>,
  wake_cv: Condvar,
  readiness: PollEventSender,
}

impl Watcher {
  pub(crate) fn new(
    slot: usize,
    interest: Box<[Interest]>,
    queue_depth: usize,
    pid: Pid,
    name: String,
    privileged: bool,
    readiness: PollEventSender,
  ) -> Watcher {
    Watcher {
      slot,
      interest,
      devices_not_to_watch: Mutex::new(None),
      ring: Mutex::new(EventRing::new(queue_depth)),
      flags: AtomicU32::new(if privileged {
        WatcherFlag::PrivilegedService as u32
      } else {
        0
      }),
      blockers: AtomicI32::new(0),
      num_readers: AtomicI32::new(0),
      max_event_id: AtomicU64::new(0),
      num_dropped: AtomicU64::new(0),
      pid,
      name,
      sleep_lock: Mutex::new(()),
      wake_cv: Condvar::new(),
      readiness,
    }
  }

  pub(crate) fn set_flag(&self, flag: WatcherFlag) {
    self.flags.fetch_or(flag as u32, Ordering::SeqCst);
  }

  pub(crate) fn clear_flag(&self, flag: WatcherFlag) {
    self.flags.fetch_and(!(flag as u32), Ordering::SeqCst);
  }

  pub(crate) fn has_flag(&self, flag: WatcherFlag) -> bool {
    self.flags.load(Ordering::SeqCst) & (flag as u32) != 0
  }

  pub(crate) fn raw_flags(&self) -> u32 {
    self.flags.load(Ordering::SeqCst)
  }

  pub(crate) fn interest_in(&self, kind: EventKind) -> bool {
    let code = kind.code() as usize;
    code < self.interest.len() && self.interest[code] == Interest::Report
  }

  /// Events from a denylisted device are not for us.
  pub(crate) fn cares_about_dev(&self, dev: Option<Dev>) -> bool {
    let denylist = self.devices_not_to_watch.lock().unwrap();
    match (&*denylist, dev) {
      (None, _) | (_, None) => true,
      (Some(denied), Some(dev)) => !denied.contains(&dev),
    }
  }

  /// Unblock sleeping readers and publish a readiness edge.
  pub(crate) fn wake(&self) {
    // Take the sleep lock so a reader between its queue check and its
    // cv wait cannot miss the notification.
    let _guard = self.sleep_lock.lock().unwrap();
    self.wake_cv.notify_all();
    self.readiness.send();
  }

  /// Park the calling reader until woken. Returns on any wake; the
  /// caller re-checks its conditions.
  pub(crate) fn sleep_until_woken(&self) {
    let guard = self.sleep_lock.lock().unwrap();
    // Re-check under the sleep lock: a wake between our last queue
    // check and this point must not put us to sleep forever.
    if !self.ring.lock().unwrap().is_empty()
      || self.has_flag(WatcherFlag::Closing)
      || self.has_flag(WatcherFlag::DroppedEvents)
    {
      return;
    }
    drop(self.wake_cv.wait(guard).unwrap());
  }

  pub(crate) fn pending(&self) -> usize {
    self.ring.lock().unwrap().pending()
  }
}
