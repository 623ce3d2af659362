// The bus core: global event list, watcher registry, reference release
// and the unmount barrier. The publish pipeline lives in `publish`, the
// consumer drain in `delivery`.

use std::{
  collections::HashMap,
  sync::{
    atomic::Ordering,
    Arc, Condvar, Mutex, RwLock, Weak,
  },
  thread,
  time::{Duration, Instant},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  bus::{
    coalesce::CoalesceState,
    spec::EventSpec,
    wakeup::{spawn_timer_thread, DeliveryTimer},
    watcher::{Watcher, WatcherFlag},
    BusConfig,
  },
  collaborators::{Collaborators, FsResolver, MonotonicClock, TaskCapabilities},
  error::{CloneError, CloneResult, IoctlError, IoctlResult, UnmountError, UnmountResult},
  poll_source::{make_poll_channel, PollEventSource},
  structure::{
    event::{Event, EventFlag},
    intern::PathInterner,
    pool::EventPool,
    types::{Capability, Dev, EventKind, Interest, Owner, Pid, KIND_SPACE},
  },
};

/// Maximum number of concurrently registered watchers.
pub const MAX_WATCHERS: usize = 8;

/// Queue depth at which a watcher is woken immediately instead of
/// waiting for the coalescing timer.
pub(crate) const MAX_NUM_PENDING: usize = 16;

// Bounded wait for in-flight readers when tearing a watcher down.
const CLOSE_SPIN_ROUNDS: u32 = 5000;
const CLOSE_SPIN_TICK: Duration = Duration::from_millis(1);

// Pool-exhaustion diagnostics are emitted at most this often.
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub(crate) struct ListState {
  /// Live events keyed by address; holds the list's reference.
  pub events: HashMap<usize, Arc<Event>>,
  pub dedup: CoalesceState,
  pub num_pending_rename: u32,
  last_drop_log: Option<Instant>,
}

pub(crate) struct RegistryState {
  pub table: [Option<Arc<Watcher>>; MAX_WATCHERS],
  /// How many watchers subscribe to each kind; lets publishes with no
  /// audience bail out before touching the pool.
  pub interest_counts: [u16; KIND_SPACE],
  pub unmount_dev: Dev,
  pub unmount_acks: i32,
}

impl Default for RegistryState {
  fn default() -> RegistryState {
    RegistryState {
      table: std::array::from_fn(|_| None),
      interest_counts: [0; KIND_SPACE],
      unmount_dev: 0,
      unmount_acks: 0,
    }
  }
}

pub(crate) struct BusCore {
  pub config: BusConfig,
  pub dedup_window_ns: u64,
  pub pool: EventPool,
  pub list: Mutex<ListState>,
  pub registry: Mutex<RegistryState>,
  pub unmount_cv: Condvar,
  /// Shared by readers draining their queues; exclusive for the
  /// close-time and backpressure drains.
  pub delivery_lock: RwLock<()>,
  pub timer: Arc<DeliveryTimer>,
  timer_thread: Mutex<Option<thread::JoinHandle<()>>>,
  pub resolver: Arc<dyn FsResolver>,
  pub interner: Arc<dyn PathInterner>,
  pub capabilities: Arc<dyn TaskCapabilities>,
  pub clock: Arc<dyn MonotonicClock>,
}

impl Drop for BusCore {
  fn drop(&mut self) {
    self.timer.shutdown();
    if let Some(handle) = self.timer_thread.lock().unwrap().take() {
      let _ = handle.join();
    }
  }
}

/// The in-process filesystem-event broker.
///
/// Producers call [`FsEventBus::publish`]; consumers go through
/// [`FsEventsDevice`](crate::device::FsEventsDevice) to obtain watcher
/// handles. Cloning is cheap and shares the instance.
#[derive(Clone)]
pub struct FsEventBus {
  pub(crate) core: Arc<BusCore>,
}

impl FsEventBus {
  pub fn new(config: BusConfig, collaborators: Collaborators) -> FsEventBus {
    let dedup_window_ns = config.dedup_window.as_nanos() as u64;
    let pool = EventPool::new(config.pool_capacity);
    let core = Arc::new(BusCore {
      config,
      dedup_window_ns,
      pool,
      list: Mutex::new(ListState::default()),
      registry: Mutex::new(RegistryState::default()),
      unmount_cv: Condvar::new(),
      delivery_lock: RwLock::new(()),
      timer: Arc::new(DeliveryTimer::default()),
      timer_thread: Mutex::new(None),
      resolver: collaborators.resolver,
      interner: collaborators.interner,
      capabilities: collaborators.capabilities,
      clock: collaborators.clock,
    });

    let weak: Weak<BusCore> = Arc::downgrade(&core);
    let thread = spawn_timer_thread(Arc::clone(&core.timer), move || {
      if let Some(core) = weak.upgrade() {
        core.delayed_delivery();
      }
    });
    *core.timer_thread.lock().unwrap() = Some(thread);

    FsEventBus { core }
  }

  /// Publish one event on behalf of producer `pid`.
  pub fn publish(&self, spec: &EventSpec, pid: Pid) -> crate::error::PublishResult<()> {
    self.core.publish_internal(spec, pid, None)
  }

  /// Shoo watchers away from a device that is about to be unmounted:
  /// deliver an `UnmountPending` event to every subscriber and wait for
  /// each of them to acknowledge, bounded by the retry budget.
  pub fn unmount_barrier(&self, dev: Dev, pid: Pid) -> UnmountResult<()> {
    self.core.unmount_barrier(dev, pid)
  }

  /// Acknowledge an `UnmountPending` event (normally reached through the
  /// watcher handle).
  pub fn unmount_ack(&self, dev: Dev) -> IoctlResult<()> {
    self.core.unmount_ack(dev)
  }

  pub fn diagnostics(&self) -> BusDiagnostics {
    self.core.diagnostics()
  }
}

impl BusCore {
  // ---------------------------------------------------------------
  // Watcher registration

  pub(crate) fn add_watcher(
    &self,
    interest: &[Interest],
    queue_depth: usize,
    owner: &Owner,
  ) -> CloneResult<(Arc<Watcher>, PollEventSource)> {
    if interest.is_empty() || interest.len() > 4096 {
      return Err(CloneError::InvalidArgs(interest.len()));
    }

    let queue_depth = if queue_depth == 0 || queue_depth > 100 * self.pool.capacity() {
      self.pool.capacity()
    } else {
      queue_depth
    };

    // Entitlement-gated kinds are silently stripped, never rejected.
    let mut interest: Box<[Interest]> = interest.into();
    let gated = [
      (EventKind::Activity, Capability::WatchActivity),
      (EventKind::AccessGranted, Capability::WatchAccessGranted),
    ];
    for (kind, cap) in gated {
      let code = kind.code() as usize;
      if code < interest.len()
        && interest[code] != Interest::Ignore
        && !self.capabilities.task_has(owner.pid, cap)
      {
        interest[code] = Interest::Ignore;
      }
    }

    let privileged = [
      Capability::WatchEvents,
      Capability::WatchActivity,
      Capability::WatchAccessGranted,
    ]
    .iter()
    .any(|cap| self.capabilities.task_has(owner.pid, *cap));
    if !privileged {
      info!(
        "watcher {} (pid {}) has no watcher entitlement; it is subject to shedding",
        owner.name, owner.pid
      );
    }

    let (source, sender) = make_poll_channel()?;

    let mut registry = self.registry.lock().unwrap();
    let slot = match registry.table.iter().position(Option::is_none) {
      Some(slot) => slot,
      None => {
        warn!("too many watchers (pid {})", owner.pid);
        return Err(CloneError::NoSlot);
      },
    };

    let watcher = Arc::new(Watcher::new(
      slot,
      interest,
      queue_depth,
      owner.pid,
      owner.name.clone(),
      privileged,
      sender,
    ));

    for (code, counts) in registry.interest_counts.iter_mut().enumerate() {
      if watcher.interest.get(code).is_some_and(|i| *i != Interest::Ignore) {
        *counts += 1;
      }
    }
    registry.table[slot] = Some(Arc::clone(&watcher));

    Ok((watcher, source))
  }

  /// Tear a watcher down: unregister, wait out in-flight readers and
  /// release every queued reference.
  pub(crate) fn remove_watcher(&self, target: &Arc<Watcher>) {
    {
      let mut registry = self.registry.lock().unwrap();
      let slot = registry
        .table
        .iter()
        .position(|w| w.as_ref().is_some_and(|w| Arc::ptr_eq(w, target)));
      match slot {
        None => return, // already gone
        Some(slot) => registry.table[slot] = None,
      }

      for (code, counts) in registry.interest_counts.iter_mut().enumerate() {
        if target.interest.get(code).is_some_and(|i| *i != Interest::Ignore) {
          *counts -= 1;
        }
      }

      if target.has_flag(WatcherFlag::Closing) {
        return;
      }
      target.set_flag(WatcherFlag::Closing);
      // Block new readers while we wait for in-flight ones.
      target.num_readers.fetch_add(1, Ordering::SeqCst);
    }

    let mut rounds = 0;
    while target.num_readers.load(Ordering::SeqCst) > 1 {
      target.wake(); // in case they are asleep
      thread::sleep(CLOSE_SPIN_TICK);
      rounds += 1;
      if rounds >= CLOSE_SPIN_ROUNDS {
        panic!(
          "closing watcher {} (pid {}): readers did not drain",
          target.name, target.pid
        );
      }
    }

    let _exclusive = self.delivery_lock.write().unwrap();
    let drained = target.ring.lock().unwrap().drain_all();
    for event in drained {
      self.release_event_ref(&event);
    }
  }

  // ---------------------------------------------------------------
  // Fan-out

  /// Walk the registry and hand `event` to every interested watcher.
  /// Called with no locks held; takes the registry lock itself.
  pub(crate) fn fan_out(&self, event: &Arc<Event>) {
    let dev = event.fanout_dev();
    let registry = self.registry.lock().unwrap();
    for watcher in registry.table.iter().flatten() {
      if watcher.interest_in(event.kind()) && watcher.cares_about_dev(dev) {
        if !self.enqueue(watcher, event) {
          watcher.num_dropped.fetch_add(1, Ordering::SeqCst);
        }
      }
    }
  }

  /// Queue a reference for one watcher and apply the pending-count
  /// policy. The registry lock is held by the caller.
  fn enqueue(&self, watcher: &Arc<Watcher>, event: &Arc<Event>) -> bool {
    // A watcher with an undelivered loss marker receives nothing until
    // the marker is read: losses stay contiguous and disclosed first.
    // Unmount-pending events are exempt so the ack barrier can drain.
    if watcher.has_flag(WatcherFlag::DroppedEvents)
      && event.kind() != EventKind::UnmountPending
    {
      return false;
    }

    if event.timestamp() > watcher.max_event_id.load(Ordering::SeqCst) {
      watcher.max_event_id.store(event.timestamp(), Ordering::SeqCst);
    }

    let (pending, capacity) = {
      let mut ring = watcher.ring.lock().unwrap();
      if ring.is_full() {
        drop(ring);
        watcher.set_flag(WatcherFlag::DroppedEvents);
        watcher.wake();
        return false;
      }
      event.refcount.fetch_add(1, Ordering::SeqCst);
      ring.push(Arc::clone(event));
      (ring.pending(), ring.capacity())
    };

    if pending > capacity * 3 / 4 && !watcher.has_flag(WatcherFlag::PrivilegedService) {
      // This watcher is falling behind; shed its whole queue rather
      // than let it pin pool slots.
      let drained = {
        let _exclusive = self.delivery_lock.write().unwrap();
        watcher.ring.lock().unwrap().drain_all()
      };
      for ev in &drained {
        self.release_event_ref(ev);
      }
      watcher.set_flag(WatcherFlag::DroppedEvents);
      warn!(
        "watcher falling behind: {} (pid {}) shed {} events (q_size {})",
        watcher.name,
        watcher.pid,
        drained.len(),
        capacity
      );
      watcher.wake();
    } else if pending > MAX_NUM_PENDING {
      watcher.wake();
    } else {
      self.timer.arm(self.config.delivery_delay);
    }

    true
  }

  /// Timer callback: wake every watcher that has something to read.
  fn delayed_delivery(&self) {
    let registry = self.registry.lock().unwrap();
    for watcher in registry.table.iter().flatten() {
      if watcher.pending() > 0 {
        watcher.wake();
      }
    }
  }

  // ---------------------------------------------------------------
  // Reference release

  /// Drop one reference to `event`; at zero the event leaves the global
  /// list, its pool slots are returned and its paths un-interned. A
  /// linked destination is consumed along with its source.
  pub(crate) fn release_event_ref(&self, event: &Arc<Event>) {
    let mut list = self.list.lock().unwrap();

    let old = event.refcount.fetch_sub(1, Ordering::SeqCst);
    if old > 1 {
      return;
    }
    if old < 1 {
      panic!("release of event with refcount {old}");
    }

    list.dedup.forget_if(event);

    let mut slots = 1;
    let mut dest_freed: Option<Arc<Event>> = None;
    if let Some(dest) = &event.dest {
      let dold = dest.refcount.fetch_sub(1, Ordering::SeqCst);
      if dold == 1 {
        Self::unlist(&mut list, dest);
        slots += 1;
        dest_freed = Some(Arc::clone(dest));
      } else if dold < 1 {
        panic!("release of destination event with refcount {dold}");
      }
    }
    Self::unlist(&mut list, event);
    drop(list);

    self.pool.free(slots);
    if let Some(path) = event.path() {
      self.interner.release(path);
    }
    if let Some(dest) = dest_freed {
      if let Some(path) = dest.path() {
        self.interner.release(path);
      }
    }
  }

  fn unlist(list: &mut ListState, event: &Arc<Event>) {
    if event.has_flag(EventFlag::OnList) {
      event.clear_flag(EventFlag::OnList);
      list.events.remove(&(Arc::as_ptr(event) as usize));
      if event.kind() == EventKind::Rename && event.dest.is_some() {
        list.num_pending_rename -= 1;
      }
    }
  }

  // ---------------------------------------------------------------
  // Exhaustion

  /// The pool ran dry: every active watcher is told it lost events, and
  /// a diagnostic snapshot is logged at most every ten seconds.
  pub(crate) fn note_exhaustion(&self) {
    {
      let registry = self.registry.lock().unwrap();
      for watcher in registry.table.iter().flatten() {
        watcher.set_flag(WatcherFlag::DroppedEvents);
        watcher.wake();
      }
    }

    let dropped = self.pool.note_dropped();

    let should_log = {
      let mut list = self.list.lock().unwrap();
      let now = Instant::now();
      match list.last_drop_log {
        Some(last) if now.duration_since(last) < DROP_LOG_INTERVAL => false,
        _ => {
          list.last_drop_log = Some(now);
          true
        },
      }
    };
    if should_log {
      let diag = self.diagnostics();
      warn!(
        "event pool is full, dropping events (dropped {}; outstanding {}; pending renames {})",
        dropped, diag.events_outstanding, diag.pending_renames
      );
      for w in &diag.watchers {
        warn!(
          "  watcher {} (pid {}): rd {:4} wr {:4} q_size {:4} flags {:#x}",
          w.name, w.pid, w.rd, w.wr, w.queue_depth, w.flags
        );
      }
    }
  }

  // ---------------------------------------------------------------
  // Unmount barrier

  fn unmount_barrier(&self, dev: Dev, pid: Pid) -> UnmountResult<()> {
    let tick = self.config.unmount_tick;
    let retries = self.config.unmount_retries;

    let mut registry = self.registry.lock().unwrap();

    // Wait for any other pending unmount to finish first.
    let mut waits = 0;
    while registry.unmount_dev != 0 {
      let (r, timeout) = self.unmount_cv.wait_timeout(registry, tick).unwrap();
      registry = r;
      if timeout.timed_out() {
        waits += 1;
        if waits >= retries {
          warn!(
            "timeout waiting to signal unmount pending for dev {dev} (current dev {})",
            registry.unmount_dev
          );
          return Err(UnmountError::Timeout { dev });
        }
      }
    }

    let interested = registry.interest_counts[EventKind::UnmountPending.code() as usize];
    if interested == 0 {
      return Ok(());
    }

    registry.unmount_dev = dev;
    registry.unmount_acks = interested as i32;
    drop(registry);

    // Even a failed publish leaves the barrier armed; the wait below
    // then runs into its timeout, exactly like a watcher that never
    // acknowledges.
    if let Err(e) = self.publish_internal(&EventSpec::UnmountPending { dev }, pid, None) {
      warn!("unmount pending event for dev {dev} not published: {e}");
    }

    let mut registry = self.registry.lock().unwrap();
    let mut waits = 0;
    while registry.unmount_dev == dev {
      let (r, timeout) = self.unmount_cv.wait_timeout(registry, tick).unwrap();
      registry = r;
      if timeout.timed_out() {
        waits += 1;
        if waits >= retries {
          warn!("unmount pending ack timeout for dev {dev}");
          if registry.unmount_dev == dev {
            registry.unmount_dev = 0;
            registry.unmount_acks = 0;
          }
          self.unmount_cv.notify_all();
          return Err(UnmountError::Timeout { dev });
        }
      }
    }
    Ok(())
  }

  pub(crate) fn unmount_ack(&self, dev: Dev) -> IoctlResult<()> {
    let mut registry = self.registry.lock().unwrap();
    if registry.unmount_dev != dev {
      warn!(
        "unexpected unmount pending ack for dev {dev} ({})",
        registry.unmount_dev
      );
      return Err(IoctlError::UnexpectedAck {
        dev,
        pending: registry.unmount_dev,
      });
    }
    registry.unmount_acks -= 1;
    if registry.unmount_acks <= 0 {
      registry.unmount_dev = 0;
      self.unmount_cv.notify_all();
    }
    Ok(())
  }

  // ---------------------------------------------------------------
  // Diagnostics

  pub(crate) fn diagnostics(&self) -> BusDiagnostics {
    let (events_outstanding, pending_renames, num_coalesced) = {
      let list = self.list.lock().unwrap();
      (
        list.events.len(),
        list.num_pending_rename,
        list.dedup.num_coalesced,
      )
    };
    let watchers = {
      let registry = self.registry.lock().unwrap();
      registry
        .table
        .iter()
        .flatten()
        .map(|w| {
          let ring = w.ring.lock().unwrap();
          let (rd, wr) = ring.indices();
          WatcherDiagnostics {
            slot: w.slot,
            name: w.name.clone(),
            pid: w.pid,
            rd,
            wr,
            queue_depth: ring.capacity(),
            flags: w.raw_flags(),
            num_dropped: w.num_dropped.load(Ordering::SeqCst),
          }
        })
        .collect()
    };
    BusDiagnostics {
      num_dropped: self.pool.num_dropped(),
      num_coalesced,
      events_outstanding,
      pending_renames,
      pool_in_use: self.pool.in_use(),
      watchers,
    }
  }
}

/// A point-in-time snapshot of bus health, also used for the rate-limited
/// exhaustion log.
#[derive(Debug, Clone)]
pub struct BusDiagnostics {
  pub num_dropped: u64,
  pub num_coalesced: u64,
  pub events_outstanding: usize,
  pub pending_renames: u32,
  pub pool_in_use: usize,
  pub watchers: Vec<WatcherDiagnostics>,
}

#[derive(Debug, Clone)]
pub struct WatcherDiagnostics {
  pub slot: usize,
  pub name: String,
  pub pid: Pid,
  pub rd: usize,
  pub wr: usize,
  pub queue_depth: usize,
  pub flags: u32,
  pub num_dropped: u64,
}
