// The consumer drain: one reader at a time per watcher pulls references
// off the ring, encodes them into the caller's buffer and releases them.

use std::sync::{atomic::Ordering, Arc};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  bus::{
    broker::BusCore,
    watcher::{Watcher, WatcherFlag},
  },
  error::{ReadError, ReadResult},
  messages::wire::{copy_out_dropped_marker, copy_out_event, EncodeError, UserBuffer},
  structure::types::EventKind,
};

/// Smallest accepted read buffer: enough for one maximum-size event.
pub const MIN_READ_BUFFER: usize = 2048;

// Watchers without a service entitlement do not see event traffic under
// these components.
const IGNORED_COMPONENTS: [&[u8]; 3] = [
  b"/.Spotlight-V100/",
  b"/.MobileBackups/",
  b"/Backups.backupdb/",
];

fn is_ignored_directory(path: &[u8]) -> bool {
  IGNORED_COMPONENTS
    .iter()
    .any(|c| path.windows(c.len()).any(|w| w == *c))
}

impl BusCore {
  /// Fill `buf` with zero or more whole framed events for `watcher`.
  /// Blocks while the queue is empty, returns `Ok(0)` once the watcher
  /// is closing.
  pub(crate) fn read_events(&self, watcher: &Arc<Watcher>, buf: &mut [u8]) -> ReadResult<usize> {
    if buf.len() < MIN_READ_BUFFER {
      return Err(ReadError::BufferTooSmall {
        min: MIN_READ_BUFFER,
      });
    }
    if watcher.has_flag(WatcherFlag::Closing) {
      return Ok(0);
    }

    // One reader at a time.
    if watcher
      .num_readers
      .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return Err(ReadError::Busy);
    }

    let result = self.read_events_locked(watcher, buf);
    watcher.num_readers.fetch_sub(1, Ordering::SeqCst);
    result
  }

  fn read_events_locked(&self, watcher: &Arc<Watcher>, buf: &mut [u8]) -> ReadResult<usize> {
    let mut out = UserBuffer::new(buf);

    loop {
      // Nothing to do and no loss to disclose: go to sleep until a
      // producer or the close path wakes us.
      while watcher.ring.lock().unwrap().is_empty()
        && !watcher.has_flag(WatcherFlag::DroppedEvents)
      {
        if watcher.has_flag(WatcherFlag::Closing) {
          return Ok(out.pos());
        }
        watcher.blockers.fetch_add(1, Ordering::SeqCst);
        watcher.sleep_until_woken();
        watcher.blockers.fetch_sub(1, Ordering::SeqCst);
        if watcher.has_flag(WatcherFlag::Closing) {
          return Ok(out.pos());
        }
      }

      // If we dropped events, disclose that before anything real.
      if watcher.has_flag(WatcherFlag::DroppedEvents) {
        if copy_out_dropped_marker(&mut out).is_err() {
          return Ok(out.pos());
        }
        watcher.clear_flag(WatcherFlag::DroppedEvents);
      }
      let mut last_full_event = out.pos();

      let compact = watcher.has_flag(WatcherFlag::WantsCompactEvents);
      let extended = watcher.has_flag(WatcherFlag::WantsExtendedInfo);
      let mut emitted = out.pos() > 0;
      let mut skipped = false;

      let shared = self.delivery_lock.read().unwrap();
      loop {
        if out.resid() == 0 || watcher.has_flag(WatcherFlag::Closing) {
          break;
        }

        // Re-validate the queue entry: it may be stale relative to the
        // interest vector, or its event may already be on its way back
        // to the pool.
        let event = {
          let ring = watcher.ring.lock().unwrap();
          match ring.peek() {
            None => break,
            Some(ev) => Arc::clone(ev),
          }
        };
        if event.refcount.load(Ordering::SeqCst) < 1
          || event.kind().code() as usize >= watcher.interest.len()
        {
          break;
        }

        if watcher.interest_in(event.kind()) {
          let suppressed = !watcher.has_flag(WatcherFlag::PrivilegedService)
            && !matches!(
              event.kind(),
              EventKind::DocIdCreated | EventKind::DocIdChanged | EventKind::Activity
            )
            && event
              .path()
              .is_some_and(|p| is_ignored_directory(p.as_bytes()));

          if suppressed {
            skipped = true;
          } else {
            // Delivering the most recent event ends its dedup window.
            self.list.lock().unwrap().dedup.forget_if(&event);

            match copy_out_event(&event, compact, extended, &mut out) {
              Ok(()) => {
                if out.pos() > last_full_event {
                  emitted = true;
                }
                last_full_event = out.pos();
              },
              Err(EncodeError::NoSpace) => {
                // Back out the half-written event and hand the caller
                // what fits; the event stays queued for the next read.
                out.rewind_to(last_full_event);
                drop(shared);
                return Ok(out.pos());
              },
            }
          }
        }

        let consumed = watcher.ring.lock().unwrap().pop();
        if let Some(consumed) = consumed {
          debug_assert!(Arc::ptr_eq(&consumed, &event));
          self.release_event_ref(&consumed);
        }
      }
      drop(shared);

      // Everything in the queue was suppressed and nothing was written:
      // wait for something deliverable rather than returning an empty
      // read.
      if skipped && !emitted {
        continue;
      }
      return Ok(out.pos());
    }
  }
}
