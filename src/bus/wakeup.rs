// Timer-coalesced consumer wakeups. A single one-shot timer covers the
// whole bus: the first low-watermark arrival arms it, further arrivals
// are no-ops, and when it fires every watcher with a pending queue gets
// one wakeup. High-watermark and error paths wake directly and never
// come through here.

use std::{
  sync::{Condvar, Mutex},
  thread,
  time::{Duration, Instant},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

#[derive(Debug, Default)]
struct TimerState {
  deadline: Option<Instant>,
  shutdown: bool,
}

/// One-shot rearmable timer driving the coalesced wakeups.
#[derive(Debug, Default)]
pub(crate) struct DeliveryTimer {
  state: Mutex<TimerState>,
  cv: Condvar,
}

impl DeliveryTimer {
  /// Arm the timer `delay` from now. Arming an armed timer is a no-op;
  /// the earlier deadline stands.
  pub fn arm(&self, delay: Duration) {
    let mut state = self.state.lock().unwrap();
    if state.deadline.is_none() {
      state.deadline = Some(Instant::now() + delay);
      self.cv.notify_all();
    }
  }

  pub fn shutdown(&self) {
    let mut state = self.state.lock().unwrap();
    state.shutdown = true;
    self.cv.notify_all();
  }

  /// Timer thread body: wait for a deadline, sleep it out, run `fire`,
  /// repeat until shutdown. `fire` runs with no timer state held.
  pub fn run(&self, mut fire: impl FnMut()) {
    let mut state = self.state.lock().unwrap();
    loop {
      if state.shutdown {
        return;
      }
      match state.deadline {
        None => {
          state = self.cv.wait(state).unwrap();
        },
        Some(deadline) => {
          let now = Instant::now();
          if now < deadline {
            let (s, _timeout) = self.cv.wait_timeout(state, deadline - now).unwrap();
            state = s;
            continue; // re-check: shutdown or spurious wake
          }
          state.deadline = None;
          drop(state);
          fire();
          state = self.state.lock().unwrap();
        },
      }
    }
  }
}

/// Spawn the timer thread. The closure walks the registry and wakes
/// pending watchers; it holds a weak reference to the bus so the thread
/// never keeps the bus alive.
pub(crate) fn spawn_timer_thread(
  timer: std::sync::Arc<DeliveryTimer>,
  fire: impl FnMut() + Send + 'static,
) -> thread::JoinHandle<()> {
  thread::Builder::new()
    .name("fsebus-delivery-timer".to_string())
    .spawn(move || {
      let mut fire = fire;
      timer.run(&mut fire);
      trace!("delivery timer thread exiting");
    })
    .expect("spawning the delivery timer thread")
}
