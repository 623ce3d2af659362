// Short-window suppression of repeated identical events. A burst of
// stat-changed or content-modified notifications for the same file from
// the same process collapses to a single event; anything that creates,
// destroys or relinks names is always reported.

use std::sync::Arc;

use crate::structure::{
  event::Event,
  types::{EventKind, Handle, Pid},
};

/// What identifies the target of a publish for duplicate detection:
/// the handle identity if the producer had one, else the path bytes.
#[derive(Debug, Clone, Copy)]
pub(crate) enum DedupIdent<'a> {
  Handle(Handle),
  Path(&'a [u8]),
  None,
}

/// State of the duplicate filter. Guarded by the list lock.
#[derive(Debug, Default)]
pub(crate) struct CoalesceState {
  last_kind: Option<EventKind>,
  last_handle: Option<Handle>,
  last_path: Vec<u8>,
  last_pid: Pid,
  last_time: u64,
  /// Address of the most recently allocated event, so that delivering or
  /// releasing it can invalidate the filter.
  last_event_addr: Option<usize>,
  pub num_coalesced: u64,
}

impl CoalesceState {
  /// Decide whether a publish is a duplicate of the previous one. On a
  /// miss the state is updated to describe the new event; eligible-kind
  /// checks aside, ineligible publishes leave the state untouched.
  pub fn should_suppress(
    &mut self,
    kind: EventKind,
    ident: DedupIdent<'_>,
    pid: Pid,
    now: u64,
    window: u64,
  ) -> bool {
    if !kind.dedup_eligible() {
      return false;
    }

    let elapsed = now.saturating_sub(self.last_time);
    if Some(kind) == self.last_kind && elapsed < window && pid == self.last_pid {
      let same_target = match ident {
        DedupIdent::Handle(h) => self.last_handle == Some(h),
        DedupIdent::Path(p) => !self.last_path.is_empty() && self.last_path == p,
        DedupIdent::None => false,
      };
      if same_target {
        self.num_coalesced += 1;
        return true;
      }
    }

    match ident {
      DedupIdent::Handle(h) => {
        self.last_handle = Some(h);
        self.last_path.clear();
      },
      DedupIdent::Path(p) => {
        self.last_handle = None;
        self.last_path.clear();
        self.last_path.extend_from_slice(p);
      },
      DedupIdent::None => {
        self.last_handle = None;
        self.last_path.clear();
      },
    }
    self.last_kind = Some(kind);
    self.last_pid = pid;
    self.last_time = now;
    false
  }

  pub fn remember(&mut self, event: &Arc<Event>) {
    self.last_event_addr = Some(Arc::as_ptr(event) as usize);
  }

  /// Delivering or freeing the remembered event ends its dedup window.
  pub fn forget_if(&mut self, event: &Arc<Event>) {
    if self.last_event_addr == Some(Arc::as_ptr(event) as usize) {
      self.last_event_addr = None;
      self.last_kind = None;
      self.last_time = 0;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const WINDOW: u64 = 1_000_000_000;

  #[test]
  fn repeated_event_within_window_is_suppressed() {
    let mut state = CoalesceState::default();
    let ident = DedupIdent::Path(b"/a");
    assert!(!state.should_suppress(EventKind::ContentModified, ident, 100, 0, WINDOW));
    assert!(state.should_suppress(EventKind::ContentModified, ident, 100, 50, WINDOW));
    assert!(state.should_suppress(EventKind::ContentModified, ident, 100, 900, WINDOW));
    assert_eq!(state.num_coalesced, 2);
  }

  #[test]
  fn window_expiry_reports_again() {
    let mut state = CoalesceState::default();
    let ident = DedupIdent::Path(b"/a");
    assert!(!state.should_suppress(EventKind::StatChanged, ident, 1, 0, WINDOW));
    assert!(!state.should_suppress(EventKind::StatChanged, ident, 1, WINDOW, WINDOW));
  }

  #[test]
  fn different_pid_path_or_kind_is_not_a_duplicate() {
    let mut state = CoalesceState::default();
    assert!(!state.should_suppress(EventKind::StatChanged, DedupIdent::Path(b"/a"), 1, 0, WINDOW));
    assert!(!state.should_suppress(EventKind::StatChanged, DedupIdent::Path(b"/a"), 2, 1, WINDOW));
    assert!(!state.should_suppress(EventKind::StatChanged, DedupIdent::Path(b"/b"), 2, 2, WINDOW));
    assert!(!state.should_suppress(EventKind::XattrModified, DedupIdent::Path(b"/b"), 2, 3, WINDOW));
  }

  #[test]
  fn handle_identity_requires_matching_generation() {
    let mut state = CoalesceState::default();
    let first = DedupIdent::Handle(Handle { id: 9, gen: 1 });
    let recycled = DedupIdent::Handle(Handle { id: 9, gen: 2 });
    assert!(!state.should_suppress(EventKind::ContentModified, first, 1, 0, WINDOW));
    assert!(!state.should_suppress(EventKind::ContentModified, recycled, 1, 1, WINDOW));
    assert!(state.should_suppress(EventKind::ContentModified, recycled, 1, 2, WINDOW));
  }

  #[test]
  fn ineligible_kinds_are_never_suppressed_and_do_not_disturb_state() {
    let mut state = CoalesceState::default();
    let ident = DedupIdent::Path(b"/a");
    assert!(!state.should_suppress(EventKind::ContentModified, ident, 1, 0, WINDOW));
    // A create in between must not break the suppression chain.
    assert!(!state.should_suppress(EventKind::CreateFile, ident, 1, 1, WINDOW));
    assert!(state.should_suppress(EventKind::ContentModified, ident, 1, 2, WINDOW));
  }

  #[test]
  fn forgetting_the_remembered_event_reopens_reporting() {
    let mut state = CoalesceState::default();
    let ident = DedupIdent::Path(b"/a");
    let event = Arc::new(Event::new(EventKind::ContentModified, 0, 1, None));
    assert!(!state.should_suppress(EventKind::ContentModified, ident, 1, 0, WINDOW));
    state.remember(&event);
    state.forget_if(&event);
    assert!(!state.should_suppress(EventKind::ContentModified, ident, 1, 1, WINDOW));
  }
}
