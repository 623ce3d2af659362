//! The control-device facade: what the character device exposes to
//! userspace, as an in-process API. Opening is superuser-only; producers
//! write packed records; consumers clone private watcher handles and
//! read the framed event stream from those.

use std::sync::{Arc, Mutex};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  bus::{watcher::Watcher, FsEventBus, WatcherFlag},
  error::{
    CloneResult, IoctlError, IoctlResult, OpenError, OpenResult, ReadError, ReadResult,
    WriteResult,
  },
  messages::producer::RecordParser,
  poll_source::PollEventSource,
  structure::types::{Capability, Dev, Interest, Owner, Pid},
};

/// Largest accepted device denylist.
pub const MAX_DEVICE_FILTERS: usize = 256;

/// Arguments of the clone call that turns the raw device into a watcher
/// handle.
#[derive(Debug, Clone)]
pub struct CloneArgs<'a> {
  /// Per-kind interest bytes, indexed by kind code. Length 1..=4096.
  pub interest: &'a [Interest],
  /// Requested ring capacity; zero or out-of-range values fall back to
  /// the pool capacity.
  pub queue_depth: usize,
  pub owner: Owner,
}

/// An open handle on the raw control device.
pub struct FsEventsDevice {
  bus: FsEventBus,
  writer: Mutex<RecordParser>,
}

impl FsEventsDevice {
  /// Open the control device. Only the superuser may.
  pub fn open(bus: &FsEventBus, pid: Pid) -> OpenResult<FsEventsDevice> {
    if !bus.core.capabilities.task_has(pid, Capability::Superuser) {
      return Err(OpenError::NotPermitted);
    }
    Ok(FsEventsDevice {
      bus: bus.clone(),
      writer: Mutex::new(RecordParser::default()),
    })
  }

  /// Reads are only valid on cloned watcher handles.
  pub fn read(&self, _buf: &mut [u8]) -> ReadResult<usize> {
    Err(ReadError::RawDevice)
  }

  /// Inject events: a concatenation of packed producer records. Partial
  /// trailing records are kept and completed by the next write.
  pub fn write(&self, data: &[u8], pid: Pid) -> WriteResult<usize> {
    let mut writer = self.writer.lock().unwrap();
    writer.ingest(data, |spec| {
      self.bus.publish(&spec, pid)?;
      Ok(())
    })?;
    Ok(data.len())
  }

  /// Create a private watcher handle delivering framed events.
  pub fn clone_watcher(&self, args: &CloneArgs<'_>) -> CloneResult<WatcherHandle> {
    let (watcher, poll_source) =
      self
        .bus
        .core
        .add_watcher(args.interest, args.queue_depth, &args.owner)?;
    Ok(WatcherHandle {
      bus: self.bus.clone(),
      watcher,
      poll_source,
    })
  }
}

/// A cloned per-watcher handle: the consumer side of the bus.
///
/// Dropping the handle closes the watcher, draining its queue and
/// releasing every queued event reference.
pub struct WatcherHandle {
  bus: FsEventBus,
  watcher: Arc<Watcher>,
  poll_source: PollEventSource,
}

impl WatcherHandle {
  /// Read zero or more whole framed events. Blocks while the queue is
  /// empty; returns `Ok(0)` when the watcher is closing. The buffer must
  /// hold at least [`MIN_READ_BUFFER`](crate::MIN_READ_BUFFER) bytes.
  pub fn read(&self, buf: &mut [u8]) -> ReadResult<usize> {
    self.poll_source.drain();
    self.bus.core.read_events(&self.watcher, buf)
  }

  /// Switch delivery to the packed single-blob file-info encoding.
  pub fn want_compact_events(&self) {
    self.watcher.set_flag(WatcherFlag::WantsCompactEvents);
  }

  /// Carry per-event flag bits in the kind word.
  pub fn want_extended_info(&self) {
    self.watcher.set_flag(WatcherFlag::WantsExtendedInfo);
  }

  /// Highest event id (timestamp tick) ever queued for this watcher.
  pub fn current_event_id(&self) -> u64 {
    self
      .watcher
      .max_event_id
      .load(std::sync::atomic::Ordering::SeqCst)
  }

  /// Replace the device denylist. An empty list clears the filter.
  pub fn set_device_filter(&self, devices: &[Dev]) -> IoctlResult<()> {
    if devices.len() > MAX_DEVICE_FILTERS {
      return Err(IoctlError::TooManyDevices(devices.len()));
    }
    let mut denylist = self.watcher.devices_not_to_watch.lock().unwrap();
    *denylist = if devices.is_empty() {
      None
    } else {
      Some(devices.to_vec())
    };
    Ok(())
  }

  /// Acknowledge an `UnmountPending` event for `dev`.
  pub fn unmount_ack(&self, dev: Dev) -> IoctlResult<()> {
    self.bus.core.unmount_ack(dev)
  }

  /// Readiness source for poll-style consumers: becomes readable when
  /// the watcher is woken.
  pub fn poll_source(&mut self) -> &mut PollEventSource {
    &mut self.poll_source
  }

  /// Close the watcher, waiting out any in-flight reader and draining
  /// the queue. Also runs on drop.
  pub fn close(self) {
    // Drop does the work.
  }
}

impl Drop for WatcherHandle {
  fn drop(&mut self) {
    self.bus.core.remove_watcher(&self.watcher);
  }
}
