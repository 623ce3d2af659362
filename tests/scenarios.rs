// End-to-end scenarios through the device facade: pool exhaustion,
// coalescing, backpressure shedding, two-target framing, the unmount
// barrier and close-time cleanup.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
  thread,
  time::Duration,
};

use fsebus::{
  collaborators::{Collaborators, FsResolver, NextLink, ResolvedPath, TaskCapabilities},
  device::{CloneArgs, FsEventsDevice},
  error::{PublishError, ReadError, UnmountError},
  wire, BusConfig, Capability, EventKind, EventSpec, FileInfo, FsEventBus, Handle, Interest,
  NameTable, Owner, Pid, Target, EVENTS_DROPPED_CODE, KIND_SPACE, MODE_HLINK,
  MODE_TRUNCATED_PATH,
};

const PRODUCER: Pid = 1234;

// ---------------------------------------------------------------------
// Harness

/// Superuser only: may open the device but holds no watcher entitlement,
/// so its watchers are subject to shedding and directory suppression.
struct SuperOnly;

impl TaskCapabilities for SuperOnly {
  fn task_has(&self, _pid: Pid, cap: Capability) -> bool {
    cap == Capability::Superuser
  }
}

/// Superuser plus the watcher-service entitlement.
struct Entitled;

impl TaskCapabilities for Entitled {
  fn task_has(&self, _pid: Pid, cap: Capability) -> bool {
    matches!(cap, Capability::Superuser | Capability::WatchEvents)
  }
}

struct Fixture {
  bus: FsEventBus,
  interner: Arc<NameTable>,
}

fn fixture_with(pool_capacity: usize, caps: Arc<dyn TaskCapabilities>) -> Fixture {
  let interner = Arc::new(NameTable::new());
  let collaborators = Collaborators {
    capabilities: caps,
    interner: interner.clone(),
    ..Collaborators::default()
  };
  let config = BusConfig {
    pool_capacity,
    delivery_delay: Duration::from_millis(5),
    unmount_tick: Duration::from_millis(50),
    unmount_retries: 4,
    ..BusConfig::default()
  };
  Fixture {
    bus: FsEventBus::new(config, collaborators),
    interner,
  }
}

fn fixture(pool_capacity: usize) -> Fixture {
  fixture_with(pool_capacity, Arc::new(SuperOnly))
}

fn report_all() -> Vec<Interest> {
  vec![Interest::Report; KIND_SPACE]
}

fn owner(name: &str) -> Owner {
  Owner {
    pid: 4242,
    name: name.to_string(),
  }
}

fn info(ino: u64, dev: i32) -> FileInfo {
  FileInfo {
    ino,
    dev,
    mode: 0o100644,
    uid: 501,
    document_id: 7,
    nlink: 1,
  }
}

fn modify(path: &str, ino: u64) -> EventSpec {
  EventSpec::regular(EventKind::ContentModified, Target::info(path.as_bytes().to_vec(), info(ino, 1)))
}

fn create(path: &str, ino: u64) -> EventSpec {
  EventSpec::regular(EventKind::CreateFile, Target::info(path.as_bytes().to_vec(), info(ino, 1)))
}

// ---------------------------------------------------------------------
// A little TLV scanner. Every read must parse as a whole number of
// records, each terminated by ARG_DONE.

#[derive(Debug)]
struct Record {
  kind: i32,
  #[allow(dead_code)]
  pid: i32,
  args: Vec<(u16, Vec<u8>)>,
}

impl Record {
  fn strings(&self) -> Vec<&[u8]> {
    self
      .args
      .iter()
      .filter(|(tag, _)| *tag == wire::ARG_STRING)
      .map(|(_, body)| body.as_slice())
      .collect()
  }

  fn timestamp(&self) -> u64 {
    let (_, body) = self
      .args
      .iter()
      .rev()
      .find(|(tag, _)| *tag == wire::ARG_INT64)
      .expect("record has no timestamp trailer");
    u64::from_ne_bytes(body.as_slice().try_into().unwrap())
  }
}

fn scan(buf: &[u8]) -> Vec<Record> {
  let mut records = Vec::new();
  let mut at = 0;
  while at < buf.len() {
    let kind = i32::from_ne_bytes(buf[at..at + 4].try_into().unwrap());
    let pid = i32::from_ne_bytes(buf[at + 4..at + 8].try_into().unwrap());
    at += 8;
    let mut args = Vec::new();
    loop {
      let tag = u16::from_ne_bytes(buf[at..at + 2].try_into().unwrap());
      at += 2;
      if tag == wire::ARG_DONE {
        break;
      }
      let len = u16::from_ne_bytes(buf[at..at + 2].try_into().unwrap()) as usize;
      at += 2;
      args.push((tag, buf[at..at + len].to_vec()));
      at += len;
    }
    records.push(Record { kind, pid, args });
  }
  assert_eq!(at, buf.len(), "read did not parse as whole records");
  records
}

fn read_records(handle: &fsebus::WatcherHandle) -> Vec<Record> {
  let mut buf = vec![0u8; 64 * 1024];
  let n = handle.read(&mut buf).unwrap();
  scan(&buf[..n])
}

// ---------------------------------------------------------------------
// Scenarios

#[test_log::test]
fn exhaustion_is_disclosed_to_every_watcher() {
  let fx = fixture(4);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let a = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("a"),
    })
    .unwrap();
  let b = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("b"),
    })
    .unwrap();

  for i in 0..4 {
    fx.bus.publish(&create(&format!("/f{i}"), 100 + i), PRODUCER).unwrap();
  }
  let err = fx
    .bus
    .publish(&create("/f4", 104), PRODUCER)
    .unwrap_err();
  assert_eq!(err, PublishError::NoSpace);

  for handle in [&a, &b] {
    let records = read_records(handle);
    assert_eq!(records[0].kind, EVENTS_DROPPED_CODE, "loss marker leads");
    assert!(records[0].args.is_empty());
    // The four events queued before the pool ran dry are still there.
    assert_eq!(records.len(), 5);
  }
}

#[test]
fn repeated_events_coalesce_to_one_record() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("c"),
    })
    .unwrap();

  for _ in 0..3 {
    fx.bus.publish(&modify("/a", 100), PRODUCER).unwrap();
  }

  let records = read_records(&handle);
  assert_eq!(records.len(), 1);
  assert_eq!(records[0].kind, EventKind::ContentModified.code());
  assert_eq!(fx.bus.diagnostics().num_coalesced, 2);
}

#[test]
fn different_producers_do_not_coalesce() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("c"),
    })
    .unwrap();

  fx.bus.publish(&modify("/a", 100), 100).unwrap();
  fx.bus.publish(&modify("/a", 100), 200).unwrap();

  assert_eq!(read_records(&handle).len(), 2);
}

#[test_log::test]
fn lagging_watcher_is_shed_and_told_so() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 16,
      owner: owner("laggard"),
    })
    .unwrap();

  for i in 0..20 {
    fx.bus.publish(&create(&format!("/f{i}"), 100 + i), PRODUCER).unwrap();
  }

  let records = read_records(&handle);
  assert_eq!(records.len(), 1, "only the loss marker");
  assert_eq!(records[0].kind, EVENTS_DROPPED_CODE);

  // The bus recovered the references it shed.
  fx.bus.publish(&create("/after", 999), PRODUCER).unwrap();
  let records = read_records(&handle);
  assert_eq!(records.len(), 1);
  assert_eq!(records[0].strings(), vec![b"/after\0".as_slice()]);
}

#[test]
fn privileged_watcher_is_never_shed() {
  let fx = fixture_with(64, Arc::new(Entitled));
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 16,
      owner: owner("mds"),
    })
    .unwrap();

  for i in 0..14 {
    fx.bus.publish(&create(&format!("/f{i}"), 100 + i), PRODUCER).unwrap();
  }

  // 14 fit in a 16-deep ring (15 usable) without shedding.
  let records = read_records(&handle);
  assert_eq!(records.len(), 14);
  assert!(records.iter().all(|r| r.kind != EVENTS_DROPPED_CODE));
}

#[test]
fn rename_is_one_atomic_record_with_both_paths() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("r"),
    })
    .unwrap();

  let spec = EventSpec::two_target(
    EventKind::Rename,
    Target::info(b"/src".to_vec(), info(100, 1)),
    Target::info(b"/dst".to_vec(), info(101, 1)),
  );
  fx.bus.publish(&spec, PRODUCER).unwrap();

  let records = read_records(&handle);
  assert_eq!(records.len(), 1);
  let rec = &records[0];
  assert_eq!(rec.kind, EventKind::Rename.code());
  assert_eq!(
    rec.strings(),
    vec![b"/src\0".as_slice(), b"/dst\0".as_slice()],
    "source then destination"
  );
  // Pool slots for both halves come back once the record is delivered.
  assert_eq!(fx.bus.diagnostics().pool_in_use, 0);
}

#[test]
fn rename_to_new_name_has_no_destination_info() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("r"),
    })
    .unwrap();

  let spec = EventSpec::two_target(
    EventKind::Rename,
    Target::info(b"/src".to_vec(), info(100, 1)),
    Target::info(b"/dst".to_vec(), FileInfo::default()),
  );
  fx.bus.publish(&spec, PRODUCER).unwrap();

  let records = read_records(&handle);
  let rec = &records[0];
  assert_eq!(rec.strings().len(), 2);
  // Exactly one dev arg: the destination stops after its path.
  let devs = rec.args.iter().filter(|(t, _)| *t == wire::ARG_DEV).count();
  assert_eq!(devs, 1);
}

#[test]
fn unmount_barrier_completes_when_all_ack() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let a = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("a"),
    })
    .unwrap();
  let b = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("b"),
    })
    .unwrap();

  let bus = fx.bus.clone();
  let barrier = thread::spawn(move || bus.unmount_barrier(42, PRODUCER));

  for handle in [&a, &b] {
    let records = read_records(handle);
    assert_eq!(records.len(), 1);
    let rec = &records[0];
    assert_eq!(rec.kind, EventKind::UnmountPending.code());
    let (tag, body) = &rec.args[0];
    assert_eq!(*tag, wire::ARG_DEV);
    assert_eq!(i32::from_ne_bytes(body.as_slice().try_into().unwrap()), 42);
    handle.unmount_ack(42).unwrap();
  }

  barrier.join().unwrap().unwrap();
}

#[test_log::test]
fn unmount_barrier_times_out_and_clears() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let a = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("a"),
    })
    .unwrap();
  let b = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("b"),
    })
    .unwrap();

  let bus = fx.bus.clone();
  let barrier = thread::spawn(move || bus.unmount_barrier(42, PRODUCER));

  // Only one of the two interested watchers acknowledges.
  let records = read_records(&a);
  assert_eq!(records[0].kind, EventKind::UnmountPending.code());
  a.unmount_ack(42).unwrap();
  let _ = read_records(&b); // b reads but never acks

  assert_eq!(
    barrier.join().unwrap(),
    Err(UnmountError::Timeout { dev: 42 })
  );
  // The barrier state was reset: a late ack is rejected.
  assert!(b.unmount_ack(42).is_err());
}

#[test]
fn unmount_with_no_subscribers_returns_immediately() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let mut interest = report_all();
  interest[EventKind::UnmountPending.code() as usize] = Interest::Ignore;
  let _handle = device
    .clone_watcher(&CloneArgs {
      interest: &interest,
      queue_depth: 64,
      owner: owner("deaf"),
    })
    .unwrap();

  fx.bus.unmount_barrier(42, PRODUCER).unwrap();
}

#[test]
fn close_drains_the_queue_and_the_intern_table() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("d"),
    })
    .unwrap();

  for i in 0..7 {
    fx.bus.publish(&create(&format!("/leak{i}"), 100 + i), PRODUCER).unwrap();
  }
  assert_eq!(fx.bus.diagnostics().pool_in_use, 7);
  assert!(fx.interner.outstanding() > 0);

  handle.close();

  assert_eq!(fx.bus.diagnostics().pool_in_use, 0);
  assert_eq!(fx.interner.outstanding(), 0);
  assert_eq!(fx.bus.diagnostics().events_outstanding, 0);
}

// ---------------------------------------------------------------------
// Ordering and filtering

#[test]
fn delivered_timestamps_are_monotone_per_producer() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("o"),
    })
    .unwrap();

  for i in 0..10 {
    fx.bus.publish(&create(&format!("/o{i}"), 200 + i), PRODUCER).unwrap();
  }

  let records = read_records(&handle);
  assert_eq!(records.len(), 10);
  let stamps: Vec<u64> = records.iter().map(Record::timestamp).collect();
  assert!(stamps.windows(2).all(|w| w[0] <= w[1]), "{stamps:?}");
}

#[test]
fn device_denylist_filters_and_clears() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("f"),
    })
    .unwrap();

  handle.set_device_filter(&[7]).unwrap();
  fx.bus
    .publish(&EventSpec::regular(EventKind::CreateFile, Target::info(b"/on7".to_vec(), info(1, 7))), PRODUCER)
    .unwrap();
  fx.bus
    .publish(&EventSpec::regular(EventKind::CreateFile, Target::info(b"/on8".to_vec(), info(2, 8))), PRODUCER)
    .unwrap();

  let records = read_records(&handle);
  assert_eq!(records.len(), 1);
  assert_eq!(records[0].strings(), vec![b"/on8\0".as_slice()]);

  handle.set_device_filter(&[]).unwrap();
  fx.bus
    .publish(&EventSpec::regular(EventKind::CreateFile, Target::info(b"/again7".to_vec(), info(3, 7))), PRODUCER)
    .unwrap();
  assert_eq!(read_records(&handle).len(), 1);
}

#[test]
fn ignored_directories_are_suppressed_for_plain_watchers() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("plain"),
    })
    .unwrap();

  fx.bus
    .publish(&create("/Volumes/x/.Spotlight-V100/store", 300), PRODUCER)
    .unwrap();
  fx.bus.publish(&create("/Volumes/x/real", 301), PRODUCER).unwrap();

  let records = read_records(&handle);
  assert_eq!(records.len(), 1);
  assert_eq!(records[0].strings(), vec![b"/Volumes/x/real\0".as_slice()]);
}

#[test]
fn entitled_watchers_see_ignored_directories() {
  let fx = fixture_with(64, Arc::new(Entitled));
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("mds"),
    })
    .unwrap();

  fx.bus
    .publish(&create("/Volumes/x/.Spotlight-V100/store", 300), PRODUCER)
    .unwrap();

  assert_eq!(read_records(&handle).len(), 1);
}

#[test]
fn unentitled_activity_interest_is_stripped() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("nosy"),
    })
    .unwrap();

  // No one holds the activity entitlement, so this publish has no
  // audience at all.
  fx.bus
    .publish(
      &EventSpec::Activity {
        version: 1,
        dev: 1,
        ino: 5,
        origin_id: 9,
        age: 0,
        use_state: 1,
        urgency: 0,
        size: 4096,
      },
      PRODUCER,
    )
    .unwrap();
  fx.bus.publish(&create("/visible", 400), PRODUCER).unwrap();

  let records = read_records(&handle);
  assert_eq!(records.len(), 1);
  assert_eq!(records[0].kind, EventKind::CreateFile.code());
}

// ---------------------------------------------------------------------
// Encodings and handle calls

#[test]
fn compact_mode_packs_file_info_into_one_blob() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("compact"),
    })
    .unwrap();
  handle.want_compact_events();

  fx.bus.publish(&create("/c", 500), PRODUCER).unwrap();

  let records = read_records(&handle);
  let rec = &records[0];
  let finfo: Vec<&Vec<u8>> = rec
    .args
    .iter()
    .filter(|(t, _)| *t == wire::ARG_FINFO)
    .map(|(_, b)| b)
    .collect();
  assert_eq!(finfo.len(), 1);
  assert_eq!(finfo[0].len(), FileInfo::COPY_SIZE);
  assert_eq!(u64::from_ne_bytes(finfo[0][0..8].try_into().unwrap()), 500);
  assert!(rec.args.iter().all(|(t, _)| *t != wire::ARG_DEV));
}

#[test]
fn extended_info_reports_dropped_data_in_the_kind_word() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("ext"),
    })
    .unwrap();
  handle.want_extended_info();

  let mut truncated = info(600, 1);
  truncated.mode |= MODE_TRUNCATED_PATH;
  fx.bus
    .publish(
      &EventSpec::regular(EventKind::ContentModified, Target::info(b"/t".to_vec(), truncated)),
      PRODUCER,
    )
    .unwrap();

  let records = read_records(&handle);
  let word = records[0].kind;
  assert_eq!(word & wire::KIND_CODE_MASK, EventKind::ContentModified.code());
  assert_eq!(word >> wire::KIND_FLAG_SHIFT, wire::KIND_FLAG_CONTAINS_DROPPED);
}

#[test]
fn current_event_id_tracks_the_newest_queued_event() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("id"),
    })
    .unwrap();

  assert_eq!(handle.current_event_id(), 0);
  fx.bus.publish(&create("/id", 700), PRODUCER).unwrap();
  let first = handle.current_event_id();
  assert!(first > 0);
  fx.bus.publish(&create("/id2", 701), PRODUCER).unwrap();
  assert!(handle.current_event_id() > first);
}

#[test]
fn writes_inject_events_and_carry_partial_records() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("w"),
    })
    .unwrap();

  let mut stream = fsebus::encode_record(EventKind::CreateFile, &info(800, 1), b"/w0", None);
  stream.extend_from_slice(&fsebus::encode_record(
    EventKind::Rename,
    &info(801, 1),
    b"/w1",
    Some((&info(802, 1), b"/w2")),
  ));

  // Split mid-record; the device keeps the tail until the next write.
  let cut = stream.len() - 5;
  device.write(&stream[..cut], PRODUCER).unwrap();
  device.write(&stream[cut..], PRODUCER).unwrap();

  let records = read_records(&handle);
  assert_eq!(records.len(), 2);
  assert_eq!(records[0].strings(), vec![b"/w0\0".as_slice()]);
  assert_eq!(
    records[1].strings(),
    vec![b"/w1\0".as_slice(), b"/w2\0".as_slice()]
  );
}

#[test]
fn forbidden_write_kinds_are_rejected() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();

  let mut bytes = fsebus::encode_record(EventKind::CreateFile, &info(1, 1), b"/x", None);
  bytes[0..4].copy_from_slice(&EventKind::Activity.code().to_ne_bytes());
  assert!(device.write(&bytes, PRODUCER).is_err());
}

#[test]
fn device_surface_errors() {
  let fx = fixture(64);

  // Non-superuser cannot open at all.
  let no_super = fixture_with(8, Arc::new(fsebus::collaborators::GrantNone));
  assert!(FsEventsDevice::open(&no_super.bus, 1).is_err());

  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let mut buf = [0u8; 4096];
  assert_eq!(device.read(&mut buf), Err(ReadError::RawDevice));

  // Undersized clone interest and oversized filters.
  assert!(device
    .clone_watcher(&CloneArgs {
      interest: &[],
      queue_depth: 8,
      owner: owner("bad"),
    })
    .is_err());

  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 8,
      owner: owner("ok"),
    })
    .unwrap();
  assert!(handle.set_device_filter(&vec![1; 257]).is_err());

  // Reads need one event's worth of space.
  let mut tiny = [0u8; 16];
  assert_eq!(
    handle.read(&mut tiny),
    Err(ReadError::BufferTooSmall { min: fsebus::MIN_READ_BUFFER })
  );
}

#[test]
fn second_concurrent_reader_is_busy() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let handle = Arc::new(
    device
      .clone_watcher(&CloneArgs {
        interest: &report_all(),
        queue_depth: 64,
        owner: owner("busy"),
      })
      .unwrap(),
  );

  let blocked = Arc::clone(&handle);
  let reader = thread::spawn(move || {
    let mut buf = vec![0u8; 4096];
    blocked.read(&mut buf)
  });
  thread::sleep(Duration::from_millis(100));

  let mut buf = vec![0u8; 4096];
  assert_eq!(handle.read(&mut buf), Err(ReadError::Busy));

  // Release the blocked reader.
  fx.bus.publish(&create("/unblock", 900), PRODUCER).unwrap();
  assert!(reader.join().unwrap().unwrap() > 0);
}

#[test]
fn watcher_slots_are_bounded() {
  let fx = fixture(64);
  let device = FsEventsDevice::open(&fx.bus, 1).unwrap();
  let mut handles = Vec::new();
  for i in 0..fsebus::MAX_WATCHERS {
    handles.push(
      device
        .clone_watcher(&CloneArgs {
          interest: &report_all(),
          queue_depth: 8,
          owner: owner(&format!("w{i}")),
        })
        .unwrap(),
    );
  }
  assert!(device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 8,
      owner: owner("overflow"),
    })
    .is_err());

  // Freeing a slot makes room again.
  handles.pop();
  assert!(device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 8,
      owner: owner("fits"),
    })
    .is_ok());
}

// ---------------------------------------------------------------------
// Hardlink replication

struct LinkFarm {
  attrs: FileInfo,
  primary: &'static [u8],
  siblings: Mutex<HashMap<u64, NextLink>>,
}

impl FsResolver for LinkFarm {
  fn attributes(&self, _handle: Handle) -> Option<FileInfo> {
    Some(self.attrs)
  }

  fn path_of(&self, _handle: Handle) -> Option<ResolvedPath> {
    Some(ResolvedPath::complete(self.primary))
  }

  fn next_link(&self, _dev: i32, linkid: u64) -> Option<NextLink> {
    self.siblings.lock().unwrap().get(&linkid).cloned()
  }
}

#[test]
fn hardlinked_content_events_replicate_across_siblings() {
  let farm = LinkFarm {
    attrs: FileInfo {
      ino: 100,
      dev: 1,
      mode: 0o100644 | MODE_HLINK,
      uid: 501,
      document_id: 0,
      nlink: 3,
    },
    primary: b"/links/a",
    siblings: Mutex::new(HashMap::from([
      (
        100,
        NextLink {
          linkid: 101,
          path: Some(b"/links/b".to_vec()),
        },
      ),
      (
        101,
        NextLink {
          linkid: 102,
          path: Some(b"/links/c".to_vec()),
        },
      ),
    ])),
  };

  let interner = Arc::new(NameTable::new());
  let collaborators = Collaborators {
    capabilities: Arc::new(SuperOnly),
    resolver: Arc::new(farm),
    interner: interner.clone(),
    ..Collaborators::default()
  };
  let bus = FsEventBus::new(
    BusConfig {
      pool_capacity: 64,
      delivery_delay: Duration::from_millis(5),
      ..BusConfig::default()
    },
    collaborators,
  );

  let device = FsEventsDevice::open(&bus, 1).unwrap();
  let handle = device
    .clone_watcher(&CloneArgs {
      interest: &report_all(),
      queue_depth: 64,
      owner: owner("links"),
    })
    .unwrap();

  bus
    .publish(
      &EventSpec::regular(EventKind::ContentModified, Target::Handle(Handle { id: 1, gen: 1 })),
      PRODUCER,
    )
    .unwrap();

  let records = read_records(&handle);
  let paths: Vec<Vec<u8>> = records
    .iter()
    .map(|r| r.strings()[0].to_vec())
    .collect();
  assert_eq!(
    paths,
    vec![
      b"/links/a\0".to_vec(),
      b"/links/b\0".to_vec(),
      b"/links/c\0".to_vec(),
    ]
  );

  drop(handle);
  assert_eq!(interner.outstanding(), 0);
}
