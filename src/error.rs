//! Error types, one small enum per API surface, with `Result` aliases.
//! The doc comments note the errno each variant corresponds to on the
//! original kernel interface.

use std::io;

use thiserror::Error;

use crate::structure::types::Dev;

/// Opening the control device. (`EPERM`)
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
  #[error("the fsevents device is restricted to the superuser")]
  NotPermitted,
}

/// Creating a watcher via the clone call.
#[derive(Debug, Error)]
pub enum CloneError {
  /// Interest vector empty or oversized. (`EINVAL`)
  #[error("invalid clone arguments: interest vector of {0} entries")]
  InvalidArgs(usize),
  /// All watcher slots taken. (`ENOSPC`)
  #[error("too many watchers")]
  NoSlot,
  /// Readiness plumbing could not be set up. (`ENOMEM`)
  #[error("watcher resource allocation failed")]
  Resources(#[from] io::Error),
}

/// Publishing an event.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
  /// The event pool is exhausted; all watchers have been flagged.
  /// (`ENOSPC`)
  #[error("event pool exhausted")]
  NoSpace,
  /// Attribute lookup failed or the spec is malformed. (`EINVAL`)
  #[error("invalid event arguments")]
  InvalidArgs,
  /// No path could be resolved for the target. (`ENOENT`)
  #[error("path resolution failed")]
  NotFound,
}

/// Reading framed events from a watcher handle.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
  /// Caller buffer below the one-event minimum. (`EINVAL`)
  #[error("read buffer must hold at least {min} bytes")]
  BufferTooSmall { min: usize },
  /// Another reader is active on this watcher. (`EAGAIN`)
  #[error("another thread is already reading this watcher")]
  Busy,
  /// Read on the raw control device instead of a cloned handle. (`EIO`)
  #[error("the raw fsevents device does not deliver events")]
  RawDevice,
}

/// Per-handle control calls.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IoctlError {
  /// Device denylist larger than the supported maximum. (`EINVAL`)
  #[error("device filter of {0} entries exceeds the maximum")]
  TooManyDevices(usize),
  /// Unmount ack for a device with no pending unmount. (`EINVAL`)
  #[error("unexpected unmount ack for dev {dev} (pending: {pending})")]
  UnexpectedAck { dev: Dev, pending: Dev },
}

/// The unmount rendezvous.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UnmountError {
  /// Not every interested watcher acknowledged within the retry budget,
  /// or an earlier unmount never cleared. The barrier state is reset.
  #[error("timed out waiting for unmount acks for dev {dev}")]
  Timeout { dev: Dev },
}

/// Producer writes on the control device.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
  /// Malformed or forbidden record in the stream. (`EINVAL`)
  #[error("invalid producer record (kind {kind})")]
  InvalidRecord { kind: i32 },
  #[error(transparent)]
  Publish(#[from] PublishError),
}

pub type OpenResult<T> = Result<T, OpenError>;
pub type CloneResult<T> = Result<T, CloneError>;
pub type PublishResult<T> = Result<T, PublishError>;
pub type ReadResult<T> = Result<T, ReadError>;
pub type IoctlResult<T> = Result<T, IoctlError>;
pub type UnmountResult<T> = Result<T, UnmountError>;
pub type WriteResult<T> = Result<T, WriteError>;
