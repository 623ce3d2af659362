// A byte-pipe readiness channel, so that a watcher handle can pose as a
// mio event::Source: the bus-side sender marks an edge, poll observers
// see the handle become readable, and the reader drains the pipe before
// draining its queue.

use std::io::{self, Read, Write};

use mio::{event, unix::pipe, Interest, Registry, Token};

pub(crate) fn make_poll_channel() -> io::Result<(PollEventSource, PollEventSender)> {
  let (sender, receiver) = pipe::new()?;
  Ok((
    PollEventSource { receiver },
    PollEventSender { sender },
  ))
}

/// Bus-side end: signals readiness. Signalling is best-effort; a full
/// pipe already carries a pending edge, so WouldBlock is not an error.
#[derive(Debug)]
pub(crate) struct PollEventSender {
  sender: pipe::Sender,
}

impl PollEventSender {
  pub fn send(&self) {
    match (&self.sender).write(&[0u8]) {
      Ok(_) => (),
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => (),
      Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
      // The receiving end is gone: the handle is being torn down.
      Err(_) => (),
    }
  }
}

/// Consumer-side end: a registerable readiness source.
#[derive(Debug)]
pub struct PollEventSource {
  receiver: pipe::Receiver,
}

impl PollEventSource {
  /// Consume any pending readiness edges.
  pub fn drain(&self) {
    let mut buf = [0u8; 64];
    loop {
      match (&self.receiver).read(&mut buf) {
        Ok(0) => break, // sender closed
        Ok(_) => continue,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(_) => break, // WouldBlock: drained
      }
    }
  }
}

impl event::Source for PollEventSource {
  fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
    self.receiver.register(registry, token, interests)
  }

  fn reregister(
    &mut self,
    registry: &Registry,
    token: Token,
    interests: Interest,
  ) -> io::Result<()> {
    self.receiver.reregister(registry, token, interests)
  }

  fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
    self.receiver.deregister(registry)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use mio::{Events, Poll};

  #[test]
  fn edge_is_observable_and_drains() {
    let (mut source, sender) = make_poll_channel().unwrap();
    let mut poll = Poll::new().unwrap();
    poll
      .registry()
      .register(&mut source, Token(1), Interest::READABLE)
      .unwrap();

    sender.send();
    sender.send();

    let mut events = Events::with_capacity(4);
    poll
      .poll(&mut events, Some(std::time::Duration::from_secs(2)))
      .unwrap();
    assert!(events.iter().any(|e| e.token() == Token(1)));

    source.drain();
    let mut events = Events::with_capacity(4);
    poll
      .poll(&mut events, Some(std::time::Duration::from_millis(50)))
      .unwrap();
    assert!(events.is_empty());
  }
}
