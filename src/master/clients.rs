//! Connected client bookkeeping for the session master.

use std::io::{
  self,
  Read,
};
use std::os::unix::io::{
  AsRawFd,
  RawFd,
};
use std::os::unix::net::UnixStream;

use hashbrown::HashMap;

use crate::protocol::PACKET_SIZE;

/// One connected peer. A client only receives program output while its
/// attached flag is set; control packets are accepted either way.
pub struct Client {
  pub stream: UnixStream,
  pub attached: bool,
  /// Reassembly buffer for a partially received packet.
  buf: [u8; PACKET_SIZE],
  filled: usize,
}

impl Client {
  fn new(stream: UnixStream) -> Self {
    Self {
      stream,
      attached: false,
      buf: [0; PACKET_SIZE],
      filled: 0,
    }
  }

  /// Make one read towards the next packet. Returns the raw packet once it
  /// is complete, `None` while it isn't (including EAGAIN), and an error
  /// when the client is gone and must be dropped.
  pub fn read_packet(&mut self) -> io::Result<Option<[u8; PACKET_SIZE]>> {
    match self.stream.read(&mut self.buf[self.filled..]) {
      Ok(0) => Err(io::ErrorKind::UnexpectedEof.into()),
      Ok(n) => {
        self.filled += n;
        if self.filled == PACKET_SIZE {
          self.filled = 0;
          Ok(Some(self.buf))
        } else {
          Ok(None)
        }
      }
      Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
        Ok(None)
      }
      Err(e) => Err(e),
    }
  }
}

/// The set of connected clients, keyed by their socket fd. Order is not
/// observable; removal closes the fd.
#[derive(Default)]
pub struct Clients {
  map: HashMap<RawFd, Client>,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, stream: UnixStream) -> RawFd {
    let fd = stream.as_raw_fd();
    self.map.insert(fd, Client::new(stream));
    fd
  }

  pub fn remove(&mut self, fd: RawFd) {
    self.map.remove(&fd);
  }

  pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Client> {
    self.map.get_mut(&fd)
  }

  pub fn len(&self) -> usize {
    self.map.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = (RawFd, &Client)> {
    self.map.iter().map(|(fd, c)| (*fd, c))
  }

  pub fn any_attached(&self) -> bool {
    self.map.values().any(|c| c.attached)
  }

  pub fn attached_fds(&self) -> Vec<RawFd> {
    self
      .map
      .iter()
      .filter(|(_, c)| c.attached)
      .map(|(fd, _)| *fd)
      .collect()
  }
}
