//! One-shot mode: copy standard input into a session as PUSH packets.

use std::io::{
  self,
  Read,
  Write,
};
use std::path::Path;

use nix::sys::signal::{
  self,
  SigHandler,
  Signal,
};

use crate::protocol::{
  PAYLOAD_SIZE,
  Packet,
};
use crate::socket;

pub fn push_main(sock_path: &Path) -> io::Result<i32> {
  let mut sock = socket::connect(sock_path)?;

  unsafe {
    let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
  }

  let mut stdin = io::stdin().lock();
  loop {
    let mut payload = [0u8; PAYLOAD_SIZE];
    let n = match stdin.read(&mut payload) {
      Ok(0) => return Ok(0),
      Ok(n) => n,
      Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
      Err(e) => return Err(e),
    };
    sock.write_all(&Packet::push(&payload[..n]).encode())?;
  }
}
