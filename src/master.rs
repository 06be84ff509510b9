//! The session master: owns the pty, the control socket and the set of
//! connected clients.
//!
//! Everything runs on one thread as a readiness-driven loop. Within an
//! iteration new connects are handled before client input, and client input
//! before program output, so heavy output can never starve an attacher.
//! Signal handlers only set flags; the loop observes them after the
//! readiness wait returns EINTR.

use std::fs::File;
use std::io::{
  self,
  Read,
  Write,
};
use std::os::unix::io::{
  AsFd,
  AsRawFd,
  BorrowedFd,
  FromRawFd,
  OwnedFd,
  RawFd,
};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{
  AtomicBool,
  Ordering,
};

use color_eyre::eyre::{
  Context,
  Result,
};
use nix::errno::Errno;
use nix::fcntl::{
  self,
  OFlag,
};
use nix::libc;
use nix::poll::{
  PollFd,
  PollFlags,
  PollTimeout,
  poll,
};
use nix::sys::signal::{
  self,
  SigHandler,
  Signal,
};
use nix::sys::stat::Mode;
use nix::sys::termios::{
  LocalFlags,
  SpecialCharacterIndices,
  Termios,
};
use nix::sys::wait::{
  WaitPidFlag,
  WaitStatus,
  waitpid,
};
use nix::unistd::{
  self,
  ForkResult,
  fork,
};
use signal_hook::consts::signal::{
  SIGCHLD,
  SIGINT,
  SIGTERM,
};
use signal_hook::flag;
use tracing::{
  debug,
  info,
  warn,
};

use crate::cli::options::RedrawMethod;
use crate::master::clients::Clients;
use crate::protocol::{
  BUFSIZE,
  PAYLOAD_SIZE,
  Packet,
  PacketKind,
};
use crate::pty::Pty;
use crate::socket;

pub mod clients;

/// Everything a session needs to know, fixed at startup.
#[derive(Debug)]
pub struct SessionConfig {
  /// Full socket path; also the one used for stat/chmod/unlink even when
  /// the bind itself went through the shortened-path fallback.
  pub socket: PathBuf,
  pub argv: Vec<String>,
  /// Terminal settings of the invoker, absent when it had no terminal.
  pub term: Option<Termios>,
  /// Default redraw method for clients that don't request one.
  pub redraw: RedrawMethod,
  /// Hold off reading the pty until the first client has attached.
  pub wait_attach: bool,
  /// Do not fork into the background.
  pub foreground: bool,
}

enum LoopExit {
  /// The program closed its side of the pty.
  ChildEof,
  /// SIGINT/SIGTERM.
  Signal,
  /// Pty read failure, termios loss or a broken readiness wait.
  Fatal,
}

/// Start a session master. In foreground mode this call runs the whole
/// session and returns its exit code; otherwise it daemonizes and returns
/// once the daemon is known to have executed the program (or failed to).
pub fn master_main(cfg: &SessionConfig) -> Result<i32> {
  let listener = socket::create(&cfg.socket)
    .wrap_err_with(|| format!("could not create socket {}", cfg.socket.display()))?;
  info!("listening on {}", cfg.socket.display());

  if cfg.foreground {
    // A CLOEXEC duplicate of stderr lets the child report an exec failure
    // straight back to the invoker's terminal.
    let status = unsafe {
      let fd = libc::fcntl(2, libc::F_DUPFD_CLOEXEC, 0);
      (fd >= 0).then(|| OwnedFd::from_raw_fd(fd))
    };
    let code = master_process(&listener, cfg, status);
    let _ = std::fs::remove_file(&cfg.socket);
    return Ok(code);
  }

  let (status_rx, status_tx) =
    unistd::pipe2(OFlag::O_CLOEXEC).wrap_err("could not create the status pipe")?;

  let forked = match unsafe { fork() } {
    Ok(r) => r,
    Err(e) => {
      let _ = std::fs::remove_file(&cfg.socket);
      return Err(e).wrap_err("fork failed");
    }
  };

  match forked {
    ForkResult::Child => {
      drop(status_rx);
      let code = master_process(&listener, cfg, Some(status_tx));
      let _ = std::fs::remove_file(&cfg.socket);
      process::exit(code);
    }
    ForkResult::Parent { child } => {
      drop(status_tx);
      drop(listener);
      // Any bytes arriving on the status pipe mean the program could not
      // be executed: surface them and take the daemon down with us.
      let mut status_rx = File::from(status_rx);
      let mut buf = [0u8; 1024];
      let n = status_rx.read(&mut buf).unwrap_or(0);
      if n > 0 {
        let _ = io::stderr().write_all(&buf[..n]);
        let _ = signal::kill(child, Signal::SIGTERM);
        return Ok(1);
      }
      Ok(0)
    }
  }
}

/// The daemon body: spawn the program on a pty, wire up signals, detach
/// from the terminal and run the event loop until the session ends.
fn master_process(listener: &UnixListener, cfg: &SessionConfig, status: Option<OwnedFd>) -> i32 {
  // Disassociate from the original terminal; we don't care what happens to
  // it anymore. Fails when we already lead a session, which is fine.
  let _ = unistd::setsid();

  let sigchld = Arc::new(AtomicBool::new(false));
  let shutdown = Arc::new(AtomicBool::new(false));
  let _ = flag::register(SIGCHLD, sigchld.clone());
  let _ = flag::register(SIGINT, shutdown.clone());
  let _ = flag::register(SIGTERM, shutdown.clone());

  let mut pty = match Pty::spawn(
    &cfg.argv,
    cfg.term.as_ref(),
    status.as_ref().map(|s| s.as_raw_fd()),
  ) {
    Ok(pty) => pty,
    Err(e) => {
      report_setup_failure(status.as_ref(), &e);
      return 1;
    }
  };
  info!("session started: child {} runs {:?}", pty.child(), cfg.argv);

  for sig in [
    Signal::SIGPIPE,
    Signal::SIGXFSZ,
    Signal::SIGHUP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
  ] {
    unsafe {
      let _ = signal::signal(sig, SigHandler::SigIgn);
    }
  }

  // Only the child needs the exec failure channel from here on.
  drop(status);

  // We are a daemon now; stdin/stdout/stderr point at /dev/null.
  if let Ok(null) = fcntl::open("/dev/null", OFlag::O_RDWR, Mode::empty()) {
    let null_fd = null.as_raw_fd();
    unsafe {
      libc::dup2(null_fd, 0);
      libc::dup2(null_fd, 1);
      libc::dup2(null_fd, 2);
    }
  }

  let code = match event_loop(listener, &mut pty, cfg, &sigchld, &shutdown) {
    LoopExit::ChildEof => 0,
    LoopExit::Signal | LoopExit::Fatal => 1,
  };
  info!("session over, exiting with code {code}");
  code
}

fn report_setup_failure(status: Option<&OwnedFd>, err: &color_eyre::Report) {
  let msg = format!(
    "{}: could not start the session: {err}\n",
    env!("CARGO_PKG_NAME")
  );
  if let Some(fd) = status {
    let _ = unistd::write(fd, msg.as_bytes());
  } else {
    let _ = io::stdout().write_all(msg.as_bytes());
  }
}

struct Readiness {
  listener: bool,
  pty: bool,
  clients: Vec<RawFd>,
}

/// Block until the listener, the pty (when given) or any client has
/// activity. EOF and error conditions count as activity so the per-fd
/// handlers get to observe them.
fn wait_for_activity(
  listener: &UnixListener,
  pty: Option<BorrowedFd>,
  clients: &Clients,
) -> nix::Result<Readiness> {
  let mut fds = Vec::with_capacity(2 + clients.len());
  let mut tokens = Vec::with_capacity(clients.len());
  fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
  if let Some(fd) = pty {
    fds.push(PollFd::new(fd, PollFlags::POLLIN));
  }
  for (fd, client) in clients.iter() {
    tokens.push(fd);
    fds.push(PollFd::new(client.stream.as_fd(), PollFlags::POLLIN));
  }

  poll(&mut fds, PollTimeout::NONE)?;

  let ready = |pfd: &PollFd| pfd.revents().is_some_and(|r| !r.is_empty());
  let base = if pty.is_some() { 2 } else { 1 };
  Ok(Readiness {
    listener: ready(&fds[0]),
    pty: pty.is_some() && ready(&fds[1]),
    clients: tokens
      .iter()
      .enumerate()
      .filter(|(i, _)| ready(&fds[base + i]))
      .map(|(_, fd)| *fd)
      .collect(),
  })
}

fn event_loop(
  listener: &UnixListener,
  pty: &mut Pty,
  cfg: &SessionConfig,
  sigchld: &AtomicBool,
  shutdown: &AtomicBool,
) -> LoopExit {
  let mut clients = Clients::new();
  let mut wait_attach = cfg.wait_attach;
  let mut has_attached = false;
  let mut buf = [0u8; BUFSIZE];

  loop {
    if shutdown.swap(false, Ordering::SeqCst) {
      info!("shutdown signal received");
      return LoopExit::Signal;
    }
    if sigchld.swap(false, Ordering::SeqCst) {
      reap_child(pty);
    }

    // When created together with an attacher, hold off reading the pty
    // until that first client has attached.
    if wait_attach && clients.any_attached() {
      wait_attach = false;
    }

    let new_has_attached = clients.any_attached();
    if new_has_attached != has_attached {
      socket::update_modes(&cfg.socket, new_has_attached);
      has_attached = new_has_attached;
    }

    let readiness = {
      let pty_fd = (!wait_attach).then(|| pty.master_fd());
      match wait_for_activity(listener, pty_fd, &clients) {
        Ok(r) => r,
        Err(Errno::EINTR | Errno::EAGAIN) => continue,
        Err(e) => {
          warn!("readiness wait failed: {e}");
          return LoopExit::Fatal;
        }
      }
    };

    if readiness.listener {
      accept_client(listener, &mut clients);
    }
    for fd in readiness.clients {
      handle_client(fd, &mut clients, pty, cfg.redraw);
    }
    if readiness.pty
      && let Some(exit) = pump_pty(pty, &mut clients, listener, &mut buf)
    {
      return exit;
    }
  }
}

fn accept_client(listener: &UnixListener, clients: &mut Clients) {
  // Transient accept failures just wait for the next readiness cycle.
  let Ok((stream, _)) = listener.accept() else {
    return;
  };
  if stream.set_nonblocking(true).is_err() {
    return;
  }
  let fd = clients.insert(stream);
  debug!("client {fd} connected");
}

fn handle_client(fd: RawFd, clients: &mut Clients, pty: &mut Pty, default_redraw: RedrawMethod) {
  let Some(client) = clients.get_mut(fd) else {
    return;
  };
  match client.read_packet() {
    Ok(None) => (),
    Ok(Some(raw)) => {
      // Packets of an unknown type are ignored.
      if let Some(pkt) = Packet::decode(&raw) {
        dispatch_packet(&pkt, fd, clients, pty, default_redraw);
      }
    }
    Err(e) => {
      debug!("client {fd} disconnected: {e}");
      clients.remove(fd);
    }
  }
}

fn dispatch_packet(
  pkt: &Packet,
  fd: RawFd,
  clients: &mut Clients,
  pty: &mut Pty,
  default_redraw: RedrawMethod,
) {
  match pkt.kind {
    PacketKind::Push => {
      let len = pkt.len as usize;
      if len <= PAYLOAD_SIZE {
        let _ = pty.write_input(&pkt.payload[..len]);
      }
    }
    PacketKind::Attach => {
      if let Some(client) = clients.get_mut(fd) {
        debug!("client {fd} attached");
        client.attached = true;
      }
    }
    PacketKind::Detach => {
      if let Some(client) = clients.get_mut(fd) {
        debug!("client {fd} detached");
        client.attached = false;
      }
    }
    PacketKind::Winch => {
      // Window size change request, without a forced redraw.
      let _ = pty.set_winsize(pkt.winsize());
    }
    PacketKind::Redraw => {
      // A client that doesn't request a particular method gets the
      // session default.
      let method = match pkt.len {
        0 => default_redraw,
        v => RedrawMethod::from_repr(v).unwrap_or(RedrawMethod::None),
      };
      let _ = pty.set_winsize(pkt.winsize());
      match method {
        RedrawMethod::None => (),
        RedrawMethod::CtrlL => {
          if wants_form_feed(pty.termios()) {
            let _ = pty.write_input(b"\x0c");
          }
        }
        RedrawMethod::Winch => pty.signal_foreground(Signal::SIGWINCH),
      }
    }
  }
}

/// A ^L repaint only makes sense while the program runs the terminal
/// itself: no echo, character-at-a-time reads.
pub(crate) fn wants_form_feed(term: &Termios) -> bool {
  !term
    .local_flags
    .intersects(LocalFlags::ECHO | LocalFlags::ICANON)
    && term.control_chars[SpecialCharacterIndices::VMIN as usize] == 1
}

/// Drain one buffer of program output and broadcast it. Returns the loop
/// exit once the pty is done.
fn pump_pty(
  pty: &mut Pty,
  clients: &mut Clients,
  listener: &UnixListener,
  buf: &mut [u8],
) -> Option<LoopExit> {
  match pty.read_output(buf) {
    Ok(0) => {
      info!("program closed the pty");
      Some(LoopExit::ChildEof)
    }
    Ok(n) => {
      fan_out(&buf[..n], clients, listener);
      None
    }
    Err(e) => {
      warn!("pty read failed: {e}");
      Some(LoopExit::Fatal)
    }
  }
}

/// Wait until at least one attached client is writable. The listener is
/// watched too so a pending connect cuts the retry loop short.
fn wait_for_writable(listener: &UnixListener, clients: &Clients) -> nix::Result<(bool, Vec<RawFd>)> {
  let mut fds = vec![PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
  let mut tokens = Vec::new();
  for (fd, client) in clients.iter().filter(|(_, c)| c.attached) {
    tokens.push(fd);
    fds.push(PollFd::new(client.stream.as_fd(), PollFlags::POLLOUT));
  }

  poll(&mut fds, PollTimeout::NONE)?;

  let ready = |pfd: &PollFd| pfd.revents().is_some_and(|r| !r.is_empty());
  let listener_ready = ready(&fds[0]);
  let writable = tokens
    .iter()
    .enumerate()
    .filter(|(i, _)| ready(&fds[i + 1]))
    .map(|(_, fd)| *fd)
    .collect();
  Ok((listener_ready, writable))
}

/// Broadcast one pty read to every attached client. Partial writes advance
/// per client; a client that stays blocked past the retry window simply
/// misses these bytes, the next read overwrites the buffer. Slow clients
/// see torn output but never block the group.
fn fan_out(data: &[u8], clients: &mut Clients, listener: &UnixListener) {
  loop {
    if !clients.any_attached() {
      // Nobody is listening; the bytes are dropped.
      return;
    }
    let (listener_ready, writable) = match wait_for_writable(listener, clients) {
      Ok(r) => r,
      Err(_) => return,
    };

    let mut progress = 0i32;
    for fd in writable {
      let Some(client) = clients.get_mut(fd) else {
        continue;
      };
      let mut written = 0;
      while written < data.len() {
        match client.stream.write(&data[written..]) {
          Ok(0) => break,
          Ok(n) => written += n,
          Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
          Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
          Err(_) => {
            // Counts as progress; the read side will reap this client.
            progress = -1;
            break;
          }
        }
      }
      if progress != -1 && written == data.len() {
        progress += 1;
      }
    }

    // Try again if nothing happened at all.
    if listener_ready || progress != 0 {
      return;
    }
  }
}

/// The child died: collect it so it doesn't linger as a zombie while the
/// last of its output drains out of the pty.
fn reap_child(pty: &mut Pty) {
  match waitpid(pty.child(), Some(WaitPidFlag::WNOHANG)) {
    Ok(WaitStatus::Exited(pid, code)) => {
      info!("child {pid} exited with code {code}");
      pty.handle_child_exit();
    }
    Ok(WaitStatus::Signaled(pid, sig, _)) => {
      info!("child {pid} terminated by {sig}");
      pty.handle_child_exit();
    }
    Ok(status) => debug!("child changed state: {status:?}"),
    Err(e) => debug!("waitpid: {e}"),
  }
}

#[cfg(test)]
mod tests {
  use std::os::unix::net::UnixStream;

  use nix::sys::termios;

  use super::*;
  use crate::pty::openpty;

  fn default_winsize() -> nix::pty::Winsize {
    nix::pty::Winsize {
      ws_row: 0,
      ws_col: 0,
      ws_xpixel: 0,
      ws_ypixel: 0,
    }
  }

  #[test]
  fn form_feed_gate_follows_terminal_mode() {
    let (master, _slave) = openpty(None).unwrap();
    let mut term =
      termios::tcgetattr(unsafe { BorrowedFd::borrow_raw(master.as_raw_fd()) }).unwrap();

    // Fresh ptys are canonical with echo: no form feed.
    assert!(!wants_form_feed(&term));

    term
      .local_flags
      .remove(LocalFlags::ECHO | LocalFlags::ICANON);
    term.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    assert!(wants_form_feed(&term));

    term.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    assert!(!wants_form_feed(&term));

    term.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    term.local_flags.insert(LocalFlags::ECHO);
    assert!(!wants_form_feed(&term));
  }

  #[test]
  fn fan_out_reaches_only_attached_clients() {
    let dir = tempfile::tempdir().unwrap();
    let listener = socket::create(&dir.path().join("session")).unwrap();

    let mut clients = Clients::new();
    let (a, mut a_remote) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    let fd_a = clients.insert(a);
    clients.get_mut(fd_a).unwrap().attached = true;

    let (b, b_remote) = UnixStream::pair().unwrap();
    b.set_nonblocking(true).unwrap();
    clients.insert(b);

    fan_out(b"output", &mut clients, &listener);

    let mut got = [0u8; 6];
    a_remote.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"output");

    b_remote.set_nonblocking(true).unwrap();
    let mut sink = [0u8; 6];
    let err = (&b_remote).read(&mut sink).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
  }

  #[test]
  fn dispatch_drives_pty_and_attachment() {
    let mut pty = Pty::spawn(&["/bin/cat".into()], None, None).unwrap();
    let mut clients = Clients::new();
    let (stream, _remote) = UnixStream::pair().unwrap();
    let fd = clients.insert(stream);

    dispatch_packet(
      &Packet::attach(),
      fd,
      &mut clients,
      &mut pty,
      RedrawMethod::CtrlL,
    );
    assert!(clients.any_attached());

    dispatch_packet(
      &Packet::push(b"ok"),
      fd,
      &mut clients,
      &mut pty,
      RedrawMethod::CtrlL,
    );
    let mut buf = [0u8; 16];
    let n = pty.read_output(&mut buf).unwrap();
    assert!(buf[..n].starts_with(b"ok"));

    // A redraw against a canonical pty applies the size but writes no ^L.
    let ws = nix::pty::Winsize {
      ws_row: 30,
      ws_col: 90,
      ..default_winsize()
    };
    dispatch_packet(
      &Packet::redraw(Some(RedrawMethod::CtrlL), &ws),
      fd,
      &mut clients,
      &mut pty,
      RedrawMethod::CtrlL,
    );
    assert_eq!(pty.winsize().ws_col, 90);

    dispatch_packet(
      &Packet::detach(),
      fd,
      &mut clients,
      &mut pty,
      RedrawMethod::CtrlL,
    );
    assert!(!clients.any_attached());

    let _ = signal::kill(pty.child(), Signal::SIGKILL);
    let _ = waitpid(pty.child(), None);
  }

  #[test]
  fn oversized_push_is_discarded() {
    let mut pty = Pty::spawn(&["/bin/cat".into()], None, None).unwrap();
    let mut clients = Clients::new();
    let (stream, _remote) = UnixStream::pair().unwrap();
    let fd = clients.insert(stream);

    let mut pkt = Packet::push(b"zz");
    pkt.len = (PAYLOAD_SIZE + 1) as u8;
    dispatch_packet(&pkt, fd, &mut clients, &mut pty, RedrawMethod::CtrlL);

    // Nothing reached the pty: a valid push afterwards is echoed first.
    dispatch_packet(
      &Packet::push(b"ping"),
      fd,
      &mut clients,
      &mut pty,
      RedrawMethod::CtrlL,
    );
    let mut buf = [0u8; 16];
    let n = pty.read_output(&mut buf).unwrap();
    assert!(buf[..n].starts_with(b"ping"));

    let _ = signal::kill(pty.child(), Signal::SIGKILL);
    let _ = waitpid(pty.child(), None);
  }
}
