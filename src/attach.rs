//! The attaching client: puts the invoking terminal into raw mode and
//! bridges it to a session, keystrokes out as PUSH packets, program output
//! straight onto the screen.

use std::fs::File;
use std::io::{
  self,
  Read,
  Write,
};
use std::os::unix::io::{
  AsFd,
  FromRawFd,
};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{
  AtomicBool,
  AtomicUsize,
  Ordering,
};

use nix::errno::Errno;
use nix::libc;
use nix::poll::{
  PollFd,
  PollFlags,
  PollTimeout,
  poll,
};
use nix::pty::Winsize;
use nix::sys::signal::{
  self,
  SigHandler,
  Signal,
};
use nix::sys::termios::{
  self,
  ControlFlags,
  InputFlags,
  LocalFlags,
  OutputFlags,
  SetArg,
  SpecialCharacterIndices,
  Termios,
};
use signal_hook::consts::signal::{
  SIGHUP,
  SIGINT,
  SIGQUIT,
  SIGTERM,
  SIGWINCH,
};
use signal_hook::flag;
use tracing::debug;

use crate::cli::options::{
  ClearMethod,
  RedrawMethod,
};
use crate::protocol::{
  BUFSIZE,
  PAYLOAD_SIZE,
  Packet,
};
use crate::socket;

/// `_POSIX_VDISABLE` on the supported platforms.
const VDISABLE: u8 = 0;

pub struct AttachConfig {
  pub socket: PathBuf,
  /// Detach character; `None` disables detaching.
  pub escape: Option<u8>,
  pub no_suspend: bool,
  /// Redraw method announced to the master; `None` picks the session
  /// default.
  pub redraw: Option<RedrawMethod>,
  pub clear: ClearMethod,
  pub quiet: bool,
}

/// Restores the invoker's terminal on every exit path.
struct TermGuard {
  orig: Termios,
}

impl Drop for TermGuard {
  fn drop(&mut self) {
    let _ = termios::tcsetattr(io::stdin().as_fd(), SetArg::TCSADRAIN, &self.orig);
    // Make the cursor visible again. Assumes VT100.
    let mut out = io::stdout();
    let _ = out.write_all(b"\x1b[?25h");
    let _ = out.flush();
  }
}

/// Connect and attach. Connection failures come back as raw `io::Error` so
/// the attach-or-create flow can dispatch on the errno.
pub fn attach_main(cfg: &AttachConfig, orig: &Termios) -> io::Result<i32> {
  let sock = socket::connect(&cfg.socket)?;
  debug!("connected to {}", cfg.socket.display());
  run(sock, cfg, orig)
}

fn run(mut sock: UnixStream, cfg: &AttachConfig, orig: &Termios) -> io::Result<i32> {
  // Fatal signals funnel into one cell and are handled on the loop
  // thread; window size changes just set a flag.
  let die = Arc::new(AtomicUsize::new(0));
  for sig in [SIGHUP, SIGTERM, SIGINT, SIGQUIT] {
    let _ = flag::register_usize(sig, die.clone(), sig as usize);
  }
  let win_changed = Arc::new(AtomicBool::new(false));
  let _ = flag::register(SIGWINCH, win_changed.clone());
  unsafe {
    let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    let _ = signal::signal(Signal::SIGXFSZ, SigHandler::SigIgn);
  }

  // Unbuffered handles onto the terminal; the std stdin/stdout buffers
  // would sit between the user and the session.
  let mut tty_in = unsafe { File::from_raw_fd(libc::dup(0)) };
  let mut tty_out = unsafe { File::from_raw_fd(libc::dup(1)) };

  let cur = raw_mode(orig);
  termios::tcsetattr(io::stdin().as_fd(), SetArg::TCSADRAIN, &cur).map_err(io::Error::from)?;
  let _guard = TermGuard { orig: orig.clone() };

  // Clear the screen. This assumes VT100.
  tty_out.write_all(b"\x1b[H\x1b[J")?;

  // Tell the master we want to attach, and how to repaint.
  write_packet(&mut sock, &Packet::attach())?;
  write_packet(&mut sock, &Packet::redraw(cfg.redraw, &query_winsize()))?;

  let stdin = io::stdin();
  let mut buf = [0u8; BUFSIZE];
  loop {
    let sig = die.swap(0, Ordering::SeqCst);
    if sig != 0 {
      if sig == SIGHUP as usize || sig == SIGINT as usize {
        status(cfg, &mut tty_out, "[detached]");
      } else {
        status(cfg, &mut tty_out, &format!("[got signal {sig} - dying]"));
      }
      return Ok(1);
    }

    let (stdin_ready, sock_ready) = {
      let mut fds = [
        PollFd::new(stdin.as_fd(), PollFlags::POLLIN),
        PollFd::new(sock.as_fd(), PollFlags::POLLIN),
      ];
      match poll(&mut fds, PollTimeout::NONE) {
        Ok(_) => {
          let ready = |pfd: &PollFd| pfd.revents().is_some_and(|r| !r.is_empty());
          (ready(&fds[0]), ready(&fds[1]))
        }
        Err(Errno::EINTR | Errno::EAGAIN) => continue,
        Err(_) => {
          status(cfg, &mut tty_out, "[poll failed]");
          return Ok(1);
        }
      }
    };

    // Program output goes to the terminal first.
    if sock_ready {
      match sock.read(&mut buf) {
        Ok(0) => {
          status(cfg, &mut tty_out, "[EOF - session terminated]");
          return Ok(0);
        }
        Ok(n) => tty_out.write_all(&buf[..n])?,
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => (),
        Err(_) => {
          status(cfg, &mut tty_out, "[read returned an error]");
          return Ok(1);
        }
      }
    }

    if stdin_ready {
      let mut keys = [0u8; PAYLOAD_SIZE];
      let n = match tty_in.read(&mut keys) {
        Ok(0) | Err(_) => return Ok(1),
        Ok(n) => n,
      };
      if let Some(code) = process_kbd(
        &mut sock,
        cfg,
        &cur,
        orig,
        &keys[..n],
        &win_changed,
        &mut tty_out,
      )? {
        return Ok(code);
      }
    }

    if win_changed.swap(false, Ordering::SeqCst) {
      write_packet(&mut sock, &Packet::winch(&query_winsize()))?;
    }
  }
}

/// Handle one chunk of keyboard input. Returns an exit code once the
/// client should terminate.
fn process_kbd(
  sock: &mut UnixStream,
  cfg: &AttachConfig,
  cur: &Termios,
  orig: &Termios,
  keys: &[u8],
  win_changed: &AtomicBool,
  tty_out: &mut File,
) -> io::Result<Option<i32>> {
  let first = keys[0];

  // Suspend? Detach around the stop so the session keeps running and
  // other clients are unaffected.
  if !cfg.no_suspend && first == cur.control_chars[SpecialCharacterIndices::VSUSP as usize] {
    write_packet(sock, &Packet::detach())?;

    let _ = termios::tcsetattr(io::stdin().as_fd(), SetArg::TCSADRAIN, orig);
    let _ = tty_out.write_all(cfg.clear.prefix().as_bytes());
    let _ = signal::raise(Signal::SIGTSTP);
    let _ = termios::tcsetattr(io::stdin().as_fd(), SetArg::TCSADRAIN, cur);

    // Back from the stop: reattach and ask for a repaint.
    write_packet(sock, &Packet::attach())?;
    write_packet(sock, &Packet::redraw(cfg.redraw, &query_winsize()))?;
    return Ok(None);
  }

  // Detach char?
  if Some(first) == cfg.escape {
    status(cfg, tty_out, "[detached]");
    return Ok(Some(0));
  }

  // Just in case something pukes out.
  if first == b'\x0c' {
    win_changed.store(true, Ordering::SeqCst);
  }

  write_packet(sock, &Packet::push(keys))?;
  Ok(None)
}

fn raw_mode(orig: &Termios) -> Termios {
  let mut cur = orig.clone();
  cur.input_flags.remove(
    InputFlags::IGNBRK
      | InputFlags::BRKINT
      | InputFlags::PARMRK
      | InputFlags::ISTRIP
      | InputFlags::INLCR
      | InputFlags::IGNCR
      | InputFlags::ICRNL
      | InputFlags::IXON
      | InputFlags::IXOFF,
  );
  cur.output_flags.remove(OutputFlags::OPOST);
  cur.local_flags.remove(
    LocalFlags::ECHO
      | LocalFlags::ECHONL
      | LocalFlags::ICANON
      | LocalFlags::ISIG
      | LocalFlags::IEXTEN,
  );
  cur
    .control_flags
    .remove(ControlFlags::CSIZE | ControlFlags::PARENB);
  cur.control_flags.insert(ControlFlags::CS8);
  cur.control_chars[SpecialCharacterIndices::VLNEXT as usize] = VDISABLE;
  cur.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
  cur.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
  cur
}

fn status(cfg: &AttachConfig, tty_out: &mut File, msg: &str) {
  if cfg.quiet {
    return;
  }
  let _ = tty_out.write_all(format!("{}{}\r\n", cfg.clear.prefix(), msg).as_bytes());
}

fn query_winsize() -> Winsize {
  let mut ws = Winsize {
    ws_row: 0,
    ws_col: 0,
    ws_xpixel: 0,
    ws_ypixel: 0,
  };
  // Best effort; the master treats a zero size like any other.
  unsafe { libc::ioctl(0, libc::TIOCGWINSZ as _, &mut ws as *mut Winsize) };
  ws
}

fn write_packet(sock: &mut UnixStream, pkt: &Packet) -> io::Result<()> {
  sock.write_all(&pkt.encode())
}
