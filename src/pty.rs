//! Pty allocation and child process handling for the session master.
//!
//! The master side of the pair stays with the event loop; the slave side
//! becomes the child's controlling terminal. A cached copy of the slave
//! termios is refreshed after every read so the redraw logic can inspect the
//! program's current terminal mode without extra syscalls on the hot path.

use std::ffi::CString;
use std::io::{
  self,
  Read,
  Write,
};
use std::os::unix::io::{
  AsRawFd,
  BorrowedFd,
  FromRawFd,
  RawFd,
};
use std::ptr;

use cfg_if::cfg_if;
use color_eyre::eyre::{
  Result,
  bail,
};
use filedescriptor::FileDescriptor;
use nix::libc::{
  self,
  c_int,
};
use nix::pty::Winsize;
use nix::sys::signal::{
  self,
  Signal,
};
use nix::sys::termios::{
  self,
  Termios,
};
use nix::unistd::{
  self,
  ForkResult,
  Pid,
  fork,
};

pub struct PtyFd(pub FileDescriptor);

impl std::ops::Deref for PtyFd {
  type Target = FileDescriptor;
  fn deref(&self) -> &FileDescriptor {
    &self.0
  }
}

impl std::ops::DerefMut for PtyFd {
  fn deref_mut(&mut self) -> &mut FileDescriptor {
    &mut self.0
  }
}

impl Read for PtyFd {
  fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
    match self.0.read(buf) {
      Err(ref e) if e.raw_os_error() == Some(libc::EIO) => {
        // EIO indicates that the slave pty has been closed.
        // Treat it as EOF so the session winds down cleanly.
        Ok(0)
      }
      x => x,
    }
  }
}

/// Allocate a pty pair, optionally applying the invoker's terminal settings
/// to the slave side.
pub fn openpty(term: Option<&Termios>) -> Result<(FileDescriptor, FileDescriptor)> {
  let mut master: RawFd = -1;
  let mut slave: RawFd = -1;

  let termp = term.map(|t| libc::termios::from(t.clone()));

  let result = unsafe {
    libc::openpty(
      &mut master,
      &mut slave,
      ptr::null_mut(),
      termp
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::termios)
        .cast_mut(),
      ptr::null_mut(),
    )
  };

  if result != 0 {
    bail!("failed to openpty: {:?}", io::Error::last_os_error());
  }

  let master = unsafe { FileDescriptor::from_raw_fd(master) };
  let slave = unsafe { FileDescriptor::from_raw_fd(slave) };

  // Neither end may leak into the child's exec image; the child re-acquires
  // its stdio via dup2, which clears the flag on the copies.
  cloexec(master.as_raw_fd())?;
  cloexec(slave.as_raw_fd())?;

  Ok((master, slave))
}

/// Helper function to set the close-on-exec flag for a raw descriptor
fn cloexec(fd: RawFd) -> Result<()> {
  let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
  if flags == -1 {
    bail!(
      "fcntl to read flags failed: {:?}",
      io::Error::last_os_error()
    );
  }
  let result = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
  if result == -1 {
    bail!(
      "fcntl to set CLOEXEC failed: {:?}",
      io::Error::last_os_error()
    );
  }
  Ok(())
}

cfg_if! {
  if #[cfg(any(target_os = "solaris", target_os = "illumos"))] {
    /// Reading termios through the master is unreliable here; keep a
    /// separate handle on the slave side for those queries.
    fn termios_slave(master: &FileDescriptor) -> Option<PtyFd> {
      let name = unsafe { libc::ptsname(master.as_raw_fd()) };
      if name.is_null() {
        return None;
      }
      let fd = unsafe { libc::open(name, libc::O_RDWR | libc::O_NOCTTY) };
      (fd >= 0).then(|| PtyFd(unsafe { FileDescriptor::from_raw_fd(fd) }))
    }
  } else {
    fn termios_slave(_master: &FileDescriptor) -> Option<PtyFd> {
      None
    }
  }
}

/// The master end of the session pty, the child running on its slave side,
/// and the cached terminal state.
pub struct Pty {
  master: PtyFd,
  /// Populated only on platforms where termios must be read from the slave.
  aux_slave: Option<PtyFd>,
  child: Pid,
  term: Termios,
  ws: Winsize,
}

impl Pty {
  /// Fork a child running `argv` on a fresh pty slave. On exec failure the
  /// child reports to `status_fd` (or to the pty itself) and exits 127,
  /// which lets a foreground parent surface the message before detaching.
  pub fn spawn(argv: &[String], term: Option<&Termios>, status_fd: Option<RawFd>) -> Result<Self> {
    let mut args = Vec::with_capacity(argv.len());
    for arg in argv {
      args.push(CString::new(arg.as_str())?);
    }

    let (master, slave) = openpty(term)?;

    match unsafe { fork()? } {
      ForkResult::Child => {
        let master_fd = master.as_raw_fd();
        let slave_fd = slave.as_raw_fd();
        unsafe {
          // New session, with the slave as the controlling terminal.
          libc::setsid();
          libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0);

          libc::dup2(slave_fd, 0);
          libc::dup2(slave_fd, 1);
          libc::dup2(slave_fd, 2);
          if slave_fd > 2 {
            libc::close(slave_fd);
          }
          libc::close(master_fd);

          // Clear out any potentially problematic signal dispositions
          // that we might have inherited from the master.
          for signo in &[
            libc::SIGCHLD,
            libc::SIGHUP,
            libc::SIGINT,
            libc::SIGQUIT,
            libc::SIGTERM,
            libc::SIGALRM,
          ] {
            libc::signal(*signo, libc::SIG_DFL);
          }
          let empty_set: libc::sigset_t = std::mem::zeroed();
          libc::sigprocmask(libc::SIG_SETMASK, &empty_set, std::ptr::null_mut());
        }

        exec_or_report(&args, status_fd)
      }
      ForkResult::Parent { child } => {
        // The child owns the slave side now.
        drop(slave);
        let aux_slave = termios_slave(&master);

        let term = {
          let raw = aux_slave
            .as_ref()
            .map_or(master.as_raw_fd(), |s| s.as_raw_fd());
          termios::tcgetattr(unsafe { BorrowedFd::borrow_raw(raw) })?
        };

        Ok(Self {
          master: PtyFd(master),
          aux_slave,
          child,
          term,
          // The first attaching client sends the real window size.
          ws: Winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
          },
        })
      }
    }
  }

  pub fn child(&self) -> Pid {
    self.child
  }

  pub fn termios(&self) -> &Termios {
    &self.term
  }

  pub fn winsize(&self) -> Winsize {
    self.ws
  }

  pub fn master_fd(&self) -> BorrowedFd<'_> {
    unsafe { BorrowedFd::borrow_raw(self.master.as_raw_fd()) }
  }

  fn termios_fd(&self) -> BorrowedFd<'_> {
    let raw = self
      .aux_slave
      .as_ref()
      .map_or(self.master.as_raw_fd(), |s| s.as_raw_fd());
    unsafe { BorrowedFd::borrow_raw(raw) }
  }

  /// Read program output. `Ok(0)` means the session ended. After every
  /// successful read the cached termios is refreshed; losing access to it
  /// is fatal since the redraw gate depends on an accurate copy.
  pub fn read_output(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    let n = self.master.read(buf)?;
    if n > 0 {
      self.term = termios::tcgetattr(self.termios_fd()).map_err(io::Error::from)?;
    }
    Ok(n)
  }

  /// Push client keystrokes into the program.
  pub fn write_input(&mut self, bytes: &[u8]) -> io::Result<usize> {
    self.master.write(bytes)
  }

  pub fn set_winsize(&mut self, ws: Winsize) -> io::Result<()> {
    if unsafe {
      libc::ioctl(
        self.master.as_raw_fd(),
        libc::TIOCSWINSZ as _,
        &ws as *const Winsize,
      )
    } != 0
    {
      return Err(io::Error::last_os_error());
    }
    self.ws = ws;
    Ok(())
  }

  /// Deliver `sig` to whatever runs in the foreground of the pty: the
  /// pty-level signal ioctl where available, then the foreground process
  /// group, then the child's own group as a last resort.
  pub fn signal_foreground(&self, sig: Signal) {
    #[cfg(target_os = "linux")]
    if unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSIG as _, sig as c_int) } >= 0 {
      return;
    }

    if let Ok(pgrp) = unistd::tcgetpgrp(self.termios_fd())
      && pgrp.as_raw() != -1
      && signal::killpg(pgrp, sig).is_ok()
    {
      return;
    }

    let _ = signal::killpg(self.child, sig);
  }

  /// The child died. On platforms where the master fd does not reliably
  /// report EOF afterwards, force the event loop to notice.
  pub fn handle_child_exit(&self) {
    #[cfg(any(target_os = "solaris", target_os = "illumos"))]
    unsafe {
      libc::close(self.master.as_raw_fd());
    }
  }
}

fn exec_or_report(args: &[CString], status_fd: Option<RawFd>) -> ! {
  // execvp only returns on failure.
  let err = unistd::execvp(&args[0], args).unwrap_err();

  // Report the error to the status channel if we can, or to the pty
  // (parking the cursor first) if we can't.
  unsafe {
    if let Some(fd) = status_fd {
      libc::dup2(fd, 1);
    } else {
      let park = b"\x1b[999H\r\n";
      libc::write(1, park.as_ptr().cast(), park.len());
    }
    let msg = format!(
      "{}: could not execute {}: {}\r\n",
      env!("CARGO_PKG_NAME"),
      args[0].to_string_lossy(),
      err.desc()
    );
    libc::write(1, msg.as_ptr().cast(), msg.len());
    libc::_exit(127);
  }
}
