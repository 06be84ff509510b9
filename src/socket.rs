//! The control socket: a stream socket bound in the filesystem namespace.
//!
//! Paths longer than the platform's `sun_path` are handled by briefly
//! working from inside the socket's directory, on both the bind and the
//! connect side. The recorded session path stays the full one; only the
//! address handed to the kernel is shortened.

use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{
  UnixListener,
  UnixStream,
};
use std::path::Path;

use nix::libc;
use nix::sys::stat::{
  self,
  Mode,
};

fn sun_path_max() -> usize {
  let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
  std::mem::size_of_val(&addr.sun_path) - 1
}

/// Run `f` on a socket address that fits in `sun_path`, chdir'ing into the
/// socket's directory when the full path is too long.
fn with_shortened_path<T>(path: &Path, f: &dyn Fn(&Path) -> io::Result<T>) -> io::Result<T> {
  if path.as_os_str().as_bytes().len() <= sun_path_max() {
    return f(path);
  }

  let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
  let (Some(parent), Some(name)) = (parent, path.file_name()) else {
    return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
  };

  let saved = std::env::current_dir()?;
  std::env::set_current_dir(parent)?;
  let result = f(Path::new(name));
  let _ = std::env::set_current_dir(saved);
  result
}

/// Bind the control socket with permissions 0600, non-blocking.
pub fn create(path: &Path) -> io::Result<UnixListener> {
  with_shortened_path(path, &|p| {
    // Permissions are pinned down twice: umask covers the bind itself,
    // the chmod afterwards prevents any surprises.
    let omask = stat::umask(Mode::from_bits_truncate(0o077));
    let bound = UnixListener::bind(p);
    stat::umask(omask);
    // bind + listen with a backlog of 128.
    let listener = bound?;
    listener.set_nonblocking(true)?;
    fs::set_permissions(p, fs::Permissions::from_mode(0o600))?;
    Ok(listener)
  })
}

/// Connect to the control socket of an existing session.
pub fn connect(path: &Path) -> io::Result<UnixStream> {
  with_shortened_path(path, &|p| match UnixStream::connect(p) {
    Err(e) if e.raw_os_error() == Some(libc::ECONNREFUSED) => {
      // ECONNREFUSED is also returned for regular files, so make sure we
      // are actually talking to a socket.
      let st = stat::stat(p).map_err(io::Error::from)?;
      if st.st_mode as u32 & libc::S_IFMT as u32 != libc::S_IFSOCK as u32 {
        return Err(io::Error::from_raw_os_error(libc::ENOTSOCK));
      }
      Err(e)
    }
    r => r,
  })
}

/// While at least one client is attached the socket file carries S_IXUSR;
/// outside observers can stat the socket to tell whether a session has a
/// live attacher. Best effort.
pub fn update_modes(path: &Path, has_attached: bool) {
  let Ok(st) = stat::stat(path) else {
    return;
  };

  let mode = st.st_mode as u32 & 0o7777;
  let newmode = if has_attached {
    mode | 0o100
  } else {
    mode & !0o100
  };

  if mode != newmode {
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(newmode));
  }
}

#[cfg(test)]
mod tests {
  use std::io::ErrorKind;

  use serial_test::serial;

  use super::*;

  #[test]
  fn create_sets_mode_and_nonblocking() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session");
    let listener = create(&path).unwrap();

    let st = stat::stat(&path).unwrap();
    assert_eq!(st.st_mode as u32 & 0o777, 0o600);

    // Non-blocking accept on an idle listener must not hang.
    let err = listener.accept().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WouldBlock);
  }

  #[test]
  fn exec_bit_toggles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session");
    let _listener = create(&path).unwrap();

    assert_eq!(stat::stat(&path).unwrap().st_mode as u32 & 0o100, 0);
    update_modes(&path, true);
    assert_eq!(stat::stat(&path).unwrap().st_mode as u32 & 0o100, 0o100);
    update_modes(&path, false);
    assert_eq!(stat::stat(&path).unwrap().st_mode as u32 & 0o100, 0);
  }

  #[test]
  fn connect_to_regular_file_is_not_a_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not-a-socket");
    fs::write(&path, b"").unwrap();

    let err = connect(&path).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOTSOCK));
  }

  #[test]
  #[serial]
  fn long_path_binds_via_directory() {
    let dir = tempfile::tempdir().unwrap();
    let mut long = dir.path().to_path_buf();
    while long.as_os_str().len() <= sun_path_max() {
      long.push("padding-path-component");
      fs::create_dir(&long).unwrap();
    }
    let path = long.join("session");
    assert!(path.as_os_str().len() > sun_path_max());

    let listener = create(&path).unwrap();
    assert!(path.exists());

    let stream = connect(&path).unwrap();
    drop(stream);
    drop(listener);
  }
}
