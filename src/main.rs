mod attach;
mod cli;
mod log;
mod master;
mod protocol;
mod pty;
mod push;
mod socket;

use std::io;
use std::os::unix::io::AsFd;
use std::path::{
  Path,
  PathBuf,
};
use std::process;

use clap::Parser;
use color_eyre::eyre::{
  OptionExt,
  Report,
  Result,
};
use nix::libc;
use nix::sys::termios::{
  self,
  Termios,
};
use tracing::debug;

use crate::attach::AttachConfig;
use crate::cli::config::{
  Config,
  ConfigLoadError,
};
use crate::cli::{
  AttachArgs,
  Cli,
  CliCommand,
};
use crate::log::{
  initialize_logging,
  initialize_panic_handler,
};
use crate::master::SessionConfig;

fn main() -> Result<()> {
  color_eyre::install()?;
  initialize_panic_handler();
  let mut cli = Cli::parse();
  initialize_logging()?;
  debug!("Commandline args: {:?}", cli);

  if !cli.no_profile {
    match Config::load(cli.profile.clone()) {
      Ok(config) => cli.merge_config(config),
      Err(ConfigLoadError::NotFound) => (),
      Err(e) => Err(e)?,
    }
  }

  // The invoking terminal's settings seed the session pty and are restored
  // when the attacher exits. Absent when we have no terminal.
  let orig_term = termios::tcgetattr(io::stdin().as_fd()).ok();

  match cli.cmd {
    CliCommand::Attach {
      socket,
      attach_args,
    } => {
      let orig = require_terminal(orig_term.as_ref())?;
      let cfg = attach_config(socket, &attach_args)?;
      let result = attach::attach_main(&cfg, orig);
      finish_attach(&cfg.socket, result)
    }
    CliCommand::Push { socket } => match push::push_main(&socket) {
      Ok(code) => process::exit(code),
      Err(e) => fail_socket(&socket, &e),
    },
    CliCommand::New {
      socket,
      cmd,
      foreground,
      redraw,
    } => {
      let cfg = SessionConfig {
        socket,
        argv: cmd,
        term: orig_term,
        redraw: redraw.unwrap_or_default(),
        wait_attach: false,
        foreground,
      };
      process::exit(master::master_main(&cfg)?)
    }
    CliCommand::Create {
      socket,
      cmd,
      reuse,
      attach_args,
    } => {
      let orig = require_terminal(orig_term.as_ref())?.clone();
      let acfg = attach_config(socket.clone(), &attach_args)?;
      let mcfg = SessionConfig {
        socket: socket.clone(),
        argv: cmd,
        term: Some(orig.clone()),
        redraw: attach_args.redraw.unwrap_or_default(),
        wait_attach: true,
        foreground: false,
      };

      if reuse {
        // Attach first; only create the session when the socket is
        // missing, or stale enough to be thrown away.
        match attach::attach_main(&acfg, &orig) {
          Ok(code) => process::exit(code),
          Err(e) => match e.raw_os_error() {
            Some(libc::ECONNREFUSED) => {
              let _ = std::fs::remove_file(&socket);
            }
            Some(libc::ENOENT) => (),
            _ => fail_socket(&socket, &e),
          },
        }
      }

      if master::master_main(&mcfg)? != 0 {
        process::exit(1);
      }
      finish_attach(&socket, attach::attach_main(&acfg, &orig))
    }
  }
}

fn require_terminal(orig: Option<&Termios>) -> Result<&Termios> {
  orig.ok_or_eyre("attaching to a session requires a terminal")
}

fn attach_config(socket: PathBuf, args: &AttachArgs) -> Result<AttachConfig> {
  Ok(AttachConfig {
    socket,
    escape: args.escape_char().map_err(Report::msg)?,
    no_suspend: args.no_suspend,
    redraw: args.redraw,
    clear: args.clear.unwrap_or_default(),
    quiet: args.quiet,
  })
}

fn finish_attach(socket: &Path, result: io::Result<i32>) -> ! {
  match result {
    Ok(code) => process::exit(code),
    Err(e) => fail_socket(socket, &e),
  }
}

fn fail_socket(socket: &Path, e: &io::Error) -> ! {
  eprintln!("{}: {}: {e}", env!("CARGO_PKG_NAME"), socket.display());
  process::exit(1)
}
