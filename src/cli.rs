use std::path::PathBuf;

use clap::{
  Args,
  Parser,
  Subcommand,
};

use self::{
  config::Config,
  options::{
    ClearMethod,
    RedrawMethod,
  },
};

pub mod config;
pub mod options;

/// Detach character used when none is configured: `^\`.
pub const DEFAULT_ESCAPE: u8 = b'\\' & 0x1f;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct Cli {
  #[arg(
    short = 'P',
    long,
    help = "Load profile from this path",
    conflicts_with = "no_profile"
  )]
  pub profile: Option<PathBuf>,
  #[arg(long, help = "Do not load profiles")]
  pub no_profile: bool,
  #[clap(subcommand)]
  pub cmd: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
  #[clap(about = "Attach to an existing session")]
  Attach {
    #[arg(help = "Path of the session socket")]
    socket: PathBuf,
    #[clap(flatten)]
    attach_args: AttachArgs,
  },
  #[clap(about = "Create a new session and attach to it")]
  Create {
    #[arg(help = "Path of the session socket")]
    socket: PathBuf,
    #[arg(last = true, required = true, help = "command to run in the session")]
    cmd: Vec<String>,
    #[arg(
      long,
      help = "Attach to the socket if it already has a live session instead of failing"
    )]
    reuse: bool,
    #[clap(flatten)]
    attach_args: AttachArgs,
  },
  #[clap(about = "Create a new session without attaching to it")]
  New {
    #[arg(help = "Path of the session socket")]
    socket: PathBuf,
    #[arg(last = true, required = true, help = "command to run in the session")]
    cmd: Vec<String>,
    #[arg(long, help = "Do not daemonize; keep the session master in the foreground")]
    foreground: bool,
    #[arg(short = 'r', long, help = "Default redraw method of the session")]
    redraw: Option<RedrawMethod>,
  },
  #[clap(about = "Copy standard input to an existing session")]
  Push {
    #[arg(help = "Path of the session socket")]
    socket: PathBuf,
  },
}

#[derive(Args, Debug, Default, Clone)]
pub struct AttachArgs {
  #[arg(
    short = 'e',
    long,
    help = "Detach character, e.g. '^a' or 'q'. Defaults to '^\\'",
    conflicts_with = "no_escape"
  )]
  pub escape: Option<String>,
  #[arg(short = 'E', long, help = "Disable the detach character")]
  pub no_escape: bool,
  #[arg(short = 'z', long, help = "Disable processing of the suspend key")]
  pub no_suspend: bool,
  #[arg(
    short = 'r',
    long,
    help = "Redraw method requested on attach; also the session default when creating"
  )]
  pub redraw: Option<RedrawMethod>,
  #[arg(short = 'R', long, help = "How status messages position the cursor")]
  pub clear: Option<ClearMethod>,
  #[arg(short = 'q', long, help = "Disable printing of additional messages")]
  pub quiet: bool,
}

impl AttachArgs {
  /// The detach character, or `None` when detaching is disabled.
  /// Errors on an empty `--escape` argument.
  pub fn escape_char(&self) -> Result<Option<u8>, String> {
    if self.no_escape {
      return Ok(None);
    }
    let Some(spec) = self.escape.as_deref() else {
      return Ok(Some(DEFAULT_ESCAPE));
    };
    parse_escape(spec)
      .map(Some)
      .ok_or_else(|| format!("invalid escape character {spec:?}"))
  }

  fn merge_config(&mut self, c: config::AttachConfig) {
    if self.escape.is_none() && !self.no_escape {
      self.escape = c.escape;
    }
    if !self.no_suspend {
      self.no_suspend = c.no_suspend.unwrap_or(false);
    }
    if self.redraw.is_none() {
      self.redraw = c.redraw;
    }
    if self.clear.is_none() {
      self.clear = c.clear;
    }
    if !self.quiet {
      self.quiet = c.quiet.unwrap_or(false);
    }
  }
}

/// Parse a detach character spec: `^?` is DEL, `^X` is Ctrl+X, anything else
/// is taken literally (first byte).
pub fn parse_escape(spec: &str) -> Option<u8> {
  let bytes = spec.as_bytes();
  match bytes {
    [] => None,
    [b'^', b'?', ..] => Some(0x7f),
    [b'^', c, ..] => Some(*c & 0x1f),
    [c, ..] => Some(*c),
  }
}

impl Cli {
  /// Fold profile values under anything set on the command line.
  pub fn merge_config(&mut self, config: Config) {
    tracing::debug!("Merging config: {config:?}");
    match &mut self.cmd {
      CliCommand::Attach { attach_args, .. } => {
        if let Some(c) = config.attach {
          attach_args.merge_config(c);
        }
      }
      CliCommand::Create { attach_args, .. } => {
        if let Some(c) = config.attach {
          attach_args.merge_config(c);
        }
        if let Some(c) = config.master
          && attach_args.redraw.is_none()
        {
          attach_args.redraw = c.redraw;
        }
      }
      CliCommand::New { redraw, .. } => {
        if let Some(c) = config.master
          && redraw.is_none()
        {
          *redraw = c.redraw;
        }
      }
      CliCommand::Push { .. } => (),
    }
  }
}

#[cfg(test)]
mod tests {
  use rstest::rstest;

  use super::*;
  use crate::cli::config::{
    AttachConfig,
    MasterConfig,
  };

  #[test]
  fn parse_attach() {
    let cli = Cli::parse_from(["retach", "attach", "/tmp/sess", "-E", "--quiet"]);
    if let CliCommand::Attach {
      socket,
      attach_args,
    } = cli.cmd
    {
      assert_eq!(socket, PathBuf::from("/tmp/sess"));
      assert!(attach_args.no_escape);
      assert!(attach_args.quiet);
      assert_eq!(attach_args.escape_char().unwrap(), None);
    } else {
      panic!("Expected Attach command");
    }
  }

  #[test]
  fn parse_create() {
    let cli = Cli::parse_from([
      "retach", "create", "/tmp/sess", "--reuse", "-r", "winch", "--", "bash", "-l",
    ]);
    if let CliCommand::Create {
      cmd,
      reuse,
      attach_args,
      ..
    } = cli.cmd
    {
      assert_eq!(cmd, vec!["bash", "-l"]);
      assert!(reuse);
      assert_eq!(attach_args.redraw, Some(RedrawMethod::Winch));
    } else {
      panic!("Expected Create command");
    }
  }

  #[test]
  fn parse_new_foreground() {
    let cli = Cli::parse_from(["retach", "new", "/tmp/sess", "--foreground", "--", "true"]);
    if let CliCommand::New {
      foreground,
      redraw,
      ..
    } = cli.cmd
    {
      assert!(foreground);
      assert_eq!(redraw, None);
    } else {
      panic!("Expected New command");
    }
  }

  #[rstest]
  #[case("^\\", b'\\' & 0x1f)]
  #[case("^?", 0x7f)]
  #[case("^a", b'a' & 0x1f)]
  #[case("q", b'q')]
  fn escape_char_spec(#[case] spec: &str, #[case] expected: u8) {
    assert_eq!(parse_escape(spec), Some(expected));
  }

  #[test]
  fn escape_char_empty_is_invalid() {
    assert_eq!(parse_escape(""), None);
  }

  #[test]
  fn escape_char_default() {
    let args = AttachArgs::default();
    assert_eq!(args.escape_char().unwrap(), Some(DEFAULT_ESCAPE));
  }

  #[test]
  fn merge_config_cli_wins() {
    let mut cli = Cli::parse_from(["retach", "attach", "/tmp/sess", "-e", "^b"]);
    cli.merge_config(Config {
      master: None,
      attach: Some(AttachConfig {
        escape: Some("^a".into()),
        no_suspend: Some(true),
        quiet: Some(true),
        ..Default::default()
      }),
    });
    if let CliCommand::Attach { attach_args, .. } = cli.cmd {
      assert_eq!(attach_args.escape.as_deref(), Some("^b"));
      assert!(attach_args.no_suspend);
      assert!(attach_args.quiet);
    } else {
      panic!("Expected Attach command");
    }
  }

  #[test]
  fn merge_config_fills_master_redraw() {
    let mut cli = Cli::parse_from(["retach", "new", "/tmp/sess", "--", "true"]);
    cli.merge_config(Config {
      master: Some(MasterConfig {
        redraw: Some(RedrawMethod::None),
      }),
      attach: None,
    });
    if let CliCommand::New { redraw, .. } = cli.cmd {
      assert_eq!(redraw, Some(RedrawMethod::None));
    } else {
      panic!("Expected New command");
    }
  }
}
