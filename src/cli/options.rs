use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use strum::{Display, FromRepr};

/// How an attaching client asks the program to repaint its screen.
///
/// The discriminants are the on-wire values carried in the length byte of a
/// REDRAW packet; 0 is reserved for "unspecified, use the session default".
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Display, FromRepr, Deserialize, Serialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum RedrawMethod {
  /// Don't redraw at all.
  None = 1,
  /// Send a Ctrl+L character to the program.
  #[default]
  CtrlL = 2,
  /// Send a WINCH signal to the program.
  Winch = 3,
}

/// How client status messages position the cursor before printing.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Display, Deserialize, Serialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ClearMethod {
  /// Move to the last line first. Assumes VT100.
  #[default]
  Move,
  /// Don't clear at all.
  None,
}

impl ClearMethod {
  /// Prefix written before every status message.
  pub fn prefix(self) -> &'static str {
    match self {
      Self::Move => "\x1b[999H\r\n",
      Self::None => "\r\n",
    }
  }
}
