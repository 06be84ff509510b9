use std::{
  io,
  path::PathBuf,
};

use directories::ProjectDirs;
use serde::{
  Deserialize,
  Serialize,
};
use snafu::{
  ResultExt,
  Snafu,
};
use tracing::warn;

use super::options::{
  ClearMethod,
  RedrawMethod,
};

/// Optional profile loaded from `config.toml`. Every value acts as a
/// default; options given on the command line win.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Config {
  pub master: Option<MasterConfig>,
  pub attach: Option<AttachConfig>,
}

#[derive(Debug, Snafu)]
pub enum ConfigLoadError {
  #[snafu(display("Config file not found."))]
  NotFound,
  #[snafu(display("Failed to load config file."))]
  IoError { source: io::Error },
  #[snafu(display("Failed to parse config file."))]
  TomlError { source: toml::de::Error },
}

impl Config {
  pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigLoadError> {
    let config_text = match path {
      // A manually specified profile that doesn't exist is a hard error.
      Some(path) => std::fs::read_to_string(path).context(IoSnafu)?,
      None => {
        let Some(project_dirs) = project_directory() else {
          warn!("No valid home directory found! Not loading config.toml.");
          return Err(ConfigLoadError::NotFound);
        };
        // ~/.config/retach/config.toml
        let config_path = project_dirs.config_dir().join("config.toml");

        std::fs::read_to_string(config_path).map_err(|e| match e.kind() {
          io::ErrorKind::NotFound => ConfigLoadError::NotFound,
          _ => ConfigLoadError::IoError { source: e },
        })?
      }
    };

    let config: Self = toml::from_str(&config_text).context(TomlSnafu)?;
    Ok(config)
  }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct MasterConfig {
  /// Default redraw method of new sessions.
  pub redraw: Option<RedrawMethod>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct AttachConfig {
  /// Detach character, in the same syntax as `--escape`.
  pub escape: Option<String>,
  pub no_suspend: Option<bool>,
  pub redraw: Option<RedrawMethod>,
  pub clear: Option<ClearMethod>,
  pub quiet: Option<bool>,
}

pub fn project_directory() -> Option<ProjectDirs> {
  ProjectDirs::from("", "", env!("CARGO_PKG_NAME"))
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;

  use super::*;

  #[test]
  fn config_load_invalid_path() {
    let path = Some(PathBuf::from("/non/existent/config.toml"));
    let result = Config::load(path);
    assert!(matches!(
      result,
      Err(ConfigLoadError::IoError { .. }) | Err(ConfigLoadError::NotFound)
    ));
  }

  #[test]
  fn master_config_roundtrip() {
    let cfg: MasterConfig = toml::from_str(r#"redraw = "winch""#).unwrap();
    assert_eq!(cfg.redraw, Some(RedrawMethod::Winch));
  }

  #[test]
  fn attach_config_roundtrip() {
    let toml_str = r#"
escape = "^a"
no_suspend = true
clear = "none"
quiet = false
"#;
    let cfg: AttachConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(cfg.escape.as_deref(), Some("^a"));
    assert_eq!(cfg.no_suspend, Some(true));
    assert_eq!(cfg.clear, Some(ClearMethod::None));
    assert_eq!(cfg.quiet, Some(false));
    assert_eq!(cfg.redraw, None);
  }

  #[test]
  fn empty_config_parses() {
    let cfg: Config = toml::from_str("").unwrap();
    assert!(cfg.master.is_none());
    assert!(cfg.attach.is_none());
  }
}
