use std::path::PathBuf;

use color_eyre::eyre::Result;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
  self,
  Layer,
  filter::EnvFilter,
  layer::SubscriberExt,
  util::SubscriberInitExt,
};

pub fn get_data_dir() -> PathBuf {
  if let Some(dir) = std::env::var_os("RETACH_DATA") {
    return PathBuf::from(dir);
  }
  crate::cli::config::project_directory()
    .map_or_else(|| PathBuf::from(".data"), |d| d.data_local_dir().to_path_buf())
}

/// Set up tracing into a log file in the data directory. The session master
/// redirects its stdio to /dev/null, so a file is the only sink that stays
/// usable for the whole process lifetime.
pub fn initialize_logging() -> Result<()> {
  let directory = get_data_dir();
  std::fs::create_dir_all(&directory)?;
  let log_path = directory.join(concat!(env!("CARGO_PKG_NAME"), ".log"));
  let log_file = std::fs::File::create(log_path)?;
  let env_filter = EnvFilter::try_from_env("RETACH_LOGLEVEL")
    .or_else(|_| EnvFilter::try_from_default_env())
    .unwrap_or_else(|_| EnvFilter::new(concat!(env!("CARGO_CRATE_NAME"), "=info")));
  let file_subscriber = tracing_subscriber::fmt::layer()
    .with_file(true)
    .with_line_number(true)
    .with_writer(log_file)
    .with_target(false)
    .with_ansi(false)
    .with_filter(env_filter);
  tracing_subscriber::registry()
    .with(file_subscriber)
    .with(ErrorLayer::default())
    .init();
  Ok(())
}

pub fn initialize_panic_handler() {
  std::panic::set_hook(Box::new(|panic_info| {
    better_panic::Settings::auto()
      .most_recent_first(false)
      .lineno_suffix(true)
      .create_panic_handler()(panic_info);
    std::process::exit(1);
  }));
}
