use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

const LOG_FILE_NAME: &str = "setup.log";

pub fn logs_dir(state: &Path) -> PathBuf {
    state.join("logs")
}

/// Appends to `<state>/logs/setup.log` at `level` and mirrors warnings to
/// stderr. A second call keeps the first subscriber.
pub fn init(state: &Path, level: &str) -> Result<PathBuf> {
    let dir = logs_dir(state);
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let log_path = dir.join(LOG_FILE_NAME);
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("open {}", log_path.display()))?;

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(filter);
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::WARN);

    let _ = tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init();
    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = init(tmp.path(), "debug").unwrap();
        assert!(log_path.exists());
        assert_eq!(log_path, logs_dir(tmp.path()).join(LOG_FILE_NAME));
        // unparsable levels fall back instead of failing
        init(tmp.path(), "not a [level").unwrap();
    }
}
