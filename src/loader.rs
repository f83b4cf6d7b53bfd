use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tokio::sync::Notify;

use crate::config::Config;
use crate::environment::Environment;

const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStat {
    size: u64,
    modified: SystemTime,
}

fn stat(path: &Path) -> std::io::Result<FileStat> {
    let meta = std::fs::metadata(path)?;
    Ok(FileStat {
        size: meta.len(),
        modified: meta.modified()?,
    })
}

/// Load `path`, validate it, and publish it on a fresh `Environment`. Fatal
/// on any failure: the caller is expected to abort startup.
pub fn load_initial(path: &Path) -> Result<Environment> {
    let (config, unknown) = read_and_parse(path)?;
    let env = Environment::new(config).with_prefix("config ");
    warn_unknown_fields(&env, &unknown);
    Ok(env)
}

fn read_and_parse(path: &Path) -> Result<(Config, Vec<String>)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file: {}", path.display()))?;
    Config::from_toml_str(&raw)
        .with_context(|| format!("failed to load configuration: {}", path.display()))
}

fn warn_unknown_fields(env: &Environment, unknown: &[String]) {
    if !unknown.is_empty() {
        env.warn(format!("config file has unknown fields: {unknown:?}"));
    }
}

/// A background poller that re-reads the config file whenever its size or
/// mtime changes, publishing a validated replacement atomically. Parse or
/// validation failures are logged at Warn and leave the prior snapshot in
/// force. `stop()` cancels the poll loop cleanly.
pub struct ConfigWatcher {
    cancel: Arc<Notify>,
}

impl ConfigWatcher {
    /// Spawn the poller. `path`'s initial stat must already have succeeded
    /// (via `load_initial`) before this is called.
    pub fn spawn(env: Environment, path: PathBuf, poll_period: Duration) -> Result<Self> {
        let mut last_stat = stat(&path).with_context(|| {
            format!("failed to stat configuration file: {}", path.display())
        })?;
        let cancel = Arc::new(Notify::new());
        let task_cancel = Arc::clone(&cancel);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.notified() => return,
                    _ = tokio::time::sleep(poll_period) => {}
                }

                env.debug("polling for changes");
                match stat(&path) {
                    Ok(current) if current != last_stat => {
                        env.info(format!(
                            "detected changes in config file `{}`, reloading",
                            path.display()
                        ));
                        match read_and_parse(&path) {
                            Ok((config, unknown)) => {
                                warn_unknown_fields(&env, &unknown);
                                env.set_config(config);
                            }
                            Err(err) => env.warn(format!("cannot load config file: {err:#}")),
                        }
                        last_stat = current;
                    }
                    Ok(current) => last_stat = current,
                    Err(err) => env.warn(format!("cannot stat config file: {err}")),
                }
            }
        });

        Ok(Self { cancel })
    }

    pub fn spawn_default(env: Environment, path: PathBuf) -> Result<Self> {
        Self::spawn(env, path, DEFAULT_POLL_PERIOD)
    }

    pub fn stop(&self) {
        self.cancel.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration as StdDuration;

    fn write_toml(path: &Path, connect_timeout_millis: u64) {
        let mut f = std::fs::File::create(path).unwrap();
        write!(
            f,
            r#"
ConnectTimeoutMillis = {connect_timeout_millis}

[[Rules]]
Proxy = ""
Patterns = [".a.test"]
"#
        )
        .unwrap();
    }

    #[test]
    fn load_initial_reads_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.toml");
        write_toml(&path, 1234);

        let env = load_initial(&path).unwrap();
        assert_eq!(env.config().connect_timeout_millis, 1234);
    }

    #[test]
    fn load_initial_fails_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(load_initial(&path).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_reloads_on_change_and_leaves_prior_on_bad_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.toml");
        write_toml(&path, 1000);

        let env = load_initial(&path).unwrap();
        let watcher =
            ConfigWatcher::spawn(env.with_prefix("config "), path.clone(), StdDuration::from_millis(10))
                .unwrap();

        tokio::time::sleep(StdDuration::from_millis(5)).await;
        write_toml(&path, 2000);
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        assert_eq!(env.config().connect_timeout_millis, 2000);

        // now make the file invalid; the previous good snapshot must remain.
        std::fs::write(&path, "not valid toml {{{").unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(env.config().connect_timeout_millis, 2000);

        watcher.stop();
    }
}
