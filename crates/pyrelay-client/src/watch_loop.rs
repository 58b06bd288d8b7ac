use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use pyrelay_core::config::WatchConfig;
use pyrelay_watch::{default_process_source, DirectoryScanner, ProcessScanner, UploadCooldown};
use tokio_util::sync::CancellationToken;

use crate::client::DispatchClient;

/// Upper bound on one uninterrupted sleep, so cancellation is noticed quickly.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub pattern: String,
    pub interval: Duration,
    pub debounce: Duration,
    pub upload_cooldown: Duration,
    /// Also follow interpreter launches on watched files.
    pub detect_runs: bool,
}

impl From<&WatchConfig> for WatchOptions {
    fn from(config: &WatchConfig) -> Self {
        Self {
            pattern: config.pattern.clone(),
            interval: config.interval(),
            debounce: config.debounce(),
            upload_cooldown: config.upload_cooldown(),
            detect_runs: true,
        }
    }
}

/// Watch `root` until `cancel` fires. New and modified files are uploaded
/// for analysis; scripts launched under `root` are analyzed and executed.
///
/// Blocks the calling thread. Returns an error only if `root` cannot be
/// watched at all.
pub fn watch_directory(
    client: Arc<DispatchClient>,
    root: &Path,
    options: WatchOptions,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut scanner = DirectoryScanner::new(root, &options.pattern)?.with_debounce(options.debounce);
    scanner.prime();
    let root = scanner.root().to_path_buf();
    println!("watching {} ({} files)", root.display(), scanner.tracked());

    let runs = options.detect_runs.then(|| {
        let client = Arc::clone(&client);
        let root = root.clone();
        let suffix = suffix_of(&options.pattern);
        let interval = options.interval;
        let cancel = cancel.clone();
        std::thread::spawn(move || watch_runs(client, root, suffix, interval, cancel))
    });

    let mut cooldown = UploadCooldown::new(options.upload_cooldown);
    while !cancel.is_cancelled() {
        for event in scanner.scan() {
            if !cooldown.admit(&event.path, Instant::now()) {
                tracing::debug!(path = %event.path.display(), "upload suppressed by cooldown");
                continue;
            }
            println!("{} changed ({})", event.path.display(), event.trigger);
            client.upload_file(&event.path, event.trigger);
        }
        sleep_unless_cancelled(options.interval, &cancel);
    }

    if let Some(handle) = runs {
        if handle.join().is_err() {
            tracing::warn!("run detection thread panicked");
        }
    }
    Ok(())
}

fn watch_runs(
    client: Arc<DispatchClient>,
    root: PathBuf,
    suffix: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut source = default_process_source();
    let mut scanner = ProcessScanner::new(&root, &suffix);
    while !cancel.is_cancelled() {
        match source.processes() {
            Ok(processes) => {
                for event in scanner.scan(&processes, SystemTime::now()) {
                    println!("detected run of {} (pid {})", event.path.display(), event.pid);
                    let client_ref = Arc::clone(&client);
                    client.spawn_background(move || {
                        client_ref.run_file(&event.path);
                    });
                }
                scanner.end_tick();
            }
            Err(e) => tracing::debug!(error = %e, "process enumeration failed"),
        }
        sleep_unless_cancelled(interval, &cancel);
    }
}

/// `*.py` -> `.py`. Patterns without a leading wildcard are used as-is.
fn suffix_of(pattern: &str) -> String {
    pattern.trim_start_matches('*').to_string()
}

fn sleep_unless_cancelled(total: Duration, cancel: &CancellationToken) {
    let deadline = Instant::now() + total;
    while !cancel.is_cancelled() {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return;
        }
        std::thread::sleep(left.min(SLEEP_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_from_glob() {
        assert_eq!(suffix_of("*.py"), ".py");
        assert_eq!(suffix_of("main.py"), "main.py");
    }

    #[test]
    fn options_follow_config() {
        let opts = WatchOptions::from(&WatchConfig {
            interval_ms: 50,
            ..WatchConfig::default()
        });
        assert_eq!(opts.interval, Duration::from_millis(50));
        assert_eq!(opts.pattern, "*.py");
        assert!(opts.detect_runs);
    }

    #[test]
    fn sleep_returns_early_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = Instant::now();
        sleep_unless_cancelled(Duration::from_secs(5), &cancel);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn missing_root_is_an_error() {
        let client = Arc::new(DispatchClient::new(&Default::default()));
        let tmp = tempfile::tempdir().unwrap();
        let err = watch_directory(
            client,
            &tmp.path().join("gone"),
            WatchOptions::from(&WatchConfig::default()),
            CancellationToken::new(),
        );
        assert!(err.is_err());
    }
}
