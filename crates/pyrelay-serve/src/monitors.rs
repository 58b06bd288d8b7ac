use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use pyrelay_core::config::WatchConfig;
use pyrelay_core::Trigger;
use pyrelay_watch::{DirectoryScanner, UploadCooldown};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// A client registered through `/api/vscode/connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorInfo {
    pub user_id: String,
    pub project_path: Option<PathBuf>,
    pub auto_upload: bool,
    /// A server-side watch task is running for `project_path`.
    pub watching: bool,
}

struct Monitor {
    info: MonitorInfo,
    /// Cancelled on disconnect, and by the watch task when it ends.
    cancel: CancellationToken,
    last_seen: OffsetDateTime,
}

#[derive(Default)]
pub struct MonitorRegistry {
    monitors: Mutex<Vec<Monitor>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Monitor>> {
        self.monitors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a registration, replacing any existing one for the same user and path.
    pub fn register(&self, info: MonitorInfo, cancel: CancellationToken, now: OffsetDateTime) {
        let mut monitors = self.lock();
        monitors.retain(|m| {
            let same = m.info.user_id == info.user_id && m.info.project_path == info.project_path;
            if same {
                m.cancel.cancel();
            }
            !same
        });
        monitors.push(Monitor {
            info,
            cancel,
            last_seen: now,
        });
    }

    /// Record activity from `user_id`.
    pub fn touch(&self, user_id: &str, now: OffsetDateTime) {
        for m in self.lock().iter_mut().filter(|m| m.info.user_id == user_id) {
            m.last_seen = now;
        }
    }

    /// Drop registrations whose watch task has ended, and those not seen
    /// within `idle`. Returns how many were removed.
    pub fn sweep(&self, now: OffsetDateTime, idle: Duration) -> usize {
        let cutoff = now - idle;
        let mut monitors = self.lock();
        let before = monitors.len();
        monitors.retain(|m| {
            let stale = m.last_seen < cutoff;
            let ended = m.cancel.is_cancelled();
            if stale {
                m.cancel.cancel();
            }
            !(stale || ended)
        });
        before - monitors.len()
    }

    /// Cancel and drop the user's registrations: all of them, or only the
    /// one for `project_path`. Returns how many were removed.
    pub fn remove(&self, user_id: &str, project_path: Option<&Path>) -> usize {
        let mut monitors = self.lock();
        let before = monitors.len();
        monitors.retain(|m| {
            let matches = m.info.user_id == user_id
                && project_path.map_or(true, |p| m.info.project_path.as_deref() == Some(p));
            if matches {
                m.cancel.cancel();
            }
            !matches
        });
        before - monitors.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn list(&self) -> Vec<MonitorInfo> {
        self.lock().iter().map(|m| m.info.clone()).collect()
    }
}

/// A file picked up by a server-side watch.
#[derive(Debug, Clone)]
pub struct DetectedFile {
    pub path: PathBuf,
    /// Path relative to the watched root.
    pub filename: String,
    pub code: String,
    pub trigger: Trigger,
}

/// Poll `root` until `cancel` fires or `root` disappears, handing each new
/// or modified file that passes the upload cooldown to `submit`. Files
/// present at start are not reported.
pub async fn watch_project<F>(
    root: PathBuf,
    settings: WatchConfig,
    cancel: CancellationToken,
    submit: F,
) where
    F: Fn(DetectedFile) + Send,
{
    let scanner = match DirectoryScanner::new(&root, &settings.pattern) {
        Ok(s) => s.with_debounce(settings.debounce()),
        Err(e) => {
            tracing::warn!(root = %root.display(), error = %e, "cannot watch project");
            return;
        }
    };
    let mut state = Some((scanner, UploadCooldown::new(settings.upload_cooldown())));
    let mut first = true;
    let mut ticker = tokio::time::interval(settings.interval());
    tracing::info!(root = %root.display(), "watching project");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some((mut scanner, mut cooldown)) = state.take() else {
            break;
        };
        let prime = std::mem::take(&mut first);
        // Directory walks and file reads are blocking.
        let joined = tokio::task::spawn_blocking(move || {
            if !scanner.root().is_dir() {
                return None;
            }
            if prime {
                scanner.prime();
                return Some((scanner, cooldown, Vec::new()));
            }
            let found = collect(&mut scanner, &mut cooldown);
            Some((scanner, cooldown, found))
        })
        .await;
        let (scanner, cooldown, found) = match joined {
            Ok(Some(v)) => v,
            Ok(None) => {
                tracing::info!(root = %root.display(), "project directory is gone");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "project scan panicked; stopping watch");
                break;
            }
        };
        state = Some((scanner, cooldown));
        for file in found {
            tracing::debug!(path = %file.path.display(), trigger = %file.trigger, "project file changed");
            submit(file);
        }
    }
    tracing::info!(root = %root.display(), "stopped watching project");
}

fn collect(scanner: &mut DirectoryScanner, cooldown: &mut UploadCooldown) -> Vec<DetectedFile> {
    let mut out = Vec::new();
    for event in scanner.scan() {
        if !cooldown.admit(&event.path, Instant::now()) {
            continue;
        }
        let bytes = match std::fs::read(&event.path) {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(path = %event.path.display(), error = %e, "skipping unreadable file");
                continue;
            }
        };
        let code = String::from_utf8_lossy(&bytes).into_owned();
        if code.trim().is_empty() {
            continue;
        }
        let filename = event
            .path
            .strip_prefix(scanner.root())
            .unwrap_or(&event.path)
            .display()
            .to_string();
        out.push(DetectedFile {
            path: event.path,
            filename,
            code,
            trigger: event.trigger,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn info(user: &str, path: Option<&str>) -> MonitorInfo {
        MonitorInfo {
            user_id: user.into(),
            project_path: path.map(PathBuf::from),
            auto_upload: false,
            watching: false,
        }
    }

    #[test]
    fn remove_all_or_by_path() {
        let reg = MonitorRegistry::new();
        let now = OffsetDateTime::now_utc();
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let c = CancellationToken::new();
        reg.register(info("u1", Some("/p/a")), a.clone(), now);
        reg.register(info("u1", Some("/p/b")), b.clone(), now);
        reg.register(info("u2", Some("/p/a")), c.clone(), now);

        assert_eq!(reg.remove("u1", Some(Path::new("/p/a"))), 1);
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());

        assert_eq!(reg.remove("u1", None), 1);
        assert!(b.is_cancelled());
        assert!(!c.is_cancelled());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn reregistering_same_path_replaces() {
        let reg = MonitorRegistry::new();
        let now = OffsetDateTime::now_utc();
        let first = CancellationToken::new();
        reg.register(info("u1", Some("/p")), first.clone(), now);
        reg.register(info("u1", Some("/p")), CancellationToken::new(), now);
        assert!(first.is_cancelled());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn sweep_drops_ended_and_idle_monitors() {
        let reg = MonitorRegistry::new();
        let t0 = OffsetDateTime::now_utc();
        let idle = Duration::from_secs(3600);
        let ended = CancellationToken::new();
        let quiet = CancellationToken::new();
        let active = CancellationToken::new();
        reg.register(info("u1", Some("/p/a")), ended.clone(), t0);
        reg.register(info("u2", None), quiet.clone(), t0);
        reg.register(info("u3", None), active.clone(), t0);

        ended.cancel();
        reg.touch("u3", t0 + Duration::from_secs(3000));
        assert_eq!(reg.sweep(t0 + Duration::from_secs(1000), idle), 1);
        assert_eq!(reg.len(), 2);

        assert_eq!(reg.sweep(t0 + Duration::from_secs(4000), idle), 1);
        assert!(quiet.is_cancelled());
        assert!(!active.is_cancelled());
        let left = reg.list();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].user_id, "u3");
    }

    #[tokio::test]
    async fn watch_ends_when_root_is_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("project");
        std::fs::create_dir(&root).unwrap();
        let settings = WatchConfig {
            interval_ms: 20,
            ..WatchConfig::default()
        };
        let task = tokio::spawn(watch_project(
            root.clone(),
            settings,
            CancellationToken::new(),
            |_| {},
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        std::fs::remove_dir_all(&root).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("watch task should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn watch_reports_new_files_until_cancelled() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("existing.py"), "x = 1\n").unwrap();
        let settings = WatchConfig {
            interval_ms: 20,
            ..WatchConfig::default()
        };
        let seen: Arc<Mutex<Vec<DetectedFile>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watch_project(
            tmp.path().to_path_buf(),
            settings,
            cancel.clone(),
            move |f| sink.lock().unwrap().push(f),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Write then rename so no scan sees a half-written file.
        std::fs::write(tmp.path().join("fresh.tmp"), "print('hi')\n").unwrap();
        std::fs::rename(tmp.path().join("fresh.tmp"), tmp.path().join("fresh.py")).unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].filename, "fresh.py");
        assert_eq!(seen[0].trigger, Trigger::Created);
        assert_eq!(seen[0].code, "print('hi')\n");
    }

    #[tokio::test]
    async fn watch_on_missing_root_returns() {
        let tmp = tempfile::tempdir().unwrap();
        watch_project(
            tmp.path().join("missing"),
            WatchConfig::default(),
            CancellationToken::new(),
            |_| {},
        )
        .await;
    }
}
