use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::dir_scan::normalize_root;

/// Processes older than this are assumed to be re-discoveries, not launches.
pub const MAX_PROCESS_AGE: Duration = Duration::from_secs(3);
/// A path triggers at most once per window.
pub const DETECTION_WINDOW: Duration = Duration::from_secs(5);
/// The recently-triggered set is cleared once it grows past this.
pub const RECENT_CAP: usize = 20;

/// Snapshot of one OS process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmdline: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub start_time: SystemTime,
}

/// An interpreter launched on a watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEvent {
    pub pid: u32,
    pub path: PathBuf,
    pub start_time: SystemTime,
}

/// Enumerates OS processes.
pub trait ProcessSource: Send {
    fn processes(&mut self) -> anyhow::Result<Vec<ProcessInfo>>;
}

/// Best available process source for this platform.
pub fn default_process_source() -> Box<dyn ProcessSource> {
    #[cfg(target_os = "linux")]
    {
        Box::new(procfs_source::ProcfsSource)
    }
    #[cfg(not(target_os = "linux"))]
    {
        tracing::warn!("process enumeration is not supported on this platform; run detection disabled");
        Box::new(NoProcesses)
    }
}

/// Reports no processes.
pub struct NoProcesses;

impl ProcessSource for NoProcesses {
    fn processes(&mut self) -> anyhow::Result<Vec<ProcessInfo>> {
        Ok(Vec::new())
    }
}

#[cfg(target_os = "linux")]
mod procfs_source {
    use super::{ProcessInfo, ProcessSource};
    use std::time::{Duration, SystemTime};

    /// Reads `/proc` via the procfs crate.
    pub struct ProcfsSource;

    impl ProcessSource for ProcfsSource {
        fn processes(&mut self) -> anyhow::Result<Vec<ProcessInfo>> {
            let boot_secs = procfs::boot_time_secs()?;
            let ticks = procfs::ticks_per_second().max(1);
            let mut out = Vec::new();
            for process in procfs::process::all_processes()? {
                // Processes vanish between listing and reading; skip them.
                let Ok(process) = process else { continue };
                let Ok(cmdline) = process.cmdline() else { continue };
                if cmdline.len() < 2 {
                    continue;
                }
                let Ok(stat) = process.stat() else { continue };
                let since_boot = Duration::from_secs_f64(stat.starttime as f64 / ticks as f64);
                out.push(ProcessInfo {
                    pid: process.pid() as u32,
                    cmdline,
                    cwd: process.cwd().ok(),
                    start_time: SystemTime::UNIX_EPOCH + Duration::from_secs(boot_secs) + since_boot,
                });
            }
            Ok(out)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Triggered {
    start_time: SystemTime,
    at: SystemTime,
}

/// Detects interpreter launches on files under a watched root.
pub struct ProcessScanner {
    root: PathBuf,
    suffix: String,
    recent: HashMap<PathBuf, Triggered>,
}

impl ProcessScanner {
    pub fn new(root: &Path, suffix: &str) -> Self {
        Self {
            root: normalize_root(root),
            suffix: suffix.to_string(),
            recent: HashMap::new(),
        }
    }

    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    /// Inspect one tick's worth of processes.
    pub fn scan(&mut self, processes: &[ProcessInfo], now: SystemTime) -> Vec<RunEvent> {
        let mut events = Vec::new();
        for info in processes {
            let Some(path) = self.launched_file(info) else {
                continue;
            };
            let age = now.duration_since(info.start_time).unwrap_or(Duration::ZERO);
            if age >= MAX_PROCESS_AGE {
                continue;
            }
            if let Some(prev) = self.recent.get(&path) {
                let same_instance = prev.start_time == info.start_time;
                let in_window = now
                    .duration_since(prev.at)
                    .map(|d| d < DETECTION_WINDOW)
                    .unwrap_or(true);
                if same_instance || in_window {
                    continue;
                }
            }
            self.recent.insert(
                path.clone(),
                Triggered {
                    start_time: info.start_time,
                    at: now,
                },
            );
            events.push(RunEvent {
                pid: info.pid,
                path,
                start_time: info.start_time,
            });
        }
        events
    }

    /// Call once per tick after `scan`; bulk-clears the recent set when it
    /// outgrows its bound.
    pub fn end_tick(&mut self) {
        if self.recent.len() > RECENT_CAP {
            self.recent.clear();
        }
    }

    /// The watched script a process is running, if any.
    fn launched_file(&self, info: &ProcessInfo) -> Option<PathBuf> {
        if info.cmdline.len() < 2 {
            return None;
        }
        if !info.cmdline[0].to_lowercase().contains("python") {
            return None;
        }
        let script = &info.cmdline[1];
        if !script.ends_with(&self.suffix) {
            return None;
        }
        let script = Path::new(script);
        let abs = if script.is_absolute() {
            script.to_path_buf()
        } else {
            info.cwd.as_ref()?.join(script)
        };
        let abs = normalize_root(&abs);
        abs.starts_with(&self.root).then_some(abs)
    }
}
