use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use globset::{Glob, GlobMatcher};
use ignore::WalkBuilder;
use pyrelay_core::Trigger;

/// Default modification-time debounce.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

const MAX_DEPTH: usize = 32;

/// Tool and environment directories that are never project sources, even
/// without a `.gitignore` naming them.
const SKIPPED_DIRS: &[&str] = &["__pycache__", "node_modules", "venv", "site-packages"];

/// A file that appeared or changed since the previous scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    /// `Created` or `Modified`.
    pub trigger: Trigger,
}

/// Polls a directory tree and reports new or modified files.
pub struct DirectoryScanner {
    root: PathBuf,
    matcher: GlobMatcher,
    debounce: Duration,
    mtimes: HashMap<PathBuf, SystemTime>,
}

impl DirectoryScanner {
    /// `pattern` is matched against file names (e.g. `*.py`).
    pub fn new(root: &Path, pattern: &str) -> anyhow::Result<Self> {
        if !root.is_dir() {
            anyhow::bail!("not a directory: {}", root.display());
        }
        let matcher = Glob::new(pattern)?.compile_matcher();
        Ok(Self {
            root: normalize_root(root),
            matcher,
            debounce: DEFAULT_DEBOUNCE,
            mtimes: HashMap::new(),
        })
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of files in the last snapshot.
    pub fn tracked(&self) -> usize {
        self.mtimes.len()
    }

    /// Record the current state without reporting anything.
    pub fn prime(&mut self) {
        self.mtimes = self.snapshot();
    }

    /// Compare the tree against the previous snapshot.
    ///
    /// The stored table is replaced by the new snapshot afterwards, so a file
    /// deleted between scans is simply forgotten.
    pub fn scan(&mut self) -> Vec<FileEvent> {
        let current = self.snapshot();
        let mut events = Vec::new();
        for (path, mtime) in &current {
            match self.mtimes.get(path) {
                None => events.push(FileEvent {
                    path: path.clone(),
                    trigger: Trigger::Created,
                }),
                Some(previous) => {
                    let advanced = mtime
                        .duration_since(*previous)
                        .map(|d| d > self.debounce)
                        .unwrap_or(false);
                    if advanced {
                        events.push(FileEvent {
                            path: path.clone(),
                            trigger: Trigger::Modified,
                        });
                    }
                }
            }
        }
        self.mtimes = current;
        events.sort_by(|a, b| a.path.cmp(&b.path));
        events
    }

    fn snapshot(&self) -> HashMap<PathBuf, SystemTime> {
        let mut out = HashMap::new();
        collect_files(&self.root, &self.matcher, &mut out);
        out
    }
}

/// Canonicalize when possible so paths compare equal to what other
/// sources (e.g. `/proc`) report.
pub(crate) fn normalize_root(p: &Path) -> PathBuf {
    p.canonicalize().unwrap_or_else(|_| p.to_path_buf())
}

fn collect_files(root: &Path, matcher: &GlobMatcher, out: &mut HashMap<PathBuf, SystemTime>) {
    // Hidden entries (.git, .venv, ...) and .gitignore'd paths are skipped.
    let walker = WalkBuilder::new(root)
        .max_depth(Some(MAX_DEPTH))
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .filter_entry(|entry| {
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            !(is_dir && entry.depth() > 0 && is_skipped_dir(entry.file_name()))
        })
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(root = %root.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        let name_matches = entry
            .path()
            .file_name()
            .is_some_and(|n| matcher.is_match(n));
        if !name_matches {
            continue;
        }
        // Symlinked directories are not followed; symlinked files are.
        let Ok(meta) = fs::metadata(entry.path()) else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        if let Ok(mtime) = meta.modified() {
            out.insert(entry.into_path(), mtime);
        }
    }
}

fn is_skipped_dir(name: &OsStr) -> bool {
    SKIPPED_DIRS.iter().any(|skip| name == *skip)
}
