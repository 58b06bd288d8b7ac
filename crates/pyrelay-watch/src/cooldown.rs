use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const DEFAULT_UPLOAD_COOLDOWN: Duration = Duration::from_secs(2);

/// Per-path rate limit on uploads.
#[derive(Debug)]
pub struct UploadCooldown {
    cooldown: Duration,
    last_upload: HashMap<PathBuf, Instant>,
}

impl Default for UploadCooldown {
    fn default() -> Self {
        Self::new(DEFAULT_UPLOAD_COOLDOWN)
    }
}

impl UploadCooldown {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_upload: HashMap::new(),
        }
    }

    /// Returns true (and records `now`) if `path` has not been uploaded
    /// within the cooldown.
    pub fn admit(&mut self, path: &Path, now: Instant) -> bool {
        if let Some(last) = self.last_upload.get(path) {
            if now.saturating_duration_since(*last) < self.cooldown {
                return false;
            }
        }
        self.last_upload.insert(path.to_path_buf(), now);
        true
    }
}
