use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::types::{JobId, JobKind};

/// SHA-256 of `text` as lowercase hex.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Mint a job ID from the submission time and a short hash of the code.
///
/// Two submissions of identical code within the same millisecond get the
/// same ID; the job store disambiguates on insert.
pub fn job_id(kind: JobKind, code: &str, at: OffsetDateTime) -> JobId {
    let millis = at.unix_timestamp_nanos() / 1_000_000;
    let hash = sha256_hex(code);
    format!("{}_{}_{}", kind.id_prefix(), millis, &hash[..8])
}
