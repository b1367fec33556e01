use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    cache::ModelCache,
    error::{HubError, HubResult},
};

/// Compute the SHA-256 hex digest of a file on disk.
pub fn sha256_file(path: &Path) -> HubResult<String> {
    let data = std::fs::read(path).map_err(HubError::Io)?;
    let digest = Sha256::digest(&data);
    Ok(hex::encode(digest))
}

/// Verify that `path` matches the expected SHA-256 hex string.
pub fn verify_integrity(path: &Path, expected_sha256: &str) -> HubResult<()> {
    let actual = sha256_file(path)?;
    debug!(
        path = %path.display(),
        expected = expected_sha256,
        actual = %actual,
        "Verifying file integrity"
    );
    if actual.eq_ignore_ascii_case(expected_sha256) {
        Ok(())
    } else {
        Err(HubError::IntegrityMismatch {
            file: path.to_string_lossy().to_string(),
            expected: expected_sha256.to_string(),
            actual,
        })
    }
}

/// Re-hash a cached file and compare against its metadata sidecar.
pub fn verify_cached(
    cache: &ModelCache,
    repo_id: &str,
    revision: &str,
    filename: &str,
) -> HubResult<()> {
    let meta = cache.read_meta(repo_id, revision, filename)?;
    verify_integrity(&cache.file_path(repo_id, revision, filename), &meta.sha256)
}
