//! Shared test utilities for the artemis-substrate crate's integration tests.

use artemis_substrate::error::ArtemisResult;

/// Create a temporary directory, mapping the error to [`artemis_substrate::ArtemisError::Io`].
pub fn make_tempdir() -> ArtemisResult<tempfile::TempDir> {
    Ok(tempfile::tempdir()?)
}
