use std::path::Path;
use std::path::PathBuf;

use tracing::debug;

use crate::error::SupervisorError;

/// Reduces a caller-supplied dataset reference to the file name it was
/// stored under: only the last path component is kept and anything outside
/// `[A-Za-z0-9._-]` becomes `_`.
pub fn sanitize_file_name(dataset_ref: &str) -> String {
    let base = Path::new(dataset_ref)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Resolves `dataset_ref` inside `upload_dir`. Fails with
/// [`SupervisorError::ResourceNotFound`] unless it names an existing regular
/// file.
pub async fn resolve(upload_dir: &Path, dataset_ref: &str) -> Result<PathBuf, SupervisorError> {
    let not_found = || SupervisorError::ResourceNotFound {
        dataset: dataset_ref.to_string(),
    };
    let file_name = sanitize_file_name(dataset_ref);
    if file_name.is_empty() || file_name.chars().all(|c| c == '.') {
        return Err(not_found());
    }

    let path = upload_dir.join(&file_name);
    match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => Ok(path),
        Ok(_) => {
            debug!(path = %path.display(), "dataset is not a regular file");
            Err(not_found())
        }
        Err(err) => {
            debug!(path = %path.display(), "dataset lookup failed: {err}");
            Err(not_found())
        }
    }
}
