use tracing::instrument;

use crate::error::TransferError;

/// Checks that the file at `path` has exactly `expected_size` bytes.
///
/// Only the size is compared: content corruption that preserves the length goes unnoticed.
#[instrument]
pub async fn validate(path: &std::path::Path, expected_size: u64) -> Result<(), TransferError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|source| TransferError::Validation {
            path: path.to_path_buf(),
            source,
        })?;
    let metadata = file
        .metadata()
        .await
        .map_err(|source| TransferError::Validation {
            path: path.to_path_buf(),
            source,
        })?;
    if metadata.len() != expected_size {
        return Err(TransferError::CorruptFile {
            path: path.to_path_buf(),
            expected: expected_size,
            actual: metadata.len(),
        });
    }
    tracing::debug!("size matches remote listing: {} bytes", expected_size);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn accepts_exact_size() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let path = tmp_dir.path().join("a.csv");
        tokio::fs::write(&path, vec![b'x'; 1000]).await?;
        validate(&path, 1000).await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn short_file_is_corrupt() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let path = tmp_dir.path().join("a.csv");
        tokio::fs::write(&path, vec![b'x'; 990]).await?;
        match validate(&path, 1000).await {
            Err(TransferError::CorruptFile {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 1000);
                assert_eq!(actual, 990);
            }
            other => panic!("expected CorruptFile, got {other:?}"),
        }
        // the suspect file stays where it is for inspection
        assert!(path.exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_file_is_reported() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let result = validate(&tmp_dir.path().join("missing.csv"), 10).await;
        assert!(matches!(result, Err(TransferError::Validation { .. })));
        Ok(())
    }
}
