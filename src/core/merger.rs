//! Reassembles completed chunk files into the final file

use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::core::error_handling::MergeError;
use crate::core::models::ChunkRecord;

/// Temp file of chunk `index` inside the download's temp directory
pub fn chunk_file_path(temp_dir: &Path, index: usize) -> PathBuf {
    temp_dir.join(format!("chunk-{}", index))
}

/// Merge output is written here first and renamed onto the destination
pub fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Concatenate chunk files in start-byte order into `destination`, then
/// remove `temp_dir`. Returns the number of bytes written.
///
/// Nothing appears at `destination` unless every chunk file is present with
/// the expected length.
pub async fn merge_chunks(
    chunks: &[ChunkRecord],
    temp_dir: &Path,
    destination: &Path,
) -> Result<u64, MergeError> {
    if chunks.is_empty() {
        return Err(MergeError::NoChunks);
    }

    let mut ordered: Vec<&ChunkRecord> = chunks.iter().collect();
    ordered.sort_by_key(|chunk| chunk.start);

    verify_chunks(&ordered, temp_dir).await?;

    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    info!(
        "🔗 Merging {} chunks into {:?}",
        ordered.len(),
        destination
    );

    let staging = staging_path(destination);
    let total = match write_staging(&ordered, temp_dir, &staging).await {
        Ok(total) => total,
        Err(e) => {
            remove_if_exists(&staging).await;
            return Err(e);
        }
    };

    if let Err(e) = tokio::fs::rename(&staging, destination).await {
        remove_if_exists(&staging).await;
        return Err(e.into());
    }

    if let Err(e) = tokio::fs::remove_dir_all(temp_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove temp directory {:?}: {}", temp_dir, e);
        }
    }

    info!("✅ Merged {} bytes into {:?}", total, destination);
    Ok(total)
}

async fn verify_chunks(ordered: &[&ChunkRecord], temp_dir: &Path) -> Result<(), MergeError> {
    let mut expected_start = 0u64;

    for chunk in ordered {
        if chunk.start != expected_start {
            return Err(MergeError::Gap {
                index: chunk.index,
                start: chunk.start,
                expected: expected_start,
            });
        }

        let path = chunk_file_path(temp_dir, chunk.index);
        let actual = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MergeError::MissingChunk {
                    index: chunk.index,
                    path,
                });
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(expected) = chunk.len() {
            if actual != expected {
                return Err(MergeError::LengthMismatch {
                    index: chunk.index,
                    expected,
                    actual,
                });
            }
        }

        expected_start = chunk.start + actual;
    }

    Ok(())
}

async fn write_staging(
    ordered: &[&ChunkRecord],
    temp_dir: &Path,
    staging: &Path,
) -> Result<u64, MergeError> {
    let mut output = File::create(staging).await?;
    let mut total = 0u64;

    for chunk in ordered {
        let mut input = File::open(chunk_file_path(temp_dir, chunk.index)).await?;
        total += tokio::io::copy(&mut input, &mut output).await?;
    }

    output.flush().await?;
    output.sync_all().await?;
    Ok(total)
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}
