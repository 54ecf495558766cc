//! Crash-safe file write primitives.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::error::SubstratResult;

/// Write `data` to `path` atomically: temp file in the same directory, fsync,
/// rename over the target, fsync the directory.
///
/// A crash at any point leaves either the old content or the new content,
/// never a mix. Stray `<path>.tmp` files from an interrupted write are
/// overwritten on the next call and swept on recovery.
pub async fn atomic_write(path: &Path, data: &[u8]) -> SubstratResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_path(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    if let Some(parent) = path.parent() {
        fsync_dir(parent).await?;
    }
    Ok(())
}

/// Fsync a directory so its entries (renames, new files) are durable.
pub async fn fsync_dir(dir: &Path) -> SubstratResult<()> {
    let dir = dir.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        std::fs::File::open(&dir).and_then(|f| f.sync_all())
    })
    .await;
    match result {
        Ok(io_result) => io_result.map_err(Into::into),
        Err(join_err) => Err(std::io::Error::other(join_err).into()),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}
