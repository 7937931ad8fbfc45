//! Splits oversized CSV files into line aligned chunks.
//!
//! Chunking shells out to coreutils `split`, which cuts on line boundaries in a single pass
//! without holding the file in memory. Quoted values spanning several lines are therefore not
//! kept together.

use std::ffi::OsString;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{self, AsyncSeekExt};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, WriterResult};
use crate::{bail, writer_error};

const BYTES_PER_MB: u64 = 1024 * 1024;

const SPLIT_PROGRAM: &str = "split";

const CHUNK_PREFIX: &str = "chunk_";

/// Digits of the numeric chunk suffix passed to `split -a`.
const SUFFIX_LENGTH: u32 = 4;

/// Chunk files `split` can name with [`SUFFIX_LENGTH`] digits.
pub const MAX_CHUNKS: u64 = 10_u64.pow(SUFFIX_LENGTH);

const BODY_FILE_NAME: &str = "body.csv";

/// Number of chunks a file of `size_bytes` is split into, or `None` when it fits into one.
pub fn chunk_count(size_bytes: u64, chunk_size_mb: u64) -> Option<u64> {
    let chunk_bytes = chunk_size_mb.max(1).saturating_mul(BYTES_PER_MB);
    if size_bytes <= chunk_bytes {
        return None;
    }

    Some(size_bytes.div_ceil(chunk_bytes))
}

/// Per invocation directory holding chunk files.
///
/// The directory is removed by [`ScratchDir::remove`], or on drop when a write bails out early.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    removed: bool,
}

impl ScratchDir {
    /// Creates a uniquely named directory below `root`.
    pub async fn create(root: &Path) -> WriterResult<Self> {
        let path = root.join(Uuid::new_v4().simple().to_string());
        fs::create_dir_all(&path).await.map_err(|err| {
            writer_error!(
                ErrorKind::IoError,
                "Scratch directory creation failed",
                format!("Cannot create scratch directory {}", path.display()),
                source: err
            )
        })?;
        debug!(path = %path.display(), "created scratch directory");

        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the directory and everything left inside it.
    pub async fn remove(mut self) {
        self.removed = true;
        if let Err(err) = fs::remove_dir_all(&self.path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove scratch directory");
            }
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

/// Runs the external `split` program.
#[derive(Debug, Clone)]
pub struct Splitter {
    program: OsString,
}

impl Default for Splitter {
    fn default() -> Self {
        Self::new(SPLIT_PROGRAM)
    }
}

impl Splitter {
    /// Uses `program` instead of `split` from `PATH`. It is called with `split`'s arguments.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Splits the data rows of `source` into `chunks` files inside `scratch_dir`.
    ///
    /// The header ends at byte `data_offset`. Chunks hold no header. On success `source` is
    /// deleted and the chunk paths are returned in order. On failure `source` is left in place.
    pub async fn split(
        &self,
        source: &Path,
        data_offset: u64,
        chunks: u64,
        scratch_dir: &Path,
    ) -> WriterResult<Vec<PathBuf>> {
        if chunks > MAX_CHUNKS {
            bail!(
                ErrorKind::ConfigError,
                "Too many chunks",
                format!(
                    "File {} would be split into {chunks} chunks, at most {MAX_CHUNKS} are supported. Increase the chunk size of the table.",
                    source.display()
                )
            );
        }

        let body = scratch_dir.join(BODY_FILE_NAME);
        copy_body(source, data_offset, &body).await?;

        let prefix = scratch_dir.join(CHUNK_PREFIX);
        info!(source = %source.display(), chunks, "splitting csv file");
        let output = Command::new(&self.program)
            .arg("-n")
            .arg(format!("l/{chunks}"))
            .arg("-d")
            .arg("-a")
            .arg(SUFFIX_LENGTH.to_string())
            .arg(&body)
            .arg(&prefix)
            .output()
            .await
            .map_err(|err| {
                writer_error!(
                    ErrorKind::SplitFailed,
                    "Split could not be started",
                    format!(
                        "Cannot run `{}` to chunk {}",
                        self.program.to_string_lossy(),
                        source.display()
                    ),
                    source: err
                )
            })?;

        if !output.status.success() {
            bail!(
                ErrorKind::SplitFailed,
                "Split failed",
                format!(
                    "Splitting {} into {chunks} chunks failed ({}): {}",
                    source.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )
            );
        }

        fs::remove_file(&body).await?;
        fs::remove_file(source).await?;

        let paths = list_chunks(scratch_dir).await?;
        debug!(count = paths.len(), "csv file split");

        Ok(paths)
    }
}

async fn copy_body(source: &Path, data_offset: u64, body: &Path) -> WriterResult<()> {
    let mut reader = File::open(source).await?;
    reader.seek(SeekFrom::Start(data_offset)).await?;
    let mut writer = File::create(body).await?;
    io::copy(&mut reader, &mut writer).await?;

    Ok(())
}

async fn list_chunks(dir: &Path) -> WriterResult<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let is_chunk = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(CHUNK_PREFIX));
        if is_chunk {
            paths.push(entry.path());
        }
    }
    paths.sort();

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::read_csv_header;
    use crate::test_utils::{scratch_dir, write_file};

    #[test]
    fn small_files_are_not_chunked() {
        assert_eq!(chunk_count(0, 1), None);
        assert_eq!(chunk_count(BYTES_PER_MB, 1), None);
        assert_eq!(chunk_count(999 * BYTES_PER_MB, 1000), None);
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(BYTES_PER_MB + 1, 1), Some(2));
        assert_eq!(chunk_count(5 * BYTES_PER_MB / 2, 1), Some(3));
        assert_eq!(chunk_count(4 * BYTES_PER_MB, 1), Some(4));
        assert_eq!(chunk_count(2500 * BYTES_PER_MB, 1000), Some(3));
    }

    #[tokio::test]
    async fn splits_rows_without_header() {
        let dir = scratch_dir("split");
        let mut contents = String::from("id,name\n");
        for i in 0..30 {
            contents.push_str(&format!("{i},name {i}\n"));
        }
        let source = write_file(&dir, "table.csv", &contents);
        let header = read_csv_header(&source).unwrap();

        let scratch = ScratchDir::create(&dir).await.unwrap();
        let chunks = Splitter::default()
            .split(&source, header.data_offset, 3, scratch.path())
            .await
            .unwrap();

        assert_eq!(chunks.len(), 3);
        assert!(!source.exists());
        assert!(!scratch.path().join(BODY_FILE_NAME).exists());

        let mut rows = Vec::new();
        for chunk in &chunks {
            let text = std::fs::read_to_string(chunk).unwrap();
            rows.extend(text.lines().map(str::to_owned));
        }
        assert_eq!(rows.len(), 30);
        assert_eq!(rows[0], "0,name 0");
        assert_eq!(rows[29], "29,name 29");
        assert!(!rows.iter().any(|row| row == "id,name"));

        let path = scratch.path().to_path_buf();
        scratch.remove().await;
        assert!(!path.exists());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn missing_split_program_fails_the_split() {
        let dir = scratch_dir("split");
        let source = write_file(&dir, "table.csv", "id\n1\n2\n");
        let scratch = ScratchDir::create(&dir).await.unwrap();

        let err = Splitter::new(dir.join("no-such-split"))
            .split(&source, 3, 2, scratch.path())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SplitFailed);
        assert!(err.message().starts_with("Cannot run"), "{}", err.message());
        assert!(source.exists());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_fails_the_split() {
        let dir = scratch_dir("split");
        let source = write_file(&dir, "table.csv", "id\n1\n2\n");
        let scratch = ScratchDir::create(&dir).await.unwrap();

        let err = Splitter::new("false")
            .split(&source, 3, 2, scratch.path())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SplitFailed);
        assert!(err.message().contains("into 2 chunks failed"), "{}", err.message());
        assert!(source.exists());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn too_many_chunks_are_rejected_before_splitting() {
        let dir = scratch_dir("split");
        let source = write_file(&dir, "table.csv", "id\n1\n");
        let scratch = ScratchDir::create(&dir).await.unwrap();

        let err = Splitter::default()
            .split(&source, 3, MAX_CHUNKS + 1, scratch.path())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert!(err.is_user_error());
        assert!(err.message().contains("at most 10000"), "{}", err.message());
        assert!(!scratch.path().join(BODY_FILE_NAME).exists());
        assert!(source.exists());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn scratch_dir_is_removed_on_drop() {
        let dir = scratch_dir("split");
        let path = {
            let scratch = ScratchDir::create(&dir).await.unwrap();
            write_file(scratch.path(), "chunk_0000", "1\n");
            scratch.path().to_path_buf()
        };

        assert!(!path.exists());
        std::fs::remove_dir_all(dir).unwrap();
    }
}
