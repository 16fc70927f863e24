//! Chunked file-transfer engine.
//!
//! Large files move as a finite sequence of codec-encoded, base64-rendered
//! parts. The wire record is pipe-delimited and must stay byte-exact for
//! interop: `"{part_index}|{absolute_path}|{total_size}|{base64_chunk}"`.
//! A zero-byte read is the sole EOF signal — no final marker is sent.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::codec;
use crate::error::TransferError;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 512_000;

/// One encoded slice of a file in transit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    /// Zero-based index of this part within its file.
    pub index: u64,
    /// Absolute path of the source file.
    pub path: String,
    /// Total size of the source file in bytes.
    pub total: u64,
    /// Codec-encoded, base64-rendered chunk bytes.
    pub encoded: String,
}

impl FilePart {
    /// Render the pipe-delimited wire record.
    pub fn render(&self) -> String {
        format!("{}|{}|{}|{}", self.index, self.path, self.total, self.encoded)
    }

    /// Parse a wire record back into a part.
    pub fn parse(record: &str) -> Result<Self, TransferError> {
        let mut fields = record.splitn(4, '|');
        let (Some(index), Some(path), Some(total), Some(encoded)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(TransferError::Malformed(format!(
                "expected 4 pipe-delimited fields, got {:?}",
                record.split('|').count()
            )));
        };
        Ok(Self {
            index: index
                .parse()
                .map_err(|_| TransferError::Malformed(format!("bad part index {index:?}")))?,
            path: path.to_string(),
            total: total
                .parse()
                .map_err(|_| TransferError::Malformed(format!("bad total size {total:?}")))?,
            encoded: encoded.to_string(),
        })
    }

    /// Decode and integrity-check the chunk payload.
    pub fn payload(&self) -> Result<Vec<u8>, TransferError> {
        let raw = BASE64.decode(&self.encoded)?;
        let decoded = codec::decode(&raw)?;
        if !decoded.crc_ok {
            return Err(TransferError::IntegrityCheck);
        }
        Ok(decoded.data)
    }
}

/// Produces the encoded parts of one file, one chunk per call.
///
/// The sequence is lazy, finite, and non-restartable; callers own the pacing
/// between parts (the download handler sleeps a jittered interval so transfer
/// speed tracks the check-in cadence).
pub struct FileSender {
    file: File,
    path: String,
    total: u64,
    offset: u64,
    index: u64,
    chunk_size: usize,
}

impl FileSender {
    /// Open a file for chunked sending. The wire records carry the absolute
    /// path, whatever path the task arrived with.
    pub async fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self, TransferError> {
        let path = tokio::fs::canonicalize(path.as_ref()).await?;
        let file = File::open(&path).await?;
        let total = file.metadata().await?.len();
        Ok(Self {
            file,
            path: path.to_string_lossy().into_owned(),
            total,
            offset: 0,
            index: 0,
            chunk_size,
        })
    }

    /// Produce the next part, or `None` once a read yields zero bytes.
    pub async fn next_part(&mut self) -> Result<Option<FilePart>, TransferError> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < self.chunk_size {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);

        let encoded = BASE64.encode(codec::encode(&buf)?);
        let part = FilePart {
            index: self.index,
            path: self.path.clone(),
            total: self.total,
            encoded,
        };
        self.offset += filled as u64;
        self.index += 1;
        Ok(Some(part))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Bytes sent so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Append one decoded upload chunk to the target path, creating the file if
/// absent. Appends never truncate: a retried part duplicates bytes, and
/// callers own in-order delivery.
pub async fn receive_chunk(path: &str, base64_chunk: &str) -> Result<(), TransferError> {
    let raw = BASE64.decode(base64_chunk)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(&raw).await?;
    file.flush().await?;
    Ok(())
}

/// Expand a path into the list of files to transfer. A file expands to
/// itself; a directory expands to its recursive file listing.
pub async fn expand_paths(path: &Path) -> Result<Vec<PathBuf>, TransferError> {
    let meta = tokio::fs::metadata(path).await?;
    if meta.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let entry_type = entry.file_type().await?;
            if entry_type.is_dir() {
                pending.push(entry.path());
            } else if entry_type.is_file() {
                files.push(entry.path());
            }
            // Symlinks are skipped.
        }
    }
    files.sort();
    Ok(files)
}
