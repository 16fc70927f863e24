//! Job table — cancellable background units of work, keyed by correlation id.
//!
//! Cancellation is cooperative: each job receives a `CancellationToken` and is
//! expected to check it at its natural suspension points. `stop` cancels the
//! token and then aborts the task, so prompt termination is only guaranteed at
//! await points — true preemption is not.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;

/// A tracked background unit of work.
#[derive(Debug)]
struct JobHandle {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    kind: String,
    started: DateTime<Utc>,
}

/// Registry of running background jobs.
///
/// Entries persist after natural completion until stopped or the process
/// exits, so `stop` on a finished job still succeeds.
#[derive(Default)]
pub struct JobTable {
    jobs: RwLock<HashMap<String, JobHandle>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and spawn a job under `id`. A duplicate id is rejected; the
    /// existing job keeps running.
    pub async fn start<F, Fut>(&self, id: &str, kind: &str, work: F) -> Result<(), JobError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(id) {
            return Err(JobError::Duplicate { id: id.to_string() });
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(work(cancel.clone()));
        jobs.insert(
            id.to_string(),
            JobHandle {
                handle,
                cancel,
                kind: kind.to_string(),
                started: Utc::now(),
            },
        );
        tracing::debug!(job = %id, kind = %kind, "Started job");
        Ok(())
    }

    /// Non-destructive enumeration of job ids, oldest first.
    pub async fn list(&self) -> Vec<String> {
        let jobs = self.jobs.read().await;
        let mut entries: Vec<_> = jobs
            .iter()
            .map(|(id, job)| (job.started, id.clone()))
            .collect();
        entries.sort();
        entries.into_iter().map(|(_, id)| id).collect()
    }

    /// One human-readable line per job, for the job-list task.
    pub async fn describe(&self) -> Vec<String> {
        let jobs = self.jobs.read().await;
        let mut entries: Vec<_> = jobs
            .iter()
            .map(|(id, job)| {
                let state = if job.handle.is_finished() {
                    "finished"
                } else {
                    "running"
                };
                (job.started, format!("{id} [{}] {state}", job.kind))
            })
            .collect();
        entries.sort();
        entries.into_iter().map(|(_, line)| line).collect()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.jobs.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Signal cancellation and remove the entry. Succeeds even if the job has
    /// already finished; an unknown id is a handled error.
    pub async fn stop(&self, id: &str) -> Result<(), JobError> {
        let job = self
            .jobs
            .write()
            .await
            .remove(id)
            .ok_or_else(|| JobError::Unknown { id: id.to_string() })?;

        job.cancel.cancel();
        if !job.handle.is_finished() {
            job.handle.abort();
        }
        tracing::debug!(job = %id, "Stopped job");
        Ok(())
    }

    /// Best-effort cancellation of every job, used on the terminal paths.
    pub async fn stop_all(&self) {
        let mut jobs = self.jobs.write().await;
        for (id, job) in jobs.drain() {
            job.cancel.cancel();
            if !job.handle.is_finished() {
                job.handle.abort();
            }
            tracing::debug!(job = %id, "Stopped job (shutdown)");
        }
    }
}

/// Shared buffer background jobs append output lines to; the scheduling loop
/// drains it once per cycle onto the type-110 job channel.
#[derive(Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<Mutex<String>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line of job output.
    pub async fn append(&self, line: &str) {
        let mut buffer = self.inner.lock().await;
        buffer.push_str(line);
        if !line.ends_with('\n') {
            buffer.push('\n');
        }
    }

    /// Take the buffered text, leaving the buffer empty.
    pub async fn drain(&self) -> String {
        std::mem::take(&mut *self.inner.lock().await)
    }

    /// Put drained text back at the front after a failed flush.
    pub async fn restore(&self, text: String) {
        let mut buffer = self.inner.lock().await;
        buffer.insert_str(0, &text);
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn spawn_idle(table: &JobTable, id: &str) {
        table
            .start(id, "test", |cancel| async move {
                cancel.cancelled().await;
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_then_stop_removes_from_list() {
        let table = JobTable::new();
        spawn_idle(&table, "job-1").await;
        assert_eq!(table.list().await, vec!["job-1".to_string()]);

        table.stop("job-1").await.unwrap();
        assert!(table.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_id_is_handled_error() {
        let table = JobTable::new();
        let err = table.stop("nope").await.unwrap_err();
        assert!(matches!(err, JobError::Unknown { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let table = JobTable::new();
        spawn_idle(&table, "job-1").await;

        let err = table
            .start("job-1", "test", |_| async {})
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Duplicate { .. }));
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_stop_succeeds_after_natural_completion() {
        let table = JobTable::new();
        table.start("quick", "test", |_| async {}).await.unwrap();

        // Let the job finish; the entry stays until stopped.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(table.contains("quick").await);
        table.stop("quick").await.unwrap();
        assert!(!table.contains("quick").await);
    }

    #[tokio::test]
    async fn test_cancellation_token_fires_on_stop() {
        let table = JobTable::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        table
            .start("watched", "test", |cancel| async move {
                cancel.cancelled().await;
                let _ = tx.send(());
            })
            .await
            .unwrap();

        table.stop("watched").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("cancellation should reach the job")
            .ok();
    }

    #[tokio::test]
    async fn test_stop_all_clears_table() {
        let table = JobTable::new();
        spawn_idle(&table, "a").await;
        spawn_idle(&table, "b").await;
        table.stop_all().await;
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_output_buffer_append_drain() {
        let buffer = OutputBuffer::new();
        assert!(buffer.is_empty().await);

        buffer.append("line one").await;
        buffer.append("line two\n").await;
        assert_eq!(buffer.drain().await, "line one\nline two\n");
        assert!(buffer.is_empty().await);
    }

    #[tokio::test]
    async fn test_output_buffer_restore_prepends() {
        let buffer = OutputBuffer::new();
        buffer.append("newer").await;
        buffer.restore("older\n".to_string()).await;
        assert_eq!(buffer.drain().await, "older\nnewer\n");
    }
}
