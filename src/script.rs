//! Script engine — subprocess-sandboxed dynamic code execution.
//!
//! Dynamic code never runs inside this process. Source is fed to a
//! configurable interpreter on stdin (or from a scratch file for the on-disk
//! variant), with loaded-module search paths exported through an environment
//! variable the interpreter understands. Output is either captured whole or
//! streamed line-by-line into the job-output buffer.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::ScriptError;
use crate::jobs::OutputBuffer;

/// Result of a captured script run.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    /// Process exit code (-1 when terminated by signal).
    pub status: i32,
    /// Merged stdout/stderr text.
    pub output: String,
}

impl ScriptOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Interpreter configuration for dynamic code tasks.
#[derive(Debug, Clone)]
pub struct ScriptEngine {
    interpreter: String,
    module_path_env: String,
    timeout: Duration,
}

impl ScriptEngine {
    pub fn new(interpreter: String, module_path_env: String, timeout: Duration) -> Self {
        Self {
            interpreter,
            module_path_env,
            timeout,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.interpreter.clone(),
            config.module_path_env.clone(),
            config.command_timeout,
        )
    }

    /// Base interpreter command with module search paths exported.
    fn command(&self, search_paths: &[PathBuf]) -> Command {
        let mut command = Command::new(&self.interpreter);
        if !search_paths.is_empty() {
            let joined = std::env::join_paths(search_paths)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            command.env(&self.module_path_env, joined);
        }
        command.kill_on_drop(true);
        command
    }

    /// Run source fed on stdin and capture merged output, bounded by the
    /// configured timeout.
    pub async fn run_captured(
        &self,
        code: &str,
        args: &[&str],
        search_paths: &[PathBuf],
    ) -> Result<ScriptOutput, ScriptError> {
        let mut command = self.command(search_paths);
        // "-" tells the interpreter to read the program from stdin, leaving
        // the remaining arguments for the script itself.
        command
            .arg("-")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| ScriptError::Spawn {
            interpreter: self.interpreter.clone(),
            source,
        })?;

        feed_stdin(&mut child, code);
        self.wait_captured(child).await
    }

    /// Run a script already on disk: `interpreter <path>`.
    pub async fn run_file(
        &self,
        path: &Path,
        search_paths: &[PathBuf],
    ) -> Result<ScriptOutput, ScriptError> {
        let mut command = self.command(search_paths);
        command
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = command.spawn().map_err(|source| ScriptError::Spawn {
            interpreter: self.interpreter.clone(),
            source,
        })?;
        self.wait_captured(child).await
    }

    /// Spawn a script for line-streamed execution under a background job.
    /// The caller pumps output with [`stream_lines`].
    pub async fn spawn_streaming(
        &self,
        code: &str,
        args: &[&str],
        search_paths: &[PathBuf],
    ) -> Result<Child, ScriptError> {
        let mut command = self.command(search_paths);
        command
            .arg("-")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| ScriptError::Spawn {
            interpreter: self.interpreter.clone(),
            source,
        })?;

        feed_stdin(&mut child, code);
        Ok(child)
    }

    async fn wait_captured(&self, child: Child) -> Result<ScriptOutput, ScriptError> {
        let timeout = self.timeout;
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ScriptError::Timeout { timeout })??;

        let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            if !merged.is_empty() && !merged.ends_with('\n') {
                merged.push('\n');
            }
            merged.push_str(&String::from_utf8_lossy(&output.stderr));
        }

        Ok(ScriptOutput {
            status: output.status.code().unwrap_or(-1),
            output: merged,
        })
    }
}

/// Feed source to the child's stdin from its own task so output can be
/// drained concurrently. Feeding inline would deadlock once a large script's
/// early commands fill the stdout pipe while the stdin pipe is still being
/// written, and it would sit outside the engine timeout. A write failure
/// surfaces through the interpreter's own exit status.
fn feed_stdin(child: &mut Child, code: &str) {
    if let Some(mut stdin) = child.stdin.take() {
        let code = code.to_string();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(code.as_bytes()).await {
                tracing::debug!("Script stdin feed ended early: {e}");
            }
            // Dropping stdin closes the pipe so the interpreter sees EOF.
        });
    }
}

/// Pump a child's stdout into the job-output buffer line by line.
///
/// The per-line loop doubles as the cancellation checkpoint: when the job's
/// token fires, the child is killed and the pump stops. Any stderr text is
/// appended once the stream ends. Returns the exit code.
pub async fn stream_lines(
    mut child: Child,
    sink: &OutputBuffer,
    cancel: &CancellationToken,
) -> Result<i32, ScriptError> {
    let stdout = child.stdout.take();

    if let Some(stdout) = stdout {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Ok(-1);
                }
                line = lines.next_line() => match line? {
                    Some(line) => sink.append(&line).await,
                    None => break,
                },
            }
        }
    }

    let mut stderr_text = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut stderr_text).await;
    }
    if !stderr_text.trim().is_empty() {
        sink.append(stderr_text.trim_end()).await;
    }

    let status = child.wait().await?;
    Ok(status.code().unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;

    // The tests use `sh` as the interpreter so they do not depend on a Python
    // toolchain being present. `sh -` reads the program from stdin, matching
    // the engine's contract.
    fn sh_engine() -> ScriptEngine {
        ScriptEngine::new("sh".to_string(), "PATH_EXTRA".to_string(), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_run_captured_collects_stdout() {
        let out = sh_engine()
            .run_captured("echo captured-output", &[], &[])
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.output.trim(), "captured-output");
    }

    #[tokio::test]
    async fn test_run_captured_merges_stderr_and_reports_status() {
        let out = sh_engine()
            .run_captured("echo visible; echo oops >&2; exit 3", &[], &[])
            .await
            .unwrap();
        assert_eq!(out.status, 3);
        assert!(out.output.contains("visible"));
        assert!(out.output.contains("oops"));
    }

    #[tokio::test]
    async fn test_run_captured_passes_args() {
        let out = sh_engine()
            .run_captured("echo \"arg:$1\"", &["first"], &[])
            .await
            .unwrap();
        assert_eq!(out.output.trim(), "arg:first");
    }

    #[tokio::test]
    async fn test_search_paths_exported_via_env() {
        let paths = vec![PathBuf::from("/tmp/mods/alpha")];
        let out = sh_engine()
            .run_captured("echo \"$PATH_EXTRA\"", &[], &paths)
            .await
            .unwrap();
        assert_eq!(out.output.trim(), "/tmp/mods/alpha");
    }

    #[tokio::test]
    async fn test_timeout_kills_the_run() {
        let engine =
            ScriptEngine::new("sh".to_string(), "X".to_string(), Duration::from_millis(100));
        let result = engine.run_captured("sleep 10", &[], &[]).await;
        assert!(matches!(result, Err(ScriptError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_timeout_covers_stdin_feed() {
        // First command floods stdout while the rest of the source is still
        // in flight; if the feed were inline, both pipes would fill and the
        // run would hang past its own timeout.
        let mut source =
            String::from("head -c 200000 /dev/zero | tr '\\0' 'a'; sleep 30\n");
        while source.len() < 128 * 1024 {
            source.push_str("true\n");
        }

        let engine =
            ScriptEngine::new("sh".to_string(), "X".to_string(), Duration::from_secs(2));
        let result = tokio::time::timeout(
            Duration::from_secs(8),
            engine.run_captured(&source, &[], &[]),
        )
        .await
        .expect("engine timeout must bound the whole run");
        assert!(matches!(result, Err(ScriptError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_error() {
        let engine = ScriptEngine::new(
            "definitely-not-an-interpreter".to_string(),
            "X".to_string(),
            Duration::from_secs(1),
        );
        let result = engine.run_captured("echo hi", &[], &[]).await;
        assert!(matches!(result, Err(ScriptError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_run_file_executes_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.sh");
        tokio::fs::write(&path, "echo from-disk").await.unwrap();

        let out = sh_engine().run_file(&path, &[]).await.unwrap();
        assert!(out.success());
        assert_eq!(out.output.trim(), "from-disk");
    }

    #[tokio::test]
    async fn test_stream_lines_feeds_sink() {
        let engine = sh_engine();
        let child = engine
            .spawn_streaming("echo one; echo two", &[], &[])
            .await
            .unwrap();

        let sink = OutputBuffer::new();
        let cancel = CancellationToken::new();
        let status = stream_lines(child, &sink, &cancel).await.unwrap();
        assert_eq!(status, 0);
        assert_eq!(sink.drain().await, "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_stream_lines_stops_on_cancel() {
        let engine = sh_engine();
        let child = engine
            .spawn_streaming("echo started; sleep 30; echo never", &[], &[])
            .await
            .unwrap();

        let sink = OutputBuffer::new();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel_clone.cancel();
        });

        let status = tokio::time::timeout(Duration::from_secs(5), stream_lines(child, &sink, &cancel))
            .await
            .expect("cancel must interrupt the pump")
            .unwrap();
        assert_eq!(status, -1);
        let drained = sink.drain().await;
        assert!(drained.contains("started"));
        assert!(!drained.contains("never"));
    }
}
