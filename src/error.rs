//! Error types for the outpost agent.

use std::time::Duration;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid listener profile: {0}")]
    InvalidProfile(String),
}

/// Controller transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Controller returned status {code}")]
    Status { code: u16 },

    #[error("Transport is closed")]
    Closed,
}

/// Payload codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Payload too short for integrity header: {len} bytes")]
    Truncated { len: usize },

    #[error("Compression failed: {0}")]
    Deflate(String),

    #[error("Decompression failed: {0}")]
    Inflate(String),
}

/// Chunked file-transfer errors.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Malformed chunk record: {0}")]
    Malformed(String),

    #[error("Chunk failed integrity check")]
    IntegrityCheck,
}

/// Job-table errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} already exists")]
    Duplicate { id: String },

    #[error("Job {id} not found")]
    Unknown { id: String },
}

/// Module-repository errors.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("Module {name} already exists")]
    Duplicate { name: String },

    #[error("Module {name} not found")]
    Unknown { name: String },

    #[error("Invalid module archive: {0}")]
    Archive(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Script-engine errors.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Failed to spawn interpreter {interpreter}: {source}")]
    Spawn {
        interpreter: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Script timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by task handlers. The dispatcher renders these onto the
/// type-0 error channel with the task's correlation id.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("invalid tasking ID: {code}")]
    UnknownType { code: u32 },

    #[error("Malformed task body: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error("Script exited with status {status}; recovered output: {output}")]
    ScriptFailed { status: i32, output: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Tunnel is not running")]
    TunnelNotRunning,

    #[error("Tunnel already running")]
    TunnelAlreadyRunning,
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
