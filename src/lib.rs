//! Outpost — remote task-agent core.

pub mod agent;
pub mod codec;
pub mod config;
pub mod error;
pub mod jobs;
pub mod modules;
pub mod packet;
pub mod script;
pub mod sysinfo;
pub mod tasks;
pub mod transfer;
pub mod transport;
