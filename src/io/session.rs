use crate::config::PipelineConfig;
use crate::io::auth::Authenticator;
use crate::types::{S2Error, S2Result};
use std::io::Write;
use std::time::Duration;

/// Minimal HTTP surface the pipeline needs.
///
/// Implementations report failures as [`S2Error::Http`] so callers can tell
/// transient errors (no status, 429, 5xx) from fatal ones.
pub trait HttpTransport: Send + Sync {
    /// GET `url` and decode the body as JSON
    fn get_json(&self, url: &str) -> S2Result<serde_json::Value>;

    /// GET `url` and stream the body into `sink`, returning the byte count
    fn download_to(&self, url: &str, sink: &mut dyn Write) -> S2Result<u64>;
}

/// Blocking CDSE session with optional bearer authentication.
///
/// A 401 response triggers one token refresh and one repeat of the request.
pub struct CdseSession {
    client: reqwest::blocking::Client,
    auth: Option<Authenticator>,
    json_timeout: Duration,
    download_timeout: Duration,
}

impl CdseSession {
    /// Session without credentials, sufficient for catalogue searches
    pub fn anonymous(config: &PipelineConfig) -> S2Result<Self> {
        Self::build(config, None)
    }

    pub fn authenticated(config: &PipelineConfig, auth: Authenticator) -> S2Result<Self> {
        Self::build(config, Some(auth))
    }

    fn build(config: &PipelineConfig, auth: Option<Authenticator>) -> S2Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.catalogue_timeout)
            .build()
            .map_err(|e| S2Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            auth,
            json_timeout: config.catalogue_timeout,
            download_timeout: config.download_timeout,
        })
    }

    fn send(&self, url: &str, timeout: Duration) -> S2Result<reqwest::blocking::Response> {
        let response = self.send_once(url, timeout, false)?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED && self.auth.is_some() {
            log::info!("Access token rejected; refreshing and retrying once");
            return self.send_once(url, timeout, true);
        }
        Ok(response)
    }

    fn send_once(
        &self,
        url: &str,
        timeout: Duration,
        force_refresh: bool,
    ) -> S2Result<reqwest::blocking::Response> {
        let mut request = self.client.get(url).timeout(timeout);
        if let Some(auth) = &self.auth {
            request = request.bearer_auth(auth.access_token(force_refresh)?);
        }
        request.send().map_err(|e| http_error(url, e))
    }
}

fn http_error(url: &str, e: reqwest::Error) -> S2Error {
    S2Error::Http {
        status: e.status().map(|s| s.as_u16()),
        url: url.to_string(),
        message: e.to_string(),
    }
}

fn check_status(url: &str, response: reqwest::blocking::Response) -> S2Result<reqwest::blocking::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(S2Error::Http {
        status: Some(status.as_u16()),
        url: url.to_string(),
        message: status.canonical_reason().unwrap_or("request failed").to_string(),
    })
}

impl HttpTransport for CdseSession {
    fn get_json(&self, url: &str) -> S2Result<serde_json::Value> {
        log::debug!("GET {}", url);
        let response = check_status(url, self.send(url, self.json_timeout)?)?;
        response.json::<serde_json::Value>().map_err(|e| http_error(url, e))
    }

    fn download_to(&self, url: &str, sink: &mut dyn Write) -> S2Result<u64> {
        log::debug!("Downloading {}", url);
        let mut response = check_status(url, self.send(url, self.download_timeout)?)?;
        response.copy_to(sink).map_err(|e| http_error(url, e))
    }
}
