use crate::types::{S2Error, S2Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

const CLIENT_ID: &str = "cdse-public";
/// Tokens this close to expiry are treated as expired
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Username and password for the CDSE identity service
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    /// Read a secret file.
    ///
    /// Accepted layouts are `username=...` / `password=...` lines, or a bare
    /// username on the first line and the password on the second. On Unix the
    /// file must not be readable by group or others.
    pub fn from_file<P: AsRef<Path>>(path: P) -> S2Result<Self> {
        let path = path.as_ref();
        log::debug!("Reading credentials from {}", path.display());
        Self::check_permissions(path)?;
        let content = fs::read_to_string(path)?;
        Self::parse(&content).ok_or_else(|| {
            S2Error::Auth(format!(
                "credentials file {} must contain a username and a password",
                path.display()
            ))
        })
    }

    pub fn parse(content: &str) -> Option<Self> {
        let lines: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        let mut username = None;
        let mut password = None;
        for line in &lines {
            if let Some((key, value)) = line.split_once('=') {
                match key.trim().to_lowercase().as_str() {
                    "username" | "user" => username = Some(value.trim().to_string()),
                    "password" | "pass" => password = Some(value.trim().to_string()),
                    _ => {}
                }
            }
        }
        if username.is_none() && password.is_none() && lines.len() >= 2 {
            username = Some(lines[0].to_string());
            password = Some(lines[1].to_string());
        }

        match (username, password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(Self { username, password })
            }
            _ => None,
        }
    }

    #[cfg(unix)]
    fn check_permissions(path: &Path) -> S2Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)?.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(S2Error::Auth(format!(
                "insecure permissions on {}; run: chmod 600 {}",
                path.display(),
                path.display()
            )));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn check_permissions(_path: &Path) -> S2Result<()> {
        Ok(())
    }
}

/// Token endpoint response body
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
    refresh_token: Option<String>,
    #[serde(default)]
    refresh_expires_in: Option<i64>,
}

fn default_expires_in() -> i64 {
    3600
}

/// Access and refresh tokens with their absolute expiry times
#[derive(Debug, Clone)]
pub struct TokenCache {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_token: Option<String>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

impl TokenCache {
    fn from_response(resp: TokenResponse, now: DateTime<Utc>) -> Self {
        Self {
            access_token: resp.access_token,
            expires_at: now + ChronoDuration::seconds(resp.expires_in),
            refresh_token: resp.refresh_token,
            refresh_expires_at: resp
                .refresh_expires_in
                .map(|secs| now + ChronoDuration::seconds(secs)),
        }
    }

    pub fn access_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now + ChronoDuration::seconds(EXPIRY_MARGIN_SECS)
    }

    /// Refresh token usable at `now`, if any
    pub fn usable_refresh_token(&self, now: DateTime<Utc>) -> Option<&str> {
        match (&self.refresh_token, self.refresh_expires_at) {
            (Some(token), Some(exp)) if exp > now + ChronoDuration::seconds(EXPIRY_MARGIN_SECS) => {
                Some(token.as_str())
            }
            _ => None,
        }
    }
}

/// Obtains bearer tokens and keeps them fresh
pub struct Authenticator {
    auth_url: String,
    credentials: Credentials,
    client: reqwest::blocking::Client,
    timeout: Duration,
    cache: Mutex<Option<TokenCache>>,
}

impl Authenticator {
    pub fn new(auth_url: impl Into<String>, credentials: Credentials, timeout: Duration) -> S2Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| S2Error::Auth(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            auth_url: auth_url.into(),
            credentials,
            client,
            timeout,
            cache: Mutex::new(None),
        })
    }

    /// A valid access token, refreshing or re-authenticating when needed
    pub fn access_token(&self, force_refresh: bool) -> S2Result<String> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| S2Error::Auth("token cache lock poisoned".to_string()))?;
        let now = Utc::now();

        if let Some(tokens) = cache.as_ref() {
            if !force_refresh && tokens.access_valid(now) {
                return Ok(tokens.access_token.clone());
            }
            if let Some(refresh) = tokens.usable_refresh_token(now) {
                match self.grant(&[
                    ("client_id", CLIENT_ID),
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh),
                ]) {
                    Ok(resp) => {
                        log::debug!("Refreshed CDSE access token");
                        let fresh = TokenCache::from_response(resp, now);
                        let token = fresh.access_token.clone();
                        *cache = Some(fresh);
                        return Ok(token);
                    }
                    Err(e) => log::warn!("Token refresh failed ({}), falling back to password grant", e),
                }
            }
        }

        log::info!("Requesting CDSE access token for {}", self.credentials.username);
        let resp = self.grant(&[
            ("client_id", CLIENT_ID),
            ("grant_type", "password"),
            ("username", self.credentials.username.as_str()),
            ("password", self.credentials.password.as_str()),
        ])?;
        let fresh = TokenCache::from_response(resp, now);
        let token = fresh.access_token.clone();
        *cache = Some(fresh);
        Ok(token)
    }

    fn grant(&self, form: &[(&str, &str)]) -> S2Result<TokenResponse> {
        let response = self
            .client
            .post(&self.auth_url)
            .timeout(self.timeout)
            .form(form)
            .send()
            .map_err(|e| S2Error::Auth(format!("token request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(S2Error::Auth(format!(
                "token endpoint returned HTTP {}",
                response.status().as_u16()
            )));
        }
        response
            .json::<TokenResponse>()
            .map_err(|e| S2Error::Auth(format!("malformed token response: {}", e)))
    }
}
