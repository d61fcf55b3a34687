use crate::core::retry::RetryPolicy;
use crate::types::{S2Error, S2Result};
use std::path::PathBuf;
use std::time::Duration;

/// CDSE OData catalogue root
pub const DEFAULT_CATALOGUE_URL: &str = "https://catalogue.dataspace.copernicus.eu/odata/v1";
/// CDSE node download root
pub const DEFAULT_DOWNLOAD_URL: &str = "https://download.dataspace.copernicus.eu";
/// CDSE OpenID Connect token endpoint
pub const DEFAULT_AUTH_URL: &str =
    "https://identity.dataspace.copernicus.eu/auth/realms/CDSE/protocol/openid-connect/token";

pub const DEFAULT_COLLECTION: &str = "SENTINEL-2";
pub const DEFAULT_PRODUCT_TYPE: &str = "S2MSI2A";
pub const DEFAULT_BANDS: [&str; 10] = [
    "B02", "B03", "B04", "B05", "B06", "B07", "B08", "B8A", "B11", "B12",
];

/// Endpoints, credentials and network behaviour for one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub catalogue_url: String,
    pub download_url: String,
    pub auth_url: String,
    /// Secret file holding `username` and `password`
    pub credentials_path: Option<PathBuf>,
    pub catalogue_timeout: Duration,
    pub download_timeout: Duration,
    /// `$top` page size for catalogue queries
    pub page_size: usize,
    pub catalogue_retry: RetryPolicy,
    pub download_retry: RetryPolicy,
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            catalogue_url: DEFAULT_CATALOGUE_URL.to_string(),
            download_url: DEFAULT_DOWNLOAD_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            credentials_path: None,
            catalogue_timeout: Duration::from_secs(60),
            download_timeout: Duration::from_secs(300),
            page_size: 200,
            catalogue_retry: RetryPolicy::catalogue(),
            download_retry: RetryPolicy::download(),
            user_agent: format!("s2pipe/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl PipelineConfig {
    /// Reject settings that would make every request fail
    pub fn validate(&self) -> S2Result<()> {
        for (name, url) in [
            ("catalogue", &self.catalogue_url),
            ("download", &self.download_url),
            ("auth", &self.auth_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(S2Error::Configuration(format!(
                    "{} URL must be http(s): {}",
                    name, url
                )));
            }
        }
        if self.page_size == 0 {
            return Err(S2Error::Configuration("page size must be at least 1".to_string()));
        }
        if self.catalogue_timeout.is_zero() || self.download_timeout.is_zero() {
            return Err(S2Error::Configuration("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn catalogue_url(&self) -> &str {
        self.catalogue_url.trim_end_matches('/')
    }

    pub fn download_url(&self) -> &str {
        self.download_url.trim_end_matches('/')
    }
}
