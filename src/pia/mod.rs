//! Client for the Private Internet Access API
//!
//! Covers the handful of endpoints the operator and its CLI need: token exchange,
//! dedicated IP lookup, the region directory, and picking the fastest region.

pub mod auth;
pub mod cache;
pub mod dip;
pub mod error;
pub mod latency;
pub mod regions;

use std::{sync::Arc, time::Duration};

pub use cache::TokenCache;
pub use dip::{DipRequest, DipResponse};
pub use error::{PiaError, Result};
pub use latency::{Latency, LatencyProbe, ProbeFailurePolicy, TcpProbe};
pub use regions::{Region, Server, ServerGroup, ServersResponse};

pub const TOKEN_URL: &str = "https://www.privateinternetaccess.com/api/client/v2/token";
pub const DEDICATED_IP_URL: &str =
    "https://www.privateinternetaccess.com/api/client/v2/dedicated_ip";
pub const SERVER_LIST_URL: &str = "https://serverlist.piaservers.net/vpninfo/servers/v6";

/// Value of `PREFERRED_REGION` that asks for latency based selection
pub const NO_PREFERRED_REGION: &str = "none";
/// Server group probed to estimate the latency of a whole region
pub const META_GROUP: &str = "meta";
pub const PROBE_PORT: u16 = 443;
/// Same default as `MAX_LATENCY` in the PIA manual-connections scripts
pub const DEFAULT_MAX_LATENCY: Duration = Duration::from_millis(50);
pub const DEFAULT_PROBE_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub token: String,
    pub dedicated_ip: String,
    pub server_list: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            token: TOKEN_URL.to_string(),
            dedicated_ip: DEDICATED_IP_URL.to_string(),
            server_list: SERVER_LIST_URL.to_string(),
        }
    }
}

impl Endpoints {
    /// Points every endpoint at the same base URL, keeping the upstream paths.
    /// Useful for mocks and proxies.
    pub fn with_base_url(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            token: format!("{base}/api/client/v2/token"),
            dedicated_ip: format!("{base}/api/client/v2/dedicated_ip"),
            server_list: format!("{base}/vpninfo/servers/v6"),
        }
    }
}

/// Everything a [`Client`] can be configured with.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Pre-issued API token. When set, the token endpoint is never called.
    pub token: Option<String>,
    /// Region id to use instead of the latency scan. `"none"` means no preference.
    pub preferred_region: Option<String>,
    /// Only consider regions that support port forwarding
    pub port_forward: bool,
    pub http: reqwest::Client,
    pub cache: Arc<TokenCache>,
    pub endpoints: Endpoints,
    pub probe_port: u16,
    /// Upper bound for a single connect probe. `None` waits for the OS to give up.
    pub probe_timeout: Option<Duration>,
    pub probe_concurrency: usize,
    pub failure_policy: ProbeFailurePolicy,
    pub representative_group: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            token: None,
            preferred_region: None,
            port_forward: false,
            http: reqwest::Client::new(),
            cache: Arc::new(TokenCache::default()),
            endpoints: Endpoints::default(),
            probe_port: PROBE_PORT,
            probe_timeout: Some(DEFAULT_MAX_LATENCY),
            probe_concurrency: DEFAULT_PROBE_CONCURRENCY,
            failure_policy: ProbeFailurePolicy::default(),
            representative_group: META_GROUP.to_string(),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl ClientConfig {
    pub fn static_token(&self) -> Option<&str> {
        non_empty(&self.token)
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        non_empty(&self.username).zip(non_empty(&self.password))
    }

    /// The configured preferred region, ignoring blanks and `"none"`
    pub fn preferred_region(&self) -> Option<&str> {
        non_empty(&self.preferred_region).filter(|r| !r.eq_ignore_ascii_case(NO_PREFERRED_REGION))
    }
}

/// Handle to the PIA API. Cheap to clone; clones share the HTTP pool and token cache.
#[derive(Debug, Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
}

impl Client {
    /// Builds a client, refusing configs that could never authenticate.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.static_token().is_none() && config.credentials().is_none() {
            return Err(PiaError::MissingCredentials);
        }
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn http(&self) -> &reqwest::Client {
        &self.config.http
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_config_without_credentials() {
        let err = Client::new(ClientConfig::default()).unwrap_err();
        assert!(matches!(err, PiaError::MissingCredentials));
    }

    #[test]
    fn rejects_username_without_password() {
        let config = ClientConfig {
            username: Some("user".into()),
            password: Some(String::new()),
            ..Default::default()
        };
        assert!(matches!(
            Client::new(config),
            Err(PiaError::MissingCredentials)
        ));
    }

    #[test]
    fn accepts_static_token_or_credentials() {
        let token = ClientConfig {
            token: Some("tok".into()),
            ..Default::default()
        };
        assert!(Client::new(token).is_ok());

        let creds = ClientConfig {
            username: Some("user".into()),
            password: Some("pass".into()),
            ..Default::default()
        };
        assert!(Client::new(creds).is_ok());
    }

    #[test]
    fn none_is_not_a_preferred_region() {
        let mut config = ClientConfig {
            preferred_region: Some("none".into()),
            ..Default::default()
        };
        assert_eq!(config.preferred_region(), None);

        config.preferred_region = Some("us_chicago".into());
        assert_eq!(config.preferred_region(), Some("us_chicago"));
    }

    #[test]
    fn base_url_keeps_upstream_paths() {
        let endpoints = Endpoints::with_base_url("http://127.0.0.1:8080/");
        assert_eq!(endpoints.token, "http://127.0.0.1:8080/api/client/v2/token");
        assert_eq!(endpoints.server_list, "http://127.0.0.1:8080/vpninfo/servers/v6");
    }
}
