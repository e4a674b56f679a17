use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{Client, PiaError, Result};

pub const DIP_STATUS_ACTIVE: &str = "active";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DipRequest {
    #[serde(rename = "Tokens")]
    pub tokens: Vec<String>,
}

/// Assignment for a single dedicated IP token
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DipResponse {
    pub status: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub cn: String,
    /// Unix timestamp (seconds) at which the dedicated IP expires
    #[serde(default)]
    pub dip_expire: Option<i64>,
    #[serde(default)]
    pub id: String,
}

impl DipResponse {
    pub fn is_active(&self) -> bool {
        self.status == DIP_STATUS_ACTIVE
    }

    pub fn expires_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.dip_expire
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
    }
}

impl Client {
    /// Looks up the assignments for one or more dedicated IP tokens.
    /// An empty answer is an error.
    #[instrument(skip_all, fields(tokens = tokens.len()))]
    pub async fn get_dip(&self, tokens: &[String]) -> Result<Vec<DipResponse>> {
        let req = self
            .http()
            .post(&self.config.endpoints.dedicated_ip)
            .json(&DipRequest {
                tokens: tokens.to_vec(),
            });
        let res = self.authorize(req).await?.send().await?;

        if res.status() == StatusCode::UNAUTHORIZED {
            debug!("Token rejected, dropping it from the cache");
            self.config.cache.clear().await;
        }
        if !res.status().is_success() {
            return Err(PiaError::Status {
                request: "dedicated ip",
                status: res.status(),
            });
        }

        let dips: Vec<DipResponse> = res.json().await?;
        if dips.is_empty() {
            return Err(PiaError::NoDedicatedIps);
        }
        Ok(dips)
    }

    /// Resolves a single token. Tokens that are not `active` (expired, invalid)
    /// are rejected rather than returning a stale address.
    pub async fn dedicated_ip(&self, token: &str) -> Result<DipResponse> {
        let dip = self
            .get_dip(&[token.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or(PiaError::NoDedicatedIps)?;

        if !dip.is_active() {
            return Err(PiaError::DedicatedIpInactive { status: dip.status });
        }

        info!(ip = %dip.ip, cn = %dip.cn, "Resolved dedicated IP");
        Ok(dip)
    }
}
