use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{Client, PiaError, Result};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub ip: String,
    pub cn: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub van: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Region {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub auto_region: bool,
    #[serde(default)]
    pub dns: String,
    #[serde(default)]
    pub port_forward: bool,
    #[serde(default)]
    pub geo: bool,
    #[serde(default)]
    pub offline: bool,
    /// Servers keyed by group name, e.g. `meta` or `wg`
    #[serde(default)]
    pub servers: BTreeMap<String, Vec<Server>>,
}

impl Region {
    /// First server of the given group, if the region has any
    pub fn first_server(&self, group: &str) -> Option<&Server> {
        self.servers.get(group).and_then(|servers| servers.first())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerGroup {
    pub name: String,
    #[serde(default)]
    pub ports: Vec<u16>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ServersResponse {
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<ServerGroup>>,
    #[serde(default)]
    pub regions: Vec<Region>,
}

impl ServersResponse {
    pub fn region(&self, id: &str) -> Option<&Region> {
        self.regions.iter().find(|region| region.id == id)
    }
}

/// Parses the server list body.
///
/// The endpoint appends a newline and a base64 signature after the JSON document,
/// so only the first line is decoded.
pub fn parse_server_list(body: &str) -> Result<ServersResponse> {
    let json = body.split_once('\n').map_or(body, |(json, _signature)| json);
    Ok(serde_json::from_str(json)?)
}

impl Client {
    /// Fetches every region and its servers from the directory endpoint.
    #[instrument(skip(self))]
    pub async fn servers(&self) -> Result<ServersResponse> {
        let res = self
            .http()
            .get(&self.config.endpoints.server_list)
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(PiaError::Status {
                request: "servers",
                status: res.status(),
            });
        }

        let body = res.text().await?;
        let servers = parse_server_list(&body)?;
        debug!(regions = servers.regions.len(), "Fetched server list");
        Ok(servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_LIST: &str = r#"{"groups":{"meta":[{"name":"meta","ports":[443,8080]}]},"regions":[{"id":"us_chicago","name":"US Chicago","country":"US","auto_region":true,"dns":"us-chicago.privacy.network","port_forward":false,"geo":false,"offline":false,"servers":{"meta":[{"ip":"212.102.59.54","cn":"chicago402"}],"wg":[{"ip":"212.102.59.2","cn":"chicago402"},{"ip":"212.102.59.3","cn":"chicago403","van":true}]}}]}
c2lnbmF0dXJlIGdvZXMgaGVyZQ=="#;

    #[test]
    fn ignores_trailing_signature() {
        let servers = parse_server_list(SERVER_LIST).unwrap();
        assert_eq!(servers.regions.len(), 1);

        let region = &servers.regions[0];
        assert_eq!(region.id, "us_chicago");
        assert!(region.auto_region);
        assert_eq!(region.first_server("meta").unwrap().ip, "212.102.59.54");
        assert_eq!(region.servers["wg"].len(), 2);
        assert!(region.servers["wg"][1].van);
        assert_eq!(servers.groups["meta"][0].ports, vec![443, 8080]);
    }

    #[test]
    fn parses_body_without_signature() {
        let servers = parse_server_list(r#"{"regions":[]}"#).unwrap();
        assert!(servers.regions.is_empty());
        assert!(servers.groups.is_empty());
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_server_list("not json\n{}").unwrap_err();
        assert!(matches!(err, PiaError::Decode(_)));
    }

    #[test]
    fn missing_group_has_no_first_server() {
        let servers = parse_server_list(SERVER_LIST).unwrap();
        assert_eq!(servers.regions[0].first_server("ikev2"), None);
        assert!(servers.region("us_chicago").is_some());
        assert!(servers.region("nowhere").is_none());
    }
}
