use k8s_openapi::{
    api::core::v1::{ConfigMapKeySelector, EnvVar, EnvVarSource, SecretKeySelector},
    apimachinery::pkg::apis::meta::v1::Condition,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation that asks the pod webhook to inject a config generator
pub const CONFIG_ANNOTATION: &str = "wireguard-operator.io/config";
/// Label linking generator pods back to their WireguardConfig
pub const CONFIG_LABEL: &str = "wireguard-operator.io/config";

/// A credential given either literally or by reference to a ConfigMap or Secret key.
///
/// References are never resolved by the operator; they are handed to the kubelet
/// through `valueFrom` on the generated container.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<ConfigMapKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeySelector>,
}

impl ConfigValue {
    pub fn literal(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn has_value(&self) -> bool {
        self.value.as_deref().is_some_and(|v| !v.is_empty())
            || self.config_map_key_ref.is_some()
            || self.secret_key_ref.is_some()
    }

    /// Renders the value as an environment variable.
    /// A ConfigMap reference wins over a Secret reference, which wins over the literal.
    pub fn to_env_var(&self, name: &str) -> EnvVar {
        let value_from = if let Some(selector) = &self.config_map_key_ref {
            Some(EnvVarSource {
                config_map_key_ref: Some(selector.clone()),
                ..Default::default()
            })
        } else {
            self.secret_key_ref.as_ref().map(|selector| EnvVarSource {
                secret_key_ref: Some(selector.clone()),
                ..Default::default()
            })
        };

        EnvVar {
            name: name.to_string(),
            value: if value_from.is_some() {
                None
            } else {
                self.value.clone()
            },
            value_from,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, CustomResource, Clone, JsonSchema)]
#[kube(
    group = "wireguard-operator.io",
    version = "v1alpha1",
    kind = "WireguardConfig",
    singular = "wireguardconfig",
    root = "WireguardConfig",
    status = "WireguardConfigStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
/// WireguardConfig asks the operator to generate a PIA WireGuard config
/// and store it in a ConfigMap of the same name.
pub struct WireguardConfigSpec {
    /// PIA account username
    pub username: ConfigValue,
    /// PIA account password
    pub password: ConfigValue,
    /// Region id to connect to. If not provided, the lowest latency region is used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_region: Option<String>,
    /// Optional dedicated IP token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dip_token: Option<ConfigValue>,
    /// Only use regions that support port forwarding
    #[serde(default)]
    pub port_forward: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema)]
pub struct WireguardConfigStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Serialize, Deserialize, Debug, CustomResource, Clone, JsonSchema)]
#[kube(
    group = "wireguard-operator.io",
    version = "v1alpha1",
    kind = "WireguardClient",
    singular = "wireguardclient",
    root = "WireguardClient",
    status = "WireguardClientStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
/// WireguardClient runs the linuxserver.io WireGuard image with the referenced client configs.
pub struct WireguardClientSpec {
    /// User id the container runs as
    pub puid: i64,
    /// Group id the container runs as
    pub pgid: i64,
    /// Time zone, e.g. America/Chicago
    #[serde(default)]
    pub tz: String,
    /// Routes sent through the tunnel
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_confs: Option<bool>,
    /// Run the container with a read-only root filesystem
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    /// Client configs, each mounted at /config/<name>.conf
    #[serde(default)]
    pub configs: Vec<WireguardClientConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WireguardClientConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<WireguardClientConfigSource>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WireguardClientConfigSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<ConfigMapKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeySelector>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema)]
pub struct WireguardClientStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
