//! WireGuard client deployment

use std::collections::BTreeMap;

use crate::{
    error::ReconcileError,
    ops::{WireguardClient, WireguardClientConfig, WireguardClientSpec},
};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Capabilities, ConfigMapKeySelector, ConfigMapVolumeSource, Container, ContainerPort,
            EnvVar, KeyToPath, PodSecurityContext, PodSpec, PodTemplateSpec, SeccompProfile,
            SecretKeySelector, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{api::ResourceExt, core::ObjectMeta, Resource};
use tracing::debug;

pub const WIREGUARD_CONTAINER: &str = "wireguard";
pub const WIREGUARD_PORT: i32 = 51820;
pub const CONFIG_DIR: &str = "/config";
pub const MANAGED_BY: &str = "WireguardClientController";

/// Labels shared by the deployment selector and its pod template.
/// The instance label keeps selectors of clients in one namespace apart.
pub fn client_labels(client_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "wireguard".to_string()),
        ("app.kubernetes.io/instance".to_string(), client_name.to_string()),
        ("app.kubernetes.io/version".to_string(), "latest".to_string()),
        ("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string()),
    ])
}

/// Where a client config comes from
enum ConfigSource<'a> {
    ConfigMap(&'a ConfigMapKeySelector),
    Secret(&'a SecretKeySelector),
}

impl ConfigSource<'_> {
    fn key(&self) -> &str {
        match self {
            ConfigSource::ConfigMap(selector) => &selector.key,
            ConfigSource::Secret(selector) => &selector.key,
        }
    }
}

/// Returns the source a client config is read from.
///
/// Arguments:
///
/// * `config`: one entry of `WireguardClientSpec::configs`. It must carry either a
/// `configMapKeyRef` or a `secretKeyRef`; a ConfigMap reference is preferred when both are set.
///
/// Returns:
///
/// the referenced source, or `ReconcileError::MissingConfigSource` when the entry has none.
fn config_source(config: &WireguardClientConfig) -> Result<ConfigSource<'_>, ReconcileError> {
    let source = config.value_from.as_ref();
    if let Some(selector) = source.and_then(|s| s.config_map_key_ref.as_ref()) {
        Ok(ConfigSource::ConfigMap(selector))
    } else if let Some(selector) = source.and_then(|s| s.secret_key_ref.as_ref()) {
        Ok(ConfigSource::Secret(selector))
    } else {
        Err(ReconcileError::MissingConfigSource(config.name.clone()))
    }
}

/// Builds the volume projecting a single client config key into the pod.
/// The volume is named after the config and the key keeps its own name as the file path.
pub fn config_volume(config: &WireguardClientConfig) -> Result<Volume, ReconcileError> {
    let source = config_source(config)?;
    let items = Some(vec![KeyToPath {
        key: source.key().to_string(),
        path: source.key().to_string(),
        mode: None,
    }]);

    let mut volume = Volume {
        name: config.name.clone(),
        ..Default::default()
    };
    match source {
        ConfigSource::ConfigMap(selector) => {
            volume.config_map = Some(ConfigMapVolumeSource {
                name: selector.name.clone(),
                items,
                ..Default::default()
            })
        }
        ConfigSource::Secret(selector) => {
            volume.secret = Some(SecretVolumeSource {
                secret_name: Some(selector.name.clone()),
                items,
                ..Default::default()
            })
        }
    }
    Ok(volume)
}

/// Mounts a client config at `/config/<name>.conf`
pub fn config_mount(config: &WireguardClientConfig) -> Result<VolumeMount, ReconcileError> {
    Ok(VolumeMount {
        name: config.name.clone(),
        mount_path: format!("{}/{}.conf", CONFIG_DIR, config.name),
        sub_path: Some(config_source(config)?.key().to_string()),
        ..Default::default()
    })
}

/// Environment understood by the linuxserver.io WireGuard image
pub fn client_env(spec: &WireguardClientSpec) -> Vec<EnvVar> {
    let mut vars = vec![
        ("PUID", spec.puid.to_string()),
        ("PGID", spec.pgid.to_string()),
        ("TZ", spec.tz.clone()),
        ("S6_READ_ONLY_ROOT", "1".to_string()),
    ];
    if !spec.allowed_ips.is_empty() {
        vars.push(("ALLOWEDIPS", spec.allowed_ips.join(",")));
    }
    if let Some(log_confs) = spec.log_confs {
        vars.push(("LOG_CONFS", log_confs.to_string()));
    }

    vars.into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value),
            value_from: None,
        })
        .collect()
}

/// This function creates the PodTemplateSpec for the WireGuard container.
///
/// Arguments:
///
/// * `name`: name of the owning WireguardClient, used for the pod labels
/// * `spec`: the `WireguardClientSpec` being reconciled. Its ids become the container's
/// user and group, and every entry in `configs` becomes a volume plus a mount.
/// * `image`: WireGuard image to run
///
/// Returns:
///
/// a `PodTemplateSpec` object, or an error if one of the configs has no source.
pub fn create_pod_template(
    name: &str,
    spec: &WireguardClientSpec,
    image: &str,
) -> Result<PodTemplateSpec, ReconcileError> {
    let volumes = spec
        .configs
        .iter()
        .map(config_volume)
        .collect::<Result<Vec<_>, _>>()?;
    let volume_mounts = spec
        .configs
        .iter()
        .map(config_mount)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(client_labels(name)),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(true),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            containers: vec![Container {
                name: WIREGUARD_CONTAINER.to_string(),
                image: Some(image.to_string()),
                env: Some(client_env(spec)),
                ports: Some(vec![ContainerPort {
                    container_port: WIREGUARD_PORT,
                    protocol: Some("UDP".to_string()),
                    ..Default::default()
                }]),
                volume_mounts: Some(volume_mounts),
                security_context: Some(SecurityContext {
                    capabilities: Some(Capabilities {
                        add: Some(vec!["NET_ADMIN".to_string()]),
                        drop: None,
                    }),
                    run_as_user: Some(spec.puid),
                    run_as_group: Some(spec.pgid),
                    run_as_non_root: Some(true),
                    read_only_root_filesystem: spec.read_only,
                    allow_privilege_escalation: Some(false),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
    })
}

/// The function creates the deployment for a WireguardClient, owned by that client.
///
/// Arguments:
///
/// * `client`: the `WireguardClient` resource. The deployment takes its name and namespace.
/// * `image`: WireGuard image to run
///
/// Returns:
///
/// a `Deployment` object.
pub fn create_owned_deployment(
    client: &WireguardClient,
    image: &str,
) -> Result<Deployment, ReconcileError> {
    let name = client.name_any();
    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: client.namespace(),
            labels: Some(client_labels(&name)),
            owner_references: client.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            template: create_pod_template(&name, &client.spec, image)?,
            selector: LabelSelector {
                match_labels: Some(client_labels(&name)),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    debug!(deployment = ?deployment.metadata.name, "Generated deployment");
    Ok(deployment)
}
