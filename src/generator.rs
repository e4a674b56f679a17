//! Config generator workloads
//!
//! The generator runs the PIA manual-connections scripts, which log in, pick a
//! region and write a WireGuard config to a shared `emptyDir`. The same container
//! is used as a standalone pod by the WireguardConfig reconciler and as an init
//! container by the pod webhook.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, Container, EmptyDirVolumeSource, EnvVar, Pod, PodSpec, Volume, VolumeMount,
};
use kube::{api::ResourceExt, core::ObjectMeta, Resource};

use crate::{
    config::Images,
    ops::{WireguardConfig, WireguardConfigSpec, CONFIG_LABEL},
};

pub const GENERATOR_CONTAINER: &str = "generate-config";
pub const INIT_CONTAINER: &str = "generate-wireguard-config";
pub const RESULTS_CONTAINER: &str = "results";
pub const RESULTS_VOLUME: &str = "results";
pub const RESULTS_MOUNT_PATH: &str = "/out";
pub const GENERATED_CONFIG_FILE: &str = "pia0.conf";
pub const GENERATED_CONFIG_PATH: &str = "/out/pia0.conf";

pub const APP_NAME: &str = "wireguard-operator";
pub const MANAGED_BY: &str = "WireguardConfigController";

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

/// Environment for the manual-connections scripts.
/// The order is stable so server-side apply sees no spurious changes.
pub fn generator_env(spec: &WireguardConfigSpec) -> Vec<EnvVar> {
    let preferred_region = spec
        .preferred_region
        .as_deref()
        .filter(|region| !region.is_empty());

    let mut vars = vec![
        spec.username.to_env_var("PIA_USER"),
        spec.password.to_env_var("PIA_PASS"),
        env("PIA_PF", if spec.port_forward { "true" } else { "false" }),
        env("PIA_CONNECT", "false"),
        env("PIA_CONF_PATH", GENERATED_CONFIG_PATH),
        env("VPN_PROTOCOL", "wireguard"),
        env("DISABLE_IPV6", "no"),
        match spec.dip_token.as_ref().filter(|token| token.has_value()) {
            Some(token) => token.to_env_var("DIP_TOKEN"),
            None => env("DIP_TOKEN", "no"),
        },
        env(
            "AUTOCONNECT",
            if preferred_region.is_some() { "false" } else { "true" },
        ),
    ];
    if let Some(region) = preferred_region {
        vars.push(env("PREFERRED_REGION", region));
    }
    vars
}

pub fn results_volume() -> Volume {
    Volume {
        name: RESULTS_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

pub fn results_mount(read_only: bool) -> VolumeMount {
    VolumeMount {
        name: RESULTS_VOLUME.to_string(),
        mount_path: RESULTS_MOUNT_PATH.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

pub fn generator_container(name: &str, spec: &WireguardConfigSpec, image: &str) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        env: Some(generator_env(spec)),
        volume_mounts: Some(vec![results_mount(false)]),
        ..Default::default()
    }
}

pub fn generator_pod_name(config_name: &str) -> String {
    format!("generate-{config_name}")
}

pub fn generator_labels(config_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), APP_NAME.to_string()),
        ("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string()),
        (CONFIG_LABEL.to_string(), config_name.to_string()),
    ])
}

/// Label selector matching the generator pods of one config
pub fn generator_selector(config_name: &str) -> String {
    generator_labels(config_name)
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Pod that generates the config and then idles so the result can be read back.
pub fn generator_pod(config: &WireguardConfig, images: &Images) -> Pod {
    let name = config.name_any();

    Pod {
        metadata: ObjectMeta {
            name: Some(generator_pod_name(&name)),
            namespace: config.namespace(),
            labels: Some(generator_labels(&name)),
            owner_references: config.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![
                generator_container(GENERATOR_CONTAINER, &config.spec, &images.generator),
                Container {
                    name: RESULTS_CONTAINER.to_string(),
                    image: Some(images.results.clone()),
                    command: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        "sleep infinity".to_string(),
                    ]),
                    volume_mounts: Some(vec![results_mount(true)]),
                    ..Default::default()
                },
            ],
            volumes: Some(vec![results_volume()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ConfigMap holding the generated config, named after and owned by the WireguardConfig
pub fn generated_config_map(config: &WireguardConfig, contents: String) -> ConfigMap {
    let name = config.name_any();

    ConfigMap {
        metadata: ObjectMeta {
            labels: Some(BTreeMap::from([(CONFIG_LABEL.to_string(), name.clone())])),
            name: Some(name),
            namespace: config.namespace(),
            owner_references: config.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(GENERATED_CONFIG_FILE.to_string(), contents)])),
        ..Default::default()
    }
}

/// Exit code of the generator container, once it has terminated
pub fn generator_exit_code(pod: &Pod) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|status| status.name == GENERATOR_CONTAINER)?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|terminated| terminated.exit_code)
}
