use std::{net::SocketAddr, path::PathBuf};

pub const GENERATOR_IMAGE: &str =
    "unstoppablemango/pia-manual-connections:v0.2.0-pia2023-02-06r0";
pub const RESULTS_IMAGE: &str = "busybox:latest";
pub const WIREGUARD_IMAGE: &str = "lscr.io/linuxserver/wireguard:latest";

/// Container images used for the workloads the operator creates
#[derive(Debug, Clone)]
pub struct Images {
    /// Runs the PIA manual-connections scripts to produce a WireGuard config
    pub generator: String,
    /// Keeps the generated config around until the operator collects it
    pub results: String,
    /// WireGuard client run for each WireguardClient
    pub wireguard: String,
}

impl Default for Images {
    fn default() -> Self {
        Self {
            generator: GENERATOR_IMAGE.to_string(),
            results: RESULTS_IMAGE.to_string(),
            wireguard: WIREGUARD_IMAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub addr: SocketAddr,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct OperatorConfig {
    pub images: Images,
    /// The admission webhook only runs when TLS material is configured
    pub webhook: Option<WebhookConfig>,
}
