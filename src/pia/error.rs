use thiserror::Error;

#[derive(Error, Debug)]
pub enum PiaError {
    #[error("PIA credentials are missing: set a token, or both a username and password")]
    MissingCredentials,

    #[error("HTTP Error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{request} request failed: {status}")]
    Status {
        request: &'static str,
        status: reqwest::StatusCode,
    },

    #[error("Unable to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("no ips in response")]
    NoDedicatedIps,

    #[error("dedicated ip is not active (status: {status})")]
    DedicatedIpInactive { status: String },

    #[error("region '{0}' is not in the server list")]
    UnknownRegion(String),

    #[error("Unable to connect to {ip}: {source}")]
    Probe {
        ip: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connecting to {ip} took longer than {timeout:?}")]
    ProbeTimeout {
        ip: String,
        timeout: std::time::Duration,
    },
}

pub type Result<T, E = PiaError> = std::result::Result<T, E>;
