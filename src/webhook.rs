//! Pod mutation webhook
//!
//! Pods annotated with `wireguard-operator.io/config: <name>` get the config generator
//! injected as an init container. The generated `pia0.conf` lands in the shared
//! `results` volume, which every app container sees read-only at `/out`.

use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, DynamicObject},
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    Client,
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::{Images, WebhookConfig},
    generator::{
        generator_container, results_mount, results_volume, INIT_CONTAINER, RESULTS_VOLUME,
    },
    ops::{WireguardConfig, CONFIG_ANNOTATION},
};

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Used to look up the WireguardConfig a pod asks for
    pub client: Client,
    pub images: Images,
}

/// Name of the WireguardConfig a pod asks for, if any
pub fn annotated_config(pod: &Pod) -> Option<&str> {
    pod.metadata
        .annotations
        .as_ref()?
        .get(CONFIG_ANNOTATION)
        .map(String::as_str)
        .filter(|name| !name.is_empty())
}

/// Returns a copy of `pod` with the config generator injected.
///
/// Injection is idempotent: an existing init container, volume or mount with the
/// same name is left alone.
pub fn inject_generator(pod: &Pod, config: &WireguardConfig, image: &str) -> Pod {
    let mut pod = pod.clone();
    let spec = pod.spec.get_or_insert_with(Default::default);

    let init_containers = spec.init_containers.get_or_insert_with(Vec::new);
    if !init_containers.iter().any(|c| c.name == INIT_CONTAINER) {
        init_containers.push(generator_container(INIT_CONTAINER, &config.spec, image));
    }

    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    if !volumes.iter().any(|v| v.name == RESULTS_VOLUME) {
        volumes.push(results_volume());
    }

    for container in spec.containers.iter_mut() {
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        if !mounts.iter().any(|m| m.name == RESULTS_VOLUME) {
            mounts.push(results_mount(true));
        }
    }

    pod
}

/// Builds the admission response patching `pod` into `mutated`
pub fn patch_response(
    request: &AdmissionRequest<Pod>,
    pod: &Pod,
    mutated: &Pod,
) -> AdmissionResponse {
    let (original, mutated) = match (serde_json::to_value(pod), serde_json::to_value(mutated)) {
        (Ok(original), Ok(mutated)) => (original, mutated),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Failed to serialize pod");
            return AdmissionResponse::from(request).deny(format!("serialization error: {e}"));
        }
    };

    let patch = json_patch::diff(&original, &mutated);
    debug!(ops = patch.0.len(), "Built pod patch");

    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Failed to serialize patch");
            AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
        }
    }
}

/// Handle mutating admission review for Pods
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<Pod> = match body.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(mutate_pod(&state, &request).await.into_review())
}

/// Name of the WireguardConfig a pod creation asks for.
///
/// Only CREATE requests are mutated; pod specs are immutable afterwards, so
/// injecting on UPDATE would produce a patch the API server rejects.
pub fn requested_config(request: &AdmissionRequest<Pod>) -> Option<&str> {
    if !matches!(request.operation, Operation::Create) {
        return None;
    }
    annotated_config(request.object.as_ref()?)
}

/// Decides the admission outcome for a pod asking for `config_name`.
///
/// `config` is the looked-up WireguardConfig, `None` when it does not exist.
pub fn admit(
    request: &AdmissionRequest<Pod>,
    config_name: &str,
    config: Option<&WireguardConfig>,
    image: &str,
) -> AdmissionResponse {
    let Some(pod) = &request.object else {
        return AdmissionResponse::from(request);
    };

    let Some(config) = config else {
        warn!(config = %config_name, "Requested config does not exist");
        return AdmissionResponse::from(request)
            .deny(format!("config '{config_name}' does not exist"));
    };

    info!(config = %config_name, "Injecting config generator");
    let mutated = inject_generator(pod, config, image);
    patch_response(request, pod, &mutated)
}

#[instrument(skip(state, request), fields(uid = %request.uid, operation = ?request.operation))]
async fn mutate_pod(state: &WebhookState, request: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let Some(config_name) = requested_config(request) else {
        debug!("Nothing to inject, allowing unchanged");
        return AdmissionResponse::from(request);
    };

    let namespace = request
        .namespace
        .clone()
        .or_else(|| request.object.as_ref()?.metadata.namespace.clone())
        .unwrap_or_else(|| "default".to_string());

    let configs: Api<WireguardConfig> = Api::namespaced(state.client.clone(), &namespace);
    match configs.get_opt(config_name).await {
        Ok(config) => admit(request, config_name, config.as_ref(), &state.images.generator),
        Err(e) => {
            error!(config = %config_name, %namespace, error = %e, "Failed to look up config");
            AdmissionResponse::from(request).deny(e.to_string())
        }
    }
}

pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate/pods", post(mutate_handler))
        .with_state(state)
}

/// Serves the webhook over TLS until the server fails
pub async fn serve(config: WebhookConfig, state: WebhookState) -> color_eyre::Result<()> {
    let tls_config = RustlsConfig::from_pem_file(&config.tls_cert, &config.tls_key).await?;

    info!(addr = %config.addr, "Starting pod webhook server");
    axum_server::bind_rustls(config.addr, tls_config)
        .serve(webhook_router(Arc::new(state)).into_make_service())
        .await?;

    Ok(())
}
