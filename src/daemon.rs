// Daemon module
// watches WireguardConfig and WireguardClient resources and reconciles what they own

/*
   notes:
   a WireguardConfig produces a ConfigMap holding a generated `pia0.conf`.
   the config itself is generated by the manual-connections scripts in a throwaway pod,
   so a reconcile is a small state machine: no pod -> create it, pod finished -> read
   the file back over exec, store it and delete the pod.

   a WireguardClient is just a Deployment running the wireguard image with the configs mounted.
*/

use std::{sync::Arc, time::Duration};

use futures::{future::BoxFuture, FutureExt, StreamExt};
use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{ConfigMap, Pod},
    },
    apimachinery::pkg::apis::meta::v1::Condition,
};
use kube::{
    api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, ResourceExt},
    runtime::{
        controller::Action,
        finalizer::{self, Event},
        watcher::{self, Config},
        Controller,
    },
    Client,
};
use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::OperatorConfig,
    deployment::{self, create_owned_deployment},
    error::ReconcileError,
    generator::{
        self, generated_config_map, generator_exit_code, generator_pod, generator_selector,
        GENERATED_CONFIG_PATH, RESULTS_CONTAINER,
    },
    ops::{WireguardClient, WireguardConfig, WireguardConfigSpec, CONFIG_LABEL},
    util::{
        find_status_condition, new_condition, set_status_condition, CONDITION_AVAILABLE,
        CONDITION_ERROR, CONDITION_GENERATING, REASON_RECONCILING, STATUS_FALSE, STATUS_TRUE,
        STATUS_UNKNOWN,
    },
    webhook,
};

pub const CLIENT_FINALIZER: &str = "wireguardclient.wireguard-operator.io/finalizer";

const OPERATOR_MANAGER: &str = "wireguard-operator";

const REASON_INVALID: &str = "Invalid";
const REASON_GENERATOR_FAILED: &str = "GeneratorFailed";

const GENERATOR_POLL: Duration = Duration::from_secs(15);
const GENERATOR_RETRY: Duration = Duration::from_secs(60);
const CLIENT_RESYNC: Duration = Duration::from_secs(3600);

// this is actually used to pass clients around
pub struct Context {
    pub client: Client,
    pub config: OperatorConfig,
}

/// What a WireguardConfig reconcile should do next, once we know there's no ConfigMap yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratorStep {
    /// The WireguardConfig can't produce a config until it is edited
    Invalid(String),
    /// No generator pod exists yet
    Create,
    /// The generator finished, read the config out of this pod
    Collect(String),
    /// The generator exited non-zero
    Failed { pod: String, exit_code: i32 },
    /// The generator is still running
    Wait,
}

fn validate_spec(spec: &WireguardConfigSpec) -> Result<(), String> {
    if !spec.username.has_value() {
        return Err("Configuration is missing username".to_string());
    }
    if !spec.password.has_value() {
        return Err("Configuration is missing password".to_string());
    }
    Ok(())
}

/// Decides the next generator step from the config and its current generator pods
pub fn plan_generator(spec: &WireguardConfigSpec, pods: &[Pod]) -> GeneratorStep {
    let Some(pod) = pods.first() else {
        return match validate_spec(spec) {
            Ok(()) => GeneratorStep::Create,
            Err(message) => GeneratorStep::Invalid(message),
        };
    };

    match generator_exit_code(pod) {
        Some(0) => GeneratorStep::Collect(pod.name_any()),
        Some(exit_code) => GeneratorStep::Failed {
            pod: pod.name_any(),
            exit_code,
        },
        None => GeneratorStep::Wait,
    }
}

fn namespace_of<K: ResourceExt>(obj: &K) -> Result<String, ReconcileError> {
    obj.namespace().ok_or_else(|| {
        ReconcileError::OperatorError(color_eyre::eyre::eyre!(
            "{} is missing a namespace",
            obj.name_any()
        ))
    })
}

async fn patch_conditions<K>(
    api: &Api<K>,
    name: &str,
    conditions: &[Condition],
) -> Result<(), ReconcileError>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    let patch = serde_json::json!({
        "status": {
            "conditions": conditions
        }
    });
    api.patch_status(
        name,
        &PatchParams::apply(OPERATOR_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Reads the generated config back out of the results container
#[instrument(skip(pods))]
async fn read_generated_config(pods: &Api<Pod>, pod_name: &str) -> Result<String, ReconcileError> {
    let params = AttachParams::default()
        .container(RESULTS_CONTAINER)
        .stdout(true)
        .stderr(false);
    let mut attached = pods
        .exec(pod_name, vec!["cat", GENERATED_CONFIG_PATH], &params)
        .await?;

    let mut stdout = attached
        .stdout()
        .ok_or_else(|| ReconcileError::ExecError("no stdout stream".to_string()))?;
    let mut contents = String::new();
    stdout
        .read_to_string(&mut contents)
        .await
        .map_err(|e| ReconcileError::ExecError(e.to_string()))?;
    drop(stdout);

    attached
        .join()
        .await
        .map_err(|e| ReconcileError::ExecError(e.to_string()))?;

    if contents.trim().is_empty() {
        return Err(ReconcileError::ExecError(format!(
            "{GENERATED_CONFIG_PATH} is empty"
        )));
    }
    Ok(contents)
}

/// Reconcile a WireguardConfig
#[instrument(skip(ctx, obj), fields(name = %obj.name_any()))]
async fn reconcile_configs(
    obj: Arc<WireguardConfig>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    info!("config reconcile request: {}", obj.name_any());

    let name = obj.name_any();
    let namespace = namespace_of(obj.as_ref())?;
    let configs: Api<WireguardConfig> = Api::namespaced(ctx.client.clone(), &namespace);
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &namespace);
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);

    let mut conditions = obj
        .status
        .as_ref()
        .map(|status| status.conditions.clone())
        .unwrap_or_default();

    if conditions.is_empty() {
        set_status_condition(
            &mut conditions,
            new_condition(
                CONDITION_AVAILABLE,
                STATUS_UNKNOWN,
                REASON_RECONCILING,
                "Starting reconciliation",
            ),
        );
        patch_conditions(&configs, &name, &conditions).await?;
    }

    if config_maps.get_opt(&name).await?.is_some() {
        debug!("Config map already exists");
        if set_status_condition(
            &mut conditions,
            new_condition(
                CONDITION_AVAILABLE,
                STATUS_TRUE,
                REASON_RECONCILING,
                "Config map exists",
            ),
        ) {
            patch_conditions(&configs, &name, &conditions).await?;
        }
        return Ok(Action::await_change());
    }

    let generator_pods = pods
        .list(&ListParams::default().labels(&generator_selector(&name)))
        .await?
        .items;

    let step = plan_generator(&obj.spec, &generator_pods);
    debug!(?step, "Planned generator step");

    let action = match step {
        GeneratorStep::Invalid(message) => {
            warn!(%message, "Invalid WireguardConfig");
            set_status_condition(
                &mut conditions,
                new_condition(CONDITION_ERROR, STATUS_TRUE, REASON_INVALID, &message),
            );
            Action::await_change()
        }
        GeneratorStep::Create => {
            let pod = generator_pod(&obj, &ctx.config.images);
            info!("Creating config generator pod {}", pod.name_any());
            pods.patch(
                &pod.name_any(),
                &PatchParams::apply(OPERATOR_MANAGER).force(),
                &Patch::Apply(&pod),
            )
            .await?;

            if find_status_condition(&conditions, CONDITION_ERROR).is_some() {
                set_status_condition(
                    &mut conditions,
                    new_condition(
                        CONDITION_ERROR,
                        STATUS_FALSE,
                        REASON_RECONCILING,
                        "Configuration is valid",
                    ),
                );
            }
            set_status_condition(
                &mut conditions,
                new_condition(
                    CONDITION_GENERATING,
                    STATUS_TRUE,
                    REASON_RECONCILING,
                    "Config generator script pod created",
                ),
            );
            Action::requeue(GENERATOR_POLL)
        }
        GeneratorStep::Collect(pod_name) => {
            let contents = read_generated_config(&pods, &pod_name).await?;
            let config_map = generated_config_map(&obj, contents);
            config_maps
                .patch(
                    &name,
                    &PatchParams::apply(OPERATOR_MANAGER).force(),
                    &Patch::Apply(&config_map),
                )
                .await?;
            info!("Stored generated config in config map {}", name);

            pods.delete(&pod_name, &DeleteParams::default()).await?;

            set_status_condition(
                &mut conditions,
                new_condition(
                    CONDITION_GENERATING,
                    STATUS_FALSE,
                    REASON_RECONCILING,
                    "Config generated",
                ),
            );
            set_status_condition(
                &mut conditions,
                new_condition(
                    CONDITION_AVAILABLE,
                    STATUS_TRUE,
                    REASON_RECONCILING,
                    "Config map created",
                ),
            );
            Action::await_change()
        }
        GeneratorStep::Failed { pod, exit_code } => {
            error!(%pod, exit_code, "Config generator failed");
            pods.delete(&pod, &DeleteParams::default()).await?;

            set_status_condition(
                &mut conditions,
                new_condition(
                    CONDITION_GENERATING,
                    STATUS_FALSE,
                    REASON_GENERATOR_FAILED,
                    "Config generator pod deleted",
                ),
            );
            set_status_condition(
                &mut conditions,
                new_condition(
                    CONDITION_ERROR,
                    STATUS_TRUE,
                    REASON_GENERATOR_FAILED,
                    &format!("Config generator exited with code {exit_code}"),
                ),
            );
            Action::requeue(GENERATOR_RETRY)
        }
        GeneratorStep::Wait => return Ok(Action::requeue(GENERATOR_POLL)),
    };

    patch_conditions(&configs, &name, &conditions).await?;
    Ok(action)
}

#[instrument(skip(ctx, client), fields(name = %client.name_any()))]
async fn apply_client(
    client: Arc<WireguardClient>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let namespace = namespace_of(client.as_ref())?;
    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);
    let clients: Api<WireguardClient> = Api::namespaced(ctx.client.clone(), &namespace);

    let deployment_data = create_owned_deployment(&client, &ctx.config.images.wireguard)?;
    let _deployment = deployments
        .patch(
            &deployment_data.name_any(),
            &PatchParams::apply(OPERATOR_MANAGER).force(),
            &Patch::Apply(&deployment_data),
        )
        .await?;

    tracing::trace!("deployment: {:?}", _deployment);

    let mut conditions = client
        .status
        .as_ref()
        .map(|status| status.conditions.clone())
        .unwrap_or_default();
    if set_status_condition(
        &mut conditions,
        new_condition(
            CONDITION_AVAILABLE,
            STATUS_TRUE,
            REASON_RECONCILING,
            &format!("Deployment for WireguardClient {} created", client.name_any()),
        ),
    ) {
        patch_conditions(&clients, &client.name_any(), &conditions).await?;
        info!("Patched status for WireguardClient {}", client.name_any());
    }

    Ok(Action::requeue(CLIENT_RESYNC))
}

/// Reconcile a WireguardClient
#[instrument(skip(ctx, obj), fields(name = %obj.name_any()))]
async fn reconcile_clients(
    obj: Arc<WireguardClient>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    info!("client reconcile request: {}", obj.name_any());

    let namespace = namespace_of(obj.as_ref())?;
    let clients: Api<WireguardClient> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer::finalizer(&clients, CLIENT_FINALIZER, obj, |event| async move {
        match event {
            Event::Apply(client) => apply_client(client, ctx).await,
            Event::Cleanup(client) => {
                // the deployment is garbage collected through its owner reference
                info!("Cleanup finalizer triggered for {}", client.name_any());
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(|e| ReconcileError::FinalizerError(Box::new(e)))
}

#[instrument(skip(_object, err, _ctx))]
fn error_policy_config(
    _object: Arc<WireguardConfig>,
    err: &ReconcileError,
    _ctx: Arc<Context>,
) -> Action {
    error!(err = ?err);
    Action::requeue(Duration::from_secs(5))
}

#[instrument(skip(_object, err, _ctx))]
fn error_policy_client(
    _object: Arc<WireguardClient>,
    err: &ReconcileError,
    _ctx: Arc<Context>,
) -> Action {
    error!(err = ?err);
    Action::requeue(Duration::from_secs(5))
}

/// Runs both controllers, and the pod webhook when it's configured.
/// Returns once the controllers stop on a shutdown signal.
#[instrument(skip(config))]
pub async fn run(config: OperatorConfig) -> color_eyre::Result<()> {
    let client = Client::try_default().await?;
    let context = Arc::new(Context {
        client: client.clone(),
        config: config.clone(),
    });

    let mut controllers: Vec<BoxFuture<'static, ()>> = vec![];
    let mut background: Vec<BoxFuture<'static, ()>> = vec![];

    info!("Starting reconcilers...");

    controllers.push(
        Controller::new(Api::<WireguardConfig>::all(client.clone()), Config::default())
            .owns(Api::<ConfigMap>::all(client.clone()), generated_config_watch())
            .owns(Api::<Pod>::all(client.clone()), generator_pod_watch())
            .shutdown_on_signal()
            .run(reconcile_configs, error_policy_config, context.clone())
            .for_each(|_| futures::future::ready(()))
            .boxed(),
    );

    controllers.push(
        Controller::new(Api::<WireguardClient>::all(client.clone()), Config::default())
            .owns(Api::<Deployment>::all(client.clone()), client_deployment_watch())
            .shutdown_on_signal()
            .run(reconcile_clients, error_policy_client, context)
            .for_each(|_| futures::future::ready(()))
            .boxed(),
    );

    if let Some(webhook_config) = config.webhook {
        let state = webhook::WebhookState {
            client,
            images: config.images,
        };
        background.push(
            async move {
                if let Err(e) = webhook::serve(webhook_config, state).await {
                    error!(?e, "Webhook server stopped");
                }
            }
            .boxed(),
        );
    } else {
        info!("No webhook TLS material configured, pod webhook disabled");
    }

    drive(controllers, background).await;
    info!("Controllers stopped, shutting down");

    Ok(())
}

/// Only generated ConfigMaps carry the config label
fn generated_config_watch() -> watcher::Config {
    watcher::Config::default().labels(CONFIG_LABEL)
}

fn generator_pod_watch() -> watcher::Config {
    watcher::Config::default().labels(&format!(
        "app.kubernetes.io/managed-by={}",
        generator::MANAGED_BY
    ))
}

fn client_deployment_watch() -> watcher::Config {
    watcher::Config::default().labels(&format!(
        "app.kubernetes.io/managed-by={}",
        deployment::MANAGED_BY
    ))
}

/// Runs `controllers` to completion while `background` tasks run alongside.
/// Background tasks are aborted once every controller has returned.
async fn drive(controllers: Vec<BoxFuture<'static, ()>>, background: Vec<BoxFuture<'static, ()>>) {
    let background: Vec<_> = background.into_iter().map(tokio::spawn).collect();

    futures::future::join_all(controllers).await;

    for task in background {
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ConfigValue;

    fn spec() -> WireguardConfigSpec {
        WireguardConfigSpec {
            username: ConfigValue::literal("user"),
            password: ConfigValue::literal("pass"),
            preferred_region: None,
            dip_token: None,
            port_forward: false,
        }
    }

    fn pod_with_state(state: serde_json::Value) -> Pod {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "generate-wg" },
            "status": {
                "containerStatuses": [{
                    "name": "generate-config", "image": "generator", "imageID": "",
                    "ready": false, "restartCount": 0,
                    "state": state
                }]
            }
        }))
        .unwrap()
    }

    #[test]
    fn no_pod_creates_generator() {
        assert_eq!(plan_generator(&spec(), &[]), GeneratorStep::Create);
    }

    #[test]
    fn missing_username_is_invalid() {
        let mut spec = spec();
        spec.username = ConfigValue::default();
        spec.password = ConfigValue::default();
        assert_eq!(
            plan_generator(&spec, &[]),
            GeneratorStep::Invalid("Configuration is missing username".to_string())
        );
    }

    #[test]
    fn missing_password_is_invalid() {
        let mut spec = spec();
        spec.password = ConfigValue::literal("");
        assert_eq!(
            plan_generator(&spec, &[]),
            GeneratorStep::Invalid("Configuration is missing password".to_string())
        );
    }

    #[test]
    fn running_generator_waits() {
        let pod = pod_with_state(serde_json::json!({ "running": {} }));
        assert_eq!(plan_generator(&spec(), &[pod]), GeneratorStep::Wait);
    }

    #[test]
    fn finished_generator_is_collected() {
        let pod = pod_with_state(serde_json::json!({ "terminated": { "exitCode": 0 } }));
        assert_eq!(
            plan_generator(&spec(), &[pod]),
            GeneratorStep::Collect("generate-wg".to_string())
        );
    }

    #[test]
    fn failed_generator_is_reported() {
        let pod = pod_with_state(serde_json::json!({ "terminated": { "exitCode": 1 } }));
        assert_eq!(
            plan_generator(&spec(), &[pod]),
            GeneratorStep::Failed {
                pod: "generate-wg".to_string(),
                exit_code: 1
            }
        );
    }

    #[test]
    fn existing_pod_is_inspected_even_if_spec_became_invalid() {
        let mut spec = spec();
        spec.username = ConfigValue::default();
        let pod = pod_with_state(serde_json::json!({ "running": {} }));
        assert_eq!(plan_generator(&spec, &[pod]), GeneratorStep::Wait);
    }

    #[test]
    fn owned_watches_are_label_filtered() {
        assert_eq!(
            generated_config_watch().label_selector.as_deref(),
            Some("wireguard-operator.io/config")
        );
        assert_eq!(
            generator_pod_watch().label_selector.as_deref(),
            Some("app.kubernetes.io/managed-by=WireguardConfigController")
        );
        assert!(client_deployment_watch()
            .label_selector
            .is_some_and(|selector| selector.starts_with("app.kubernetes.io/managed-by=")));
    }

    #[tokio::test]
    async fn background_tasks_stop_with_controllers() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = async move {
            let _tx = tx;
            futures::future::pending::<()>().await;
        }
        .boxed();

        tokio::time::timeout(
            Duration::from_secs(1),
            drive(vec![futures::future::ready(()).boxed()], vec![server]),
        )
        .await
        .expect("controllers finished but drive kept waiting");

        // the aborted task dropped its sender
        assert!(tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .is_err());
    }
}
