use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<ReconcileError>>),

    #[error("Config {0} has no configMapKeyRef or secretKeyRef set")]
    MissingConfigSource(String),

    #[error("Unable to read the generated config: {0}")]
    ExecError(String),

    #[error("The operator has encountered an error: {0}")]
    OperatorError(#[from] color_eyre::Report),
}
