use crate::graph::TypeTag;

/// Failure kinds raised by the graph runtime.
///
/// Every fallible call returns `anyhow::Result`; callers that need to branch on
/// the kind use [`GraphError::of`] (or `downcast_ref`) on the returned error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("value ref {index} was not issued by this graph (store holds {len} values)")]
    InvalidHandle { index: u32, len: usize },

    #[error("expected value {index} to have type {expected}, got {actual} instead")]
    TypeMismatch {
        index: u32,
        expected: TypeTag,
        actual: TypeTag,
    },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("out of device memory: {0}")]
    OutOfDeviceMemory(String),

    #[error("binding contract violation for shader '{shader}': {reason}")]
    BindingContractViolation { shader: String, reason: String },

    #[error("shader '{0}' is not registered")]
    UnknownShader(String),

    #[error("host data for value {0} has already been released")]
    HostDataUnavailable(u32),

    #[error("graph has pending prepack nodes; call prepare() before execute()")]
    NotPrepared,

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

impl GraphError {
    /// Classify an `anyhow` error, looking through any attached context.
    pub fn of(err: &anyhow::Error) -> Option<&GraphError> {
        err.downcast_ref::<GraphError>()
    }

    /// Only memory pressure may be worth retrying after the host frees resources.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, GraphError::OutOfDeviceMemory(_))
    }

    pub(crate) fn binding(shader: &str, reason: impl Into<String>) -> Self {
        GraphError::BindingContractViolation {
            shader: shader.to_string(),
            reason: reason.into(),
        }
    }
}
