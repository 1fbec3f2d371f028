use thiserror::Error;

use crate::state::LifecycleState;
use crate::types::{ArtifactIdentity, ResourceKind};

pub type Result<T> = std::result::Result<T, DeployError>;

/// Failure of a reconciliation pass. Every variant aborts the pass.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("process registry: {0:#}")]
    Registry(#[source] anyhow::Error),

    #[error("state store: {0:#}")]
    StateStore(#[source] anyhow::Error),

    #[error("resource store: {0:#}")]
    ResourceStore(#[source] anyhow::Error),

    #[error("no batch action for transition {old} → {new}")]
    InvalidTransition {
        old: LifecycleState,
        new: LifecycleState,
    },

    #[error("batch returned {actual} result(s) for {expected} item(s)")]
    BatchResultCount { expected: usize, actual: usize },

    #[error("batch result kind {actual}, expected {expected}")]
    UnexpectedResourceKind {
        expected: ResourceKind,
        actual: String,
    },

    #[error("batch item {index} returned status {status}, expected one of {expected:?}")]
    UnexpectedStatus {
        index: usize,
        status: u16,
        expected: &'static [u16],
    },

    #[error("invalid location in batch result: {0}")]
    InvalidLocation(String),

    #[error("no payload available to write {0}")]
    MissingPayload(ArtifactIdentity),

    #[error("invalid process key '{0}', expected 'id|version'")]
    InvalidProcessKey(String),

    #[error("a reconciliation pass is already running")]
    PassInProgress,
}

impl DeployError {
    /// Protocol violations indicate a store that does not honour the batch
    /// contract, as opposed to an unreachable collaborator.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::BatchResultCount { .. }
                | Self::UnexpectedResourceKind { .. }
                | Self::UnexpectedStatus { .. }
                | Self::InvalidLocation(_)
        )
    }
}
