//! Orchestrator error types.

use thiserror::Error;

use crate::request::OrchestrationRequest;

/// Terminal failure of one orchestration request.
///
/// Timeouts, cancellation and provider failures all surface as one of these;
/// the cause is logged by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("failed to create resource: {request}")]
    ResourceCreationFailed { request: Box<OrchestrationRequest> },

    #[error("failed to delete resource: {request}")]
    ResourceDeletionFailed { request: Box<OrchestrationRequest> },
}

impl OrchestratorError {
    pub fn creation_failed(request: impl Into<OrchestrationRequest>) -> Self {
        OrchestratorError::ResourceCreationFailed {
            request: Box::new(request.into()),
        }
    }

    pub fn deletion_failed(request: impl Into<OrchestrationRequest>) -> Self {
        OrchestratorError::ResourceDeletionFailed {
            request: Box::new(request.into()),
        }
    }

    /// The request that failed.
    pub fn request(&self) -> &OrchestrationRequest {
        match self {
            OrchestratorError::ResourceCreationFailed { request }
            | OrchestratorError::ResourceDeletionFailed { request } => request,
        }
    }
}

/// Result type for awaited orchestration outcomes.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
