use thiserror::Error;

/// Reference text could not be parsed. Never reaches the network layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed reference {input:?}: {reason}")]
    MalformedReference { input: String, reason: &'static str },
}

impl ParseError {
    pub(crate) fn malformed(input: &str, reason: &'static str) -> Self {
        ParseError::MalformedReference {
            input: input.to_string(),
            reason,
        }
    }
}

/// Failure reported by a registry gateway
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("registry unreachable: {0}")]
    Unreachable(String),
    #[error("invalid registry response: {0}")]
    InvalidResponse(String),
}

/// A load request could not be resolved to a manifest.
/// `CurrentIdentity` is never touched when this is reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("failed to connect to {registry}: {source}")]
    Connect {
        registry: String,
        #[source]
        source: GatewayError,
    },
    #[error("failed to fetch manifest for {reference}: {source}")]
    Fetch {
        reference: String,
        #[source]
        source: GatewayError,
    },
    #[error("manifest for {reference} does not match its digest (got {actual})")]
    DigestMismatch { reference: String, actual: String },
    #[error("failed to delete {reference}: {source}")]
    Delete {
        reference: String,
        #[source]
        source: GatewayError,
    },
}

/// A single referrer expansion failed; the traversal is abandoned
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to list referrers of {digest}: {source}")]
pub struct ReferrerTraversalError {
    pub digest: String,
    #[source]
    pub source: GatewayError,
}

/// The coordinator task is gone and can no longer accept requests
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("load coordinator has shut down")]
    Closed,
}
