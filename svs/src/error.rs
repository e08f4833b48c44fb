use crate::name::Name;
use crate::tlv;

/// Errors surfaced by the sync protocol.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid state vector: {0}")]
    InvalidStateVector(#[source] tlv::Error),
    #[error("malformed mapping data: {0}")]
    MalformedMapping(#[source] tlv::Error),
    #[error("signature failure")]
    SignatureFailure,
    #[error("failed to register prefix {0}")]
    PrefixRegistrationFailed(Name),
    #[error("validation failed for {0}")]
    ValidationFailure(Name),
    #[error("fetch timed out for {0}")]
    FetchTimeout(Name),
    #[error("fetch nacked for {0}")]
    FetchNack(Name),
    #[error("segment assembly failed for {0}")]
    SegmentAssemblyFailure(Name),
    #[error("instance is shutting down")]
    Shutdown,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
