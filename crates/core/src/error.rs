use std::path::PathBuf;

/// Errors raised by the migration core.
///
/// `NotFound` is not always a failure: inside the conditional-create path it
/// is the expected "doesn't exist yet" signal that selects the create branch.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The server answered with something other than a JSON document where a
    /// JSON document was required. The usual cause is a login page returned
    /// with HTTP 200 when credentials have expired.
    #[error("non-JSON response from {0}: authentication failure?")]
    Authentication(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    /// A create was rejected by the server. Carries the server-supplied
    /// detail message when one could be extracted from the error body.
    #[error("server rejected request (status {status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    #[error("failed to parse JSON: {0}")]
    Parse(serde_json::Error),
    #[error("failed to serialize record: {0}")]
    Serialization(serde_json::Error),
    #[error("I/O error: {0}")]
    Io(std::io::Error),
    #[error("record file not found: {0}")]
    MissingFile(PathBuf),
    #[error("failed to toggle system property: {0}")]
    PropertyToggle(String),
    /// A drug-order chain could not be sequenced: some order names a
    /// `previousOrder` that is absent from the set (never exported, voided,
    /// or part of a cycle).
    #[error("unresolvable order chain: {0}")]
    OrderChain(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
