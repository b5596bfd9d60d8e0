use thiserror::Error;

/// Startup/runtime configuration problems. Fatal: the process exits with code 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("missing required environment variable {0}")]
    MissingEnv(String),
}

/// Failure to turn a structured payload into bytes, or bytes back into one.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode value of type {type_tag}: {reason}")]
    Encode {
        type_tag: &'static str,
        reason: String,
    },

    #[error("failed to decode {byte_count} bytes: {reason}")]
    Decode { byte_count: usize, reason: String },
}

/// One schema violation: a JSON-pointer-ish field path plus a human reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

/// A payload failed validation against its declared schema.
#[derive(Debug, Error)]
#[error("validation failed for {entity_type} v{version}: {}", humanize(.errors))]
pub struct ValidationError {
    pub entity_type: String,
    pub version: i32,
    pub errors: Vec<FieldError>,
}

fn humanize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Bus-level failures: connect, publish, poll, commit.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("failed to poll {topic}: {reason}")]
    Poll { topic: String, reason: String },

    #[error("failed to commit offsets on {topic}: {reason}")]
    Commit { topic: String, reason: String },

    #[error("bus connection failed: {0}")]
    Connect(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Expected flow-control outcomes from the state mirror; not user-visible errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("node {0} not found")]
    NotFound(uuid::Uuid),

    #[error("node {0} already reserved")]
    AlreadyReserved(uuid::Uuid),

    #[error("node {0} has a conflicting stale write")]
    StaleConflict(uuid::Uuid),
}

/// Outcomes of a schedule attempt that never escape `schedule()`'s caller;
/// they are materialized into a retry or rejected envelope, never propagated as errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("no candidate nodes for model {model_id}")]
    NoCandidates { model_id: String },

    #[error("all {attempted} candidate reservations were lost to contention")]
    ReservationExhausted { attempted: usize },
}

impl SchedulingError {
    pub fn reason(&self) -> &'static str {
        match self {
            SchedulingError::NoCandidates { .. } => "no-candidates",
            SchedulingError::ReservationExhausted { .. } => "reservation-failed",
        }
    }
}
