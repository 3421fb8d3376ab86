use crate::adapters::AdapterError;
use crate::store::StoreError;

/// Client-facing error taxonomy.
///
/// Every error a request–response message (socket ack or HTTP shim) can
/// surface maps onto one of these kinds; `kind()` is the stable string that
/// goes over the wire. Asynchronous session faults never travel through this
/// type; they become `system:status/error` events on the run's log.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("not authenticated")]
    Unauthenticated,

    #[error("unknown run: {0}")]
    NotFound(String),

    #[error("no adapter registered for kind: {0}")]
    UnknownKind(String),

    #[error("capability not supported by this session: {0}")]
    CapabilityUnsupported(&'static str),

    #[error("session is not running: {0}")]
    SessionNotRunning(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Event-store write failure. Fatal to the session it hit.
    #[error("persistence failure: {0}")]
    Persistence(StoreError),

    /// Adapter `open`/`write`/`close` raised. Fatal to the session.
    #[error("adapter fault: {0}")]
    AdapterFault(AdapterError),
}

impl CoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Unauthenticated => "Unauthenticated",
            CoreError::NotFound(_) => "NotFound",
            CoreError::UnknownKind(_) => "UnknownKind",
            CoreError::CapabilityUnsupported(_) => "CapabilityUnsupported",
            CoreError::SessionNotRunning(_) => "SessionNotRunning",
            CoreError::InvalidInput(_) => "InvalidInput",
            CoreError::Persistence(_) => "Persistence",
            CoreError::AdapterFault(_) => "AdapterFault",
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => CoreError::NotFound(id),
            StoreError::SessionTerminated(id) => CoreError::SessionNotRunning(id),
            other => CoreError::Persistence(other),
        }
    }
}

impl From<AdapterError> for CoreError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Unsupported(cap) => CoreError::CapabilityUnsupported(cap),
            AdapterError::Invalid(msg) => CoreError::InvalidInput(msg),
            other => CoreError::AdapterFault(other),
        }
    }
}
