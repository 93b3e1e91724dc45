use std::{error::Error, fmt, io};

use crate::{msg::CorrelationKey, registry::LotId};

/// The estimator client's result type.
pub type Result<T> = std::result::Result<T, EstimatorErr>;

/// Failures of the correlation engine and the predictor.
#[derive(Debug)]
pub enum EstimatorErr {
    /// The transport rejected an outbound message.
    Io(io::Error),
    /// An inbound frame is not valid estimator JSON.
    Json(serde_json::Error),
    /// A submission can't be correlated, nothing was sent.
    MalformedItem { reason: String },
    /// A still pending key was reused, the earlier lot will never complete.
    DuplicateKey {
        key: CorrelationKey,
        displaced: LotId,
    },
    /// A reply matches no pending submission.
    UnknownKey(CorrelationKey),
    /// A predictor completion doesn't have the expected shape.
    MalformedEstimate { reason: String },
    /// A value outside of the predictor's domain.
    OutOfRange { value: u8 },
    /// The request kind doesn't match the parity of the sequence counter.
    OutOfTurn { cnt: u16, train: bool },
    /// The lot outlived the configured timeout.
    Expired { lot: LotId },
    /// The lot was abandoned by its owner.
    Cancelled { lot: LotId },
    /// The engine shut down before the lot completed.
    Shutdown,
    /// Invalid configuration, caught before connecting.
    InvalidConfig(String),
}

impl fmt::Display for EstimatorErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Json(e) => write!(f, "malformed estimator message: {e}"),
            Self::MalformedItem { reason } => write!(f, "malformed object: {reason}"),
            Self::DuplicateKey { key, displaced } => write!(
                f,
                "object {key} conflicts with a pending object of {displaced}"
            ),
            Self::UnknownKey(key) => write!(f, "estimator response object {key} is not pending"),
            Self::MalformedEstimate { reason } => write!(f, "malformed estimate: {reason}"),
            Self::OutOfRange { value } => write!(f, "history value {value} is out of range"),
            Self::OutOfTurn { cnt, train } => {
                let kind = if *train { "training" } else { "prediction" };
                write!(
                    f,
                    "a {kind} request can't take sequence number {cnt}, predictions are even and training is odd"
                )
            }
            Self::Expired { lot } => write!(f, "{lot} expired before its response arrived"),
            Self::Cancelled { lot } => write!(f, "{lot} was cancelled"),
            Self::Shutdown => write!(f, "the engine shut down before the lot completed"),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl Error for EstimatorErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EstimatorErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for EstimatorErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<EstimatorErr> for io::Error {
    fn from(value: EstimatorErr) -> Self {
        match value {
            EstimatorErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
