//! Client of a remote online estimator.
//!
//! Objects are sent to the estimator in lots and its replies are correlated back
//! to the lot that asked for them (`engine`). On top of that, `predictor` turns a
//! stream of observed values into alternating prediction and training requests.

pub mod comms;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod msg;
pub mod predictor;
pub mod registry;

pub use config::ClientConfig;
pub use driver::{Delivery, Driver};
pub use engine::{Completion, Correlator, LotHandle};
pub use error::{EstimatorErr, Result};
pub use msg::{CorrelationKey, Estimate, Inbound, WorkItem};
pub use predictor::{Prediction, Predictor, PredictorConfig};
pub use registry::LotId;
