//! Wire types exchanged with the estimator microservice.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EstimatorErr, Result};

/// Largest request-class identifier the estimator accepts, `rid` is 7 bits wide.
pub const MAX_RID: u8 = 127;

/// The kind of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MsgKind {
    Object,
}

/// The identity used to match an estimator reply with the message that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey {
    pub cnt: u16,
    pub prob: bool,
    pub rid: u8,
}

impl CorrelationKey {
    pub fn new(cnt: u16, prob: bool, rid: u8) -> Self {
        Self { cnt, prob, rid }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.cnt, self.prob, self.rid)
    }
}

/// One unit of work submitted to the estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub cnt: u16,
    pub prob: bool,
    pub rid: u8,
    pub vars: Vec<f32>,
    #[serde(default)]
    pub reset: bool,
    #[serde(default)]
    pub uid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train: Option<f32>,
}

impl WorkItem {
    /// Creates a new prediction `WorkItem` with no training target.
    ///
    /// # Arguments
    /// * `cnt` - The producer's sequence number.
    /// * `prob` - Whether a probability vector is requested instead of a point estimate.
    /// * `rid` - The request-class identifier, at most `MAX_RID`.
    /// * `vars` - The feature vector.
    ///
    /// # Returns
    /// A new `WorkItem` instance.
    pub fn new(cnt: u16, prob: bool, rid: u8, vars: Vec<f32>) -> Self {
        Self {
            cnt,
            prob,
            rid,
            vars,
            reset: false,
            uid: 0,
            train: None,
        }
    }

    /// Sets the training target of this item.
    pub fn with_train(mut self, target: f32) -> Self {
        self.train = Some(target);
        self
    }

    pub fn key(&self) -> CorrelationKey {
        CorrelationKey::new(self.cnt, self.prob, self.rid)
    }

    /// Checks that the correlation fields are within the ranges the estimator accepts.
    ///
    /// # Returns
    /// A `MalformedItem` error if `rid` doesn't fit in 7 bits.
    pub fn validate(&self) -> Result<()> {
        if self.rid > MAX_RID {
            return Err(EstimatorErr::MalformedItem {
                reason: format!("rid {} of object {} exceeds {MAX_RID}", self.rid, self.cnt),
            });
        }

        Ok(())
    }
}

/// A single decoded reply from the estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub cnt: u16,
    pub prob: bool,
    pub rid: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub est: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ests: Option<Vec<f32>>,
}

impl Estimate {
    /// Creates a point estimate reply.
    pub fn point(cnt: u16, prob: bool, rid: u8, est: f32) -> Self {
        Self {
            cnt,
            prob,
            rid,
            est: Some(est),
            ests: None,
        }
    }

    /// Creates a probability-vector reply.
    pub fn distribution(cnt: u16, rid: u8, ests: Vec<f32>) -> Self {
        Self {
            cnt,
            prob: true,
            rid,
            est: None,
            ests: Some(ests),
        }
    }

    pub fn key(&self) -> CorrelationKey {
        CorrelationKey::new(self.cnt, self.prob, self.rid)
    }

    /// Odd sequence numbers acknowledge training requests.
    pub fn is_training(&self) -> bool {
        self.cnt % 2 == 1
    }
}

/// A message on its way to the estimator.
#[derive(Debug, Serialize)]
pub struct Outbound<'a> {
    #[serde(rename = "type")]
    pub kind: MsgKind,
    pub payload: &'a [WorkItem],
}

impl<'a> Outbound<'a> {
    pub fn objects(payload: &'a [WorkItem]) -> Self {
        Self {
            kind: MsgKind::Object,
            payload,
        }
    }
}

/// A status message from the estimator, e.g. a keep-alive.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Control {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// A message received from the estimator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    Control(Control),
    Results(Vec<Estimate>),
}

impl Inbound {
    /// Decodes a raw JSON frame.
    ///
    /// # Arguments
    /// * `frame` - The body of a frame received from the estimator.
    ///
    /// # Returns
    /// The decoded message or a `Json` error if it is neither a control message nor a result batch.
    pub fn from_slice(frame: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(frame)?)
    }
}
