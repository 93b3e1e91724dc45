//! Predicts the next value of a sequence from its previous values.
//!
//! The features sent to the estimator are the last `depth` observed values.
//! Predictions and training requests share one sequence counter: the first
//! request is a prediction with `cnt == 0`, then they alternate, so even counts
//! are predictions and odd counts are training.

use std::{collections::VecDeque, num::NonZeroUsize, slice, time::Instant};

use log::{debug, error};

use crate::{
    comms::Transport,
    driver::Delivery,
    engine::Correlator,
    error::{EstimatorErr, Result},
    msg::{Estimate, Inbound, WorkItem},
};

/// Smallest value the predictor accepts.
pub const MIN_VALUE: u8 = 0;
/// Largest value the predictor accepts.
pub const MAX_VALUE: u8 = 2;

/// Spreads a value of the `MIN_VALUE..=MAX_VALUE` domain over the estimator's 0..=255 range.
///
/// # Returns
/// The mapped value or `OutOfRange`.
pub fn remap(value: u8) -> Result<f32> {
    match value {
        0 => Ok(64.0),
        1 => Ok(128.0),
        2 => Ok(192.0),
        value => Err(EstimatorErr::OutOfRange { value }),
    }
}

/// A decoded prediction.
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Point(f32),
    Distribution(Vec<f32>),
}

#[derive(Debug, Clone)]
pub struct PredictorConfig {
    /// The amount of previous values each request carries.
    pub depth: NonZeroUsize,
    /// Request probability vectors instead of point estimates.
    pub probabilistic: bool,
    pub uid: u32,
    pub rid: u8,
}

impl PredictorConfig {
    pub fn new(depth: NonZeroUsize, probabilistic: bool) -> Self {
        Self {
            depth,
            probabilistic,
            ..Self::default()
        }
    }
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            depth: NonZeroUsize::new(4).unwrap_or(NonZeroUsize::MIN),
            probabilistic: false,
            uid: 55,
            rid: 33,
        }
    }
}

/// A sequential prediction stream on top of a `Correlator`.
pub struct Predictor<T> {
    engine: Correlator<T>,
    config: PredictorConfig,
    history: VecDeque<u8>,
    cnt: u16,
    started: bool,
}

impl<T: Transport> Predictor<T> {
    /// Creates a new `Predictor`.
    ///
    /// # Arguments
    /// * `transport` - The channel used to reach the estimator, must already be open.
    /// * `config` - The predictor's configuration.
    /// * `on_prediction` - Receives every decoded prediction, or the error that prevented decoding it.
    ///   Training acknowledgements are not forwarded.
    ///
    /// # Returns
    /// A new `Predictor` with an empty history.
    pub fn new<F>(transport: T, config: PredictorConfig, mut on_prediction: F) -> Self
    where
        F: FnMut(Result<Prediction>) + Send + 'static,
    {
        let engine = Correlator::with_callback(transport, move |results: &[Estimate], _: &()| {
            match decode(results) {
                Ok(Some(prediction)) => on_prediction(Ok(prediction)),
                Ok(None) => {}
                Err(e) => {
                    error!("{e}");
                    on_prediction(Err(e));
                }
            }
        });

        Self {
            engine,
            history: VecDeque::with_capacity(config.depth.get()),
            config,
            cnt: 0,
            started: false,
        }
    }

    /// Sets how long a request may wait for its reply, see `Correlator::expire_stale`.
    pub fn with_lot_timeout(mut self, timeout: Option<std::time::Duration>) -> Self {
        self.engine = self.engine.with_lot_timeout(timeout);
        self
    }

    /// Pushes an actual value into the history, training the estimator with it
    /// if there is enough history to do so.
    ///
    /// The value is recorded even when the training request fails.
    ///
    /// # Returns
    /// Whether a training request was sent.
    ///
    /// # Errors
    /// `OutOfRange` if `value` is outside the domain, nothing changes then.
    /// `OutOfTurn` if a prediction was due instead. Every training request must
    /// follow a prediction, so a caller that only observes never trains.
    pub fn observe(&mut self, value: u8) -> Result<bool> {
        remap(value)?;

        let sent = self.send(Some(value));

        if self.history.len() >= self.config.depth.get() {
            self.history.pop_front();
        }
        self.history.push_back(value);

        sent
    }

    /// Requests a prediction of the next value.
    ///
    /// # Returns
    /// Whether a request was sent, `false` if there isn't enough history yet.
    ///
    /// # Errors
    /// `OutOfTurn` if a training request was due instead.
    pub fn predict(&mut self) -> Result<bool> {
        self.send(None)
    }

    fn send(&mut self, train: Option<u8>) -> Result<bool> {
        if self.history.len() < self.config.depth.get() {
            debug!(
                history = self.history.len(), depth = self.config.depth.get();
                "insufficient history, nothing sent"
            );
            return Ok(false);
        }

        let is_train = train.is_some();
        if (self.cnt % 2 == 1) != is_train {
            return Err(EstimatorErr::OutOfTurn {
                cnt: self.cnt,
                train: is_train,
            });
        }

        let vars = self
            .history
            .iter()
            .map(|&value| remap(value))
            .collect::<Result<Vec<_>>>()?;

        let item = WorkItem {
            cnt: self.cnt,
            prob: self.config.probabilistic,
            rid: self.config.rid,
            vars,
            reset: !self.started,
            uid: self.config.uid,
            train: train.map(f32::from),
        };

        // Predictions are reported through the completion callback.
        let _ = self.engine.submit(slice::from_ref(&item), (), true)?;

        // Only the correlation key wraps, the estimator is reset once.
        self.cnt = self.cnt.wrapping_add(1);
        self.started = true;
        Ok(true)
    }

    /// The observed values, oldest first.
    pub fn history(&self) -> impl Iterator<Item = u8> + '_ {
        self.history.iter().copied()
    }

    /// The sequence number of the next request.
    pub fn cnt(&self) -> u16 {
        self.cnt
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    pub fn engine(&self) -> &Correlator<T> {
        &self.engine
    }

    pub fn pending_lots(&self) -> usize {
        self.engine.pending_lots()
    }

    pub fn on_delivery(&mut self, msg: Inbound) {
        self.engine.on_delivery(msg);
    }

    /// Retires every pending request, see `Correlator::shutdown`.
    pub fn shutdown(&mut self) -> usize {
        self.engine.shutdown()
    }
}

impl<T: Transport> Delivery for Predictor<T> {
    fn on_frame(&mut self, frame: &[u8]) {
        self.engine.on_frame(frame);
    }

    fn expire_stale(&mut self, now: Instant) -> usize {
        self.engine.expire_stale(now)
    }
}

/// Decodes the results of a single request.
///
/// # Returns
/// The prediction, `None` for a training acknowledgement, or `MalformedEstimate`.
fn decode(results: &[Estimate]) -> Result<Option<Prediction>> {
    let [resp] = results else {
        return Err(EstimatorErr::MalformedEstimate {
            reason: format!("expected exactly one estimate, got {}", results.len()),
        });
    };

    if resp.is_training() {
        return Ok(None);
    }

    let prediction = if resp.prob {
        resp.ests.clone().map(Prediction::Distribution)
    } else {
        resp.est.map(Prediction::Point)
    };

    match prediction {
        Some(prediction) => Ok(Some(prediction)),
        None => Err(EstimatorErr::MalformedEstimate {
            reason: format!(
                "estimate {} has no `{}` field",
                resp.key(),
                if resp.prob { "ests" } else { "est" }
            ),
        }),
    }
}
