//! Feeds inbound frames and periodic expiration sweeps into an engine.

use std::time::{Duration, Instant};

use log::{debug, info};
use tokio::{
    sync::mpsc,
    time::{self, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{comms::Transport, engine::Correlator};

/// Something that consumes the estimator's frames.
pub trait Delivery {
    /// Handles one raw inbound frame.
    fn on_frame(&mut self, frame: &[u8]);

    /// Retires whatever outlived its timeout.
    ///
    /// # Returns
    /// The amount of retired lots.
    fn expire_stale(&mut self, now: Instant) -> usize;
}

impl<T: Transport, I> Delivery for Correlator<T, I> {
    fn on_frame(&mut self, frame: &[u8]) {
        Correlator::on_frame(self, frame);
    }

    fn expire_stale(&mut self, now: Instant) -> usize {
        Correlator::expire_stale(self, now)
    }
}

#[derive(Debug, PartialEq)]
pub enum Event {
    Frame(Vec<u8>),
    Sweep(Instant),
}

/// The event source of a single estimator connection.
///
/// The driver only borrows its sink when an event is dispatched, so the owner
/// may keep submitting between events.
pub struct Driver {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    sweep: Interval,
    cancel: CancellationToken,
}

impl Driver {
    /// Creates a new `Driver`.
    ///
    /// # Arguments
    /// * `inbound` - The queue of frames received from the estimator.
    /// * `sweep_every` - The period of the expiration sweeps.
    /// * `cancel` - Stops the driver once cancelled.
    pub fn new(
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        sweep_every: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let mut sweep = time::interval_at(time::Instant::now() + sweep_every, sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            inbound,
            sweep,
            cancel,
        }
    }

    /// Waits for the next event.
    ///
    /// # Returns
    /// `None` once cancelled or once the estimator connection closed.
    pub async fn next_event(&mut self) -> Option<Event> {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                debug!("driver cancelled");
                None
            }
            frame = self.inbound.recv() => {
                if frame.is_none() {
                    info!("estimator connection closed");
                }
                frame.map(Event::Frame)
            }
            tick = self.sweep.tick() => Some(Event::Sweep(tick.into_std())),
        }
    }

    /// Dispatches every event to `sink` until cancelled or disconnected.
    ///
    /// # Returns
    /// The amount of frames delivered.
    pub async fn run<D: Delivery>(mut self, sink: &mut D) -> usize {
        let mut frames = 0;

        while let Some(event) = self.next_event().await {
            if matches!(event, Event::Frame(_)) {
                frames += 1;
            }
            dispatch(sink, event);
        }

        frames
    }
}

/// Hands a single event to `sink`.
pub fn dispatch<D: Delivery>(sink: &mut D, event: Event) {
    match event {
        Event::Frame(frame) => sink.on_frame(&frame),
        Event::Sweep(now) => {
            let expired = sink.expire_stale(now);
            if expired > 0 {
                debug!(expired = expired; "sweep retired stale lots");
            }
        }
    }
}

/// Drives `sink` with the frames of `inbound` and periodic expiration sweeps.
///
/// # Arguments
/// * `sink` - The engine or predictor consuming the frames.
/// * `inbound` - The queue of frames received from the estimator.
/// * `sweep_every` - The period of the expiration sweeps.
/// * `cancel` - Stops the loop once cancelled.
///
/// # Returns
/// The amount of frames delivered.
pub async fn drive<D: Delivery>(
    sink: &mut D,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    sweep_every: Duration,
    cancel: CancellationToken,
) -> usize {
    Driver::new(inbound, sweep_every, cancel).run(sink).await
}
