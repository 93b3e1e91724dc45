//! The request/response correlation engine.
//!
//! Objects are submitted in lots. Each physical message sent to the estimator is
//! registered under the correlation key of its last object; each reply is
//! matched through the key of its last record and accumulated into its lot
//! until the lot holds as many results as it had objects.

use std::{
    future::Future,
    pin::Pin,
    slice,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures::FutureExt;
use log::{debug, info, warn};
use tokio::{sync::oneshot, time};

use crate::{
    comms::Transport,
    error::{EstimatorErr, Result},
    msg::{Estimate, Inbound, Outbound, WorkItem},
    registry::{LotId, LotRegistry},
};

type Notifier<I> = oneshot::Sender<Result<Completion<I>>>;

/// Optional hook invoked with every completed lot, right before its handle resolves.
pub type OnComplete<I> = Box<dyn FnMut(&[Estimate], &I) + Send>;

/// The outcome of a completed lot.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion<I> {
    /// The lot's results, in arrival order.
    pub results: Vec<Estimate>,
    /// The context given on submission.
    pub info: I,
}

/// Resolves exactly once, when its lot completes or is retired without completing.
#[derive(Debug)]
pub struct LotHandle<I> {
    lot: LotId,
    rx: oneshot::Receiver<Result<Completion<I>>>,
}

impl<I> LotHandle<I> {
    pub fn lot(&self) -> LotId {
        self.lot
    }
}

impl<I> Future for LotHandle<I> {
    type Output = Result<Completion<I>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx
            .poll_unpin(cx)
            .map(|res| res.unwrap_or(Err(EstimatorErr::Shutdown)))
    }
}

/// Counters of the engine's activity.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EngineMetrics {
    pub messages_sent: u64,
    pub lots_submitted: u64,
    pub lots_completed: u64,
    pub control_messages: u64,
    pub unknown_keys: u64,
    pub duplicate_keys: u64,
    pub malformed_frames: u64,
    pub expired: u64,
    pub cancelled: u64,
}

struct Pending<I> {
    info: I,
    notify: Notifier<I>,
}

/// Tracks outstanding submissions and matches the estimator's replies back to them.
///
/// Every method takes `&mut self`: submission and delivery are expected to run
/// on the same task, one at a time.
pub struct Correlator<T, I = ()> {
    transport: T,
    registry: LotRegistry<Pending<I>>,
    on_complete: Option<OnComplete<I>>,
    lot_timeout: Option<Duration>,
    metrics: EngineMetrics,
}

impl<T: Transport, I> Correlator<T, I> {
    /// Creates a new `Correlator`.
    ///
    /// # Arguments
    /// * `transport` - The channel used to reach the estimator.
    ///
    /// # Returns
    /// A new `Correlator` instance with no pending lots.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            registry: LotRegistry::new(),
            on_complete: None,
            lot_timeout: None,
            metrics: EngineMetrics::default(),
        }
    }

    /// Creates a new `Correlator` that also reports every completion to `on_complete`.
    ///
    /// # Arguments
    /// * `transport` - The channel used to reach the estimator.
    /// * `on_complete` - Called with the lot's results and info, before its handle resolves.
    pub fn with_callback<F>(transport: T, on_complete: F) -> Self
    where
        F: FnMut(&[Estimate], &I) + Send + 'static,
    {
        let mut correlator = Self::new(transport);
        correlator.on_complete = Some(Box::new(on_complete));
        correlator
    }

    /// Sets how long a lot may wait for its results before `expire_stale` retires it.
    pub fn with_lot_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lot_timeout = timeout;
        self
    }

    /// Sends `items` to the estimator as a single lot.
    ///
    /// # Arguments
    /// * `items` - The objects to send, each must be correlatable.
    /// * `info` - Context handed back on completion.
    /// * `batched` - Whether to send all the objects in one message or one message per object.
    ///   Unbatched objects may be interleaved with other traffic at the estimator.
    ///
    /// # Returns
    /// A handle that resolves once all the lot's results arrived.
    ///
    /// # Errors
    /// `MalformedItem` if the lot is empty or any object is out of range, nothing is sent then.
    /// `Io` if the transport failed, the lot is discarded.
    pub fn submit(&mut self, items: &[WorkItem], info: I, batched: bool) -> Result<LotHandle<I>> {
        if items.is_empty() {
            return Err(EstimatorErr::MalformedItem {
                reason: "a lot needs at least one object".into(),
            });
        }

        items.iter().try_for_each(WorkItem::validate)?;

        let (notify, rx) = oneshot::channel();
        let pending = Pending { info, notify };
        let now = time::Instant::now().into_std();
        let lot = self.registry.new_lot(items.len(), pending, now);

        let sent = if batched {
            self.send(lot, items)
        } else {
            items
                .iter()
                .try_for_each(|item| self.send(lot, slice::from_ref(item)))
        };

        if let Err(e) = sent {
            warn!("failed to send {lot}, discarding it: {e}");
            self.registry.retire(lot);
            return Err(e);
        }

        self.metrics.lots_submitted += 1;
        debug!(lot = lot.get(), objects = items.len(), batched = batched; "submitted lot");

        Ok(LotHandle { lot, rx })
    }

    fn send(&mut self, lot: LotId, items: &[WorkItem]) -> Result<()> {
        let Some(last) = items.last() else {
            return Ok(());
        };

        // A message that never left must not take over another lot's key.
        self.transport.send(&Outbound::objects(items))?;
        self.metrics.messages_sent += 1;

        if let Err(e) = self.registry.register(last.key(), lot) {
            warn!("{e}");
            self.metrics.duplicate_keys += 1;
        }

        Ok(())
    }

    /// Handles a single message received from the estimator.
    ///
    /// Control messages are only logged. Results are appended to the lot waiting
    /// for the key of their last record, replies nobody waits for are dropped.
    pub fn on_delivery(&mut self, msg: Inbound) {
        match msg {
            Inbound::Control(ctrl) => {
                info!("received estimator message: {}", ctrl.kind);
                self.metrics.control_messages += 1;
            }
            Inbound::Results(records) => self.accept(records),
        }
    }

    /// Decodes a raw frame and handles it, malformed frames are logged and dropped.
    pub fn on_frame(&mut self, frame: &[u8]) {
        match Inbound::from_slice(frame) {
            Ok(msg) => self.on_delivery(msg),
            Err(e) => {
                warn!(
                    "failed to parse estimator frame {}: {e}",
                    String::from_utf8_lossy(frame)
                );
                self.metrics.malformed_frames += 1;
            }
        }
    }

    fn accept(&mut self, records: Vec<Estimate>) {
        let Some(key) = records.last().map(Estimate::key) else {
            warn!("received an empty estimator response");
            self.metrics.malformed_frames += 1;
            return;
        };

        let lot = match self.registry.lookup(&key) {
            Ok(lot) => lot,
            Err(e) => {
                warn!("discarding response: {e}");
                self.metrics.unknown_keys += 1;
                return;
            }
        };

        self.registry.remove(&key);

        let Some(entry) = self.registry.lot_mut(lot) else {
            return;
        };

        entry.accumulate(records);

        if entry.is_complete() {
            self.complete(lot);
        } else {
            debug!(
                lot = lot.get(), received = entry.accumulated().len(), expected = entry.expected();
                "lot still waiting for results"
            );
        }
    }

    fn complete(&mut self, lot: LotId) {
        let Some(entry) = self.registry.retire(lot) else {
            return;
        };

        let (results, Pending { info, notify }) = entry.into_parts();

        if let Some(on_complete) = self.on_complete.as_mut() {
            on_complete(&results, &info);
        }

        self.metrics.lots_completed += 1;
        debug!(lot = lot.get(), results = results.len(); "lot completed");

        if notify.send(Ok(Completion { results, info })).is_err() {
            debug!(lot = lot.get(); "lot handle was dropped before completion");
        }
    }

    /// Abandons a lot, its handle resolves with `Cancelled`.
    ///
    /// # Returns
    /// Whether the lot was still pending.
    pub fn cancel(&mut self, lot: LotId) -> bool {
        let found = self.retire_with(lot, EstimatorErr::Cancelled { lot });
        if found {
            self.metrics.cancelled += 1;
        }

        found
    }

    /// Retires every lot older than the lot timeout, their handles resolve with `Expired`.
    ///
    /// # Arguments
    /// * `now` - The current time.
    ///
    /// # Returns
    /// The amount of expired lots, always 0 if no timeout was configured.
    pub fn expire_stale(&mut self, now: Instant) -> usize {
        let Some(timeout) = self.lot_timeout else {
            return 0;
        };

        let stale = self.registry.stale(now, timeout);
        for &lot in &stale {
            warn!("{lot} got no response within {timeout:?}, expiring it");
            self.retire_with(lot, EstimatorErr::Expired { lot });
        }

        self.metrics.expired += stale.len() as u64;
        stale.len()
    }

    /// Retires every pending lot, their handles resolve with `Shutdown`.
    ///
    /// # Returns
    /// The amount of lots that were still pending.
    pub fn shutdown(&mut self) -> usize {
        let lots = self.registry.drain();
        let count = lots.len();

        for (_, entry) in lots {
            let (_, Pending { notify, .. }) = entry.into_parts();
            let _ = notify.send(Err(EstimatorErr::Shutdown));
        }

        if count > 0 {
            info!("shut down with {count} pending lot(s)");
        }

        count
    }

    fn retire_with(&mut self, lot: LotId, err: EstimatorErr) -> bool {
        let Some(entry) = self.registry.retire(lot) else {
            return false;
        };

        let (_, Pending { notify, .. }) = entry.into_parts();
        let _ = notify.send(Err(err));
        true
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn pending_keys(&self) -> usize {
        self.registry.pending_keys()
    }

    pub fn pending_lots(&self) -> usize {
        self.registry.pending_lots()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::FutureExt;
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;
    use crate::{comms::testing::RecordingTransport, msg::CorrelationKey};

    const RID: u8 = 33;

    fn item(cnt: u16) -> WorkItem {
        WorkItem::new(cnt, false, RID, vec![f32::from(cnt)])
    }

    fn reply(cnt: u16) -> Estimate {
        Estimate::point(cnt, false, RID, f32::from(cnt) * 10.0)
    }

    fn correlator() -> Correlator<RecordingTransport, &'static str> {
        Correlator::new(RecordingTransport::default())
    }

    #[test]
    fn batched_lot_is_one_message_and_keeps_reply_order() {
        let mut engine = correlator();
        let mut handle = engine
            .submit(&[item(0), item(1), item(2)], "abc", true)
            .unwrap();

        assert_eq!(engine.transport().sent.len(), 1);
        assert_eq!(engine.transport().sent[0].len(), 3);
        assert_eq!(engine.pending_keys(), 1);

        engine.on_delivery(Inbound::Results(vec![reply(0), reply(1), reply(2)]));

        let completion = (&mut handle).now_or_never().unwrap().unwrap();
        assert_eq!(completion.results, [reply(0), reply(1), reply(2)]);
        assert_eq!(completion.info, "abc");
        assert_eq!(engine.pending_lots(), 0);
        assert_eq!(engine.pending_keys(), 0);
        assert_eq!(engine.metrics().lots_completed, 1);
    }

    #[test]
    fn unbatched_lot_sends_each_object_but_completes_once() {
        let completions = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&completions);
        let mut engine = Correlator::with_callback(
            RecordingTransport::default(),
            move |results: &[Estimate], info: &u32| {
                seen.lock().unwrap().push((results.len(), *info));
            },
        );

        let handle = engine.submit(&[item(0), item(1), item(2)], 7, false).unwrap();
        let mut handle = task::spawn(handle);

        assert_eq!(engine.transport().sent.len(), 3);
        assert!(engine.transport().sent.iter().all(|msg| msg.len() == 1));
        assert_eq!(engine.pending_keys(), 3);

        engine.on_delivery(Inbound::Results(vec![reply(0)]));
        assert_pending!(handle.poll());

        engine.on_delivery(Inbound::Results(vec![reply(2)]));
        assert_pending!(handle.poll());

        engine.on_delivery(Inbound::Results(vec![reply(1)]));
        let completion = assert_ready!(handle.poll()).unwrap();

        // arrival order, not submission order
        assert_eq!(completion.results, [reply(0), reply(2), reply(1)]);
        assert_eq!(*completions.lock().unwrap(), [(3, 7)]);
        assert_eq!(engine.metrics().messages_sent, 3);
        assert_eq!(engine.metrics().lots_completed, 1);
    }

    #[test]
    fn completion_waits_for_the_expected_count() {
        let mut engine = correlator();
        let mut handle = task::spawn(engine.submit(&[item(4), item(5)], "", false).unwrap());

        engine.on_delivery(Inbound::Results(vec![reply(5)]));
        assert_pending!(handle.poll());
        assert_eq!(engine.pending_lots(), 1);

        engine.on_delivery(Inbound::Results(vec![reply(4)]));
        assert!(assert_ready!(handle.poll()).is_ok());
    }

    #[test]
    fn over_delivery_completes_with_every_record() {
        let mut engine = correlator();
        let mut handle = engine.submit(&[item(1)], "", true).unwrap();

        engine.on_delivery(Inbound::Results(vec![reply(0), reply(1)]));

        let completion = (&mut handle).now_or_never().unwrap().unwrap();
        assert_eq!(completion.results.len(), 2);
    }

    #[test]
    fn unknown_key_changes_nothing() {
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let mut engine =
            Correlator::with_callback(RecordingTransport::default(), move |_: &[Estimate], _: &()| {
                *counter.lock().unwrap() += 1;
            });

        let mut handle = task::spawn(engine.submit(&[item(0)], (), true).unwrap());
        engine.on_delivery(Inbound::Results(vec![reply(9)]));

        assert_pending!(handle.poll());
        assert_eq!(engine.pending_keys(), 1);
        assert_eq!(engine.pending_lots(), 1);
        assert_eq!(engine.metrics().unknown_keys, 1);
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn each_key_is_consumed_once() {
        let mut engine = correlator();
        let _handle = engine.submit(&[item(0), item(1)], "", false).unwrap();

        engine.on_delivery(Inbound::Results(vec![reply(0)]));
        engine.on_delivery(Inbound::Results(vec![reply(0)]));

        assert_eq!(engine.metrics().unknown_keys, 1);
        assert_eq!(engine.pending_keys(), 1);
        assert_eq!(engine.pending_lots(), 1);
    }

    #[test]
    fn reused_pending_key_abandons_the_first_lot() {
        let mut engine = correlator();
        let mut first = task::spawn(engine.submit(&[item(3)], "first", true).unwrap());
        let mut second = task::spawn(engine.submit(&[item(3)], "second", true).unwrap());

        assert_eq!(engine.metrics().duplicate_keys, 1);

        engine.on_delivery(Inbound::Results(vec![reply(3)]));

        let completion = assert_ready!(second.poll()).unwrap();
        assert_eq!(completion.info, "second");

        // a second reply finds no pending key, the first lot never completes
        engine.on_delivery(Inbound::Results(vec![reply(3)]));
        assert_pending!(first.poll());
        assert_eq!(engine.pending_lots(), 1);
        assert_eq!(engine.pending_keys(), 0);
        assert_eq!(engine.metrics().unknown_keys, 1);
    }

    #[test]
    fn malformed_submissions_are_not_sent() {
        let mut engine = correlator();

        let err = engine.submit(&[], "", true).unwrap_err();
        assert!(matches!(err, EstimatorErr::MalformedItem { .. }));

        let bad = WorkItem::new(1, false, 200, vec![]);
        let err = engine.submit(&[item(0), bad], "", false).unwrap_err();
        assert!(matches!(err, EstimatorErr::MalformedItem { .. }));

        assert!(engine.transport().sent.is_empty());
        assert_eq!(engine.pending_lots(), 0);
        assert_eq!(engine.pending_keys(), 0);
    }

    #[test]
    fn transport_failure_discards_the_lot() {
        let mut engine: Correlator<_, ()> = Correlator::new(RecordingTransport::failing_after(1));

        let err = engine.submit(&[item(0), item(1)], (), false).unwrap_err();

        assert!(matches!(err, EstimatorErr::Io(_)));
        assert_eq!(engine.transport().sent.len(), 1);
        assert_eq!(engine.pending_lots(), 0);
        assert_eq!(engine.pending_keys(), 0);
        assert_eq!(engine.metrics().lots_submitted, 0);
    }

    #[test]
    fn failed_submission_leaves_pending_keys_alone() {
        let mut engine = Correlator::new(RecordingTransport::failing_after(1));
        let mut first = task::spawn(engine.submit(&[item(3)], "first", true).unwrap());

        assert!(engine.submit(&[item(3)], "second", true).is_err());
        assert_eq!(engine.pending_lots(), 1);
        assert_eq!(engine.pending_keys(), 1);
        assert_eq!(engine.metrics().duplicate_keys, 0);

        engine.on_delivery(Inbound::Results(vec![reply(3)]));

        let completion = assert_ready!(first.poll()).unwrap();
        assert_eq!(completion.info, "first");
        assert_eq!(engine.metrics().unknown_keys, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lots_age_on_the_runtime_clock() {
        let mut engine = correlator().with_lot_timeout(Some(Duration::from_secs(1)));
        let _handle = engine.submit(&[item(0)], "", true).unwrap();

        time::advance(Duration::from_millis(999)).await;
        assert_eq!(engine.expire_stale(time::Instant::now().into_std()), 0);

        time::advance(Duration::from_millis(1)).await;
        assert_eq!(engine.expire_stale(time::Instant::now().into_std()), 1);
    }

    #[test]
    fn control_messages_are_ignored() {
        let mut engine = correlator();
        let mut handle = task::spawn(engine.submit(&[item(0)], "", true).unwrap());

        engine.on_frame(br#"{"type":"keepalive"}"#);

        assert_pending!(handle.poll());
        assert_eq!(engine.metrics().control_messages, 1);
        assert_eq!(engine.pending_keys(), 1);
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let mut engine = correlator();
        let _handle = engine.submit(&[item(0)], "", true).unwrap();

        engine.on_frame(b"{not json");
        engine.on_frame(b"[]");
        engine.on_frame(br#"[{"cnt":0}]"#);

        assert_eq!(engine.metrics().malformed_frames, 3);
        assert_eq!(engine.pending_keys(), 1);
    }

    #[test]
    fn frames_are_decoded_and_correlated() {
        let mut engine = correlator();
        let mut handle = engine.submit(&[item(2)], "", true).unwrap();

        engine.on_frame(br#"[{"cnt":2,"prob":false,"rid":33,"est":200}]"#);

        let completion = (&mut handle).now_or_never().unwrap().unwrap();
        assert_eq!(completion.results[0].est, Some(200.0));
        assert_eq!(completion.results[0].key(), CorrelationKey::new(2, false, RID));
    }

    #[test]
    fn stale_lots_expire_and_late_replies_are_unknown() {
        let mut engine = correlator().with_lot_timeout(Some(Duration::from_secs(1)));
        let mut handle = task::spawn(engine.submit(&[item(0)], "", true).unwrap());

        assert_eq!(engine.expire_stale(Instant::now()), 0);
        assert_pending!(handle.poll());

        assert_eq!(engine.expire_stale(Instant::now() + Duration::from_secs(2)), 1);
        assert!(matches!(
            assert_ready!(handle.poll()),
            Err(EstimatorErr::Expired { .. })
        ));

        engine.on_delivery(Inbound::Results(vec![reply(0)]));
        assert_eq!(engine.metrics().unknown_keys, 1);
        assert_eq!(engine.metrics().expired, 1);
    }

    #[test]
    fn lots_never_expire_without_a_timeout() {
        let mut engine = correlator();
        let _handle = engine.submit(&[item(0)], "", true).unwrap();

        assert_eq!(engine.expire_stale(Instant::now() + Duration::from_secs(3600)), 0);
        assert_eq!(engine.pending_lots(), 1);
    }

    #[test]
    fn cancel_resolves_the_handle() {
        let mut engine = correlator();
        let handle = engine.submit(&[item(0), item(1)], "", false).unwrap();
        let lot = handle.lot();
        let mut handle = task::spawn(handle);

        assert!(engine.cancel(lot));
        assert!(!engine.cancel(lot));
        assert!(matches!(
            assert_ready!(handle.poll()),
            Err(EstimatorErr::Cancelled { lot: l }) if l == lot
        ));
        assert_eq!(engine.pending_keys(), 0);
        assert_eq!(engine.metrics().cancelled, 1);
    }

    #[test]
    fn shutdown_resolves_every_pending_handle() {
        let mut engine = correlator();
        let mut a = task::spawn(engine.submit(&[item(0)], "", true).unwrap());
        let mut b = task::spawn(engine.submit(&[item(1)], "", true).unwrap());

        assert_eq!(engine.shutdown(), 2);
        assert!(matches!(assert_ready!(a.poll()), Err(EstimatorErr::Shutdown)));
        assert!(matches!(assert_ready!(b.poll()), Err(EstimatorErr::Shutdown)));
    }

    #[test]
    fn dropping_the_engine_resolves_handles() {
        let mut engine = correlator();
        let mut handle = task::spawn(engine.submit(&[item(0)], "", true).unwrap());

        drop(engine);
        assert!(matches!(assert_ready!(handle.poll()), Err(EstimatorErr::Shutdown)));
    }
}
