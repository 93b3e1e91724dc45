use std::{
    collections::HashMap,
    fmt,
    time::{Duration, Instant},
};

use crate::{
    error::{EstimatorErr, Result},
    msg::{CorrelationKey, Estimate},
};

/// Process-local identifier of a lot, strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LotId(u64);

impl LotId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lot {}", self.0)
    }
}

/// A logical group of objects whose results are delivered together.
///
/// `T` is the owner's context, handed back once the lot is retired.
#[derive(Debug)]
pub struct Lot<T> {
    expected: usize,
    accumulated: Vec<Estimate>,
    keys: Vec<CorrelationKey>,
    created: Instant,
    context: T,
}

impl<T> Lot<T> {
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// The results received so far, in arrival order.
    pub fn accumulated(&self) -> &[Estimate] {
        &self.accumulated
    }

    pub fn context(&self) -> &T {
        &self.context
    }

    /// Appends `records` as received, never reordering them.
    pub fn accumulate(&mut self, records: Vec<Estimate>) {
        self.accumulated.extend(records);
    }

    pub fn is_complete(&self) -> bool {
        self.accumulated.len() >= self.expected
    }

    pub fn into_parts(self) -> (Vec<Estimate>, T) {
        (self.accumulated, self.context)
    }
}

/// Owns the in-flight lots and maps every pending correlation key to the lot awaiting it.
#[derive(Debug)]
pub struct LotRegistry<T> {
    next_id: u64,
    pending: HashMap<CorrelationKey, LotId>,
    lots: HashMap<LotId, Lot<T>>,
}

impl<T> Default for LotRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LotRegistry<T> {
    /// Creates a new, empty `LotRegistry`.
    pub fn new() -> Self {
        Self {
            next_id: 0,
            pending: HashMap::new(),
            lots: HashMap::new(),
        }
    }

    /// Allocates a fresh lot.
    ///
    /// # Arguments
    /// * `expected` - The amount of results that complete the lot.
    /// * `context` - The owner's context for this lot.
    /// * `now` - The creation time, used for expiration.
    ///
    /// # Returns
    /// The id of the new lot.
    pub fn new_lot(&mut self, expected: usize, context: T, now: Instant) -> LotId {
        let id = LotId(self.next_id);
        self.next_id += 1;

        let lot = Lot {
            expected,
            accumulated: Vec::with_capacity(expected),
            keys: Vec::new(),
            created: now,
            context,
        };

        self.lots.insert(id, lot);
        id
    }

    /// Maps `key` to `lot`.
    ///
    /// The mapping is always written, even when this returns an error: a key
    /// that was still pending is taken over by `lot` and the earlier lot loses
    /// that key for good.
    ///
    /// # Returns
    /// A `DuplicateKey` error naming the displaced lot if `key` was still pending.
    pub fn register(&mut self, key: CorrelationKey, lot: LotId) -> Result<()> {
        if let Some(entry) = self.lots.get_mut(&lot) {
            entry.keys.push(key);
        }

        match self.pending.insert(key, lot) {
            Some(displaced) if self.lots.contains_key(&displaced) => {
                Err(EstimatorErr::DuplicateKey { key, displaced })
            }
            _ => Ok(()),
        }
    }

    /// Finds the lot waiting for `key`.
    ///
    /// # Returns
    /// An `UnknownKey` error if no live lot is waiting for it.
    pub fn lookup(&self, key: &CorrelationKey) -> Result<LotId> {
        self.pending
            .get(key)
            .copied()
            .filter(|lot| self.lots.contains_key(lot))
            .ok_or(EstimatorErr::UnknownKey(*key))
    }

    /// Forgets `key`, it's fine if it wasn't pending.
    pub fn remove(&mut self, key: &CorrelationKey) {
        self.pending.remove(key);
    }

    pub fn lot(&self, id: LotId) -> Option<&Lot<T>> {
        self.lots.get(&id)
    }

    pub fn lot_mut(&mut self, id: LotId) -> Option<&mut Lot<T>> {
        self.lots.get_mut(&id)
    }

    /// Removes a lot together with every key still pointing at it.
    ///
    /// # Returns
    /// The retired lot, or `None` if it was already gone.
    pub fn retire(&mut self, id: LotId) -> Option<Lot<T>> {
        let lot = self.lots.remove(&id)?;

        for key in &lot.keys {
            if self.pending.get(key) == Some(&id) {
                self.pending.remove(key);
            }
        }

        Some(lot)
    }

    /// Lists the lots created at least `timeout` before `now`, oldest first.
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<LotId> {
        let mut ids: Vec<_> = self
            .lots
            .iter()
            .filter(|(_, lot)| now.saturating_duration_since(lot.created) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        ids.sort_unstable();
        ids
    }

    /// Retires every lot, oldest first.
    pub fn drain(&mut self) -> Vec<(LotId, Lot<T>)> {
        self.pending.clear();

        let mut lots: Vec<_> = self.lots.drain().collect();
        lots.sort_unstable_by_key(|(id, _)| *id);
        lots
    }

    pub fn contains_key(&self, key: &CorrelationKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending_keys(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_lots(&self) -> usize {
        self.lots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(cnt: u16) -> CorrelationKey {
        CorrelationKey::new(cnt, false, 33)
    }

    #[test]
    fn lot_ids_strictly_increase() {
        let mut registry = LotRegistry::new();
        let now = Instant::now();

        let a = registry.new_lot(1, (), now);
        let b = registry.new_lot(1, (), now);
        let c = registry.new_lot(1, (), now);

        assert!(a < b && b < c);
        assert_eq!(registry.lot(a).unwrap().accumulated().len(), 0);
        assert_eq!(registry.lot(c).unwrap().expected(), 1);
    }

    #[test]
    fn lookup_finds_registered_key() {
        let mut registry = LotRegistry::new();
        let lot = registry.new_lot(2, "info", Instant::now());

        registry.register(key(0), lot).unwrap();
        assert_eq!(registry.lookup(&key(0)).unwrap(), lot);
        assert_eq!(*registry.lot(lot).unwrap().context(), "info");
    }

    #[test]
    fn lookup_of_unknown_key_fails() {
        let registry = LotRegistry::<()>::new();
        assert!(matches!(
            registry.lookup(&key(9)),
            Err(EstimatorErr::UnknownKey(k)) if k == key(9)
        ));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut registry = LotRegistry::new();
        let lot = registry.new_lot(1, (), Instant::now());
        registry.register(key(1), lot).unwrap();

        registry.remove(&key(1));
        registry.remove(&key(1));

        assert!(!registry.contains_key(&key(1)));
        assert_eq!(registry.pending_lots(), 1);
    }

    #[test]
    fn duplicate_key_overwrites_and_reports_displaced_lot() {
        let mut registry = LotRegistry::new();
        let now = Instant::now();
        let first = registry.new_lot(1, (), now);
        let second = registry.new_lot(1, (), now);

        registry.register(key(3), first).unwrap();
        let err = registry.register(key(3), second).unwrap_err();

        assert!(matches!(
            err,
            EstimatorErr::DuplicateKey { displaced, .. } if displaced == first
        ));
        assert_eq!(registry.lookup(&key(3)).unwrap(), second);
    }

    #[test]
    fn retire_drops_only_keys_still_owned_by_the_lot() {
        let mut registry = LotRegistry::new();
        let now = Instant::now();
        let first = registry.new_lot(2, (), now);
        let second = registry.new_lot(1, (), now);

        registry.register(key(0), first).unwrap();
        registry.register(key(1), first).unwrap();
        let _ = registry.register(key(1), second);

        let lot = registry.retire(first).unwrap();
        assert_eq!(lot.expected(), 2);
        assert!(!registry.contains_key(&key(0)));
        assert_eq!(registry.lookup(&key(1)).unwrap(), second);
        assert!(registry.retire(first).is_none());
    }

    #[test]
    fn lot_completes_once_enough_results_accumulate() {
        let mut registry = LotRegistry::new();
        let lot = registry.new_lot(2, (), Instant::now());
        let entry = registry.lot_mut(lot).unwrap();

        entry.accumulate(vec![Estimate::point(1, false, 33, 1.0)]);
        assert!(!entry.is_complete());

        entry.accumulate(vec![Estimate::point(0, false, 33, 2.0)]);
        assert!(entry.is_complete());

        let cnts: Vec<_> = entry.accumulated().iter().map(|e| e.cnt).collect();
        assert_eq!(cnts, [1, 0]);
    }

    #[test]
    fn stale_lists_lots_past_the_timeout() {
        let mut registry = LotRegistry::new();
        let start = Instant::now();
        let old = registry.new_lot(1, (), start);
        let young = registry.new_lot(1, (), start + Duration::from_secs(5));

        let timeout = Duration::from_secs(10);
        assert!(registry.stale(start + Duration::from_secs(9), timeout).is_empty());
        assert_eq!(registry.stale(start + Duration::from_secs(12), timeout), [old]);
        assert_eq!(
            registry.stale(start + Duration::from_secs(20), timeout),
            [old, young]
        );
    }

    #[test]
    fn drain_empties_the_registry() {
        let mut registry = LotRegistry::new();
        let now = Instant::now();
        let a = registry.new_lot(1, 'a', now);
        let b = registry.new_lot(1, 'b', now);
        registry.register(key(0), a).unwrap();
        registry.register(key(1), b).unwrap();

        let drained: Vec<_> = registry.drain().into_iter().map(|(id, _)| id).collect();

        assert_eq!(drained, [a, b]);
        assert_eq!(registry.pending_keys(), 0);
        assert_eq!(registry.pending_lots(), 0);
    }
}
