use super::{
    assigner::SliceAssigner,
    predictor::{new_predictor, WatermarkPredictor},
    slice::{MapShape, Slice, SlicePin, SliceState},
    watermark::MultiOriginWatermarkProcessor,
};
use crate::memory::SequenceData;
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tidal_types::{config::SliceStoreConfig, query::OriginId};
use tracing::{debug, trace};

struct SliceEntry {
    slice: Arc<Slice>,
    state: SliceState,
}

struct StoreInner {
    /// Keyed by slice start, slices never overlap
    slices: BTreeMap<u64, SliceEntry>,
    /// Every window ending at or before this was emitted and no tuple of a
    /// slice ending at or before it is accepted anymore
    emitted_until: u64,
    next_sequence: u64,
}

impl StoreInner {
    /// The smallest window end that is not emitted yet and covers an
    /// existing slice.
    fn mark_closing(&mut self, watermark: u64) {
        for entry in self.slices.values_mut() {
            if entry.state == SliceState::Open && entry.slice.end() <= watermark {
                entry.state = SliceState::Closing;
            }
        }
    }

    fn next_deadline(&self, assigner: &SliceAssigner) -> Option<u64> {
        self.slices
            .values()
            .filter_map(|entry| {
                assigner
                    .windows_of(entry.slice.start(), entry.slice.end())
                    .map(|(_, end)| end)
                    .find(|&end| end > self.emitted_until)
            })
            .min()
    }
}

struct OriginPredictor {
    predictor: Box<dyn WatermarkPredictor>,
    observations: u64,
}

/// A window whose slices are all closing.
#[derive(Debug)]
pub struct ClosedWindow {
    pub start: u64,
    pub end: u64,
    /// The window's slices in ascending order
    pub slices: Vec<Arc<Slice>>,
}

/// Windows that became final when the watermark advanced, in order of
/// their end.
#[derive(Debug)]
pub struct TriggerBatch {
    pub watermark: u64,
    /// Position of this batch in the store's output stream, starting at 1
    pub sequence: u64,
    pub windows: Vec<ClosedWindow>,
}

impl TriggerBatch {
    /// Waits until no worker writes into any slice of the batch anymore.
    pub fn wait_for_writers(&self) {
        for window in &self.windows {
            for slice in &window.slices {
                slice.wait_for_writers();
            }
        }
    }
}

/// Counters of a slice store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SliceStoreStats {
    pub open_slices: usize,
    pub late_tuples: u64,
    pub triggers: u64,
    /// Triggers started because of a predicted rather than the actual
    /// watermark
    pub speculative_triggers: u64,
    pub emitted_windows: u64,
}

/// Time ordered slices of one window operator.
///
/// Creating, closing and evicting slices happens under one lock, tuples are
/// written into pinned slices without it. The watermark that closes slices
/// comes from a [`MultiOriginWatermarkProcessor`] fed with the metadata of
/// every processed buffer. Predictors may start a trigger early, but a slice
/// only closes once the actual watermark reached its end.
pub struct SliceStore {
    assigner: SliceAssigner,
    shapes: Vec<MapShape>,
    workers: usize,
    config: SliceStoreConfig,
    inner: Mutex<StoreInner>,
    watermarks: MultiOriginWatermarkProcessor,
    predictors: Mutex<HashMap<OriginId, OriginPredictor>>,
    late_tuples: AtomicU64,
    triggers: AtomicU64,
    speculative_triggers: AtomicU64,
    emitted_windows: AtomicU64,
}

impl SliceStore {
    pub fn new(
        assigner: SliceAssigner,
        shapes: Vec<MapShape>,
        origins: impl IntoIterator<Item = OriginId>,
        workers: usize,
        config: SliceStoreConfig,
    ) -> Self {
        let watermarks = MultiOriginWatermarkProcessor::new(origins);
        let predictors = watermarks
            .origins()
            .into_iter()
            .filter_map(|origin| {
                new_predictor(config.predictor).map(|predictor| {
                    (
                        origin,
                        OriginPredictor {
                            predictor,
                            observations: 0,
                        },
                    )
                })
            })
            .collect();

        Self {
            assigner,
            shapes,
            workers: workers.max(1),
            config,
            inner: Mutex::new(StoreInner {
                slices: BTreeMap::new(),
                emitted_until: 0,
                next_sequence: 1,
            }),
            watermarks,
            predictors: Mutex::new(predictors),
            late_tuples: AtomicU64::new(0),
            triggers: AtomicU64::new(0),
            speculative_triggers: AtomicU64::new(0),
            emitted_windows: AtomicU64::new(0),
        }
    }

    pub const fn assigner(&self) -> &SliceAssigner {
        &self.assigner
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pins the slice holding `ts`, creating it if needed. Returns `None`
    /// for late tuples, whose windows were already emitted.
    pub fn pin(&self, ts: u64) -> Option<SlicePin> {
        let (start, end) = self.assigner.slice(ts);
        let mut inner = self.lock();
        if end <= inner.emitted_until {
            drop(inner);
            self.late_tuples.fetch_add(1, Ordering::Relaxed);
            trace!("dropping late tuple at {ts}, slice [{start}, {end}) already closed");
            return None;
        }

        let entry = inner.slices.entry(start).or_insert_with(|| {
            trace!("creating slice [{start}, {end})");
            SliceEntry {
                slice: Arc::new(Slice::new(start, end, &self.shapes, self.workers, &self.config)),
                state: SliceState::Open,
            }
        });
        debug_assert_eq!(entry.slice.end(), end);
        Some(entry.slice.pin())
    }

    /// Applies the watermark of a processed buffer and returns the combined
    /// watermark, `None` if `origin` does not feed this store.
    pub fn observe(
        &self,
        origin: OriginId,
        sequence: SequenceData,
        watermark: u64,
        ingestion_ts: u64,
    ) -> Option<u64> {
        let combined = self.watermarks.update(origin, sequence, watermark)?;

        let mut predictors = self.predictors.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(state) = predictors.get_mut(&origin) {
            // Observations become exponentially rarer
            state.observations += 1;
            if state.observations.is_power_of_two() {
                state.predictor.observe(ingestion_ts, watermark);
            }
        }
        Some(combined)
    }

    pub fn current_watermark(&self) -> u64 {
        self.watermarks.current_watermark()
    }

    /// The lowest watermark predicted over all origins at `now`.
    pub fn predicted_watermark(&self, now: u64) -> Option<u64> {
        let predictors = self.predictors.lock().unwrap_or_else(|p| p.into_inner());
        if predictors.is_empty() {
            return None;
        }
        predictors
            .values()
            .map(|state| state.predictor.estimate(now))
            .try_fold(u64::MAX, |min, estimate| estimate.map(|estimate| min.min(estimate)))
    }

    /// Marks every slice that `watermark` passed as closing and collects the
    /// windows it finalizes.
    ///
    /// Returns `None` if no window is finalized: the watermark did not
    /// advance, or neither it nor the predicted watermark at `now` reach the
    /// end of the next pending window.
    pub fn trigger(&self, watermark: u64, now: u64) -> Option<TriggerBatch> {
        let mut inner = self.lock();
        if watermark <= inner.emitted_until {
            return None;
        }

        inner.mark_closing(watermark);

        let deadline = inner.next_deadline(&self.assigner);
        let reached = deadline.is_none_or(|deadline| watermark >= deadline);
        if !reached {
            let predicted = self.predicted_watermark(now);
            match (predicted, deadline) {
                (Some(predicted), Some(deadline)) if predicted >= deadline => {
                    self.speculative_triggers.fetch_add(1, Ordering::Relaxed);
                    trace!("predicted watermark {predicted} reaches {deadline}, checking early");
                }
                _ => return None,
            }
        }

        Some(self.collect(&mut inner, watermark))
    }

    /// Finalizes every remaining window, used when the operator stops.
    pub fn flush(&self) -> Option<TriggerBatch> {
        let mut inner = self.lock();
        if inner.emitted_until == u64::MAX {
            return None;
        }
        Some(self.collect(&mut inner, u64::MAX))
    }

    fn collect(&self, inner: &mut StoreInner, watermark: u64) -> TriggerBatch {
        let emitted_until = inner.emitted_until;

        inner.mark_closing(watermark);
        let mut ends = BTreeSet::new();
        for entry in inner.slices.values() {
            let (start, end) = (entry.slice.start(), entry.slice.end());
            for (window_start, window_end) in self.assigner.windows_of(start, end) {
                if emitted_until < window_end && window_end <= watermark {
                    ends.insert((window_end, window_start));
                }
            }
        }

        let windows: Vec<_> = ends
            .into_iter()
            .map(|(end, start)| ClosedWindow {
                start,
                end,
                slices: inner
                    .slices
                    .range(start..end)
                    .filter(|(_, entry)| entry.slice.end() <= end)
                    .map(|(_, entry)| entry.slice.clone())
                    .collect(),
            })
            .collect();

        inner.emitted_until = watermark;
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        self.triggers.fetch_add(1, Ordering::Relaxed);
        self.emitted_windows
            .fetch_add(windows.len() as u64, Ordering::Relaxed);
        debug!(
            "watermark {watermark} finalizes {} windows (batch {sequence})",
            windows.len(),
        );
        TriggerBatch {
            watermark,
            sequence,
            windows,
        }
    }

    /// Marks slices whose windows were all emitted as closed and evicts the
    /// closed slices nobody references anymore.
    pub fn finish(&self, batch: TriggerBatch) {
        drop(batch);
        let mut inner = self.lock();
        let emitted_until = inner.emitted_until;
        for entry in inner.slices.values_mut() {
            if entry.state == SliceState::Closing
                && emitted_until >= self.assigner.last_window_end(entry.slice.start())
            {
                entry.state = SliceState::Closed;
            }
        }

        let before = inner.slices.len();
        inner.slices.retain(|_, entry| {
            entry.state != SliceState::Closed || Arc::strong_count(&entry.slice) > 1
        });
        let evicted = before - inner.slices.len();
        if evicted != 0 {
            trace!("evicted {evicted} slices");
        }
    }

    /// `(start, end, state)` of every slice in ascending order.
    pub fn slices(&self) -> Vec<(u64, u64, SliceState)> {
        self.lock()
            .slices
            .values()
            .map(|entry| (entry.slice.start(), entry.slice.end(), entry.state))
            .collect()
    }

    pub fn late_tuples(&self) -> u64 {
        self.late_tuples.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SliceStoreStats {
        let open_slices = self
            .lock()
            .slices
            .values()
            .filter(|entry| entry.state == SliceState::Open)
            .count();
        SliceStoreStats {
            open_slices,
            late_tuples: self.late_tuples(),
            triggers: self.triggers.load(Ordering::Relaxed),
            speculative_triggers: self.speculative_triggers.load(Ordering::Relaxed),
            emitted_windows: self.emitted_windows.load(Ordering::Relaxed),
        }
    }

    /// Drops every slice, used when the operator is torn down without
    /// emitting its state.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.slices.clear();
        inner.emitted_until = u64::MAX;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::windowing::WindowType;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use tidal_types::config::WatermarkPredictorKind;

    fn store(window: WindowType, predictor: WatermarkPredictorKind) -> SliceStore {
        SliceStore::new(
            SliceAssigner::new(window),
            vec![MapShape::new(8, 8)],
            [OriginId(1), OriginId(2)],
            2,
            SliceStoreConfig {
                predictor,
                ..SliceStoreConfig::default()
            },
        )
    }

    fn add(store: &SliceStore, worker: usize, ts: u64, value: u64) -> bool {
        match store.pin(ts) {
            Some(pin) => {
                let map = unsafe { pin.slice().map_mut(0, worker) };
                let (slot, _) = map.find_or_insert(&0u64.to_le_bytes(), &0u64.to_le_bytes());
                let total = u64::from_le_bytes(slot[..8].try_into().unwrap()) + value;
                slot.copy_from_slice(&total.to_le_bytes());
                true
            }
            None => false,
        }
    }

    fn window_sum(window: &ClosedWindow) -> u64 {
        window
            .slices
            .iter()
            .flat_map(|slice| unsafe { slice.maps(0) })
            .flat_map(|map| map.entries())
            .map(|(_, value)| u64::from_le_bytes(value.try_into().unwrap()))
            .sum()
    }

    #[test]
    fn tumbling_window_closes_at_its_end() {
        let store = store(WindowType::Tumbling { size: 1000 }, WatermarkPredictorKind::None);
        assert!(add(&store, 0, 100, 1));
        assert!(add(&store, 1, 999, 2));
        assert!(add(&store, 0, 1000, 3));

        let watermark = store.observe(OriginId(1), SequenceData::single(1), 1000, 0);
        assert_eq!(watermark, Some(0));
        let watermark = store
            .observe(OriginId(2), SequenceData::single(1), 1000, 0)
            .unwrap();
        assert_eq!(watermark, 1000);

        let batch = store.trigger(watermark, 0).unwrap();
        assert_eq!(batch.sequence, 1);
        assert_eq!(batch.windows.len(), 1);
        assert_eq!((batch.windows[0].start, batch.windows[0].end), (0, 1000));
        batch.wait_for_writers();
        assert_eq!(window_sum(&batch.windows[0]), 3);
        store.finish(batch);

        assert_eq!(store.slices(), vec![(1000, 2000, SliceState::Open)]);
        assert!(store.trigger(watermark, 0).is_none());
        assert!(!add(&store, 0, 999, 1));
        assert_eq!(store.late_tuples(), 1);
    }

    #[test]
    fn sliding_slices_outlive_their_first_window() {
        let store = store(WindowType::Sliding { size: 10, slide: 5 }, WatermarkPredictorKind::None);
        for ts in [1, 6, 11] {
            add(&store, 0, ts, ts);
        }

        let batch = store.trigger(10, 0).unwrap();
        let windows: Vec<_> = batch
            .windows
            .iter()
            .map(|window| (window.start, window.end, window_sum(window)))
            .collect();
        assert_eq!(windows, vec![(0, 10, 7)]);
        store.finish(batch);
        // [5, 10) is still needed by [5, 15)
        assert_eq!(
            store.slices(),
            vec![
                (5, 10, SliceState::Closing),
                (10, 15, SliceState::Open),
            ]
        );

        let batch = store.trigger(15, 0).unwrap();
        assert_eq!(batch.windows.len(), 1);
        assert_eq!(window_sum(&batch.windows[0]), 17);
        store.finish(batch);
        assert_eq!(store.slices(), vec![(10, 15, SliceState::Closing)]);

        let batch = store.flush().unwrap();
        assert_eq!(
            batch
                .windows
                .iter()
                .map(|window| (window.start, window.end))
                .collect::<Vec<_>>(),
            vec![(10, 20)]
        );
        store.finish(batch);
        assert!(store.slices().is_empty());
        assert!(store.flush().is_none());
    }

    #[test]
    fn passed_slices_close_before_their_window_ends() {
        let store = store(WindowType::Sliding { size: 10, slide: 4 }, WatermarkPredictorKind::None);
        for ts in [1, 5, 9, 11, 13] {
            add(&store, 0, ts, 1);
        }
        let batch = store.trigger(10, 0).unwrap();
        store.finish(batch);

        // No window ends in (10, 13], the slice [10, 12) closes anyway
        assert!(store.trigger(13, 0).is_none());
        assert_eq!(
            store.slices(),
            vec![
                (4, 8, SliceState::Closing),
                (8, 10, SliceState::Closing),
                (10, 12, SliceState::Closing),
                (12, 14, SliceState::Open),
            ]
        );
        assert_eq!(store.stats().open_slices, 1);

        let batch = store.trigger(14, 0).unwrap();
        assert_eq!(
            batch.windows.iter().map(|window| (window.start, window.end)).collect::<Vec<_>>(),
            vec![(4, 14)]
        );
        store.finish(batch);
        assert_eq!(
            store.slices(),
            vec![
                (8, 10, SliceState::Closing),
                (10, 12, SliceState::Closing),
                (12, 14, SliceState::Closing),
            ]
        );
    }

    #[test]
    fn referenced_slices_are_not_evicted() {
        let store = store(WindowType::Tumbling { size: 10 }, WatermarkPredictorKind::None);
        add(&store, 0, 1, 1);
        let batch = store.trigger(10, 0).unwrap();
        let held = batch.windows[0].slices[0].clone();
        store.finish(batch);
        assert_eq!(store.slices(), vec![(0, 10, SliceState::Closed)]);
        drop(held);

        add(&store, 0, 15, 1);
        let batch = store.trigger(20, 0).unwrap();
        store.finish(batch);
        assert!(store.slices().is_empty());
    }

    #[test]
    fn predictions_start_checks_but_never_close() {
        let store = store(WindowType::Tumbling { size: 1000 }, WatermarkPredictorKind::Regression);
        add(&store, 0, 500, 1);
        // Both origins advance 1ms of watermark per ms of ingestion time
        for (sequence, ts) in (1..=8u64).zip((0..).step_by(100)) {
            for origin in [OriginId(1), OriginId(2)] {
                store.observe(origin, SequenceData::single(sequence), ts, ts);
            }
        }
        let watermark = store.current_watermark();
        assert_eq!(watermark, 700);

        let batch = store.trigger(watermark, 2_000).unwrap();
        assert!(batch.windows.is_empty());
        store.finish(batch);
        assert_eq!(store.stats().speculative_triggers, 1);
        assert_eq!(store.slices(), vec![(0, 1000, SliceState::Open)]);

        // Without a prediction reaching 1000 nothing happens
        assert!(store.trigger(800, 700).is_none());
    }

    proptest! {
        #[test]
        fn slices_never_close_early(
            tuples in prop::collection::vec(0u64..5_000, 1..60),
            watermarks in prop::collection::vec((0usize..2, 0u64..6_000, 0u64..100_000), 1..40),
            size in 1u64..800,
            slide_fraction in 1u64..=100,
            seed: u64,
            kalman: bool,
        ) {
            let slide = (size * slide_fraction / 100).max(1);
            let predictor = if kalman { WatermarkPredictorKind::Kalman } else { WatermarkPredictorKind::Regression };
            let store = store(WindowType::Sliding { size, slide }, predictor);

            let mut sequences = [0u64; 2];
            let mut updates: Vec<_> = watermarks
                .into_iter()
                .map(|(origin, watermark, ingestion)| {
                    sequences[origin] += 1;
                    (origin, sequences[origin], watermark, ingestion)
                })
                .collect();
            // Deliver updates out of order with adversarial ingestion times
            let mut state = seed | 1;
            for index in (1..updates.len()).rev() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                updates.swap(index, (state % (index as u64 + 1)) as usize);
            }

            let mut tuples = tuples.into_iter();
            let mut previous = 0;
            for (origin, sequence, watermark, ingestion) in updates {
                if let Some(ts) = tuples.next() {
                    add(&store, 0, ts, 1);
                }

                let combined = store
                    .observe(OriginId(origin as u64 + 1), SequenceData::single(sequence), watermark, ingestion)
                    .unwrap();
                prop_assert!(combined >= previous);
                previous = combined;

                if let Some(batch) = store.trigger(combined, ingestion) {
                    for window in &batch.windows {
                        prop_assert!(window.end <= combined);
                    }
                    store.finish(batch);
                }

                let actual = store.current_watermark();
                let slices = store.slices();
                for pair in slices.windows(2) {
                    prop_assert!(pair[0].1 <= pair[1].0, "overlapping slices {:?}", pair);
                }
                for (start, end, state) in slices {
                    prop_assert!(start < end);
                    if state != SliceState::Open {
                        prop_assert!(end <= actual, "[{start}, {end}) {state:?} at watermark {actual}");
                    }
                }
            }
        }
    }
}
