use crate::memory::SequenceData;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};
use tidal_types::query::OriginId;

/// Chunks of one sequence number that arrived so far.
#[derive(Debug, Default, Clone, Copy)]
struct PendingSequence {
    arrived: u64,
    /// Chunk number of the last chunk, once it arrived
    last_chunk: Option<u64>,
    watermark: u64,
}

impl PendingSequence {
    fn is_complete(&self) -> bool {
        self.last_chunk == Some(self.arrived)
    }
}

#[derive(Debug)]
struct OriginState {
    origin: OriginId,
    next_sequence: u64,
    watermark: u64,
    pending: BTreeMap<u64, PendingSequence>,
}

impl OriginState {
    fn new(origin: OriginId) -> Self {
        Self {
            origin,
            next_sequence: 1,
            watermark: 0,
            pending: BTreeMap::new(),
        }
    }

    fn update(&mut self, sequence: SequenceData, watermark: u64) {
        if sequence.sequence < self.next_sequence {
            tracing::debug!(
                "ignoring stale watermark update for sequence {} of {}",
                sequence.sequence,
                self.origin,
            );
            return;
        }

        let pending = self.pending.entry(sequence.sequence).or_default();
        pending.arrived += 1;
        pending.watermark = pending.watermark.max(watermark);
        if sequence.last_chunk {
            pending.last_chunk = Some(sequence.chunk);
        }

        while let Some(next) = self.pending.get(&self.next_sequence) {
            if !next.is_complete() {
                break;
            }
            self.watermark = self.watermark.max(next.watermark);
            self.pending.remove(&self.next_sequence);
            self.next_sequence += 1;
        }
    }
}

/// Combines the watermarks of several origins.
///
/// Updates of one origin are applied in sequence number order. An update
/// that arrives ahead of its predecessors is held back until the gap is
/// filled, so the watermark of an origin only covers buffers that were all
/// seen. The combined watermark is the minimum over all origins and never
/// decreases.
#[derive(Debug)]
pub struct MultiOriginWatermarkProcessor {
    origins: Mutex<Vec<OriginState>>,
    current: AtomicU64,
}

impl MultiOriginWatermarkProcessor {
    pub fn new(origins: impl IntoIterator<Item = OriginId>) -> Self {
        let mut origins: Vec<_> = origins.into_iter().collect();
        origins.sort_unstable();
        origins.dedup();
        Self {
            origins: Mutex::new(origins.into_iter().map(OriginState::new).collect()),
            current: AtomicU64::new(0),
        }
    }

    pub fn origins(&self) -> Vec<OriginId> {
        self.lock().iter().map(|state| state.origin).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OriginState>> {
        self.origins.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records the watermark of one buffer and returns the combined
    /// watermark afterwards, `None` if `origin` is not tracked.
    pub fn update(&self, origin: OriginId, sequence: SequenceData, watermark: u64) -> Option<u64> {
        let mut origins = self.lock();
        let index = origins
            .binary_search_by_key(&origin, |state| state.origin)
            .ok()?;
        origins[index].update(sequence, watermark);

        let combined = origins
            .iter()
            .map(|state| state.watermark)
            .min()
            .unwrap_or(0);
        let previous = self.current.fetch_max(combined, Ordering::AcqRel);
        Some(previous.max(combined))
    }

    pub fn current_watermark(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// The applied watermark of every origin.
    pub fn origin_watermarks(&self) -> Vec<(OriginId, u64)> {
        self.lock()
            .iter()
            .map(|state| (state.origin, state.watermark))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rand::{seq::SliceRandom, SeedableRng};
    use std::{sync::Arc, thread};

    #[test]
    fn single_origin_in_order() {
        let processor = MultiOriginWatermarkProcessor::new([OriginId(0)]);
        for sequence in 1..=1000 {
            let before = processor.current_watermark();
            assert!(before < sequence);
            processor
                .update(OriginId(0), SequenceData::single(sequence), sequence)
                .unwrap();
            assert!(processor.current_watermark() <= sequence);
        }
        assert_eq!(processor.current_watermark(), 1000);
    }

    #[test]
    fn gaps_hold_back_later_sequences() {
        let processor = MultiOriginWatermarkProcessor::new([OriginId(1)]);
        assert_eq!(
            processor.update(OriginId(1), SequenceData::single(2), 20),
            Some(0)
        );
        assert_eq!(
            processor.update(OriginId(1), SequenceData::single(3), 30),
            Some(0)
        );
        assert_eq!(
            processor.update(OriginId(1), SequenceData::single(1), 10),
            Some(30)
        );
        assert_eq!(processor.update(OriginId(7), SequenceData::single(1), 10), None);
    }

    #[test]
    fn chunks_complete_a_sequence() {
        let processor = MultiOriginWatermarkProcessor::new([OriginId(1)]);
        processor.update(OriginId(1), SequenceData::new(1, 3, true), 50);
        processor.update(OriginId(1), SequenceData::new(1, 1, false), 40);
        assert_eq!(processor.current_watermark(), 0);
        processor.update(OriginId(1), SequenceData::new(1, 2, false), 45);
        assert_eq!(processor.current_watermark(), 50);
    }

    #[test]
    fn minimum_over_origins() {
        let processor = MultiOriginWatermarkProcessor::new([OriginId(1), OriginId(2)]);
        processor.update(OriginId(1), SequenceData::single(1), 100);
        assert_eq!(processor.current_watermark(), 0);
        processor.update(OriginId(2), SequenceData::single(1), 70);
        assert_eq!(processor.current_watermark(), 70);
        processor.update(OriginId(2), SequenceData::single(2), 300);
        assert_eq!(processor.current_watermark(), 100);
        assert_eq!(
            processor.origin_watermarks(),
            vec![(OriginId(1), 100), (OriginId(2), 300)]
        );
    }

    #[test]
    fn concurrent_updates() {
        let updates = 10_000u64;
        let threads = 4u64;
        let processor = Arc::new(MultiOriginWatermarkProcessor::new([OriginId(0)]));
        let handles: Vec<_> = (0..threads)
            .map(|thread_index| {
                let processor = processor.clone();
                thread::spawn(move || {
                    for sequence in (1..=updates * threads).filter(|s| s % threads == thread_index) {
                        processor.update(OriginId(0), SequenceData::single(sequence), sequence);
                        assert!(processor.current_watermark() <= updates * threads);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(processor.current_watermark(), updates * threads);
    }

    proptest! {
        #[test]
        fn combined_watermark_is_monotone_minimum(
            watermarks in prop::collection::vec(prop::collection::vec(0u64..1_000, 1..20), 1..5),
            seed: u64,
        ) {
            // Every origin's watermarks are sorted so that its last update
            // carries its maximum
            let origins: Vec<Vec<u64>> = watermarks
                .into_iter()
                .map(|mut updates| {
                    updates.sort_unstable();
                    updates
                })
                .collect();
            let processor = MultiOriginWatermarkProcessor::new(
                (0..origins.len() as u64).map(OriginId),
            );

            let mut updates: Vec<(u64, u64, u64)> = origins
                .iter()
                .enumerate()
                .flat_map(|(origin, updates)| {
                    updates
                        .iter()
                        .enumerate()
                        .map(move |(index, &watermark)| (origin as u64, index as u64 + 1, watermark))
                })
                .collect();
            updates.shuffle(&mut rand::rngs::StdRng::seed_from_u64(seed));

            let mut previous = 0;
            for (origin, sequence, watermark) in updates {
                let combined = processor
                    .update(OriginId(origin), SequenceData::single(sequence), watermark)
                    .unwrap();
                prop_assert!(combined >= previous);
                previous = combined;
            }

            let expected = origins.iter().map(|updates| *updates.last().unwrap()).min().unwrap();
            prop_assert_eq!(processor.current_watermark(), expected);
        }
    }
}
