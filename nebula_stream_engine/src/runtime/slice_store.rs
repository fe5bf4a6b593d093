// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Time-sliced window state with watermark bookkeeping.
//!
//! A slice is the minimal time range any window over the same descriptor can be composed
//! from; slices are slide-aligned, non-overlapping, and ordered. The store tracks three
//! watermark quantities per §time: the per-origin watermark minimum (`min_watermark`), the
//! last triggered position (`last_watermark`), and the maximum observed event time
//! (`all_max_ts`). Late records, whose timestamp is at or below the last triggered
//! position, are dropped and counted.

use std::collections::BTreeMap;

use crate::catalog::OriginId;
use crate::plan::operator::WindowDescriptor;

/// One time slice holding operator-specific state: a partial aggregate for aggregation
/// stores, an append list of records for join stores.
#[derive(Clone, Debug)]
pub struct Slice<S> {
    start: u64,
    end: u64,
    state: S,
}

impl<S> Slice<S> {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }
}

#[derive(Debug)]
pub struct SliceStore<S> {
    window: WindowDescriptor,
    /// Ordered by start; starts are unique and ranges never overlap.
    slices: Vec<Slice<S>>,
    origin_watermarks: BTreeMap<OriginId, u64>,
    origin_max_ts: BTreeMap<OriginId, u64>,
    last_watermark: u64,
    first_observed: Option<u64>,
    late_records: u64,
}

impl<S> SliceStore<S> {
    pub fn new(window: WindowDescriptor) -> Self {
        Self {
            window,
            slices: Vec::new(),
            origin_watermarks: BTreeMap::new(),
            origin_max_ts: BTreeMap::new(),
            last_watermark: 0,
            first_observed: None,
            late_records: 0,
        }
    }

    pub fn window(&self) -> &WindowDescriptor {
        &self.window
    }

    pub fn slices(&self) -> &[Slice<S>] {
        &self.slices
    }

    pub fn late_records(&self) -> u64 {
        self.late_records
    }

    pub fn last_watermark(&self) -> u64 {
        self.last_watermark
    }

    /// Minimum watermark across all origins seen so far; zero before any update.
    pub fn min_watermark(&self) -> u64 {
        self.origin_watermarks.values().copied().min().unwrap_or(0)
    }

    /// Maximum event timestamp observed across all origins.
    pub fn all_max_ts(&self) -> u64 {
        self.origin_max_ts.values().copied().max().unwrap_or(0)
    }

    pub fn first_observed(&self) -> Option<u64> {
        self.first_observed
    }

    /// The slice covering `ts`, created on demand; `None` when the record is late.
    pub fn slice_for_insert(
        &mut self,
        ts: u64,
        origin: OriginId,
        create: impl FnOnce() -> S,
    ) -> Option<&mut Slice<S>> {
        if self.last_watermark > 0 && ts <= self.last_watermark {
            self.late_records += 1;
            tracing::trace!(ts, last_watermark = self.last_watermark, "dropping late record");
            return None;
        }
        self.first_observed = Some(self.first_observed.map_or(ts, |first| first.min(ts)));
        let max_ts = self.origin_max_ts.entry(origin).or_insert(0);
        *max_ts = (*max_ts).max(ts);

        let (start, end) = self.window.slice_bounds(ts);
        let index = match self.slices.binary_search_by_key(&start, |s| s.start) {
            Ok(index) => index,
            Err(index) => {
                self.slices.insert(
                    index,
                    Slice {
                        start,
                        end,
                        state: create(),
                    },
                );
                index
            }
        };
        Some(&mut self.slices[index])
    }

    /// Records an origin's watermark; returns `true` when the minimum advanced.
    pub fn update_watermark(&mut self, origin: OriginId, watermark: u64) -> bool {
        let before = self.min_watermark();
        let entry = self.origin_watermarks.entry(origin).or_insert(0);
        // Watermarks are monotonic per origin; a regression is ignored.
        *entry = (*entry).max(watermark);
        self.min_watermark() > before
    }

    /// Windows whose end falls in `(last_watermark, to]`, ascending by start.
    pub fn triggerable_windows(&self, to: u64) -> Vec<(u64, u64)> {
        self.window.windows_closing_in(self.last_watermark, to)
    }

    /// The slices fully contained in the window `[start, end]`.
    pub fn slices_in_window(&self, start: u64, end: u64) -> impl Iterator<Item = &Slice<S>> {
        self.slices
            .iter()
            .filter(move |s| start <= s.start && end >= s.end)
    }

    /// Advances the last triggered position; the position never regresses.
    pub fn advance_last_watermark(&mut self, to: u64) {
        self.last_watermark = self.last_watermark.max(to);
    }

    /// Initializes the trigger position for a store that has never fired: one window back
    /// from the current watermark, floored at zero.
    pub fn initialize_last_watermark(&mut self, current: u64) {
        if self.last_watermark == 0 {
            let size = self.window.window_type.size_ms();
            self.last_watermark = current.saturating_sub(size);
        }
    }

    /// Drops slices whose end is at or below `to - slide`.
    pub fn gc(&mut self, to: u64) {
        let slide = self.window.window_type.slide_ms();
        let horizon = to.saturating_sub(slide);
        self.slices.retain(|s| s.end > horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::operator::TimeCharacteristic;
    use pretty_assertions::assert_eq;

    fn tumbling(size: u64) -> WindowDescriptor {
        WindowDescriptor::tumbling(size, TimeCharacteristic::EventTime { field: "ts".into() })
    }

    fn store(size: u64) -> SliceStore<u64> {
        SliceStore::new(tumbling(size))
    }

    #[test]
    fn slices_are_created_lazily_and_ordered() {
        let mut store = store(1000);
        store
            .slice_for_insert(2500, OriginId(1), || 0)
            .expect("in time");
        store
            .slice_for_insert(500, OriginId(1), || 0)
            .expect("in time");
        store
            .slice_for_insert(700, OriginId(1), || 0)
            .expect("in time");
        let bounds: Vec<_> = store.slices().iter().map(|s| (s.start(), s.end())).collect();
        assert_eq!(bounds, vec![(0, 1000), (2000, 3000)]);
    }

    #[test]
    fn late_records_are_dropped_and_counted() {
        let mut store = store(1000);
        store.advance_last_watermark(1000);
        assert!(store.slice_for_insert(800, OriginId(1), || 0).is_none());
        assert_eq!(store.late_records(), 1);
        assert!(store.slices().is_empty());
    }

    #[test]
    fn min_watermark_tracks_the_slowest_origin() {
        let mut store = store(1000);
        assert!(store.update_watermark(OriginId(1), 500));
        // A second origin appears at zero; the minimum collapses until it reports.
        store.update_watermark(OriginId(2), 0);
        assert_eq!(store.min_watermark(), 0);
        assert!(store.update_watermark(OriginId(2), 800));
        assert_eq!(store.min_watermark(), 500);
    }

    #[test]
    fn watermark_regression_is_ignored() {
        let mut store = store(1000);
        store.update_watermark(OriginId(1), 900);
        store.update_watermark(OriginId(1), 400);
        assert_eq!(store.min_watermark(), 900);
        store.advance_last_watermark(900);
        store.advance_last_watermark(300);
        assert_eq!(store.last_watermark(), 900);
    }

    #[test]
    fn triggerable_windows_respect_the_last_position() {
        let mut store = store(1000);
        assert_eq!(store.triggerable_windows(2000), vec![(0, 1000), (1000, 2000)]);
        store.advance_last_watermark(1000);
        assert_eq!(store.triggerable_windows(2000), vec![(1000, 2000)]);
    }

    #[test]
    fn gc_keeps_one_slide_of_history() {
        let mut store = store(1000);
        store.slice_for_insert(500, OriginId(1), || 0);
        store.slice_for_insert(1500, OriginId(1), || 0);
        store.slice_for_insert(2500, OriginId(1), || 0);
        store.gc(2000);
        let bounds: Vec<_> = store.slices().iter().map(|s| (s.start(), s.end())).collect();
        assert_eq!(bounds, vec![(1000, 2000), (2000, 3000)]);
    }

    #[test]
    fn initialization_backs_off_one_window() {
        let mut store = store(1000);
        store.initialize_last_watermark(2500);
        assert_eq!(store.last_watermark(), 1500);
        // Already initialized stores keep their position.
        store.initialize_last_watermark(9000);
        assert_eq!(store.last_watermark(), 1500);
        let mut early = store_with_first_ts();
        early.initialize_last_watermark(400);
        assert_eq!(early.last_watermark(), 0);
    }

    fn store_with_first_ts() -> SliceStore<u64> {
        let mut s = store(1000);
        s.slice_for_insert(400, OriginId(1), || 0);
        s
    }

    #[test]
    fn sliding_slices_compose_windows() {
        let mut store: SliceStore<u64> = SliceStore::new(WindowDescriptor::sliding(
            1000,
            500,
            TimeCharacteristic::EventTime { field: "ts".into() },
        ));
        for ts in [100, 600, 1100] {
            let slice = store.slice_for_insert(ts, OriginId(1), || 0).expect("in time");
            *slice.state_mut() += 1;
        }
        // Window [500, 1500) is composed of the slices starting at 500 and 1000.
        let covered: u64 = store.slices_in_window(500, 1500).map(|s| s.state()).sum();
        assert_eq!(covered, 2);
    }
}
