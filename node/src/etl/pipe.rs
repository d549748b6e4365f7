// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use node_data::queue::AsyncQueue;
use tracing::error;

use crate::peer::FetchedLedger;

/// A raw ledger travelling from an extractor to the transformer.
pub struct ExtractedLedger {
    pub sequence: u32,
    pub ledger: FetchedLedger,
}

/// Bounded lanes between the extractors and the transformer. Extractor
/// `i` owns the sequences with `(seq - start) % n == i` and produces them
/// in order into its own lane, so the transformer can pull strictly by
/// sequence while each lane stays single-producer single-consumer with
/// back-pressure.
pub struct ExtractionDataPipe {
    lanes: Vec<AsyncQueue<ExtractedLedger>>,
    start: u32,
}

impl ExtractionDataPipe {
    pub fn new(num_extractors: usize, queue_depth: usize, start: u32) -> Self {
        let num_extractors = num_extractors.max(1);
        let lanes = (0..num_extractors)
            .map(|_| AsyncQueue::bounded(queue_depth.max(1)))
            .collect();
        Self { lanes, start }
    }

    pub fn num_lanes(&self) -> usize {
        self.lanes.len()
    }

    pub fn lane_of(&self, sequence: u32) -> usize {
        (sequence.wrapping_sub(self.start) as usize) % self.lanes.len()
    }

    /// Enqueue a fetched ledger; suspends while the lane is full.
    pub async fn push(&self, item: ExtractedLedger) -> bool {
        let lane = self.lane_of(item.sequence);
        self.lanes[lane].send(item).await.is_ok()
    }

    /// Dequeue exactly `sequence`. Returns `None` once the owning lane is
    /// closed and drained.
    pub async fn pull(&self, sequence: u32) -> Option<ExtractedLedger> {
        let lane = self.lane_of(sequence);
        loop {
            let item = self.lanes[lane].recv().await.ok()?;
            if item.sequence == sequence {
                return Some(item);
            }
            // Lanes are produced in order; a mismatch means an extractor
            // restarted behind our back. Drop stale items until aligned.
            if item.sequence < sequence {
                error!(
                    event = "stale ledger in pipe",
                    got = item.sequence,
                    want = sequence,
                );
                continue;
            }
            error!(
                event = "pipe sequence gap",
                got = item.sequence,
                want = sequence,
            );
            return None;
        }
    }

    /// Close every lane, waking the transformer and any blocked extractor.
    pub fn close(&self) {
        for lane in &self.lanes {
            lane.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(sequence: u32) -> ExtractedLedger {
        ExtractedLedger {
            sequence,
            ledger: FetchedLedger::default(),
        }
    }

    #[tokio::test]
    async fn pulls_in_sequence_order_across_lanes() {
        let pipe = ExtractionDataPipe::new(3, 4, 100);

        // Three extractors deliver out of phase.
        pipe.push(raw(102)).await;
        pipe.push(raw(100)).await;
        pipe.push(raw(101)).await;
        pipe.push(raw(103)).await;

        for want in 100..=103 {
            let item = pipe.pull(want).await.unwrap();
            assert_eq!(item.sequence, want);
        }
    }

    #[tokio::test]
    async fn lane_backpressure_bounds_the_producer() {
        let pipe = ExtractionDataPipe::new(1, 2, 0);
        pipe.push(raw(0)).await;
        pipe.push(raw(1)).await;

        // The lane is full: a third push must suspend until a pull.
        let pending = {
            let pipe = std::sync::Arc::new(pipe);
            let producer = pipe.clone();
            let task =
                tokio::spawn(async move { producer.push(raw(2)).await });
            tokio::task::yield_now().await;
            assert!(!task.is_finished());

            pipe.pull(0).await.unwrap();
            (task, pipe)
        };
        assert!(pending.0.await.unwrap());
        pending.1.pull(1).await.unwrap();
        pending.1.pull(2).await.unwrap();
    }

    #[tokio::test]
    async fn close_unblocks_the_consumer() {
        let pipe = ExtractionDataPipe::new(2, 2, 0);
        pipe.close();
        assert!(pipe.pull(0).await.is_none());
    }
}
