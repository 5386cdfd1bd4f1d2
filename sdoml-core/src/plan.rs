//! Chunk planning: a pure function from (range, node, worker batch size)
//! to the records one node is responsible for.
//!
//! The planned timestamps of an instrument are split into `total_nodes`
//! contiguous blocks: timestamp `i` of `N` belongs to node
//! `floor(i * total_nodes / N)`. Each block is then cut into batches of
//! `worker_chunk_size` timestamps, one [`DownloadChunk`] per batch. No
//! coordination between nodes is needed; every node computes the same plan.

use crate::data::RawLayout;
use crate::domain::{
    ChannelSet, DateRange, DownloadChunk, Instrument, InvalidRangeError, RawFileRecord, SampleClock,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    range: DateRange,
    clock: SampleClock,
    channels: ChannelSet,
    layout: RawLayout,
    total_nodes: usize,
    worker_chunk_size: usize,
}

/// The part of the plan one node executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePlan {
    pub instrument: Instrument,
    pub node_index: usize,
    pub total_nodes: usize,
    /// This node's contiguous block of native timestamps.
    pub timestamps: Vec<NaiveDateTime>,
    pub chunks: Vec<DownloadChunk>,
}

impl NodePlan {
    pub fn record_count(&self) -> usize {
        self.chunks.iter().map(|c| c.records.len()).sum()
    }

    pub fn into_records(self) -> Vec<RawFileRecord> {
        self.chunks.into_iter().flat_map(|c| c.records).collect()
    }
}

impl ChunkPlanner {
    pub fn new(
        range: DateRange,
        clock: SampleClock,
        channels: ChannelSet,
        layout: RawLayout,
        total_nodes: usize,
        worker_chunk_size: usize,
    ) -> Result<Self, InvalidRangeError> {
        if total_nodes == 0 {
            return Err(InvalidRangeError::new("total_nodes must be at least 1"));
        }
        if worker_chunk_size == 0 {
            return Err(InvalidRangeError::new("worker_chunk_size must be at least 1"));
        }
        if clock.keys(&range).is_empty() {
            return Err(InvalidRangeError::new(format!(
                "{range} contains no {}-minute sample slot",
                clock.cadence_minutes()
            )));
        }
        Ok(Self {
            range,
            clock,
            channels,
            layout,
            total_nodes,
            worker_chunk_size,
        })
    }

    pub fn range(&self) -> &DateRange {
        &self.range
    }

    pub fn total_nodes(&self) -> usize {
        self.total_nodes
    }

    /// Every native timestamp of `instrument` the range needs, ascending.
    pub fn timestamps(&self, instrument: Instrument) -> Vec<NaiveDateTime> {
        let mut ts: Vec<NaiveDateTime> = self
            .clock
            .keys(&self.range)
            .into_iter()
            .map(|k| self.clock.native_time(instrument, k))
            .collect();
        ts.dedup();
        ts
    }

    /// Index range `[lo, hi)` of node `node_index` among `total` timestamps.
    pub fn node_bounds(&self, node_index: usize, total: usize) -> (usize, usize) {
        let n = self.total_nodes;
        (node_index * total / n, (node_index + 1) * total / n)
    }

    pub fn plan(&self, instrument: Instrument, node_index: usize) -> Result<NodePlan, InvalidRangeError> {
        if node_index >= self.total_nodes {
            return Err(InvalidRangeError::new(format!(
                "node_index {node_index} is out of range for {} nodes",
                self.total_nodes
            )));
        }
        let all = self.timestamps(instrument);
        let (lo, hi) = self.node_bounds(node_index, all.len());
        let mine = all[lo..hi].to_vec();
        let channels = self.channels.for_instrument(instrument);

        let chunks = mine
            .chunks(self.worker_chunk_size)
            .enumerate()
            .map(|(worker_index, batch)| DownloadChunk {
                node_index,
                worker_index,
                records: batch
                    .iter()
                    .flat_map(|t| channels.iter().map(move |c| self.layout.record(*c, *t)))
                    .collect(),
            })
            .collect();

        Ok(NodePlan {
            instrument,
            node_index,
            total_nodes: self.total_nodes,
            timestamps: mine,
            chunks,
        })
    }

    /// Records of every node, in plan order. Phase 1 runs over this set.
    pub fn full_range_records(&self, instrument: Instrument) -> Vec<RawFileRecord> {
        let channels = self.channels.for_instrument(instrument);
        self.timestamps(instrument)
            .into_iter()
            .flat_map(|t| {
                channels
                    .iter()
                    .map(|c| self.layout.record(*c, t))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Channel;
    use chrono::Timelike;

    fn planner(start: &str, end: &str, nodes: usize, chunk: usize) -> ChunkPlanner {
        ChunkPlanner::new(
            DateRange::parse(start, end).unwrap(),
            SampleClock::default(),
            ChannelSet::default(),
            RawLayout::new("raw"),
            nodes,
            chunk,
        )
        .unwrap()
    }

    #[test]
    fn fast_grid_uses_pairing_minutes() {
        let p = planner("2024-01-01", "2024-01-02", 1, 4);
        let ts = p.timestamps(Instrument::Fast);
        assert_eq!(ts.len(), 96);
        let minutes: Vec<u32> = ts[..4].iter().map(|t| t.minute()).collect();
        assert_eq!(minutes, vec![0, 14, 30, 44]);
        assert_eq!(p.timestamps(Instrument::Slow)[1].minute(), 15);
    }

    #[test]
    fn chunks_hold_every_channel_of_a_batch() {
        let p = planner("2024-01-01", "2024-01-02", 2, 10);
        let plan = p.plan(Instrument::Fast, 1).unwrap();
        assert_eq!(plan.timestamps.len(), 48);
        assert_eq!(plan.chunks.len(), 5);
        assert_eq!(plan.chunks[0].records.len(), 10 * 5);
        assert_eq!(plan.chunks[4].records.len(), 8 * 5);
        assert_eq!(plan.chunks[0].timestamps().len(), 10);
        assert!(plan.chunks[0].records.iter().all(|r| r.channel != Channel::HmiMagnetogram));

        let slow = p.plan(Instrument::Slow, 0).unwrap();
        assert_eq!(slow.record_count(), 48);
    }

    #[test]
    fn node_blocks_are_contiguous() {
        let p = planner("2024-01-01", "2024-01-03", 3, 7);
        let first = p.plan(Instrument::Slow, 0).unwrap();
        let second = p.plan(Instrument::Slow, 1).unwrap();
        assert!(first.timestamps.last().unwrap() < second.timestamps.first().unwrap());
        assert_eq!(first.timestamps.len(), 64);
    }

    #[test]
    fn rejects_bad_inputs() {
        let range = DateRange::parse("2024-01-01", "2024-01-02").unwrap();
        let new = |nodes, chunk| {
            ChunkPlanner::new(
                range,
                SampleClock::default(),
                ChannelSet::default(),
                RawLayout::new("raw"),
                nodes,
                chunk,
            )
        };
        assert!(new(0, 1).is_err());
        assert!(new(1, 0).is_err());
        assert!(new(2, 1).unwrap().plan(Instrument::Fast, 2).is_err());

        let tiny = DateRange::parse("2024-01-01T00:01", "2024-01-01T00:10").unwrap();
        assert!(ChunkPlanner::new(
            tiny,
            SampleClock::default(),
            ChannelSet::default(),
            RawLayout::new("raw"),
            1,
            1
        )
        .is_err());
    }

    #[test]
    fn more_nodes_than_timestamps_leaves_some_idle() {
        let p = planner("2024-01-01T00:00", "2024-01-01T00:30", 4, 1);
        let sizes: Vec<usize> = (0..4)
            .map(|i| p.plan(Instrument::Slow, i).unwrap().timestamps.len())
            .collect();
        assert_eq!(sizes.iter().sum::<usize>(), 2);
        assert!(sizes.contains(&0));
    }
}
