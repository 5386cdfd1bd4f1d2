//! Property tests for the node partition.
//!
//! For every valid `(total_nodes, node_index)` the node plans of one
//! instrument cover every planned timestamp exactly once, in contiguous
//! ascending blocks.

use chrono::{Duration, NaiveDate};
use proptest::prelude::*;
use sdoml_core::data::RawLayout;
use sdoml_core::domain::{ChannelSet, DateRange, Instrument, SampleClock};
use sdoml_core::ChunkPlanner;
use std::collections::HashSet;

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_range() -> impl Strategy<Value = DateRange> {
    (0i64..600, 60i64..(3 * 24 * 60)).prop_map(|(offset, len)| {
        let base = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let start = base + Duration::minutes(offset);
        DateRange::new(start, start + Duration::minutes(len)).unwrap()
    })
}

fn arb_instrument() -> impl Strategy<Value = Instrument> {
    prop_oneof![Just(Instrument::Slow), Just(Instrument::Fast)]
}

proptest! {
    #[test]
    fn node_plans_partition_the_range(
        range in arb_range(),
        total_nodes in 1usize..9,
        chunk in 1usize..20,
        instrument in arb_instrument(),
    ) {
        let planner = ChunkPlanner::new(
            range,
            SampleClock::default(),
            ChannelSet::default(),
            RawLayout::new("raw"),
            total_nodes,
            chunk,
        ).unwrap();
        let all = planner.timestamps(instrument);

        let mut seen = HashSet::new();
        let mut concatenated = Vec::new();
        for node in 0..total_nodes {
            let plan = planner.plan(instrument, node).unwrap();
            for c in &plan.chunks {
                prop_assert!(c.timestamps().len() <= chunk);
                prop_assert_eq!(c.node_index, node);
            }
            for r in plan.chunks.iter().flat_map(|c| c.records.iter()) {
                prop_assert!(seen.insert((r.channel, r.timestamp)), "record planned twice");
            }
            concatenated.extend(plan.timestamps);
        }

        // Contiguous blocks in node order reproduce the full sequence.
        prop_assert_eq!(&concatenated, &all);
        let per_ts = ChannelSet::default().for_instrument(instrument).len();
        prop_assert_eq!(seen.len(), all.len() * per_ts);
        prop_assert_eq!(
            planner.full_range_records(instrument).len(),
            seen.len()
        );
    }

    #[test]
    fn out_of_range_node_is_rejected(total_nodes in 1usize..9, extra in 0usize..4) {
        let planner = ChunkPlanner::new(
            DateRange::parse("2024-01-01", "2024-01-02").unwrap(),
            SampleClock::default(),
            ChannelSet::default(),
            RawLayout::new("raw"),
            total_nodes,
            4,
        ).unwrap();
        prop_assert!(planner.plan(Instrument::Fast, total_nodes + extra).is_err());
    }
}
