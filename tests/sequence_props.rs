//! Property-Based Tests for the frame sequencer and balance lookup tables
//!
//! These tests verify invariants of the traversal and of the correction
//! tables using proptest for input generation and shrinking.
//!
//! Run with: cargo test --test sequence_props

use focusstack::focus_stack::balance::Interval;
use focusstack::focus_stack::{Correction, CorrectionKind, CorrectionMap, SequencePlan};
use focusstack::BitDepth;
use proptest::prelude::*;

fn plan_strategy() -> impl Strategy<Value = (usize, Option<usize>, bool)> {
    (1usize..40).prop_flat_map(|count| (Just(count), prop::option::of(0..count), any::<bool>()))
}

proptest! {
    /// INVARIANT: every frame is visited exactly once
    #[test]
    fn every_index_visited_once((count, reference, step_mode) in plan_strategy()) {
        let plan = SequencePlan::new(count, reference, step_mode).unwrap();
        let mut visited: Vec<usize> = plan.steps().map(|s| s.index).collect();
        prop_assert_eq!(visited.len(), count);
        visited.sort_unstable();
        prop_assert_eq!(visited, (0..count).collect::<Vec<_>>());
    }

    /// INVARIANT: a step-mode pass starts at the reference, otherwise at frame 0
    #[test]
    fn first_step_is_the_start((count, reference, step_mode) in plan_strategy()) {
        let plan = SequencePlan::new(count, reference, step_mode).unwrap();
        let first = plan.steps().next().unwrap();
        let expected = if step_mode { plan.reference() } else { 0 };
        prop_assert_eq!(first.index, expected);
        prop_assert_eq!(first.reference, plan.reference());
    }

    /// INVARIANT: step mode references a neighbour already visited; fixed mode
    /// always references the sequence reference
    #[test]
    fn references_are_visited_neighbours((count, reference, step_mode) in plan_strategy()) {
        let plan = SequencePlan::new(count, reference, step_mode).unwrap();
        let mut seen = Vec::new();
        for step in plan.steps() {
            if step_mode {
                prop_assert!(step.reference == step.index || step.reference.abs_diff(step.index) == 1);
                prop_assert!(step.reference == step.index || seen.contains(&step.reference));
            } else {
                prop_assert_eq!(step.reference, plan.reference());
            }
            seen.push(step.index);
        }
    }

    /// INVARIANT: out-of-range references are rejected
    #[test]
    fn out_of_range_reference_rejected(count in 1usize..40, extra in 0usize..10) {
        prop_assert!(SequencePlan::new(count, Some(count + extra), true).is_err());
    }

    /// INVARIANT: a neutral correction yields the identity table
    #[test]
    fn neutral_corrections_are_identity(
        histogram in prop::collection::vec(0u64..50, 256),
        kind in prop_oneof![
            Just(CorrectionKind::Linear),
            Just(CorrectionKind::Gamma),
            Just(CorrectionKind::MatchHist),
        ],
    ) {
        let interval = Interval { start: 0, end: 256 };
        let map = CorrectionMap::new(kind, BitDepth::Eight, interval, &[histogram]);
        let identity: Vec<u16> = (0..256).collect();
        prop_assert_eq!(map.build_lut(0, &Correction::Identity), identity.clone());
        prop_assert_eq!(map.build_lut(0, &Correction::Factor(1.0)), identity.clone());
        prop_assert_eq!(map.build_lut(0, &Correction::Gamma(1.0)), identity);
    }

    /// INVARIANT: lookup tables are monotone and stay in range
    #[test]
    fn linear_tables_are_monotone(factor in 0.0f64..4.0) {
        let interval = Interval { start: 0, end: 256 };
        let map = CorrectionMap::new(CorrectionKind::Linear, BitDepth::Eight, interval, &[vec![1; 256]]);
        let lut = map.build_lut(0, &Correction::Factor(factor));
        prop_assert_eq!(lut.len(), 256);
        prop_assert!(lut.windows(2).all(|w| w[0] <= w[1]));
        prop_assert!(lut.iter().all(|&v| v <= 255));
    }
}
