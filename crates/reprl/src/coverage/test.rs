#![cfg(test)]

use super::CoverageError;
use super::CoverageMap;

fn popcount_cleared(virgin: &[u64]) -> u64 {
    virgin.iter().map(|word| word.count_zeros() as u64).sum()
}

#[test]
fn uninstrumented_target_is_rejected() {
    let mut map = CoverageMap::for_testing(16, false);
    // Re-running finalization against a zeroed header must fail.
    map.shmem.set_num_edges(0);
    assert!(matches!(
        map.finish_initialization(false),
        Err(CoverageError::NotInstrumented)
    ));
}

#[test]
fn reserved_bit_zero_is_never_reported() {
    let mut map = CoverageMap::for_testing(16, false);
    map.set_edge(0);
    let mut new_edges = Vec::new();
    assert!(!map.evaluate(&mut new_edges));
    assert!(new_edges.is_empty());
    assert_eq!(map.found_edges(), 0);
}

#[test]
fn evaluate_reports_each_edge_exactly_once() {
    // First execution covers {3, 5, 9}, the second {5, 7}.
    let mut map = CoverageMap::for_testing(16, false);
    let mut new_edges = Vec::new();

    for edge in [3, 5, 9] {
        map.set_edge(edge);
    }
    assert!(map.evaluate(&mut new_edges));
    assert_eq!(new_edges, [3, 5, 9]);
    assert_eq!(map.found_edges(), 3);

    map.clear_bitmap();
    for edge in [5, 7] {
        map.set_edge(edge);
    }
    assert!(map.evaluate(&mut new_edges));
    assert_eq!(new_edges, [7]);
    assert_eq!(map.found_edges(), 4);

    // Virgin still remembers edge 5 from the first execution.
    assert_eq!(map.virgin_bits()[0] >> 5 & 1, 0);
}

#[test]
fn evaluate_only_clears_reported_virgin_bits() {
    let mut map = CoverageMap::for_testing(100, false);
    let before = map.virgin_bits().to_vec();
    for edge in [1, 64, 99] {
        map.set_edge(edge);
    }
    let mut new_edges = Vec::new();
    map.evaluate(&mut new_edges);
    assert_eq!(new_edges, [1, 64, 99]);

    for (word_index, (before_word, after_word)) in
        before.iter().zip(map.virgin_bits()).enumerate()
    {
        let expected_cleared: u64 = [1u32, 64, 99]
            .iter()
            .filter(|&&edge| edge as usize / 64 == word_index)
            .map(|&edge| 1 << (edge % 64))
            .sum();
        assert_eq!(before_word & !expected_cleared, *after_word);
    }
}

#[test]
fn found_edges_matches_cleared_virgin_bits() {
    let mut map = CoverageMap::for_testing(200, false);
    let mut new_edges = Vec::new();
    for edge in [2, 17, 64, 65, 130, 199] {
        map.set_edge(edge);
    }
    map.evaluate(&mut new_edges);
    // The only cleared bit that is not a discovered edge is the reserved
    // bit 0; padding bits past num_edges stay set.
    assert_eq!(map.found_edges(), popcount_cleared(map.virgin_bits()) - 1);
}

#[test]
fn clear_edge_data_undoes_a_discovery() {
    let mut map = CoverageMap::for_testing(16, true);
    let mut new_edges = Vec::new();
    map.set_edge(9);
    map.evaluate(&mut new_edges);
    assert_eq!(new_edges, [9]);
    assert_eq!(map.found_edges(), 1);

    map.clear_edge_data(9);
    assert_eq!(map.found_edges(), 0);
    assert_eq!(map.virgin_bits()[0] >> 9 & 1, 1);
    assert_eq!(map.edge_count_mut().expect("tracking enabled")[9], 0);

    // The same edge is discovered afresh by the next evaluation.
    map.evaluate(&mut new_edges);
    assert_eq!(new_edges, [9]);
    assert_eq!(map.found_edges(), 1);
}

#[test]
#[should_panic(expected = "has not been discovered")]
fn clear_edge_data_rejects_undiscovered_edges() {
    let mut map = CoverageMap::for_testing(16, false);
    map.clear_edge_data(3);
}

#[test]
fn hit_counts_accumulate_over_evaluations() {
    let mut map = CoverageMap::for_testing(16, true);
    let mut new_edges = Vec::new();

    for edge in [3, 5] {
        map.set_edge(edge);
    }
    map.evaluate(&mut new_edges);
    map.evaluate(&mut new_edges);
    map.clear_bitmap();
    map.set_edge(5);
    map.evaluate(&mut new_edges);

    let counts = map.edge_count_mut().expect("tracking enabled").clone();
    assert_eq!(counts[3], 2);
    assert_eq!(counts[5], 3);
    let total: u64 = counts.iter().map(|&count| count as u64).sum();
    // Two evaluations saw {3, 5}, one saw {5}.
    assert_eq!(total, 5);
}

#[test]
fn crash_edges_are_tracked_separately() {
    let mut map = CoverageMap::for_testing(16, true);
    map.set_edge(4);
    assert!(map.evaluate_crash());
    // A crash discovery moves neither found_edges nor the hit counts.
    assert_eq!(map.found_edges(), 0);
    assert_eq!(map.edge_count_mut().expect("tracking enabled")[4], 0);
    // The second crashing execution covering the same edge finds nothing new.
    assert!(!map.evaluate_crash());

    // The virgin bitmap is unaffected, so a non-crashing execution still
    // discovers the edge.
    let mut new_edges = Vec::new();
    assert!(map.evaluate(&mut new_edges));
    assert_eq!(new_edges, [4]);
}

#[test]
fn compare_equal_requires_every_edge() {
    let mut map = CoverageMap::for_testing(16, false);
    map.clear_bitmap();
    for edge in [2, 6, 11] {
        map.set_edge(edge);
    }
    assert!(map.compare_equal(&[2, 6, 11]));
    assert!(map.compare_equal(&[2, 11]));
    assert!(!map.compare_equal(&[2, 6, 11, 12]));
}

#[test]
fn reset_state_restores_a_fresh_context() {
    let mut map = CoverageMap::for_testing(16, true);
    let mut new_edges = Vec::new();
    map.set_edge(3);
    map.evaluate(&mut new_edges);
    map.evaluate_crash();

    map.reset_state();
    assert_eq!(map.found_edges(), 0);
    assert_eq!(map.virgin_bits()[0] & 1, 0);
    assert_eq!(map.virgin_bits()[0] >> 3 & 1, 1);
    assert!(map.edge_count_mut().expect("tracking enabled").iter().all(|&count| count == 0));

    // The live bitmap is not part of the parent state and must be cleared
    // explicitly.
    map.evaluate(&mut new_edges);
    assert_eq!(new_edges, [3]);
}

#[test]
fn least_visited_edges_picks_smallest_positive_counts() {
    let mut map = CoverageMap::for_testing(7, true);
    *map.edge_count_mut().expect("tracking enabled") = vec![0, 0, 5, 1, 3, 1, 10, 2];

    let selected = map
        .least_visited_edges(3, 10)
        .expect("tracking is enabled");
    assert_eq!(selected, [3, 5, 7]);
    assert_eq!(
        map.edge_count_mut().expect("tracking enabled").as_slice(),
        [0, 0, 5, 11, 3, 11, 10, 12]
    );
}

#[test]
fn least_visited_edges_caps_at_available_edges() {
    let mut map = CoverageMap::for_testing(7, true);
    *map.edge_count_mut().expect("tracking enabled") = vec![0, 0, 0, 4, 0, 0, 0, 2];

    let selected = map
        .least_visited_edges(10, 1)
        .expect("tracking is enabled");
    assert_eq!(selected, [3, 7]);
}

#[test]
fn least_visited_edges_with_no_hits_is_empty() {
    let mut map = CoverageMap::for_testing(7, true);
    let selected = map
        .least_visited_edges(3, 10)
        .expect("tracking is enabled");
    assert!(selected.is_empty());
}

#[test]
fn least_visited_edges_requires_tracking() {
    let mut map = CoverageMap::for_testing(7, false);
    assert!(matches!(
        map.least_visited_edges(3, 10),
        Err(CoverageError::TrackingDisabled)
    ));
    let mut tracked = CoverageMap::for_testing(7, true);
    assert!(matches!(
        tracked.least_visited_edges(0, 10),
        Err(CoverageError::EmptySelection)
    ));
}
