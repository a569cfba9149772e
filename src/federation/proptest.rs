//! Property-Based Tests for Offset Compensation
//!
//! Per-source result sets are generated with random relevance scores, merged
//! the way the monitor merges them, and windowed. The compensated page must be
//! exactly the matching slice of the fully merged list.
//!
//! # Test Properties
//!
//! 1. **No loss or duplication**: window(O, P) = merged[O-1 .. O-1+P]
//! 2. **Determinism**: merging the same inputs in any arrival order yields the
//!    same page

#![cfg(test)]

use proptest::prelude::*;

use super::offset::{apply_window, OffsetPlan};
use super::sort::SortPolicy;
use crate::domain::{match_all, Metacard, Query, ResultEntry};

// =============================================================================
// Property Strategies
// =============================================================================

/// Per-source relevance scores: 2-5 sources, up to 20 results each
fn sources_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(0u8..10, 0..20), 2..=5)
}

fn build_source_results(scores: &[Vec<u8>]) -> Vec<Vec<ResultEntry>> {
    scores
        .iter()
        .enumerate()
        .map(|(s, source)| {
            source
                .iter()
                .enumerate()
                .map(|(i, score)| {
                    ResultEntry::new(Metacard::new(format!("doc-{:02}", i), format!("src-{}", s)))
                        .with_relevance(f64::from(*score))
                })
                .collect()
        })
        .collect()
}

/// Sort each source locally, truncate to what the source would return for
/// `query`, then merge and sort globally
fn federate(per_source: &[Vec<ResultEntry>], query: &Query) -> Vec<ResultEntry> {
    let policy = SortPolicy::default();
    let mut merged = Vec::new();
    for results in per_source {
        let mut local = results.clone();
        policy.sort(&mut local);
        merged.extend(apply_window(local, query.start_index(), query.page_size()));
    }
    policy.sort(&mut merged);
    merged
}

// =============================================================================
// Window Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_compensated_page_matches_merged_slice(
        scores in sources_strategy(),
        offset in 1usize..30,
        page_size in 1usize..15,
    ) {
        let per_source = build_source_results(&scores);
        let full = federate(&per_source, &Query::new(match_all()).with_page_size(0));
        prop_assume!(offset + page_size - 1 <= full.len());

        let query = Query::new(match_all())
            .with_start_index(offset)
            .with_page_size(page_size);
        let plan = OffsetPlan::for_query(&query, per_source.len());
        prop_assert!(plan.is_compensated() || offset == 1);

        let merged = federate(&per_source, &plan.source_query(&query));
        let page = if plan.is_compensated() {
            apply_window(merged, offset, page_size)
        } else {
            merged.into_iter().take(page_size).collect()
        };

        let expected = &full[offset - 1..offset - 1 + page_size];
        prop_assert_eq!(page.as_slice(), expected);
    }

    #[test]
    fn prop_merge_order_independent_of_arrival(
        scores in sources_strategy(),
        offset in 1usize..10,
        page_size in 1usize..10,
    ) {
        let per_source = build_source_results(&scores);
        let query = Query::new(match_all())
            .with_start_index(offset)
            .with_page_size(page_size);
        let plan = OffsetPlan::for_query(&query, per_source.len());
        let outgoing = plan.source_query(&query);

        let forward = federate(&per_source, &outgoing);
        let mut reversed_sources = per_source.clone();
        reversed_sources.reverse();
        let backward = federate(&reversed_sources, &outgoing);

        prop_assert_eq!(
            apply_window(forward, offset, page_size),
            apply_window(backward, offset, page_size)
        );
    }
}
