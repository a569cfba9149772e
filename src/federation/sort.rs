//! Result comparators
//!
//! The comparator is chosen from the query's sort property. Ties are broken by
//! source id then document id so repeated merges of the same inputs produce the
//! same order regardless of which source answered first.

use std::cmp::Ordering;

use crate::domain::{Metacard, ResultEntry, SortBy, SortOrder};

/// Comparator selected for a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortPolicy {
    /// Relevance score (missing scores sort last)
    Relevance(SortOrder),
    /// Effective date, falling back to modified date
    Temporal(SortOrder),
    /// Distance from the query geometry (missing distances sort last)
    Distance(SortOrder),
}

impl Default for SortPolicy {
    fn default() -> Self {
        SortPolicy::Relevance(SortOrder::Descending)
    }
}

impl SortPolicy {
    /// Pick a comparator from a sort specification
    pub fn for_sort(sort: Option<&SortBy>) -> Self {
        let Some(sort) = sort else {
            return SortPolicy::default();
        };

        match sort.property.to_uppercase().as_str() {
            "EFFECTIVE" | "TEMPORAL" => SortPolicy::Temporal(sort.order),
            "DISTANCE" => SortPolicy::Distance(sort.order),
            "RELEVANCE" => SortPolicy::Relevance(sort.order),
            _ => SortPolicy::default(),
        }
    }

    pub fn compare(&self, a: &ResultEntry, b: &ResultEntry) -> Ordering {
        let primary = match self {
            SortPolicy::Relevance(order) => compare_optional(a.relevance, b.relevance, *order),
            SortPolicy::Temporal(order) => {
                directed(a.metacard.temporal().cmp(&b.metacard.temporal()), *order)
            }
            SortPolicy::Distance(order) => {
                compare_optional(a.distance_meters, b.distance_meters, *order)
            }
        };

        primary.then_with(|| tie_break(&a.metacard, &b.metacard))
    }

    /// Order bare metacards; only the temporal policy has a metacard-level key
    pub fn compare_metacards(&self, a: &Metacard, b: &Metacard) -> Ordering {
        let primary = match self {
            SortPolicy::Temporal(order) => directed(a.temporal().cmp(&b.temporal()), *order),
            SortPolicy::Relevance(_) | SortPolicy::Distance(_) => Ordering::Equal,
        };

        primary.then_with(|| tie_break(a, b))
    }

    /// Stable in-place sort
    pub fn sort(&self, results: &mut [ResultEntry]) {
        results.sort_by(|a, b| self.compare(a, b));
    }
}

fn tie_break(a: &Metacard, b: &Metacard) -> Ordering {
    a.source_id.cmp(&b.source_id).then_with(|| a.id.cmp(&b.id))
}

fn directed(ordering: Ordering, order: SortOrder) -> Ordering {
    match order {
        SortOrder::Ascending => ordering,
        SortOrder::Descending => ordering.reverse(),
    }
}

/// Present values are ordered by direction; absent values always go last
fn compare_optional(a: Option<f64>, b: Option<f64>, order: SortOrder) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => directed(x.total_cmp(&y), order),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
