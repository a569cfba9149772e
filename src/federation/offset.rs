//! Offset compensation across sources
//!
//! No source can honour a global offset when several are queried together,
//! since each only knows its own ordering. For `offset > 1` across more than
//! one source, every source is asked for results `1..=offset+page-1`, the
//! merged list is sorted, and the first `offset-1` entries are discarded:
//!
//! ```text
//!   requested: start=6, page=5, 3 sources
//!   per source: start=1, page=10
//!   merged:     [1 2 3 4 5 | 6 7 8 9 10 | 11 ...]
//!                 discarded    returned
//! ```

use tracing::debug;

use crate::domain::{Query, QueryResponse, ResultEntry};

/// Windowing decision for one federated query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetPlan {
    offset: usize,
    page_size: usize,
    compensated: bool,
}

impl OffsetPlan {
    /// Plan for `query` sent to `source_count` distinct sources
    pub fn for_query(query: &Query, source_count: usize) -> Self {
        let offset = query.start_index();
        Self {
            offset,
            page_size: query.page_size(),
            compensated: offset > 1 && source_count > 1,
        }
    }

    pub fn is_compensated(&self) -> bool {
        self.compensated
    }

    /// Query to send to each source
    pub fn source_query(&self, query: &Query) -> Query {
        if !self.compensated {
            return query.clone();
        }

        // Unbounded stays unbounded
        let inflated = if self.page_size == 0 {
            0
        } else {
            self.offset + self.page_size - 1
        };
        debug!(
            "Compensating offset {}: querying sources from 1 with page size {}",
            self.offset, inflated
        );
        query
            .clone()
            .with_start_index(1)
            .with_page_size(inflated)
    }

    /// Cut the requested page out of a merged response; hits are kept as-is
    pub fn apply(&self, mut response: QueryResponse) -> QueryResponse {
        if self.compensated {
            let merged = std::mem::take(&mut response.results);
            response.results = apply_window(merged, self.offset, self.page_size);
        }
        response
    }
}

/// Skip the first `offset - 1` results, then keep up to `page_size` (0 keeps all)
pub fn apply_window(results: Vec<ResultEntry>, offset: usize, page_size: usize) -> Vec<ResultEntry> {
    let take = if page_size == 0 { usize::MAX } else { page_size };
    results
        .into_iter()
        .skip(offset.saturating_sub(1))
        .take(take)
        .collect()
}
