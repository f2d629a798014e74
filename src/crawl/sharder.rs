//! Adaptive time sharding
//!
//! The upstream caps every query at 50 result pages, so a wall-clock range
//! is split recursively at hour-rounded midpoints until each leaf is known
//! (or conservatively assumed) to fit under the cap, or has reached the
//! one-hour resolution floor. The planner is stateless; page counts come
//! through the [`PageProbe`] seam so the engine probes through the sidecar
//! and tests probe through fakes.

use tracing::{debug, warn};

use crate::error::Result;

use super::time_range::TimeRange;

/// Upstream per-query page cap.
pub const PAGE_CAP: u32 = 50;

/// Source of total-page estimates for a keyword over a range.
pub trait PageProbe: Send + Sync {
    /// Total result pages for `keyword` within `range`.
    ///
    /// Implementations fetch page 1 and read the reported total; when the
    /// upstream omits it they answer conservatively (over the cap when a
    /// next page exists).
    fn total_pages(
        &self,
        keyword: &str,
        range: TimeRange,
    ) -> impl std::future::Future<Output = Result<u32>> + Send;
}

/// A planned leaf: crawl these pages over this range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeShard {
    pub range: TimeRange,
    pub estimated_pages: u32,
}

/// Stateless shard planner.
#[derive(Debug, Clone, Copy)]
pub struct TimeSharder {
    cap: u32,
}

impl Default for TimeSharder {
    fn default() -> Self {
        Self { cap: PAGE_CAP }
    }
}

impl TimeSharder {
    #[must_use]
    pub fn new(cap: u32) -> Self {
        Self { cap }
    }

    /// Produce the leaf shards covering `range`, in chronological order.
    ///
    /// The leaves are a disjoint, hour-aligned partition of the input. A
    /// one-hour leaf is accepted even over the cap (logged); total work is
    /// bounded by the ⌈log₂(hours)⌉ recursion depth per branch.
    pub async fn plan<P: PageProbe>(
        &self,
        probe: &P,
        keyword: &str,
        range: TimeRange,
    ) -> Result<Vec<TimeShard>> {
        let mut pending = vec![range];
        let mut leaves = Vec::new();

        while let Some(current) = pending.pop() {
            let pages = probe.total_pages(keyword, current).await?;

            if pages <= self.cap {
                leaves.push(TimeShard {
                    range: current,
                    estimated_pages: pages,
                });
                continue;
            }

            match current.split_at_hour_midpoint() {
                Some((left, right)) => {
                    debug!(
                        keyword,
                        pages,
                        start = %current.start,
                        end = %current.end,
                        "shard over cap, splitting"
                    );
                    // Right pushed first so the left half is probed next and
                    // leaves come out chronologically.
                    pending.push(right);
                    pending.push(left);
                }
                None => {
                    warn!(
                        keyword,
                        pages,
                        start = %current.start,
                        "one-hour shard exceeds page cap, accepting as leaf"
                    );
                    leaves.push(TimeShard {
                        range: current,
                        estimated_pages: pages,
                    });
                }
            }
        }

        leaves.sort_by_key(|shard| shard.range.start);
        Ok(leaves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    /// Probe whose page count is a function of the queried range.
    struct FnProbe<F>(F);

    impl<F> PageProbe for FnProbe<F>
    where
        F: Fn(TimeRange) -> u32 + Send + Sync,
    {
        async fn total_pages(&self, _keyword: &str, range: TimeRange) -> Result<u32> {
            Ok((self.0)(range))
        }
    }

    fn hours_range(hours: i64) -> TimeRange {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        TimeRange::new(start, start + chrono::Duration::hours(hours)).unwrap()
    }

    #[tokio::test]
    async fn under_cap_range_is_single_leaf() {
        let sharder = TimeSharder::default();
        let probe = FnProbe(|_| 12);
        let leaves = sharder.plan(&probe, "kw", hours_range(72)).await.unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].estimated_pages, 12);
    }

    #[tokio::test]
    async fn dense_range_splits_until_under_cap() {
        let sharder = TimeSharder::default();
        // 4 pages per hour: anything over 12 hours exceeds the cap of 50.
        let probe = FnProbe(|range: TimeRange| (range.hours() * 4) as u32);
        let full = hours_range(72);
        let leaves = sharder.plan(&probe, "kw", full).await.unwrap();

        assert!(leaves.len() > 1);
        for leaf in &leaves {
            assert!(leaf.estimated_pages <= PAGE_CAP);
            assert!(leaf.range.is_hour_aligned());
        }
        // Leaves partition the input exactly.
        assert_eq!(leaves[0].range.start, full.start);
        assert_eq!(leaves.last().unwrap().range.end, full.end);
        for pair in leaves.windows(2) {
            assert_eq!(pair[0].range.end, pair[1].range.start);
        }
    }

    #[tokio::test]
    async fn one_hour_leaf_accepted_over_cap() {
        let sharder = TimeSharder::default();
        let probe = FnProbe(|_| 400);
        let leaves = sharder.plan(&probe, "kw", hours_range(4)).await.unwrap();
        assert_eq!(leaves.len(), 4);
        for leaf in &leaves {
            assert_eq!(leaf.range.hours(), 1);
            assert_eq!(leaf.estimated_pages, 400);
        }
    }

    #[tokio::test]
    async fn asymmetric_density_splits_only_dense_half() {
        let boundary = Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();
        let sharder = TimeSharder::default();
        // Everything before the boundary is dense, after is sparse.
        let probe = FnProbe(move |range: TimeRange| {
            if range.start < boundary {
                (range.hours() * 10) as u32
            } else {
                3
            }
        });
        let full = hours_range(72); // 2024-05-01T00 .. 2024-05-04T00
        let leaves = sharder.plan(&probe, "kw", full).await.unwrap();

        let dense: Vec<_> = leaves.iter().filter(|l| l.range.start < boundary).collect();
        let sparse: Vec<_> = leaves.iter().filter(|l| l.range.start >= boundary).collect();
        assert!(dense.len() > sparse.len());
        for leaf in dense {
            assert!(leaf.estimated_pages <= PAGE_CAP);
        }
    }
}
