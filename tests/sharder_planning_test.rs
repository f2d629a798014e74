//! Planning properties of the adaptive time sharder.

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use weibo_harvester::crawl::{PageProbe, TimeRange, TimeSharder, PAGE_CAP};
use weibo_harvester::error::Result;

struct FnProbe<F>(F);

impl<F> PageProbe for FnProbe<F>
where
    F: Fn(TimeRange) -> u32 + Send + Sync,
{
    async fn total_pages(&self, _keyword: &str, range: TimeRange) -> Result<u32> {
        Ok((self.0)(range))
    }
}

fn base_range(hours: i64) -> TimeRange {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    TimeRange::new(start, start + Duration::hours(hours)).unwrap()
}

/// A 72-hour window whose full probe reports 200 pages splits; the sparse
/// recent half becomes a leaf while the dense older half keeps splitting.
#[tokio::test]
async fn dense_history_splits_sparse_tail_stays_whole() {
    let full = base_range(72);
    let mid = full.start + Duration::hours(36);

    let probe = FnProbe(move |range: TimeRange| {
        if range == full {
            200
        } else if range.start < mid {
            // Older half stays dense until split below 12 hours.
            if range.hours() > 12 { 60 } else { 20 }
        } else {
            45
        }
    });

    let leaves = TimeSharder::default()
        .plan(&probe, "foo", full)
        .await
        .unwrap();

    // The newest leaf covers the whole right half in one shard of 45 pages.
    let newest = leaves.last().unwrap();
    assert_eq!(newest.range.end, full.end);
    assert_eq!(newest.estimated_pages, 45);
    assert!(newest.range.hours() >= 36 - 1);

    // Everything on the dense side is under the cap.
    for leaf in &leaves {
        assert!(leaf.estimated_pages <= PAGE_CAP || leaf.range.hours() == 1);
    }
}

#[tokio::test]
async fn exactly_one_hour_wide_range_is_always_a_leaf() {
    let range = base_range(1);
    let probe = FnProbe(|_| 5_000);
    let leaves = TimeSharder::default()
        .plan(&probe, "foo", range)
        .await
        .unwrap();
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].range, range);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Leaves always form a disjoint, hour-aligned, exact partition of the
    /// input, with every leaf under the cap or at the one-hour floor.
    #[test]
    fn leaves_partition_the_input(hours in 2i64..240, per_hour in 1u32..30) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let full = base_range(hours);
            let probe = FnProbe(move |range: TimeRange| {
                (range.hours() as u32).saturating_mul(per_hour)
            });
            let leaves = TimeSharder::default()
                .plan(&probe, "kw", full)
                .await
                .unwrap();

            prop_assert!(!leaves.is_empty());
            prop_assert_eq!(leaves[0].range.start, full.start);
            prop_assert_eq!(leaves.last().unwrap().range.end, full.end);
            for pair in leaves.windows(2) {
                prop_assert_eq!(pair[0].range.end, pair[1].range.start);
            }
            for leaf in &leaves {
                prop_assert!(leaf.range.is_hour_aligned());
                prop_assert!(
                    leaf.estimated_pages <= PAGE_CAP || leaf.range.hours() == 1,
                    "leaf over cap wider than an hour"
                );
            }
            Ok(())
        })?;
    }
}
