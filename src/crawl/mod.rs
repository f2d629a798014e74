//! Keyword crawling: time sharding, task lifecycle, checkpoints, execution

pub mod checkpoint;
pub mod engine;
pub mod sharder;
pub mod task;
pub mod time_range;
mod worker;

pub use checkpoint::{CheckpointStore, CrawlCheckpoint, Direction};
pub use engine::{CrawlEngine, TaskStats};
pub use sharder::{PageProbe, TimeShard, TimeSharder, PAGE_CAP};
pub use task::{CrawlTask, SortOrder, TaskSortField, TaskStatus, TaskStore};
pub use time_range::TimeRange;
