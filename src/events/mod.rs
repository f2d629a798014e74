//! Back-end → front-end event fan-out

pub mod bus;
pub mod types;

pub use bus::EventBus;
pub use types::{CrawlProgress, HarvestEvent, LoginEvent, LoginEventType};
