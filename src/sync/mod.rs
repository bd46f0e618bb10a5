//! Decided history synchronization between committee members.
//!
//! `RequestHandler` answers peers from local storage; `HistorySync` pulls the highest decided
//! message and backfills missing ranges; `ChangeRoundSpeedup` fetches peers' latest change round
//! messages so a lagging instance can catch up without waiting for its timers.

pub mod handler;
pub mod history;
pub mod speedup;

pub use handler::RequestHandler;
pub use history::{HistorySync, SyncOutcome};
pub use speedup::ChangeRoundSpeedup;
