pub mod amount;
pub mod cron;
pub mod game;
pub mod ledger;
pub mod notification;
pub mod portfolio;
pub mod price;
pub mod transaction;

pub use cron::*;
pub use game::*;
pub use ledger::*;
pub use notification::*;
pub use portfolio::*;
pub use price::*;
pub use transaction::*;

/// Current UTC time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
