pub mod distributor;
pub mod ledger;
pub mod locker;
pub mod notifier;
pub mod paper_ledger;
pub mod price_cache;
pub mod reconciler;
pub mod recommender;
pub mod run_lock;
pub mod scheduler;
pub mod sqlite_store;
pub mod winners;

pub use distributor::{DistributionReport, RewardDistributor};
pub use ledger::{synthetic_reference, with_backoff, Ledger, LedgerError, RetryPolicy};
pub use locker::{lock_portfolio, LockError, PortfolioLocker};
pub use notifier::{NotificationSink, Notifier};
pub use paper_ledger::{PaperLedger, PaperPayout};
pub use price_cache::{PriceCache, PriceFeed, PriceFeedError};
pub use reconciler::{ReconcileOutcome, ReconcileReport, TransactionReconciler};
pub use recommender::{FallbackRecommender, PortfolioRecommender, SmartPortfolio};
pub use run_lock::RunLocks;
pub use scheduler::{GameLifecycleScheduler, HandlerStats, TickReport};
pub use sqlite_store::{ConfirmedEntry, SqliteStore, StoreError, UserStats};
pub use winners::{rank_portfolios, settle, CalculationReport, WinnerCalculator};
