//! SQLite persistence layer for games, portfolios, crons and settlement records.
//!
//! Every read returns an owned snapshot. Status changes are compare-and-swap
//! updates (`WHERE status = ?from`) so a transition is applied at most once no
//! matter how many ticks race for it. Multi-row settlement writes run inside a
//! single SQL transaction.

use crate::types::{
    amount, ApePortfolio, CronType, Game, GameCron, GameOutcome, GameStatus, NewGame, Placement,
    Portfolio, PortfolioStatus, Transaction, TransactionType, Winner,
};
use num_bigint::BigUint;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
#[error("{0}")]
struct InvalidColumn(String);

/// Per-user aggregate of settled games.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub user_id: String,
    pub games_played: u64,
    pub games_won: u64,
    #[serde(with = "crate::types::amount")]
    pub total_rewards: BigUint,
    pub updated_at: i64,
}

/// A ledger-confirmed entry ready to be applied locally.
#[derive(Debug, Clone)]
pub struct ConfirmedEntry {
    pub portfolio_id: u64,
    pub game_id: u64,
    pub transaction: Transaction,
    /// Entry count reported by the ledger
    pub ledger_participants: u64,
    /// Prize pool reported by the ledger
    pub ledger_prize_pool: BigUint,
}

const GAME_COLUMNS: &str = "game_id, status, game_type, start_time, end_time, entry_price,
    entry_cap, total_prize_pool, participant_count, win_condition_json,
    has_calculated_winners, is_fully_distributed, ape_portfolio_json, error,
    game_cron_id, scheduled_for, creation_tx_hash, created_at, updated_at";

const PORTFOLIO_COLUMNS: &str = "portfolio_id, game_id, user_id, wallet_address, assets_json,
    status, is_locked, is_ape, initial_value, current_value, performance_percentage,
    game_outcome_json, retry_count, last_retry_at, transaction_hash, locked_at, error,
    created_at, updated_at";

const WINNER_COLUMNS: &str = "user_id, portfolio_id, winner_rank, performance_percentage,
    reward, is_ape, is_reward_distributed, distribution_ref";

const CRON_COLUMNS: &str = "id, game_type, cron_type, entry_price, start_offset_minutes,
    game_duration_hours, entry_cap, win_condition_json, recurring_schedule_hours,
    next_execution, last_executed, is_active, created_at";

const TRANSACTION_COLUMNS: &str = "id, transaction_hash, user_id, tx_type, amount, game_id,
    portfolio_id, status, block_number, gas_used, effective_gas_price, created_at";

// ========== Row decoding ==========

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn json_at<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_json_at<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn amount_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<BigUint> {
    let raw: String = row.get(idx)?;
    amount::parse(&raw)
        .ok_or_else(|| conversion_error(idx, InvalidColumn(format!("invalid amount: {}", raw))))
}

fn enum_at<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, InvalidColumn(e)))
}

fn id_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    Ok(row.get::<_, i64>(idx)? as u64)
}

fn opt_u64_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(|v| v as u64))
}

fn game_from_row(row: &Row<'_>) -> rusqlite::Result<Game> {
    Ok(Game {
        game_id: id_at(row, 0)?,
        status: enum_at(row, 1)?,
        game_type: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        entry_price: amount_at(row, 5)?,
        entry_cap: row.get(6)?,
        total_prize_pool: amount_at(row, 7)?,
        participant_count: id_at(row, 8)?,
        win_condition: json_at(row, 9)?,
        winners: Vec::new(),
        has_calculated_winners: row.get(10)?,
        is_fully_distributed: row.get(11)?,
        ape_portfolio: opt_json_at(row, 12)?,
        error: row.get(13)?,
        game_cron_id: row.get(14)?,
        scheduled_for: row.get(15)?,
        creation_tx_hash: row.get(16)?,
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
    })
}

fn portfolio_from_row(row: &Row<'_>) -> rusqlite::Result<Portfolio> {
    Ok(Portfolio {
        portfolio_id: id_at(row, 0)?,
        game_id: id_at(row, 1)?,
        user_id: row.get(2)?,
        wallet_address: row.get(3)?,
        assets: json_at(row, 4)?,
        status: enum_at(row, 5)?,
        is_locked: row.get(6)?,
        is_ape: row.get(7)?,
        initial_value: row.get(8)?,
        current_value: row.get(9)?,
        performance_percentage: row.get(10)?,
        game_outcome: opt_json_at(row, 11)?,
        retry_count: row.get(12)?,
        last_retry_at: row.get(13)?,
        transaction_hash: row.get(14)?,
        locked_at: row.get(15)?,
        error: row.get(16)?,
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
    })
}

fn winner_from_row(row: &Row<'_>) -> rusqlite::Result<Winner> {
    Ok(Winner {
        user_id: row.get(0)?,
        portfolio_id: id_at(row, 1)?,
        rank: row.get(2)?,
        performance_percentage: row.get(3)?,
        reward: amount_at(row, 4)?,
        is_ape: row.get(5)?,
        is_reward_distributed: row.get(6)?,
        distribution_ref: row.get(7)?,
    })
}

fn cron_from_row(row: &Row<'_>) -> rusqlite::Result<GameCron> {
    Ok(GameCron {
        id: row.get(0)?,
        game_type: row.get(1)?,
        cron_type: enum_at::<CronType>(row, 2)?,
        entry_price: amount_at(row, 3)?,
        start_offset_minutes: row.get(4)?,
        game_duration_hours: row.get(5)?,
        entry_cap: row.get(6)?,
        win_condition: json_at(row, 7)?,
        recurring_schedule_hours: row.get(8)?,
        next_execution: row.get(9)?,
        last_executed: row.get(10)?,
        is_active: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        transaction_hash: row.get(1)?,
        user_id: row.get(2)?,
        tx_type: enum_at::<TransactionType>(row, 3)?,
        amount: amount_at(row, 4)?,
        game_id: id_at(row, 5)?,
        portfolio_id: id_at(row, 6)?,
        status: enum_at(row, 7)?,
        block_number: opt_u64_at(row, 8)?,
        gas_used: opt_u64_at(row, 9)?,
        effective_gas_price: opt_u64_at(row, 10)?,
        created_at: row.get(11)?,
    })
}

// ========== Connection-level helpers (caller holds the lock) ==========

fn winners_in(conn: &Connection, game_id: u64) -> rusqlite::Result<Vec<Winner>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM game_winners WHERE game_id = ?1 ORDER BY winner_rank ASC, id ASC",
        WINNER_COLUMNS
    ))?;
    let winners = stmt
        .query_map(params![game_id as i64], winner_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(winners)
}

fn games_with_winners(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> rusqlite::Result<Vec<Game>> {
    let mut stmt = conn.prepare(sql)?;
    let mut games = stmt
        .query_map(args, game_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for game in &mut games {
        game.winners = winners_in(conn, game.game_id)?;
    }
    Ok(games)
}

fn insert_transaction_in(conn: &Connection, tx: &Transaction) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO transactions ({})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            TRANSACTION_COLUMNS
        ),
        params![
            tx.id,
            tx.transaction_hash,
            tx.user_id,
            tx.tx_type.to_string(),
            tx.amount.to_str_radix(10),
            tx.game_id as i64,
            tx.portfolio_id as i64,
            tx.status.to_string(),
            tx.block_number.map(|v| v as i64),
            tx.gas_used.map(|v| v as i64),
            tx.effective_gas_price.map(|v| v as i64),
            tx.created_at,
        ],
    )?;
    Ok(changed > 0)
}

/// SQLite store for settlement state.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create a new SQLite store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("SQLite store initialized");
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!("In-memory SQLite store initialized");
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS games (
                game_id INTEGER PRIMARY KEY AUTOINCREMENT,
                status TEXT NOT NULL,
                game_type TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER NOT NULL,
                entry_price TEXT NOT NULL,
                entry_cap INTEGER NOT NULL,
                total_prize_pool TEXT NOT NULL DEFAULT '0',
                participant_count INTEGER NOT NULL DEFAULT 0,
                win_condition_json TEXT NOT NULL,
                has_calculated_winners INTEGER NOT NULL DEFAULT 0,
                is_fully_distributed INTEGER NOT NULL DEFAULT 0,
                ape_portfolio_json TEXT,
                error TEXT,
                game_cron_id INTEGER,
                scheduled_for INTEGER,
                creation_tx_hash TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_games_status_updated ON games(status, updated_at);
            CREATE INDEX IF NOT EXISTS idx_games_cron ON games(game_cron_id, scheduled_for);

            CREATE TABLE IF NOT EXISTS game_winners (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                game_id INTEGER NOT NULL REFERENCES games(game_id),
                portfolio_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                winner_rank INTEGER NOT NULL,
                performance_percentage REAL NOT NULL,
                reward TEXT NOT NULL,
                is_ape INTEGER NOT NULL DEFAULT 0,
                is_reward_distributed INTEGER NOT NULL DEFAULT 0,
                distribution_ref TEXT,
                UNIQUE(game_id, portfolio_id)
            );

            CREATE TABLE IF NOT EXISTS portfolios (
                portfolio_id INTEGER PRIMARY KEY,
                game_id INTEGER NOT NULL REFERENCES games(game_id),
                user_id TEXT NOT NULL,
                wallet_address TEXT NOT NULL,
                assets_json TEXT NOT NULL,
                status TEXT NOT NULL,
                is_locked INTEGER NOT NULL DEFAULT 0,
                is_ape INTEGER NOT NULL DEFAULT 0,
                initial_value REAL NOT NULL,
                current_value REAL NOT NULL,
                performance_percentage REAL NOT NULL DEFAULT 0,
                game_outcome_json TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_retry_at INTEGER,
                transaction_hash TEXT,
                locked_at INTEGER,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_portfolios_status_updated
                ON portfolios(status, updated_at);
            CREATE INDEX IF NOT EXISTS idx_portfolios_game_created
                ON portfolios(game_id, created_at);

            CREATE TABLE IF NOT EXISTS game_crons (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                game_type TEXT NOT NULL,
                cron_type TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                start_offset_minutes INTEGER NOT NULL,
                game_duration_hours INTEGER NOT NULL,
                entry_cap INTEGER NOT NULL,
                win_condition_json TEXT NOT NULL,
                recurring_schedule_hours INTEGER NOT NULL DEFAULT 0,
                next_execution INTEGER NOT NULL,
                last_executed INTEGER,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_crons_active_next
                ON game_crons(is_active, next_execution);

            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                transaction_hash TEXT NOT NULL,
                user_id TEXT NOT NULL,
                tx_type TEXT NOT NULL,
                amount TEXT NOT NULL,
                game_id INTEGER NOT NULL,
                portfolio_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                block_number INTEGER,
                gas_used INTEGER,
                effective_gas_price INTEGER,
                created_at INTEGER NOT NULL,
                UNIQUE(transaction_hash, portfolio_id)
            );
            CREATE INDEX IF NOT EXISTS idx_transactions_portfolio ON transactions(portfolio_id);

            CREATE TABLE IF NOT EXISTS user_stats (
                user_id TEXT PRIMARY KEY,
                games_played INTEGER NOT NULL DEFAULT 0,
                games_won INTEGER NOT NULL DEFAULT 0,
                total_rewards TEXT NOT NULL DEFAULT '0',
                updated_at INTEGER NOT NULL
            );",
        )?;

        info!("SQLite schema initialized");
        Ok(())
    }

    // ========== Game Methods ==========

    /// Insert a new game in `TRX_PENDING`; the store assigns its id.
    pub fn insert_game(&self, new_game: &NewGame, now: i64) -> Result<Game, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO games (status, game_type, start_time, end_time, entry_price, entry_cap,
                 total_prize_pool, participant_count, win_condition_json, game_cron_id,
                 scheduled_for, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, '0', 0, ?7, ?8, ?9, ?10, ?10)",
            params![
                GameStatus::TrxPending.as_str(),
                new_game.game_type,
                new_game.start_time,
                new_game.end_time,
                new_game.entry_price.to_str_radix(10),
                new_game.entry_cap,
                serde_json::to_string(&new_game.win_condition)?,
                new_game.game_cron_id,
                new_game.scheduled_for,
                now,
            ],
        )?;
        let game_id = conn.last_insert_rowid() as u64;
        debug!("Inserted game {}", game_id);

        let game = conn.query_row(
            &format!("SELECT {} FROM games WHERE game_id = ?1", GAME_COLUMNS),
            params![game_id as i64],
            game_from_row,
        )?;
        Ok(game)
    }

    /// Get a game with its winners.
    pub fn get_game(&self, game_id: u64) -> Result<Option<Game>, StoreError> {
        let conn = self.conn()?;
        let game = conn
            .query_row(
                &format!("SELECT {} FROM games WHERE game_id = ?1", GAME_COLUMNS),
                params![game_id as i64],
                game_from_row,
            )
            .optional()?;
        match game {
            Some(mut game) => {
                game.winners = winners_in(&conn, game_id)?;
                Ok(Some(game))
            }
            None => Ok(None),
        }
    }

    /// Games in a status, oldest first.
    pub fn games_by_status(&self, status: GameStatus, limit: usize) -> Result<Vec<Game>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM games WHERE status = ?1
             ORDER BY created_at ASC, game_id ASC LIMIT ?2",
            GAME_COLUMNS
        );
        Ok(games_with_winners(
            &conn,
            &sql,
            params![status.as_str(), limit as i64],
        )?)
    }

    /// `UPCOMING` games whose start time has passed, oldest first.
    pub fn upcoming_games_due(&self, now: i64, limit: usize) -> Result<Vec<Game>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM games WHERE status = ?1 AND start_time <= ?2
             ORDER BY created_at ASC, game_id ASC LIMIT ?3",
            GAME_COLUMNS
        );
        Ok(games_with_winners(
            &conn,
            &sql,
            params![GameStatus::Upcoming.as_str(), now, limit as i64],
        )?)
    }

    /// `ACTIVE` games on one side of their end time, oldest first.
    pub fn active_games(&self, now: i64, ended: bool, limit: usize) -> Result<Vec<Game>, StoreError> {
        let conn = self.conn()?;
        let comparison = if ended { "<=" } else { ">" };
        let sql = format!(
            "SELECT {} FROM games WHERE status = ?1 AND end_time {} ?2
             ORDER BY created_at ASC, game_id ASC LIMIT ?3",
            GAME_COLUMNS, comparison
        );
        Ok(games_with_winners(
            &conn,
            &sql,
            params![GameStatus::Active.as_str(), now, limit as i64],
        )?)
    }

    /// Oldest game with calculated but not fully distributed rewards.
    pub fn oldest_undistributed_game(&self) -> Result<Option<Game>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM games
             WHERE status = ?1 AND has_calculated_winners = 1 AND is_fully_distributed = 0
             ORDER BY created_at ASC, game_id ASC LIMIT 1",
            GAME_COLUMNS
        );
        let mut games = games_with_winners(
            &conn,
            &sql,
            params![GameStatus::CalculatingWinners.as_str()],
        )?;
        Ok(games.pop())
    }

    /// Game already created for a cron firing, in any status.
    pub fn game_for_cron_firing(
        &self,
        cron_id: i64,
        scheduled_for: i64,
    ) -> Result<Option<Game>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM games
             WHERE game_cron_id = ?1 AND scheduled_for = ?2
             ORDER BY game_id ASC LIMIT 1",
            GAME_COLUMNS
        );
        let mut games = games_with_winners(&conn, &sql, params![cron_id, scheduled_for])?;
        Ok(games.pop())
    }

    /// Record the ledger registration hash of a game.
    pub fn set_creation_tx(&self, game_id: u64, tx_hash: &str, now: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE games SET creation_tx_hash = ?1, updated_at = ?2 WHERE game_id = ?3",
            params![tx_hash, now, game_id as i64],
        )?;
        Ok(())
    }

    /// Move a game from `from` to `to`. Returns false when the game was not in `from`.
    pub fn transition_game(
        &self,
        game_id: u64,
        from: GameStatus,
        to: GameStatus,
        now: i64,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE games SET status = ?1, updated_at = ?2 WHERE game_id = ?3 AND status = ?4",
            params![to.as_str(), now, game_id as i64, from.as_str()],
        )?;
        if changed > 0 {
            info!("Game {} {} -> {}", game_id, from, to);
        }
        Ok(changed > 0)
    }

    /// Fail a game that has not reached a terminal status.
    pub fn fail_game(&self, game_id: u64, error: &str, now: i64) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE games SET status = ?1, error = ?2, updated_at = ?3
             WHERE game_id = ?4 AND status NOT IN (?5, ?1)",
            params![
                GameStatus::Failed.as_str(),
                error,
                now,
                game_id as i64,
                GameStatus::Completed.as_str(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Store the opponent summary. Settled games keep their final summary;
    /// returns false for them.
    pub fn set_ape_portfolio(
        &self,
        game_id: u64,
        ape: &ApePortfolio,
        now: i64,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE games SET ape_portfolio_json = ?1, updated_at = ?2
             WHERE game_id = ?3 AND has_calculated_winners = 0",
            params![serde_json::to_string(ape)?, now, game_id as i64],
        )?;
        Ok(changed > 0)
    }

    /// Persist final standings, append winners and mark the game calculated.
    ///
    /// Returns false without writing anything when the game is not awaiting
    /// calculation.
    pub fn record_settlement(
        &self,
        game_id: u64,
        placements: &[Placement],
        now: i64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let claimed = tx.execute(
            "UPDATE games SET has_calculated_winners = 1, updated_at = ?1
             WHERE game_id = ?2 AND status = ?3 AND has_calculated_winners = 0",
            params![now, game_id as i64, GameStatus::CalculatingWinners.as_str()],
        )?;
        if claimed == 0 {
            return Ok(false);
        }

        for placement in placements {
            let outcome = GameOutcome {
                is_winner: placement.is_winner,
                reward: placement.reward.clone(),
                rank: placement.rank,
                settled_at: now,
                reward_transaction_ref: None,
            };
            let status = if placement.is_winner {
                PortfolioStatus::Won
            } else {
                PortfolioStatus::Lost
            };
            tx.execute(
                "UPDATE portfolios SET status = ?1, game_outcome_json = ?2, updated_at = ?3
                 WHERE portfolio_id = ?4",
                params![
                    status.as_str(),
                    serde_json::to_string(&outcome)?,
                    now,
                    placement.portfolio_id as i64,
                ],
            )?;

            if placement.is_winner {
                tx.execute(
                    "INSERT OR IGNORE INTO game_winners
                     (game_id, portfolio_id, user_id, winner_rank, performance_percentage,
                      reward, is_ape)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        game_id as i64,
                        placement.portfolio_id as i64,
                        placement.user_id,
                        placement.rank,
                        placement.performance_percentage,
                        placement.reward.to_str_radix(10),
                        placement.is_ape,
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(true)
    }

    /// Mark a game fully distributed and completed.
    pub fn complete_distribution(&self, game_id: u64, now: i64) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE games SET is_fully_distributed = 1, status = ?1, updated_at = ?2
             WHERE game_id = ?3 AND status = ?4 AND has_calculated_winners = 1",
            params![
                GameStatus::Completed.as_str(),
                now,
                game_id as i64,
                GameStatus::CalculatingWinners.as_str(),
            ],
        )?;
        if changed > 0 {
            info!("Game {} fully distributed", game_id);
        }
        Ok(changed > 0)
    }

    // ========== Winner Methods ==========

    pub fn winners_for_game(&self, game_id: u64) -> Result<Vec<Winner>, StoreError> {
        let conn = self.conn()?;
        Ok(winners_in(&conn, game_id)?)
    }

    /// Record a payout reference against winners and their portfolios.
    ///
    /// Only winners not yet distributed are touched; returns how many were.
    pub fn mark_winners_distributed(
        &self,
        game_id: u64,
        portfolio_ids: &[u64],
        reference: &str,
        transactions: &[Transaction],
        now: i64,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut marked = 0;

        for portfolio_id in portfolio_ids {
            let changed = tx.execute(
                "UPDATE game_winners SET is_reward_distributed = 1, distribution_ref = ?1
                 WHERE game_id = ?2 AND portfolio_id = ?3 AND is_reward_distributed = 0",
                params![reference, game_id as i64, *portfolio_id as i64],
            )?;
            if changed == 0 {
                continue;
            }
            marked += 1;

            let outcome_json: Option<String> = tx
                .query_row(
                    "SELECT game_outcome_json FROM portfolios WHERE portfolio_id = ?1",
                    params![*portfolio_id as i64],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            if let Some(raw) = outcome_json {
                let mut outcome: GameOutcome = serde_json::from_str(&raw)?;
                outcome.reward_transaction_ref = Some(reference.to_string());
                tx.execute(
                    "UPDATE portfolios SET game_outcome_json = ?1, updated_at = ?2
                     WHERE portfolio_id = ?3",
                    params![serde_json::to_string(&outcome)?, now, *portfolio_id as i64],
                )?;
            }
        }

        for record in transactions {
            insert_transaction_in(&tx, record)?;
        }

        tx.commit()?;
        Ok(marked)
    }

    // ========== Portfolio Methods ==========

    /// Insert a portfolio; returns false if the id already exists.
    pub fn insert_portfolio(&self, portfolio: &Portfolio) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO portfolios ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                         ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                PORTFOLIO_COLUMNS
            ),
            params![
                portfolio.portfolio_id as i64,
                portfolio.game_id as i64,
                portfolio.user_id,
                portfolio.wallet_address,
                serde_json::to_string(&portfolio.assets)?,
                portfolio.status.as_str(),
                portfolio.is_locked,
                portfolio.is_ape,
                portfolio.initial_value,
                portfolio.current_value,
                portfolio.performance_percentage,
                portfolio
                    .game_outcome
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                portfolio.retry_count,
                portfolio.last_retry_at,
                portfolio.transaction_hash,
                portfolio.locked_at,
                portfolio.error,
                portfolio.created_at,
                portfolio.updated_at,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_portfolio(&self, portfolio_id: u64) -> Result<Option<Portfolio>, StoreError> {
        let conn = self.conn()?;
        let portfolio = conn
            .query_row(
                &format!("SELECT {} FROM portfolios WHERE portfolio_id = ?1", PORTFOLIO_COLUMNS),
                params![portfolio_id as i64],
                portfolio_from_row,
            )
            .optional()?;
        Ok(portfolio)
    }

    /// Write back the mutable fields of a portfolio.
    pub fn update_portfolio(&self, portfolio: &Portfolio, now: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE portfolios SET assets_json = ?1, status = ?2, is_locked = ?3,
                 current_value = ?4, performance_percentage = ?5, game_outcome_json = ?6,
                 retry_count = ?7, last_retry_at = ?8, transaction_hash = ?9, locked_at = ?10,
                 error = ?11, updated_at = ?12
             WHERE portfolio_id = ?13",
            params![
                serde_json::to_string(&portfolio.assets)?,
                portfolio.status.as_str(),
                portfolio.is_locked,
                portfolio.current_value,
                portfolio.performance_percentage,
                portfolio
                    .game_outcome
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                portfolio.retry_count,
                portfolio.last_retry_at,
                portfolio.transaction_hash,
                portfolio.locked_at,
                portfolio.error,
                now,
                portfolio.portfolio_id as i64,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!(
                "portfolio {}",
                portfolio.portfolio_id
            )));
        }
        Ok(())
    }

    /// Write repriced holdings of a portfolio that is still `LOCKED`.
    ///
    /// Status and outcome are left alone. Returns false when the portfolio has
    /// left `LOCKED` since it was read, e.g. because its game settled.
    pub fn update_portfolio_values(
        &self,
        portfolio: &Portfolio,
        now: i64,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE portfolios SET assets_json = ?1, current_value = ?2,
                 performance_percentage = ?3, updated_at = ?4
             WHERE portfolio_id = ?5 AND status = ?6",
            params![
                serde_json::to_string(&portfolio.assets)?,
                portfolio.current_value,
                portfolio.performance_percentage,
                now,
                portfolio.portfolio_id as i64,
                PortfolioStatus::Locked.as_str(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Portfolios of a game in creation order, optionally filtered by status.
    pub fn portfolios_for_game(
        &self,
        game_id: u64,
        status: Option<PortfolioStatus>,
    ) -> Result<Vec<Portfolio>, StoreError> {
        let conn = self.conn()?;
        let portfolios = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM portfolios WHERE game_id = ?1 AND status = ?2
                     ORDER BY created_at ASC, portfolio_id ASC",
                    PORTFOLIO_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![game_id as i64, status.as_str()], portfolio_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM portfolios WHERE game_id = ?1
                     ORDER BY created_at ASC, portfolio_id ASC",
                    PORTFOLIO_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![game_id as i64], portfolio_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(portfolios)
    }

    /// Portfolios in a status across all games, oldest first.
    pub fn portfolios_by_status(
        &self,
        status: PortfolioStatus,
        limit: usize,
    ) -> Result<Vec<Portfolio>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM portfolios WHERE status = ?1
             ORDER BY created_at ASC, portfolio_id ASC LIMIT ?2",
            PORTFOLIO_COLUMNS
        ))?;
        let portfolios = stmt
            .query_map(params![status.as_str(), limit as i64], portfolio_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(portfolios)
    }

    pub fn set_portfolio_error(
        &self,
        portfolio_id: u64,
        error: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE portfolios SET error = ?1, updated_at = ?2 WHERE portfolio_id = ?3",
            params![error, now, portfolio_id as i64],
        )?;
        Ok(())
    }

    /// Fail a portfolio still in `expected`. Returns false if it had moved on.
    pub fn fail_portfolio(
        &self,
        portfolio_id: u64,
        expected: PortfolioStatus,
        reason: &str,
        now: i64,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE portfolios SET status = ?1, error = ?2, updated_at = ?3
             WHERE portfolio_id = ?4 AND status = ?5",
            params![
                PortfolioStatus::Failed.as_str(),
                reason,
                now,
                portfolio_id as i64,
                expected.as_str(),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn record_reconcile_retry(
        &self,
        portfolio_id: u64,
        retry_count: u32,
        now: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE portfolios SET retry_count = ?1, last_retry_at = ?2, updated_at = ?2
             WHERE portfolio_id = ?3",
            params![retry_count, now, portfolio_id as i64],
        )?;
        Ok(())
    }

    /// Apply a ledger-confirmed entry: record its transaction, raise the game
    /// aggregates to at least the ledger's values, and move the portfolio to `PENDING`.
    ///
    /// Returns false without writing when the portfolio is no longer awaiting confirmation.
    pub fn confirm_entry(&self, entry: &ConfirmedEntry, now: i64) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let moved = tx.execute(
            "UPDATE portfolios SET status = ?1, error = NULL, updated_at = ?2
             WHERE portfolio_id = ?3 AND status = ?4",
            params![
                PortfolioStatus::Pending.as_str(),
                now,
                entry.portfolio_id as i64,
                PortfolioStatus::PendingLockBalance.as_str(),
            ],
        )?;
        if moved == 0 {
            return Ok(false);
        }

        insert_transaction_in(&tx, &entry.transaction)?;

        let (participants, pool): (i64, String) = tx
            .query_row(
                "SELECT participant_count, total_prize_pool FROM games WHERE game_id = ?1",
                params![entry.game_id as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("game {}", entry.game_id)))?;
        let local_pool = amount::parse(&pool).unwrap_or_default();

        let merged_participants = (participants as u64).max(entry.ledger_participants);
        let merged_pool = local_pool.max(entry.ledger_prize_pool.clone());

        tx.execute(
            "UPDATE games SET participant_count = ?1, total_prize_pool = ?2, updated_at = ?3
             WHERE game_id = ?4",
            params![
                merged_participants as i64,
                merged_pool.to_str_radix(10),
                now,
                entry.game_id as i64,
            ],
        )?;

        tx.commit()?;
        Ok(true)
    }

    // ========== Cron Methods ==========

    /// Insert a cron template; the store assigns its id.
    pub fn insert_cron(&self, cron: &GameCron) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO game_crons (game_type, cron_type, entry_price, start_offset_minutes,
                 game_duration_hours, entry_cap, win_condition_json, recurring_schedule_hours,
                 next_execution, last_executed, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                cron.game_type,
                cron.cron_type.to_string(),
                cron.entry_price.to_str_radix(10),
                cron.start_offset_minutes,
                cron.game_duration_hours,
                cron.entry_cap,
                serde_json::to_string(&cron.win_condition)?,
                cron.recurring_schedule_hours,
                cron.next_execution,
                cron.last_executed,
                cron.is_active,
                cron.created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_cron(&self, id: i64) -> Result<Option<GameCron>, StoreError> {
        let conn = self.conn()?;
        let cron = conn
            .query_row(
                &format!("SELECT {} FROM game_crons WHERE id = ?1", CRON_COLUMNS),
                params![id],
                cron_from_row,
            )
            .optional()?;
        Ok(cron)
    }

    /// Active crons whose next execution has passed, earliest first.
    pub fn due_crons(&self, now: i64, limit: usize) -> Result<Vec<GameCron>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM game_crons WHERE is_active = 1 AND next_execution <= ?1
             ORDER BY next_execution ASC, id ASC LIMIT ?2",
            CRON_COLUMNS
        ))?;
        let crons = stmt
            .query_map(params![now, limit as i64], cron_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(crons)
    }

    pub fn active_cron_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM game_crons WHERE is_active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Persist the schedule fields of a cron after a firing.
    pub fn update_cron_schedule(&self, cron: &GameCron) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE game_crons SET next_execution = ?1, last_executed = ?2, is_active = ?3
             WHERE id = ?4",
            params![cron.next_execution, cron.last_executed, cron.is_active, cron.id],
        )?;
        Ok(())
    }

    // ========== Transaction Methods ==========

    /// Insert a transaction record; duplicates of (hash, portfolio) are ignored.
    pub fn insert_transaction(&self, record: &Transaction) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        Ok(insert_transaction_in(&conn, record)?)
    }

    pub fn transactions_for_game(&self, game_id: u64) -> Result<Vec<Transaction>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM transactions WHERE game_id = ?1 ORDER BY created_at ASC, id ASC",
            TRANSACTION_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![game_id as i64], transaction_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn transactions_for_portfolio(
        &self,
        portfolio_id: u64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM transactions WHERE portfolio_id = ?1 ORDER BY created_at ASC, id ASC",
            TRANSACTION_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![portfolio_id as i64], transaction_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    // ========== User Stats Methods ==========

    /// Count one settled game for a user.
    pub fn record_user_outcome(
        &self,
        user_id: &str,
        is_winner: bool,
        reward: &BigUint,
        now: i64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT total_rewards FROM user_stats WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        let total = current
            .and_then(|raw| amount::parse(&raw))
            .unwrap_or_default()
            + reward;

        tx.execute(
            "INSERT INTO user_stats (user_id, games_played, games_won, total_rewards, updated_at)
             VALUES (?1, 1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                games_played = games_played + 1,
                games_won = games_won + excluded.games_won,
                total_rewards = excluded.total_rewards,
                updated_at = excluded.updated_at",
            params![user_id, is_winner as i64, total.to_str_radix(10), now],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn get_user_stats(&self, user_id: &str) -> Result<Option<UserStats>, StoreError> {
        let conn = self.conn()?;
        let stats = conn
            .query_row(
                "SELECT user_id, games_played, games_won, total_rewards, updated_at
                 FROM user_stats WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(UserStats {
                        user_id: row.get(0)?,
                        games_played: id_at(row, 1)?,
                        games_won: id_at(row, 2)?,
                        total_rewards: amount_at(row, 3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(stats)
    }
}
