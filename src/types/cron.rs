//! Game Cron Types
//!
//! A cron is an operator-defined template that spawns games.

use crate::types::{NewGame, WinCondition};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CronType {
    /// Fires once, then deactivates
    Once,
    /// Fires every `recurring_schedule_hours`
    Recurring,
}

impl fmt::Display for CronType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CronType::Once => write!(f, "ONCE"),
            CronType::Recurring => write!(f, "RECURRING"),
        }
    }
}

impl FromStr for CronType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONCE" => Ok(CronType::Once),
            "RECURRING" => Ok(CronType::Recurring),
            other => Err(format!("unknown cron type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameCron {
    pub id: i64,
    pub game_type: String,
    pub cron_type: CronType,
    #[serde(with = "crate::types::amount")]
    pub entry_price: BigUint,
    /// Delay between firing and game start
    pub start_offset_minutes: i64,
    pub game_duration_hours: i64,
    pub entry_cap: u32,
    pub win_condition: WinCondition,
    pub recurring_schedule_hours: i64,
    pub next_execution: i64,
    pub last_executed: Option<i64>,
    pub is_active: bool,
    pub created_at: i64,
}

impl GameCron {
    pub fn is_due(&self, now: i64) -> bool {
        self.is_active && self.next_execution <= now
    }

    /// Game parameters for a firing at `now`.
    pub fn new_game(&self, now: i64) -> NewGame {
        let start_time = now + self.start_offset_minutes * MINUTE_MS;
        NewGame {
            game_type: self.game_type.clone(),
            start_time,
            end_time: start_time + self.game_duration_hours * HOUR_MS,
            entry_price: self.entry_price.clone(),
            entry_cap: self.entry_cap,
            win_condition: self.win_condition.clone(),
            game_cron_id: Some(self.id),
            scheduled_for: Some(self.next_execution),
        }
    }

    /// Advance the schedule after a successful firing.
    pub fn record_firing(&mut self, now: i64) {
        self.last_executed = Some(now);
        match self.cron_type {
            CronType::Once => self.is_active = false,
            CronType::Recurring => {
                self.next_execution += self.recurring_schedule_hours * HOUR_MS;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cron(cron_type: CronType) -> GameCron {
        GameCron {
            id: 7,
            game_type: "crypto".to_string(),
            cron_type,
            entry_price: BigUint::from(1_000u32),
            start_offset_minutes: 30,
            game_duration_hours: 24,
            entry_cap: 100,
            win_condition: WinCondition::marlowe_banes(),
            recurring_schedule_hours: 6,
            next_execution: 10 * HOUR_MS,
            last_executed: None,
            is_active: true,
            created_at: 0,
        }
    }

    #[test]
    fn test_once_deactivates_after_firing() {
        let mut c = cron(CronType::Once);
        assert!(c.is_due(10 * HOUR_MS));
        c.record_firing(10 * HOUR_MS);
        assert!(!c.is_active);
        assert!(!c.is_due(100 * HOUR_MS));
        assert_eq!(c.last_executed, Some(10 * HOUR_MS));
    }

    #[test]
    fn test_recurring_reschedules() {
        let mut c = cron(CronType::Recurring);
        c.record_firing(10 * HOUR_MS + 5);
        assert!(c.is_active);
        assert_eq!(c.next_execution, 16 * HOUR_MS);
        assert!(!c.is_due(15 * HOUR_MS));
    }

    #[test]
    fn test_new_game_window() {
        let c = cron(CronType::Once);
        let game = c.new_game(0);
        assert_eq!(game.start_time, 30 * MINUTE_MS);
        assert_eq!(game.end_time, 30 * MINUTE_MS + 24 * HOUR_MS);
        assert_eq!(game.game_cron_id, Some(7));
        assert_eq!(game.scheduled_for, Some(10 * HOUR_MS));
    }
}
