//! Ledger amounts.
//!
//! Every amount that ends up on the ledger (entry price, prize pool, rewards) is an
//! arbitrary-precision integer in the ledger's smallest unit. Amounts travel as
//! decimal strings in JSON and in SQLite so nothing is ever widened through `f64`.

use num_bigint::BigUint;
use num_traits::Zero;
use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer, Serializer};
use std::str::FromStr;

/// Parse a base-10 amount string.
pub fn parse(value: &str) -> Option<BigUint> {
    BigUint::from_str(value.trim()).ok()
}

/// `floor(amount * percentage / 100)` with an exact decimal percentage.
///
/// Negative percentages yield zero.
pub fn percent_of(amount: &BigUint, percentage: Decimal) -> BigUint {
    if percentage.is_sign_negative() || percentage.is_zero() {
        return BigUint::zero();
    }
    let mantissa = BigUint::from(percentage.mantissa().unsigned_abs());
    let divisor = BigUint::from(100u32) * BigUint::from(10u32).pow(percentage.scale());
    amount * mantissa / divisor
}

pub fn serialize<S>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&value.to_str_radix(10))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<BigUint, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Text(s) => parse(&s).ok_or_else(|| de::Error::custom(format!("invalid amount: {}", s))),
        Raw::Number(n) => Ok(BigUint::from(n)),
    }
}
