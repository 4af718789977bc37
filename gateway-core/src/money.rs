//! Fixed-point monetary scalar with an explicit currency tag and no implicit float conversion.

use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{borrow::Borrow, str::FromStr};
use thiserror::Error;

/// Lightweight currency identifier, not unique across venues but unique within the gateway's own
/// ledger.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display)]
pub struct Currency(SmolStr);

impl Currency {
    pub fn new<S>(code: S) -> Self
    where
        S: Into<SmolStr>,
    {
        let code = code.into();
        Self(code.to_uppercase().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Currency {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Borrow<str> for Currency {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Named rounding policy applied when a [`Money`] value is snapped to a venue tick size.
///
/// Never implicit: every call site that can lose precision names one of these explicitly.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum RoundingPolicy {
    Down,
    Up,
    NearestEven,
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum MoneyError {
    #[error("currency mismatch: {0} vs {1}")]
    CurrencyMismatch(Currency, Currency),
    #[error("precision loss constructing Money from {0}: {1}")]
    PrecisionLoss(String, String),
    #[error("invalid decimal literal: {0}")]
    InvalidDecimal(String),
}

/// Scale of every [`Money`] value: 8 fractional digits, matching the tightest precision any
/// supported venue quotes at.
pub const SCALE: u32 = 8;

/// A currency-tagged fixed-point scalar. All prices, amounts, fees, balances, and P&L in the
/// gateway are `Money`. There is no `From<f64>` impl anywhere on this type or its arithmetic: any
/// numeric literal must be parsed from a decimal string or an integer, so float contamination is
/// rejected at the type level rather than policed by convention.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

impl Money {
    /// Construct a `Money` from a decimal string literal, e.g. `"123.45600000"`.
    pub fn parse(currency: &Currency, literal: &str) -> Result<Self, MoneyError> {
        let amount = Decimal::from_str(literal)
            .map_err(|_| MoneyError::InvalidDecimal(literal.to_string()))?;
        Ok(Self::from_decimal(currency, amount))
    }

    /// Construct a `Money` from an integer number of whole units.
    pub fn from_i64(currency: &Currency, whole_units: i64) -> Self {
        Self::from_decimal(currency, Decimal::from(whole_units))
    }

    fn from_decimal(currency: &Currency, mut amount: Decimal) -> Self {
        amount.rescale(SCALE);
        Self {
            amount,
            currency: currency.clone(),
        }
    }

    /// Zero value tagged with `currency`.
    pub fn zero_in(currency: &Currency) -> Self {
        Self::from_decimal(currency, Decimal::ZERO)
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }

    pub fn as_decimal(&self) -> Decimal {
        self.amount
    }

    fn same_currency(&self, other: &Self) -> Result<(), MoneyError> {
        if self.currency == other.currency {
            Ok(())
        } else {
            Err(MoneyError::CurrencyMismatch(
                self.currency.clone(),
                other.currency.clone(),
            ))
        }
    }

    pub fn checked_add(&self, other: &Self) -> Result<Self, MoneyError> {
        self.same_currency(other)?;
        Ok(Self {
            amount: self.amount + other.amount,
            currency: self.currency.clone(),
        })
    }

    pub fn checked_sub(&self, other: &Self) -> Result<Self, MoneyError> {
        self.same_currency(other)?;
        Ok(Self {
            amount: self.amount - other.amount,
            currency: self.currency.clone(),
        })
    }

    /// Compare two `Money` values of the same currency.
    pub fn checked_cmp(&self, other: &Self) -> Result<std::cmp::Ordering, MoneyError> {
        self.same_currency(other)?;
        Ok(self.amount.cmp(&other.amount))
    }

    /// Multiply by a unit-less exact rational (itself a `Decimal`, never an `f64`).
    pub fn checked_mul_rational(&self, factor: Decimal) -> Self {
        let mut amount = self.amount * factor;
        amount.rescale(SCALE);
        Self {
            amount,
            currency: self.currency.clone(),
        }
    }

    /// Divide by a unit-less exact rational.
    pub fn checked_div_rational(&self, divisor: Decimal) -> Result<Self, MoneyError> {
        if divisor.is_zero() {
            return Err(MoneyError::InvalidDecimal("division by zero".into()));
        }
        let mut amount = self.amount / divisor;
        amount.rescale(SCALE);
        Ok(Self {
            amount,
            currency: self.currency.clone(),
        })
    }

    /// Round to the nearest multiple of `tick` under the given policy.
    pub fn round_to_tick(&self, tick: Decimal, policy: RoundingPolicy) -> Self {
        if tick.is_zero() {
            return self.clone();
        }
        let quotient = self.amount / tick;
        let rounded_quotient = match policy {
            RoundingPolicy::Down => quotient.floor(),
            RoundingPolicy::Up => quotient.ceil(),
            RoundingPolicy::NearestEven => quotient.round(),
        };
        let mut amount = rounded_quotient * tick;
        amount.rescale(SCALE);
        Self {
            amount,
            currency: self.currency.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usdt() -> Currency {
        Currency::new("usdt")
    }

    #[test]
    fn uppercases_currency_code() {
        assert_eq!(usdt().as_str(), "USDT");
    }

    #[test]
    fn add_same_currency_ok() {
        let a = Money::parse(&usdt(), "10000.00000000").unwrap();
        let b = Money::parse(&usdt(), "5.00000000").unwrap();
        let sum = a.checked_add(&b).unwrap();
        assert_eq!(sum.as_decimal(), Decimal::from_str("10005.00000000").unwrap());
    }

    #[test]
    fn mismatched_currency_rejected() {
        let usdt_amount = Money::parse(&usdt(), "1").unwrap();
        let btc_amount = Money::parse(&Currency::new("btc"), "1").unwrap();
        assert!(matches!(
            usdt_amount.checked_add(&btc_amount),
            Err(MoneyError::CurrencyMismatch(..))
        ));
    }

    #[test]
    fn notional_and_fee_compose_via_rational_multiply() {
        let usdt = usdt();
        let price = Money::parse(&usdt, "50000").unwrap();
        let amount = Decimal::from_str("0.1").unwrap();
        let notional = price.checked_mul_rational(amount);
        assert_eq!(notional.as_decimal(), Decimal::from_str("5000.00000000").unwrap());

        let fee_rate = Decimal::from_str("0.001").unwrap();
        let fee = notional.checked_mul_rational(fee_rate);
        assert_eq!(fee.as_decimal(), Decimal::from_str("5.00000000").unwrap());

        let reserved = notional.checked_add(&fee).unwrap();
        assert_eq!(reserved.as_decimal(), Decimal::from_str("5005.00000000").unwrap());
    }

    #[test]
    fn rounds_to_tick_under_named_policy() {
        let usdt = usdt();
        let price = Money::parse(&usdt, "50000.127").unwrap();
        let tick = Decimal::from_str("0.1").unwrap();

        let down = price.round_to_tick(tick, RoundingPolicy::Down);
        assert_eq!(down.as_decimal(), Decimal::from_str("50000.10000000").unwrap());

        let up = price.round_to_tick(tick, RoundingPolicy::Up);
        assert_eq!(up.as_decimal(), Decimal::from_str("50000.20000000").unwrap());
    }
}
