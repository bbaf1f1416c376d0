use crate::error::SettlementError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// A wallet balance.
///
/// Wraps `rust_decimal::Decimal` so wallet arithmetic cannot be mixed up with
/// raw prices. Settlement only ever adds to it.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Balance(pub Decimal);

/// A strictly positive amount charged to a buyer.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, SettlementError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(SettlementError::Validation(
                "total price must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Renders the amount the way the gateway echoes it back in notifications.
    pub fn gross_amount(&self) -> String {
        format_gross_amount(self.0)
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = SettlementError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.gross_amount())
    }
}

/// Two decimal places, as in `"15000.00"`.
pub fn format_gross_amount(value: Decimal) -> String {
    let mut rounded = value.round_dp(2);
    rounded.rescale(2);
    rounded.to_string()
}

impl Balance {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self {
        Self(amount)
    }

    pub fn credit(&mut self, amount: Decimal) {
        self.0 += amount;
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl Add for Balance {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Balance {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sum for Balance {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, balance| acc + balance)
    }
}
