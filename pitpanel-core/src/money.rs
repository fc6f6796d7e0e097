//! Currency-bearing values as parallel amount and currency columns.

use polars::prelude::*;
use serde::{Deserialize, Serialize};

/// Currency assigned to rows that arrive without one.
pub const DEFAULT_CURRENCY: &str = "USD";

/// Currencies quoted in minor units (pence) that convert to major units by /100.
pub const MINOR_UNIT_CURRENCIES: [&str; 2] = ["GBp", "IEp"];

/// Names of an `(amount, currency)` column pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoneyColumns {
    pub amount: String,
    pub currency: String,
}

impl MoneyColumns {
    pub fn new(amount: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            amount: amount.into(),
            currency: currency.into(),
        }
    }

    /// Conventional pairing: `{amount}_currency`.
    pub fn for_amount(amount: &str) -> Self {
        Self::new(amount, format!("{amount}_currency"))
    }

    /// Convert pence-denominated rows to pounds and relabel their currency.
    pub fn normalize_minor_units(&self, frame: DataFrame) -> PolarsResult<DataFrame> {
        let converted = frame
            .column(&self.currency)?
            .str()?
            .into_iter()
            .filter(|c| c.is_some_and(|c| MINOR_UNIT_CURRENCIES.contains(&c)))
            .count();
        if converted == 0 {
            return Ok(frame);
        }
        tracing::debug!(converted, column = %self.amount, "converted minor-unit amounts");

        let currency = col(self.currency.as_str());
        let amount = col(self.amount.as_str()).cast(DataType::Float64);
        let is_minor = MINOR_UNIT_CURRENCIES
            .iter()
            .fold(lit(false), |acc, minor| acc.or(currency.clone().eq(lit(*minor))))
            .fill_null(lit(false));
        let relabelled = MINOR_UNIT_CURRENCIES
            .iter()
            .fold(currency.clone(), |acc, minor| {
                when(currency.clone().eq(lit(*minor)))
                    .then(lit(major_unit_code(minor)))
                    .otherwise(acc)
            });
        frame
            .lazy()
            .with_columns([
                when(is_minor)
                    .then(amount.clone() / lit(100.0))
                    .otherwise(amount)
                    .alias(self.amount.as_str()),
                relabelled.alias(self.currency.as_str()),
            ])
            .collect()
    }

    /// Normalize minor units, then null out amounts whose currency is unknown
    /// and tag those rows with [`DEFAULT_CURRENCY`].
    pub fn normalize(&self, frame: DataFrame) -> PolarsResult<DataFrame> {
        let frame = self.normalize_minor_units(frame)?;
        let currency = col(self.currency.as_str());
        frame
            .lazy()
            .with_columns([
                when(currency.clone().is_null())
                    .then(lit(NULL).cast(DataType::Float64))
                    .otherwise(col(self.amount.as_str()).cast(DataType::Float64))
                    .alias(self.amount.as_str()),
                currency
                    .fill_null(lit(DEFAULT_CURRENCY))
                    .alias(self.currency.as_str()),
            ])
            .collect()
    }
}

/// `GBp` → `GBP`, `IEp` → `IEP`.
fn major_unit_code(minor: &str) -> String {
    let mut code: String = minor.chars().take(minor.chars().count().saturating_sub(1)).collect();
    code.push('P');
    code
}
