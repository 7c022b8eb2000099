use crate::model::{Amount, DateRange};

use super::EngineError;

/// `price_per_day` times the number of days in `dates`, both ends included.
pub fn total_price(price_per_day: Amount, dates: &DateRange) -> Result<Amount, EngineError> {
    let days = u64::try_from(dates.days())
        .map_err(|_| EngineError::Validation("empty date range".into()))?;
    price_per_day
        .checked_mul(days)
        .ok_or(EngineError::LimitExceeded("total price overflows"))
}
