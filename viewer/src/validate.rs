use crate::errors::{Error, Result};
use crate::model::ConfigUpdate;

/// Validates an operator-proposed configuration change
pub fn validate_update(update: &ConfigUpdate) -> Result<()> {
    if update.is_empty() {
        return Err(Error::Validation(
            "Configuration update contains no fields".to_string(),
        ));
    }

    non_negative("Dry threshold", update.dry_threshold)?;
    non_negative("Pump duration", update.pump_duration)?;
    non_negative("Min water level", update.water_min_level)?;

    Ok(())
}

/// Validates the optional run time of a manual pump start
pub fn validate_duration(duration: Option<u32>) -> Result<()> {
    match duration {
        Some(0) => Err(Error::Validation(
            "Pump duration must be a positive number of seconds".to_string(),
        )),
        _ => Ok(()),
    }
}

fn non_negative(field: &str, value: Option<i64>) -> Result<()> {
    match value {
        Some(v) if v < 0 => Err(Error::Validation(format!(
            "{} {} must be a non-negative integer",
            field, v
        ))),
        _ => Ok(()),
    }
}
