use crate::api::DeviceApi;
use crate::errors::Result;
use crate::model::{DailyStat, HourlyStat, PumpUsage};
use serde::Serialize;
use tracing::warn;

pub const HOURLY_WINDOW: usize = 6;
pub const DAILY_WINDOW: usize = 5;

/// History shown next to the live view.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsView {
    pub hourly: Vec<HourlyStat>,
    pub daily: Vec<DailyStat>,
    pub pump: Vec<PumpUsage>,
}

/// Loads the three stats sections concurrently. A section whose query fails
/// is left empty instead of failing the others.
pub async fn load_stats(api: &dyn DeviceApi) -> StatsView {
    let (hourly, daily, pump) = tokio::join!(
        api.hourly_stats(),
        api.daily_stats(),
        api.daily_pump_usage()
    );

    StatsView {
        hourly: last_n(or_empty("hourly stats", hourly), HOURLY_WINDOW),
        daily: last_n(or_empty("daily stats", daily), DAILY_WINDOW),
        pump: last_n(or_empty("pump usage", pump), DAILY_WINDOW),
    }
}

fn or_empty<T>(section: &str, result: Result<Vec<T>>) -> Vec<T> {
    result.unwrap_or_else(|e| {
        warn!("Failed to load {}: {}", section, e);
        Vec::new()
    })
}

fn last_n<T>(mut rows: Vec<T>, n: usize) -> Vec<T> {
    let skip = rows.len().saturating_sub(n);
    rows.drain(..skip);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_n_keeps_tail() {
        assert_eq!(last_n(vec![1, 2, 3, 4, 5, 6, 7], 5), vec![3, 4, 5, 6, 7]);
        assert_eq!(last_n(vec![1, 2], 5), vec![1, 2]);
        assert!(last_n(Vec::<u8>::new(), 5).is_empty());
    }
}
