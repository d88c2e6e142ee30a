use chrono::{DateTime, Duration, Utc};

/// 位置/心跳样本的有效期（秒）
pub const STALENESS_WINDOW_SECS: i64 = 5 * 60;

pub fn staleness_window() -> Duration {
    Duration::seconds(STALENESS_WINDOW_SECS)
}

/// 样本在 `now` 时刻是否仍可参与匹配
pub fn is_fresh(sample_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match sample_at {
        Some(sample_at) => now - sample_at <= staleness_window(),
        None => false,
    }
}

/// 仍然有效的最早样本时间
pub fn freshness_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - staleness_window()
}
