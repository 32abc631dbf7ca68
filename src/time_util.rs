use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};

/// 默认场所时区：IST (+05:30)
pub const DEFAULT_VENUE_UTC_OFFSET_MINUTES: i32 = 330;

/// 交易时段（场所时区下的时刻，闭区间）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradingWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TradingWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self> {
        if start >= end {
            return Err(anyhow!("交易时段非法: start={} end={}", start, end));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        time >= self.start && time <= self.end
    }
}

impl Default for TradingWindow {
    /// 09:15 - 15:30
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

/// 构造场所时区偏移
pub fn venue_offset(minutes: i32) -> Result<FixedOffset> {
    FixedOffset::east_opt(minutes * 60).ok_or_else(|| anyhow!("invalid venue offset: {}min", minutes))
}

/// 解析 "HH:MM" 或 "HH:MM:SS"
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|e| anyhow!("时间格式错误 {}: {}", value, e))
}

/// 周一至周五为交易日（不含节假日）
pub fn is_trading_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// 场所时区下 `at` 时刻在 `after` 之后最近的一次交易日触发时间
pub fn next_trading_occurrence(
    after: DateTime<Utc>,
    at: NaiveTime,
    offset: FixedOffset,
) -> Option<DateTime<Utc>> {
    let mut date = after.with_timezone(&offset).date_naive();
    // 最多跨过一个周末
    for _ in 0..8 {
        if is_trading_day(date) {
            let candidate = offset
                .from_local_datetime(&date.and_time(at))
                .single()?
                .with_timezone(&Utc);
            if candidate > after {
                return Some(candidate);
            }
        }
        date = date.succ_opt()?;
    }
    None
}

/// UTC 时间在场所时区下的时刻
pub fn venue_time_of_day(at: DateTime<Utc>, offset: FixedOffset) -> NaiveTime {
    at.with_timezone(&offset).time()
}

/// 调度使用的墙钟
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 以 tokio 单调时钟推进的墙钟，配合 `tokio::time::pause` 做确定性回放
#[derive(Debug, Clone)]
pub struct TokioClock {
    base: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(base: DateTime<Utc>) -> Self {
        Self {
            base,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().duration_since(self.origin);
        self.base + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }
}
