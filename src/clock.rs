use std::sync::Arc;
use std::sync::Mutex;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Timelike, Utc,
    Weekday,
};
use once_cell::sync::Lazy;

use crate::config::TradingConfig;

/// KST is UTC+9 year-round; Korea has not observed DST since 1988.
static KST: Lazy<FixedOffset> =
    Lazy::new(|| FixedOffset::east_opt(9 * 3600).expect("KST offset"));

pub fn kst() -> FixedOffset {
    *KST
}

/// Time source. Every component that reads the wall clock goes through this
/// so tests can compress minutes into microseconds.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self { now: Mutex::new(start) })
    }

    /// Build a clock from a KST wall-clock reading, which is how every
    /// market-hours test wants to think about time.
    pub fn at_kst(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> Arc<Self> {
        Self::new(kst_datetime(y, mo, d, h, mi, s))
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.now.lock().expect("clock poisoned") = t;
    }

    pub fn advance(&self, by: Duration) {
        let mut g = self.now.lock().expect("clock poisoned");
        *g += by;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock poisoned")
    }
}

pub fn kst_datetime(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    let date = NaiveDate::from_ymd_opt(y, mo, d).expect("valid date");
    let time = NaiveTime::from_hms_opt(h, mi, s).expect("valid time");
    kst()
        .from_local_datetime(&date.and_time(time))
        .single()
        .expect("fixed offset is unambiguous")
        .with_timezone(&Utc)
}

/// Market session calendar: Mon-Fri, 09:00..=15:30 KST, both endpoints
/// inclusive. Weekends close the market; holidays are not modeled.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    open_minute: u32,
    close_minute: u32,
}

impl MarketCalendar {
    pub fn new(cfg: &TradingConfig) -> Self {
        Self {
            open_minute: cfg.market_open_minute,
            close_minute: cfg.market_close_minute,
        }
    }

    pub fn is_open_at(&self, t: DateTime<Utc>) -> bool {
        let local = t.with_timezone(&kst());
        if is_weekend(local.weekday()) {
            return false;
        }
        let minute = local.hour() * 60 + local.minute();
        minute >= self.open_minute && minute <= self.close_minute
    }

    /// Next instant the market opens, strictly after any session `t` is
    /// already inside. Rolls past weekends.
    pub fn next_open(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let local = t.with_timezone(&kst());
        let today_reached = local.hour() * 60 + local.minute() >= self.open_minute;
        let mut day = local.date_naive();
        if today_reached {
            day = day.succ_opt().expect("date in range");
        }
        while is_weekend(day.weekday()) {
            day = day.succ_opt().expect("date in range");
        }
        at_local_minute(day, self.open_minute)
    }

    /// End of the current session if `t` is inside one.
    pub fn close_at(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_open_at(t) {
            return None;
        }
        Some(at_local_minute(t.with_timezone(&kst()).date_naive(), self.close_minute))
    }

    pub fn open_minute(&self) -> u32 {
        self.open_minute
    }

    pub fn close_minute(&self) -> u32 {
        self.close_minute
    }
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

fn at_local_minute(day: NaiveDate, minute_of_day: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(minute_of_day / 60, minute_of_day % 60, 0)
        .expect("valid minute of day");
    kst()
        .from_local_datetime(&day.and_time(time))
        .single()
        .expect("fixed offset is unambiguous")
        .with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calendar() -> MarketCalendar {
        MarketCalendar::new(&TradingConfig::default())
    }

    #[test]
    fn weekday_session_bounds() {
        let cal = calendar();
        // 2025-06-02 is a Monday.
        assert!(!cal.is_open_at(kst_datetime(2025, 6, 2, 8, 59, 59)));
        assert!(cal.is_open_at(kst_datetime(2025, 6, 2, 9, 0, 0)));
        assert!(cal.is_open_at(kst_datetime(2025, 6, 2, 12, 30, 0)));
        // 15:30 itself still counts as open.
        assert!(cal.is_open_at(kst_datetime(2025, 6, 2, 15, 30, 0)));
        assert!(!cal.is_open_at(kst_datetime(2025, 6, 2, 15, 31, 0)));
    }

    #[test]
    fn weekends_are_closed() {
        let cal = calendar();
        assert!(!cal.is_open_at(kst_datetime(2025, 6, 7, 11, 0, 0))); // Saturday
        assert!(!cal.is_open_at(kst_datetime(2025, 6, 8, 11, 0, 0))); // Sunday
    }

    #[test]
    fn next_open_same_day_before_open() {
        let cal = calendar();
        let t = kst_datetime(2025, 6, 2, 7, 0, 0);
        assert_eq!(cal.next_open(t), kst_datetime(2025, 6, 2, 9, 0, 0));
    }

    #[test]
    fn next_open_rolls_past_close_and_weekend() {
        let cal = calendar();
        // Friday evening rolls to Monday.
        let t = kst_datetime(2025, 6, 6, 16, 0, 0);
        assert_eq!(cal.next_open(t), kst_datetime(2025, 6, 9, 9, 0, 0));
        // Saturday noon rolls to Monday as well.
        let t = kst_datetime(2025, 6, 7, 12, 0, 0);
        assert_eq!(cal.next_open(t), kst_datetime(2025, 6, 9, 9, 0, 0));
    }

    #[test]
    fn close_at_only_inside_session() {
        let cal = calendar();
        let t = kst_datetime(2025, 6, 2, 10, 0, 0);
        assert_eq!(cal.close_at(t), Some(kst_datetime(2025, 6, 2, 15, 30, 0)));
        assert_eq!(cal.close_at(kst_datetime(2025, 6, 2, 16, 0, 0)), None);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::at_kst(2025, 6, 2, 9, 0, 0);
        let before = clock.now_utc();
        clock.advance(Duration::minutes(3));
        assert_eq!(clock.now_utc() - before, Duration::minutes(3));
    }
}
