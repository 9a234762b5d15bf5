// =============================================================================
// KRX session windows — regular session and closing call auction
// =============================================================================
//
// All times are KST (UTC+9, no DST). Weekend days are always closed; exchange
// holidays are not modelled here — the broker rejects orders on those days
// and the SELL path falls back to pending-exit.
// =============================================================================

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};

/// Seconds east of UTC for Korea Standard Time.
const KST_OFFSET_SECS: i32 = 9 * 3600;

/// Regular session open, 09:00 KST.
pub fn session_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).expect("valid time")
}

/// Entries stop at 15:20 KST when the closing call auction begins.
pub fn call_auction_start() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 20, 0).expect("valid time")
}

/// Session close, 15:30 KST.
pub fn session_close() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 30, 0).expect("valid time")
}

/// Where the current instant falls relative to the trading day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 09:00–15:20 KST on a weekday: entries and exits allowed.
    Regular,
    /// 15:20–15:30 KST: the closing call auction. Routine orders may be
    /// rejected, so exits are deferred with reason CALL_AUCTION.
    CallAuction,
    Closed,
}

fn kst() -> FixedOffset {
    FixedOffset::east_opt(KST_OFFSET_SECS).expect("KST offset is valid")
}

/// Classify an instant into a [`SessionState`].
pub fn session_state(now: DateTime<Utc>) -> SessionState {
    let local = now.with_timezone(&kst());
    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return SessionState::Closed;
    }
    let t = local.time();
    if t >= session_open() && t < call_auction_start() {
        SessionState::Regular
    } else if t >= call_auction_start() && t < session_close() {
        SessionState::CallAuction
    } else {
        SessionState::Closed
    }
}

/// Entries are permitted only in the regular session window.
pub fn entries_allowed(now: DateTime<Utc>) -> bool {
    session_state(now) == SessionState::Regular
}

/// Exits are permitted in the regular session; during the call auction the
/// caller receives `false` and should defer via pending-exit.
pub fn exits_allowed(now: DateTime<Utc>) -> bool {
    session_state(now) == SessionState::Regular
}

/// KST trade date of an instant, formatted `YYYYMMDD` for cache keys.
pub fn trade_date(now: DateTime<Utc>) -> String {
    now.with_timezone(&kst()).format("%Y%m%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Build a UTC instant from KST wall-clock components.
    fn kst_instant(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        kst()
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn weekday_regular_session() {
        // 2025-06-02 is a Monday.
        let t = kst_instant(2025, 6, 2, 10, 30);
        assert_eq!(session_state(t), SessionState::Regular);
        assert!(entries_allowed(t));
        assert!(exits_allowed(t));
    }

    #[test]
    fn call_auction_window_blocks_both() {
        let t = kst_instant(2025, 6, 2, 15, 25);
        assert_eq!(session_state(t), SessionState::CallAuction);
        assert!(!entries_allowed(t));
        assert!(!exits_allowed(t));
    }

    #[test]
    fn call_auction_boundaries() {
        assert_eq!(
            session_state(kst_instant(2025, 6, 2, 15, 19)),
            SessionState::Regular
        );
        assert_eq!(
            session_state(kst_instant(2025, 6, 2, 15, 20)),
            SessionState::CallAuction
        );
        assert_eq!(
            session_state(kst_instant(2025, 6, 2, 15, 30)),
            SessionState::Closed
        );
    }

    #[test]
    fn before_open_is_closed() {
        assert_eq!(
            session_state(kst_instant(2025, 6, 2, 8, 59)),
            SessionState::Closed
        );
        assert_eq!(
            session_state(kst_instant(2025, 6, 2, 9, 0)),
            SessionState::Regular
        );
    }

    #[test]
    fn weekend_is_closed() {
        // 2025-06-07 is a Saturday.
        let t = kst_instant(2025, 6, 7, 10, 0);
        assert_eq!(session_state(t), SessionState::Closed);
    }

    #[test]
    fn trade_date_uses_kst_calendar() {
        // 23:30 UTC is 08:30 next day in KST.
        let t = Utc.with_ymd_and_hms(2025, 6, 2, 23, 30, 0).unwrap();
        assert_eq!(trade_date(t), "20250603");
    }
}
