use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Timelike};
use chrono_tz::Tz;

/// NYSE full-day holidays, 2024-2026.
const HOLIDAYS: &[(i32, u32, u32, &str)] = &[
    (2024, 1, 1, "New Year's Day"),
    (2024, 1, 15, "Martin Luther King Jr. Day"),
    (2024, 2, 19, "Presidents' Day"),
    (2024, 3, 29, "Good Friday"),
    (2024, 5, 27, "Memorial Day"),
    (2024, 6, 19, "Juneteenth"),
    (2024, 7, 4, "Independence Day"),
    (2024, 9, 2, "Labor Day"),
    (2024, 11, 28, "Thanksgiving Day"),
    (2024, 12, 25, "Christmas Day"),
    (2025, 1, 1, "New Year's Day"),
    (2025, 1, 20, "Martin Luther King Jr. Day"),
    (2025, 2, 17, "Presidents' Day"),
    (2025, 4, 18, "Good Friday"),
    (2025, 5, 26, "Memorial Day"),
    (2025, 6, 19, "Juneteenth"),
    (2025, 7, 4, "Independence Day"),
    (2025, 9, 1, "Labor Day"),
    (2025, 11, 27, "Thanksgiving Day"),
    (2025, 12, 25, "Christmas Day"),
    (2026, 1, 1, "New Year's Day"),
    (2026, 1, 19, "Martin Luther King Jr. Day"),
    (2026, 2, 16, "Presidents' Day"),
    (2026, 4, 3, "Good Friday"),
    (2026, 5, 25, "Memorial Day"),
    (2026, 6, 19, "Juneteenth"),
    (2026, 7, 3, "Independence Day (observed)"),
    (2026, 9, 7, "Labor Day"),
    (2026, 11, 26, "Thanksgiving Day"),
    (2026, 12, 25, "Christmas Day"),
];

/// 1:00 PM ET close days.
const EARLY_CLOSES: &[(i32, u32, u32)] = &[
    (2024, 7, 3),
    (2024, 11, 29),
    (2024, 12, 24),
    (2025, 7, 3),
    (2025, 11, 28),
    (2025, 12, 24),
    (2026, 11, 27),
    (2026, 12, 24),
];

#[derive(Debug, Clone, PartialEq)]
pub struct MarketStatus {
    pub is_open: bool,
    /// market_open | pre_market | after_hours | weekend | holiday |
    /// early_close_day
    pub reason: &'static str,
    pub opens_at: Option<&'static str>,
    pub closes_at: Option<&'static str>,
    pub holiday: Option<&'static str>,
}

fn holiday_name(date: NaiveDate) -> Option<&'static str> {
    HOLIDAYS
        .iter()
        .find(|(y, m, d, _)| {
            date == NaiveDate::from_ymd_opt(*y, *m, *d).unwrap_or_default()
        })
        .map(|(_, _, _, name)| *name)
}

fn is_early_close(date: NaiveDate) -> bool {
    EARLY_CLOSES
        .iter()
        .any(|(y, m, d)| date == NaiveDate::from_ymd_opt(*y, *m, *d).unwrap_or_default())
}

/// NYSE session status at the given Eastern-time instant.
pub fn nyse_status(now: DateTime<Tz>) -> MarketStatus {
    let date = now.date_naive();
    let time = NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second())
        .unwrap_or(NaiveTime::MIN);

    if now.weekday().number_from_monday() >= 6 {
        return MarketStatus {
            is_open: false,
            reason: "weekend",
            opens_at: None,
            closes_at: None,
            holiday: None,
        };
    }

    if let Some(name) = holiday_name(date) {
        return MarketStatus {
            is_open: false,
            reason: "holiday",
            opens_at: None,
            closes_at: None,
            holiday: Some(name),
        };
    }

    let open = NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN);
    let early = is_early_close(date);
    let close = if early {
        NaiveTime::from_hms_opt(13, 0, 0).unwrap_or(NaiveTime::MIN)
    } else {
        NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN)
    };
    let closes_at = if early { "13:00 ET" } else { "16:00 ET" };

    if time < open {
        MarketStatus {
            is_open: false,
            reason: "pre_market",
            opens_at: Some("09:30 ET"),
            closes_at: Some(closes_at),
            holiday: None,
        }
    } else if time > close {
        MarketStatus {
            is_open: false,
            reason: "after_hours",
            opens_at: None,
            closes_at: Some(closes_at),
            holiday: None,
        }
    } else {
        MarketStatus {
            is_open: true,
            reason: if early { "early_close_day" } else { "market_open" },
            opens_at: None,
            closes_at: Some(closes_at),
            holiday: None,
        }
    }
}
