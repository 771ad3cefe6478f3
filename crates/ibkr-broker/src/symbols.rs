use chrono::{Datelike, NaiveDate};

/// Build the OCC-style option symbol: root padded to 6 characters, expiry
/// as YYMMDD, right (C/P), strike times 1000 zero-padded to 8 digits.
///
/// Example: (SPY, 2024-12-09, C, 605.0) -> "SPY   241209C00605000".
pub fn occ_symbol(ticker: &str, expiry: NaiveDate, right: char, strike: f64) -> String {
    let strike_milli = (strike * 1000.0).round() as i64;
    format!(
        "{:<6}{}{}{:08}",
        ticker.to_ascii_uppercase(),
        expiry.format("%y%m%d"),
        right.to_ascii_uppercase(),
        strike_milli
    )
}

/// Expiry month in the gateway's secdef format, e.g. "DEC24".
pub fn ibkr_month(expiry: NaiveDate) -> String {
    const MONTHS: [&str; 12] = [
        "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
    ];
    format!(
        "{}{:02}",
        MONTHS[expiry.month0() as usize],
        expiry.year() % 100
    )
}

/// Gateway maturity date format (yyyymmdd).
pub fn maturity_date(expiry: NaiveDate) -> String {
    expiry.format("%Y%m%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn builds_standard_symbol() {
        assert_eq!(
            occ_symbol("SPY", d(2024, 12, 9), 'C', 605.0),
            "SPY   241209C00605000"
        );
    }

    #[test]
    fn pads_long_roots_and_fractional_strikes() {
        assert_eq!(
            occ_symbol("GOOGL", d(2025, 1, 17), 'P', 192.5),
            "GOOGL 250117P00192500"
        );
    }

    #[test]
    fn lowercase_inputs_are_normalized() {
        assert_eq!(
            occ_symbol("spy", d(2024, 12, 9), 'c', 605.0),
            "SPY   241209C00605000"
        );
    }

    #[test]
    fn distinct_inputs_give_distinct_symbols() {
        let a = occ_symbol("SPY", d(2024, 12, 9), 'C', 605.0);
        let b = occ_symbol("SPY", d(2024, 12, 9), 'P', 605.0);
        let c = occ_symbol("SPY", d(2024, 12, 10), 'C', 605.0);
        let e = occ_symbol("SPY", d(2024, 12, 9), 'C', 606.0);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, e);
    }

    #[test]
    fn month_format_matches_gateway() {
        assert_eq!(ibkr_month(d(2024, 12, 9)), "DEC24");
        assert_eq!(ibkr_month(d(2026, 1, 2)), "JAN26");
    }

    #[test]
    fn maturity_date_is_yyyymmdd() {
        assert_eq!(maturity_date(d(2024, 12, 9)), "20241209");
    }
}
