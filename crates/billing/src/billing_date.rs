//! Next-billing-date computation for Square subscription cadences

use chrono::{Datelike, Days, Months, NaiveDate};

/// Billing cadence as Square names it on subscription plan phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Daily,
    Weekly,
    EveryTwoWeeks,
    EveryThreeWeeks,
    EveryFourWeeks,
    Monthly,
    EveryTwoMonths,
    Quarterly,
    EveryFourMonths,
    EverySixMonths,
    Annual,
    EveryTwoYears,
}

impl Cadence {
    /// Unknown or missing tokens bill monthly
    pub fn parse(token: Option<&str>) -> Self {
        match token.map(|t| t.trim().to_ascii_uppercase()).as_deref() {
            Some("DAILY") => Cadence::Daily,
            Some("WEEKLY") => Cadence::Weekly,
            Some("EVERY_TWO_WEEKS") => Cadence::EveryTwoWeeks,
            Some("EVERY_THREE_WEEKS") => Cadence::EveryThreeWeeks,
            Some("EVERY_FOUR_WEEKS") => Cadence::EveryFourWeeks,
            Some("EVERY_TWO_MONTHS") => Cadence::EveryTwoMonths,
            Some("QUARTERLY") => Cadence::Quarterly,
            Some("EVERY_FOUR_MONTHS") => Cadence::EveryFourMonths,
            Some("EVERY_SIX_MONTHS") => Cadence::EverySixMonths,
            Some("ANNUAL") => Cadence::Annual,
            Some("EVERY_TWO_YEARS") => Cadence::EveryTwoYears,
            _ => Cadence::Monthly,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Daily => "DAILY",
            Cadence::Weekly => "WEEKLY",
            Cadence::EveryTwoWeeks => "EVERY_TWO_WEEKS",
            Cadence::EveryThreeWeeks => "EVERY_THREE_WEEKS",
            Cadence::EveryFourWeeks => "EVERY_FOUR_WEEKS",
            Cadence::Monthly => "MONTHLY",
            Cadence::EveryTwoMonths => "EVERY_TWO_MONTHS",
            Cadence::Quarterly => "QUARTERLY",
            Cadence::EveryFourMonths => "EVERY_FOUR_MONTHS",
            Cadence::EverySixMonths => "EVERY_SIX_MONTHS",
            Cadence::Annual => "ANNUAL",
            Cadence::EveryTwoYears => "EVERY_TWO_YEARS",
        }
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute the next billing date after `from`.
///
/// Fixed-length cadences add days; month-based cadences add calendar months,
/// clamping to the last day of the target month. `Monthly` aligns to
/// `anchor_day` (default 1): the anchor in the current month when `from` is
/// still before it, otherwise the anchor in the following month. An anchor
/// past the month's length lands on the month's last day.
pub fn next_billing_date(cadence: Cadence, anchor_day: Option<u32>, from: NaiveDate) -> NaiveDate {
    let computed = match cadence {
        Cadence::Daily => from.checked_add_days(Days::new(1)),
        Cadence::Weekly => from.checked_add_days(Days::new(7)),
        Cadence::EveryTwoWeeks => from.checked_add_days(Days::new(14)),
        Cadence::EveryThreeWeeks => from.checked_add_days(Days::new(21)),
        Cadence::EveryFourWeeks => from.checked_add_days(Days::new(28)),
        Cadence::EveryTwoMonths => from.checked_add_months(Months::new(2)),
        Cadence::Quarterly => from.checked_add_months(Months::new(3)),
        Cadence::EveryFourMonths => from.checked_add_months(Months::new(4)),
        Cadence::EverySixMonths => from.checked_add_months(Months::new(6)),
        Cadence::Annual => from.checked_add_months(Months::new(12)),
        Cadence::EveryTwoYears => from.checked_add_months(Months::new(24)),
        Cadence::Monthly => {
            let anchor = anchor_day.filter(|d| *d >= 1).unwrap_or(1);
            if from.day() < anchor {
                Some(clamped_day(from.year(), from.month(), anchor))
            } else {
                let (year, month) = if from.month() == 12 {
                    (from.year() + 1, 1)
                } else {
                    (from.year(), from.month() + 1)
                };
                Some(clamped_day(year, month, anchor))
            }
        }
    };

    // Only unreachable dates near NaiveDate::MAX fail to compute
    computed.unwrap_or(from)
}

/// Day `day` of the given month, or the month's last day if it is shorter
fn clamped_day(year: i32, month: u32, day: u32) -> NaiveDate {
    let last = last_day_of_month(year, month);
    NaiveDate::from_ymd_opt(year, month, day.min(last))
        .unwrap_or(NaiveDate::MIN)
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}
