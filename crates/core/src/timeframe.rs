//! Resolution of relative time phrases into absolute half-open date ranges.

use std::sync::OnceLock;

use chrono::{Datelike, Days, Months, NaiveDate};
use regex::{Captures, Regex};

use crate::domain::intent::TimeRange;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimeResolution {
    Absent,
    Resolved { phrase: String, range: TimeRange },
    /// A phrase that needs an earlier turn's range and none exists.
    Unanchored { phrase: String },
}

impl TimeResolution {
    pub fn phrase(&self) -> Option<&str> {
        match self {
            Self::Absent => None,
            Self::Resolved { phrase, .. } | Self::Unanchored { phrase } => Some(phrase),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Unit {
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Unit {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            "quarter" => Some(Self::Quarter),
            "year" => Some(Self::Year),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Rule {
    Anaphoric,
    Vague,
    Rolling,
    Ago,
    SincePeriod,
    YearToDate,
    NamedPeriod,
    QuarterOfYear,
    YearQuarter,
    BareQuarter,
    MonthOfYear,
    SinceYear,
    Year,
    Today,
    Yesterday,
}

const RULES: &[(&str, Rule)] = &[
    (
        r"\b(since then|before that|after that|same period|that period|that time|the same time)\b",
        Rule::Anaphoric,
    ),
    (r"\b(recently|lately|a while ago|some time ago|back then)\b", Rule::Vague),
    (r"\b(?:last|past|previous|trailing)\s+(\d{1,3})\s+(day|week|month|quarter|year)s?\b", Rule::Rolling),
    (r"\b(\d{1,3})\s+(day|week|month|quarter|year)s?\s+ago\b", Rule::Ago),
    (r"\bsince\s+(last|this)\s+(week|month|quarter|year)\b", Rule::SincePeriod),
    (r"\b(year to date|ytd)\b", Rule::YearToDate),
    (r"\b(this|current|last|previous|past)\s+(week|month|quarter|year)\b", Rule::NamedPeriod),
    (r"\bq([1-4])\s*(?:of\s+)?((?:19|20)\d{2})\b", Rule::QuarterOfYear),
    (r"\b((?:19|20)\d{2})\s*q([1-4])\b", Rule::YearQuarter),
    (r"\bq([1-4])\b", Rule::BareQuarter),
    (
        r"\b(january|february|march|april|may|june|july|august|september|october|november|december)\s+((?:19|20)\d{2})\b",
        Rule::MonthOfYear,
    ),
    (r"\bsince\s+((?:19|20)\d{2})\b", Rule::SinceYear),
    (r"\b((?:19|20)\d{2})\b", Rule::Year),
    (r"\btoday\b", Rule::Today),
    (r"\byesterday\b", Rule::Yesterday),
];

fn rules() -> &'static [(Regex, Rule)] {
    static COMPILED: OnceLock<Vec<(Regex, Rule)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        RULES
            .iter()
            .filter_map(|(pattern, rule)| Regex::new(pattern).ok().map(|regex| (regex, *rule)))
            .collect()
    })
}

/// Resolves the first time phrase in `question` against `today`.
/// `previous` is the range of the prior turn, used by phrases such as "since then".
pub fn resolve_time_phrase(
    question: &str,
    today: NaiveDate,
    previous: Option<TimeRange>,
) -> TimeResolution {
    let text = question.to_lowercase();
    for (regex, rule) in rules() {
        let Some(captures) = regex
            .captures_iter(&text)
            .find(|captures| !matches!(rule, Rule::Year) || !is_row_count(&text, captures))
        else {
            continue;
        };
        let phrase = captures.get(0).map(|m| m.as_str().to_owned()).unwrap_or_default();
        return match apply_rule(*rule, &captures, today, previous) {
            RuleOutcome::Range(Some(range)) => TimeResolution::Resolved { phrase, range },
            RuleOutcome::Range(None) | RuleOutcome::Unanchored => {
                TimeResolution::Unanchored { phrase }
            }
        };
    }
    TimeResolution::Absent
}

/// Words that turn a following four-digit number into a row count ("top 2000 customers").
const COUNT_WORDS: &[&str] = &["top", "bottom", "first", "best", "worst", "largest", "biggest", "smallest"];

fn is_row_count(text: &str, captures: &Captures<'_>) -> bool {
    let start = captures.get(0).map(|m| m.start()).unwrap_or_default();
    text[..start].split_whitespace().next_back().is_some_and(|word| COUNT_WORDS.contains(&word))
}

enum RuleOutcome {
    Range(Option<TimeRange>),
    Unanchored,
}

fn apply_rule(
    rule: Rule,
    captures: &Captures<'_>,
    today: NaiveDate,
    previous: Option<TimeRange>,
) -> RuleOutcome {
    let group = |index: usize| captures.get(index).map(|m| m.as_str()).unwrap_or_default();
    let tomorrow = today.checked_add_days(Days::new(1));
    let range = |start: Option<NaiveDate>, end: Option<NaiveDate>| {
        RuleOutcome::Range(start.zip(end).and_then(|(start, end)| TimeRange::new(start, end)))
    };

    match rule {
        Rule::Anaphoric => {
            let Some(previous) = previous else {
                return RuleOutcome::Unanchored;
            };
            match group(1) {
                "since then" => range(Some(previous.start), tomorrow),
                "after that" => range(Some(previous.end), tomorrow),
                "before that" => range(NaiveDate::from_ymd_opt(1900, 1, 1), Some(previous.start)),
                _ => RuleOutcome::Range(Some(previous)),
            }
        }
        Rule::Vague => RuleOutcome::Unanchored,
        Rule::Rolling => {
            let (Ok(count), Some(unit)) = (group(1).parse::<i64>(), Unit::parse(group(2))) else {
                return RuleOutcome::Unanchored;
            };
            range(tomorrow.and_then(|end| shift(end, unit, -count)), tomorrow)
        }
        Rule::Ago => {
            let (Ok(count), Some(unit)) = (group(1).parse::<i64>(), Unit::parse(group(2))) else {
                return RuleOutcome::Unanchored;
            };
            let start = shift(start_of(today, unit), unit, -count);
            range(start, start.and_then(|start| shift(start, unit, 1)))
        }
        Rule::SincePeriod => {
            let Some(unit) = Unit::parse(group(2)) else {
                return RuleOutcome::Unanchored;
            };
            let current = start_of(today, unit);
            let start = if group(1) == "last" { shift(current, unit, -1) } else { Some(current) };
            range(start, tomorrow)
        }
        Rule::YearToDate => range(Some(start_of(today, Unit::Year)), tomorrow),
        Rule::NamedPeriod => {
            let Some(unit) = Unit::parse(group(2)) else {
                return RuleOutcome::Unanchored;
            };
            let current = start_of(today, unit);
            match group(1) {
                "this" | "current" => range(Some(current), tomorrow),
                "past" => range(tomorrow.and_then(|end| shift(end, unit, -1)), tomorrow),
                _ => range(shift(current, unit, -1), Some(current)),
            }
        }
        Rule::QuarterOfYear | Rule::YearQuarter => {
            let (quarter, year) = match rule {
                Rule::QuarterOfYear => (group(1), group(2)),
                _ => (group(2), group(1)),
            };
            let (Ok(quarter), Ok(year)) = (quarter.parse::<u32>(), year.parse::<i32>()) else {
                return RuleOutcome::Unanchored;
            };
            let start = NaiveDate::from_ymd_opt(year, (quarter - 1) * 3 + 1, 1);
            range(start, start.and_then(|start| shift(start, Unit::Quarter, 1)))
        }
        Rule::BareQuarter => {
            let Ok(quarter) = group(1).parse::<u32>() else {
                return RuleOutcome::Unanchored;
            };
            let mut start = NaiveDate::from_ymd_opt(today.year(), (quarter - 1) * 3 + 1, 1);
            if start.is_some_and(|start| start > today) {
                start = start.and_then(|start| shift(start, Unit::Year, -1));
            }
            range(start, start.and_then(|start| shift(start, Unit::Quarter, 1)))
        }
        Rule::MonthOfYear => {
            let (Some(month), Ok(year)) = (month_number(group(1)), group(2).parse::<i32>()) else {
                return RuleOutcome::Unanchored;
            };
            let start = NaiveDate::from_ymd_opt(year, month, 1);
            range(start, start.and_then(|start| shift(start, Unit::Month, 1)))
        }
        Rule::SinceYear => {
            let Ok(year) = group(1).parse::<i32>() else {
                return RuleOutcome::Unanchored;
            };
            range(NaiveDate::from_ymd_opt(year, 1, 1), tomorrow)
        }
        Rule::Year => {
            let Ok(year) = group(1).parse::<i32>() else {
                return RuleOutcome::Unanchored;
            };
            range(NaiveDate::from_ymd_opt(year, 1, 1), NaiveDate::from_ymd_opt(year + 1, 1, 1))
        }
        Rule::Today => range(Some(today), tomorrow),
        Rule::Yesterday => range(today.checked_sub_days(Days::new(1)), Some(today)),
    }
}

fn start_of(date: NaiveDate, unit: Unit) -> NaiveDate {
    let first_of_month = |month: u32| NaiveDate::from_ymd_opt(date.year(), month, 1).unwrap_or(date);
    match unit {
        Unit::Day => date,
        Unit::Week => date
            .checked_sub_days(Days::new(u64::from(date.weekday().num_days_from_monday())))
            .unwrap_or(date),
        Unit::Month => first_of_month(date.month()),
        Unit::Quarter => first_of_month((date.month0() / 3) * 3 + 1),
        Unit::Year => first_of_month(1),
    }
}

fn shift(date: NaiveDate, unit: Unit, count: i64) -> Option<NaiveDate> {
    let magnitude = count.unsigned_abs();
    match unit {
        Unit::Day | Unit::Week => {
            let days = if unit == Unit::Week { magnitude * 7 } else { magnitude };
            if count >= 0 {
                date.checked_add_days(Days::new(days))
            } else {
                date.checked_sub_days(Days::new(days))
            }
        }
        Unit::Month | Unit::Quarter | Unit::Year => {
            let per_unit = match unit {
                Unit::Quarter => 3,
                Unit::Year => 12,
                _ => 1,
            };
            let months = Months::new(u32::try_from(magnitude * per_unit).ok()?);
            if count >= 0 {
                date.checked_add_months(months)
            } else {
                date.checked_sub_months(months)
            }
        }
    }
}

fn month_number(name: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "january", "february", "march", "april", "may", "june", "july", "august", "september",
        "october", "november", "december",
    ];
    MONTHS.iter().position(|month| *month == name).map(|index| index as u32 + 1)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{resolve_time_phrase, TimeResolution};
    use crate::domain::intent::TimeRange;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn today() -> NaiveDate {
        date(2026, 10, 18)
    }

    fn resolved(question: &str) -> (String, NaiveDate, NaiveDate) {
        match resolve_time_phrase(question, today(), None) {
            TimeResolution::Resolved { phrase, range } => (phrase, range.start, range.end),
            other => panic!("expected a resolved range for {question:?}, got {other:?}"),
        }
    }

    #[test]
    fn last_year_is_the_previous_calendar_year() {
        let (phrase, start, end) = resolved("Revenue by country last year");
        assert_eq!(phrase, "last year");
        assert_eq!((start, end), (date(2025, 1, 1), date(2026, 1, 1)));
    }

    #[test]
    fn ranking_counts_are_not_read_as_years() {
        assert_eq!(resolve_time_phrase("top 2000 customers by revenue", today(), None), TimeResolution::Absent);

        let (phrase, start, end) = resolved("top 2000 customers in 2024");
        assert_eq!(phrase, "2024");
        assert_eq!((start, end), (date(2024, 1, 1), date(2025, 1, 1)));
    }

    #[test]
    fn months_ago_selects_that_calendar_month() {
        let (_, start, end) = resolved("How many leads did we create 6 months ago?");
        assert_eq!((start, end), (date(2026, 4, 1), date(2026, 5, 1)));
    }

    #[test]
    fn rolling_windows_include_today() {
        let (_, start, end) = resolved("deals closed in the last 30 days");
        assert_eq!((start, end), (date(2026, 9, 19), date(2026, 10, 19)));

        let (_, start, end) = resolved("pipeline over the past 2 quarters");
        assert_eq!((start, end), (date(2026, 4, 19), date(2026, 10, 19)));
    }

    #[test]
    fn this_period_runs_to_date() {
        let (_, start, end) = resolved("revenue this quarter");
        assert_eq!((start, end), (date(2026, 10, 1), date(2026, 10, 19)));

        let (_, start, end) = resolved("bookings ytd");
        assert_eq!((start, end), (date(2026, 1, 1), date(2026, 10, 19)));

        let (_, start, end) = resolved("cases this week");
        assert_eq!((start, end), (date(2026, 10, 12), date(2026, 10, 19)));
    }

    #[test]
    fn explicit_quarters_months_and_years() {
        assert_eq!(resolved("Q2 2024 revenue").1, date(2024, 4, 1));
        assert_eq!(resolved("Q2 2024 revenue").2, date(2024, 7, 1));
        assert_eq!(resolved("revenue 2025 q4").1, date(2025, 10, 1));
        assert_eq!(resolved("revenue 2025 q4").2, date(2026, 1, 1));
        assert_eq!(resolved("leads in March 2024").1, date(2024, 3, 1));
        assert_eq!(resolved("leads in March 2024").2, date(2024, 4, 1));
        assert_eq!(resolved("wins in 2023").1, date(2023, 1, 1));
        assert_eq!(resolved("wins in 2023").2, date(2024, 1, 1));
        assert_eq!(resolved("wins since 2024").2, date(2026, 10, 19));
    }

    #[test]
    fn bare_quarter_picks_the_most_recent_occurrence() {
        assert_eq!(resolved("revenue in Q3").1, date(2026, 7, 1));
        assert_eq!(resolved("revenue in Q4").1, date(2026, 10, 1));
        let future = resolve_time_phrase("revenue in Q1", date(2026, 2, 1), None);
        assert!(matches!(future, TimeResolution::Resolved { range, .. } if range.start == date(2026, 1, 1)));
    }

    #[test]
    fn anaphoric_phrases_need_a_previous_range() {
        assert_eq!(
            resolve_time_phrase("and since then?", today(), None),
            TimeResolution::Unanchored { phrase: "since then".to_owned() }
        );

        let previous = TimeRange::new(date(2025, 1, 1), date(2026, 1, 1));
        match resolve_time_phrase("and since then?", today(), previous) {
            TimeResolution::Resolved { range, .. } => {
                assert_eq!((range.start, range.end), (date(2025, 1, 1), date(2026, 10, 19)));
            }
            other => panic!("expected resolution, got {other:?}"),
        }
        match resolve_time_phrase("same period by industry", today(), previous) {
            TimeResolution::Resolved { range, .. } => assert_eq!(Some(range), previous),
            other => panic!("expected resolution, got {other:?}"),
        }
    }

    #[test]
    fn vague_phrases_are_unanchored_and_silence_is_absent() {
        assert!(matches!(
            resolve_time_phrase("what happened recently", today(), None),
            TimeResolution::Unanchored { .. }
        ));
        assert_eq!(
            resolve_time_phrase("Lead conversion trends in the US", today(), None),
            TimeResolution::Absent
        );
    }
}
