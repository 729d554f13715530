use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};

/// Date-only layouts seen in the legacy exports, day-first before ISO.
const DATE_FORMATS: [&str; 5] = ["%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y", "%d.%m.%Y", "%Y/%m/%d"];

const DATETIME_FORMATS: [&str; 7] = [
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d-%m-%Y %H:%M:%S",
];

const MIN_YEAR: i32 = 1850;
const MAX_YEAR: i32 = 2100;

fn plausible(date: NaiveDate) -> bool {
    (MIN_YEAR..=MAX_YEAR).contains(&date.year())
}

/// Parse a date cell. Blank cells are `Ok(None)`; anything unparseable is an
/// error message suitable for a transform error.
pub fn parse_date(raw: &str) -> Result<Option<NaiveDate>, String> {
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, fmt) {
            if plausible(date) {
                return Ok(Some(date));
            }
        }
    }
    // Date-time cells in a date column keep the date part.
    if let Some(dt) = parse_datetime_value(value) {
        return Ok(Some(dt.date()));
    }
    Err(format!("unrecognised date `{value}`"))
}

/// Parse a timestamp cell; date-only values land on midnight.
pub fn parse_datetime(raw: &str) -> Result<Option<NaiveDateTime>, String> {
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }
    if let Some(dt) = parse_datetime_value(value) {
        return Ok(Some(dt));
    }
    parse_date(value).map(|d| d.map(|d| d.and_time(NaiveTime::MIN)))
}

fn parse_datetime_value(value: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .filter_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .find(|dt| plausible(dt.date()))
}
