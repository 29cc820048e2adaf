use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

static GESTATIONAL_AGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s*w").expect("gestational age regex should compile"));
static BIRTH_WEIGHT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s*g").expect("birth weight regex should compile"));

const MAX_GESTATIONAL_WEEKS: u32 = 50;
const MAX_BIRTH_WEIGHT_GRAMS: u32 = 10_000;

/// DICOM DA value (`YYYYMMDD`). Legacy dotted dates are tolerated.
pub fn parse_study_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y.%m.%d"))
        .ok()
}

/// First value of an IS (integer string) element.
pub fn parse_integer_string(raw: &str) -> Option<i64> {
    raw.split('\\').next()?.trim().parse().ok()
}

/// Weeks of gestation written as e.g. `32w` or `32 weeks` in free text.
pub fn gestational_age_weeks(text: &str) -> Option<u32> {
    capture_u32(&GESTATIONAL_AGE, text)
        .filter(|weeks| (1..=MAX_GESTATIONAL_WEEKS).contains(weeks))
}

/// Weight written as e.g. `1500g` in free text.
pub fn birth_weight_grams(text: &str) -> Option<u32> {
    capture_u32(&BIRTH_WEIGHT, text)
        .filter(|grams| (1..=MAX_BIRTH_WEIGHT_GRAMS).contains(grams))
}

fn capture_u32(pattern: &Regex, text: &str) -> Option<u32> {
    pattern
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Person names use `^` between components.
pub fn display_person_name(raw: &str) -> Option<String> {
    let joined = raw
        .split('^')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!joined.is_empty()).then_some(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn study_dates() {
        assert_eq!(
            parse_study_date("20240131"),
            NaiveDate::from_ymd_opt(2024, 1, 31)
        );
        assert_eq!(
            parse_study_date("2024.01.31"),
            NaiveDate::from_ymd_opt(2024, 1, 31)
        );
        assert_eq!(parse_study_date("20241341"), None);
        assert_eq!(parse_study_date("yesterday"), None);
    }

    #[test]
    fn integer_strings_take_first_value() {
        assert_eq!(parse_integer_string(" 7 "), Some(7));
        assert_eq!(parse_integer_string("3\\4"), Some(3));
        assert_eq!(parse_integer_string("abc"), None);
    }

    #[test]
    fn description_fields() {
        let desc = "NICU chest 32w 1500g";
        assert_eq!(gestational_age_weeks(desc), Some(32));
        assert_eq!(birth_weight_grams(desc), Some(1500));
        assert_eq!(gestational_age_weeks("GA 28 weeks"), Some(28));
        assert_eq!(gestational_age_weeks("CHEST AP"), None);
        assert_eq!(birth_weight_grams("999999g"), None);
    }

    #[test]
    fn person_names_drop_carets() {
        assert_eq!(
            display_person_name("DOE^BABY^^").as_deref(),
            Some("DOE BABY")
        );
        assert_eq!(display_person_name("^^"), None);
    }
}
