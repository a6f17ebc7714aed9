//!
//! src/period.rs  Andrew Belles  Oct 16th, 2026
//!
//! Parsing and validation of partial performance dates
//! (yyyy, yyyy-mm, yyyy-mm-dd with ? placeholders)
//!

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::LinkerError;

static DATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}|\?{4})(?:-(\d{2}|\?{2})(?:-(\d{2}|\?{2}))?)?$")
        .expect("static date regex")
});

static LIVE_DATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"live(?: .+)?, ([0-9]{4}(?:-[0-9]{2}(?:-[0-9]{2})?)?)(?:: .+)?$")
        .expect("static live date regex")
});

const DAYS_IN_MONTH: [u8; 13] = [0, 31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// Begin and end date of a performance, the linker always uses
/// the same date for both ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Period {
    pub year: Option<u16>,
    pub month: Option<u8>,
    pub day: Option<u8>
}

fn is_leap_year(year: u16) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

impl Period {
    pub fn parse(s: &str) -> Result<Period, LinkerError> {
        let s = s.trim();
        let captures = DATE_REGEX.captures(s)
            .ok_or_else(|| LinkerError::Validation(format!("malformed date {s:?}")))?;

        // unknown ("????") parts fail to parse and stay None
        let year  = captures.get(1).and_then(|m| m.as_str().parse::<u16>().ok());
        let month = captures.get(2).and_then(|m| m.as_str().parse::<u8>().ok());
        let day   = captures.get(3).and_then(|m| m.as_str().parse::<u8>().ok());

        let period = Period { year, month, day };
        period.validate()?;
        Ok(period)
    }

    pub fn is_empty(&self) -> bool {
        self.year.is_none() && self.month.is_none() && self.day.is_none()
    }

    pub fn validate(&self) -> Result<(), LinkerError> {
        if self.is_empty() {
            return Err(LinkerError::Validation("date has no known part".to_string()));
        }
        if let Some(year) = self.year {
            if year < 1 {
                return Err(LinkerError::Validation(format!("invalid year {year}")));
            }
        }
        if let Some(month) = self.month {
            if !(1..=12).contains(&month) {
                return Err(LinkerError::Validation(format!("invalid month {month}")));
            }
        }
        let Some(day) = self.day else {
            return Ok(());
        };

        // an unknown year may still be a leap year
        let leap = self.year.map(is_leap_year).unwrap_or(true);
        let max = match self.month {
            Some(2) if leap => 29,
            Some(m) => DAYS_IN_MONTH[m as usize],
            None => 31
        };
        if day < 1 || day > max {
            return Err(LinkerError::Validation(format!("invalid day {day}")));
        }
        Ok(())
    }

    /// Date embedded in comments such as "live, 1994-08-11: Woodstock"
    pub fn from_live_comment(comment: &str) -> Option<Period> {
        let captures = LIVE_DATE_REGEX.captures(comment)?;
        Period::parse(captures.get(1)?.as_str()).ok()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.year {
            Some(y) => write!(f, "{y:04}")?,
            None => f.write_str("????")?
        }
        if self.month.is_none() && self.day.is_none() {
            return Ok(());
        }
        match self.month {
            Some(m) => write!(f, "-{m:02}")?,
            None => f.write_str("-??")?
        }
        if let Some(d) = self.day {
            write!(f, "-{d:02}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_dates() {
        assert_eq!(
            Period::parse("1994").unwrap(),
            Period { year: Some(1994), month: None, day: None }
        );
        assert_eq!(
            Period::parse("1994-08-11").unwrap(),
            Period { year: Some(1994), month: Some(8), day: Some(11) }
        );
        assert_eq!(
            Period::parse("????-08").unwrap(),
            Period { year: None, month: Some(8), day: None }
        );
    }

    #[test]
    fn rejects_invalid_dates() {
        for input in ["", "94", "1994-13", "1994-02-30", "1900-02-29", "????", "0000", "1994/08/11"] {
            assert!(
                matches!(Period::parse(input), Err(LinkerError::Validation(_))),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn leap_days() {
        assert!(Period::parse("2000-02-29").is_ok());
        assert!(Period::parse("2024-02-29").is_ok());
        assert!(Period::parse("????-02-29").is_ok());
        assert!(Period::parse("2023-02-29").is_err());
    }

    #[test]
    fn live_comment_dates() {
        assert_eq!(
            Period::from_live_comment("live, 1994-08-11: Woodstock"),
            Some(Period { year: Some(1994), month: Some(8), day: Some(11) })
        );
        assert_eq!(
            Period::from_live_comment("live at the BBC, 1970-03"),
            Some(Period { year: Some(1970), month: Some(3), day: None })
        );
        assert_eq!(Period::from_live_comment("studio version"), None);
    }

    #[test]
    fn display_round_trips_shape() {
        assert_eq!(Period::parse("1994-08").unwrap().to_string(), "1994-08");
        assert_eq!(Period::parse("????-08-01").unwrap().to_string(), "????-08-01");
    }
}
