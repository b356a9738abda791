//! Validity windows and conversions between profile dates and X.509 times.

use crate::error::{CeremonyError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use der::asn1::{GeneralizedTime, UtcTime};
use std::time::Duration;
use x509_cert::time::{Time, Validity};

/// Layout of every date in a ceremony configuration, interpreted as UTC.
pub const DATE_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a `YYYY-MM-DD HH:MM:SS` date, naming `field` on failure.
pub fn parse_date(value: &str, field: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, DATE_LAYOUT)
        .map(|naive| naive.and_utc())
        .map_err(|e| CeremonyError::ConfigValidation(format!("unable to parse {}: {}", field, e)))
}

/// Encode as UTCTime through 2049 and GeneralizedTime from 2050 (RFC 5280 4.1.2.5).
pub fn to_x509_time(time: DateTime<Utc>) -> Result<Time> {
    let secs = u64::try_from(time.timestamp()).map_err(|_| {
        CeremonyError::CertificateError(format!("{} predates the Unix epoch", time))
    })?;
    let date_time = der::DateTime::from_unix_duration(Duration::from_secs(secs))?;
    if date_time.year() >= 2050 {
        Ok(Time::GeneralTime(GeneralizedTime::from_date_time(date_time)))
    } else {
        Ok(Time::UtcTime(UtcTime::from_date_time(date_time)?))
    }
}

pub fn from_x509_time(time: &Time) -> Result<DateTime<Utc>> {
    let secs = i64::try_from(time.to_unix_duration().as_secs())
        .map_err(|_| CeremonyError::CertificateError("time out of range".to_string()))?;
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| CeremonyError::CertificateError("time out of range".to_string()))
}

pub fn to_validity(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Result<Validity> {
    Ok(Validity {
        not_before: to_x509_time(not_before)?,
        not_after: to_x509_time(not_after)?,
    })
}

/// `(not_before, not_after)` of a certificate validity.
pub fn window(validity: &Validity) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    Ok((
        from_x509_time(&validity.not_before)?,
        from_x509_time(&validity.not_after)?,
    ))
}

/// Require `[start, end]` to lie within `outer`.
pub fn check_nested(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    outer: &Validity,
    what: &str,
) -> Result<()> {
    let (outer_start, outer_end) = window(outer)?;
    if start < outer_start {
        return Err(CeremonyError::TimeWindow(format!(
            "{} starts at {}, before the issuer's notBefore {}",
            what, start, outer_start
        )));
    }
    if end > outer_end {
        return Err(CeremonyError::TimeWindow(format!(
            "{} ends at {}, after the issuer's notAfter {}",
            what, end, outer_end
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date() {
        let date = parse_date("2020-01-01 12:30:00", "not-before").unwrap();
        assert_eq!(date.to_rfc3339(), "2020-01-01T12:30:00+00:00");

        let err = parse_date("2020-01-01", "not-before").unwrap_err();
        assert!(err.to_string().contains("not-before"));
    }

    #[test]
    fn test_time_encoding_switches_at_2050() {
        let before = parse_date("2049-12-31 23:59:59", "t").unwrap();
        let after = parse_date("2050-01-01 00:00:00", "t").unwrap();
        assert!(matches!(to_x509_time(before).unwrap(), Time::UtcTime(_)));
        assert!(matches!(to_x509_time(after).unwrap(), Time::GeneralTime(_)));
        assert_eq!(from_x509_time(&to_x509_time(after).unwrap()).unwrap(), after);
    }

    #[test]
    fn test_check_nested() {
        let outer = to_validity(
            parse_date("2019-01-01 00:00:00", "t").unwrap(),
            parse_date("2040-01-01 00:00:00", "t").unwrap(),
        )
        .unwrap();
        let inside = parse_date("2020-01-01 00:00:00", "t").unwrap();
        let early = parse_date("2018-01-01 00:00:00", "t").unwrap();
        let late = parse_date("2041-01-01 00:00:00", "t").unwrap();

        assert!(check_nested(inside, inside, &outer, "window").is_ok());
        assert!(matches!(
            check_nested(early, inside, &outer, "window"),
            Err(CeremonyError::TimeWindow(_))
        ));
        assert!(matches!(
            check_nested(inside, late, &outer, "window"),
            Err(CeremonyError::TimeWindow(_))
        ));
    }
}
