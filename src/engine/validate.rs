use crate::limits::*;
use crate::model::*;

use super::BookingError;

pub(crate) fn validate_host(host_email: &str) -> Result<(), BookingError> {
    if host_email.is_empty() {
        return Err(BookingError::Malformed("empty host email".into()));
    }
    if host_email.len() > MAX_HOST_EMAIL_LEN {
        return Err(BookingError::LimitExceeded("host email too long"));
    }
    Ok(())
}

pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, BookingError> {
    let span = Span::checked(start, end).ok_or(BookingError::InvalidInterval { start, end })?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(BookingError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(BookingError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

pub(crate) fn validate_ttl(ttl: Ms) -> Result<(), BookingError> {
    if ttl < minutes_to_ms(MIN_HOLD_MINUTES) || ttl > minutes_to_ms(MAX_HOLD_MINUTES) {
        return Err(BookingError::LimitExceeded("hold expiration out of range"));
    }
    Ok(())
}

pub(crate) fn parse_timestamp(field: &str, value: &str) -> Result<Ms, BookingError> {
    parse_instant(value).ok_or_else(|| {
        BookingError::Malformed(format!(
            "{field}: not an ISO-8601 timestamp with offset: {value:?}"
        ))
    })
}
