use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn today() -> chrono::NaiveDate {
    chrono::Utc::now().date_naive()
}

/// The first of `existing` that blocks `candidate`, if any.
///
/// Only passes of the same requester count; `exclude` skips the pass being
/// edited; rejected passes never block.
pub fn find_conflict<'a>(
    candidate: &GuestPass,
    existing: &'a [GuestPass],
    exclude: Option<ulid::Ulid>,
) -> Option<&'a GuestPass> {
    existing.iter().find(|other| {
        other.requester_id == candidate.requester_id
            && Some(other.id) != exclude
            && other.status != PassStatus::Rejected
            && other.dates.overlaps(&candidate.dates)
    })
}

pub fn has_conflict(
    candidate: &GuestPass,
    existing: &[GuestPass],
    exclude: Option<ulid::Ulid>,
) -> bool {
    find_conflict(candidate, existing, exclude).is_some()
}

pub(crate) fn check_no_conflict(
    candidate: &GuestPass,
    existing: &[GuestPass],
    exclude: Option<ulid::Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(candidate, existing, exclude) {
        Some(other) => {
            metrics::counter!(crate::observability::PASS_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict(other.id))
        }
        None => Ok(()),
    }
}

/// Boundary validation for a requested range.
pub(crate) fn validate_dates(
    start: chrono::NaiveDate,
    end: chrono::NaiveDate,
) -> Result<DateRange, EngineError> {
    use crate::limits::MAX_PASS_DAYS;
    let range = DateRange::new(start, end).ok_or(EngineError::InvalidDateRange)?;
    if range.days() > MAX_PASS_DAYS {
        return Err(EngineError::LimitExceeded("pass spans too many days"));
    }
    Ok(range)
}

pub(crate) fn validate_len(
    value: &str,
    max: usize,
    what: &'static str,
) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}
