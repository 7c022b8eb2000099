use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_window(window: &Window, details: Option<&str>) -> Result<(), EngineError> {
    if window.dates.days() > MAX_RESERVATION_DAYS {
        return Err(EngineError::LimitExceeded("reservation spans too many days"));
    }
    if let Some(d) = details
        && d.len() > MAX_DETAILS_LEN
    {
        return Err(EngineError::LimitExceeded("details too long"));
    }
    Ok(())
}

/// Existing reservations of `space` that clash with `candidate`.
///
/// A stored date range that overlaps the candidate range brackets at least one
/// candidate date, so the range test stands in for walking the candidate dates
/// one by one. On shared dates the time-of-day predicate decides; a missing
/// time range on either side clashes with everything.
pub(crate) fn find_conflicts<'a>(space: &'a SpaceState, candidate: &Window) -> Vec<&'a Reservation> {
    space
        .overlapping(&candidate.dates)
        .filter(|existing| existing.window.times_clash(candidate))
        .collect()
}

pub(crate) fn check_no_conflict(space: &SpaceState, candidate: &Window) -> Result<(), EngineError> {
    if find_conflicts(space, candidate).is_empty() {
        Ok(())
    } else {
        Err(EngineError::Conflict)
    }
}
