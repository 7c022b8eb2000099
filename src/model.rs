use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Unix milliseconds. Creation times and cancellation deadlines use it.
pub type Ms = i64;

/// Money in the listing's minor currency unit.
pub type Amount = u64;

/// Inclusive range of calendar days `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, EngineError> {
        if start > end {
            return Err(EngineError::Validation(format!(
                "start date {start} is after end date {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn single(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    /// Number of calendar days covered, both ends included.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Every date from `start` to `end` inclusive.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Half-open wall-clock range `[start, end)`, applied to every day of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, EngineError> {
        if start >= end {
            return Err(EngineError::Validation(format!(
                "start time {start} must be before end time {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// `self` is the existing range, `candidate` the requested one. Touching
    /// boundaries (one ends exactly where the other starts) do not overlap.
    pub fn overlaps(&self, candidate: &TimeRange) -> bool {
        let starts_inside = self.start <= candidate.start && candidate.start < self.end;
        let ends_inside = self.start < candidate.end && candidate.end <= self.end;
        let contains = candidate.start <= self.start && candidate.end >= self.end;
        starts_inside || ends_inside || contains
    }
}

/// Date range plus optional time of day. Without a time range every covered
/// day is booked whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub dates: DateRange,
    pub times: Option<TimeRange>,
}

impl Window {
    pub fn whole_days(dates: DateRange) -> Self {
        Self { dates, times: None }
    }

    pub fn timed(dates: DateRange, times: TimeRange) -> Self {
        Self {
            dates,
            times: Some(times),
        }
    }

    /// Time-of-day clash on a date both windows cover.
    pub fn times_clash(&self, candidate: &Window) -> bool {
        match (&self.times, &candidate.times) {
            (Some(existing), Some(requested)) => existing.overlaps(requested),
            _ => true,
        }
    }

    pub fn conflicts_with(&self, candidate: &Window) -> bool {
        self.dates.overlaps(&candidate.dates) && self.times_clash(candidate)
    }

    /// Build from loose request fields. Times must come as a pair.
    pub fn from_parts(
        start_date: NaiveDate,
        end_date: NaiveDate,
        start_time: Option<NaiveTime>,
        end_time: Option<NaiveTime>,
    ) -> Result<Self, EngineError> {
        let dates = DateRange::new(start_date, end_date)?;
        match (start_time, end_time) {
            (None, None) => Ok(Self::whole_days(dates)),
            (Some(start), Some(end)) => Ok(Self::timed(dates, TimeRange::new(start, end)?)),
            _ => Err(EngineError::Validation(
                "start_time and end_time must be given together".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Descriptive fields of a work space, as supplied by its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceListing {
    pub title: String,
    pub description: String,
    pub address: String,
    pub location: Location,
    pub capacity: u32,
    pub price_per_day: Amount,
    pub image_url: Option<String>,
}

/// Partial update of a listing. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpacePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub address: Option<String>,
    pub location: Option<Location>,
    pub capacity: Option<u32>,
    pub price_per_day: Option<Amount>,
    pub image_url: Option<String>,
}

impl SpacePatch {
    pub fn is_empty(&self) -> bool {
        *self == SpacePatch::default()
    }

    pub fn apply(&self, listing: &SpaceListing) -> SpaceListing {
        let mut next = listing.clone();
        if let Some(title) = &self.title {
            next.title = title.clone();
        }
        if let Some(description) = &self.description {
            next.description = description.clone();
        }
        if let Some(address) = &self.address {
            next.address = address.clone();
        }
        if let Some(location) = self.location {
            next.location = location;
        }
        if let Some(capacity) = self.capacity {
            next.capacity = capacity;
        }
        if let Some(price) = self.price_per_day {
            next.price_per_day = price;
        }
        if let Some(url) = &self.image_url {
            next.image_url = Some(url.clone());
        }
        next
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    pub email: String,
    pub admin: bool,
}

/// Partial profile update; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub admin: Option<bool>,
}

impl UserPatch {
    pub fn is_empty(&self) -> bool {
        *self == UserPatch::default()
    }

    pub fn apply(&self, profile: &UserProfile) -> UserProfile {
        UserProfile {
            name: self.name.clone().unwrap_or_else(|| profile.name.clone()),
            email: self.email.clone().unwrap_or_else(|| profile.email.clone()),
            admin: self.admin.unwrap_or(profile.admin),
        }
    }
}

/// A booked window on a space. Owns its own data; spaces and users only
/// reference it by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub space_id: Ulid,
    pub user_id: Ulid,
    pub window: Window,
    pub details: Option<String>,
    pub total_price: Amount,
    pub created_at: Ms,
    pub cancellation_deadline: Ms,
}

/// Structured booking input. Validated by [`BookingRequest::window`] before the
/// booking transaction touches any state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub space_id: Ulid,
    pub user_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub details: Option<String>,
}

impl BookingRequest {
    pub fn window(&self) -> Result<Window, EngineError> {
        Window::from_parts(self.start_date, self.end_date, self.start_time, self.end_time)
    }
}

#[derive(Debug, Clone)]
pub struct SpaceState {
    pub id: Ulid,
    pub listing: SpaceListing,
    /// Live reservations, sorted by `window.dates.start`.
    pub reservations: Vec<Reservation>,
    /// Reservation ids in booking order.
    pub reservation_refs: Vec<Ulid>,
    pub times_booked: u64,
    pub economic_performance: Amount,
    /// Set once the space is deleted; writers that raced the delete see it
    /// after taking the lock.
    pub deleted: bool,
}

impl SpaceState {
    pub fn new(id: Ulid, listing: SpaceListing) -> Self {
        Self {
            id,
            listing,
            reservations: Vec::new(),
            reservation_refs: Vec::new(),
            times_booked: 0,
            economic_performance: 0,
            deleted: false,
        }
    }

    /// Insert keeping sort order by start date.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.window.dates.start <= reservation.window.dates.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    /// Reservations whose date range shares at least one day with `dates`.
    /// Binary search skips everything starting after `dates.end`.
    pub fn overlapping(&self, dates: &DateRange) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.window.dates.start <= dates.end);
        let query_start = dates.start;
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.window.dates.end >= query_start)
    }

    /// `(times_booked, economic_performance)` aggregated from the live
    /// reservations instead of the stored counters.
    pub fn recomputed_counters(&self) -> (u64, Amount) {
        let revenue = self.reservations.iter().map(|r| r.total_price).sum();
        (self.reservations.len() as u64, revenue)
    }
}

#[derive(Debug, Clone)]
pub struct UserState {
    pub id: Ulid,
    pub profile: UserProfile,
    /// Reservation ids in booking order.
    pub reservations: Vec<Ulid>,
    pub deleted: bool,
}

impl UserState {
    pub fn new(id: Ulid, profile: UserProfile) -> Self {
        Self {
            id,
            profile,
            reservations: Vec::new(),
            deleted: false,
        }
    }
}

/// The event types, flat. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    SpaceCreated {
        id: Ulid,
        listing: SpaceListing,
    },
    SpaceUpdated {
        id: Ulid,
        listing: SpaceListing,
    },
    /// Cascades to every reservation of the space and its users' references.
    SpaceDeleted {
        id: Ulid,
    },
    UserCreated {
        id: Ulid,
        profile: UserProfile,
    },
    UserDeleted {
        id: Ulid,
    },
    /// One record for the reservation, the space counters and the user
    /// back-reference, so the three writes commit or fail together.
    ReservationBooked {
        reservation: Reservation,
    },
    ReservationCancelled {
        id: Ulid,
        space_id: Ulid,
        user_id: Ulid,
    },
    // Last so logs written before it keep their variant tags.
    UserUpdated {
        id: Ulid,
        profile: UserProfile,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SpaceInfo {
    pub id: Ulid,
    pub listing: SpaceListing,
    pub reservations: Vec<Ulid>,
    pub times_booked: u64,
    pub economic_performance: Amount,
}

impl From<&SpaceState> for SpaceInfo {
    fn from(space: &SpaceState) -> Self {
        Self {
            id: space.id,
            listing: space.listing.clone(),
            reservations: space.reservation_refs.clone(),
            times_booked: space.times_booked,
            economic_performance: space.economic_performance,
        }
    }
}

/// Map marker for a space.
#[derive(Debug, Clone, PartialEq)]
pub struct SpaceLocation {
    pub id: Ulid,
    pub title: String,
    pub description: String,
    pub location: Location,
    pub price_per_day: Amount,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpacePage {
    pub items: Vec<SpaceInfo>,
    pub total: usize,
    pub page: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: Ulid,
    pub profile: UserProfile,
    pub reservations: Vec<Ulid>,
}

impl From<&UserState> for UserInfo {
    fn from(user: &UserState) -> Self {
        Self {
            id: user.id,
            profile: user.profile.clone(),
            reservations: user.reservations.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingMetric {
    BestRevenue,
    WorstRevenue,
    MostBooked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedSpace {
    pub id: Ulid,
    pub title: String,
    pub times_booked: u64,
    pub economic_performance: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub total_revenue: Amount,
    pub total_spaces: usize,
    pub total_reservations: usize,
    pub best_revenue: Vec<RankedSpace>,
    pub worst_revenue: Vec<RankedSpace>,
    pub most_booked: Vec<RankedSpace>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn t(hour: u32, min: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, min, 0).unwrap()
    }

    fn listing() -> SpaceListing {
        SpaceListing {
            title: "Loft".into(),
            description: "Open plan".into(),
            address: "1 Main St".into(),
            location: Location {
                latitude: 19.43,
                longitude: -99.13,
            },
            capacity: 4,
            price_per_day: 50,
            image_url: None,
        }
    }

    fn reservation(start: u32, end: u32) -> Reservation {
        Reservation {
            id: Ulid::new(),
            space_id: Ulid::new(),
            user_id: Ulid::new(),
            window: Window::whole_days(DateRange::new(d(start), d(end)).unwrap()),
            details: None,
            total_price: 0,
            created_at: 0,
            cancellation_deadline: 0,
        }
    }

    #[test]
    fn date_range_days_and_dates() {
        let r = DateRange::new(d(1), d(5)).unwrap();
        assert_eq!(r.days(), 5);
        let dates: Vec<_> = r.dates().collect();
        assert_eq!(dates, vec![d(1), d(2), d(3), d(4), d(5)]);
        assert_eq!(DateRange::single(d(7)).days(), 1);
    }

    #[test]
    fn date_range_rejects_inverted() {
        assert!(matches!(
            DateRange::new(d(5), d(1)),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn date_range_crosses_month_boundary() {
        let start = NaiveDate::from_ymd_opt(2024, 2, 28).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        // 2024 is a leap year: Feb 28, Feb 29, Mar 1
        assert_eq!(DateRange::new(start, end).unwrap().days(), 3);
    }

    #[test]
    fn date_range_overlap_is_inclusive() {
        let a = DateRange::new(d(1), d(3)).unwrap();
        assert!(a.overlaps(&DateRange::single(d(3))));
        assert!(!a.overlaps(&DateRange::single(d(4))));
        assert!(a.contains(d(1)));
        assert!(!a.contains(d(4)));
    }

    #[test]
    fn time_range_rejects_empty_and_inverted() {
        assert!(TimeRange::new(t(10, 0), t(10, 0)).is_err());
        assert!(TimeRange::new(t(11, 0), t(10, 0)).is_err());
    }

    #[test]
    fn time_range_touching_boundaries_do_not_overlap() {
        let existing = TimeRange::new(t(14, 0), t(16, 0)).unwrap();
        assert!(!existing.overlaps(&TimeRange::new(t(16, 0), t(18, 0)).unwrap()));
        assert!(!existing.overlaps(&TimeRange::new(t(12, 0), t(14, 0)).unwrap()));
    }

    #[test]
    fn time_range_overlap_cases() {
        let existing = TimeRange::new(t(14, 0), t(16, 0)).unwrap();
        // candidate start inside
        assert!(existing.overlaps(&TimeRange::new(t(15, 0), t(17, 0)).unwrap()));
        // candidate end inside
        assert!(existing.overlaps(&TimeRange::new(t(13, 0), t(15, 0)).unwrap()));
        // candidate contains existing
        assert!(existing.overlaps(&TimeRange::new(t(13, 0), t(17, 0)).unwrap()));
        // existing contains candidate
        assert!(existing.overlaps(&TimeRange::new(t(14, 30), t(15, 0)).unwrap()));
        // identical
        assert!(existing.overlaps(&existing));
    }

    #[test]
    fn time_range_overlap_is_symmetric() {
        let times: Vec<TimeRange> = [(8, 10), (9, 11), (10, 12), (8, 12), (11, 12)]
            .iter()
            .map(|&(s, e)| TimeRange::new(t(s, 0), t(e, 0)).unwrap())
            .collect();
        for a in &times {
            for b in &times {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn window_without_times_blocks_whole_day() {
        let whole = Window::whole_days(DateRange::single(d(2)));
        let timed = Window::timed(
            DateRange::single(d(2)),
            TimeRange::new(t(9, 0), t(10, 0)).unwrap(),
        );
        assert!(whole.conflicts_with(&timed));
        assert!(timed.conflicts_with(&whole));
    }

    #[test]
    fn window_needs_shared_date() {
        let a = Window::timed(
            DateRange::new(d(1), d(3)).unwrap(),
            TimeRange::new(t(14, 0), t(16, 0)).unwrap(),
        );
        let b = Window::timed(
            DateRange::single(d(4)),
            TimeRange::new(t(14, 0), t(16, 0)).unwrap(),
        );
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn booking_request_requires_both_times() {
        let req = BookingRequest {
            id: Ulid::new(),
            space_id: Ulid::new(),
            user_id: Ulid::new(),
            start_date: d(1),
            end_date: d(1),
            start_time: Some(t(9, 0)),
            end_time: None,
            details: None,
        };
        assert!(matches!(req.window(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn reservations_kept_sorted_by_start_date() {
        let mut space = SpaceState::new(Ulid::new(), listing());
        space.insert_reservation(reservation(10, 12));
        space.insert_reservation(reservation(1, 2));
        space.insert_reservation(reservation(5, 5));
        let starts: Vec<_> = space
            .reservations
            .iter()
            .map(|r| r.window.dates.start)
            .collect();
        assert_eq!(starts, vec![d(1), d(5), d(10)]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut space = SpaceState::new(Ulid::new(), listing());
        space.insert_reservation(reservation(1, 2));
        space.insert_reservation(reservation(4, 8));
        space.insert_reservation(reservation(20, 21));

        let hits: Vec<_> = space
            .overlapping(&DateRange::new(d(5), d(10)).unwrap())
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].window.dates.start, d(4));
    }

    #[test]
    fn overlapping_includes_touching_days() {
        let mut space = SpaceState::new(Ulid::new(), listing());
        space.insert_reservation(reservation(1, 3));
        assert_eq!(space.overlapping(&DateRange::single(d(3))).count(), 1);
        assert_eq!(space.overlapping(&DateRange::single(d(4))).count(), 0);
    }

    #[test]
    fn remove_reservation_by_id() {
        let mut space = SpaceState::new(Ulid::new(), listing());
        let r = reservation(1, 1);
        let id = r.id;
        space.insert_reservation(r);
        assert!(space.remove_reservation(Ulid::new()).is_none());
        assert_eq!(space.remove_reservation(id).map(|r| r.id), Some(id));
        assert!(space.reservations.is_empty());
    }

    #[test]
    fn patch_applies_only_given_fields() {
        let base = listing();
        let patch = SpacePatch {
            price_per_day: Some(75),
            image_url: Some("https://img.example/loft.jpg".into()),
            ..Default::default()
        };
        let next = patch.apply(&base);
        assert_eq!(next.price_per_day, 75);
        assert_eq!(next.title, base.title);
        assert_eq!(next.image_url.as_deref(), Some("https://img.example/loft.jpg"));
        assert!(SpacePatch::default().is_empty());
        assert!(!patch.is_empty());
    }

    #[test]
    fn user_patch_keeps_unset_fields() {
        let base = UserProfile {
            name: "Ana".into(),
            email: "ana@example.com".into(),
            admin: false,
        };
        let patch = UserPatch {
            admin: Some(true),
            ..Default::default()
        };
        let next = patch.apply(&base);
        assert!(next.admin);
        assert_eq!(next.name, "Ana");
        assert_eq!(next.email, "ana@example.com");
        assert!(UserPatch::default().is_empty());
        assert!(!patch.is_empty());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationBooked {
            reservation: Reservation {
                window: Window::timed(
                    DateRange::new(d(1), d(3)).unwrap(),
                    TimeRange::new(t(14, 0), t(16, 0)).unwrap(),
                ),
                details: Some("team offsite".into()),
                total_price: 150,
                ..reservation(1, 3)
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
