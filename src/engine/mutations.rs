use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, now_ms, validate_window};
use super::pricing::total_price;
use super::{affected_users, Engine, EngineError, WalCommand};

fn validate_listing(listing: &SpaceListing) -> Result<(), EngineError> {
    if listing.title.trim().is_empty() {
        return Err(EngineError::Validation("title is required".into()));
    }
    if listing.title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    if listing.description.len() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    if listing.address.len() > MAX_ADDRESS_LEN {
        return Err(EngineError::LimitExceeded("address too long"));
    }
    if let Some(url) = &listing.image_url
        && url.len() > MAX_URL_LEN
    {
        return Err(EngineError::LimitExceeded("image url too long"));
    }
    if listing.capacity == 0 {
        return Err(EngineError::Validation("capacity must be at least 1".into()));
    }
    let Location { latitude, longitude } = listing.location;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(EngineError::Validation(format!(
            "location ({latitude}, {longitude}) out of range"
        )));
    }
    Ok(())
}

/// Same shape the marketplace has always accepted: `local@domain.tld`, no
/// whitespace, exactly one `@`.
fn looks_like_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    domain
        .char_indices()
        .any(|(i, c)| c == '.' && i > 0 && i + 1 < domain.len())
}

fn validate_profile(profile: &UserProfile) -> Result<(), EngineError> {
    if profile.name.trim().is_empty() {
        return Err(EngineError::Validation("name is required".into()));
    }
    if profile.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    if profile.email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    if !looks_like_email(&profile.email) {
        return Err(EngineError::Validation(format!(
            "malformed email: {}",
            profile.email
        )));
    }
    Ok(())
}

impl Engine {
    pub async fn create_space(&self, id: Ulid, listing: SpaceListing) -> Result<(), EngineError> {
        if self.spaces.len() >= MAX_SPACES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many spaces"));
        }
        validate_listing(&listing)?;
        let _gate = self.compaction_gate.read().await;

        // The id is claimed before the WAL append. The write guard keeps every
        // reader off the new space until the append is durable.
        let space = Arc::new(RwLock::new(SpaceState::new(id, listing.clone())));
        let mut pending = space.clone().write_owned().await;
        match self.spaces.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(space);
            }
        }

        match self.titles.entry(listing.title.clone()) {
            Entry::Occupied(_) => {
                pending.deleted = true;
                self.spaces.remove(&id);
                return Err(EngineError::Duplicate {
                    field: "title",
                    value: listing.title,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let event = Event::SpaceCreated { id, listing };
        if let Err(e) = self.wal_append(&event).await {
            pending.deleted = true;
            self.titles.remove_if(&pending.listing.title, |_, owner| *owner == id);
            self.spaces.remove(&id);
            return Err(e);
        }
        drop(pending);
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn update_space(&self, id: Ulid, patch: SpacePatch) -> Result<(), EngineError> {
        if patch.is_empty() {
            return Err(EngineError::Validation("nothing to update".into()));
        }
        let _gate = self.compaction_gate.read().await;
        let rs = self.get_space(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }

        let next = patch.apply(&guard.listing);
        validate_listing(&next)?;

        let retitled = next.title != guard.listing.title;
        if retitled {
            match self.titles.entry(next.title.clone()) {
                Entry::Occupied(_) => {
                    return Err(EngineError::Duplicate {
                        field: "title",
                        value: next.title,
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(id);
                }
            }
        }

        let event = Event::SpaceUpdated {
            id,
            listing: next.clone(),
        };
        let result = self.persist_and_apply(&mut guard, None, &event).await;
        if result.is_err() && retitled {
            self.titles.remove(&next.title);
        }
        result
    }

    /// Delete a space and everything hanging off it. Returns how many
    /// reservations went with it.
    pub async fn delete_space(&self, id: Ulid) -> Result<usize, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let rs = self.get_space(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write_owned().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }

        let mut users = Vec::new();
        for uid in affected_users(&guard) {
            if let Some(user) = self.get_user(&uid) {
                users.push(user.write_owned().await);
            }
        }

        let event = Event::SpaceDeleted { id };
        self.wal_append(&event).await?;
        let cascaded = guard.reservations.len();
        self.apply_space_deleted(&mut guard, &mut users);
        self.spaces.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        info!("deleted space {id} with {cascaded} reservations");
        Ok(cascaded)
    }

    pub async fn create_user(&self, id: Ulid, profile: UserProfile) -> Result<(), EngineError> {
        if self.users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        validate_profile(&profile)?;
        let _gate = self.compaction_gate.read().await;

        // Same claim order as spaces: id, then the unique email.
        let user = Arc::new(RwLock::new(UserState::new(id, profile.clone())));
        let mut pending = user.clone().write_owned().await;
        match self.users.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(user);
            }
        }

        let email_key = profile.email.to_lowercase();
        match self.emails.entry(email_key.clone()) {
            Entry::Occupied(_) => {
                pending.deleted = true;
                self.users.remove(&id);
                return Err(EngineError::Duplicate {
                    field: "email",
                    value: profile.email,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        if let Err(e) = self.wal_append(&Event::UserCreated { id, profile }).await {
            pending.deleted = true;
            self.emails.remove_if(&email_key, |_, owner| *owner == id);
            self.users.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Partial profile update. A changed email is re-checked for uniqueness,
    /// case-insensitively, before anything is written.
    pub async fn update_user(&self, id: Ulid, patch: UserPatch) -> Result<(), EngineError> {
        if patch.is_empty() {
            return Err(EngineError::Validation("nothing to update".into()));
        }
        let _gate = self.compaction_gate.read().await;
        let user = self.get_user(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = user.write().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }

        let next = patch.apply(&guard.profile);
        validate_profile(&next)?;

        let new_key = next.email.to_lowercase();
        let email_changed = new_key != guard.profile.email.to_lowercase();
        if email_changed {
            match self.emails.entry(new_key.clone()) {
                Entry::Occupied(_) => {
                    return Err(EngineError::Duplicate {
                        field: "email",
                        value: next.email,
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(id);
                }
            }
        }

        let event = Event::UserUpdated {
            id,
            profile: next.clone(),
        };
        if let Err(e) = self.wal_append(&event).await {
            if email_changed {
                self.emails.remove_if(&new_key, |_, owner| *owner == id);
            }
            return Err(e);
        }
        self.apply_user_updated(&mut guard, &next);
        info!("updated user {id}");
        Ok(())
    }

    /// Users can only leave once all their reservations are gone.
    pub async fn delete_user(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let user = self.get_user(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = user.write().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }
        if !guard.reservations.is_empty() {
            return Err(EngineError::HasReservations(id));
        }

        self.wal_append(&Event::UserDeleted { id }).await?;
        guard.deleted = true;
        self.emails.remove(&guard.profile.email.to_lowercase());
        self.users.remove(&id);
        Ok(())
    }

    pub async fn book(&self, request: BookingRequest) -> Result<Reservation, EngineError> {
        self.book_at(request, now_ms()).await
    }

    /// Booking transaction. Everything up to the WAL append is read-only, so a
    /// rejection leaves no trace; the append itself carries the reservation,
    /// the space counters and the user back-reference as one record.
    pub async fn book_at(&self, request: BookingRequest, now: Ms) -> Result<Reservation, EngineError> {
        let window = request.window()?;
        validate_window(&window, request.details.as_deref())?;

        let _gate = self.compaction_gate.read().await;
        let rs = self
            .get_space(&request.space_id)
            .ok_or(EngineError::NotFound(request.space_id))?;
        let user = self
            .get_user(&request.user_id)
            .ok_or(EngineError::NotFound(request.user_id))?;
        if self.reservation_to_space.contains_key(&request.id) {
            return Err(EngineError::AlreadyExists(request.id));
        }

        // Space lock first, then user: every path that takes both uses this order.
        let mut space = rs.write().await;
        if space.deleted {
            return Err(EngineError::NotFound(request.space_id));
        }
        if space.reservations.len() >= MAX_RESERVATIONS_PER_SPACE {
            return Err(EngineError::LimitExceeded("too many reservations on space"));
        }
        if let Err(e) = check_no_conflict(&space, &window) {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            debug!(
                "booking {} rejected: {} overlaps an existing reservation on {}",
                request.id, window.dates.start, request.space_id
            );
            return Err(e);
        }

        let price = total_price(space.listing.price_per_day, &window.dates)?;
        if space.economic_performance.checked_add(price).is_none() {
            return Err(EngineError::LimitExceeded("space revenue overflow"));
        }
        let reservation = Reservation {
            id: request.id,
            space_id: request.space_id,
            user_id: request.user_id,
            window,
            details: request.details,
            total_price: price,
            created_at: now,
            cancellation_deadline: now.saturating_add(self.grace_window),
        };

        let mut user_guard = user.write().await;
        if user_guard.deleted {
            return Err(EngineError::NotFound(request.user_id));
        }
        // Ids are client-chosen; a racing booking on another space may have
        // claimed this one while we waited for the locks.
        if self.reservation_to_space.contains_key(&reservation.id) {
            return Err(EngineError::AlreadyExists(reservation.id));
        }

        let event = Event::ReservationBooked {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut space, Some(&mut *user_guard), &event)
            .await?;

        metrics::counter!(observability::BOOKINGS_TOTAL).increment(1);
        info!(
            "booked {} on space {} for user {}: {} day(s), total {}",
            reservation.id,
            reservation.space_id,
            reservation.user_id,
            reservation.window.dates.days(),
            reservation.total_price
        );
        Ok(reservation)
    }

    pub async fn cancel(&self, reservation_id: Ulid) -> Result<Reservation, EngineError> {
        self.cancel_at(reservation_id, now_ms()).await
    }

    /// Cancellation policy: allowed strictly before the stored deadline.
    /// Reverses every side effect of the booking.
    pub async fn cancel_at(&self, reservation_id: Ulid, now: Ms) -> Result<Reservation, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut space = self.resolve_reservation_write(&reservation_id).await?;
        let reservation = space
            .reservation(&reservation_id)
            .cloned()
            .ok_or(EngineError::NotFound(reservation_id))?;

        if now >= reservation.cancellation_deadline {
            metrics::counter!(observability::CANCELLATIONS_REJECTED_TOTAL).increment(1);
            return Err(EngineError::CancellationWindowExpired {
                deadline: reservation.cancellation_deadline,
            });
        }

        let user = self.get_user(&reservation.user_id);
        let mut user_guard = match &user {
            Some(u) => Some(u.write().await),
            None => None,
        };

        let event = Event::ReservationCancelled {
            id: reservation_id,
            space_id: reservation.space_id,
            user_id: reservation.user_id,
        };
        self.persist_and_apply(&mut space, user_guard.as_deref_mut(), &event)
            .await?;

        metrics::counter!(observability::CANCELLATIONS_TOTAL).increment(1);
        info!(
            "cancelled {} on space {}, refunded {}",
            reservation_id, reservation.space_id, reservation.total_price
        );
        Ok(reservation)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state. Reservations are re-emitted in booking order so user
    /// back-references come back in the same order.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let mut events = Vec::new();
        let mut reservations = Vec::new();

        let space_arcs: Vec<_> = self.spaces.iter().map(|e| e.value().clone()).collect();
        let user_arcs: Vec<_> = self.users.iter().map(|e| e.value().clone()).collect();

        for user in &user_arcs {
            let guard = user.read().await;
            events.push(Event::UserCreated {
                id: guard.id,
                profile: guard.profile.clone(),
            });
        }
        for space in &space_arcs {
            let guard = space.read().await;
            events.push(Event::SpaceCreated {
                id: guard.id,
                listing: guard.listing.clone(),
            });
            reservations.extend(guard.reservations.iter().cloned());
        }

        reservations.sort_by_key(|r| (r.created_at, r.id));
        events.extend(
            reservations
                .into_iter()
                .map(|reservation| Event::ReservationBooked { reservation }),
        );

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
