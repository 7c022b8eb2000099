mod conflict;
mod error;
mod mutations;
mod pricing;
mod queries;

pub use error::EngineError;
pub use pricing::total_price;

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSpaceState = Arc<RwLock<SpaceState>>;
pub type SharedUserState = Arc<RwLock<UserState>>;

/// Cancellation is allowed for three days after booking unless configured otherwise.
pub const DEFAULT_GRACE_WINDOW_MS: Ms = 3 * 24 * 3_600_000;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued, then
/// does a single fsync for the whole batch before answering every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Non-append commands run after the batch is durable.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes never leak into
    // the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

pub struct Engine {
    pub spaces: DashMap<Ulid, SharedSpaceState>,
    pub users: DashMap<Ulid, SharedUserState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: reservation id → space id.
    pub(super) reservation_to_space: DashMap<Ulid, Ulid>,
    /// Space title → space id. Titles are unique per tenant.
    pub(super) titles: DashMap<String, Ulid>,
    /// Lowercased user email → user id.
    pub(super) emails: DashMap<String, Ulid>,
    /// Mutations hold it shared from WAL append to apply; compaction holds it
    /// exclusively so its snapshot never misses an appended event.
    pub(super) compaction_gate: RwLock<()>,
    grace_window: Ms,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, grace_window: Ms) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            spaces: DashMap::new(),
            users: DashMap::new(),
            wal_tx,
            notify,
            reservation_to_space: DashMap::new(),
            titles: DashMap::new(),
            emails: DashMap::new(),
            compaction_gate: RwLock::new(()),
            grace_window,
        };

        // We own every lock during replay, so try_write always succeeds. Never
        // block here: this may run inside an async context (lazy tenant creation).
        for event in &events {
            engine.replay_event(event)?;
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events: {} spaces, {} users, {} reservations",
                events.len(),
                engine.spaces.len(),
                engine.users.len(),
                engine.reservation_to_space.len()
            );
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) -> io::Result<()> {
        let contended = || io::Error::other("replay: lock contended");
        match event {
            Event::SpaceCreated { id, listing } => {
                self.titles.insert(listing.title.clone(), *id);
                let space = SpaceState::new(*id, listing.clone());
                self.spaces.insert(*id, Arc::new(RwLock::new(space)));
            }
            Event::SpaceDeleted { id } => {
                if let Some((_, rs)) = self.spaces.remove(id) {
                    let mut space = rs.try_write_owned().map_err(|_| contended())?;
                    let mut users = Vec::new();
                    for uid in affected_users(&space) {
                        if let Some(user) = self.get_user(&uid) {
                            users.push(user.try_write_owned().map_err(|_| contended())?);
                        }
                    }
                    self.apply_space_deleted(&mut space, &mut users);
                }
            }
            Event::UserCreated { id, profile } => {
                self.emails.insert(profile.email.to_lowercase(), *id);
                let user = UserState::new(*id, profile.clone());
                self.users.insert(*id, Arc::new(RwLock::new(user)));
            }
            Event::UserUpdated { id, profile } => {
                if let Some(user) = self.get_user(id) {
                    let mut guard = user.try_write().map_err(|_| contended())?;
                    self.emails.insert(profile.email.to_lowercase(), *id);
                    self.apply_user_updated(&mut guard, profile);
                }
            }
            Event::UserDeleted { id } => {
                if let Some((_, user)) = self.users.remove(id) {
                    let mut guard = user.try_write().map_err(|_| contended())?;
                    self.emails.remove(&guard.profile.email.to_lowercase());
                    guard.deleted = true;
                }
            }
            other => {
                let Some(space_id) = event_space_id(other) else {
                    return Ok(());
                };
                let Some(rs) = self.get_space(&space_id) else {
                    return Ok(());
                };
                let mut space = rs.try_write().map_err(|_| contended())?;
                let user = event_user_id(other).and_then(|uid| self.get_user(&uid));
                let mut user_guard = match &user {
                    Some(u) => Some(u.try_write().map_err(|_| contended())?),
                    None => None,
                };
                self.apply_to_space(&mut space, user_guard.as_deref_mut(), other);
            }
        }
        Ok(())
    }

    /// The single place that mutates a space's reservation list, its counters
    /// and the user back-references. Caller holds the space lock and, when the
    /// user still exists, the user lock.
    pub(super) fn apply_to_space(&self, space: &mut SpaceState, user: Option<&mut UserState>, event: &Event) {
        match event {
            Event::ReservationBooked { reservation } => {
                space.times_booked += 1;
                // Bookings that would overflow are rejected before the append.
                space.economic_performance =
                    space.economic_performance.saturating_add(reservation.total_price);
                space.reservation_refs.push(reservation.id);
                space.insert_reservation(reservation.clone());
                if let Some(user) = user {
                    user.reservations.push(reservation.id);
                }
                self.reservation_to_space.insert(reservation.id, space.id);
            }
            Event::ReservationCancelled { id, .. } => {
                if let Some(removed) = space.remove_reservation(*id) {
                    space.times_booked = space.times_booked.saturating_sub(1);
                    space.economic_performance =
                        space.economic_performance.saturating_sub(removed.total_price);
                }
                space.reservation_refs.retain(|r| r != id);
                if let Some(user) = user {
                    user.reservations.retain(|r| r != id);
                }
                self.reservation_to_space.remove(id);
            }
            Event::SpaceUpdated { listing, .. } => {
                if listing.title != space.listing.title {
                    self.titles.remove_if(&space.listing.title, |_, owner| *owner == space.id);
                    self.titles.insert(listing.title.clone(), space.id);
                }
                space.listing = listing.clone();
            }
            Event::SpaceCreated { .. }
            | Event::SpaceDeleted { .. }
            | Event::UserCreated { .. }
            | Event::UserUpdated { .. }
            | Event::UserDeleted { .. } => {}
        }
    }

    /// Swap in a new profile. The new email key must already point at the
    /// user; the old key is released here.
    pub(super) fn apply_user_updated(&self, user: &mut UserState, profile: &UserProfile) {
        let old_key = user.profile.email.to_lowercase();
        if old_key != profile.email.to_lowercase() {
            self.emails.remove_if(&old_key, |_, owner| *owner == user.id);
        }
        user.profile = profile.clone();
    }

    /// Cascade of a space deletion: drop its reservations from every user and
    /// from the index. Caller holds the space lock and the locks of every user
    /// in `affected_users`.
    pub(super) fn apply_space_deleted(
        &self,
        space: &mut SpaceState,
        users: &mut [OwnedRwLockWriteGuard<UserState>],
    ) {
        let ids: HashSet<Ulid> = space.reservations.iter().map(|r| r.id).collect();
        for user in users.iter_mut() {
            user.reservations.retain(|r| !ids.contains(r));
        }
        for id in &ids {
            self.reservation_to_space.remove(id);
        }
        self.titles.remove_if(&space.listing.title, |_, owner| *owner == space.id);
        space.reservations.clear();
        space.reservation_refs.clear();
        space.times_booked = 0;
        space.economic_performance = 0;
        space.deleted = true;
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify for events scoped to one space.
    pub(super) async fn persist_and_apply(
        &self,
        space: &mut SpaceState,
        user: Option<&mut UserState>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_to_space(space, user, event);
        self.notify.send(space.id, event);
        Ok(())
    }

    pub fn get_space(&self, id: &Ulid) -> Option<SharedSpaceState> {
        self.spaces.get(id).map(|e| e.value().clone())
    }

    pub fn get_user(&self, id: &Ulid) -> Option<SharedUserState> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn space_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_space.get(reservation_id).map(|e| *e.value())
    }

    pub fn grace_window(&self) -> Ms {
        self.grace_window
    }

    /// Lookup reservation → space, acquire the space write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SpaceState>, EngineError> {
        let space_id = self
            .space_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let rs = self
            .get_space(&space_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let guard = rs.write_owned().await;
        if guard.deleted {
            return Err(EngineError::NotFound(*reservation_id));
        }
        Ok(guard)
    }
}

/// Users holding reservations on `space`, sorted so locks are always taken in
/// the same order.
pub(super) fn affected_users(space: &SpaceState) -> Vec<Ulid> {
    let mut ids: Vec<Ulid> = space.reservations.iter().map(|r| r.user_id).collect();
    ids.sort();
    ids.dedup();
    ids
}

fn event_space_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationBooked { reservation } => Some(reservation.space_id),
        Event::ReservationCancelled { space_id, .. } => Some(*space_id),
        Event::SpaceUpdated { id, .. } => Some(*id),
        Event::SpaceCreated { .. }
        | Event::SpaceDeleted { .. }
        | Event::UserCreated { .. }
        | Event::UserUpdated { .. }
        | Event::UserDeleted { .. } => None,
    }
}

fn event_user_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationBooked { reservation } => Some(reservation.user_id),
        Event::ReservationCancelled { user_id, .. } => Some(*user_id),
        _ => None,
    }
}
