use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict;
use super::{Engine, EngineError, SharedSpaceState, SharedUserState};

impl Engine {
    /// Snapshot of the space Arcs. Never await while a DashMap ref is alive.
    fn space_handles(&self) -> Vec<SharedSpaceState> {
        self.spaces.iter().map(|e| e.value().clone()).collect()
    }

    fn user_handles(&self) -> Vec<SharedUserState> {
        self.users.iter().map(|e| e.value().clone()).collect()
    }

    /// Live spaces, sorted by id.
    async fn all_spaces(&self) -> Vec<SpaceInfo> {
        let mut out = Vec::new();
        for rs in self.space_handles() {
            let guard = rs.read().await;
            if !guard.deleted {
                out.push(SpaceInfo::from(&*guard));
            }
        }
        out.sort_by_key(|s| s.id);
        out
    }

    pub async fn get_space_info(&self, id: Ulid) -> Result<SpaceInfo, EngineError> {
        let rs = self.get_space(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }
        Ok(SpaceInfo::from(&*guard))
    }

    /// 1-based pagination. `None` falls back to page 1 and the default page
    /// size; a page past the end comes back empty with the real totals.
    pub async fn list_spaces(
        &self,
        page: Option<usize>,
        per_page: Option<usize>,
    ) -> Result<SpacePage, EngineError> {
        let page = page.unwrap_or(1);
        let per_page = per_page.unwrap_or(DEFAULT_PAGE_SIZE);
        if page == 0 {
            return Err(EngineError::Validation("page starts at 1".into()));
        }
        if per_page == 0 || per_page > MAX_PAGE_SIZE {
            return Err(EngineError::Validation(format!(
                "per_page must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        let all = self.all_spaces().await;
        let total = all.len();
        let total_pages = total.div_ceil(per_page);
        let items = all
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .collect();
        Ok(SpacePage {
            items,
            total,
            page,
            total_pages,
        })
    }

    pub async fn list_space_locations(&self) -> Vec<SpaceLocation> {
        self.all_spaces()
            .await
            .into_iter()
            .map(|s| SpaceLocation {
                id: s.id,
                title: s.listing.title,
                description: s.listing.description,
                location: s.listing.location,
                price_per_day: s.listing.price_per_day,
            })
            .collect()
    }

    pub async fn get_user_info(&self, id: Ulid) -> Result<UserInfo, EngineError> {
        let user = self.get_user(&id).ok_or(EngineError::NotFound(id))?;
        let guard = user.read().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }
        Ok(UserInfo::from(&*guard))
    }

    pub async fn list_users(&self) -> Vec<UserInfo> {
        let mut out = Vec::new();
        for user in self.user_handles() {
            let guard = user.read().await;
            if !guard.deleted {
                out.push(UserInfo::from(&*guard));
            }
        }
        out.sort_by_key(|u| u.id);
        out
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let space_id = self
            .space_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self.get_space(&space_id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Every live reservation, oldest booking first.
    pub async fn list_reservations(&self) -> Vec<Reservation> {
        let mut out = Vec::new();
        for rs in self.space_handles() {
            let guard = rs.read().await;
            out.extend(guard.reservations.iter().cloned());
        }
        out.sort_by_key(|r| (r.created_at, r.id));
        out
    }

    /// Reservations of one space in booking order.
    pub async fn reservations_for_space(&self, space_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let rs = self
            .get_space(&space_id)
            .ok_or(EngineError::NotFound(space_id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::NotFound(space_id));
        }
        Ok(guard
            .reservation_refs
            .iter()
            .filter_map(|id| guard.reservation(id).cloned())
            .collect())
    }

    /// Follows the user's back-references, in booking order.
    pub async fn reservations_for_user(&self, user_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let refs = self.get_user_info(user_id).await?.reservations;
        let mut out = Vec::with_capacity(refs.len());
        for id in refs {
            // A reference can vanish between the two reads if a cancel races us.
            if let Ok(r) = self.get_reservation(id).await {
                out.push(r);
            }
        }
        Ok(out)
    }

    /// Reservations on `space_id` that `window` would clash with. Read-only;
    /// the answer can be stale by the time the caller acts on it.
    pub async fn find_conflicts(&self, space_id: Ulid, window: &Window) -> Result<Vec<Reservation>, EngineError> {
        conflict::validate_window(window, None)?;
        let rs = self
            .get_space(&space_id)
            .ok_or(EngineError::NotFound(space_id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::NotFound(space_id));
        }
        Ok(conflict::find_conflicts(&guard, window)
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn rankings(&self, metric: RankingMetric) -> Vec<RankedSpace> {
        let mut ranked: Vec<RankedSpace> = self
            .all_spaces()
            .await
            .into_iter()
            .map(|s| RankedSpace {
                id: s.id,
                title: s.listing.title,
                times_booked: s.times_booked,
                economic_performance: s.economic_performance,
            })
            .collect();
        rank(&mut ranked, metric);
        ranked.truncate(REPORT_RANKING_LEN);
        ranked
    }

    /// Economic performance across the tenant. Spaces are read one at a time,
    /// so totals are not a point-in-time snapshot under concurrent bookings.
    pub async fn report(&self) -> Report {
        let spaces = self.all_spaces().await;
        let total_revenue = spaces
            .iter()
            .fold(0u64, |acc, s| acc.saturating_add(s.economic_performance));
        let total_reservations = spaces.iter().map(|s| s.reservations.len()).sum();

        let ranked: Vec<RankedSpace> = spaces
            .iter()
            .map(|s| RankedSpace {
                id: s.id,
                title: s.listing.title.clone(),
                times_booked: s.times_booked,
                economic_performance: s.economic_performance,
            })
            .collect();
        let top = |metric| {
            let mut list = ranked.clone();
            rank(&mut list, metric);
            list.truncate(REPORT_RANKING_LEN);
            list
        };

        Report {
            total_revenue,
            total_spaces: spaces.len(),
            total_reservations,
            best_revenue: top(RankingMetric::BestRevenue),
            worst_revenue: top(RankingMetric::WorstRevenue),
            most_booked: top(RankingMetric::MostBooked),
        }
    }
}

/// Ties break on id so rankings are stable between calls.
fn rank(list: &mut [RankedSpace], metric: RankingMetric) {
    match metric {
        RankingMetric::BestRevenue => list.sort_by(|a, b| {
            b.economic_performance
                .cmp(&a.economic_performance)
                .then(a.id.cmp(&b.id))
        }),
        RankingMetric::WorstRevenue => list.sort_by(|a, b| {
            a.economic_performance
                .cmp(&b.economic_performance)
                .then(a.id.cmp(&b.id))
        }),
        RankingMetric::MostBooked => list.sort_by(|a, b| {
            b.times_booked
                .cmp(&a.times_booked)
                .then(a.id.cmp(&b.id))
        }),
    }
}
