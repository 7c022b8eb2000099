use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::{Event, Reservation};

const CHANNEL_CAPACITY: usize = 256;
const FIREHOSE_CAPACITY: usize = 4096;

/// Broadcast hub for committed events, per space plus one stream of everything.
/// Sending never blocks and never fails the caller.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    firehose: broadcast::Sender<Event>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            firehose: broadcast::channel(FIREHOSE_CAPACITY).0,
        }
    }

    /// Events of one space. Creates the channel if needed.
    pub fn subscribe(&self, space_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(space_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Events of every space.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.firehose.subscribe()
    }

    pub fn send(&self, space_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&space_id) {
            let _ = sender.send(event.clone());
        }
        let _ = self.firehose.send(event.clone());
    }

    /// Drop a space's channel once the space is gone.
    pub fn remove(&self, space_id: &Ulid) {
        self.channels.remove(space_id);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

pub type NotifyResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Delivers booking confirmations to the outside world (mail, chat, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn reservation_confirmed(&self, reservation: &Reservation) -> NotifyResult;
}

/// Writes each confirmation as a structured log line.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn reservation_confirmed(&self, reservation: &Reservation) -> NotifyResult {
        let body = serde_json::to_string(reservation)?;
        info!(
            target: "flexdesk::confirmations",
            reservation = %body,
            "reservation {} confirmed for user {}",
            reservation.id,
            reservation.user_id
        );
        Ok(())
    }
}

/// Feed every committed booking to `notifier` until the hub goes away.
/// Failures are logged; the booking itself already stands.
pub async fn run_confirmations(mut rx: broadcast::Receiver<Event>, notifier: Arc<dyn Notifier>) {
    loop {
        match rx.recv().await {
            Ok(Event::ReservationBooked { reservation }) => {
                if let Err(e) = notifier.reservation_confirmed(&reservation).await {
                    warn!("confirmation for reservation {} failed: {e}", reservation.id);
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("confirmation feed lagged, {skipped} events skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
