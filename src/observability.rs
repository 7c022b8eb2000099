use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "flexdesk_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "flexdesk_query_duration_seconds";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: reservations committed.
pub const BOOKINGS_TOTAL: &str = "flexdesk_bookings_total";

/// Counter: bookings rejected because the window was already reserved.
pub const BOOKING_CONFLICTS_TOTAL: &str = "flexdesk_booking_conflicts_total";

/// Counter: reservations cancelled.
pub const CANCELLATIONS_TOTAL: &str = "flexdesk_cancellations_total";

/// Counter: cancellations refused after the deadline.
pub const CANCELLATIONS_REJECTED_TOTAL: &str = "flexdesk_cancellations_rejected_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "flexdesk_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "flexdesk_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "flexdesk_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "flexdesk_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "flexdesk_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "flexdesk_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSpace { .. } => "insert_space",
        Command::UpdateSpace { .. } => "update_space",
        Command::DeleteSpace { .. } => "delete_space",
        Command::InsertUser { .. } => "insert_user",
        Command::UpdateUser { .. } => "update_user",
        Command::DeleteUser { .. } => "delete_user",
        Command::InsertReservation(_) => "insert_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectSpaces { .. } => "select_spaces",
        Command::SelectSpaceLocations => "select_space_locations",
        Command::SelectUsers { .. } => "select_users",
        Command::SelectReservations(_) => "select_reservations",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectReport => "select_report",
        Command::SelectRankings { .. } => "select_rankings",
    }
}
