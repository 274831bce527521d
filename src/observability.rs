use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "hallkeep_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "hallkeep_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "hallkeep_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "hallkeep_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "hallkeep_connections_rejected_total";

/// Gauge: number of halls with a loaded engine.
pub const HALLS_ACTIVE: &str = "hallkeep_halls_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "hallkeep_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "hallkeep_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "hallkeep_wal_compactions_total";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: resident assignments refused because the room was full.
pub const CAPACITY_REJECTIONS_TOTAL: &str = "hallkeep_capacity_rejections_total";

/// Counter: pass requests or edits refused for overlapping dates.
pub const PASS_CONFLICTS_TOTAL: &str = "hallkeep_pass_conflicts_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertAccount(_) => "insert_account",
        Command::UpdateAccountStatus { .. } => "update_account_status",
        Command::UpdateAccount { .. } => "update_account",
        Command::DeleteAccount { .. } => "delete_account",
        Command::SelectAccounts { .. } => "select_accounts",
        Command::InsertRoom(_) => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::SelectRooms(_) => "select_rooms",
        Command::AssignResident { .. } => "assign_resident",
        Command::RemoveResident { .. } => "remove_resident",
        Command::ResetRoom { .. } => "reset_room",
        Command::InsertPass(_) => "insert_pass",
        Command::EditPass { .. } => "edit_pass",
        Command::ResolvePass { .. } => "resolve_pass",
        Command::DeletePass { .. } => "delete_pass",
        Command::SelectPasses(_) => "select_passes",
        Command::InsertBlacklist { .. } => "insert_blacklist",
        Command::DeleteBlacklist { .. } => "delete_blacklist",
        Command::SelectBlacklist => "select_blacklist",
        Command::InsertTicket(_) => "insert_ticket",
        Command::AssignTicket { .. } => "assign_ticket",
        Command::ResolveTicket { .. } => "resolve_ticket",
        Command::DeleteTicket { .. } => "delete_ticket",
        Command::SelectTickets(_) => "select_tickets",
        Command::InsertAttachment(_) => "insert_attachment",
        Command::DeleteAttachment { .. } => "delete_attachment",
        Command::SelectAttachments { .. } => "select_attachments",
        Command::SelectAttachmentData { .. } => "select_attachment_data",
        Command::SelectReport(_) => "select_report",
    }
}
